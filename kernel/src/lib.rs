//! Notebook kernel: runs an ordered list of step files against a shared
//! cache and publishes each step's display output for viewers.
//!
//! The crate keeps a strict separation:
//!
//! - **[`core`]**: Pure logic (cache rules, selection, reload ordering,
//!   digests). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (filesystem, child processes,
//!   module snapshots, results directory).
//!
//! Orchestration modules ([`session`], [`runner`], [`execution`],
//! [`status`], [`commands`]) coordinate core logic with I/O to implement the
//! command surface.

pub mod abort;
pub mod capture;
pub mod commands;
pub mod core;
pub mod error;
pub mod execution;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod notebook;
pub mod reloader;
pub mod render;
pub mod response;
pub mod runner;
pub mod session;
pub mod status;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
