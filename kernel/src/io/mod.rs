//! Side-effecting operations: filesystem, clock, child processes, module snapshots.

pub mod atomic;
pub mod clock;
pub mod config;
pub mod executor;
pub mod modules;
pub mod process;
pub mod project_store;
pub mod results;
pub mod sync;
