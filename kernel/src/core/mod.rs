//! Pure notebook logic: no filesystem, clock, or process access.

pub mod cache;
pub mod digest;
pub mod invariants;
pub mod reload_order;
pub mod report;
pub mod selector;
pub mod types;
