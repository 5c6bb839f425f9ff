//! A judge core: runs untrusted submissions inside `isolate` boxes (optionally
//! nested in per-slot containers) behind a bounded, priority-aware worker
//! pool.

pub mod client;
pub mod config;
pub mod health;
pub mod metrics;
pub mod prelude;
pub mod runner;
pub mod slot;
pub mod tester;
pub mod util;

#[cfg(test)]
mod test;
