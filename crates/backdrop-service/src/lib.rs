//! Asynchronous job execution and caching for an interactive foreground process.
//!
//! The foreground (typically a redraw loop) requests expensive or I/O-bound computations
//! through the [`ExecutionSystem`](system::ExecutionSystem) and polls the returned handles on
//! its own schedule, without ever blocking on the background machinery.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod jobs;
pub mod logging;
pub mod mutable;
pub mod system;
pub mod utils;
