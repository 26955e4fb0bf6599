//! Helpers for testing the execution system.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. When dropped too early, the durable store silently recreates
//!    its directories in a location that is never cleaned up. To avoid this, assign it to a
//!    variable in the test function (e.g. `let cache_dir = test::tempdir()`).
//!
//!  - Background jobs finish on their own schedule. Never sleep for a fixed time to wait for
//!    them, use [`wait_until`] instead.

use std::thread;
use std::time::{Duration, Instant};

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// How long [`wait_until`] waits before failing a test.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `backdrop_service` crate and mutes
///    all other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("backdrop_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped, unless
/// [`keep`](TempDir::keep) is called. Use it as a guard to automatically clean up after tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// Polls `condition` until it holds.
///
/// This mimics a foreground loop that checks on background work once per frame.
///
/// # Panics
///
/// Panics if the condition does not hold within [`DEFAULT_TIMEOUT`].
pub fn wait_until<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    while !condition() {
        if start.elapsed() > DEFAULT_TIMEOUT {
            panic!(
                "timed out after {} waiting for {what}",
                humantime::format_duration(DEFAULT_TIMEOUT)
            );
        }
        thread::sleep(Duration::from_millis(1));
    }
}
