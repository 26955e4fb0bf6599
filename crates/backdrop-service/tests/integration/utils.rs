use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use backdrop_service::caching::CacheItem;
use backdrop_service::config::Config;
use backdrop_service::jobs::{CheckIn, JobError};
use backdrop_service::system::ExecutionSystem;

/// Sets up logging and an execution system with the given config.
pub fn setup_system<T: CacheItem, E: Send + Sync + 'static>(
    config: Config,
) -> ExecutionSystem<T, E> {
    backdrop_test::setup();
    ExecutionSystem::new(config).unwrap()
}

/// A latch that jobs block on until the test opens it.
#[derive(Debug, Clone, Default)]
pub struct Gate(Arc<AtomicBool>);

impl Gate {
    pub fn open(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_open(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Blocks until the gate is opened, checking in regularly.
    pub fn wait(&self, check_in: &CheckIn<'_>) -> Result<(), JobError> {
        while !self.is_open() {
            check_in.check()?;
            std::thread::sleep(Duration::from_millis(1));
        }
        Ok(())
    }
}
