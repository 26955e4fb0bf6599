//! The execution system, the single entry point to jobs and caches.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::caching::{CacheItem, DataPointer, DurableStore, FilesystemStore, MemoryCache};
use crate::config::Config;
use crate::jobs::{Controller, Job, JobCategory, JobId, Pool, QueueStatus, SubmitOptions, job_fn};
use crate::mutable::MutableCache;

/// A point-in-time view of all job queues, excluding hidden jobs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SystemStatus {
    pub categories: BTreeMap<JobCategory, QueueStatus>,
}

impl SystemStatus {
    pub fn queued(&self) -> usize {
        self.categories.values().map(|status| status.queued).sum()
    }

    pub fn running(&self) -> usize {
        self.categories.values().map(|status| status.running).sum()
    }
}

/// What a maintenance [`tick`](ExecutionSystem::tick) did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickSummary {
    /// Entity updates applied to the mutable cache.
    pub updates_applied: usize,
    /// Waiting or failed jobs dropped because they were canceled.
    pub jobs_pruned: usize,
    /// Records evicted from the memory cache.
    pub records_evicted: usize,
    /// The total weight of unreferenced records left in the memory cache.
    pub evictable_bytes: u64,
}

/// Owns one [`Pool`] per [`JobCategory`] and the caches the jobs fill.
///
/// The system is created once at process start and passed around explicitly. Dropping it shuts
/// everything down, see [`shutdown`](Self::shutdown).
///
/// `T` is the type of values in the [`MemoryCache`], `E` the type of entities in the
/// [`MutableCache`].
pub struct ExecutionSystem<T: CacheItem, E: Send + Sync + 'static = T> {
    config: Config,
    pools: Vec<Pool>,
    memory_cache: MemoryCache<T>,
    mutable_cache: MutableCache<E>,
    durable_store: Option<Arc<dyn DurableStore>>,
}

impl<T: CacheItem, E: Send + Sync + 'static> ExecutionSystem<T, E> {
    pub fn new(config: Config) -> Result<Self> {
        let pools: Vec<_> = JobCategory::ALL.into_iter().map(Pool::new).collect();
        let queues: Vec<_> = pools.iter().map(|pool| Arc::clone(pool.queue())).collect();

        let durable_store = FilesystemStore::from_config(&config)
            .context("failed to open durable cache")?
            .map(|store| Arc::new(store) as Arc<dyn DurableStore>);

        tracing::info!(
            max_megabytes = config.memory_cache.max_megabytes,
            durable = durable_store.is_some(),
            "Starting execution system"
        );

        Ok(Self {
            memory_cache: MemoryCache::new("memory", queues.clone()),
            mutable_cache: MutableCache::new(queues),
            durable_store,
            pools,
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pool(&self, category: JobCategory) -> &Pool {
        &self.pools[category.index()]
    }

    pub fn memory_cache(&self) -> &MemoryCache<T> {
        &self.memory_cache
    }

    pub fn mutable_cache(&self) -> &MutableCache<E> {
        &self.mutable_cache
    }

    /// The durable store, if [`Config::cache_dir`] is configured.
    ///
    /// It must only be used from jobs of the [`JobCategory::Disk`] category.
    pub fn durable_store(&self) -> Option<&Arc<dyn DurableStore>> {
        self.durable_store.as_ref()
    }

    /// Creates a handle that tracks values of the memory cache.
    pub fn data_pointer(&self) -> DataPointer<T> {
        DataPointer::new(self.memory_cache.clone())
    }

    pub fn submit(&self, category: JobCategory, job: impl Job, options: SubmitOptions) -> Controller {
        self.pool(category).submit(job, options)
    }

    /// Retries a transiently failed job of the given category.
    pub fn retry(&self, category: JobCategory, id: JobId) -> bool {
        self.pool(category).retry(id)
    }

    pub fn status(&self) -> SystemStatus {
        SystemStatus {
            categories: self
                .pools
                .iter()
                .map(|pool| (pool.category(), pool.status()))
                .collect(),
        }
    }

    /// Moves all waiting jobs of all categories back to their ready queues.
    pub fn wake_up_waiting_jobs(&self) -> usize {
        self.pools
            .iter()
            .map(|pool| pool.queue().wake_up_waiting_jobs())
            .sum()
    }

    /// Runs periodic maintenance.
    ///
    /// This applies pending entity updates, drops canceled jobs that would otherwise linger in
    /// the waiting and failed lists, and evicts the memory cache down to its configured limit.
    /// It is meant to be called regularly from the foreground, for example once per frame.
    pub fn tick(&self) -> TickSummary {
        let updates_applied = self.mutable_cache.drain_updates();
        let jobs_pruned = self
            .pools
            .iter()
            .map(|pool| pool.queue().prune_canceled())
            .sum();
        let records_evicted = self
            .memory_cache
            .evict_to_limit(self.config.memory_cache.max_bytes());

        let summary = TickSummary {
            updates_applied,
            jobs_pruned,
            records_evicted,
            evictable_bytes: self.memory_cache.evictable_bytes(),
        };
        if summary.updates_applied + summary.jobs_pruned + summary.records_evicted > 0 {
            tracing::trace!(?summary, "Ran maintenance");
        }
        summary
    }

    /// Submits a hidden disk job that cleans the durable store down to its configured size.
    ///
    /// Returns `None` without a durable store.
    pub fn cleanup_durable_store(&self) -> Option<Controller> {
        let store = Arc::clone(self.durable_store.as_ref()?);
        let max_bytes = self.config.durable_cache.max_size_bytes();

        let job = job_fn("clean up durable cache", move |check_in, _| {
            check_in.check()?;
            store
                .enforce_size_limit(max_bytes)
                .map_err(crate::jobs::JobError::transient)?;
            Ok(())
        });
        Some(self.submit(JobCategory::Disk, job, SubmitOptions::default().hidden()))
    }

    /// Cancels all jobs, joins all worker threads and clears the memory cache.
    ///
    /// Jobs that are still queued end up canceled without running. Jobs submitted afterwards are
    /// canceled right away.
    pub fn shutdown(&self) {
        tracing::info!("Shutting down execution system");
        for pool in &self.pools {
            pool.shutdown();
        }
        self.memory_cache.clear();
    }
}

impl<T: CacheItem, E: Send + Sync + 'static> Drop for ExecutionSystem<T, E> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
