//! A cache of values that are sourced from outside the process and change over time.
//!
//! Unlike the [`MemoryCache`](crate::caching::MemoryCache), whose values are immutable once
//! computed, a [`MutableCache`] holds the most recent value of an entity. Values arrive through
//! updates, which background jobs queue with [`MutableCache::apply_update`] and the foreground
//! applies on its own schedule with [`MutableCache::drain_updates`].
//!
//! An entity value is either fetched once by a dispatched job, or kept current by a watch: a
//! long-lived job that pushes every change. A watch is shared by all of its observers and torn
//! down when the last one leaves.
//!
//! A process-wide version counter advances with every applied update and every refresh. A watch
//! remembers the version at which it was started and is only considered active while the version
//! has not moved on, so a global refresh invalidates all watches at once. Updates are stamped
//! with the version at which they were queued, and an update queued before the last refresh of
//! its entity is discarded instead of restoring the value the refresh cleared.
//!
//! Records are never evicted, refreshing an entity only clears its value.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::jobs::{Controller, JobQueue, JobState};

/// The identity of an externally sourced entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(Arc<str>);

impl EntityId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EntityId {
    fn from(id: &str) -> Self {
        Self(id.into())
    }
}

impl From<String> for EntityId {
    fn from(id: String) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where an update comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateSource {
    /// The job dispatched by [`MutableCache::get_or_dispatch`].
    ///
    /// Applying such an update marks the entity as no longer having a pending job.
    Dispatch,
    /// A watch job.
    Watch,
}

struct Update<T> {
    id: EntityId,
    value: T,
    source: UpdateSource,
    /// The version at the time the update was queued.
    version: u64,
}

struct MutableRecord<T> {
    value: Option<Arc<T>>,
    has_pending_job: bool,
    /// The job fetching the value, empty if none was dispatched.
    dispatch_job: Controller,
    watch_count: usize,
    /// Empty while the job is being created.
    watch_job: Option<Controller>,
    /// The version at which the watch was started.
    watch_version: u64,
    /// The version set by the last refresh of this entity.
    refreshed_at: u64,
}

impl<T> Default for MutableRecord<T> {
    fn default() -> Self {
        Self {
            value: None,
            has_pending_job: false,
            dispatch_job: Controller::default(),
            watch_count: 0,
            watch_job: None,
            watch_version: 0,
            refreshed_at: 0,
        }
    }
}

impl<T> MutableRecord<T> {
    /// A dispatched job that failed or was canceled does not count.
    fn has_pending_job(&self) -> bool {
        let failed = matches!(
            self.dispatch_job.state(),
            Some(JobState::Failed | JobState::Canceled)
        );
        self.has_pending_job && !failed
    }

    fn is_watch_active(&self, version: u64) -> bool {
        self.watch_count > 0 && self.watch_version == version
    }

    fn clear_value(&mut self, has_pending_job: bool, version: u64) -> Controller {
        self.value = None;
        self.refreshed_at = version;
        self.has_pending_job = has_pending_job;
        std::mem::take(&mut self.dispatch_job)
    }
}

struct Shared<T> {
    records: Mutex<FxHashMap<EntityId, MutableRecord<T>>>,
    updates: Mutex<Vec<Update<T>>>,
    version: AtomicU64,
    /// The version set by the last [`MutableCache::refresh_all`], only written with `records`
    /// locked.
    refreshed_all_at: AtomicU64,
    /// Queues whose waiting jobs are woken up when updates are applied.
    queues: Vec<Arc<JobQueue>>,
}

/// The cache of mutable entities, see the [module documentation](self).
pub struct MutableCache<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for MutableCache<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send + Sync + 'static> MutableCache<T> {
    pub fn new(queues: Vec<Arc<JobQueue>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                records: Mutex::new(FxHashMap::default()),
                updates: Mutex::new(Vec::new()),
                version: AtomicU64::new(0),
                refreshed_all_at: AtomicU64::new(0),
                queues,
            }),
        }
    }

    /// The current value of the process-wide version counter.
    pub fn version(&self) -> u64 {
        self.shared.version.load(Ordering::Acquire)
    }

    fn bump_version(&self) -> u64 {
        self.shared.version.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Returns the current value of the entity.
    ///
    /// If there is no value, no job is pending for it and no active watch delivers it, `dispatch`
    /// is called to start a job that fetches it. That job is expected to deliver its result with
    /// [`UpdateSource::Dispatch`].
    pub fn get_or_dispatch<F>(&self, id: &EntityId, dispatch: F) -> Option<Arc<T>>
    where
        F: FnOnce() -> Controller,
    {
        {
            let version = self.version();
            let mut records = self.shared.records.lock().unwrap();
            let record = records.entry(id.clone()).or_default();
            if record.value.is_some() {
                return record.value.clone();
            }
            if record.has_pending_job() || record.is_watch_active(version) {
                return None;
            }
            record.has_pending_job = true;
            record.dispatch_job = Controller::default();
        }

        tracing::trace!(entity = %id, "Dispatching job for entity");
        metric!(counter("caches.mutable.dispatch") += 1);
        let controller = dispatch();

        let mut records = self.shared.records.lock().unwrap();
        match records.get_mut(id) {
            // a refresh in the meantime dropped interest in this job
            Some(record) if record.has_pending_job && record.dispatch_job.is_empty() => {
                record.dispatch_job = controller;
            }
            _ => {
                drop(records);
                drop(controller);
            }
        }
        None
    }

    /// The current value of the entity, without dispatching anything.
    pub fn value(&self, id: &EntityId) -> Option<Arc<T>> {
        let records = self.shared.records.lock().unwrap();
        records.get(id).and_then(|record| record.value.clone())
    }

    /// Queues a new value for the entity.
    ///
    /// This is called from background jobs. The value becomes visible once the foreground calls
    /// [`drain_updates`](Self::drain_updates).
    pub fn apply_update(&self, id: EntityId, value: T, source: UpdateSource) {
        tracing::trace!(entity = %id, ?source, "Queueing entity update");
        let version = self.version();
        let mut updates = self.shared.updates.lock().unwrap();
        updates.push(Update {
            id,
            value,
            source,
            version,
        });
    }

    /// Applies all queued updates in the order they were queued.
    ///
    /// Updates queued before the entity was last refreshed are discarded. Every applied update
    /// advances the version counter, and all waiting jobs are woken up.
    /// Returns the number of applied updates.
    pub fn drain_updates(&self) -> usize {
        let updates = std::mem::take(&mut *self.shared.updates.lock().unwrap());
        if updates.is_empty() {
            return 0;
        }

        let mut count = 0;
        let mut stale = Vec::new();
        let mut finished_jobs = Vec::new();
        {
            let mut records = self.shared.records.lock().unwrap();
            let refreshed_all_at = self.shared.refreshed_all_at.load(Ordering::Acquire);
            for update in updates {
                let record = records.entry(update.id.clone()).or_default();
                if update.version < record.refreshed_at.max(refreshed_all_at) {
                    tracing::trace!(
                        entity = %update.id,
                        "Discarding update queued before refresh"
                    );
                    stale.push(update);
                    continue;
                }

                let Update { value, source, .. } = update;
                count += 1;
                record.value = Some(Arc::new(value));
                if source == UpdateSource::Dispatch {
                    record.has_pending_job = false;
                    finished_jobs.push(std::mem::take(&mut record.dispatch_job));
                }
                self.bump_version();
            }
        }
        // the jobs delivered their result and are about to finish on their own
        for controller in finished_jobs {
            controller.detach();
        }
        drop(stale);
        if count == 0 {
            return 0;
        }

        tracing::trace!(updates = count, "Applied entity updates");
        metric!(counter("caches.mutable.updates") += count as i64);
        for queue in &self.shared.queues {
            queue.wake_up_waiting_jobs();
        }
        count
    }

    /// Clears the value of the entity, forcing it to be fetched again.
    ///
    /// A dispatched job that is still running is canceled. With `no_job_needed`, the entity is
    /// marked as having a pending job, for when the caller already arranged for an update to be
    /// delivered; otherwise the next [`get_or_dispatch`](Self::get_or_dispatch) dispatches a
    /// new job.
    pub fn refresh(&self, id: &EntityId, no_job_needed: bool) {
        let (version, canceled) = {
            let mut records = self.shared.records.lock().unwrap();
            let version = self.bump_version();
            let record = records.entry(id.clone()).or_default();
            (version, record.clear_value(no_job_needed, version))
        };
        drop(canceled);

        tracing::debug!(entity = %id, version, "Refreshed entity");
    }

    /// Clears the values of all entities and invalidates all watches at once.
    pub fn refresh_all(&self) {
        let (version, canceled) = {
            let mut records = self.shared.records.lock().unwrap();
            let version = self.bump_version();
            self.shared
                .refreshed_all_at
                .store(version, Ordering::Release);
            let canceled: Vec<_> = records
                .values_mut()
                .map(|record| record.clear_value(false, version))
                .collect();
            (version, canceled)
        };
        drop(canceled);

        tracing::debug!(version, "Refreshed all entities");
    }

    /// Subscribes to changes of the entity.
    ///
    /// The first watcher starts the watch job via `factory`, later watchers share it. A watch
    /// whose job has ended is restarted by the next watcher.
    ///
    /// Returns `true` if `factory` was called.
    pub fn watch<F>(&self, id: &EntityId, factory: F) -> bool
    where
        F: FnOnce() -> Controller,
    {
        {
            let version = self.version();
            let mut records = self.shared.records.lock().unwrap();
            let record = records.entry(id.clone()).or_default();
            record.watch_count += 1;

            let running = record
                .watch_job
                .as_ref()
                .is_some_and(|job| !job.is_finished());
            if running {
                return false;
            }
            record.watch_job = Some(Controller::default());
            record.watch_version = version;
        }

        tracing::debug!(entity = %id, "Starting watch");
        let controller = factory();

        let mut records = self.shared.records.lock().unwrap();
        match records.get_mut(id) {
            Some(record) if record.watch_count > 0 => {
                record.watch_job = Some(controller);
            }
            // unwatched while the job was being created
            _ => {
                drop(records);
                drop(controller);
            }
        }
        true
    }

    /// Drops one subscription to the entity; the last one cancels the watch job.
    pub fn unwatch(&self, id: &EntityId) {
        let canceled = {
            let mut records = self.shared.records.lock().unwrap();
            let Some(record) = records.get_mut(id).filter(|record| record.watch_count > 0) else {
                tracing::warn!(entity = %id, "Unwatching entity that is not watched");
                return;
            };
            record.watch_count -= 1;
            if record.watch_count > 0 {
                return;
            }
            record.watch_job.take()
        };

        tracing::debug!(entity = %id, "Stopping watch");
        drop(canceled);
    }

    pub fn watch_count(&self, id: &EntityId) -> usize {
        let records = self.shared.records.lock().unwrap();
        records.get(id).map_or(0, |record| record.watch_count)
    }

    /// Whether a watch delivers the entity and has not been invalidated since it started.
    pub fn is_watch_active(&self, id: &EntityId) -> bool {
        let version = self.version();
        let records = self.shared.records.lock().unwrap();
        records
            .get(id)
            .is_some_and(|record| record.is_watch_active(version))
    }

    /// The number of known entities.
    pub fn len(&self) -> usize {
        self.shared.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
