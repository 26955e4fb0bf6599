use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;
use serde::Serialize;

use super::CacheKey;
use crate::jobs::{Controller, JobQueue, JobState};

/// A value that can be stored in a [`MemoryCache`].
pub trait CacheItem: 'static + Send + Sync {
    /// The "cost" of keeping this item in the cache, in bytes.
    fn weight(&self) -> u64 {
        std::mem::size_of_val(self) as u64
    }
}

macro_rules! impl_sized_item {
    ($($ty:ty),*) => {
        $(impl CacheItem for $ty {})*
    };
}

impl_sized_item!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64, bool, ());

impl CacheItem for String {
    fn weight(&self) -> u64 {
        self.len() as u64
    }
}

impl<T: Send + Sync + 'static> CacheItem for Vec<T> {
    fn weight(&self) -> u64 {
        (self.len() * std::mem::size_of::<T>()) as u64
    }
}

/// The lifecycle state of a cache record.
///
/// A record only ever moves forward, from `Absent` over `Computing` to `Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheState {
    Absent,
    Computing,
    Ready,
}

enum Slot<T> {
    Absent,
    /// The controller is empty for the short time in which the job is being created.
    Computing(Controller),
    Ready(Arc<T>),
}

impl<T> Slot<T> {
    fn state(&self) -> CacheState {
        match self {
            Slot::Absent => CacheState::Absent,
            Slot::Computing(_) => CacheState::Computing,
            Slot::Ready(_) => CacheState::Ready,
        }
    }
}

struct CacheRecord<T> {
    /// Distinguishes this record from earlier and later records for the same key.
    generation: u64,
    ref_count: usize,
    slot: Slot<T>,
    /// The weight of the data, zero unless ready.
    weight: u64,
    /// The position in the eviction list, set iff `ref_count == 0`.
    released_at: Option<u64>,
}

struct CacheInner<T> {
    records: FxHashMap<CacheKey, CacheRecord<T>>,
    /// Unreferenced records, ordered by the time they were released.
    eviction_list: BTreeMap<u64, CacheKey>,
    /// The subset of the eviction list that holds no data.
    empty_released: BTreeSet<u64>,
    /// The total weight of all records in the eviction list.
    total_bytes: u64,
    next_release: u64,
    next_generation: u64,
}

impl<T> CacheInner<T> {
    fn record(&self, key: &CacheKey, generation: u64) -> Option<&CacheRecord<T>> {
        self.records
            .get(key)
            .filter(|record| record.generation == generation)
    }

    fn record_mut(&mut self, key: &CacheKey, generation: u64) -> Option<&mut CacheRecord<T>> {
        self.records
            .get_mut(key)
            .filter(|record| record.generation == generation)
    }
}

struct Shared<T> {
    name: &'static str,
    inner: Mutex<CacheInner<T>>,
    /// Queues whose waiting jobs are woken up when new data arrives.
    queues: Vec<Arc<JobQueue>>,
}

/// An in-memory cache of computed values with reference counting and cooperative eviction.
///
/// Callers [`acquire`](Self::acquire) a [`CacheRef`] for a key, and make sure the value is
/// being computed via [`ensure_job`](Self::ensure_job). The job delivers its result via
/// [`set_data`](Self::set_data).
///
/// Records that are no longer referenced by any [`CacheRef`] are kept around in order of their
/// release, and are only evicted by [`evict_to_limit`](Self::evict_to_limit). A referenced
/// record is never evicted, which means the cache may exceed its limit indefinitely if enough
/// records are in use.
///
/// The cache lock is always taken before any queue lock, never the other way around.
pub struct MemoryCache<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for MemoryCache<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for MemoryCache<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (records, total_bytes) = self
            .shared
            .inner
            .try_lock()
            .map(|inner| (inner.records.len(), inner.total_bytes))
            .unwrap_or_default();
        f.debug_struct("MemoryCache")
            .field("name", &self.shared.name)
            .field("records", &records)
            .field("evictable bytes", &total_bytes)
            .finish()
    }
}

impl<T: CacheItem> MemoryCache<T> {
    /// Creates a cache which wakes up the waiting jobs of the given queues whenever new data is
    /// stored.
    pub fn new(name: &'static str, queues: Vec<Arc<JobQueue>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                name,
                inner: Mutex::new(CacheInner {
                    records: FxHashMap::default(),
                    eviction_list: BTreeMap::new(),
                    empty_released: BTreeSet::new(),
                    total_bytes: 0,
                    next_release: 0,
                    next_generation: 0,
                }),
                queues,
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.shared.name
    }

    /// Returns a reference to the record for `key`, creating an absent record if there is none.
    pub fn acquire(&self, key: CacheKey) -> CacheRef<T> {
        let name = self.shared.name;
        let mut guard = self.shared.inner.lock().unwrap();
        let inner = &mut *guard;

        let next_generation = &mut inner.next_generation;
        let record = inner.records.entry(key.clone()).or_insert_with(|| {
            let generation = *next_generation;
            *next_generation += 1;
            CacheRecord {
                generation,
                ref_count: 0,
                slot: Slot::Absent,
                weight: 0,
                released_at: None,
            }
        });

        record.ref_count += 1;
        if let Some(released_at) = record.released_at.take() {
            inner.eviction_list.remove(&released_at);
            inner.empty_released.remove(&released_at);
            inner.total_bytes -= record.weight;
        }

        let generation = record.generation;
        let hit = matches!(record.slot, Slot::Ready(_));
        drop(guard);

        metric!(counter("caches.memory.acquire") += 1, "cache" => name);
        if hit {
            metric!(counter("caches.memory.hit") += 1, "cache" => name);
        }

        CacheRef {
            shared: Arc::clone(&self.shared),
            key,
            generation,
        }
    }

    /// Makes sure the value of the referenced record is being computed.
    ///
    /// If the record is absent, it is moved to [`CacheState::Computing`] and `factory` is called
    /// to start the job. A record whose job ended without delivering data is computed anew. For
    /// any number of concurrent callers, at most one job per key is running at any time.
    ///
    /// The factory is called without holding the cache lock. If it returns an empty
    /// [`Controller`], the record goes back to being absent.
    ///
    /// Returns `true` if `factory` was called.
    pub fn ensure_job<F>(&self, cache_ref: &CacheRef<T>, factory: F) -> bool
    where
        F: FnOnce() -> Controller,
    {
        let key = &cache_ref.key;
        let generation = cache_ref.generation;

        let previous = {
            let mut inner = self.shared.inner.lock().unwrap();
            let Some(record) = inner.record_mut(key, generation) else {
                return false;
            };
            match &record.slot {
                Slot::Absent => {}
                Slot::Computing(controller) if controller.is_finished() => {
                    tracing::debug!(
                        cache = self.shared.name,
                        %key,
                        job = ?controller.state(),
                        "Restarting computation that ended without data"
                    );
                }
                Slot::Computing(_) | Slot::Ready(_) => return false,
            }
            std::mem::replace(&mut record.slot, Slot::Computing(Controller::default()))
        };
        drop(previous);

        metric!(counter("caches.memory.computation") += 1, "cache" => self.shared.name);
        let controller = factory();

        let mut inner = self.shared.inner.lock().unwrap();
        let Some(record) = inner.record_mut(key, generation) else {
            // cleared while the job was created
            drop(inner);
            drop(controller);
            return true;
        };
        match record.slot {
            Slot::Computing(ref placeholder) if placeholder.is_empty() => {
                record.slot = if controller.is_empty() {
                    Slot::Absent
                } else {
                    Slot::Computing(controller)
                };
            }
            Slot::Ready(_) => {
                // the job delivered its data before we got here
                drop(inner);
                controller.detach();
            }
            Slot::Absent | Slot::Computing(_) => {
                unreachable!("cache record {key} changed while its job was being created")
            }
        }
        true
    }

    /// Stores the value for `key`, if a record for it exists.
    ///
    /// The job computing the record is detached, and all waiting jobs are woken up as they may
    /// depend on the new data. Records that are ready already keep their value.
    ///
    /// Returns whether the value was stored.
    pub fn set_data(&self, key: &CacheKey, value: T) -> bool {
        let value = Arc::new(value);
        let weight = value.weight();

        let previous = {
            let mut guard = self.shared.inner.lock().unwrap();
            let inner = &mut *guard;
            let Some(record) = inner.records.get_mut(key) else {
                tracing::trace!(cache = self.shared.name, %key, "Dropping data for unknown record");
                return false;
            };
            if matches!(record.slot, Slot::Ready(_)) {
                tracing::trace!(cache = self.shared.name, %key, "Record is ready already");
                return false;
            }

            record.weight = weight;
            if let Some(released_at) = record.released_at {
                inner.empty_released.remove(&released_at);
                inner.total_bytes += weight;
            }
            std::mem::replace(&mut record.slot, Slot::Ready(value))
        };
        if let Slot::Computing(controller) = previous {
            controller.detach();
        }

        metric!(histogram("caches.memory.item_size") = weight, "cache" => self.shared.name);
        for queue in &self.shared.queues {
            queue.wake_up_waiting_jobs();
        }
        true
    }

    /// Evicts unreferenced records, oldest released first, until their total weight is at most
    /// `max_bytes`.
    ///
    /// A limit of zero empties the eviction list, including records without data. Otherwise,
    /// unreferenced records without data are evicted regardless of the limit, unless their job is
    /// still running. Jobs of evicted records are canceled.
    ///
    /// Returns the number of evicted records.
    pub fn evict_to_limit(&self, max_bytes: u64) -> usize {
        let mut evicted = Vec::new();
        let remaining_bytes = {
            let mut guard = self.shared.inner.lock().unwrap();
            let inner = &mut *guard;

            while inner.total_bytes > max_bytes || max_bytes == 0 {
                let Some((released_at, key)) = inner.eviction_list.pop_first() else {
                    break;
                };
                inner.empty_released.remove(&released_at);
                let Some(record) = inner.records.remove(&key) else {
                    unreachable!("evictable cache record {key} is missing");
                };
                inner.total_bytes -= record.weight;
                evicted.push(record.slot);
            }

            // records without data weigh nothing and would otherwise accumulate
            let records = &inner.records;
            let eviction_list = &inner.eviction_list;
            let idle: Vec<u64> = inner
                .empty_released
                .iter()
                .copied()
                .filter(|released_at| {
                    let record = eviction_list
                        .get(released_at)
                        .and_then(|key| records.get(key));
                    match record.map(|record| &record.slot) {
                        Some(Slot::Computing(controller)) => controller.is_finished(),
                        _ => true,
                    }
                })
                .collect();
            for released_at in idle {
                inner.empty_released.remove(&released_at);
                if let Some(key) = inner.eviction_list.remove(&released_at)
                    && let Some(record) = inner.records.remove(&key)
                {
                    evicted.push(record.slot);
                }
            }
            inner.total_bytes
        };

        let count = evicted.len();
        // dropping a `Computing` slot cancels its job
        drop(evicted);

        if count > 0 {
            tracing::debug!(
                cache = self.shared.name,
                evicted = count,
                remaining_bytes,
                "Evicted cache records"
            );
            metric!(counter("caches.memory.evicted") += count as i64, "cache" => self.shared.name);
        }
        metric!(gauge("caches.memory.bytes") = remaining_bytes, "cache" => self.shared.name);
        count
    }

    /// Removes all records, canceling their jobs.
    ///
    /// Outstanding [`CacheRef`]s stay valid, but see their record as absent from now on.
    pub fn clear(&self) {
        let records = {
            let mut inner = self.shared.inner.lock().unwrap();
            inner.eviction_list.clear();
            inner.empty_released.clear();
            inner.total_bytes = 0;
            std::mem::take(&mut inner.records)
        };
        tracing::debug!(cache = self.shared.name, records = records.len(), "Cleared cache");
    }

    /// The number of records, referenced or not.
    pub fn len(&self) -> usize {
        self.shared.inner.lock().unwrap().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The total weight of all unreferenced records.
    pub fn evictable_bytes(&self) -> u64 {
        self.shared.inner.lock().unwrap().total_bytes
    }
}

/// A counted reference to a record of a [`MemoryCache`].
///
/// The record is kept from eviction as long as the reference is alive.
pub struct CacheRef<T> {
    shared: Arc<Shared<T>>,
    key: CacheKey,
    generation: u64,
}

/// Everything observable about a record, read at once.
pub(crate) struct Observation<T> {
    pub(crate) state: CacheState,
    pub(crate) progress: f32,
    pub(crate) job_state: Option<JobState>,
    pub(crate) value: Option<Arc<T>>,
}

impl<T> CacheRef<T> {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn state(&self) -> CacheState {
        let inner = self.shared.inner.lock().unwrap();
        inner
            .record(&self.key, self.generation)
            .map_or(CacheState::Absent, |record| record.slot.state())
    }

    pub fn value(&self) -> Option<Arc<T>> {
        self.observe().value
    }

    /// The progress of the computing job, `0.0` if there is none.
    pub fn progress(&self) -> f32 {
        self.observe().progress
    }

    pub(crate) fn observe(&self) -> Observation<T> {
        let inner = self.shared.inner.lock().unwrap();
        let Some(record) = inner.record(&self.key, self.generation) else {
            return Observation {
                state: CacheState::Absent,
                progress: 0.0,
                job_state: None,
                value: None,
            };
        };

        let (progress, job_state, value) = match &record.slot {
            Slot::Absent => (0.0, None, None),
            Slot::Computing(controller) => (controller.progress(), controller.state(), None),
            Slot::Ready(value) => (0.0, None, Some(Arc::clone(value))),
        };
        Observation {
            state: record.slot.state(),
            progress,
            job_state,
            value,
        }
    }
}

impl<T> fmt::Debug for CacheRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheRef")
            .field("cache", &self.shared.name)
            .field("key", &self.key)
            .finish()
    }
}

impl<T> Drop for CacheRef<T> {
    fn drop(&mut self) {
        let mut guard = self.shared.inner.lock().unwrap();
        let inner = &mut *guard;
        let Some(record) = inner
            .records
            .get_mut(&self.key)
            .filter(|record| record.generation == self.generation)
        else {
            return;
        };

        record.ref_count -= 1;
        if record.ref_count == 0 {
            let released_at = inner.next_release;
            inner.next_release += 1;
            record.released_at = Some(released_at);
            inner.eviction_list.insert(released_at, self.key.clone());
            if !matches!(record.slot, Slot::Ready(_)) {
                inner.empty_released.insert(released_at);
            }
            inner.total_bytes += record.weight;
        }
    }
}
