use std::sync::Arc;

use super::{CacheItem, CacheKey, CacheRef, CacheState, MemoryCache};
use crate::jobs::{Controller, JobState};

/// What a [`DataPointer`] observed on its last [`update`](DataPointer::update).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DataStatus {
    /// The pointer does not track any key.
    Unset,
    /// Nothing is known about the value yet.
    Absent,
    /// A job is computing the value.
    Computing { progress: f32 },
    /// The job computing the value ended without delivering it.
    Failed,
    Ready,
}

/// A polling handle on one value of a [`MemoryCache`].
///
/// This is the handle a foreground loop keeps per displayed value: it calls
/// [`update`](Self::update) once per frame and renders whatever was observed. Nothing about a
/// pointer ever blocks beyond the short cache lock.
pub struct DataPointer<T> {
    cache: MemoryCache<T>,
    current: Option<CacheRef<T>>,
    status: DataStatus,
    value: Option<Arc<T>>,
}

impl<T: CacheItem> DataPointer<T> {
    pub fn new(cache: MemoryCache<T>) -> Self {
        Self {
            cache,
            current: None,
            status: DataStatus::Unset,
            value: None,
        }
    }

    /// The key this pointer tracks.
    pub fn key(&self) -> Option<&CacheKey> {
        self.current.as_ref().map(CacheRef::key)
    }

    /// Points this pointer at `key`.
    ///
    /// The previously tracked record is released, unless it is the one for `key` already, in
    /// which case nothing changes.
    pub fn reset(&mut self, key: CacheKey) {
        if self.key() == Some(&key) {
            return;
        }
        let cache_ref = self.cache.acquire(key);
        self.current = Some(cache_ref);
        self.status = DataStatus::Absent;
        self.value = None;
        self.update();
    }

    /// Releases the tracked record.
    pub fn clear(&mut self) {
        self.current = None;
        self.status = DataStatus::Unset;
        self.value = None;
    }

    /// Makes sure the tracked value is being computed, see [`MemoryCache::ensure_job`].
    pub fn ensure_job<F>(&self, factory: F) -> bool
    where
        F: FnOnce() -> Controller,
    {
        match &self.current {
            Some(cache_ref) => self.cache.ensure_job(cache_ref, factory),
            None => false,
        }
    }

    /// Re-reads the status and value of the tracked record.
    pub fn update(&mut self) -> DataStatus {
        let Some(cache_ref) = &self.current else {
            return self.status;
        };

        let observed = cache_ref.observe();
        self.status = match observed.state {
            CacheState::Absent => DataStatus::Absent,
            CacheState::Computing => match observed.job_state {
                Some(JobState::Failed | JobState::Canceled | JobState::Succeeded) => {
                    DataStatus::Failed
                }
                _ => DataStatus::Computing {
                    progress: observed.progress,
                },
            },
            CacheState::Ready => DataStatus::Ready,
        };
        self.value = observed.value;
        self.status
    }

    /// The status observed on the last update.
    pub fn status(&self) -> DataStatus {
        self.status
    }

    /// The value observed on the last update.
    pub fn value(&self) -> Option<&Arc<T>> {
        self.value.as_ref()
    }
}
