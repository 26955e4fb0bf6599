//! # Caching infrastructure
//!
//! Computed values are cached so that the foreground never has to wait for the same computation
//! twice. This module includes the in-memory cache, the handles callers use to observe it, and the
//! durable on-disk store.
//!
//! ## Cache Layers
//!
//! - The in-memory [`MemoryCache`] maps a [`CacheKey`] to a computed value. It also does request
//!   coalescing: no matter how many callers ask for a key concurrently, only one job computes it.
//! - The [`DurableStore`] persists results to the file system. It is only ever accessed from
//!   jobs of the [`Disk`](crate::jobs::JobCategory::Disk) category, so a job computing a value
//!   would typically first dispatch a disk job to look it up there.
//!
//! A cache request goes through the following steps:
//! - A caller acquires a [`CacheRef`], usually through a [`DataPointer`].
//! - If the record is absent, the caller starts a job to compute it with
//!   [`MemoryCache::ensure_job`]. Concurrent callers for the same key share that job.
//! - The job stores its result with [`MemoryCache::set_data`], which also wakes up all jobs that
//!   were waiting for inputs.
//! - The caller polls its handle on its own schedule and picks up the value once it is ready.
//!
//! ## Eviction
//!
//! A record is kept alive as long as any [`CacheRef`] to it exists. Once the last reference is
//! dropped, the record is appended to the eviction list, but not removed. Eviction only happens
//! when [`MemoryCache::evict_to_limit`] is called, which removes unreferenced records in the order
//! they were released until their total weight fits the limit. Records are weighed by
//! [`CacheItem::weight`].
//!
//! ### Metrics
//!
//! Every metric is tagged with a `cache` field naming the cache:
//!
//! - `caches.memory.acquire`: All accesses.
//! - `caches.memory.hit`: Accesses that found a ready value.
//! - `caches.memory.computation`: Jobs started to compute a value.
//! - `caches.memory.evicted`: Evicted records.
//! - `caches.memory.bytes`: The total weight of unreferenced records after eviction.
//!
//! The durable store reports `caches.durable.hit`, `caches.durable.miss`,
//! `caches.durable.write` and `caches.durable.evicted`.
//!
//! ### Configuration
//!
//! The eviction limit is [`MemoryCacheConfig::max_megabytes`](crate::config::MemoryCacheConfig).
//! The durable store is gated by [`Config::cache_dir`](crate::config::Config::cache_dir); without
//! it, nothing is persisted.

mod cache_key;
mod durable;
mod memory;
mod pointer;

pub use cache_key::{CacheKey, CacheKeyBuilder};
pub use durable::{CleanupStats, DurableStore, FilesystemStore, PendingInsert, StoredEntry};
pub use memory::{CacheItem, CacheRef, CacheState, MemoryCache};
pub use pointer::{DataPointer, DataStatus};
