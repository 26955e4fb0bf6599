use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use backdrop_service::caching::{CacheKey, DataPointer, DataStatus};
use backdrop_service::jobs::{CheckIn, Controller, JobCategory, JobError, SubmitOptions, job_fn};
use backdrop_service::mutable::{EntityId, UpdateSource};
use backdrop_service::system::ExecutionSystem;

pub type System = ExecutionSystem<Vec<u8>, u64>;

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Workload {
    pub concurrency: usize,
    #[serde(default)]
    pub priority: i32,
    #[serde(flatten)]
    pub payload: Payload,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Payload {
    /// Values of the memory cache, computed by jobs.
    Compute(ComputePayload),
    /// Mutable entities, fetched by dispatched jobs.
    Entity(EntityPayload),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ComputePayload {
    pub category: JobCategory,
    /// How long computing one value takes.
    #[serde(with = "humantime_serde")]
    pub work: Duration,
    /// The size of a computed value, in bytes.
    pub size: usize,
    /// The number of distinct keys requests cycle through.
    pub keys: u64,
    /// Fail every n-th job transiently.
    #[serde(default)]
    pub fail_every: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EntityPayload {
    #[serde(with = "humantime_serde")]
    pub work: Duration,
    /// The number of distinct entities requests cycle through.
    pub entities: u64,
}

/// A request the foreground keeps polling until it is answered.
pub enum Request {
    Compute(DataPointer<Vec<u8>>),
    Entity(EntityId),
}

/// A workload ready to issue requests against a [`System`].
pub struct PreparedWorkload {
    index: usize,
    priority: i32,
    payload: Payload,
    next: AtomicU64,
    attempts: Arc<AtomicU64>,
}

/// The outcome of polling a [`Request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Poll {
    Pending,
    /// The job failed and was started anew.
    Restarted,
    Done,
}

impl PreparedWorkload {
    pub fn new(index: usize, priority: i32, payload: Payload) -> Self {
        Self {
            index,
            priority,
            payload,
            next: AtomicU64::new(0),
            attempts: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Issues the next request of this workload.
    pub fn start(&self, system: &System) -> Request {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        match &self.payload {
            Payload::Compute(payload) => {
                let key = CacheKey::builder()
                    .field("workload", self.index)
                    .field("key", n % payload.keys.max(1))
                    .build();
                let mut pointer = system.data_pointer();
                pointer.reset(key);
                self.ensure_computation(system, payload, &pointer);
                Request::Compute(pointer)
            }
            Payload::Entity(payload) => {
                let id = EntityId::from(format!(
                    "workload-{}/entity-{}",
                    self.index,
                    n % payload.entities.max(1)
                ));
                system
                    .mutable_cache()
                    .get_or_dispatch(&id, || self.dispatch_fetch(system, payload, &id));
                Request::Entity(id)
            }
        }
    }

    /// Checks on a request once per frame.
    pub fn poll(&self, system: &System, request: &mut Request) -> Poll {
        match (request, &self.payload) {
            (Request::Compute(pointer), Payload::Compute(payload)) => match pointer.update() {
                DataStatus::Ready => Poll::Done,
                DataStatus::Failed | DataStatus::Absent => {
                    self.ensure_computation(system, payload, pointer);
                    Poll::Restarted
                }
                DataStatus::Unset | DataStatus::Computing { .. } => Poll::Pending,
            },
            (Request::Entity(id), Payload::Entity(payload)) => {
                let cache = system.mutable_cache();
                let value = cache.get_or_dispatch(id, || self.dispatch_fetch(system, payload, id));
                match value {
                    Some(_) => {
                        // fetch it anew the next time around
                        cache.refresh(id, false);
                        Poll::Done
                    }
                    None => Poll::Pending,
                }
            }
            _ => Poll::Pending,
        }
    }

    fn ensure_computation(
        &self,
        system: &System,
        payload: &ComputePayload,
        pointer: &DataPointer<Vec<u8>>,
    ) {
        let Some(key) = pointer.key().cloned() else {
            return;
        };
        pointer.ensure_job(|| {
            let cache = system.memory_cache().clone();
            let attempts = Arc::clone(&self.attempts);
            let payload = payload.clone();
            let job = job_fn(format!("compute {key}"), move |check_in, progress| {
                work(check_in, payload.work)?;
                let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
                if payload.fail_every.is_some_and(|n| n > 0 && attempt % n == 0) {
                    return Err(JobError::transient("simulated failure"));
                }
                progress.report(1.0);
                cache.set_data(&key, vec![0; payload.size]);
                Ok(())
            })
            .with_size_estimate(payload.size as u64);

            let options = SubmitOptions::default().with_priority(self.priority);
            system.submit(payload.category, job, options)
        });
    }

    fn dispatch_fetch(
        &self,
        system: &System,
        payload: &EntityPayload,
        id: &EntityId,
    ) -> Controller {
        let cache = system.mutable_cache().clone();
        let id = id.clone();
        let duration = payload.work;
        let job = job_fn(format!("fetch {id}"), move |check_in, _| {
            work(check_in, duration)?;
            let value = id.as_str().len() as u64;
            cache.apply_update(id.clone(), value, UpdateSource::Dispatch);
            Ok(())
        });

        let options = SubmitOptions::default().with_priority(self.priority);
        system.submit(JobCategory::NetworkRead, job, options)
    }
}

/// Simulates blocking work, checking in every millisecond.
fn work(check_in: &CheckIn<'_>, duration: Duration) -> Result<(), JobError> {
    let start = Instant::now();
    while start.elapsed() < duration {
        check_in.check()?;
        std::thread::sleep(Duration::from_millis(1).min(duration));
    }
    Ok(())
}
