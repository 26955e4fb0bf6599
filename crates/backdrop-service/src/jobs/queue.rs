use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BinaryHeap};
use std::sync::{Arc, Condvar, Mutex};

use serde::Serialize;

use super::{Job, JobCategory, JobError, JobId, JobInfo, JobRecord, JobState};

/// A job that sits in one of the collections of a [`JobQueue`], or is being executed.
pub(crate) struct QueuedJob {
    pub(crate) record: Arc<JobRecord>,
    pub(crate) job: Box<dyn Job>,
    /// Submission order, used to break ties between equal priorities.
    seq: u64,
    /// The wake-up generation of the queue at the time this job was popped.
    wake_generation: u64,
}

impl QueuedJob {
    fn sort_key(&self) -> (i32, Reverse<u64>) {
        (self.record.priority(), Reverse(self.seq))
    }
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.sort_key() == other.sort_key()
    }
}

impl Eq for QueuedJob {}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

struct FailedEntry {
    job: QueuedJob,
    message: String,
}

/// A transiently failed job, as reported in a [`QueueStatus`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedJob {
    pub id: JobId,
    pub description: String,
    pub message: String,
}

/// A point-in-time view of a [`JobQueue`], excluding hidden jobs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    /// Jobs that are ready or waiting for their inputs.
    pub queued: usize,
    /// Jobs currently held by a worker thread.
    pub running: usize,
    /// Jobs that failed transiently and can be retried.
    pub transient_failures: Vec<FailedJob>,
    /// All visible jobs that are queued, running or failed.
    pub jobs: BTreeMap<JobId, JobInfo>,
}

#[derive(Default)]
struct QueueState {
    ready: BinaryHeap<QueuedJob>,
    waiting: BinaryHeap<QueuedJob>,
    failed: Vec<FailedEntry>,
    executing: BTreeMap<JobId, Arc<JobRecord>>,
    registry: BTreeMap<JobId, JobInfo>,
    /// Workers blocked in [`JobQueue::pop`] that no signal has been sent to yet.
    idle_workers: usize,
    /// Signals sent to idle workers that no worker has consumed yet.
    pending_wakeups: usize,
    next_seq: u64,
    wake_generation: u64,
    shutting_down: bool,
}

impl QueueState {
    fn push_ready(&mut self, mut job: QueuedJob) {
        job.seq = self.next_seq;
        self.next_seq += 1;
        self.ready.push(job);
    }

    /// Claims up to `count` idle workers for newly ready jobs.
    ///
    /// A claimed worker no longer counts as idle, even before it actually woke up, so concurrent
    /// submitters see the real number of workers left to pick up their jobs.
    fn claim_idle_workers(&mut self, count: usize) -> usize {
        let claimed = count.min(self.idle_workers);
        self.idle_workers -= claimed;
        self.pending_wakeups += claimed;
        claimed
    }

    /// Bookkeeping for a worker that returned from waiting on the condvar.
    fn worker_woke_up(&mut self) {
        if self.pending_wakeups > 0 {
            self.pending_wakeups -= 1;
        } else {
            // spurious wake-up, or one that was not claimed
            self.idle_workers -= 1;
        }
    }
}

/// The queue of one job category.
///
/// A job is in exactly one of the `ready`, `waiting` or `failed` collections, or held by a
/// worker thread, at any time. Ready jobs are handed out in descending priority, and in
/// submission order among equal priorities. There is no protection against starvation: a steady
/// stream of high priority jobs keeps lower priority jobs waiting indefinitely.
///
/// Jobs are never dropped while the queue lock is held, as they may own cache handles whose
/// release takes the cache lock.
pub struct JobQueue {
    category: JobCategory,
    state: Mutex<QueueState>,
    condvar: Condvar,
}

impl JobQueue {
    pub fn new(category: JobCategory) -> Self {
        Self {
            category,
            state: Mutex::new(QueueState::default()),
            condvar: Condvar::new(),
        }
    }

    pub fn category(&self) -> JobCategory {
        self.category
    }

    /// Adds a job to the ready collection and signals one idle worker.
    ///
    /// Returns whether an idle worker was claimed for the job, or `None` if the queue is shut
    /// down, in which case the job is canceled right away.
    pub(crate) fn push(&self, record: Arc<JobRecord>, job: Box<dyn Job>) -> Option<bool> {
        let queued = QueuedJob {
            record,
            job,
            seq: 0,
            wake_generation: 0,
        };

        let mut state = self.state.lock().unwrap();
        if state.shutting_down {
            drop(state);
            queued.record.set_state(JobState::Canceled);
            return None;
        }

        if !queued.record.is_hidden() {
            let record = &queued.record;
            state.registry.insert(record.id(), record.info().clone());
        }
        state.push_ready(queued);
        let claimed = state.claim_idle_workers(1) > 0;
        drop(state);

        self.condvar.notify_one();
        Some(claimed)
    }

    /// Blocks until a job is ready and hands it out.
    ///
    /// Returns `None` once the queue is shut down.
    pub(crate) fn pop(&self) -> Option<QueuedJob> {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.shutting_down {
                return None;
            }
            if let Some(mut job) = state.ready.pop() {
                job.wake_generation = state.wake_generation;
                state
                    .executing
                    .insert(job.record.id(), Arc::clone(&job.record));
                return Some(job);
            }
            state.idle_workers += 1;
            state = self.condvar.wait(state).unwrap();
            state.worker_woke_up();
        }
    }

    /// Moves a popped job whose inputs are not ready into the waiting collection.
    ///
    /// If the queue was woken up while the worker evaluated the inputs of this job, the job goes
    /// back into the ready collection instead, as the wake-up may have been meant for it.
    pub(crate) fn park(&self, job: QueuedJob) {
        let mut state = self.state.lock().unwrap();
        state.executing.remove(&job.record.id());

        if state.shutting_down {
            job.record.set_state(JobState::Canceled);
            state.registry.remove(&job.record.id());
            drop(state);
            return;
        }

        if job.wake_generation != state.wake_generation {
            tracing::trace!(job = %job.record.id(), "Re-queueing job woken up during its check");
            state.push_ready(job);
            state.claim_idle_workers(1);
            drop(state);
            self.condvar.notify_one();
        } else {
            tracing::trace!(job = %job.record.id(), "Parking job with missing inputs");
            state.waiting.push(job);
            metric!(
                gauge("jobs.waiting") = state.waiting.len() as u64,
                "category" => self.category.as_ref(),
            );
        }
    }

    /// Routes the outcome of an executed job.
    ///
    /// Transient failures are kept in the failed collection, all other outcomes are final.
    pub(crate) fn finish(&self, job: QueuedJob, outcome: Result<(), JobError>) {
        let id = job.record.id();
        let mut state = self.state.lock().unwrap();
        state.executing.remove(&id);

        let (final_state, outcome_tag) = match outcome {
            Ok(()) => (JobState::Succeeded, "succeeded"),
            Err(JobError::Canceled) => (JobState::Canceled, "canceled"),
            Err(JobError::Permanent(message)) => {
                tracing::warn!(
                    job = %id,
                    description = %job.record.info().description,
                    reason = %message,
                    "Job failed permanently"
                );
                (JobState::Failed, "permanent_failure")
            }
            Err(JobError::Transient(message)) if !state.shutting_down => {
                tracing::debug!(job = %id, reason = %message, "Job failed transiently");
                job.record.set_state(JobState::Failed);
                state.failed.push(FailedEntry { job, message });
                drop(state);

                metric!(
                    counter("jobs.finished") += 1,
                    "category" => self.category.as_ref(),
                    "outcome" => "transient_failure",
                );
                return;
            }
            Err(JobError::Transient(_)) => (JobState::Canceled, "canceled"),
        };

        job.record.set_state(final_state);
        state.registry.remove(&id);
        drop(state);

        metric!(
            counter("jobs.finished") += 1,
            "category" => self.category.as_ref(),
            "outcome" => outcome_tag,
        );
        drop(job);
    }

    /// Moves all waiting jobs back into the ready collection.
    ///
    /// This is called whenever data that jobs may depend on becomes available. Every call
    /// advances the wake-up generation of the queue, so that a job which is being checked
    /// concurrently is not parked with stale information.
    ///
    /// Returns the number of jobs that were woken up.
    pub fn wake_up_waiting_jobs(&self) -> usize {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        state.wake_generation += 1;

        let woken = state.waiting.len();
        for job in std::mem::take(&mut state.waiting).into_vec() {
            state.ready.push(job);
        }
        state.claim_idle_workers(woken);
        drop(guard);

        if woken > 0 {
            tracing::trace!(category = %self.category, woken, "Woke up waiting jobs");
            self.condvar.notify_all();
        }
        woken
    }

    /// Moves a transiently failed job back into the ready collection.
    ///
    /// Returns `false` if there is no such failed job, or if the job was canceled in the meantime.
    pub fn retry(&self, id: JobId) -> bool {
        let mut state = self.state.lock().unwrap();
        let Some(position) = state
            .failed
            .iter()
            .position(|entry| entry.job.record.id() == id)
        else {
            return false;
        };
        let FailedEntry { job, .. } = state.failed.remove(position);

        if job.record.cancel_requested() {
            job.record.set_state(JobState::Canceled);
            state.registry.remove(&id);
            drop(state);
            return false;
        }

        job.record.set_state(JobState::Queued);
        job.record.set_progress(0.0);
        state.push_ready(job);
        state.claim_idle_workers(1);
        drop(state);

        tracing::debug!(job = %id, "Retrying job");
        self.condvar.notify_one();
        true
    }

    /// Whether any worker is blocked waiting for a job and not yet signaled.
    pub(crate) fn has_idle_workers(&self) -> bool {
        self.state.lock().unwrap().idle_workers > 0
    }

    /// Drops waiting and failed jobs whose cancellation was requested.
    ///
    /// Ready jobs need no pruning, workers cancel them as they pop them.
    pub(crate) fn prune_canceled(&self) -> usize {
        let mut pruned = Vec::new();
        {
            let mut guard = self.state.lock().unwrap();
            let state = &mut *guard;

            for job in std::mem::take(&mut state.waiting).into_vec() {
                if job.record.cancel_requested() {
                    pruned.push(job);
                } else {
                    state.waiting.push(job);
                }
            }
            for entry in std::mem::take(&mut state.failed) {
                if entry.job.record.cancel_requested() {
                    pruned.push(entry.job);
                } else {
                    state.failed.push(entry);
                }
            }
            for job in &pruned {
                job.record.set_state(JobState::Canceled);
                state.registry.remove(&job.record.id());
            }
        }
        pruned.len()
    }

    pub fn status(&self) -> QueueStatus {
        let state = self.state.lock().unwrap();
        let visible = |job: &&QueuedJob| !job.record.is_hidden();

        QueueStatus {
            queued: state
                .ready
                .iter()
                .chain(state.waiting.iter())
                .filter(visible)
                .count(),
            running: state
                .executing
                .values()
                .filter(|record| !record.is_hidden())
                .count(),
            transient_failures: state
                .failed
                .iter()
                .filter(|entry| !entry.job.record.is_hidden())
                .map(|entry| FailedJob {
                    id: entry.job.record.id(),
                    description: entry.job.record.info().description.clone(),
                    message: entry.message.clone(),
                })
                .collect(),
            jobs: state.registry.clone(),
        }
    }

    /// Cancels every job of this queue and releases all workers.
    ///
    /// Running jobs are asked to cancel and finish on their own; queued jobs are canceled
    /// without being executed.
    pub(crate) fn shutdown(&self) {
        let drained: Vec<QueuedJob> = {
            let mut guard = self.state.lock().unwrap();
            let state = &mut *guard;
            state.shutting_down = true;

            for record in state.executing.values() {
                record.request_cancel();
            }

            let drained: Vec<_> = state
                .ready
                .drain()
                .chain(state.waiting.drain())
                .chain(state.failed.drain(..).map(|entry| entry.job))
                .collect();
            for job in &drained {
                job.record.request_cancel();
                job.record.set_state(JobState::Canceled);
                state.registry.remove(&job.record.id());
            }
            drained
        };
        self.condvar.notify_all();

        if !drained.is_empty() {
            tracing::debug!(
                category = %self.category,
                canceled = drained.len(),
                "Canceled queued jobs on shutdown"
            );
        }
    }
}
