use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use super::queue::QueuedJob;
use super::{
    CheckIn, Controller, Job, JobCategory, JobError, JobId, JobQueue, JobRecord,
    ProgressReporter, QueueStatus,
};
use crate::utils::defer::defer;

/// Options for submitting a job to a [`Pool`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SubmitOptions {
    /// Jobs with a higher priority are executed first.
    pub priority: i32,
    /// Hidden jobs are left out of status reporting.
    pub hidden: bool,
    /// Starts an additional worker if no worker is idle when the job is submitted.
    pub ensure_pickup: bool,
}

impl SubmitOptions {
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    pub fn ensure_pickup(mut self) -> Self {
        self.ensure_pickup = true;
        self
    }
}

/// The worker threads serving the queue of one job category.
///
/// A pool starts without any workers and grows on demand: the first submitted job always starts
/// a worker, and a job submitted with [`SubmitOptions::ensure_pickup`] starts another one when
/// all existing workers are busy. Workers are only stopped by [`Pool::shutdown`].
pub struct Pool {
    queue: Arc<JobQueue>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Pool {
    pub fn new(category: JobCategory) -> Self {
        Self {
            queue: Arc::new(JobQueue::new(category)),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn category(&self) -> JobCategory {
        self.queue.category()
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().unwrap().len()
    }

    /// Submits a job and returns the controller bound to it.
    pub fn submit(&self, job: impl Job, options: SubmitOptions) -> Controller {
        self.submit_boxed(Box::new(job), options)
    }

    pub fn submit_boxed(&self, job: Box<dyn Job>, options: SubmitOptions) -> Controller {
        let category = self.category();
        let record = Arc::new(JobRecord::new(options.priority, options.hidden, job.info()));
        let controller = Controller::new(Arc::clone(&record));

        tracing::trace!(
            job = %record.id(),
            %category,
            priority = options.priority,
            description = %record.info().description,
            "Submitting job"
        );
        metric!(counter("jobs.submitted") += 1, "category" => category.as_ref());

        let Some(claimed_worker) = self.queue.push(record, job) else {
            tracing::debug!(%category, "Job submitted after shutdown was canceled");
            return controller;
        };

        if !claimed_worker {
            let mut workers = self.workers.lock().unwrap();
            if workers.is_empty() || options.ensure_pickup {
                self.spawn_worker(&mut workers);
            }
        }
        controller
    }

    /// Retries a transiently failed job.
    pub fn retry(&self, id: JobId) -> bool {
        if !self.queue.retry(id) {
            return false;
        }
        if !self.queue.has_idle_workers() {
            let mut workers = self.workers.lock().unwrap();
            if workers.is_empty() {
                self.spawn_worker(&mut workers);
            }
        }
        true
    }

    pub fn status(&self) -> QueueStatus {
        self.queue.status()
    }

    /// Cancels all jobs and joins all worker threads.
    ///
    /// This blocks until every running job noticed its cancellation or finished.
    pub fn shutdown(&self) {
        self.queue.shutdown();

        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        for worker in workers {
            if worker.join().is_err() {
                tracing::error!(category = %self.category(), "Worker thread panicked");
            }
        }
    }

    fn spawn_worker(&self, workers: &mut Vec<JoinHandle<()>>) {
        let category = self.category();
        let queue = Arc::clone(&self.queue);
        let name = format!("backdrop-{category}-{}", workers.len());

        match thread::Builder::new()
            .name(name)
            .spawn(move || worker_loop(&queue))
        {
            Ok(handle) => {
                workers.push(handle);
                tracing::debug!(%category, workers = workers.len(), "Started worker");
                metric!(counter("jobs.workers.spawned") += 1, "category" => category.as_ref());
            }
            Err(e) => {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    %category,
                    "Failed to start worker thread"
                );
            }
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(queue: &JobQueue) {
    let category = queue.category();
    let _exit = defer(|| tracing::debug!(%category, "Worker stopped"));

    while let Some(mut queued) = queue.pop() {
        if queued.record.cancel_requested() {
            queue.finish(queued, Err(JobError::Canceled));
            continue;
        }
        if !queued.job.inputs_ready() {
            queue.park(queued);
            continue;
        }

        let outcome = execute(&mut queued, category);
        queue.finish(queued, outcome);
    }
}

/// Runs a single job body and classifies its outcome.
///
/// A job that completes after its cancellation was requested counts as canceled. A panicking
/// job body is a bug in the job; it is reported and treated as a permanent failure.
fn execute(queued: &mut QueuedJob, category: JobCategory) -> Result<(), JobError> {
    let record = Arc::clone(&queued.record);
    record.set_state(super::JobState::Running);
    let start = Instant::now();

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        let check_in = CheckIn::new(&record);
        let progress = ProgressReporter::new(&record);
        queued.job.execute(&check_in, &progress)
    }));

    metric!(timer("jobs.duration") = start.elapsed(), "category" => category.as_ref());

    match result {
        Ok(Ok(())) if record.cancel_requested() => Err(JobError::Canceled),
        Ok(outcome) => outcome,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_owned());
            tracing::error!(
                job = %record.id(),
                %category,
                description = %record.info().description,
                panic = %message,
                "Job panicked"
            );
            Err(JobError::Permanent(message))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;
    use crate::jobs::{JobState, job_fn};

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn wait_for(controller: &Controller, state: JobState) {
        let start = Instant::now();
        while controller.state() != Some(state) {
            assert!(start.elapsed() < TIMEOUT, "timed out waiting for {state:?}");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_first_submit_starts_worker() {
        let pool = Pool::new(JobCategory::Calculation);
        assert_eq!(pool.worker_count(), 0);

        let controller = pool.submit(job_fn("noop", |_, _| Ok(())), SubmitOptions::default());
        wait_for(&controller, JobState::Succeeded);
        assert_eq!(pool.worker_count(), 1);
    }

    #[test]
    fn test_ensure_pickup_grows_pool() {
        let pool = Pool::new(JobCategory::NetworkRead);
        let (started_tx, started_rx) = mpsc::channel();
        let release = Arc::new(AtomicBool::new(false));

        let blocking = {
            let release = Arc::clone(&release);
            job_fn("blocking", move |check_in, _| {
                started_tx.send(()).unwrap();
                while !release.load(Ordering::Relaxed) {
                    check_in.check()?;
                    thread::sleep(Duration::from_millis(1));
                }
                Ok(())
            })
        };
        let first = pool.submit(blocking, SubmitOptions::default());
        started_rx.recv_timeout(TIMEOUT).unwrap();

        let second = pool.submit(
            job_fn("second", |_, _| Ok(())),
            SubmitOptions::default().ensure_pickup(),
        );
        wait_for(&second, JobState::Succeeded);
        assert_eq!(pool.worker_count(), 2);

        release.store(true, Ordering::Relaxed);
        wait_for(&first, JobState::Succeeded);
    }

    #[test]
    fn test_ensure_pickup_back_to_back() {
        let pool = Pool::new(JobCategory::NetworkRead);
        let warmup = pool.submit(job_fn("warmup", |_, _| Ok(())), SubmitOptions::default());
        wait_for(&warmup, JobState::Succeeded);

        let start = Instant::now();
        while !pool.queue().has_idle_workers() {
            assert!(start.elapsed() < TIMEOUT, "timed out waiting for an idle worker");
            thread::sleep(Duration::from_millis(1));
        }

        // `first` occupies the only idle worker until `second` has run
        let second_ran = Arc::new(AtomicBool::new(false));
        let first = {
            let second_ran = Arc::clone(&second_ran);
            job_fn("first", move |_, _| {
                let start = Instant::now();
                while !second_ran.load(Ordering::Acquire) {
                    if start.elapsed() > TIMEOUT {
                        return Err(JobError::permanent("second job was never picked up"));
                    }
                    thread::sleep(Duration::from_millis(1));
                }
                Ok(())
            })
        };
        let second = {
            let second_ran = Arc::clone(&second_ran);
            job_fn("second", move |_, _| {
                second_ran.store(true, Ordering::Release);
                Ok(())
            })
        };

        let first = pool.submit(first, SubmitOptions::default().ensure_pickup());
        let second = pool.submit(second, SubmitOptions::default().ensure_pickup());

        wait_for(&second, JobState::Succeeded);
        wait_for(&first, JobState::Succeeded);
        assert_eq!(pool.worker_count(), 2);
    }

    #[test]
    fn test_panicking_job_fails_permanently() {
        let pool = Pool::new(JobCategory::Calculation);
        let panicking = pool.submit(
            job_fn("panics", |_, _| panic!("oh no")),
            SubmitOptions::default(),
        );
        wait_for(&panicking, JobState::Failed);

        // the worker survived
        let after = pool.submit(job_fn("after", |_, _| Ok(())), SubmitOptions::default());
        wait_for(&after, JobState::Succeeded);
        assert_eq!(pool.worker_count(), 1);
    }

    #[test]
    fn test_retry_transient_failure() {
        let pool = Pool::new(JobCategory::NetworkWrite);
        let mut attempts = 0;
        let controller = pool.submit(
            job_fn("flaky", move |_, _| {
                attempts += 1;
                if attempts == 1 {
                    Err(JobError::transient("connection reset"))
                } else {
                    Ok(())
                }
            }),
            SubmitOptions::default(),
        );
        wait_for(&controller, JobState::Failed);

        let status = pool.status();
        assert_eq!(status.transient_failures.len(), 1);
        assert_eq!(status.transient_failures[0].message, "connection reset");

        let id = controller.id().unwrap();
        assert!(pool.retry(id));
        wait_for(&controller, JobState::Succeeded);
        assert!(!pool.retry(id));
    }

    #[test]
    fn test_shutdown_cancels_running_job() {
        let pool = Pool::new(JobCategory::RemoteCalculation);
        let (started_tx, started_rx) = mpsc::channel();
        let controller = pool.submit(
            job_fn("endless", move |check_in, _| {
                started_tx.send(()).unwrap();
                loop {
                    check_in.check()?;
                    thread::sleep(Duration::from_millis(1));
                }
            }),
            SubmitOptions::default(),
        );
        started_rx.recv_timeout(TIMEOUT).unwrap();

        pool.shutdown();
        assert_eq!(controller.state(), Some(JobState::Canceled));
        assert_eq!(pool.worker_count(), 0);

        let late = pool.submit(job_fn("late", |_, _| Ok(())), SubmitOptions::default());
        assert_eq!(late.state(), Some(JobState::Canceled));
    }
}
