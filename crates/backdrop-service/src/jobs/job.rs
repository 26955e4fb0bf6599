use std::fmt;

use serde::Serialize;
use thiserror::Error;

use super::JobRecord;

/// Descriptive information about a job, used for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobInfo {
    /// Human-readable description of what the job does.
    pub description: String,
    /// A rough estimate of the amount of data the job produces or transfers, in bytes.
    pub size_estimate: u64,
}

impl JobInfo {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            size_estimate: 0,
        }
    }

    pub fn with_size_estimate(mut self, size_estimate: u64) -> Self {
        self.size_estimate = size_estimate;
        self
    }
}

/// The ways in which executing a job can end without success.
///
/// Classifying a failure is the responsibility of the job itself, the execution loop never
/// guesses whether a failure is worth retrying.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    /// The job noticed a cancellation request via [`CheckIn::check`].
    ///
    /// This is not considered a failure.
    #[error("canceled")]
    Canceled,
    /// The job failed and will never succeed when run again.
    ///
    /// The job is dropped and its controller reports [`JobState::Failed`](super::JobState::Failed).
    #[error("permanent failure: {0}")]
    Permanent(String),
    /// The job failed because of a temporary condition, like a network disruption.
    ///
    /// The job is retained in the failed list of its queue and can be retried.
    #[error("transient failure: {0}")]
    Transient(String),
}

impl JobError {
    pub fn permanent(message: impl fmt::Display) -> Self {
        Self::Permanent(message.to_string())
    }

    pub fn transient(message: impl fmt::Display) -> Self {
        Self::Transient(message.to_string())
    }
}

/// A unit of asynchronous work.
///
/// Jobs run on the worker threads of the pool of their category. A job body may block, for
/// example on network I/O, but should call [`CheckIn::check`] regularly so that cancellation
/// takes effect.
pub trait Job: Send + 'static {
    /// Whether all the inputs this job depends on are available.
    ///
    /// A job that is not ready is parked in the waiting list of its queue until the queue is
    /// woken up again, typically because a cache received new data.
    fn inputs_ready(&self) -> bool {
        true
    }

    /// Runs the job.
    ///
    /// A job that failed transiently is executed again when it is retried.
    fn execute(&mut self, check_in: &CheckIn<'_>, progress: &ProgressReporter<'_>)
    -> Result<(), JobError>;

    /// Describes this job for status reporting.
    fn info(&self) -> JobInfo;
}

/// Lets a running job poll for cancellation.
pub struct CheckIn<'a> {
    record: &'a JobRecord,
}

impl<'a> CheckIn<'a> {
    pub(crate) fn new(record: &'a JobRecord) -> Self {
        Self { record }
    }

    /// Returns [`JobError::Canceled`] once cancellation of this job has been requested.
    ///
    /// Job bodies are expected to call this with `?` between units of work.
    pub fn check(&self) -> Result<(), JobError> {
        if self.record.cancel_requested() {
            Err(JobError::Canceled)
        } else {
            Ok(())
        }
    }
}

/// Lets a running job report how far along it is.
pub struct ProgressReporter<'a> {
    record: &'a JobRecord,
}

impl<'a> ProgressReporter<'a> {
    pub(crate) fn new(record: &'a JobRecord) -> Self {
        Self { record }
    }

    /// Reports progress as a fraction in `[0, 1]`, values outside are clamped.
    pub fn report(&self, fraction: f32) {
        self.record.set_progress(fraction);
    }
}

type ReadyFn = Box<dyn Fn() -> bool + Send>;

/// A [`Job`] backed by a closure.
pub struct FnJob<F> {
    info: JobInfo,
    ready: Option<ReadyFn>,
    func: F,
}

/// Creates a [`Job`] from a closure.
pub fn job_fn<F>(description: impl Into<String>, func: F) -> FnJob<F>
where
    F: FnMut(&CheckIn<'_>, &ProgressReporter<'_>) -> Result<(), JobError> + Send + 'static,
{
    FnJob {
        info: JobInfo::new(description),
        ready: None,
        func,
    }
}

impl<F> FnJob<F> {
    /// Makes the job wait until `ready` returns `true`.
    pub fn with_inputs(mut self, ready: impl Fn() -> bool + Send + 'static) -> Self {
        self.ready = Some(Box::new(ready));
        self
    }

    pub fn with_size_estimate(mut self, size_estimate: u64) -> Self {
        self.info.size_estimate = size_estimate;
        self
    }
}

impl<F> Job for FnJob<F>
where
    F: FnMut(&CheckIn<'_>, &ProgressReporter<'_>) -> Result<(), JobError> + Send + 'static,
{
    fn inputs_ready(&self) -> bool {
        self.ready.as_ref().is_none_or(|ready| ready())
    }

    fn execute(
        &mut self,
        check_in: &CheckIn<'_>,
        progress: &ProgressReporter<'_>,
    ) -> Result<(), JobError> {
        (self.func)(check_in, progress)
    }

    fn info(&self) -> JobInfo {
        self.info.clone()
    }
}
