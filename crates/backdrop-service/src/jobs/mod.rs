//! Prioritized background jobs.
//!
//! Every job belongs to a [`JobCategory`], and every category has its own [`Pool`] of worker
//! threads consuming a [`JobQueue`]. Categories are kept apart so that, for example, slow
//! network transfers never starve local calculations of workers.
//!
//! A job is submitted as a [`Job`] implementation and is from then on owned by its queue. The
//! submitter gets back a [`Controller`], which observes the job and cancels it when dropped.
//!
//! A job can declare that its inputs are not ready yet. Such a job is parked by the worker that
//! picked it up, and moved back to the ready jobs whenever its queue is woken up, typically
//! because one of the caches received new data.

mod category;
mod controller;
mod job;
mod pool;
mod queue;
mod record;

pub use category::JobCategory;
pub use controller::Controller;
pub use job::{CheckIn, FnJob, Job, JobError, JobInfo, ProgressReporter, job_fn};
pub use pool::{Pool, SubmitOptions};
pub use queue::{FailedJob, JobQueue, QueueStatus};
pub use record::{JobId, JobRecord, JobState};
