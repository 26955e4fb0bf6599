use std::sync::Arc;

use super::{JobId, JobRecord, JobState};

/// The caller-held handle of a submitted job.
///
/// A controller is used to observe the state and progress of a job, and to cancel it. All reads
/// are non-blocking. Dropping a controller requests cancellation of its job; use
/// [`Controller::detach`] to let a job run to completion unobserved.
///
/// A default-constructed controller is empty and not bound to any job.
#[derive(Debug, Default)]
pub struct Controller {
    record: Option<Arc<JobRecord>>,
}

impl Controller {
    pub(crate) fn new(record: Arc<JobRecord>) -> Self {
        Self {
            record: Some(record),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.record.is_none()
    }

    pub fn id(&self) -> Option<JobId> {
        self.record.as_ref().map(|record| record.id())
    }

    /// The current state of the job, or `None` for an empty controller.
    pub fn state(&self) -> Option<JobState> {
        self.record.as_ref().map(|record| record.state())
    }

    /// The last progress reported by the job, `0.0` for an empty controller.
    pub fn progress(&self) -> f32 {
        self.record.as_ref().map_or(0.0, |record| record.progress())
    }

    /// Whether the job reached a terminal state.
    pub fn is_finished(&self) -> bool {
        self.state().is_some_and(JobState::is_terminal)
    }

    /// Requests cooperative cancellation of the job.
    ///
    /// The job keeps running until it next checks in; the worker thread then moves it to
    /// [`JobState::Canceled`]. Jobs that already finished are not affected.
    pub fn cancel(&self) {
        if let Some(record) = &self.record {
            record.request_cancel();
        }
    }

    /// Cancels the job and unbinds this controller from it.
    pub fn reset(&mut self) {
        if let Some(record) = self.record.take() {
            record.request_cancel();
        }
    }

    /// Unbinds the controller from its job without canceling it.
    pub fn detach(mut self) {
        self.record = None;
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.reset();
    }
}
