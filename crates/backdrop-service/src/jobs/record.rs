use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};

use serde::Serialize;

use super::JobInfo;

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

/// A process-unique identifier of a submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct JobId(u64);

impl JobId {
    pub(crate) fn next() -> Self {
        Self(NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The lifecycle state of a job.
///
/// `Canceled`, `Succeeded` and `Failed` are terminal, except that a transiently failed job
/// goes back to `Queued` when it is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum JobState {
    Queued = 0,
    Running = 1,
    Canceled = 2,
    Succeeded = 3,
    Failed = 4,
}

impl JobState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Queued,
            1 => Self::Running,
            2 => Self::Canceled,
            3 => Self::Succeeded,
            4 => Self::Failed,
            _ => unreachable!("invalid job state {value}"),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Canceled | Self::Succeeded | Self::Failed)
    }
}

/// The shared status part of a job.
///
/// The work itself is owned by the queue, while this record is shared between the queue and
/// any [`Controller`](super::Controller). All fields are atomics so that polling never takes
/// the queue lock.
#[derive(Debug)]
pub struct JobRecord {
    id: JobId,
    priority: i32,
    hidden: bool,
    info: JobInfo,
    state: AtomicU8,
    /// `f32` bits.
    progress: AtomicU32,
    cancel_requested: AtomicBool,
}

impl JobRecord {
    pub(crate) fn new(priority: i32, hidden: bool, info: JobInfo) -> Self {
        Self {
            id: JobId::next(),
            priority,
            hidden,
            info,
            state: AtomicU8::new(JobState::Queued as u8),
            progress: AtomicU32::new(0f32.to_bits()),
            cancel_requested: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Hidden jobs run normally, but are left out of status reporting.
    pub fn is_hidden(&self) -> bool {
        self.hidden
    }

    pub fn info(&self) -> &JobInfo {
        &self.info
    }

    pub fn state(&self) -> JobState {
        JobState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: JobState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn progress(&self) -> f32 {
        f32::from_bits(self.progress.load(Ordering::Relaxed))
    }

    pub(crate) fn set_progress(&self, progress: f32) {
        let progress = if progress.is_nan() {
            0.0
        } else {
            progress.clamp(0.0, 1.0)
        };
        self.progress.store(progress.to_bits(), Ordering::Relaxed);
    }

    /// Whether cancellation was requested before the job succeeded.
    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::Acquire) && self.state() != JobState::Succeeded
    }

    /// Requests cooperative cancellation.
    ///
    /// Has no effect on jobs that were canceled or succeeded already. A failed job can still be
    /// canceled, which keeps it from being retried.
    ///
    /// The job may succeed between the state check and setting the flag. The flag is then
    /// ignored by [`cancel_requested`](Self::cancel_requested).
    pub(crate) fn request_cancel(&self) {
        if !matches!(self.state(), JobState::Canceled | JobState::Succeeded) {
            self.cancel_requested.store(true, Ordering::Release);
        }
    }
}
