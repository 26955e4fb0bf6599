use std::fmt;

use serde::{Deserialize, Serialize};

/// All known job categories.
///
/// Every category is served by its own [`Pool`](super::Pool) and queue. Categories are fully
/// independent of each other: a slow network read never delays a calculation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobCategory {
    /// CPU-bound computations.
    Calculation,
    /// Reads from and writes to the durable on-disk store.
    Disk,
    NetworkRead,
    NetworkWrite,
    /// Long-lived subscriptions to externally changing entities.
    NotificationWatch,
    /// Calculations delegated to a remote service, blocking on network I/O.
    RemoteCalculation,
}

impl JobCategory {
    pub const ALL: [JobCategory; 6] = [
        Self::Calculation,
        Self::Disk,
        Self::NetworkRead,
        Self::NetworkWrite,
        Self::NotificationWatch,
        Self::RemoteCalculation,
    ];

    /// Position of this category within [`JobCategory::ALL`].
    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl AsRef<str> for JobCategory {
    fn as_ref(&self) -> &str {
        match self {
            Self::Calculation => "calculation",
            Self::Disk => "disk",
            Self::NetworkRead => "network_read",
            Self::NetworkWrite => "network_write",
            Self::NotificationWatch => "notification_watch",
            Self::RemoteCalculation => "remote_calculation",
        }
    }
}

impl fmt::Display for JobCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}
