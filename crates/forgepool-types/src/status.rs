/// Lifecycle state of a [`BackendRecord`](crate) (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum BackendStatus {
    /// Configuration flag is off; the backend takes no further action.
    Disabled,
    /// Enqueued for initialization, or waiting to retry after a transient
    /// init failure.
    Waiting,
    /// `init()` is currently running.
    Loading,
    /// Initialized and idle (used by drivers that distinguish idle from
    /// actively-generating; the scheduler itself only cares about `Running`).
    Idle,
    /// Initialized and eligible to serve requests.
    Running,
    /// Terminal init failure after `MaxBackendInitAttempts` retries.
    Errored,
}

impl BackendStatus {
    pub fn is_enabled(self) -> bool {
        !matches!(self, BackendStatus::Disabled)
    }
}
