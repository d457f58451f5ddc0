//! Configuration for the sync coordinator.

use std::time::Duration;

use chat_sync_core::{RetrySchedule, DEFAULT_RECALL_WINDOW};

/// Configuration for [`SyncCoordinator`](crate::SyncCoordinator).
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// How long after creation a sent message stays recallable/editable.
    pub recall_window: Duration,
    /// Backoff schedule for queued operation retries.
    pub retry: RetrySchedule,
    /// Ceiling on each gateway request; elapse maps to a retryable timeout.
    pub request_timeout: Duration,
    /// Capacity of the application-facing event channel.
    pub event_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            recall_window: DEFAULT_RECALL_WINDOW,
            retry: RetrySchedule::default(),
            request_timeout: Duration::from_secs(10),
            event_capacity: 256,
        }
    }
}

impl SyncConfig {
    /// Set the recall/edit window.
    pub fn with_recall_window(mut self, window: Duration) -> Self {
        self.recall_window = window;
        self
    }

    /// Set the retry schedule.
    pub fn with_retry(mut self, retry: RetrySchedule) -> Self {
        self.retry = retry;
        self
    }

    /// Set the per-request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the event channel capacity.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }
}
