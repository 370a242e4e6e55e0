use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;

pub const DEFAULT_NOTICE_TIMEOUT: Duration = Duration::from_millis(5000);

const BUS_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
    Success,
}

/// A transient user-facing message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notice {
    pub severity: Severity,
    pub message: String,
    /// `None` keeps the notice until dismissed.
    pub timeout: Option<Duration>,
}

impl Notice {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            timeout: Some(DEFAULT_NOTICE_TIMEOUT),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(Severity::Error, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, message)
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(Severity::Info, message)
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::new(Severity::Success, message)
    }

    /// `0` makes the notice sticky.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout = (timeout_ms > 0).then(|| Duration::from_millis(timeout_ms));
        self
    }
}

/// Application-wide channel for [`Notice`]s.
#[derive(Clone)]
pub struct MessageBus {
    sender: broadcast::Sender<Notice>,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.sender.subscribe()
    }

    /// Returns how many subscribers received the notice.
    pub fn publish(&self, notice: Notice) -> usize {
        tracing::debug!(severity = ?notice.severity, message = %notice.message, "Notice");
        self.sender.send(notice).unwrap_or(0)
    }
}
