use serde::{Deserialize, Serialize};

/// Incident recorder phase. A recording always returns to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordingState {
    Idle,
    Recording,
}

impl Default for RecordingState {
    fn default() -> Self {
        Self::Idle
    }
}

/// Result of a `stop_recording` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    NotRecording,
    /// Shorter than the minimum duration; nothing was stored.
    Discarded { elapsed_ms: u64 },
    Stored { filename: String, url: String },
}
