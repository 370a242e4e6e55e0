use serde::{Deserialize, Serialize};

use super::{now_millis, Participant, ParticipantId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogReason {
    EnteredExam,
    LeftExam,
    Video,
    Other,
}

/// Append-only course log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    /// Assigned by the record store on append.
    pub id: Option<String>,
    /// Milliseconds since the Unix epoch.
    pub date: u64,
    pub user_id: ParticipantId,
    pub user_name: String,
    pub user_email: String,
    pub reason: LogReason,
    pub video_id: Option<String>,
    pub message: Option<String>,
}

impl LogEntry {
    pub fn new(participant: &Participant, reason: LogReason) -> Self {
        Self {
            id: None,
            date: now_millis(),
            user_id: participant.id.clone(),
            user_name: participant.display_name(),
            user_email: participant.email.clone(),
            reason,
            video_id: None,
            message: None,
        }
    }

    pub fn video(participant: &Participant, video_url: impl Into<String>) -> Self {
        Self {
            video_id: Some(video_url.into()),
            ..Self::new(participant, LogReason::Video)
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub user_id: Option<ParticipantId>,
    pub reason: Option<LogReason>,
}

impl LogFilter {
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            reason: None,
        }
    }

    pub fn matches(&self, entry: &LogEntry) -> bool {
        self.user_id.as_ref().map_or(true, |u| *u == entry.user_id)
            && self.reason.map_or(true, |r| r == entry.reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Role;

    #[test]
    fn test_reason_wire_names() {
        assert_eq!(serde_json::to_string(&LogReason::EnteredExam).unwrap(), "\"ENTERED_EXAM\"");
        assert_eq!(serde_json::to_string(&LogReason::Video).unwrap(), "\"VIDEO\"");
    }

    #[test]
    fn test_filter() {
        let ana = Participant::new("s1", Role::Student, "ana@uni.edu").with_name("Ana", "Lopez");
        let entry = LogEntry::video(&ana, "https://blobs/clip.webm");
        assert_eq!(entry.user_name, "Ana Lopez");

        assert!(LogFilter::default().matches(&entry));
        assert!(LogFilter::for_user("s1").matches(&entry));
        assert!(!LogFilter::for_user("s2").matches(&entry));

        let by_reason = LogFilter {
            user_id: None,
            reason: Some(LogReason::LeftExam),
        };
        assert!(!by_reason.matches(&entry));
    }
}
