mod log;
mod participant;
mod status;

use std::time::{SystemTime, UNIX_EPOCH};

pub use log::{LogEntry, LogFilter, LogReason};
pub use participant::{
    CourseMembers, EnrollmentStatus, ImageSize, Participant, ReferenceDescriptor, Role,
};
pub use status::{SessionStatus, StatusField};

pub type ParticipantId = String;
pub type CourseId = String;

/// Milliseconds since the Unix epoch, 0 if the clock is before it.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
