//! External collaborators: the record store (participants, shared session
//! status, course log) and the blob store (clips and enrollment images).

mod blob;
mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;

use crate::error::Result;
use crate::model::{
    CourseMembers, LogEntry, LogFilter, Participant, ReferenceDescriptor, SessionStatus,
    StatusField,
};

pub use blob::{HttpBlobStore, LocalBlobStore};
pub use memory::{InMemoryBlobStore, InMemoryRecordStore, StatusWrite, StoredBlob};

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn participant(&self, id: &str) -> Result<Option<Participant>>;

    async fn update_descriptor(&self, id: &str, descriptor: ReferenceDescriptor) -> Result<()>;

    async fn update_id_image(&self, id: &str, url: &str) -> Result<()>;

    /// Live view of one participant record. `None` while it does not exist.
    fn watch_participant(&self, id: &str) -> watch::Receiver<Option<Participant>>;

    async fn course_members(&self, course_id: &str) -> Result<CourseMembers>;

    async fn session_status(&self, course_id: &str, participant_id: &str) -> Result<SessionStatus>;

    /// Last-write-wins update of a single status field.
    async fn update_status(
        &self,
        course_id: &str,
        participant_id: &str,
        field: StatusField,
    ) -> Result<()>;

    /// Live view of one participant's status.
    fn watch_status(&self, course_id: &str, participant_id: &str)
        -> watch::Receiver<SessionStatus>;

    async fn append_log(&self, course_id: &str, entry: LogEntry) -> Result<LogEntry>;

    /// Matching entries, newest first.
    async fn log_entries(&self, course_id: &str, filter: &LogFilter) -> Result<Vec<LogEntry>>;
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes` under `path` and return its download URL.
    async fn upload(&self, bytes: Bytes, path: &str, content_type: &str) -> Result<String>;
}
