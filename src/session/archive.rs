use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{CourseId, LogEntry, Participant};
use crate::recording::{ClipStorage, FinishedClip};
use crate::store::{BlobStore, RecordStore};

/// Stores finished incident clips for one participant and logs them.
pub struct IncidentArchive {
    blobs: Arc<dyn BlobStore>,
    records: Arc<dyn RecordStore>,
    course_id: CourseId,
    participant: Participant,
}

impl IncidentArchive {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        records: Arc<dyn RecordStore>,
        course_id: impl Into<CourseId>,
        participant: Participant,
    ) -> Self {
        Self {
            blobs,
            records,
            course_id: course_id.into(),
            participant,
        }
    }

    pub fn clip_path(&self, filename: &str) -> String {
        format!(
            "logging/{}/video/{}/{}",
            self.course_id, self.participant.id, filename
        )
    }
}

#[async_trait]
impl ClipStorage for IncidentArchive {
    async fn store_clip(&self, clip: FinishedClip) -> Result<String> {
        let path = self.clip_path(&clip.filename);
        let url = self
            .blobs
            .upload(clip.bytes, &path, &clip.content_type)
            .await?;

        self.records
            .append_log(&self.course_id, LogEntry::video(&self.participant, url.clone()))
            .await?;

        tracing::info!(
            course_id = %self.course_id,
            participant_id = %self.participant.id,
            duration_ms = clip.duration.as_millis() as u64,
            url = %url,
            "Archived incident clip"
        );
        Ok(url)
    }
}
