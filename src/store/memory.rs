use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;

use super::{BlobStore, RecordStore};
use crate::error::{ProctorError, Result};
use crate::media::random_id;
use crate::model::{
    CourseMembers, EnrollmentStatus, LogEntry, LogFilter, Participant, ReferenceDescriptor,
    Role, SessionStatus, StatusField,
};

type StatusKey = (String, String);

#[derive(Debug, Clone, PartialEq)]
pub struct StatusWrite {
    pub course_id: String,
    pub participant_id: String,
    pub field: StatusField,
}

#[derive(Default)]
struct MemoryState {
    participants: HashMap<String, Participant>,
    participant_watches: HashMap<String, watch::Sender<Option<Participant>>>,
    courses: HashMap<String, Vec<String>>,
    statuses: HashMap<StatusKey, watch::Sender<SessionStatus>>,
    logs: HashMap<String, Vec<LogEntry>>,
    status_writes: Vec<StatusWrite>,
    fail_status_writes: bool,
}

/// Process-local record store. Backs tests and single-node deployments.
#[derive(Default)]
pub struct InMemoryRecordStore {
    state: Mutex<MemoryState>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert_participant(&self, participant: Participant) {
        let mut state = self.state();
        let id = participant.id.clone();
        state.participants.insert(id.clone(), participant);
        Self::publish_participant(&mut state, &id);
    }

    pub fn enroll(&self, course_id: &str, participant_id: &str) {
        let mut state = self.state();
        let members = state.courses.entry(course_id.to_string()).or_default();
        if !members.iter().any(|id| id == participant_id) {
            members.push(participant_id.to_string());
        }
    }

    /// Every status write so far, in order.
    pub fn status_writes(&self) -> Vec<StatusWrite> {
        self.state().status_writes.clone()
    }

    /// Make subsequent status writes fail, for exercising transient errors.
    pub fn set_fail_status_writes(&self, fail: bool) {
        self.state().fail_status_writes = fail;
    }

    fn participant_sender(state: &mut MemoryState, id: &str) -> watch::Sender<Option<Participant>> {
        let current = state.participants.get(id).cloned();
        state
            .participant_watches
            .entry(id.to_string())
            .or_insert_with(|| watch::channel(current).0)
            .clone()
    }

    fn publish_participant(state: &mut MemoryState, id: &str) {
        if let Some(sender) = state.participant_watches.get(id) {
            sender.send_replace(state.participants.get(id).cloned());
        }
    }

    fn status_sender(
        state: &mut MemoryState,
        course_id: &str,
        participant_id: &str,
    ) -> watch::Sender<SessionStatus> {
        state
            .statuses
            .entry((course_id.to_string(), participant_id.to_string()))
            .or_insert_with(|| watch::channel(SessionStatus::default()).0)
            .clone()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn participant(&self, id: &str) -> Result<Option<Participant>> {
        Ok(self.state().participants.get(id).cloned())
    }

    async fn update_descriptor(&self, id: &str, descriptor: ReferenceDescriptor) -> Result<()> {
        let mut state = self.state();
        let participant = state
            .participants
            .get_mut(id)
            .ok_or_else(|| ProctorError::ParticipantNotFound(id.to_string()))?;
        participant.descriptor_info = Some(descriptor);
        participant.status = EnrollmentStatus::Register;
        Self::publish_participant(&mut state, id);
        Ok(())
    }

    async fn update_id_image(&self, id: &str, url: &str) -> Result<()> {
        let mut state = self.state();
        let participant = state
            .participants
            .get_mut(id)
            .ok_or_else(|| ProctorError::ParticipantNotFound(id.to_string()))?;
        participant.id_image_url = Some(url.to_string());
        Self::publish_participant(&mut state, id);
        Ok(())
    }

    fn watch_participant(&self, id: &str) -> watch::Receiver<Option<Participant>> {
        let mut state = self.state();
        Self::participant_sender(&mut state, id).subscribe()
    }

    async fn course_members(&self, course_id: &str) -> Result<CourseMembers> {
        let state = self.state();
        let mut members = CourseMembers::default();
        let ids = state.courses.get(course_id).cloned().unwrap_or_default();
        for id in ids {
            let Some(participant) = state.participants.get(&id) else {
                continue;
            };
            match participant.role {
                Role::Student => members.students.push(participant.clone()),
                Role::Proctor | Role::Admin => members.proctors.push(participant.clone()),
            }
        }
        Ok(members)
    }

    async fn session_status(&self, course_id: &str, participant_id: &str) -> Result<SessionStatus> {
        let mut state = self.state();
        let sender = Self::status_sender(&mut state, course_id, participant_id);
        let status = *sender.borrow();
        Ok(status)
    }

    async fn update_status(
        &self,
        course_id: &str,
        participant_id: &str,
        field: StatusField,
    ) -> Result<()> {
        let mut state = self.state();
        if state.fail_status_writes {
            return Err(ProctorError::storage("status write rejected"));
        }
        let sender = Self::status_sender(&mut state, course_id, participant_id);
        sender.send_modify(|status| status.apply(field));
        state.status_writes.push(StatusWrite {
            course_id: course_id.to_string(),
            participant_id: participant_id.to_string(),
            field,
        });
        Ok(())
    }

    fn watch_status(
        &self,
        course_id: &str,
        participant_id: &str,
    ) -> watch::Receiver<SessionStatus> {
        let mut state = self.state();
        Self::status_sender(&mut state, course_id, participant_id).subscribe()
    }

    async fn append_log(&self, course_id: &str, mut entry: LogEntry) -> Result<LogEntry> {
        entry.id = Some(random_id(20));
        self.state()
            .logs
            .entry(course_id.to_string())
            .or_default()
            .push(entry.clone());
        Ok(entry)
    }

    async fn log_entries(&self, course_id: &str, filter: &LogFilter) -> Result<Vec<LogEntry>> {
        let state = self.state();
        let mut entries: Vec<LogEntry> = state
            .logs
            .get(course_id)
            .map(|log| log.iter().filter(|e| filter.matches(e)).cloned().collect())
            .unwrap_or_default();
        // Among equal timestamps the later append comes first.
        entries.reverse();
        entries.sort_by(|a, b| b.date.cmp(&a.date));
        Ok(entries)
    }
}

#[derive(Debug, Clone)]
pub struct StoredBlob {
    pub path: String,
    pub content_type: String,
    pub bytes: Bytes,
}

#[derive(Default)]
pub struct InMemoryBlobStore {
    blobs: Mutex<Vec<StoredBlob>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn uploads(&self) -> Vec<StoredBlob> {
        self.blobs.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn upload(&self, bytes: Bytes, path: &str, content_type: &str) -> Result<String> {
        self.blobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(StoredBlob {
                path: path.to_string(),
                content_type: content_type.to_string(),
                bytes,
            });
        Ok(format!("memory://{}", path))
    }
}
