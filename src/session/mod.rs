//! Orchestration of one participant in one course session.
//!
//! [`SessionCoordinator`] joins the peer mesh, gates the local tracks from
//! the shared [`SessionStatus`], turns liveness outcomes into highlight
//! writes and incident recordings, and writes the ENTERED/LEFT log entries.

mod archive;
mod bus;
mod enrollment;
mod roster;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};

use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;

pub use archive::IncidentArchive;
pub use bus::{MessageBus, Notice, Severity, DEFAULT_NOTICE_TIMEOUT};
pub use enrollment::{Enrollment, EnrollmentImage};
pub use roster::compute_roster;

use crate::config::Config;
use crate::error::{ProctorError, Result};
use crate::face::{FaceDetector, FaceMatchEngine};
use crate::liveness::{FrameSource, LivenessEvent, LivenessMonitor};
use crate::media::MediaStream;
use crate::model::{
    CourseId, LogEntry, LogFilter, LogReason, Participant, Role, SessionStatus, StatusField,
};
use crate::peer::{PeerSessionManager, PeerUpdate, RemoteStreamView, SignalingBackend};
use crate::recording::{IncidentRecorder, MediaCapture, StopOutcome};
use crate::store::{BlobStore, RecordStore};

pub const EXIT_WARNING: &str =
    "Are you sure you want to leave the exam? You will terminate the exam!";

/// External capabilities a session runs against.
#[derive(Clone)]
pub struct SessionDeps {
    pub records: Arc<dyn RecordStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub signaling: Arc<dyn SignalingBackend>,
    pub detector: Arc<dyn FaceDetector>,
    pub capture: Arc<dyn MediaCapture>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionView {
    Roster,
    Review(String),
    /// Setup failure; replaces the session.
    Fatal(String),
}

/// A proctor's close look at one student.
#[derive(Debug, Clone)]
pub struct ReviewView {
    pub participant: Participant,
    pub stream: Option<RemoteStreamView>,
    pub status: SessionStatus,
    pub logs: Vec<LogEntry>,
}

#[derive(Default)]
struct Presence {
    entered: bool,
    left: bool,
}

struct CoordinatorInner {
    config: Config,
    course_id: CourseId,
    participant: Participant,
    records: Arc<dyn RecordStore>,
    peers: PeerSessionManager,
    monitor: LivenessMonitor,
    recorder: IncidentRecorder,
    bus: MessageBus,
    view: watch::Sender<SessionView>,
    status: StdMutex<SessionStatus>,
    presence: Mutex<Presence>,
    closing: AtomicBool,
    /// Set while a local stream is attached. Liveness events are dropped otherwise.
    attached: AtomicBool,
    frames: StdMutex<Option<Arc<dyn FrameSource>>>,
    pump: StdMutex<Option<JoinHandle<()>>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct SessionCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl SessionCoordinator {
    /// Load the participant and course, compute the roster and open the
    /// signaling identity.
    ///
    /// Signaling failures are reported on the bus and do not fail the join.
    pub async fn join(
        config: Config,
        course_id: &str,
        participant_id: &str,
        deps: SessionDeps,
        bus: MessageBus,
    ) -> Result<Self> {
        if course_id.is_empty() {
            return Err(ProctorError::Missing("course id"));
        }
        if participant_id.is_empty() {
            return Err(ProctorError::Missing("participant id"));
        }

        let participant = deps
            .records
            .participant(participant_id)
            .await?
            .ok_or_else(|| ProctorError::ParticipantNotFound(participant_id.to_string()))?;
        let members = deps.records.course_members(course_id).await?;
        let status = deps.records.session_status(course_id, participant_id).await?;

        let engine = Arc::new(FaceMatchEngine::new(deps.detector, config.face.clone()));
        let monitor = LivenessMonitor::new(engine, &config.liveness);
        if participant.role == Role::Student {
            monitor.set_reference(participant.reference_descriptor().map(<[f32]>::to_vec));
        }

        let archive = IncidentArchive::new(
            deps.blobs,
            deps.records.clone(),
            course_id,
            participant.clone(),
        );
        let recorder =
            IncidentRecorder::new(deps.capture, Arc::new(archive), config.recording.clone());
        let peers = PeerSessionManager::new(participant_id, deps.signaling);
        let (view, _) = watch::channel(SessionView::Roster);

        let status_rx = deps.records.watch_status(course_id, participant_id);
        let updates = peers.subscribe();
        let roster = compute_roster(&participant.id, participant.role, &members);

        let inner = Arc::new(CoordinatorInner {
            config,
            course_id: course_id.to_string(),
            participant,
            records: deps.records,
            peers,
            monitor,
            recorder,
            bus,
            view,
            status: StdMutex::new(status),
            presence: Mutex::new(Presence::default()),
            closing: AtomicBool::new(false),
            attached: AtomicBool::new(false),
            frames: StdMutex::new(None),
            pump: StdMutex::new(None),
            tasks: StdMutex::new(Vec::new()),
        });

        let presence_task = tokio::spawn(run_presence(Arc::downgrade(&inner), updates));
        let status_task = tokio::spawn(run_status_watch(Arc::downgrade(&inner), status_rx));
        inner.lock_tasks().extend([presence_task, status_task]);
        if inner.participant.role == Role::Student {
            let record_rx = inner.records.watch_participant(participant_id);
            let record_task =
                tokio::spawn(run_participant_watch(Arc::downgrade(&inner), record_rx));
            inner.lock_tasks().push(record_task);
        }

        inner.peers.set_roster(roster).await;
        if let Err(e) = inner.peers.open().await {
            tracing::error!(
                participant_id = %participant_id,
                error = %e,
                "Failed to open signaling identity"
            );
            inner.bus.publish(Notice::error(e.to_string()));
        }

        tracing::info!(
            course_id = %course_id,
            participant_id = %participant_id,
            role = %inner.participant.role,
            "Joined session"
        );
        Ok(Self { inner })
    }

    /// Start sharing the local stream, or fail the session if it could not
    /// be acquired.
    ///
    /// Students with a reference descriptor also start liveness checks on
    /// `frames`. A descriptor enrolled later starts them then.
    pub async fn attach_local_stream(
        &self,
        acquired: Result<MediaStream>,
        frames: Arc<dyn FrameSource>,
    ) -> Result<()> {
        let stream = match acquired {
            Ok(stream) => stream,
            Err(e) => {
                let err = match e {
                    ProctorError::MediaAcquisition(_) => e,
                    other => ProctorError::MediaAcquisition(other.to_string()),
                };
                self.inner.fail(&err);
                return Err(err);
            }
        };
        if self.inner.closing.load(Ordering::SeqCst) {
            return Err(ProctorError::internal("session is closed"));
        }

        let status = *self.inner.lock_status();
        self.inner
            .peers
            .set_call_context(stream.clone(), &self.inner.course_id, self.inner.participant.role)
            .await;
        self.inner
            .peers
            .apply_media_status(status.mic_status, status.camera_status)
            .await;
        self.inner.recorder.set_stream(stream).await;
        *self.inner.lock_frames() = Some(frames);
        self.inner.attached.store(true, Ordering::SeqCst);

        if self.inner.monitors_liveness() {
            self.inner.start_liveness().await?;
        }
        Ok(())
    }

    /// Stop liveness checks and the incident recorder and close every call.
    ///
    /// A recording in progress is finalized like a manual stop. The highlight
    /// flag is left as the last check set it.
    pub async fn detach_local_stream(&self) -> Result<StopOutcome> {
        self.inner.attached.store(false, Ordering::SeqCst);
        self.inner.lock_frames().take();
        self.inner.monitor.stop().await;

        let pump = self.inner.lock_pump().take();
        if let Some(pump) = pump {
            if let Err(e) = pump.await {
                tracing::warn!(error = %e, "Liveness pump ended abnormally");
            }
        }

        let outcome = self.inner.recorder.stop_recording().await;
        self.inner.recorder.clear_stream().await;
        self.inner.peers.clear_local_stream().await;

        if let Ok(outcome) = &outcome {
            tracing::info!(
                participant_id = %self.inner.participant.id,
                outcome = ?outcome,
                "Local stream detached"
            );
        }
        outcome
    }

    /// Leave the session. Safe to call more than once.
    pub async fn leave(&self) {
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Err(e) = self.detach_local_stream().await {
            tracing::warn!(error = %e, "Failed to finalize recording on leave");
        }

        if self.inner.config.liveness.clear_highlight_on_leave {
            self.inner.write_highlight(false).await;
        }

        self.inner.peers.shutdown().await;
        self.inner.log_presence(LogReason::LeftExam).await;

        for task in self.inner.lock_tasks().drain(..) {
            task.abort();
        }
        tracing::info!(
            course_id = %self.inner.course_id,
            participant_id = %self.inner.participant.id,
            "Left session"
        );
    }

    pub async fn set_mic(&self, target_id: &str, enabled: bool) -> Result<()> {
        self.set_media_flag(target_id, StatusField::Mic(enabled)).await
    }

    pub async fn set_camera(&self, target_id: &str, enabled: bool) -> Result<()> {
        self.set_media_flag(target_id, StatusField::Camera(enabled)).await
    }

    async fn set_media_flag(&self, target_id: &str, field: StatusField) -> Result<()> {
        let inner = &self.inner;
        let is_self = target_id == inner.participant.id;
        if !is_self && !self.supervises(target_id).await {
            return Err(ProctorError::Unauthorized(inner.participant.id.clone()));
        }

        inner
            .records
            .update_status(&inner.course_id, target_id, field)
            .await?;

        if is_self {
            let status = {
                let mut status = inner.lock_status();
                status.apply(field);
                *status
            };
            inner
                .peers
                .apply_media_status(status.mic_status, status.camera_status)
                .await;
        }
        tracing::info!(target_id = %target_id, field = ?field, "Media status changed");
        Ok(())
    }

    /// Record the outcome of a manual identity review and return to the
    /// roster.
    pub async fn set_identified(&self, target_id: &str, identified: bool) -> Result<()> {
        self.require_supervisor()?;
        self.inner
            .records
            .update_status(&self.inner.course_id, target_id, StatusField::Identified(identified))
            .await?;

        self.inner.view.send_replace(SessionView::Roster);
        tracing::info!(target_id = %target_id, identified, "Identity review recorded");
        Ok(())
    }

    pub async fn open_review(&self, target_id: &str) -> Result<ReviewView> {
        self.require_supervisor()?;
        let inner = &self.inner;
        let participant = inner
            .records
            .participant(target_id)
            .await?
            .ok_or_else(|| ProctorError::ParticipantNotFound(target_id.to_string()))?;
        let logs = inner
            .records
            .log_entries(&inner.course_id, &LogFilter::for_user(target_id))
            .await?;
        let status = inner.records.session_status(&inner.course_id, target_id).await?;
        let stream = inner.peers.remote_stream(target_id).await;

        inner
            .view
            .send_replace(SessionView::Review(target_id.to_string()));
        Ok(ReviewView {
            participant,
            stream,
            status,
            logs,
        })
    }

    pub fn close_review(&self) {
        self.inner.view.send_replace(SessionView::Roster);
    }

    fn require_supervisor(&self) -> Result<()> {
        if self.inner.participant.role.is_supervisor() {
            Ok(())
        } else {
            Err(ProctorError::Unauthorized(self.inner.participant.id.clone()))
        }
    }

    async fn supervises(&self, target_id: &str) -> bool {
        if !self.inner.participant.role.is_supervisor() {
            return false;
        }
        matches!(
            self.inner.peers.remote_stream(target_id).await,
            Some(view) if view.role == Role::Student
        )
    }

    pub fn exit_warning(&self) -> &'static str {
        EXIT_WARNING
    }

    pub fn participant(&self) -> &Participant {
        &self.inner.participant
    }

    pub fn course_id(&self) -> &str {
        &self.inner.course_id
    }

    pub fn view(&self) -> watch::Receiver<SessionView> {
        self.inner.view.subscribe()
    }

    pub fn current_view(&self) -> SessionView {
        self.inner.view.borrow().clone()
    }

    /// Last known status of the local participant.
    pub fn status(&self) -> SessionStatus {
        *self.inner.lock_status()
    }

    pub fn peers(&self) -> &PeerSessionManager {
        &self.inner.peers
    }

    pub fn recorder(&self) -> &IncidentRecorder {
        &self.inner.recorder
    }

    pub fn monitor(&self) -> &LivenessMonitor {
        &self.inner.monitor
    }

    pub fn bus(&self) -> &MessageBus {
        &self.inner.bus
    }

    pub async fn remote_streams(&self) -> Vec<RemoteStreamView> {
        self.inner.peers.remote_streams().await
    }
}

impl CoordinatorInner {
    fn lock_status(&self) -> MutexGuard<'_, SessionStatus> {
        self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_pump(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.pump.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_frames(&self) -> MutexGuard<'_, Option<Arc<dyn FrameSource>>> {
        self.frames.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn monitors_liveness(&self) -> bool {
        self.participant.role == Role::Student && self.monitor.has_reference()
    }

    /// Start the monitor on the attached frame source and pump its events.
    async fn start_liveness(self: &Arc<Self>) -> Result<()> {
        let Some(frames) = self.lock_frames().clone() else {
            return Ok(());
        };
        let events = match self.monitor.start(frames).await {
            Ok(events) => events,
            Err(e) => {
                if e.is_fatal() {
                    self.fail(&e);
                }
                return Err(e);
            }
        };
        let pump = tokio::spawn(run_liveness_pump(Arc::downgrade(self), events));
        if let Some(previous) = self.lock_pump().replace(pump) {
            previous.abort();
        }
        Ok(())
    }

    /// Apply a rewritten reference descriptor from the participant record.
    async fn on_reference(self: &Arc<Self>, reference: Option<Vec<f32>>) {
        let enrolled = reference.is_some();
        self.monitor.set_reference(reference);
        tracing::info!(participant_id = %self.participant.id, enrolled, "Reference descriptor updated");

        let idle = !self.monitor.is_running();
        if enrolled && idle && self.attached.load(Ordering::SeqCst) {
            if let Err(e) = self.start_liveness().await {
                tracing::warn!(participant_id = %self.participant.id, error = %e, "Failed to start liveness checks");
            }
        }
    }

    fn fail(&self, err: &ProctorError) {
        tracing::error!(participant_id = %self.participant.id, error = %err, "Session setup failed");
        self.view.send_replace(SessionView::Fatal(err.to_string()));
        self.bus
            .publish(Notice::error(err.to_string()).with_timeout_ms(0));
    }

    /// Write ENTERED/LEFT at most once each, LEFT only after ENTERED.
    async fn log_presence(&self, reason: LogReason) {
        let mut presence = self.presence.lock().await;
        let first = match reason {
            LogReason::EnteredExam => !std::mem::replace(&mut presence.entered, true),
            LogReason::LeftExam => presence.entered && !std::mem::replace(&mut presence.left, true),
            _ => false,
        };
        if !first {
            return;
        }

        let entry = LogEntry::new(&self.participant, reason);
        if let Err(e) = self.records.append_log(&self.course_id, entry).await {
            tracing::warn!(
                participant_id = %self.participant.id,
                reason = ?reason,
                error = %e,
                "Failed to write presence log"
            );
        }
    }

    /// Write `isHighlighted` when it differs from the last known value.
    async fn write_highlight(&self, highlighted: bool) {
        if self.lock_status().is_highlighted == highlighted {
            return;
        }

        let field = StatusField::Highlighted(highlighted);
        match self
            .records
            .update_status(&self.course_id, &self.participant.id, field)
            .await
        {
            Ok(()) => {
                self.lock_status().apply(field);
                tracing::info!(participant_id = %self.participant.id, highlighted, "Highlight changed");
            }
            Err(e) => {
                tracing::warn!(participant_id = %self.participant.id, error = %e, "Highlight write failed");
            }
        }
    }

    async fn on_liveness(&self, event: LivenessEvent) {
        match event {
            LivenessEvent::MatchNotFound => {
                self.write_highlight(true).await;
                if let Err(e) = self.recorder.start_recording().await {
                    tracing::debug!(participant_id = %self.participant.id, error = %e, "Incident recording not started");
                }
            }
            LivenessEvent::MatchFound(_) => {
                self.write_highlight(false).await;
                match self.recorder.stop_recording().await {
                    Ok(StopOutcome::NotRecording) => {}
                    Ok(outcome) => {
                        tracing::info!(participant_id = %self.participant.id, outcome = ?outcome, "Incident closed");
                    }
                    Err(e) => {
                        tracing::warn!(participant_id = %self.participant.id, error = %e, "Failed to store incident clip");
                    }
                }
            }
        }
    }

    async fn on_status(&self, status: SessionStatus) {
        *self.lock_status() = status;
        self.peers
            .apply_media_status(status.mic_status, status.camera_status)
            .await;
    }
}

async fn run_liveness_pump(
    inner: Weak<CoordinatorInner>,
    mut events: mpsc::UnboundedReceiver<LivenessEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if inner.closing.load(Ordering::SeqCst) || !inner.attached.load(Ordering::SeqCst) {
            return;
        }
        inner.on_liveness(event).await;
    }
}

async fn run_participant_watch(
    inner: Weak<CoordinatorInner>,
    mut record: watch::Receiver<Option<Participant>>,
) {
    while record.changed().await.is_ok() {
        let reference = record
            .borrow_and_update()
            .as_ref()
            .and_then(|p| p.reference_descriptor().map(<[f32]>::to_vec));
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if inner.closing.load(Ordering::SeqCst) {
            return;
        }
        inner.on_reference(reference).await;
    }
}

async fn run_presence(inner: Weak<CoordinatorInner>, mut updates: broadcast::Receiver<PeerUpdate>) {
    loop {
        let update = match updates.recv().await {
            Ok(update) => update,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "Presence listener lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        let Some(inner) = inner.upgrade() else {
            return;
        };
        match update {
            PeerUpdate::Entered => inner.log_presence(LogReason::EnteredExam).await,
            PeerUpdate::Exited => inner.log_presence(LogReason::LeftExam).await,
            PeerUpdate::Disconnected => {
                inner
                    .bus
                    .publish(Notice::warning("Connection to the session was lost"));
            }
            _ => {}
        }
    }
}

async fn run_status_watch(
    inner: Weak<CoordinatorInner>,
    mut status: watch::Receiver<SessionStatus>,
) {
    while status.changed().await.is_ok() {
        let current = *status.borrow_and_update();
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if inner.closing.load(Ordering::SeqCst) {
            return;
        }
        inner.on_status(current).await;
    }
}
