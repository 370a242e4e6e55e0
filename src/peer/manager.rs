use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;

use super::connection::{ConnectionState, PeerConnection};
use super::signaling::{
    CallControl, CallDirection, CallEvent, CallMetadata, IdentityEvent, MediaCall,
    SignalingBackend, SignalingIdentity,
};
use crate::error::Result;
use crate::media::{MediaStream, TrackKind};
use crate::model::{CourseId, ParticipantId, Role};

const UPDATE_BUFFER: usize = 256;
const IDENTITY_DRAIN: Duration = Duration::from_secs(1);

/// Notifications for the coordinator and UI.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerUpdate {
    Entered,
    Exited,
    Disconnected,
    RosterChanged,
    StreamsChanged(ParticipantId),
    ConnectionChanged {
        peer_id: ParticipantId,
        state: ConnectionState,
    },
}

struct RemoteStreamEntry {
    role: Role,
    stream: MediaStream,
    connection: Option<PeerConnection>,
}

/// Read-only snapshot of one remote participant.
///
/// `stream` shares its tracks with the managed stream and keeps the same id
/// for the whole session.
#[derive(Debug, Clone)]
pub struct RemoteStreamView {
    pub id: ParticipantId,
    pub role: Role,
    pub stream: MediaStream,
    pub call_id: Option<String>,
    pub direction: Option<CallDirection>,
    pub state: Option<ConnectionState>,
}

impl RemoteStreamView {
    pub fn is_connected(&self) -> bool {
        self.state.as_ref().map(|s| s.is_active()).unwrap_or(false)
    }
}

#[derive(Default)]
struct CallContext {
    local: Option<MediaStream>,
    course_id: Option<CourseId>,
    role: Option<Role>,
}

struct ManagerInner {
    self_id: ParticipantId,
    backend: Arc<dyn SignalingBackend>,
    identity: RwLock<Option<Arc<dyn SignalingIdentity>>>,
    remote: RwLock<HashMap<ParticipantId, RemoteStreamEntry>>,
    context: RwLock<CallContext>,
    epoch: AtomicU64,
    last_error: StdMutex<Option<String>>,
    updates: broadcast::Sender<PeerUpdate>,
    identity_task: StdMutex<Option<JoinHandle<()>>>,
}

/// The local participant's mesh of calls to everyone on its roster.
///
/// Owns the remote stream table; consumers only get [`RemoteStreamView`]s.
#[derive(Clone)]
pub struct PeerSessionManager {
    inner: Arc<ManagerInner>,
}

impl PeerSessionManager {
    pub fn new(self_id: impl Into<ParticipantId>, backend: Arc<dyn SignalingBackend>) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_BUFFER);
        Self {
            inner: Arc::new(ManagerInner {
                self_id: self_id.into(),
                backend,
                identity: RwLock::new(None),
                remote: RwLock::new(HashMap::new()),
                context: RwLock::new(CallContext::default()),
                epoch: AtomicU64::new(0),
                last_error: StdMutex::new(None),
                updates,
                identity_task: StdMutex::new(None),
            }),
        }
    }

    pub fn self_id(&self) -> &str {
        &self.inner.self_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerUpdate> {
        self.inner.updates.subscribe()
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.lock_error().clone()
    }

    /// Open the signaling identity for this participant. Idempotent.
    pub async fn open(&self) -> Result<()> {
        let mut identity = self.inner.identity.write().await;
        if identity.is_some() {
            return Ok(());
        }

        let (handle, events) = self.inner.backend.open_identity(&self.inner.self_id).await?;
        *identity = Some(handle);
        drop(identity);

        let task = tokio::spawn(run_identity_events(Arc::downgrade(&self.inner), events));
        *self
            .inner
            .identity_task
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(task);

        tracing::info!(participant_id = %self.inner.self_id, "Signaling identity opened");
        self.inner.connect_all().await;
        Ok(())
    }

    /// Replace the roster. Open calls are closed and placed again.
    pub async fn set_roster(&self, roster: Vec<(ParticipantId, Role)>) -> usize {
        self.inner.teardown_connections().await;
        {
            let mut remote = self.inner.remote.write().await;
            let mut next = HashMap::with_capacity(roster.len());
            for (id, role) in roster {
                if id == self.inner.self_id {
                    continue;
                }
                let entry = match remote.remove(&id) {
                    Some(mut entry) => {
                        entry.role = role;
                        entry
                    }
                    None => RemoteStreamEntry {
                        role,
                        stream: MediaStream::new(format!("remote-{}", id)),
                        connection: None,
                    },
                };
                next.insert(id, entry);
            }
            *remote = next;
        }
        self.inner.notify(PeerUpdate::RosterChanged);
        self.inner.connect_all().await
    }

    /// Set the local stream and call metadata, then (re)connect everyone.
    pub async fn set_call_context(&self, local: MediaStream, course_id: &str, role: Role) -> usize {
        self.inner.teardown_connections().await;
        {
            let mut context = self.inner.context.write().await;
            context.local = Some(local);
            context.course_id = Some(course_id.to_string());
            context.role = Some(role);
        }
        self.inner.connect_all().await
    }

    /// Drop the local stream and close every call.
    pub async fn clear_local_stream(&self) {
        self.inner.teardown_connections().await;
        self.inner.context.write().await.local = None;
    }

    /// Call every roster entry without an active connection.
    pub async fn connect_all(&self) -> usize {
        self.inner.connect_all().await
    }

    /// Gate the local tracks: audio follows `mic`, video follows `camera`.
    pub async fn apply_media_status(&self, mic: bool, camera: bool) {
        if let Some(local) = &self.inner.context.read().await.local {
            local.set_kind_enabled(TrackKind::Audio, mic);
            local.set_kind_enabled(TrackKind::Video, camera);
            tracing::debug!(mic, camera, "Applied local media status");
        }
    }

    pub async fn teardown_connections(&self) {
        self.inner.teardown_connections().await;
    }

    /// Close every call and destroy the signaling identity.
    pub async fn shutdown(&self) {
        self.inner.teardown_connections().await;
        let identity = self.inner.identity.write().await.take();
        if let Some(identity) = identity {
            identity.destroy().await;
            tracing::info!(participant_id = %self.inner.self_id, "Signaling identity destroyed");
        }

        let task = self
            .inner
            .identity_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            // Let the close event drain before returning.
            if tokio::time::timeout(IDENTITY_DRAIN, task).await.is_err() {
                tracing::debug!(participant_id = %self.inner.self_id, "Identity events still open");
            }
        }
    }

    pub async fn remote_streams(&self) -> Vec<RemoteStreamView> {
        let remote = self.inner.remote.read().await;
        let mut views: Vec<RemoteStreamView> = remote
            .iter()
            .map(|(id, entry)| view_of(id, entry))
            .collect();
        views.sort_by(|a, b| a.id.cmp(&b.id));
        views
    }

    pub async fn remote_stream(&self, id: &str) -> Option<RemoteStreamView> {
        self.inner
            .remote
            .read()
            .await
            .get(id)
            .map(|entry| view_of(id, entry))
    }
}

fn view_of(id: &str, entry: &RemoteStreamEntry) -> RemoteStreamView {
    RemoteStreamView {
        id: id.to_string(),
        role: entry.role,
        stream: entry.stream.clone(),
        call_id: entry.connection.as_ref().map(|c| c.call_id().to_string()),
        direction: entry.connection.as_ref().map(|c| c.direction()),
        state: entry.connection.as_ref().map(|c| c.state().clone()),
    }
}

/// The call initiated by the smaller participant id wins.
fn preferred_direction(self_id: &str, peer_id: &str) -> CallDirection {
    if self_id < peer_id {
        CallDirection::Outbound
    } else {
        CallDirection::Inbound
    }
}

impl ManagerInner {
    fn lock_error(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.last_error.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record_error(&self, message: String) {
        tracing::warn!(participant_id = %self.self_id, error = %message, "Peer call error");
        *self.lock_error() = Some(message);
    }

    fn notify(&self, update: PeerUpdate) {
        let _ = self.updates.send(update);
    }

    async fn connect_all(self: &Arc<Self>) -> usize {
        let Some(identity) = self.identity.read().await.clone() else {
            return 0;
        };

        let (local, metadata) = {
            let context = self.context.read().await;
            match (&context.local, &context.course_id, context.role) {
                (Some(local), Some(course_id), Some(role)) => (
                    local.clone(),
                    CallMetadata {
                        id: self.self_id.clone(),
                        role,
                        course_id: course_id.clone(),
                    },
                ),
                _ => return 0,
            }
        };

        let epoch = self.epoch.load(Ordering::SeqCst);
        let targets: Vec<ParticipantId> = {
            let remote = self.remote.read().await;
            let mut ids: Vec<ParticipantId> = remote
                .iter()
                .filter(|(_, entry)| !entry.connection.as_ref().map(|c| c.is_active()).unwrap_or(false))
                .map(|(id, _)| id.clone())
                .collect();
            ids.sort();
            ids
        };

        let mut placed = 0;
        for peer_id in targets {
            match identity.call(&peer_id, &local, metadata.clone()).await {
                Ok(call) => {
                    if self.attach(call, epoch).await {
                        placed += 1;
                    }
                }
                Err(e) => self.record_error(format!("Call to {} failed: {}", peer_id, e)),
            }
        }

        if placed > 0 {
            tracing::info!(participant_id = %self.self_id, placed, "Placed outbound calls");
        }
        placed
    }

    /// Attach a call to its roster entry. Rejected calls are closed.
    ///
    /// An inbound call from a participant missing from the roster gets a new
    /// entry so the caller is still answered.
    async fn attach(self: &Arc<Self>, call: MediaCall, epoch: u64) -> bool {
        let MediaCall {
            call_id,
            peer_id,
            direction,
            metadata,
            control,
            events,
        } = call;

        let mut replaced: Option<Arc<dyn CallControl>> = None;
        let mut admitted = false;
        let accepted = {
            let mut remote = self.remote.write().await;
            let current_epoch = self.epoch.load(Ordering::SeqCst);
            if current_epoch == epoch
                && direction == CallDirection::Inbound
                && !remote.contains_key(&peer_id)
            {
                let role = metadata.as_ref().map(|m| m.role).unwrap_or(Role::Student);
                tracing::info!(peer_id = %peer_id, ?role, "Admitting caller missing from the roster");
                remote.insert(
                    peer_id.clone(),
                    RemoteStreamEntry {
                        role,
                        stream: MediaStream::new(format!("remote-{}", peer_id)),
                        connection: None,
                    },
                );
                admitted = true;
            }
            match remote.get_mut(&peer_id) {
                _ if current_epoch != epoch => false,
                None => {
                    tracing::warn!(peer_id = %peer_id, "Call to participant outside the roster");
                    false
                }
                Some(entry) => {
                    let keep_new = match entry.connection.as_ref().filter(|c| c.is_active()) {
                        None => true,
                        Some(existing) => {
                            existing.direction() == direction
                                || direction == preferred_direction(&self.self_id, &peer_id)
                        }
                    };
                    if keep_new {
                        replaced = entry
                            .connection
                            .take()
                            .filter(|c| c.is_active())
                            .map(|c| c.control());
                        entry.connection = Some(PeerConnection::new(
                            call_id.clone(),
                            peer_id.clone(),
                            direction,
                            control.clone(),
                        ));
                    }
                    keep_new
                }
            }
        };

        if admitted {
            self.notify(PeerUpdate::RosterChanged);
        }
        if let Some(old) = replaced {
            tracing::debug!(peer_id = %peer_id, "Closing superseded call");
            old.close().await;
        }

        if !accepted {
            control.close().await;
            return false;
        }

        tracing::debug!(peer_id = %peer_id, call_id = %call_id, ?direction, "Call attached");
        self.notify(PeerUpdate::ConnectionChanged {
            peer_id: peer_id.clone(),
            state: ConnectionState::Connecting,
        });
        tokio::spawn(run_call_events(
            Arc::downgrade(self),
            epoch,
            peer_id,
            call_id,
            events,
        ));
        true
    }

    async fn accept_incoming(self: &Arc<Self>, call: MediaCall) {
        let epoch = self.epoch.load(Ordering::SeqCst);
        let local = self
            .context
            .read()
            .await
            .local
            .clone()
            .unwrap_or_else(MediaStream::empty);
        let control = call.control.clone();
        let peer_id = call.peer_id.clone();
        let call_id = call.call_id.clone();

        if !self.attach(call, epoch).await {
            return;
        }

        if let Err(e) = control.answer(&local).await {
            self.record_error(format!("Answering {} failed: {}", peer_id, e));
            let mut remote = self.remote.write().await;
            if let Some(conn) = remote
                .get_mut(&peer_id)
                .and_then(|entry| entry.connection.as_mut())
                .filter(|c| c.call_id() == call_id)
            {
                conn.fail(e.to_string());
            }
        }
    }

    /// Apply one call event, ignoring events of stale or replaced calls.
    async fn apply_call_event(&self, epoch: u64, peer_id: &str, call_id: &str, event: CallEvent) {
        if self.epoch.load(Ordering::SeqCst) != epoch {
            tracing::debug!(peer_id = %peer_id, call_id = %call_id, "Ignoring event after teardown");
            return;
        }

        let (state, stream_changed) = {
            let mut remote = self.remote.write().await;
            let Some(entry) = remote.get_mut(peer_id) else {
                return;
            };
            let Some(conn) = entry
                .connection
                .as_mut()
                .filter(|c| c.call_id() == call_id)
            else {
                return;
            };
            if !conn.apply(&event) {
                return;
            }
            let state = conn.state().clone();

            let mut stream_changed = false;
            match &event {
                CallEvent::Stream(incoming) => {
                    entry.stream.merge_from(incoming);
                    stream_changed = true;
                }
                CallEvent::Close => entry.connection = None,
                CallEvent::Error(_) => {}
            }
            (state, stream_changed)
        };

        if let CallEvent::Error(reason) = &event {
            self.record_error(format!("Call with {} failed: {}", peer_id, reason));
        }
        if stream_changed {
            self.notify(PeerUpdate::StreamsChanged(peer_id.to_string()));
        }
        self.notify(PeerUpdate::ConnectionChanged {
            peer_id: peer_id.to_string(),
            state,
        });
    }

    async fn teardown_connections(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let controls: Vec<Arc<dyn CallControl>> = {
            let mut remote = self.remote.write().await;
            remote
                .values_mut()
                .filter_map(|entry| entry.connection.take())
                .map(|conn| conn.control())
                .collect()
        };

        if controls.is_empty() {
            return;
        }
        tracing::info!(
            participant_id = %self.self_id,
            count = controls.len(),
            "Closing peer connections"
        );
        for control in controls {
            control.close().await;
        }
    }
}

async fn run_identity_events(
    inner: Weak<ManagerInner>,
    mut events: mpsc::UnboundedReceiver<IdentityEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        match event {
            IdentityEvent::Open => {
                tracing::info!(participant_id = %inner.self_id, "Entered session");
                inner.notify(PeerUpdate::Entered);
            }
            IdentityEvent::Close => {
                tracing::info!(participant_id = %inner.self_id, "Exited session");
                inner.notify(PeerUpdate::Exited);
            }
            IdentityEvent::Disconnected => {
                tracing::warn!(participant_id = %inner.self_id, "Signaling disconnected");
                inner.notify(PeerUpdate::Disconnected);
            }
            IdentityEvent::Error(message) => {
                tracing::error!(participant_id = %inner.self_id, error = %message, "Signaling identity error");
                *inner.lock_error() = Some(message);
            }
            IdentityEvent::Call(call) => {
                tracing::info!(
                    participant_id = %inner.self_id,
                    caller = %call.peer_id,
                    call_id = %call.call_id,
                    "Incoming call"
                );
                inner.accept_incoming(call).await;
            }
        }
    }
}

async fn run_call_events(
    inner: Weak<ManagerInner>,
    epoch: u64,
    peer_id: ParticipantId,
    call_id: String,
    mut events: mpsc::UnboundedReceiver<CallEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let terminal = !matches!(event, CallEvent::Stream(_));
        inner.apply_call_event(epoch, &peer_id, &call_id, event).await;
        if terminal {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::LoopbackNetwork;
    use crate::testing::test_stream;
    use std::future::Future;

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    async fn joined(
        network: &LoopbackNetwork,
        id: &str,
        role: Role,
        roster: Vec<(&str, Role)>,
    ) -> PeerSessionManager {
        let manager = PeerSessionManager::new(id, Arc::new(network.clone()));
        manager.open().await.unwrap();
        manager
            .set_roster(roster.into_iter().map(|(id, r)| (id.to_string(), r)).collect())
            .await;
        manager.set_call_context(test_stream(id), "c1", role).await;
        manager
    }

    async fn streaming(manager: &PeerSessionManager, peer: &str) -> bool {
        manager
            .remote_stream(peer)
            .await
            .map(|v| v.state == Some(ConnectionState::Streaming))
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn test_student_and_proctor_connect() {
        let network = LoopbackNetwork::new();
        let proctor = joined(&network, "p1", Role::Proctor, vec![("s1", Role::Student)]).await;
        let student = joined(&network, "s1", Role::Student, vec![("p1", Role::Proctor)]).await;

        eventually(|| streaming(&student, "p1")).await;
        eventually(|| streaming(&proctor, "s1")).await;

        let view = student.remote_stream("p1").await.unwrap();
        assert_eq!(view.stream.id(), "remote-p1");
        assert_eq!(view.stream.tracks_of(TrackKind::Audio).count(), 1);
        assert_eq!(view.stream.tracks_of(TrackKind::Video).count(), 1);
        assert_eq!(view.stream.first_of(TrackKind::Video).unwrap().id(), "p1-video");
    }

    #[tokio::test]
    async fn test_glare_keeps_single_call() {
        let network = LoopbackNetwork::new();
        let a = PeerSessionManager::new("a", Arc::new(network.clone()));
        let b = PeerSessionManager::new("b", Arc::new(network.clone()));
        a.open().await.unwrap();
        b.open().await.unwrap();
        a.set_roster(vec![("b".into(), Role::Proctor)]).await;
        b.set_roster(vec![("a".into(), Role::Proctor)]).await;

        let (_, _) = tokio::join!(
            a.set_call_context(test_stream("a"), "c1", Role::Proctor),
            b.set_call_context(test_stream("b"), "c1", Role::Proctor)
        );

        eventually(|| streaming(&a, "b")).await;
        eventually(|| streaming(&b, "a")).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let on_a = a.remote_stream("b").await.unwrap();
        let on_b = b.remote_stream("a").await.unwrap();
        assert_eq!(on_a.call_id, on_b.call_id);
        assert_eq!(on_a.direction, Some(CallDirection::Outbound));
        assert_eq!(on_b.direction, Some(CallDirection::Inbound));
    }

    #[tokio::test]
    async fn test_failed_call_does_not_affect_others() {
        let network = LoopbackNetwork::new();
        let _proctor = joined(&network, "p1", Role::Proctor, vec![("s1", Role::Student)]).await;
        let student = joined(
            &network,
            "s1",
            Role::Student,
            vec![("ghost", Role::Proctor), ("p1", Role::Proctor)],
        )
        .await;

        eventually(|| streaming(&student, "p1")).await;
        assert!(student.last_error().unwrap().contains("ghost"));
        assert!(!student.remote_stream("ghost").await.unwrap().is_connected());
    }

    #[tokio::test]
    async fn test_call_from_outside_roster_is_answered() {
        let network = LoopbackNetwork::new();
        let proctor = joined(&network, "p1", Role::Proctor, vec![]).await;

        let late = PeerSessionManager::new("s9", Arc::new(network.clone()));
        late.open().await.unwrap();
        late.set_roster(vec![("p1".into(), Role::Proctor)]).await;
        late.set_call_context(test_stream("s9"), "c1", Role::Student).await;

        eventually(|| streaming(&late, "p1")).await;
        let view = late.remote_stream("p1").await.unwrap();
        assert_eq!(view.stream.tracks_of(TrackKind::Audio).count(), 1);
        assert_eq!(view.stream.tracks_of(TrackKind::Video).count(), 1);

        let admitted = proctor.remote_stream("s9").await.unwrap();
        assert_eq!(admitted.role, Role::Student);
        assert_eq!(admitted.direction, Some(CallDirection::Inbound));
    }

    #[tokio::test]
    async fn test_media_status_gates_local_tracks() {
        let network = LoopbackNetwork::new();
        let manager = PeerSessionManager::new("s1", Arc::new(network));
        let local = test_stream("s1");
        manager.set_call_context(local.clone(), "c1", Role::Student).await;

        manager.apply_media_status(false, true).await;
        assert!(!local.first_of(TrackKind::Audio).unwrap().is_enabled());
        assert!(local.first_of(TrackKind::Video).unwrap().is_enabled());

        manager.apply_media_status(true, false).await;
        assert!(local.first_of(TrackKind::Audio).unwrap().is_enabled());
        assert!(!local.first_of(TrackKind::Video).unwrap().is_enabled());
    }

    #[tokio::test]
    async fn test_teardown_clears_connections_and_keeps_streams() {
        let network = LoopbackNetwork::new();
        let _proctor = joined(&network, "p1", Role::Proctor, vec![("s1", Role::Student)]).await;
        let student = joined(&network, "s1", Role::Student, vec![("p1", Role::Proctor)]).await;
        eventually(|| streaming(&student, "p1")).await;

        student.teardown_connections().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let view = student.remote_stream("p1").await.unwrap();
        assert!(view.state.is_none());
        assert_eq!(view.stream.id(), "remote-p1");
    }

    #[tokio::test]
    async fn test_open_and_shutdown_emit_updates() {
        let network = LoopbackNetwork::new();
        let manager = PeerSessionManager::new("s1", Arc::new(network.clone()));
        let mut updates = manager.subscribe();

        manager.open().await.unwrap();
        assert_eq!(updates.recv().await.unwrap(), PeerUpdate::Entered);

        manager.shutdown().await;
        assert_eq!(updates.recv().await.unwrap(), PeerUpdate::Exited);
        assert!(network.online().is_empty());
    }
}
