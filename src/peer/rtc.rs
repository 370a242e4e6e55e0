//! Signaling backend built on webrtc-rs, brokered by the relay over a
//! WebSocket (`{SIGNALING_URL}/{id}`).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use webrtc::api::API;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};
use webrtc::track::track_remote::TrackRemote;
use webrtc::util::Marshal;

use super::signaling::{
    CallControl, CallDirection, CallEvent, CallMetadata, IdentityEvent, MediaCall,
    SignalingBackend, SignalingIdentity,
};
use super::webrtc_utils::{codec_capability, create_webrtc_api, get_ice_servers, track_kind};
use crate::config::SignalingConfig;
use crate::error::{ProctorError, Result};
use crate::media::{random_id, MediaStream, MediaTrack};
use crate::relay::SignalMessage;

const OPEN_TIMEOUT: Duration = Duration::from_secs(10);
const WRITER_DRAIN: Duration = Duration::from_secs(2);

type WsReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;
type CallTable = RwLock<HashMap<String, Arc<RtcCall>>>;

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct WebRtcSignaling {
    url: String,
    api: Arc<API>,
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcSignaling {
    pub fn new(config: &SignalingConfig) -> Result<Self> {
        Ok(Self {
            url: config.url.trim_end_matches('/').to_string(),
            api: create_webrtc_api()?,
            ice_servers: get_ice_servers(config),
        })
    }
}

#[async_trait]
impl SignalingBackend for WebRtcSignaling {
    async fn open_identity(
        &self,
        id: &str,
    ) -> Result<(Arc<dyn SignalingIdentity>, mpsc::UnboundedReceiver<IdentityEvent>)> {
        let url = format!("{}/{}", self.url, urlencoding::encode(id));
        let (ws_stream, _) = connect_async(&url)
            .await
            .map_err(|e| ProctorError::signaling(format!("Failed to connect to {}: {}", url, e)))?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        tokio::time::timeout(OPEN_TIMEOUT, wait_for_open(&mut ws_receiver))
            .await
            .map_err(|_| ProctorError::signaling("Timed out waiting for relay"))??;

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<SignalMessage>();
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let writer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    message = out_rx.recv() => match message {
                        Some(message) => {
                            if !send_ws(&mut ws_sender, &message).await {
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = shutdown_rx.changed() => {
                        while let Ok(message) = out_rx.try_recv() {
                            send_ws(&mut ws_sender, &message).await;
                        }
                        break;
                    }
                }
            }
            let _ = ws_sender.close().await;
        });

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let _ = events_tx.send(IdentityEvent::Open);

        let ctx = Arc::new(RtcContext {
            self_id: id.to_string(),
            api: self.api.clone(),
            ice_servers: self.ice_servers.clone(),
            outgoing: out_tx,
            calls: Arc::new(RwLock::new(HashMap::new())),
            events: StdMutex::new(Some(events_tx)),
        });
        let reader = tokio::spawn(run_reader(ctx.clone(), ws_receiver));

        tracing::info!(identity = %id, url = %url, "Signaling identity open on relay");
        let identity = RtcIdentity {
            ctx,
            reader: StdMutex::new(Some(reader)),
            writer: StdMutex::new(Some(writer)),
            shutdown: shutdown_tx,
        };
        Ok((Arc::new(identity), events_rx))
    }
}

async fn send_ws<S>(sink: &mut S, message: &SignalMessage) -> bool
where
    S: futures::Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let text = match serde_json::to_string(message) {
        Ok(text) => text,
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize signaling message");
            return true;
        }
    };
    if let Err(e) = sink.send(Message::Text(text)).await {
        tracing::error!(error = %e, "Failed to send signaling message");
        return false;
    }
    true
}

async fn wait_for_open(ws_receiver: &mut WsReader) -> Result<()> {
    while let Some(result) = ws_receiver.next().await {
        let message =
            result.map_err(|e| ProctorError::signaling(format!("Relay connection failed: {}", e)))?;
        let Message::Text(text) = message else {
            continue;
        };
        match serde_json::from_str::<SignalMessage>(&text)? {
            SignalMessage::Open { .. } => return Ok(()),
            SignalMessage::IdTaken { id } => return Err(ProctorError::IdentityTaken(id)),
            other => tracing::debug!(message = ?other, "Ignoring message before open"),
        }
    }
    Err(ProctorError::signaling("Relay closed the connection"))
}

struct RtcContext {
    self_id: String,
    api: Arc<API>,
    ice_servers: Vec<RTCIceServer>,
    outgoing: mpsc::UnboundedSender<SignalMessage>,
    calls: Arc<CallTable>,
    events: StdMutex<Option<mpsc::UnboundedSender<IdentityEvent>>>,
}

impl RtcContext {
    fn emit(&self, event: IdentityEvent) {
        if let Some(events) = lock(&self.events).as_ref() {
            let _ = events.send(event);
        }
    }

    /// Send the final events and release the identity channel.
    fn close_events(&self, disconnected: bool) {
        if let Some(events) = lock(&self.events).take() {
            if disconnected {
                let _ = events.send(IdentityEvent::Disconnected);
            }
            let _ = events.send(IdentityEvent::Close);
        }
    }

    async fn call(&self, call_id: &str) -> Option<Arc<RtcCall>> {
        self.calls.read().await.get(call_id).cloned()
    }

    async fn finish_all(&self, notify_remote: bool) {
        let calls: Vec<Arc<RtcCall>> = self.calls.write().await.drain().map(|(_, c)| c).collect();
        for call in calls {
            call.finish(CallEvent::Close, notify_remote).await;
        }
    }

    async fn handle(&self, message: SignalMessage) -> Result<()> {
        match message {
            SignalMessage::Offer {
                from,
                call_id,
                sdp,
                metadata,
                ..
            } => self.handle_offer(from, call_id, sdp, metadata).await,
            SignalMessage::Answer { call_id, sdp, .. } => {
                let Some(call) = self.call(&call_id).await else {
                    return Ok(());
                };
                let answer = RTCSessionDescription::answer(sdp)?;
                call.pc.set_remote_description(answer).await?;
                call.flush_pending_candidates().await;
                tracing::debug!(call_id = %call_id, "Applied remote answer");
                Ok(())
            }
            SignalMessage::IceCandidate {
                call_id,
                candidate,
                sdp_mid,
                sdp_mline_index,
                ..
            } => {
                if let Some(call) = self.call(&call_id).await {
                    call.add_remote_candidate(RTCIceCandidateInit {
                        candidate,
                        sdp_mid,
                        sdp_mline_index,
                        username_fragment: None,
                    })
                    .await?;
                }
                Ok(())
            }
            SignalMessage::Hangup { call_id, .. } => {
                if let Some(call) = self.call(&call_id).await {
                    call.finish(CallEvent::Close, false).await;
                }
                Ok(())
            }
            SignalMessage::PeerUnavailable { peer_id, call_id } => {
                if let Some(call) = match call_id {
                    Some(call_id) => self.call(&call_id).await,
                    None => None,
                } {
                    let reason = ProctorError::PeerUnavailable(peer_id).to_string();
                    call.finish(CallEvent::Error(reason), false).await;
                }
                Ok(())
            }
            SignalMessage::Error { message } => {
                self.emit(IdentityEvent::Error(message));
                Ok(())
            }
            SignalMessage::Open { .. } | SignalMessage::IdTaken { .. } => Ok(()),
        }
    }

    async fn handle_offer(
        &self,
        from: String,
        call_id: String,
        sdp: String,
        metadata: Option<CallMetadata>,
    ) -> Result<()> {
        let (call, events) = RtcCall::create(self, call_id.clone(), from.clone()).await?;
        let offer = RTCSessionDescription::offer(sdp)?;
        if let Err(e) = call.pc.set_remote_description(offer).await {
            call.finish(CallEvent::Error(e.to_string()), true).await;
            return Err(e.into());
        }

        self.calls.write().await.insert(call_id.clone(), call.clone());
        self.emit(IdentityEvent::Call(MediaCall {
            call_id,
            peer_id: from,
            direction: CallDirection::Inbound,
            metadata,
            control: call,
            events,
        }));
        Ok(())
    }
}

async fn run_reader(ctx: Arc<RtcContext>, mut ws_receiver: WsReader) {
    while let Some(result) = ws_receiver.next().await {
        let text = match result {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::warn!(identity = %ctx.self_id, error = %e, "Relay connection error");
                ctx.emit(IdentityEvent::Error(e.to_string()));
                break;
            }
        };

        let message = match serde_json::from_str::<SignalMessage>(&text) {
            Ok(message) => message,
            Err(e) => {
                tracing::error!(error = %e, raw_message = %text, "Failed to parse relay message");
                continue;
            }
        };

        if let Err(e) = ctx.handle(message).await {
            tracing::warn!(identity = %ctx.self_id, error = %e, "Failed to handle relay message");
        }
    }

    tracing::info!(identity = %ctx.self_id, "Relay connection closed");
    ctx.finish_all(false).await;
    ctx.close_events(true);
}

struct RtcIdentity {
    ctx: Arc<RtcContext>,
    reader: StdMutex<Option<JoinHandle<()>>>,
    writer: StdMutex<Option<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl RtcIdentity {
    async fn place_call(
        &self,
        call: &Arc<RtcCall>,
        local: &MediaStream,
        metadata: CallMetadata,
    ) -> Result<()> {
        call.add_local_stream(local).await?;
        let offer = call.pc.create_offer(None).await?;
        call.pc.set_local_description(offer.clone()).await?;

        self.ctx
            .outgoing
            .send(SignalMessage::Offer {
                from: String::new(),
                to: call.peer_id.clone(),
                call_id: call.call_id.clone(),
                sdp: offer.sdp,
                metadata: Some(metadata),
            })
            .map_err(|_| ProctorError::IdentityNotOpen(self.ctx.self_id.clone()))
    }
}

#[async_trait]
impl SignalingIdentity for RtcIdentity {
    fn id(&self) -> &str {
        &self.ctx.self_id
    }

    async fn call(
        &self,
        peer_id: &str,
        local: &MediaStream,
        metadata: CallMetadata,
    ) -> Result<MediaCall> {
        let call_id = format!("mc_{}", random_id(12));
        let (call, events) = RtcCall::create(&self.ctx, call_id.clone(), peer_id.to_string()).await?;
        self.ctx
            .calls
            .write()
            .await
            .insert(call_id.clone(), call.clone());

        if let Err(e) = self.place_call(&call, local, metadata).await {
            call.finish(CallEvent::Error(e.to_string()), false).await;
            return Err(ProctorError::CallFailed {
                peer_id: peer_id.to_string(),
                reason: e.to_string(),
            });
        }

        tracing::info!(peer_id = %peer_id, call_id = %call_id, "Sent offer");
        Ok(MediaCall {
            call_id,
            peer_id: peer_id.to_string(),
            direction: CallDirection::Outbound,
            metadata: None,
            control: call,
            events,
        })
    }

    async fn destroy(&self) {
        self.ctx.finish_all(true).await;

        let _ = self.shutdown.send(true);
        let writer = lock(&self.writer).take();
        if let Some(writer) = writer {
            let _ = tokio::time::timeout(WRITER_DRAIN, writer).await;
        }
        if let Some(reader) = lock(&self.reader).take() {
            reader.abort();
        }

        self.ctx.close_events(false);
    }
}

/// One webrtc peer connection and its signaling state.
struct RtcCall {
    call_id: String,
    peer_id: String,
    pc: Arc<RTCPeerConnection>,
    outgoing: mpsc::UnboundedSender<SignalMessage>,
    events: mpsc::UnboundedSender<CallEvent>,
    calls: Weak<CallTable>,
    pending_candidates: Mutex<Vec<RTCIceCandidateInit>>,
    remote: StdMutex<MediaStream>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl RtcCall {
    async fn create(
        ctx: &RtcContext,
        call_id: String,
        peer_id: String,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<CallEvent>)> {
        let config = RTCConfiguration {
            ice_servers: ctx.ice_servers.clone(),
            ..Default::default()
        };
        let pc = Arc::new(ctx.api.new_peer_connection(config).await?);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let call = Arc::new(Self {
            remote: StdMutex::new(MediaStream::new(format!("{}-{}", peer_id, call_id))),
            call_id,
            peer_id,
            pc,
            outgoing: ctx.outgoing.clone(),
            events: events_tx,
            calls: Arc::downgrade(&ctx.calls),
            pending_candidates: Mutex::new(Vec::new()),
            tasks: StdMutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        call.install_handlers();
        Ok((call, events_rx))
    }

    fn install_handlers(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let weak = weak.clone();
                Box::pin(async move {
                    let (Some(call), Some(candidate)) = (weak.upgrade(), candidate) else {
                        return;
                    };
                    match candidate.to_json() {
                        Ok(init) => {
                            let _ = call.outgoing.send(SignalMessage::IceCandidate {
                                from: String::new(),
                                to: call.peer_id.clone(),
                                call_id: call.call_id.clone(),
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                            });
                        }
                        Err(e) => tracing::warn!(error = %e, "Failed to encode ICE candidate"),
                    }
                })
            }));

        let weak = Arc::downgrade(self);
        self.pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            if let Some(call) = weak.upgrade() {
                call.attach_remote_track(track);
            }
            Box::pin(async {})
        }));

        let weak = Arc::downgrade(self);
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let weak = weak.clone();
                Box::pin(async move {
                    let Some(call) = weak.upgrade() else {
                        return;
                    };
                    tracing::debug!(peer_id = %call.peer_id, state = %state, "Peer connection state");
                    let event = match state {
                        RTCPeerConnectionState::Failed => {
                            CallEvent::Error("ICE connection failed".to_string())
                        }
                        RTCPeerConnectionState::Closed => CallEvent::Close,
                        _ => return,
                    };
                    // Closing from inside the callback would wait on itself.
                    tokio::spawn(async move { call.finish(event, true).await });
                })
            }));
    }

    fn attach_remote_track(&self, track: Arc<TrackRemote>) {
        let Some(kind) = track_kind(track.kind()) else {
            return;
        };
        let media = MediaTrack::new(track.id(), kind);
        let stream = {
            let mut remote = lock(&self.remote);
            remote.replace_kind(media.clone());
            remote.clone()
        };

        let track_id = media.id().to_string();
        let reader = tokio::spawn(async move {
            while let Ok((packet, _)) = track.read_rtp().await {
                match packet.marshal() {
                    Ok(bytes) => {
                        media.push(bytes);
                    }
                    Err(e) => tracing::debug!(track_id = %track_id, error = %e, "Dropping RTP packet"),
                }
            }
        });
        lock(&self.tasks).push(reader);

        tracing::info!(peer_id = %self.peer_id, kind = %kind, "Remote track received");
        let _ = self.events.send(CallEvent::Stream(stream));
    }

    async fn add_local_stream(&self, local: &MediaStream) -> Result<()> {
        for track in local.tracks() {
            let rtp_track = Arc::new(TrackLocalStaticRTP::new(
                codec_capability(track.kind()),
                track.id().to_string(),
                local.id().to_string(),
            ));
            let sender = self
                .pc
                .add_track(Arc::clone(&rtp_track) as Arc<dyn TrackLocal + Send + Sync>)
                .await?;

            let rtcp = tokio::spawn(async move { while sender.read_rtcp().await.is_ok() {} });

            let mut packets = track.subscribe();
            let forwarder = tokio::spawn(async move {
                loop {
                    match packets.recv().await {
                        Ok(packet) => {
                            if let Err(e) = rtp_track.write(&packet).await {
                                tracing::trace!(error = %e, "Local RTP write failed");
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            });

            lock(&self.tasks).extend([rtcp, forwarder]);
        }
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()> {
        if self.pc.remote_description().await.is_none() {
            let mut pending = self.pending_candidates.lock().await;
            pending.push(candidate);
            tracing::debug!(call_id = %self.call_id, queue_size = pending.len(), "ICE candidate queued");
            return Ok(());
        }
        self.pc.add_ice_candidate(candidate).await?;
        Ok(())
    }

    async fn flush_pending_candidates(&self) {
        let candidates: Vec<RTCIceCandidateInit> =
            self.pending_candidates.lock().await.drain(..).collect();
        if candidates.is_empty() {
            return;
        }
        tracing::debug!(call_id = %self.call_id, count = candidates.len(), "Flushing queued ICE candidates");
        for candidate in candidates {
            if let Err(e) = self.pc.add_ice_candidate(candidate).await {
                tracing::error!(call_id = %self.call_id, error = %e, "Failed to add queued ICE candidate");
            }
        }
    }

    /// Tear the call down once, then report `event`.
    async fn finish(&self, event: CallEvent, notify_remote: bool) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if notify_remote {
            let _ = self.outgoing.send(SignalMessage::Hangup {
                from: String::new(),
                to: self.peer_id.clone(),
                call_id: self.call_id.clone(),
            });
        }
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        if let Err(e) = self.pc.close().await {
            tracing::debug!(call_id = %self.call_id, error = %e, "Peer connection close failed");
        }
        if let Some(calls) = self.calls.upgrade() {
            calls.write().await.remove(&self.call_id);
        }
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl CallControl for RtcCall {
    async fn answer(&self, local: &MediaStream) -> Result<()> {
        self.add_local_stream(local).await?;
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;

        self.outgoing
            .send(SignalMessage::Answer {
                from: String::new(),
                to: self.peer_id.clone(),
                call_id: self.call_id.clone(),
                sdp: answer.sdp,
            })
            .map_err(|_| ProctorError::signaling("Relay connection closed"))?;

        self.flush_pending_candidates().await;
        tracing::info!(peer_id = %self.peer_id, call_id = %self.call_id, "Sent answer");
        Ok(())
    }

    async fn close(&self) {
        self.finish(CallEvent::Close, true).await;
    }
}
