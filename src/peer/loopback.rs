//! In-process signaling network. Identities opened on the same
//! [`LoopbackNetwork`] can call each other without any transport, so
//! several participants can share one process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::signaling::{
    CallControl, CallDirection, CallEvent, CallMetadata, IdentityEvent, MediaCall,
    SignalingBackend, SignalingIdentity,
};
use crate::error::{ProctorError, Result};
use crate::media::{random_id, MediaStream};

type Registry = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<IdentityEvent>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    identities: Registry,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn online(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.identities).keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Drop an identity as if its transport went away.
    pub fn disconnect(&self, id: &str) {
        if let Some(events) = lock(&self.identities).remove(id) {
            let _ = events.send(IdentityEvent::Disconnected);
            let _ = events.send(IdentityEvent::Close);
        }
    }
}

#[async_trait]
impl SignalingBackend for LoopbackNetwork {
    async fn open_identity(
        &self,
        id: &str,
    ) -> Result<(Arc<dyn SignalingIdentity>, mpsc::UnboundedReceiver<IdentityEvent>)> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        {
            let mut identities = lock(&self.identities);
            if identities.contains_key(id) {
                return Err(ProctorError::IdentityTaken(id.to_string()));
            }
            let _ = events_tx.send(IdentityEvent::Open);
            identities.insert(id.to_string(), events_tx);
        }

        tracing::debug!(identity = %id, "Loopback identity open");
        let identity = LoopbackIdentity {
            id: id.to_string(),
            identities: self.identities.clone(),
            links: Mutex::new(Vec::new()),
        };
        Ok((Arc::new(identity), events_rx))
    }
}

struct LoopbackIdentity {
    id: String,
    identities: Registry,
    links: Mutex<Vec<Arc<CallLink>>>,
}

#[async_trait]
impl SignalingIdentity for LoopbackIdentity {
    fn id(&self) -> &str {
        &self.id
    }

    async fn call(
        &self,
        peer_id: &str,
        local: &MediaStream,
        metadata: CallMetadata,
    ) -> Result<MediaCall> {
        let target = lock(&self.identities)
            .get(peer_id)
            .cloned()
            .ok_or_else(|| ProctorError::PeerUnavailable(peer_id.to_string()))?;

        let call_id = format!("mc_{}", random_id(12));
        let (caller_tx, caller_rx) = mpsc::unbounded_channel();
        let (callee_tx, callee_rx) = mpsc::unbounded_channel();

        let link = Arc::new(CallLink {
            caller_local: local.clone(),
            caller_events: caller_tx,
            callee_events: callee_tx,
            closed: AtomicBool::new(false),
        });
        lock(&self.links).push(link.clone());

        let inbound = MediaCall {
            call_id: call_id.clone(),
            peer_id: self.id.clone(),
            direction: CallDirection::Inbound,
            metadata: Some(metadata),
            control: Arc::new(LoopbackControl {
                link: link.clone(),
                side: Side::Callee,
            }),
            events: callee_rx,
        };
        target
            .send(IdentityEvent::Call(inbound))
            .map_err(|_| ProctorError::PeerUnavailable(peer_id.to_string()))?;

        Ok(MediaCall {
            call_id,
            peer_id: peer_id.to_string(),
            direction: CallDirection::Outbound,
            metadata: None,
            control: Arc::new(LoopbackControl {
                link,
                side: Side::Caller,
            }),
            events: caller_rx,
        })
    }

    async fn destroy(&self) {
        let links: Vec<Arc<CallLink>> = lock(&self.links).drain(..).collect();
        for link in links {
            link.close();
        }
        if let Some(events) = lock(&self.identities).remove(&self.id) {
            let _ = events.send(IdentityEvent::Close);
        }
        tracing::debug!(identity = %self.id, "Loopback identity destroyed");
    }
}

struct CallLink {
    caller_local: MediaStream,
    caller_events: mpsc::UnboundedSender<CallEvent>,
    callee_events: mpsc::UnboundedSender<CallEvent>,
    closed: AtomicBool,
}

impl CallLink {
    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.caller_events.send(CallEvent::Close);
            let _ = self.callee_events.send(CallEvent::Close);
        }
    }
}

#[derive(Clone, Copy)]
enum Side {
    Caller,
    Callee,
}

struct LoopbackControl {
    link: Arc<CallLink>,
    side: Side,
}

#[async_trait]
impl CallControl for LoopbackControl {
    async fn answer(&self, local: &MediaStream) -> Result<()> {
        if matches!(self.side, Side::Caller) {
            return Err(ProctorError::internal("Outbound calls cannot be answered"));
        }
        if self.link.closed.load(Ordering::SeqCst) {
            return Err(ProctorError::CallFailed {
                peer_id: String::new(),
                reason: "call already closed".into(),
            });
        }
        let _ = self
            .link
            .callee_events
            .send(CallEvent::Stream(self.link.caller_local.clone()));
        let _ = self.link.caller_events.send(CallEvent::Stream(local.clone()));
        Ok(())
    }

    async fn close(&self) {
        self.link.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Role;
    use crate::testing::test_stream;

    fn metadata(id: &str) -> CallMetadata {
        CallMetadata {
            id: id.into(),
            role: Role::Student,
            course_id: "c1".into(),
        }
    }

    #[tokio::test]
    async fn test_duplicate_identity_rejected() {
        let network = LoopbackNetwork::new();
        let (_a, mut events) = network.open_identity("a").await.unwrap();
        assert!(matches!(events.recv().await, Some(IdentityEvent::Open)));
        assert!(matches!(
            network.open_identity("a").await,
            Err(ProctorError::IdentityTaken(_))
        ));
    }

    #[tokio::test]
    async fn test_call_and_answer_exchange_streams() {
        let network = LoopbackNetwork::new();
        let (a, _a_events) = network.open_identity("a").await.unwrap();
        let (_b, mut b_events) = network.open_identity("b").await.unwrap();
        let _ = b_events.recv().await;

        let mut outbound = a.call("b", &test_stream("a"), metadata("a")).await.unwrap();
        let mut inbound = match b_events.recv().await {
            Some(IdentityEvent::Call(call)) => call,
            other => panic!("expected call, got {:?}", other),
        };
        assert_eq!(inbound.peer_id, "a");
        assert_eq!(inbound.metadata.as_ref().unwrap().course_id, "c1");

        inbound.control.answer(&test_stream("b")).await.unwrap();
        match outbound.events.recv().await {
            Some(CallEvent::Stream(stream)) => assert_eq!(stream.id(), "b"),
            other => panic!("unexpected {:?}", other),
        }
        match inbound.events.recv().await {
            Some(CallEvent::Stream(stream)) => assert_eq!(stream.id(), "a"),
            other => panic!("unexpected {:?}", other),
        }

        outbound.control.close().await;
        assert!(matches!(inbound.events.recv().await, Some(CallEvent::Close)));
    }

    #[tokio::test]
    async fn test_call_to_offline_peer_fails() {
        let network = LoopbackNetwork::new();
        let (a, _events) = network.open_identity("a").await.unwrap();
        let err = a.call("ghost", &test_stream("a"), metadata("a")).await.err();
        assert!(matches!(err, Some(ProctorError::PeerUnavailable(id)) if id == "ghost"));
    }
}
