use std::collections::HashMap;

use tokio::sync::{mpsc, RwLock};
use warp::ws::Message;

use super::message::SignalMessage;
use crate::error::{ProctorError, Result};

/// Registry of connected identities and their outgoing queues.
#[derive(Default)]
pub struct RelayHub {
    peers: RwLock<HashMap<String, mpsc::UnboundedSender<Message>>>,
}

impl RelayHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, id: &str, sender: mpsc::UnboundedSender<Message>) -> Result<()> {
        let mut peers = self.peers.write().await;
        if peers.get(id).map(|s| !s.is_closed()).unwrap_or(false) {
            return Err(ProctorError::IdentityTaken(id.to_string()));
        }
        peers.insert(id.to_string(), sender);
        tracing::info!(identity = %id, online = peers.len(), "Identity registered");
        Ok(())
    }

    /// Remove `id` if it is still registered to `sender`. A connection that
    /// was replaced leaves the newer registration alone.
    pub async fn unregister(&self, id: &str, sender: &mpsc::UnboundedSender<Message>) {
        let mut peers = self.peers.write().await;
        let owned = peers
            .get(id)
            .map(|current| current.same_channel(sender))
            .unwrap_or(false);
        if owned {
            peers.remove(id);
            tracing::info!(identity = %id, online = peers.len(), "Identity unregistered");
        } else {
            tracing::debug!(identity = %id, "Connection closed after its identity was replaced");
        }
    }

    pub async fn online(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.peers.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn send_to(&self, id: &str, message: &SignalMessage) -> Result<bool> {
        let text = serde_json::to_string(message)?;
        let peers = self.peers.read().await;
        Ok(peers
            .get(id)
            .map(|sender| sender.send(Message::text(text)).is_ok())
            .unwrap_or(false))
    }

    /// Forward a message from `from` to its destination. Undeliverable
    /// messages are answered with `PeerUnavailable`.
    pub async fn route(&self, from: &str, message: SignalMessage) -> Result<()> {
        let destination = message
            .destination()
            .map(str::to_string)
            .ok_or_else(|| {
                ProctorError::InvalidSignalingMessage("message has no destination".into())
            })?;
        let call_id = message.call_id().map(str::to_string);
        let message = message.with_sender(from);

        if self.send_to(&destination, &message).await? {
            tracing::debug!(from = %from, to = %destination, "Relayed signaling message");
            return Ok(());
        }

        tracing::debug!(from = %from, to = %destination, "Destination not connected");
        let unavailable = SignalMessage::PeerUnavailable {
            peer_id: destination,
            call_id,
        };
        self.send_to(from, &unavailable).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(message: Message) -> SignalMessage {
        serde_json::from_str(message.to_str().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let hub = RelayHub::new();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        hub.register("s1", tx1).await.unwrap();
        assert!(matches!(
            hub.register("s1", tx2).await,
            Err(ProctorError::IdentityTaken(_))
        ));
    }

    #[tokio::test]
    async fn test_stale_registration_is_replaced() {
        let hub = RelayHub::new();
        let (tx1, rx1) = mpsc::unbounded_channel();
        hub.register("s1", tx1).await.unwrap();
        drop(rx1);
        let (tx2, _rx2) = mpsc::unbounded_channel();
        assert!(hub.register("s1", tx2).await.is_ok());
    }

    #[tokio::test]
    async fn test_replaced_connection_exit_keeps_new_identity() {
        let hub = RelayHub::new();
        let (tx1, rx1) = mpsc::unbounded_channel();
        hub.register("s1", tx1.clone()).await.unwrap();
        drop(rx1);
        let (tx2, _rx2) = mpsc::unbounded_channel();
        hub.register("s1", tx2.clone()).await.unwrap();

        hub.unregister("s1", &tx1).await;
        assert_eq!(hub.online().await, vec!["s1".to_string()]);

        hub.unregister("s1", &tx2).await;
        assert!(hub.online().await.is_empty());
    }

    #[tokio::test]
    async fn test_route_and_unavailable() {
        let hub = RelayHub::new();
        let (s1_tx, mut s1_rx) = mpsc::unbounded_channel();
        let (p1_tx, mut p1_rx) = mpsc::unbounded_channel();
        hub.register("s1", s1_tx).await.unwrap();
        hub.register("p1", p1_tx).await.unwrap();

        let hangup = SignalMessage::Hangup {
            from: "spoofed".into(),
            to: "p1".into(),
            call_id: "mc_1".into(),
        };
        hub.route("s1", hangup).await.unwrap();
        match decode(p1_rx.recv().await.unwrap()) {
            SignalMessage::Hangup { from, .. } => assert_eq!(from, "s1"),
            other => panic!("unexpected {:?}", other),
        }

        let offline = SignalMessage::Hangup {
            from: String::new(),
            to: "ghost".into(),
            call_id: "mc_2".into(),
        };
        hub.route("s1", offline).await.unwrap();
        assert_eq!(
            decode(s1_rx.recv().await.unwrap()),
            SignalMessage::PeerUnavailable {
                peer_id: "ghost".into(),
                call_id: Some("mc_2".into())
            }
        );
    }
}
