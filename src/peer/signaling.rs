use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::media::MediaStream;
use crate::model::Role;

/// Sent along with every outbound call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallMetadata {
    pub id: String,
    pub role: Role,
    pub course_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Outbound,
    Inbound,
}

/// Events of a signaling identity.
pub enum IdentityEvent {
    Open,
    Close,
    Disconnected,
    Error(String),
    Call(MediaCall),
}

impl fmt::Debug for IdentityEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityEvent::Open => f.write_str("Open"),
            IdentityEvent::Close => f.write_str("Close"),
            IdentityEvent::Disconnected => f.write_str("Disconnected"),
            IdentityEvent::Error(e) => f.debug_tuple("Error").field(e).finish(),
            IdentityEvent::Call(call) => f.debug_tuple("Call").field(&call.call_id).finish(),
        }
    }
}

/// Events of one media call.
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// Remote media arrived or changed.
    Stream(MediaStream),
    Error(String),
    Close,
}

#[async_trait]
pub trait CallControl: Send + Sync {
    /// Accept an inbound call, sending `local` back.
    async fn answer(&self, local: &MediaStream) -> Result<()>;

    /// Hang up. Safe to call more than once.
    async fn close(&self);
}

pub struct MediaCall {
    pub call_id: String,
    pub peer_id: String,
    pub direction: CallDirection,
    pub metadata: Option<CallMetadata>,
    pub control: Arc<dyn CallControl>,
    pub events: mpsc::UnboundedReceiver<CallEvent>,
}

#[async_trait]
pub trait SignalingIdentity: Send + Sync {
    fn id(&self) -> &str;

    /// Place a call carrying `local` to `peer_id`.
    async fn call(
        &self,
        peer_id: &str,
        local: &MediaStream,
        metadata: CallMetadata,
    ) -> Result<MediaCall>;

    /// Release the identity. Open calls are closed.
    async fn destroy(&self);
}

/// Peer-to-peer signaling and media capability.
#[async_trait]
pub trait SignalingBackend: Send + Sync {
    async fn open_identity(
        &self,
        id: &str,
    ) -> Result<(Arc<dyn SignalingIdentity>, mpsc::UnboundedReceiver<IdentityEvent>)>;
}
