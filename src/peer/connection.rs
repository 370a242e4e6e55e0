use std::sync::Arc;

use serde::Serialize;

use super::signaling::{CallControl, CallDirection, CallEvent};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Streaming,
    Closed,
    Errored(String),
}

impl ConnectionState {
    pub fn is_active(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Streaming)
    }
}

/// One call to a remote participant and where it is in its lifecycle.
///
/// `Closed` and `Errored` are terminal: events arriving after them are ignored.
#[derive(Clone)]
pub struct PeerConnection {
    call_id: String,
    peer_id: String,
    direction: CallDirection,
    control: Arc<dyn CallControl>,
    state: ConnectionState,
}

impl PeerConnection {
    pub fn new(
        call_id: impl Into<String>,
        peer_id: impl Into<String>,
        direction: CallDirection,
        control: Arc<dyn CallControl>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            peer_id: peer_id.into(),
            direction,
            control,
            state: ConnectionState::Connecting,
        }
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn direction(&self) -> CallDirection {
        self.direction
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    pub fn control(&self) -> Arc<dyn CallControl> {
        self.control.clone()
    }

    /// Apply a call event. Returns false when the event was ignored.
    pub fn apply(&mut self, event: &CallEvent) -> bool {
        if !self.is_active() {
            return false;
        }
        self.state = match event {
            CallEvent::Stream(_) => ConnectionState::Streaming,
            CallEvent::Close => ConnectionState::Closed,
            CallEvent::Error(reason) => ConnectionState::Errored(reason.clone()),
        };
        true
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        if self.is_active() {
            self.state = ConnectionState::Errored(reason.into());
        }
    }
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("call_id", &self.call_id)
            .field("peer_id", &self.peer_id)
            .field("direction", &self.direction)
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::media::MediaStream;
    use async_trait::async_trait;

    struct NoopControl;

    #[async_trait]
    impl CallControl for NoopControl {
        async fn answer(&self, _local: &MediaStream) -> Result<()> {
            Ok(())
        }
        async fn close(&self) {}
    }

    fn connection() -> PeerConnection {
        PeerConnection::new("call-1", "p1", CallDirection::Outbound, Arc::new(NoopControl))
    }

    #[test]
    fn test_stream_then_close() {
        let mut conn = connection();
        assert_eq!(conn.state(), &ConnectionState::Connecting);

        assert!(conn.apply(&CallEvent::Stream(MediaStream::empty())));
        assert_eq!(conn.state(), &ConnectionState::Streaming);
        assert!(conn.apply(&CallEvent::Stream(MediaStream::empty())));

        assert!(conn.apply(&CallEvent::Close));
        assert!(!conn.is_active());
        assert!(!conn.apply(&CallEvent::Stream(MediaStream::empty())));
        assert_eq!(conn.state(), &ConnectionState::Closed);
    }

    #[test]
    fn test_error_is_terminal() {
        let mut conn = connection();
        assert!(conn.apply(&CallEvent::Error("ice failed".into())));
        assert_eq!(conn.state(), &ConnectionState::Errored("ice failed".into()));
        assert!(!conn.apply(&CallEvent::Close));
        conn.fail("again");
        assert_eq!(conn.state(), &ConnectionState::Errored("ice failed".into()));
    }
}
