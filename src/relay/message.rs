use serde::{Deserialize, Serialize};

use crate::peer::CallMetadata;

/// Messages exchanged over `/signal/{id}`.
///
/// `from` is stamped by the relay; whatever the client puts there is replaced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SignalMessage {
    Open {
        id: String,
    },

    IdTaken {
        id: String,
    },

    Offer {
        #[serde(default)]
        from: String,
        to: String,
        call_id: String,
        sdp: String,
        #[serde(default)]
        metadata: Option<CallMetadata>,
    },

    Answer {
        #[serde(default)]
        from: String,
        to: String,
        call_id: String,
        sdp: String,
    },

    IceCandidate {
        #[serde(default)]
        from: String,
        to: String,
        call_id: String,
        candidate: String,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u16>,
    },

    Hangup {
        #[serde(default)]
        from: String,
        to: String,
        call_id: String,
    },

    PeerUnavailable {
        peer_id: String,
        #[serde(default)]
        call_id: Option<String>,
    },

    Error {
        message: String,
    },
}

impl SignalMessage {
    /// Destination of a routable message.
    pub fn destination(&self) -> Option<&str> {
        match self {
            SignalMessage::Offer { to, .. }
            | SignalMessage::Answer { to, .. }
            | SignalMessage::IceCandidate { to, .. }
            | SignalMessage::Hangup { to, .. } => Some(to),
            _ => None,
        }
    }

    pub fn call_id(&self) -> Option<&str> {
        match self {
            SignalMessage::Offer { call_id, .. }
            | SignalMessage::Answer { call_id, .. }
            | SignalMessage::IceCandidate { call_id, .. }
            | SignalMessage::Hangup { call_id, .. } => Some(call_id),
            SignalMessage::PeerUnavailable { call_id, .. } => call_id.as_deref(),
            _ => None,
        }
    }

    pub fn with_sender(mut self, sender: &str) -> Self {
        match &mut self {
            SignalMessage::Offer { from, .. }
            | SignalMessage::Answer { from, .. }
            | SignalMessage::IceCandidate { from, .. }
            | SignalMessage::Hangup { from, .. } => *from = sender.to_string(),
            _ => {}
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Role;

    #[test]
    fn test_offer_wire_format() {
        let msg = SignalMessage::Offer {
            from: String::new(),
            to: "p1".into(),
            call_id: "mc_1".into(),
            sdp: "v=0".into(),
            metadata: Some(CallMetadata {
                id: "s1".into(),
                role: Role::Student,
                course_id: "c1".into(),
            }),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "Offer");
        assert_eq!(json["metadata"]["courseId"], "c1");
    }

    #[test]
    fn test_client_cannot_spoof_sender() {
        let raw = r#"{"type":"Hangup","from":"p1","to":"s2","call_id":"mc_1"}"#;
        let msg: SignalMessage = serde_json::from_str(raw).unwrap();
        let stamped = msg.with_sender("s1");
        assert_eq!(
            stamped,
            SignalMessage::Hangup {
                from: "s1".into(),
                to: "s2".into(),
                call_id: "mc_1".into()
            }
        );
        assert_eq!(stamped.destination(), Some("s2"));
    }

    #[test]
    fn test_missing_from_defaults_empty() {
        let raw = r#"{"type":"Answer","to":"s1","call_id":"mc_2","sdp":"v=0"}"#;
        let msg: SignalMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.call_id(), Some("mc_2"));
    }
}
