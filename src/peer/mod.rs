//! Peer-to-peer mesh between the participants of a course session.
//!
//! [`PeerSessionManager`] owns one signaling identity and one call per roster
//! entry. The signaling capability is pluggable: [`WebRtcSignaling`] talks to
//! the relay and negotiates real webrtc connections, [`LoopbackNetwork`] wires
//! identities together in-process.

mod connection;
mod loopback;
mod manager;
mod rtc;
mod signaling;
pub mod webrtc_utils;

pub use connection::{ConnectionState, PeerConnection};
pub use loopback::LoopbackNetwork;
pub use manager::{PeerSessionManager, PeerUpdate, RemoteStreamView};
pub use rtc::WebRtcSignaling;
pub use signaling::{
    CallControl, CallDirection, CallEvent, CallMetadata, IdentityEvent, MediaCall,
    SignalingBackend, SignalingIdentity,
};
