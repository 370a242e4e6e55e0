use thiserror::Error;

/// Error types for the proctoring session core
#[derive(Debug, Error)]
pub enum ProctorError {
    /// Setup / fatal errors
    #[error("Failed to load face detection model: {0}")]
    ModelLoad(String),

    #[error("Face detection is not set up")]
    DetectorNotReady,

    #[error("Cannot get the media stream: {0}")]
    MediaAcquisition(String),

    /// Signaling and call errors
    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("Signaling identity {0} is not open")]
    IdentityNotOpen(String),

    #[error("Identity {0} is already taken")]
    IdentityTaken(String),

    #[error("Peer {0} is not available")]
    PeerUnavailable(String),

    #[error("Media negotiation with {peer_id} failed: {reason}")]
    CallFailed { peer_id: String, reason: String },

    #[error("Invalid signaling message: {0}")]
    InvalidSignalingMessage(String),

    /// Recording errors
    #[error("No supported mimeType found")]
    UnsupportedFormat,

    #[error("No stream found")]
    NoStream,

    #[error("Exception while creating recorder: {0}")]
    CaptureFailed(String),

    /// Storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Upload failed: {0}")]
    UploadFailed(String),

    #[error("Participant {0} not found")]
    ParticipantNotFound(String),

    /// Validation and authorization
    #[error("Missing {0}")]
    Missing(&'static str),

    #[error("Participant {0} not authorized for this operation")]
    Unauthorized(String),

    #[error("No face found in image")]
    NoFaceFound,

    /// Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Generic errors
    #[error("Failed to serialize message: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Convenience type alias for Results using ProctorError
pub type Result<T> = std::result::Result<T, ProctorError>;

impl ProctorError {
    pub fn internal(msg: impl Into<String>) -> Self {
        ProctorError::Internal(msg.into())
    }

    pub fn signaling(msg: impl Into<String>) -> Self {
        ProctorError::Signaling(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        ProctorError::Storage(msg.into())
    }

    /// Errors that replace the session view instead of being retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProctorError::ModelLoad(_) | ProctorError::MediaAcquisition(_)
        )
    }
}

impl From<webrtc::Error> for ProctorError {
    fn from(err: webrtc::Error) -> Self {
        ProctorError::Signaling(err.to_string())
    }
}

impl From<reqwest::Error> for ProctorError {
    fn from(err: reqwest::Error) -> Self {
        ProctorError::UploadFailed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProctorError::ParticipantNotFound("student-1".to_string());
        assert_eq!(err.to_string(), "Participant student-1 not found");
        assert_eq!(ProctorError::UnsupportedFormat.to_string(), "No supported mimeType found");
    }

    #[test]
    fn test_fatal_classification() {
        assert!(ProctorError::ModelLoad("404".into()).is_fatal());
        assert!(ProctorError::MediaAcquisition("denied".into()).is_fatal());
        assert!(!ProctorError::NoStream.is_fatal());
        assert!(!ProctorError::signaling("ice failed").is_fatal());
    }
}
