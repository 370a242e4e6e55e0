use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::media::MediaStream;

/// Capture formats in order of preference.
pub const MIME_CANDIDATES: [&str; 4] = [
    "video/webm;codecs=vp9,opus",
    "video/webm;codecs=h264,opus",
    "video/mp4;codecs=h264,aac",
    "video/webm;codecs=vp8,opus",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureOptions {
    pub mime_type: String,
    pub video_bitrate: u32,
}

/// Media capture capability: encodes a live stream into container chunks.
#[async_trait]
pub trait MediaCapture: Send + Sync {
    fn is_type_supported(&self, mime_type: &str) -> bool;

    /// Begin capturing `stream`. Encoded chunks are delivered in order on `chunks`.
    async fn start(
        &self,
        stream: &MediaStream,
        options: CaptureOptions,
        chunks: mpsc::UnboundedSender<Bytes>,
    ) -> Result<Box<dyn CaptureSession>>;
}

#[async_trait]
pub trait CaptureSession: Send {
    /// Stop capturing. Every remaining chunk has been sent when this returns.
    async fn stop(self: Box<Self>) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureFormat {
    /// Full candidate including codecs, passed to the capture backend.
    pub mime_type: String,
    /// Container type stored with the clip, e.g. `video/webm`.
    pub content_type: String,
    pub extension: String,
}

impl CaptureFormat {
    pub fn from_mime(mime_type: &str) -> Self {
        let content_type = mime_type
            .split(';')
            .next()
            .unwrap_or(mime_type)
            .trim()
            .to_string();
        let extension = content_type
            .rsplit('/')
            .next()
            .unwrap_or("bin")
            .to_string();
        Self {
            mime_type: mime_type.to_string(),
            content_type,
            extension,
        }
    }
}

/// First candidate format the backend supports.
pub fn negotiate_format(capture: &dyn MediaCapture) -> Option<CaptureFormat> {
    MIME_CANDIDATES
        .iter()
        .find(|mime| capture.is_type_supported(mime))
        .map(|mime| CaptureFormat::from_mime(mime))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeCapture;

    #[test]
    fn test_format_from_mime() {
        let format = CaptureFormat::from_mime("video/webm;codecs=vp9,opus");
        assert_eq!(format.content_type, "video/webm");
        assert_eq!(format.extension, "webm");

        let format = CaptureFormat::from_mime("video/mp4;codecs=h264,aac");
        assert_eq!(format.content_type, "video/mp4");
        assert_eq!(format.extension, "mp4");
    }

    #[test]
    fn test_negotiation_prefers_earlier_candidates() {
        let capture = FakeCapture::supporting(&["video/webm;codecs=vp8,opus", "video/mp4;codecs=h264,aac"]);
        let format = negotiate_format(&capture).unwrap();
        assert_eq!(format.mime_type, "video/mp4;codecs=h264,aac");

        let capture = FakeCapture::supporting(&[]);
        assert!(negotiate_format(&capture).is_none());
    }
}
