mod capture;
#[cfg(feature = "gstreamer")]
mod pipeline;
mod recorder;
mod state;

pub use capture::{
    negotiate_format, CaptureFormat, CaptureOptions, CaptureSession, MediaCapture, MIME_CANDIDATES,
};
#[cfg(feature = "gstreamer")]
pub use pipeline::{GstCapture, GstFrameSource};
pub use recorder::{ClipStorage, FinishedClip, IncidentRecorder};
pub use state::{RecordingState, StopOutcome};
