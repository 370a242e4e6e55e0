//! In-process fakes for the external capabilities, for offline testing
//! of the session pipeline.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::{ProctorError, Result};
use crate::face::{FaceDescriptor, FaceDetector, FaceGeometry, Frame};
use crate::liveness::FrameSource;
use crate::media::{MediaStream, MediaTrack, TrackKind};
use crate::recording::{CaptureOptions, CaptureSession, ClipStorage, FinishedClip, MediaCapture};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// 4x4 black RGB frame.
pub fn test_frame() -> Frame {
    Frame::new(4, 4, vec![0u8; 4 * 4 * 3])
}

/// Local stream with one audio and one video track.
pub fn test_stream(id: &str) -> MediaStream {
    MediaStream::with_tracks(
        id,
        vec![
            MediaTrack::new(format!("{id}-audio"), TrackKind::Audio),
            MediaTrack::new(format!("{id}-video"), TrackKind::Video),
        ],
    )
}

fn geometry() -> FaceGeometry {
    FaceGeometry {
        x: 1.0,
        y: 1.0,
        width: 2.0,
        height: 2.0,
        score: 0.9,
        image_width: 4,
        image_height: 4,
    }
}

type Scripted = std::result::Result<Option<Vec<f32>>, String>;

/// Face detector returning queued descriptors, then a fallback.
#[derive(Default)]
pub struct ScriptedDetector {
    load_error: Option<String>,
    delay: Option<Duration>,
    responses: Mutex<VecDeque<Scripted>>,
    fallback: Mutex<Option<Vec<f32>>>,
    last_confidence: Mutex<Option<f32>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    detect_calls: AtomicUsize,
    dispose_calls: AtomicUsize,
    disposed: AtomicBool,
}

impl ScriptedDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_load(mut self, reason: &str) -> Self {
        self.load_error = Some(reason.to_string());
        self
    }

    /// Each detection takes `delay` of tokio time.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push_face(&self, descriptor: Option<Vec<f32>>) {
        lock(&self.responses).push_back(Ok(descriptor));
    }

    pub fn push_error(&self, reason: &str) {
        lock(&self.responses).push_back(Err(reason.to_string()));
    }

    pub fn set_fallback(&self, descriptor: Option<Vec<f32>>) {
        *lock(&self.fallback) = descriptor;
    }

    pub fn detect_calls(&self) -> usize {
        self.detect_calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn dispose_calls(&self) -> usize {
        self.dispose_calls.load(Ordering::SeqCst)
    }

    pub fn last_confidence(&self) -> Option<f32> {
        *lock(&self.last_confidence)
    }
}

#[async_trait]
impl FaceDetector for ScriptedDetector {
    async fn load(&self) -> Result<()> {
        if let Some(reason) = &self.load_error {
            return Err(ProctorError::ModelLoad(reason.clone()));
        }
        self.disposed.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn detect_single(
        &self,
        _frame: &Frame,
        min_confidence: f32,
    ) -> Result<Option<FaceDescriptor>> {
        *lock(&self.last_confidence) = Some(min_confidence);
        self.detect_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let next = lock(&self.responses).pop_front();
        let response = next.unwrap_or_else(|| Ok(lock(&self.fallback).clone()));
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match response {
            Ok(descriptor) => Ok(descriptor.map(|descriptor| FaceDescriptor {
                geometry: geometry(),
                descriptor,
            })),
            Err(reason) => Err(ProctorError::internal(reason)),
        }
    }

    async fn detect_all(&self, _frame: &Frame, min_confidence: f32) -> Result<Vec<FaceGeometry>> {
        *lock(&self.last_confidence) = Some(min_confidence);
        Ok(lock(&self.fallback).iter().map(|_| geometry()).collect())
    }

    fn dispose(&self) -> Result<()> {
        self.dispose_calls.fetch_add(1, Ordering::SeqCst);
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Err(ProctorError::internal("already disposed"));
        }
        Ok(())
    }
}

/// Frame source holding one settable frame.
#[derive(Default)]
pub struct StaticFrameSource {
    frame: Mutex<Option<Frame>>,
}

impl StaticFrameSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_frame(frame: Frame) -> Self {
        Self {
            frame: Mutex::new(Some(frame)),
        }
    }

    pub fn set_frame(&self, frame: Frame) {
        *lock(&self.frame) = Some(frame);
    }

    pub fn clear(&self) {
        *lock(&self.frame) = None;
    }
}

#[async_trait]
impl FrameSource for StaticFrameSource {
    async fn current_frame(&self) -> Result<Option<Frame>> {
        Ok(lock(&self.frame).clone())
    }
}

/// Capture backend that emits a header chunk on start and a tail chunk on stop.
pub struct FakeCapture {
    supported: Vec<String>,
    fail_start: bool,
    starts: Arc<AtomicUsize>,
}

impl FakeCapture {
    pub fn supporting(mime_types: &[&str]) -> Self {
        Self {
            supported: mime_types.iter().map(|m| m.to_string()).collect(),
            fail_start: false,
            starts: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn webm() -> Self {
        Self::supporting(&["video/webm;codecs=vp8,opus"])
    }

    pub fn failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    pub fn start_counter(&self) -> Arc<AtomicUsize> {
        self.starts.clone()
    }
}

#[async_trait]
impl MediaCapture for FakeCapture {
    fn is_type_supported(&self, mime_type: &str) -> bool {
        self.supported.iter().any(|m| m == mime_type)
    }

    async fn start(
        &self,
        stream: &MediaStream,
        options: CaptureOptions,
        chunks: mpsc::UnboundedSender<Bytes>,
    ) -> Result<Box<dyn CaptureSession>> {
        if self.fail_start {
            return Err(ProctorError::CaptureFailed("encoder unavailable".into()));
        }
        self.starts.fetch_add(1, Ordering::SeqCst);
        let _ = chunks.send(Bytes::from(format!("{}|{}|", options.mime_type, stream.id())));
        let _ = chunks.send(Bytes::new());
        Ok(Box::new(FakeCaptureSession { chunks }))
    }
}

struct FakeCaptureSession {
    chunks: mpsc::UnboundedSender<Bytes>,
}

#[async_trait]
impl CaptureSession for FakeCaptureSession {
    async fn stop(self: Box<Self>) -> Result<()> {
        let _ = self.chunks.send(Bytes::from_static(b"tail"));
        Ok(())
    }
}

/// Clip sink keeping every clip in memory.
#[derive(Default)]
pub struct MemoryClipStorage {
    clips: Mutex<Vec<FinishedClip>>,
}

impl MemoryClipStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clips(&self) -> Vec<FinishedClip> {
        lock(&self.clips).clone()
    }
}

#[async_trait]
impl ClipStorage for MemoryClipStorage {
    async fn store_clip(&self, clip: FinishedClip) -> Result<String> {
        let url = format!("memory://{}", clip.filename);
        lock(&self.clips).push(clip);
        Ok(url)
    }
}
