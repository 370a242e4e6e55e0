use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::Instant;

use super::capture::{negotiate_format, CaptureFormat, CaptureOptions, CaptureSession, MediaCapture};
use super::state::{RecordingState, StopOutcome};
use crate::config::RecordingConfig;
use crate::error::{ProctorError, Result};
use crate::media::MediaStream;
use crate::model::now_millis;

/// An assembled clip ready for storage.
#[derive(Debug, Clone)]
pub struct FinishedClip {
    pub bytes: Bytes,
    pub filename: String,
    pub content_type: String,
    pub duration: Duration,
}

/// Destination for finished clips.
#[async_trait]
pub trait ClipStorage: Send + Sync {
    /// Persist the clip and return its URL.
    async fn store_clip(&self, clip: FinishedClip) -> Result<String>;
}

struct ActiveRecording {
    session: Box<dyn CaptureSession>,
    chunks: mpsc::UnboundedReceiver<Bytes>,
    format: CaptureFormat,
    started_at: Instant,
    generation: u64,
    watchdog: watch::Sender<bool>,
}

#[derive(Default)]
struct RecorderSlot {
    stream: Option<MediaStream>,
    active: Option<ActiveRecording>,
    generation: u64,
}

struct RecorderInner {
    capture: Arc<dyn MediaCapture>,
    storage: Arc<dyn ClipStorage>,
    config: RecordingConfig,
    slot: Mutex<RecorderSlot>,
    last_error: StdMutex<Option<String>>,
}

/// Bounded recorder for evidence clips of one local stream.
#[derive(Clone)]
pub struct IncidentRecorder {
    inner: Arc<RecorderInner>,
}

impl IncidentRecorder {
    pub fn new(
        capture: Arc<dyn MediaCapture>,
        storage: Arc<dyn ClipStorage>,
        config: RecordingConfig,
    ) -> Self {
        Self {
            inner: Arc::new(RecorderInner {
                capture,
                storage,
                config,
                slot: Mutex::new(RecorderSlot::default()),
                last_error: StdMutex::new(None),
            }),
        }
    }

    pub async fn set_stream(&self, stream: MediaStream) {
        self.inner.slot.lock().await.stream = Some(stream);
    }

    pub async fn clear_stream(&self) {
        self.inner.slot.lock().await.stream = None;
    }

    pub async fn state(&self) -> RecordingState {
        if self.inner.slot.lock().await.active.is_some() {
            RecordingState::Recording
        } else {
            RecordingState::Idle
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.lock_error().clone()
    }

    /// Begin capturing the current stream.
    ///
    /// Does nothing while already recording. Missing stream, unsupported
    /// format and capture failures are recorded in [`Self::last_error`] and
    /// leave the recorder idle.
    pub async fn start_recording(&self) -> Result<()> {
        let mut slot = self.inner.slot.lock().await;
        if slot.active.is_some() {
            return Ok(());
        }

        let result = self.begin(&mut slot).await;
        if let Err(e) = &result {
            tracing::warn!(error = %e, "Could not start incident recording");
            *self.inner.lock_error() = Some(e.to_string());
        }
        result
    }

    async fn begin(&self, slot: &mut RecorderSlot) -> Result<()> {
        let stream = slot.stream.clone().ok_or(ProctorError::NoStream)?;
        let format =
            negotiate_format(self.inner.capture.as_ref()).ok_or(ProctorError::UnsupportedFormat)?;

        let options = CaptureOptions {
            mime_type: format.mime_type.clone(),
            video_bitrate: self.inner.config.video_bitrate,
        };
        let (chunks_tx, chunks_rx) = mpsc::unbounded_channel();
        let session = self
            .inner
            .capture
            .start(&stream, options, chunks_tx)
            .await
            .map_err(|e| match e {
                ProctorError::CaptureFailed(_) => e,
                other => ProctorError::CaptureFailed(other.to_string()),
            })?;

        slot.generation += 1;
        let generation = slot.generation;
        let (watchdog_tx, watchdog_rx) = watch::channel(false);
        let started_at = Instant::now();

        slot.active = Some(ActiveRecording {
            session,
            chunks: chunks_rx,
            format: format.clone(),
            started_at,
            generation,
            watchdog: watchdog_tx,
        });
        *self.inner.lock_error() = None;

        tokio::spawn(run_watchdog(
            Arc::downgrade(&self.inner),
            generation,
            started_at,
            watchdog_rx,
        ));

        tracing::info!(
            mime_type = %format.mime_type,
            stream_id = %stream.id(),
            "Incident recording started"
        );
        Ok(())
    }

    /// Finish the current recording.
    ///
    /// Clips shorter than the minimum duration are dropped without touching
    /// storage. Longer clips are handed to storage exactly once.
    pub async fn stop_recording(&self) -> Result<StopOutcome> {
        self.inner.stop(None).await
    }
}

impl RecorderInner {
    fn lock_error(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.last_error.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn stop(&self, only_generation: Option<u64>) -> Result<StopOutcome> {
        let active = {
            let mut slot = self.slot.lock().await;
            match (&slot.active, only_generation) {
                (None, _) => return Ok(StopOutcome::NotRecording),
                (Some(active), Some(generation)) if active.generation != generation => {
                    return Ok(StopOutcome::NotRecording)
                }
                _ => {}
            }
            match slot.active.take() {
                Some(active) => active,
                None => return Ok(StopOutcome::NotRecording),
            }
        };

        let _ = active.watchdog.send(true);
        let elapsed = active.started_at.elapsed();

        let ActiveRecording {
            session,
            mut chunks,
            format,
            ..
        } = active;

        if let Err(e) = session.stop().await {
            tracing::warn!(error = %e, "Capture did not stop cleanly");
        }

        let mut buffer = BytesMut::new();
        while let Ok(chunk) = chunks.try_recv() {
            if !chunk.is_empty() {
                buffer.extend_from_slice(&chunk);
            }
        }

        if elapsed < self.config.min_duration {
            tracing::info!(
                elapsed_ms = elapsed.as_millis() as u64,
                "Recording too short, discarding"
            );
            return Ok(StopOutcome::Discarded {
                elapsed_ms: elapsed.as_millis() as u64,
            });
        }

        let filename = format!("rec_{}.{}", now_millis(), format.extension);
        let clip = FinishedClip {
            bytes: buffer.freeze(),
            filename: filename.clone(),
            content_type: format.content_type.clone(),
            duration: elapsed,
        };

        match self.storage.store_clip(clip).await {
            Ok(url) => {
                tracing::info!(
                    filename = %filename,
                    url = %url,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Incident clip stored"
                );
                Ok(StopOutcome::Stored { filename, url })
            }
            Err(e) => {
                tracing::error!(filename = %filename, error = %e, "Failed to store incident clip");
                *self.lock_error() = Some(e.to_string());
                Err(e)
            }
        }
    }
}

async fn run_watchdog(
    inner: std::sync::Weak<RecorderInner>,
    generation: u64,
    started_at: Instant,
    mut cancel: watch::Receiver<bool>,
) {
    let (tick, max_duration) = match inner.upgrade() {
        Some(inner) => (inner.config.watchdog_tick, inner.config.max_duration),
        None => return,
    };

    let mut interval = tokio::time::interval_at(started_at + tick, tick);
    loop {
        tokio::select! {
            biased;
            _ = cancel.changed() => return,
            _ = interval.tick() => {}
        }

        if started_at.elapsed() < max_duration {
            continue;
        }

        let Some(inner) = inner.upgrade() else { return };
        tracing::warn!(
            max_secs = max_duration.as_secs(),
            "Recording reached maximum duration, forcing stop"
        );
        if let Err(e) = inner.stop(Some(generation)).await {
            tracing::error!(error = %e, "Forced stop failed");
        }
        return;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaTrack, TrackKind};
    use crate::testing::{FakeCapture, MemoryClipStorage};

    fn stream() -> MediaStream {
        MediaStream::with_tracks(
            "local",
            vec![
                MediaTrack::new("mic", TrackKind::Audio),
                MediaTrack::new("cam", TrackKind::Video),
            ],
        )
    }

    fn recorder(capture: FakeCapture) -> (IncidentRecorder, Arc<MemoryClipStorage>) {
        let storage = Arc::new(MemoryClipStorage::new());
        let recorder =
            IncidentRecorder::new(Arc::new(capture), storage.clone(), RecordingConfig::default());
        (recorder, storage)
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_recording_is_discarded() {
        let (recorder, storage) = recorder(FakeCapture::webm());
        recorder.set_stream(stream()).await;

        recorder.start_recording().await.unwrap();
        tokio::time::sleep(Duration::from_millis(4999)).await;
        let outcome = recorder.stop_recording().await.unwrap();

        assert!(matches!(outcome, StopOutcome::Discarded { .. }));
        assert_eq!(storage.clips().len(), 0);
        assert_eq!(recorder.state().await, RecordingState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_recording_is_stored_once() {
        let (recorder, storage) = recorder(FakeCapture::webm());
        recorder.set_stream(stream()).await;

        recorder.start_recording().await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        let outcome = recorder.stop_recording().await.unwrap();
        assert_eq!(
            recorder.stop_recording().await.unwrap(),
            StopOutcome::NotRecording
        );

        let clips = storage.clips();
        assert_eq!(clips.len(), 1);
        let clip = &clips[0];
        let stamp = clip
            .filename
            .strip_prefix("rec_")
            .and_then(|rest| rest.strip_suffix(".webm"))
            .unwrap();
        assert!(stamp.chars().all(|c| c.is_ascii_digit()));
        assert_eq!(clip.content_type, "video/webm");
        assert!(!clip.bytes.is_empty());
        assert!(matches!(outcome, StopOutcome::Stored { filename, .. } if filename == clip.filename));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent() {
        let capture = FakeCapture::webm();
        let starts = capture.start_counter();
        let (recorder, _storage) = recorder(capture);
        recorder.set_stream(stream()).await;

        recorder.start_recording().await.unwrap();
        recorder.start_recording().await.unwrap();
        assert_eq!(starts.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(recorder.state().await, RecordingState::Recording);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_force_stops_at_max_duration() {
        let (recorder, storage) = recorder(FakeCapture::webm());
        recorder.set_stream(stream()).await;
        recorder.start_recording().await.unwrap();

        tokio::time::sleep(Duration::from_secs(599)).await;
        assert_eq!(recorder.state().await, RecordingState::Recording);
        assert!(storage.clips().is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(recorder.state().await, RecordingState::Idle);
        assert_eq!(storage.clips().len(), 1);
        assert!(storage.clips()[0].duration >= Duration::from_secs(600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_does_not_stop_a_later_recording() {
        let (recorder, storage) = recorder(FakeCapture::webm());
        recorder.set_stream(stream()).await;

        recorder.start_recording().await.unwrap();
        tokio::time::sleep(Duration::from_secs(300)).await;
        recorder.stop_recording().await.unwrap();
        recorder.start_recording().await.unwrap();

        tokio::time::sleep(Duration::from_secs(400)).await;
        assert_eq!(recorder.state().await, RecordingState::Recording);
        assert_eq!(storage.clips().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_without_stream_reports_error() {
        let (recorder, _storage) = recorder(FakeCapture::webm());
        let err = recorder.start_recording().await.unwrap_err();
        assert!(matches!(err, ProctorError::NoStream));
        assert_eq!(recorder.last_error().as_deref(), Some("No stream found"));
        assert_eq!(recorder.state().await, RecordingState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsupported_format_reports_error() {
        let (recorder, _storage) = recorder(FakeCapture::supporting(&[]));
        recorder.set_stream(stream()).await;
        let err = recorder.start_recording().await.unwrap_err();
        assert!(matches!(err, ProctorError::UnsupportedFormat));
        assert_eq!(recorder.state().await, RecordingState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_failure_leaves_idle() {
        let (recorder, _storage) = recorder(FakeCapture::webm().failing_start());
        recorder.set_stream(stream()).await;
        let err = recorder.start_recording().await.unwrap_err();
        assert!(matches!(err, ProctorError::CaptureFailed(_)));
        assert_eq!(recorder.state().await, RecordingState::Idle);
        assert!(recorder.last_error().is_some());
    }
}
