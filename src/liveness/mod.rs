//! Continuous face verification against a participant's reference descriptor.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::LivenessConfig;
use crate::error::{ProctorError, Result};
use crate::face::{classify, FaceDescriptor, FaceMatchEngine, Frame, MatchOutcome};

/// Source of the current frame of a live video track.
#[async_trait]
pub trait FrameSource: Send + Sync {
    /// `None` until the first frame has been decoded.
    async fn current_frame(&self) -> Result<Option<Frame>>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum LivenessEvent {
    MatchFound(FaceDescriptor),
    MatchNotFound,
}

impl LivenessEvent {
    pub fn outcome(&self) -> MatchOutcome {
        match self {
            LivenessEvent::MatchFound(_) => MatchOutcome::Match,
            LivenessEvent::MatchNotFound => MatchOutcome::NoMatch,
        }
    }
}

#[derive(Debug, Clone)]
struct LivenessSettings {
    reference: Option<Vec<f32>>,
    threshold: f32,
}

struct RunningMonitor {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct LivenessMonitor {
    engine: Arc<FaceMatchEngine>,
    interval: Duration,
    settings: watch::Sender<LivenessSettings>,
    running: Mutex<Option<RunningMonitor>>,
}

impl LivenessMonitor {
    pub fn new(engine: Arc<FaceMatchEngine>, config: &LivenessConfig) -> Self {
        let (settings, _) = watch::channel(LivenessSettings {
            reference: None,
            threshold: config.match_threshold,
        });
        Self {
            engine,
            interval: config.interval,
            settings,
            running: Mutex::new(None),
        }
    }

    /// Takes effect on the next cycle.
    pub fn set_reference(&self, reference: Option<Vec<f32>>) {
        self.settings.send_modify(|s| s.reference = reference);
    }

    /// Takes effect on the next cycle.
    pub fn set_threshold(&self, threshold: f32) {
        self.settings.send_modify(|s| s.threshold = threshold);
    }

    pub fn has_reference(&self) -> bool {
        self.settings.borrow().reference.is_some()
    }

    pub fn threshold(&self) -> f32 {
        self.settings.borrow().threshold
    }

    pub fn is_running(&self) -> bool {
        self.lock_running()
            .as_ref()
            .map(|r| !r.handle.is_finished())
            .unwrap_or(false)
    }

    /// Set up detection and start polling `source`.
    ///
    /// Requires a reference descriptor. Model load failures are returned as
    /// fatal errors. A monitor already running is replaced.
    pub async fn start(
        &self,
        source: Arc<dyn FrameSource>,
    ) -> Result<mpsc::UnboundedReceiver<LivenessEvent>> {
        if self.settings.borrow().reference.is_none() {
            return Err(ProctorError::Missing("reference descriptor"));
        }

        self.engine.setup().await?;
        self.cancel().await;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(run_monitor(
            self.engine.clone(),
            source,
            self.settings.subscribe(),
            self.interval,
            events_tx,
            shutdown_rx,
        ));

        *self.lock_running() = Some(RunningMonitor {
            shutdown: shutdown_tx,
            handle,
        });

        tracing::info!(interval_ms = self.interval.as_millis() as u64, "Liveness monitor started");
        Ok(events_rx)
    }

    /// Cancel the loop and release the detection model.
    pub async fn stop(&self) {
        if self.cancel().await {
            tracing::info!("Liveness monitor stopped");
        }
        self.engine.dispose().await;
    }

    async fn cancel(&self) -> bool {
        let running = self.lock_running().take();
        match running {
            Some(running) => {
                let _ = running.shutdown.send(true);
                if let Err(e) = running.handle.await {
                    tracing::warn!(error = %e, "Liveness task ended abnormally");
                }
                true
            }
            None => false,
        }
    }

    fn lock_running(&self) -> std::sync::MutexGuard<'_, Option<RunningMonitor>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }
}

async fn run_monitor(
    engine: Arc<FaceMatchEngine>,
    source: Arc<dyn FrameSource>,
    settings: watch::Receiver<LivenessSettings>,
    interval: Duration,
    events: mpsc::UnboundedSender<LivenessEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        // Settings are sampled once per cycle.
        let current = settings.borrow().clone();

        let event = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            event = run_cycle(&engine, source.as_ref(), &current) => event,
        };

        if *shutdown.borrow() {
            break;
        }

        if let Some(event) = event {
            tracing::debug!(outcome = ?event.outcome(), "Liveness cycle finished");
            if events.send(event).is_err() {
                break;
            }
        }
    }

    tracing::debug!("Liveness loop exited");
}

async fn run_cycle(
    engine: &FaceMatchEngine,
    source: &dyn FrameSource,
    settings: &LivenessSettings,
) -> Option<LivenessEvent> {
    let reference = settings.reference.as_deref()?;

    let frame = match source.current_frame().await {
        Ok(Some(frame)) => frame,
        Ok(None) => {
            tracing::debug!("No frame available, skipping cycle");
            return None;
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to read frame");
            return None;
        }
    };

    let face = match engine.detect_best_face(&frame).await {
        Ok(face) => face,
        Err(e) => {
            tracing::warn!(error = %e, "Liveness detection failed");
            return None;
        }
    };

    let outcome = classify(
        face.as_ref().map(|f| f.descriptor.as_slice()),
        reference,
        settings.threshold,
    );

    match (outcome, face) {
        (MatchOutcome::Match, Some(face)) => Some(LivenessEvent::MatchFound(face)),
        _ => Some(LivenessEvent::MatchNotFound),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FaceConfig;
    use crate::testing::{test_frame, ScriptedDetector, StaticFrameSource};

    fn monitor(detector: Arc<ScriptedDetector>) -> LivenessMonitor {
        let engine = Arc::new(FaceMatchEngine::new(detector, FaceConfig::default()));
        LivenessMonitor::new(engine, &LivenessConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_requires_reference() {
        let monitor = monitor(Arc::new(ScriptedDetector::new()));
        let source = Arc::new(StaticFrameSource::with_frame(test_frame()));
        let err = monitor.start(source).await.unwrap_err();
        assert!(matches!(err, ProctorError::Missing(_)));
        assert!(!monitor.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_emits_match_and_no_match() {
        let detector = Arc::new(ScriptedDetector::new());
        detector.push_face(Some(vec![0.1; 4]));
        detector.push_face(Some(vec![0.9; 4]));
        detector.push_face(None);

        let monitor = monitor(detector.clone());
        monitor.set_reference(Some(vec![0.1; 4]));
        let mut events = monitor
            .start(Arc::new(StaticFrameSource::with_frame(test_frame())))
            .await
            .unwrap();

        assert!(matches!(events.recv().await, Some(LivenessEvent::MatchFound(_))));
        assert_eq!(events.recv().await, Some(LivenessEvent::MatchNotFound));
        assert_eq!(events.recv().await, Some(LivenessEvent::MatchNotFound));

        monitor.stop().await;
        assert!(!monitor.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycles_never_overlap() {
        let detector = Arc::new(ScriptedDetector::new().with_delay(Duration::from_millis(2500)));
        detector.set_fallback(Some(vec![0.0; 4]));

        let monitor = monitor(detector.clone());
        monitor.set_reference(Some(vec![0.0; 4]));
        let mut events = monitor
            .start(Arc::new(StaticFrameSource::with_frame(test_frame())))
            .await
            .unwrap();

        for _ in 0..5 {
            events.recv().await.unwrap();
        }
        monitor.stop().await;

        assert_eq!(detector.max_in_flight(), 1);
        assert!(detector.detect_calls() >= 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_frame_skips_cycle() {
        let detector = Arc::new(ScriptedDetector::new());
        detector.set_fallback(Some(vec![0.0; 4]));
        let source = Arc::new(StaticFrameSource::new());

        let monitor = monitor(detector.clone());
        monitor.set_reference(Some(vec![0.0; 4]));
        let mut events = monitor.start(source.clone()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert!(events.try_recv().is_err());
        assert_eq!(detector.detect_calls(), 0);

        source.set_frame(test_frame());
        assert!(matches!(events.recv().await, Some(LivenessEvent::MatchFound(_))));
        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_change_applies_next_cycle() {
        let detector = Arc::new(ScriptedDetector::new());
        detector.set_fallback(Some(vec![0.8; 4]));

        let monitor = monitor(detector);
        monitor.set_reference(Some(vec![0.0; 4]));
        let mut events = monitor
            .start(Arc::new(StaticFrameSource::with_frame(test_frame())))
            .await
            .unwrap();

        assert_eq!(events.recv().await, Some(LivenessEvent::MatchNotFound));
        monitor.set_threshold(0.9);
        assert_eq!(monitor.threshold(), 0.9);
        assert!(matches!(events.recv().await, Some(LivenessEvent::MatchFound(_))));
        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_disposes_engine() {
        let detector = Arc::new(ScriptedDetector::new());
        let monitor = monitor(detector.clone());
        monitor.set_reference(Some(vec![0.0; 4]));
        let _events = monitor
            .start(Arc::new(StaticFrameSource::with_frame(test_frame())))
            .await
            .unwrap();

        monitor.stop().await;
        monitor.stop().await;
        assert_eq!(detector.dispose_calls(), 2);
    }
}
