//! Face detection capability wrapper.
//!
//! The detection model is a black box behind [`FaceDetector`]. The engine
//! serializes every call into it, since the model is not safe for concurrent
//! invocation, and turns per-frame failures into "no face found".

mod descriptor;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::config::FaceConfig;
use crate::error::{ProctorError, Result};

pub use descriptor::{avg_distance, classify, FaceDescriptor, FaceGeometry, Frame, MatchOutcome};

#[async_trait]
pub trait FaceDetector: Send + Sync {
    /// Load model weights. Network or file failures are fatal.
    async fn load(&self) -> Result<()>;

    /// Single most confident face with landmarks and descriptor.
    async fn detect_single(&self, frame: &Frame, min_confidence: f32)
        -> Result<Option<FaceDescriptor>>;

    /// Every face above `min_confidence`, geometry only.
    async fn detect_all(&self, frame: &Frame, min_confidence: f32) -> Result<Vec<FaceGeometry>>;

    /// Release model resources. May fail if already released.
    fn dispose(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EngineState {
    Unloaded,
    Ready,
    Disposed,
}

pub struct FaceMatchEngine {
    detector: Arc<dyn FaceDetector>,
    config: FaceConfig,
    state: Mutex<EngineState>,
}

impl FaceMatchEngine {
    pub fn new(detector: Arc<dyn FaceDetector>, config: FaceConfig) -> Self {
        Self {
            detector,
            config,
            state: Mutex::new(EngineState::Unloaded),
        }
    }

    /// Load the model once. Later calls return immediately.
    pub async fn setup(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if *state == EngineState::Ready {
            return Ok(());
        }

        self.detector.load().await.map_err(|e| match e {
            ProctorError::ModelLoad(_) => e,
            other => ProctorError::ModelLoad(other.to_string()),
        })?;

        *state = EngineState::Ready;
        tracing::info!("Face detection setup");
        Ok(())
    }

    pub async fn is_ready(&self) -> bool {
        *self.state.lock().await == EngineState::Ready
    }

    pub async fn detect_best_face(&self, frame: &Frame) -> Result<Option<FaceDescriptor>> {
        let state = self.state.lock().await;
        if *state != EngineState::Ready {
            return Err(ProctorError::DetectorNotReady);
        }

        match self
            .detector
            .detect_single(frame, self.config.min_confidence)
            .await
        {
            Ok(face) => Ok(face),
            Err(e) => {
                tracing::warn!(error = %e, "Face detection failed, treating as no face");
                Ok(None)
            }
        }
    }

    /// Low-confidence detection of every face, for overlays.
    pub async fn detect_all_faces(&self, frame: &Frame) -> Result<Vec<FaceGeometry>> {
        let state = self.state.lock().await;
        if *state != EngineState::Ready {
            return Err(ProctorError::DetectorNotReady);
        }

        match self
            .detector
            .detect_all(frame, self.config.overlay_min_confidence)
            .await
        {
            Ok(faces) => Ok(faces),
            Err(e) => {
                tracing::warn!(error = %e, "Face overlay detection failed");
                Ok(Vec::new())
            }
        }
    }

    pub async fn dispose(&self) {
        let mut state = self.state.lock().await;
        if let Err(e) = self.detector.dispose() {
            tracing::debug!(error = %e, "Face detection already disposed");
        }
        *state = EngineState::Disposed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedDetector;

    fn frame() -> Frame {
        Frame::new(2, 2, vec![0u8; 12])
    }

    #[tokio::test]
    async fn test_detection_requires_setup() {
        let engine = FaceMatchEngine::new(Arc::new(ScriptedDetector::new()), FaceConfig::default());
        assert!(matches!(
            engine.detect_best_face(&frame()).await,
            Err(ProctorError::DetectorNotReady)
        ));

        engine.setup().await.unwrap();
        engine.setup().await.unwrap();
        assert!(engine.is_ready().await);
    }

    #[tokio::test]
    async fn test_setup_failure_is_fatal() {
        let detector = ScriptedDetector::new().failing_load("weights 404");
        let engine = FaceMatchEngine::new(Arc::new(detector), FaceConfig::default());
        let err = engine.setup().await.unwrap_err();
        assert!(err.is_fatal());
        assert!(!engine.is_ready().await);
    }

    #[tokio::test]
    async fn test_detection_error_becomes_no_face() {
        let detector = ScriptedDetector::new();
        detector.push_error("tensor shape mismatch");
        let engine = FaceMatchEngine::new(Arc::new(detector), FaceConfig::default());
        engine.setup().await.unwrap();

        assert_eq!(engine.detect_best_face(&frame()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_dispose_twice_is_safe() {
        let detector = Arc::new(ScriptedDetector::new());
        let engine = FaceMatchEngine::new(detector.clone(), FaceConfig::default());
        engine.setup().await.unwrap();

        engine.dispose().await;
        engine.dispose().await;
        assert!(!engine.is_ready().await);
        assert_eq!(detector.dispose_calls(), 2);
    }

    #[tokio::test]
    async fn test_overlay_uses_low_confidence() {
        let detector = Arc::new(ScriptedDetector::new());
        let engine = FaceMatchEngine::new(detector.clone(), FaceConfig::default());
        engine.setup().await.unwrap();

        let faces = engine.detect_all_faces(&frame()).await.unwrap();
        assert!(faces.is_empty());
        assert_eq!(detector.last_confidence(), Some(0.1));
    }
}
