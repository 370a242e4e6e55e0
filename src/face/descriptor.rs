use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A decoded RGB8 video frame or still image.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub pixels: Bytes,
}

impl Frame {
    pub fn new(width: u32, height: u32, pixels: impl Into<Bytes>) -> Self {
        Self {
            width,
            height,
            pixels: pixels.into(),
        }
    }
}

/// Bounding box of a detected face, in source image pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceGeometry {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub score: f32,
    pub image_width: u32,
    pub image_height: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FaceDescriptor {
    pub geometry: FaceGeometry,
    pub descriptor: Vec<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOutcome {
    Match,
    NoMatch,
}

/// Mean absolute per-component distance between a detected descriptor and the
/// reference. Components missing from the reference count as 0.
/// An empty descriptor never matches.
pub fn avg_distance(detected: &[f32], reference: &[f32]) -> f32 {
    if detected.is_empty() {
        return f32::INFINITY;
    }
    let total: f32 = detected
        .iter()
        .enumerate()
        .map(|(i, value)| (value - reference.get(i).copied().unwrap_or(0.0)).abs())
        .sum();
    total / detected.len() as f32
}

/// No detected face is always a no-match, whatever the threshold.
pub fn classify(detected: Option<&[f32]>, reference: &[f32], threshold: f32) -> MatchOutcome {
    match detected {
        Some(descriptor) if avg_distance(descriptor, reference) <= threshold => MatchOutcome::Match,
        _ => MatchOutcome::NoMatch,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_avg_distance_symmetric_and_non_negative() {
        let pairs: [(&[f32], &[f32]); 3] = [
            (&[0.1, 0.2, 0.3], &[0.3, 0.2, 0.1]),
            (&[-1.0, 0.5, 2.0], &[1.0, -0.5, 0.0]),
            (&[0.0, 0.0, 0.0], &[0.0, 0.0, 0.0]),
        ];
        for (a, b) in pairs {
            let ab = avg_distance(a, b);
            let ba = avg_distance(b, a);
            assert!(ab >= 0.0);
            assert!((ab - ba).abs() < 1e-6);
        }
        assert_eq!(avg_distance(&[0.5, 0.5], &[0.5, 0.5]), 0.0);
    }

    #[test]
    fn test_avg_distance_value() {
        let d = avg_distance(&[1.0, 0.0, 0.4, 0.0], &[0.0, 0.0, 0.0, 0.4]);
        assert!((d - 0.45).abs() < 1e-6);
    }

    #[test]
    fn test_classify_threshold_is_inclusive() {
        let reference = [0.0f32, 0.0];
        let at_threshold = [0.5f32, 0.5];
        let beyond = [0.8f32, 0.8];

        assert_eq!(classify(Some(&at_threshold), &reference, 0.5), MatchOutcome::Match);
        assert_eq!(classify(Some(&beyond), &reference, 0.6), MatchOutcome::NoMatch);
        assert_eq!(classify(Some(&beyond), &reference, 0.8), MatchOutcome::Match);
    }

    #[test]
    fn test_no_face_never_matches() {
        let reference = [0.1f32; 128];
        for threshold in [0.0f32, 0.6, 10.0, f32::MAX] {
            assert_eq!(classify(None, &reference, threshold), MatchOutcome::NoMatch);
        }
        assert_eq!(classify(Some(&[]), &reference, f32::MAX), MatchOutcome::NoMatch);
    }
}
