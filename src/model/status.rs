use serde::{Deserialize, Serialize};

/// Shared per-participant, per-course session flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionStatus {
    pub mic_status: bool,
    pub camera_status: bool,
    pub is_highlighted: bool,
    pub is_identified: bool,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            mic_status: false,
            camera_status: true,
            is_highlighted: false,
            is_identified: false,
        }
    }
}

/// Single-field write. Fields are independent, writes are last-write-wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusField {
    Mic(bool),
    Camera(bool),
    Highlighted(bool),
    Identified(bool),
}

impl SessionStatus {
    pub fn apply(&mut self, field: StatusField) {
        match field {
            StatusField::Mic(v) => self.mic_status = v,
            StatusField::Camera(v) => self.camera_status = v,
            StatusField::Highlighted(v) => self.is_highlighted = v,
            StatusField::Identified(v) => self.is_identified = v,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_fields_use_defaults() {
        let status: SessionStatus = serde_json::from_str("{\"isHighlighted\": true}").unwrap();
        assert!(status.is_highlighted);
        assert!(!status.mic_status);
        assert!(status.camera_status);
        assert!(!status.is_identified);
    }

    #[test]
    fn test_apply_touches_one_field() {
        let mut status = SessionStatus::default();
        status.apply(StatusField::Identified(true));
        assert_eq!(
            status,
            SessionStatus {
                is_identified: true,
                ..SessionStatus::default()
            }
        );
    }
}
