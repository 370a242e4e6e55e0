use serde::{Deserialize, Serialize};

use super::ParticipantId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Student,
    Proctor,
    Admin,
}

impl Role {
    /// Proctors and admins supervise students.
    pub fn is_supervisor(&self) -> bool {
        matches!(self, Role::Proctor | Role::Admin)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Proctor => "proctor",
            Role::Admin => "admin",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum EnrollmentStatus {
    Register,
    #[default]
    Unregister,
    NotBiometrics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

/// Facial descriptor captured at enrollment, compared against live frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceDescriptor {
    pub descriptor: Vec<f32>,
    pub image: ImageSize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: ParticipantId,
    pub role: Role,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: String,
    #[serde(default)]
    pub status: EnrollmentStatus,
    pub descriptor_info: Option<ReferenceDescriptor>,
    pub id_image_url: Option<String>,
}

impl Participant {
    pub fn new(id: impl Into<String>, role: Role, email: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role,
            first_name: None,
            last_name: None,
            email: email.into(),
            status: EnrollmentStatus::Unregister,
            descriptor_info: None,
            id_image_url: None,
        }
    }

    pub fn with_name(mut self, first: impl Into<String>, last: impl Into<String>) -> Self {
        self.first_name = Some(first.into());
        self.last_name = Some(last.into());
        self
    }

    pub fn with_descriptor(mut self, descriptor: Vec<f32>) -> Self {
        self.descriptor_info = Some(ReferenceDescriptor {
            descriptor,
            image: ImageSize { width: 0, height: 0 },
        });
        self.status = EnrollmentStatus::Register;
        self
    }

    pub fn reference_descriptor(&self) -> Option<&[f32]> {
        self.descriptor_info.as_ref().map(|d| d.descriptor.as_slice())
    }

    /// "First Last" when both names are known, otherwise the email marked as unregistered.
    pub fn display_name(&self) -> String {
        match (self.first_name.as_deref(), self.last_name.as_deref()) {
            (Some(first), Some(last)) if !first.is_empty() && !last.is_empty() => {
                format!("{} {}", first, last)
            }
            _ => format!("{} (UNREGISTERED)", self.email),
        }
    }
}

/// Students and proctors enrolled in a course.
#[derive(Debug, Clone, Default)]
pub struct CourseMembers {
    pub students: Vec<Participant>,
    pub proctors: Vec<Participant>,
}

impl CourseMembers {
    pub fn find(&self, id: &str) -> Option<&Participant> {
        self.students
            .iter()
            .chain(self.proctors.iter())
            .find(|p| p.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_name() {
        let named = Participant::new("s1", Role::Student, "ana@uni.edu").with_name("Ana", "Lopez");
        assert_eq!(named.display_name(), "Ana Lopez");

        let unnamed = Participant::new("s2", Role::Student, "bo@uni.edu");
        assert_eq!(unnamed.display_name(), "bo@uni.edu (UNREGISTERED)");
    }

    #[test]
    fn test_role_serialization() {
        assert_eq!(serde_json::to_string(&Role::Proctor).unwrap(), "\"proctor\"");
        let role: Role = serde_json::from_str("\"admin\"").unwrap();
        assert!(role.is_supervisor());
        assert!(!Role::Student.is_supervisor());
    }

    #[test]
    fn test_enrollment_status_names() {
        assert_eq!(
            serde_json::to_string(&EnrollmentStatus::NotBiometrics).unwrap(),
            "\"notBiometrics\""
        );
    }
}
