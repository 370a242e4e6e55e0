use crate::model::{CourseMembers, ParticipantId, Role};

/// Who `viewer` exchanges media with in a course session.
///
/// Students only see proctors. Proctors and admins see every proctor and
/// student. The viewer is never on its own roster.
pub fn compute_roster(
    viewer_id: &str,
    viewer_role: Role,
    members: &CourseMembers,
) -> Vec<(ParticipantId, Role)> {
    let proctors = members.proctors.iter();
    let roster: Vec<(ParticipantId, Role)> = if viewer_role.is_supervisor() {
        proctors
            .chain(members.students.iter())
            .filter(|p| p.id != viewer_id)
            .map(|p| (p.id.clone(), p.role))
            .collect()
    } else {
        proctors
            .filter(|p| p.id != viewer_id)
            .map(|p| (p.id.clone(), p.role))
            .collect()
    };

    tracing::debug!(
        viewer = %viewer_id,
        role = %viewer_role,
        size = roster.len(),
        "Computed roster"
    );
    roster
}
