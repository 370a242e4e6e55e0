// End-to-end incident flow for a student session, on the paused clock.

use std::sync::Arc;

use proctor_session::face::avg_distance;
use proctor_session::model::{LogFilter, LogReason, Participant, Role, StatusField};
use proctor_session::peer::LoopbackNetwork;
use proctor_session::recording::{RecordingState, StopOutcome};
use proctor_session::session::MessageBus;
use proctor_session::store::{InMemoryBlobStore, InMemoryRecordStore, RecordStore};
use proctor_session::testing::{
    test_frame, test_stream, FakeCapture, ScriptedDetector, StaticFrameSource,
};
use proctor_session::{Config, SessionCoordinator, SessionDeps};
use tokio::time::{sleep, Duration};

const REFERENCE: [f32; 4] = [0.2, 0.4, 0.6, 0.8];
const LIVE: [f32; 4] = [1.0, 1.2, 1.4, 1.6];

struct Harness {
    records: Arc<InMemoryRecordStore>,
    blobs: Arc<InMemoryBlobStore>,
    detector: Arc<ScriptedDetector>,
    network: LoopbackNetwork,
}

impl Harness {
    fn new() -> Self {
        let records = Arc::new(InMemoryRecordStore::new());
        records.insert_participant(
            Participant::new("s1", Role::Student, "ana@uni.edu")
                .with_name("Ana", "Lopez")
                .with_descriptor(REFERENCE.to_vec()),
        );
        records.insert_participant(Participant::new("p1", Role::Proctor, "pat@uni.edu"));
        records.enroll("C", "s1");
        records.enroll("C", "p1");

        Self {
            records,
            blobs: Arc::new(InMemoryBlobStore::new()),
            detector: Arc::new(ScriptedDetector::new()),
            network: LoopbackNetwork::default(),
        }
    }

    fn deps(&self) -> SessionDeps {
        SessionDeps {
            records: self.records.clone(),
            blobs: self.blobs.clone(),
            signaling: Arc::new(self.network.clone()),
            detector: self.detector.clone(),
            capture: Arc::new(FakeCapture::webm()),
        }
    }

    async fn join(&self, id: &str) -> SessionCoordinator {
        SessionCoordinator::join(Config::default(), "C", id, self.deps(), MessageBus::new())
            .await
            .unwrap()
    }
}

#[tokio::test(start_paused = true)]
async fn test_short_incident_is_discarded_and_highlight_kept() {
    assert!((avg_distance(&LIVE, &REFERENCE) - 0.8).abs() < 1e-6);

    let harness = Harness::new();
    harness.detector.set_fallback(Some(LIVE.to_vec()));

    let student = harness.join("s1").await;
    student
        .attach_local_stream(
            Ok(test_stream("s1")),
            Arc::new(StaticFrameSource::with_frame(test_frame())),
        )
        .await
        .unwrap();

    // First cycle runs after one interval: NO_MATCH.
    sleep(Duration::from_millis(1100)).await;
    let status = harness.records.session_status("C", "s1").await.unwrap();
    assert!(status.is_highlighted);
    assert_eq!(student.recorder().state().await, RecordingState::Recording);

    // The stream ends three seconds into the incident.
    sleep(Duration::from_secs(3)).await;
    let outcome = student.detach_local_stream().await.unwrap();
    assert!(matches!(outcome, StopOutcome::Discarded { elapsed_ms } if elapsed_ms < 5000));

    assert!(harness.blobs.uploads().is_empty());
    let videos = harness
        .records
        .log_entries(
            "C",
            &LogFilter {
                user_id: None,
                reason: Some(LogReason::Video),
            },
        )
        .await
        .unwrap();
    assert!(videos.is_empty());

    let status = harness.records.session_status("C", "s1").await.unwrap();
    assert!(status.is_highlighted);

    let highlight_writes: Vec<StatusField> = harness
        .records
        .status_writes()
        .into_iter()
        .map(|w| w.field)
        .filter(|f| matches!(f, StatusField::Highlighted(_)))
        .collect();
    assert_eq!(highlight_writes, vec![StatusField::Highlighted(true)]);

    student.leave().await;
}

#[tokio::test(start_paused = true)]
async fn test_student_and_proctor_see_each_other() {
    let harness = Harness::new();
    let proctor = harness.join("p1").await;
    let student = harness.join("s1").await;

    proctor
        .attach_local_stream(
            Ok(test_stream("p1")),
            Arc::new(StaticFrameSource::new()),
        )
        .await
        .unwrap();
    student
        .attach_local_stream(
            Ok(test_stream("s1")),
            Arc::new(StaticFrameSource::new()),
        )
        .await
        .unwrap();
    sleep(Duration::from_millis(50)).await;

    let seen_by_student = student.remote_streams().await;
    assert_eq!(seen_by_student.len(), 1);
    assert_eq!(seen_by_student[0].id, "p1");
    assert!(seen_by_student[0].is_connected());

    let seen_by_proctor: Vec<String> = proctor
        .remote_streams()
        .await
        .into_iter()
        .map(|view| view.id)
        .collect();
    assert_eq!(seen_by_proctor, vec!["s1".to_string()]);

    let entered = harness
        .records
        .log_entries("C", &LogFilter::default())
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.reason == LogReason::EnteredExam)
        .count();
    assert_eq!(entered, 2);

    student.leave().await;
    proctor.leave().await;
}
