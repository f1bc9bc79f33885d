mod common;

use assert_matches::assert_matches;
use chrono::Utc;

use study_relay::domain::{ServerName, StorageMode, StudyReference};
use study_relay::error::RelayError;
use study_relay::registry::{ExamRecord, RecordStatus};
use study_relay::retrieval::{RetrievalJob, validate_instance};

use common::{CountingAuth, FakeArchive, FakeStudy, Workspace, accession, files_under, servers};

#[test]
fn first_server_down_completes_via_secondary() {
    let workspace = Workspace::new();
    let study = FakeStudy::new("5001", "RX TORAX PA", &[1, 2]);
    let engine = workspace.engine(FakeArchive::new(vec![study.clone()]).with_down("HAC"));

    let job = RetrievalJob::new(StudyReference::new(accession("5001")), &servers());
    let artifact = engine.retrieve(job).unwrap();

    assert_eq!(artifact.primary_server.as_str(), "HBR");
    assert_eq!(artifact.first_candidate.as_str(), "HAC");
    assert!(artifact.retrieved_via_secondary());
    assert_eq!(artifact.instances.len(), study.instance_count());
    assert_eq!(artifact.attempts.get(&"HAC".parse::<ServerName>().unwrap()), Some(&2));
    for instance in &artifact.instances {
        assert!(validate_instance(&instance.path).unwrap() > 132);
        assert_eq!(instance.server.as_str(), "HBR");
    }
}

#[test]
fn hinted_server_is_tried_first() {
    let workspace = Workspace::new();
    let archive = FakeArchive::new(vec![FakeStudy::new("5002", "RX TORAX PA", &[1])]);
    let engine = workspace.engine(archive);

    let reference = StudyReference::new(accession("5002")).with_hint("HBR".parse().unwrap());
    let artifact = engine
        .retrieve(RetrievalJob::new(reference, &servers()))
        .unwrap();

    assert_eq!(artifact.primary_server.as_str(), "HBR");
    assert!(!artifact.retrieved_via_secondary());
}

#[test]
fn missing_everywhere_fails_without_leftovers() {
    let workspace = Workspace::new();
    let archive = FakeArchive::new(vec![]);
    let engine = workspace.engine(archive);

    let result = engine.retrieve(RetrievalJob::new(
        StudyReference::new(accession("404")),
        &servers(),
    ));

    assert_matches!(result, Err(RelayError::StudyNotFound { .. }));
    assert!(files_under(workspace.staging_root()).is_empty());
    assert!(!workspace.registry.is_pinned(&accession("404")).unwrap());
}

#[test]
fn fewer_instances_than_expected_is_incomplete() {
    let workspace = Workspace::new();
    let engine = workspace.engine(FakeArchive::new(vec![FakeStudy::new("5003", "RX", &[2])]));

    let mut reference = StudyReference::new(accession("5003"));
    reference.expected_instances = Some(5);
    let result = engine.retrieve(RetrievalJob::new(reference, &servers()));

    assert_matches!(
        result,
        Err(RelayError::IncompleteStudy {
            retrieved: 2,
            expected: 5,
            ..
        })
    );
    assert!(files_under(workspace.staging_root()).is_empty());
}

#[test]
fn manual_server_does_not_fail_over() {
    let workspace = Workspace::new();
    let archive = FakeArchive::new(vec![FakeStudy::new("5004", "RX", &[1])]).with_down("HAC");
    let engine = workspace.engine(archive);

    let hac = servers().remove(0);
    let result = engine.retrieve(RetrievalJob::manual(
        StudyReference::new(accession("5004")),
        hac,
    ));

    assert_matches!(result, Err(RelayError::ServerUnavailable { .. }));
}

#[test]
fn retained_study_is_skipped_unless_forced() {
    let workspace = Workspace::new();
    workspace
        .registry
        .upsert(ExamRecord {
            accession_number: accession("5005"),
            patient_name: "DOE^JANE".to_string(),
            modality: "CR".to_string(),
            study_description: "RX TORAX PA".to_string(),
            normalized_age: None,
            storage_path: workspace.store().study_dir(&accession("5005")),
            downloaded_at: Utc::now(),
            storage_mode: StorageMode::Persistent,
            status: RecordStatus::Complete,
            server: "HAC".parse().unwrap(),
            exam_order_id: None,
            instance_count: 1,
        })
        .unwrap();
    let engine = workspace.engine(FakeArchive::new(vec![FakeStudy::new("5005", "RX", &[1])]));

    let job = RetrievalJob::new(StudyReference::new(accession("5005")), &servers());
    let skipped = engine.retrieve(job.clone());
    assert_matches!(skipped, Err(ref err) if err.is_skip());

    let artifact = engine.retrieve(job.forced()).unwrap();
    assert_eq!(artifact.instances.len(), 1);
}

#[test]
fn expired_session_is_refreshed_without_failover() {
    let auth = CountingAuth::default();
    let workspace = Workspace::with_auth(Box::new(auth.clone()));
    let archive = FakeArchive::new(vec![FakeStudy::new("5006", "RX", &[1])])
        .with_expired_session("HAC", 1);
    let engine = workspace.engine(archive);

    let artifact = engine
        .retrieve(RetrievalJob::new(
            StudyReference::new(accession("5006")),
            &servers(),
        ))
        .unwrap();

    assert_eq!(artifact.primary_server.as_str(), "HAC");
    assert!(!artifact.retrieved_via_secondary());
    assert_eq!(auth.refresh_count(), 1);
}

#[test]
fn dropping_an_artifact_discards_staging_and_pin() {
    let workspace = Workspace::new();
    let engine = workspace.engine(FakeArchive::new(vec![FakeStudy::new("5007", "RX", &[2])]));

    let artifact = engine
        .retrieve(RetrievalJob::new(
            StudyReference::new(accession("5007")),
            &servers(),
        ))
        .unwrap();
    let dir = artifact.dir().to_path_buf();
    assert!(workspace.registry.is_pinned(&accession("5007")).unwrap());
    assert_eq!(files_under(workspace.staging_root()).len(), 2);

    drop(artifact);
    assert!(!dir.exists());
    assert!(!workspace.registry.is_pinned(&accession("5007")).unwrap());
}

#[test]
fn short_lived_session_is_refreshed_for_every_expiry() {
    let auth = CountingAuth::default();
    let workspace = Workspace::with_auth(Box::new(auth.clone()));
    let archive = FakeArchive::new(vec![FakeStudy::new("5008", "RX", &[8])]).with_token_lifetime(2);
    let engine = workspace.engine_with_workers(archive, 1);

    let hac = servers().remove(0);
    let artifact = engine
        .retrieve(RetrievalJob::manual(StudyReference::new(accession("5008")), hac))
        .unwrap();

    assert_eq!(artifact.instances.len(), 8);
    // One layout query plus eight fetches, two requests per token.
    assert_eq!(auth.refresh_count(), 4);
    assert!(artifact.attempts.is_empty());
}

#[test]
fn token_expiring_mid_study_across_workers_needs_no_failover() {
    let auth = CountingAuth::default();
    let workspace = Workspace::with_auth(Box::new(auth.clone()));
    let study = FakeStudy::new("5009", "RX TORAX PA", &[4, 4]);
    let archive = FakeArchive::new(vec![study.clone()]).with_token_lifetime(2);
    let engine = workspace.engine_with_workers(archive, 4);

    let artifact = engine
        .retrieve(RetrievalJob::new(
            StudyReference::new(accession("5009")),
            &servers(),
        ))
        .unwrap();

    assert_eq!(artifact.instances.len(), study.instance_count());
    assert!(!artifact.retrieved_via_secondary());
    assert!(artifact.attempts.is_empty());
    // Workers holding a superseded token retry with the current one instead of refreshing again.
    assert_eq!(auth.refresh_count(), 4);
}

#[test]
fn instance_failing_after_others_landed_leaves_nothing_behind() {
    let workspace = Workspace::new();
    let study = FakeStudy::new("5010", "RX TORAX PA", &[3]);
    let broken = study.series[0][2].clone();
    let archive = FakeArchive::new(vec![study.clone()]).with_broken_instance(&broken);
    let engine = workspace.engine_with_workers(archive, 1);

    let result = engine.retrieve(RetrievalJob::new(
        StudyReference::new(accession("5010")),
        &servers(),
    ));

    assert_matches!(
        result,
        Err(RelayError::IncompleteStudy {
            retrieved: 2,
            expected: 3,
            ..
        })
    );
    assert_eq!(
        engine.transport().delivered.lock().unwrap().as_slice(),
        &study.series[0][..2]
    );
    assert!(files_under(workspace.staging_root()).is_empty());
    assert!(!workspace.store().study_dir(&accession("5010")).exists());
    assert!(!workspace.registry.is_pinned(&accession("5010")).unwrap());
    assert!(workspace.registry.get(&accession("5010")).unwrap().is_none());
    assert!(workspace.registry.records().unwrap().is_empty());
}
