//! Field detection against realistic data dictionaries

mod common;

use common::{MockServer, Reply};
use recruit_common::config::{FieldConfig, TrackingFields};
use recruit_common::detector::{FieldDetector, RuleTable};
use recruit_common::store::{ConflictSignatures, FieldMetadata, RedcapClient, RetryPolicy};
use recruit_common::{RawRecord, Role};
use std::collections::BTreeMap;
use std::time::Duration;

/// Screening survey dictionary with hashed field suffixes, the way REDCap
/// projects accumulate them over instrument revisions
fn screening_schema() -> Vec<FieldMetadata> {
    vec![
        FieldMetadata::new("record_id", "text").with_label("Record ID"),
        FieldMetadata::new("consent_intro", "descriptive").with_label("About this consent form"),
        FieldMetadata::new("agree_to_participate_5c8b2a", "radio")
            .with_label("I agree to participate")
            .with_choices("1, Yes | 0, No"),
        FieldMetadata::new("participant_email_a29017", "text")
            .with_label("Email address")
            .with_validation("email"),
        FieldMetadata::new("age_c4982e", "text")
            .with_label("What is your age?")
            .with_validation("integer"),
        FieldMetadata::new("age_eligibility_90e0b5", "calc").with_label("Age eligibility"),
        FieldMetadata::new("qids_score_screening_42b0d5", "calc").with_label("QIDS total"),
        FieldMetadata::new("neurological_history_3d1f", "yesno")
            .with_label("History of neurological disorder or brain injury?"),
        FieldMetadata::new("overall_eligibility_7f3a", "calc").with_label("Overall eligibility"),
        FieldMetadata::new("eligibility_email_sent", "yesno").with_label("Eligibility email sent"),
        FieldMetadata::new("assigned_study_id_a690e9", "text").with_label("Assigned study ID"),
        FieldMetadata::new("pipeline_processing_status", "dropdown")
            .with_choices("pending, pending | ineligible, ineligible"),
    ]
}

fn detector() -> FieldDetector {
    FieldDetector::new(
        RuleTable::builtin().unwrap(),
        BTreeMap::new(),
        TrackingFields::default(),
    )
}

fn raw(pairs: &[(&str, &str)]) -> RawRecord {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[test]
fn test_detects_core_roles_from_dictionary() {
    let detector = detector();
    detector.set_schema(screening_schema());

    let expect = [
        (Role::CONSENT, "agree_to_participate_5c8b2a"),
        (Role::EMAIL, "participant_email_a29017"),
        (Role::AGE, "age_c4982e"),
        (Role::ASSESSMENT_SCORE, "qids_score_screening_42b0d5"),
        (Role::ELIGIBILITY_FLAG, "overall_eligibility_7f3a"),
        (Role::STUDY_ID, "assigned_study_id_a690e9"),
        (Role::new("exclude_neurological"), "neurological_history_3d1f"),
    ];
    for (role, field) in expect {
        assert_eq!(detector.detect(&role, None).as_deref(), Some(field), "role {role}");
    }
    assert_eq!(detector.detect(&Role::STUDY_ARM, None), None);
}

#[test]
fn test_detection_is_memoized_including_misses() {
    let detector = detector();
    detector.set_schema(screening_schema());

    for _ in 0..5 {
        detector.detect(&Role::EMAIL, None);
        detector.detect(&Role::STUDY_ARM, None);
    }

    assert_eq!(detector.detections_computed(), 2);
}

#[test]
fn test_override_beats_detection() {
    let mut overrides = BTreeMap::new();
    overrides.insert(Role::EMAIL, "contact_email_v3".to_string());
    let detector = FieldDetector::new(
        RuleTable::builtin().unwrap(),
        overrides,
        TrackingFields::default(),
    );
    detector.set_schema(screening_schema());

    assert_eq!(
        detector.detect(&Role::EMAIL, None).as_deref(),
        Some("contact_email_v3")
    );
    assert_eq!(detector.detections_computed(), 0);
}

#[test]
fn test_from_config_reads_overrides_and_rules_file() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let rules_path = temp_dir.path().join("rules.toml");
    std::fs::write(
        &rules_path,
        r#"
        [[rule]]
        role = "email"
        patterns = ["^contact$"]
        "#,
    )
    .unwrap();

    let mut config = FieldConfig {
        rules_path: Some(rules_path),
        ..Default::default()
    };
    config.overrides.insert("AGE".into(), "dob_age".into());
    let detector = FieldDetector::from_config(&config).unwrap();
    detector.set_schema(vec![
        FieldMetadata::new("email", "text"),
        FieldMetadata::new("contact", "text"),
    ]);

    assert_eq!(detector.detect(&Role::EMAIL, None).as_deref(), Some("contact"));
    assert_eq!(detector.detect(&Role::AGE, None).as_deref(), Some("dob_age"));
    assert_eq!(detector.detect(&Role::CONSENT, None), None);
}

#[test]
fn test_normalize_reads_v2_fallback_and_tracking() {
    let detector = detector();
    detector.set_schema(screening_schema());

    let record = raw(&[
        ("record_id", "12"),
        ("participant_email_a29017", ""),
        ("participant_email_a29017_v2", "p@example.org"),
        ("age_c4982e", "34"),
        ("pipeline_processing_status", "ineligible"),
        ("pipeline_ineligibility_reasons", "Active substance abuse; Current psychotic symptoms"),
    ]);
    let participant = detector.participant(record).unwrap();

    assert_eq!(participant.email(), Some("p@example.org"));
    assert_eq!(participant.normalized.get(&Role::AGE), Some("34"));
    assert_eq!(
        participant.processing_status(),
        Some(recruit_common::ProcessingStatus::Ineligible)
    );
    assert_eq!(participant.ineligibility_reasons().len(), 2);
    assert_eq!(participant.normalized.tracking.id_assigned, "0");
}

#[test]
fn test_compatibility_report_lists_missing_tracking_fields() {
    let detector = detector();
    detector.set_schema(screening_schema());

    let report = detector.compatibility_report();

    assert!(report.schema_available);
    assert_eq!(
        report.detected.get(&Role::STUDY_ID).map(String::as_str),
        Some("assigned_study_id_a690e9")
    );
    assert!(report.undetected.contains(&Role::STUDY_ARM));
    assert!(report
        .missing_tracking_fields
        .contains(&"pipeline_invitation_sent_timestamp".to_string()));
    assert!(!report
        .missing_tracking_fields
        .contains(&"pipeline_processing_status".to_string()));
}

#[tokio::test]
async fn test_schema_fetch_failure_falls_back_to_record_keys() {
    let server = MockServer::new(vec![Reply::status(403, "You do not have API rights")]);
    let url = server.start().await;
    let client = RedcapClient::new(
        url,
        "TOKEN",
        Duration::from_secs(5),
        RetryPolicy::default(),
        ConflictSignatures::default(),
    )
    .unwrap();

    let detector = detector();
    detector.load_schema(&client).await;
    detector.load_schema(&client).await;

    assert!(detector.schema().is_none());
    assert_eq!(server.hits(), 1, "schema is fetched at most once");
    assert!(!detector.has_field("id_assigned"));

    // Nothing to go on without a sample record; misses are not memoized
    assert_eq!(detector.detect(&Role::EMAIL, None), None);
    let sample = raw(&[("record_id", "1"), ("email", "p@example.org")]);
    assert_eq!(detector.detect(&Role::EMAIL, Some(&sample)).as_deref(), Some("email"));
}
