//! Config file loading and environment override precedence

use recruit_common::config::{resolve_config_path, IdFormat, TomlConfig, DEFAULT_CONFIG_PATH};
use recruit_common::Error;
use serial_test::serial;
use std::path::PathBuf;
use tempfile::TempDir;

const ENV_VARS: [&str; 5] = [
    "REDCAP_API_URL",
    "REDCAP_API_TOKEN",
    "REDCAP_CONCURRENCY_STRINGS",
    "RECRUIT_NOTIFY_URL",
    "RECRUIT_FIELD_STUDY_ID",
];

fn clear_env() {
    for var in ENV_VARS {
        std::env::remove_var(var);
    }
}

#[tokio::test]
#[serial]
async fn test_missing_file_uses_defaults() {
    clear_env();
    let temp_dir = TempDir::new().unwrap();

    let config = TomlConfig::load(&temp_dir.path().join("absent.toml"))
        .await
        .unwrap();

    assert_eq!(config.poll.interval_secs, 120);
    assert_eq!(config.assignment.max_attempts, 3);
    assert!(config.redcap.api_url.is_none());
}

#[tokio::test]
#[serial]
async fn test_file_values_are_loaded() {
    clear_env();
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("recruit.toml");
    std::fs::write(
        &path,
        r#"
        [redcap]
        api_url = "https://redcap.example.org/api/"
        api_token = "FILE_TOKEN"

        [fields.overrides]
        email = "participant_email"

        [assignment.healthy_control]
        prefix = "HC"
        start = 3000
        end = 10199
        format = "numeric"

        [notify]
        study_name = "Test Study"
        show_reasons = true
        max_per_minute = 20

        [logging]
        level = "debug"
        "#,
    )
    .unwrap();

    let config = TomlConfig::load(&path).await.unwrap();

    assert_eq!(
        config.redcap.credentials().unwrap(),
        ("https://redcap.example.org/api/", "FILE_TOKEN")
    );
    assert_eq!(config.fields.overrides["email"], "participant_email");
    assert_eq!(config.assignment.healthy_control.format, IdFormat::Numeric);
    assert_eq!(config.notify.study_name, "Test Study");
    assert!(config.notify.show_reasons);
    assert_eq!(config.notify.max_per_minute, 20);
    assert_eq!(config.logging.level, "debug");
}

#[tokio::test]
#[serial]
async fn test_environment_overrides_file() {
    clear_env();
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("recruit.toml");
    std::fs::write(
        &path,
        r#"
        [redcap]
        api_url = "https://file.example.org/api/"
        api_token = "FILE_TOKEN"

        [fields.overrides]
        study_id = "file_study_id"
        "#,
    )
    .unwrap();

    std::env::set_var("REDCAP_API_TOKEN", "ENV_TOKEN");
    std::env::set_var("REDCAP_CONCURRENCY_STRINGS", "is taken,collision");
    std::env::set_var("RECRUIT_FIELD_STUDY_ID", "env_study_id");

    let config = TomlConfig::load(&path).await.unwrap();
    clear_env();

    let (url, token) = config.redcap.credentials().unwrap();
    assert_eq!(url, "https://file.example.org/api/");
    assert_eq!(token, "ENV_TOKEN");
    assert!(config.redcap.signatures().matches(400, "ID IS TAKEN"));
    assert!(!config.redcap.signatures().matches(400, "duplicate"));
    assert_eq!(config.fields.overrides["study_id"], "env_study_id");
}

#[tokio::test]
#[serial]
async fn test_invalid_toml_is_config_error() {
    clear_env();
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("recruit.toml");
    std::fs::write(&path, "[poll\ninterval_secs = ").unwrap();

    let err = TomlConfig::load(&path).await.unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[tokio::test]
#[serial]
async fn test_inaccessible_path_is_config_error() {
    clear_env();
    let temp_dir = TempDir::new().unwrap();
    let not_a_dir = temp_dir.path().join("plain-file");
    std::fs::write(&not_a_dir, "").unwrap();

    // Checking the path fails (not a directory); that must not read as "absent"
    let err = TomlConfig::load(&not_a_dir.join("recruit.toml"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Config(msg) if msg.contains("Cannot access")));
}

#[tokio::test]
#[serial]
async fn test_zero_interval_rejected() {
    clear_env();
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("recruit.toml");
    std::fs::write(&path, "[poll]\ninterval_secs = 0\n").unwrap();

    assert!(TomlConfig::load(&path).await.is_err());
}

#[test]
fn test_config_path_resolution() {
    assert_eq!(resolve_config_path(None), PathBuf::from(DEFAULT_CONFIG_PATH));
    assert_eq!(
        resolve_config_path(Some(PathBuf::from("/etc/recruit.toml"))),
        PathBuf::from("/etc/recruit.toml")
    );
}
