use std::{
    collections::HashMap,
    env,
    time::{SystemTime, UNIX_EPOCH},
};

use super::*;

fn temp_config(contents: &str) -> PathBuf {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let dir = env::temp_dir().join(format!("messageflow_config_test_{suffix}"));
    fs::create_dir_all(&dir).expect("temp dir");
    let path = dir.join("messageflow.toml");
    fs::write(&path, contents).expect("write config");
    path
}

#[test]
fn defaults_match_backend_conventions() {
    let settings = Settings::default();
    assert_eq!(settings.page_size, 20);
    assert_eq!(settings.pairing_max_attempts, 60);
    assert_eq!(settings.pairing_poll_interval(), Duration::from_secs(2));
    assert!(settings.validate().is_ok());
}

#[test]
fn file_values_override_defaults() {
    let path = temp_config(
        r#"
api_base_url = "https://flow.example.com/api/v1"
page_size = 50
pairing_max_attempts = 30
"#,
    );
    let mut settings = Settings::default();
    apply_file(&mut settings, &path).expect("apply");

    assert_eq!(settings.api_base_url, "https://flow.example.com/api/v1");
    assert_eq!(settings.page_size, 50);
    assert_eq!(settings.pairing_max_attempts, 30);
    assert_eq!(settings.reconnect_delay_ms, 3_000);

    fs::remove_dir_all(path.parent().expect("parent")).expect("cleanup");
}

#[test]
fn malformed_file_is_reported() {
    let path = temp_config("page_size = \"lots\"");
    let mut settings = Settings::default();
    let err = apply_file(&mut settings, &path).expect_err("must fail");
    assert!(err.to_string().contains("failed to parse config file"));

    fs::remove_dir_all(path.parent().expect("parent")).expect("cleanup");
}

#[test]
fn env_aliases_win_and_garbage_is_ignored() {
    let vars: HashMap<&str, &str> = HashMap::from([
        ("MF_API_BASE", "http://primary:8080/api/v1"),
        ("APP__API_BASE_URL", "http://alias:8080/api/v1"),
        ("MF_PAGE_SIZE", "not-a-number"),
        ("MF_RECONNECT_DELAY_MS", "250"),
    ]);
    let mut settings = Settings::default();
    apply_env_overrides(&mut settings, |key| vars.get(key).map(|v| v.to_string()));

    assert_eq!(settings.api_base_url, "http://alias:8080/api/v1");
    assert_eq!(settings.page_size, 20);
    assert_eq!(settings.reconnect_delay(), Duration::from_millis(250));
}

#[test]
fn validation_rejects_unusable_values() {
    let settings = Settings {
        api_base_url: "localhost:8080".into(),
        ..Settings::default()
    };
    assert!(matches!(settings.validate(), Err(ClientError::Config(_))));

    let settings = Settings {
        page_size: 0,
        ..Settings::default()
    };
    assert!(matches!(settings.validate(), Err(ClientError::Config(_))));
}

#[test]
fn missing_file_is_skipped() {
    let path = env::temp_dir().join("messageflow_config_test_missing/messageflow.toml");
    let settings = load_settings_from(&path).expect("load");
    assert!(settings.validate().is_ok());
}
