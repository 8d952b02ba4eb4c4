use std::io::Write;

use conductor_core::config::{ApiKeyRole, AppConfig};

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[engine]
max_parallelism = 8
default_timeout_ms = 15000
default_max_retries = 2

[engine.retry]
initial_backoff_ms = 500
max_backoff_ms = 10000
jitter = 0.1

[reflection]
max_iterations = 3
support_threshold = 0.6
min_output_chars = 40

[learning]
window_days = 14
avoid_below = 2.0
min_samples = 5
refresh_schedule = "0 */15 * * * *"

[store]
data_dir = "/tmp/conductor-test"
keep_checkpoints = true

[inference]
base_url = "http://localhost:11434/v1"
model = "llama3.2"
api_key = "sk-test-key"

[inference.retry]
max_retries = 4

[gateway]
bind = "0.0.0.0:9999"
token = "test-token"

[[gateway.api_keys]]
name = "ci"
key = "ck_ci_key"
role = "admin"

[log]
level = 3
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.max_parallelism, 8);
    assert_eq!(config.engine.default_timeout_ms, 15000);
    assert_eq!(config.engine.default_max_retries, 2);
    assert_eq!(config.engine.retry.initial_backoff_ms, 500);
    assert_eq!(config.reflection.max_iterations, 3);
    assert_eq!(config.learning.window_days, 14);
    assert_eq!(config.learning.refresh_schedule, "0 */15 * * * *");
    assert!(config.store.keep_checkpoints);
    assert_eq!(
        config.database_path(),
        std::path::PathBuf::from("/tmp/conductor-test/conductor.db")
    );

    let inference = config.inference.expect("inference present");
    assert_eq!(inference.model, "llama3.2");
    assert_eq!(inference.api_key, Some("sk-test-key".to_string()));
    assert_eq!(inference.retry.expect("retry present").max_retries, 4);

    let gw = config.gateway.expect("gateway present");
    assert_eq!(gw.bind, "0.0.0.0:9999");
    assert_eq!(gw.api_keys.len(), 1);
    assert_eq!(gw.api_keys[0].role, ApiKeyRole::Admin);

    let log = config.log.expect("log present");
    assert!(log.enabled);
    assert_eq!(log.level, 3);
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("CONDUCTOR_TEST_API_KEY", "expanded-key-value");

    let toml_content = r#"
[inference]
model = "test-model"
api_key = "${CONDUCTOR_TEST_API_KEY}"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(
        config.inference.expect("inference present").api_key,
        Some("expanded-key-value".to_string())
    );

    std::env::remove_var("CONDUCTOR_TEST_API_KEY");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"# empty\n").expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.max_parallelism, 5);
    assert_eq!(config.engine.default_timeout_ms, 30_000);
    assert_eq!(config.engine.default_max_retries, 3);
    assert_eq!(config.reflection.max_iterations, 2);
    assert_eq!(config.learning.window_days, 30);
    assert!(!config.store.keep_checkpoints);
    assert!(config.inference.is_none());
    assert!(config.gateway.is_none());
    assert!(config.log.is_none());
}

#[test]
fn test_invalid_values_rejected() {
    let toml_content = r#"
[engine]
max_parallelism = 0
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    assert!(AppConfig::load(tmp.path()).is_err());
}

#[test]
fn test_missing_file_is_config_not_found() {
    let err = AppConfig::load(std::path::Path::new("/nonexistent/conductor.toml")).unwrap_err();
    assert!(err.to_string().contains("not found"));
}
