//! relay.toml 통합 설정 테스트
//!
//! - relay.toml.example 파싱 테스트
//! - 부분 설정 로딩 테스트
//! - 환경변수 우선순위 테스트
//! - 빈 파일 / 잘못된 형식 에러 테스트

use std::io::Write;

use relay_core::config::{RelayConfig, WaitCloseMode};
use relay_core::error::{ConfigError, RelayError};

// =============================================================================
// relay.toml.example 파싱 테스트
// =============================================================================

#[test]
fn example_config_parses_and_validates() {
    let content = include_str!("../../../relay.toml.example");
    let config = RelayConfig::parse(content).expect("example config should parse");
    config
        .validate()
        .expect("example config should pass validation");

    let (kind, settings) = config.queue.selected().expect("one queue type");
    assert_eq!(kind, "mem");
    assert_eq!(settings["events"], 4096);
    assert_eq!(settings["flush_min_events"], 2048);
}

#[test]
fn example_config_matches_code_defaults() {
    let content = include_str!("../../../relay.toml.example");
    let parsed = RelayConfig::parse(content).expect("should parse");
    let defaults = RelayConfig::default();

    assert_eq!(parsed.general.log_level, defaults.general.log_level);
    assert_eq!(parsed.general.log_format, defaults.general.log_format);
    assert_eq!(parsed.output, defaults.output);
    assert_eq!(parsed.pipeline, defaults.pipeline);
    assert_eq!(parsed.metrics, defaults.metrics);
}

// =============================================================================
// 부분 설정 테스트
// =============================================================================

#[test]
fn partial_config_output_only() {
    let toml = r#"
[output]
type = "test"
worker = 3
"#;
    let config = RelayConfig::parse(toml).expect("should parse");
    assert_eq!(config.output.kind, "test");
    assert_eq!(config.output.worker, 3);
    // 나머지는 기본값 유지
    assert_eq!(config.output.bulk_max_size, 50);
    assert_eq!(config.queue.selected().map(|(k, _)| k), Some("mem"));
}

#[test]
fn partial_config_disk_queue() {
    let toml = r#"
[queue.disk]
path = "/tmp/relay-queue"
max_events = 16
"#;
    let config = RelayConfig::parse(toml).expect("should parse");
    let (kind, settings) = config.queue.selected().expect("one queue type");
    assert_eq!(kind, "disk");
    assert_eq!(settings["path"], "/tmp/relay-queue");
    config.validate().expect("should validate");
}

#[test]
fn output_extra_keys_are_kept_in_settings() {
    let toml = r#"
[output]
type = "test"
fail_every_batch = 4
max_wait_ms = 20
"#;
    let config = RelayConfig::parse(toml).expect("should parse");
    assert_eq!(config.output.settings["fail_every_batch"], 4);
    assert_eq!(config.output.settings["max_wait_ms"], 20);
    assert!(!config.output.settings.contains_key("worker"));
}

// =============================================================================
// 환경변수 우선순위 테스트
// =============================================================================

fn with_env<T>(key: &str, value: &str, f: impl FnOnce() -> T) -> T {
    let original = std::env::var(key).ok();
    // SAFETY: serial_test로 직렬화되어 환경변수 조작이 안전합니다.
    unsafe { std::env::set_var(key, value) };
    let result = f();
    // SAFETY: 테스트 정리
    unsafe {
        match original {
            Some(val) => std::env::set_var(key, val),
            None => std::env::remove_var(key),
        }
    }
    result
}

#[test]
#[serial_test::serial]
fn env_override_takes_precedence_over_toml() {
    let toml = r#"
[output]
worker = 2
"#;
    let worker = with_env("RELAY_OUTPUT_WORKER", "8", || {
        let mut config = RelayConfig::parse(toml).expect("should parse");
        config.apply_env_overrides();
        config.output.worker
    });
    assert_eq!(worker, 8);
}

#[test]
#[serial_test::serial]
fn env_override_wait_close_mode() {
    let mode = with_env("RELAY_PIPELINE_WAIT_CLOSE_MODE", "pipeline", || {
        let mut config = RelayConfig::default();
        config.apply_env_overrides();
        config.pipeline.wait_close_mode
    });
    assert_eq!(mode, WaitCloseMode::Pipeline);
}

#[test]
#[serial_test::serial]
fn env_override_unparsable_keeps_toml_value() {
    let toml = r#"
[output]
max_retries = 5
"#;
    let retries = with_env("RELAY_OUTPUT_MAX_RETRIES", "many", || {
        let mut config = RelayConfig::parse(toml).expect("should parse");
        config.apply_env_overrides();
        config.output.max_retries
    });
    assert_eq!(retries, 5);
}

// =============================================================================
// 에러 케이스 테스트
// =============================================================================

#[test]
fn empty_string_parses_with_defaults() {
    let config = RelayConfig::parse("").expect("empty should parse");
    assert_eq!(config.general.log_level, "info");
}

#[test]
fn malformed_toml_returns_parse_error() {
    let result = RelayConfig::parse("[output\nworker = 1");
    assert!(matches!(
        result,
        Err(RelayError::Config(ConfigError::ParseFailed { .. }))
    ));
}

#[test]
fn wrong_type_for_numeric_field() {
    let result = RelayConfig::parse("[output]\nworker = \"four\"");
    assert!(matches!(
        result,
        Err(RelayError::Config(ConfigError::ParseFailed { .. }))
    ));
}

#[tokio::test]
async fn from_file_nonexistent_returns_file_not_found() {
    let result = RelayConfig::from_file("/tmp/relay_test_nonexistent_12345.toml").await;
    assert!(matches!(
        result,
        Err(RelayError::Config(ConfigError::FileNotFound { .. }))
    ));
}

#[tokio::test]
async fn from_file_rejects_invalid_values() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    writeln!(file, "[output]\nbulk_max_size = 0").expect("write");

    let err = RelayConfig::from_file(file.path())
        .await
        .expect_err("zero bulk size should fail");
    assert!(err.to_string().contains("output.bulk_max_size"));
}

#[tokio::test]
#[serial_test::serial]
async fn load_example_config_from_disk() {
    let manifest_dir = env!("CARGO_MANIFEST_DIR");
    let example_path = format!("{}/../../relay.toml.example", manifest_dir);

    let config = RelayConfig::load(&example_path)
        .await
        .expect("example should load");
    assert_eq!(config.output.kind, "console");
}
