//! Integration tests for configuration files and CLI overrides

use argos_pscan::config::{load_config, merge_cli_args, AppConfig};
use argos_pscan::error::PscanError;
use std::io::Write;

fn write_config(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(content.as_bytes()).expect("write");
    file
}

#[test]
fn test_load_full_config() {
    let file = write_config(
        r#"
[pscan]
threads = 3
max_body_size_bytes = 65536
max_alerts_per_rule = 10
scan_only_in_scope = true
enable_tags = false
slow_rule_threshold_ms = 250
poll_interval_ms = 100

[proxy]
scope = ["^https://app\\.test/"]
"#,
    );

    let config = load_config(file.path()).expect("load");
    let o = &config.options;
    assert_eq!(o.threads, 3);
    assert_eq!(o.max_body_size_bytes, 65536);
    assert_eq!(o.max_alerts_per_rule, 10);
    assert!(o.scan_only_in_scope);
    assert!(!o.enable_tags);
    assert_eq!(o.slow_rule_threshold_ms, 250);
    assert_eq!(o.poll_interval_ms, 100);
    assert_eq!(config.scope, vec![r"^https://app\.test/".to_string()]);
}

#[test]
fn test_missing_file_is_io_error() {
    let dir = tempfile::tempdir().expect("dir");
    let err = load_config(&dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, PscanError::IoError(_)));
}

#[test]
fn test_malformed_toml_rejected() {
    let file = write_config("[pscan\nthreads = ");
    assert!(matches!(
        load_config(file.path()),
        Err(PscanError::TomlError(_))
    ));
}

#[test]
fn test_cli_overrides_file_values() {
    let file = write_config("[pscan]\nthreads = 2\nmax_alerts_per_rule = 4\n");
    let mut config = load_config(file.path()).expect("load");

    merge_cli_args(
        &mut config,
        Some(8),
        Some(1024),
        None,
        Some(vec!["^http://in\\.test/".to_string()]),
    )
    .expect("merge");

    assert_eq!(config.options.threads, 8);
    assert_eq!(config.options.max_body_size_bytes, 1024);
    assert_eq!(config.options.max_alerts_per_rule, 4);
    assert!(config.options.scan_only_in_scope);
    assert_eq!(config.scope.len(), 1);
}

#[test]
fn test_cli_zero_threads_rejected() {
    let mut config = AppConfig::default();
    let err = merge_cli_args(&mut config, Some(0), None, None, None).unwrap_err();
    assert!(matches!(err, PscanError::ConfigError(_)));
}
