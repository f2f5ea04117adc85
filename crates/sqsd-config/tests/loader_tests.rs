use sqsd_config::{ConfigError, ConfigLoader};
use std::io::Write;
use std::time::Duration;

#[test]
fn test_load_from_explicit_path() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
queue_url = "https://sqs.us-west-2.amazonaws.com/123456789012/jobs"
http_port = 8080
http_path = "/jobs"
http_connections = 4
dedup = true
dedup_table = "sqsd-dedup"
backlog_size = 12
sqs_batch_delete = false
poll_timer = 0.5
"#
    )
    .unwrap();

    let config = ConfigLoader::with_path(file.path()).load().unwrap();
    config.validate().unwrap();

    assert_eq!(config.http_port, 8080);
    assert_eq!(config.http_path, "/jobs");
    assert_eq!(config.http_connections, 4);
    assert_eq!(config.backlog_size, Some(12));
    assert!(!config.sqs_batch_delete);
    assert_eq!(config.poll_interval(), Duration::from_millis(500));
    assert_eq!(config.region().unwrap(), "us-west-2");
    // ceil(4 / 2.5)
    assert_eq!(config.effective_concurrent_sqs_polls(), 2);
    // Untouched options keep their defaults.
    assert_eq!(config.visibility_timeout, 300);
    assert_eq!(config.mime_type, "application/json");
}

#[test]
fn test_missing_explicit_path_is_an_error() {
    let result = ConfigLoader::with_path("/definitely/not/here/sqsd.toml").load();
    assert!(matches!(result, Err(ConfigError::ValidationError(_))));
}

#[test]
fn test_malformed_toml_is_a_parse_error() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "queue_url = ").unwrap();
    let result = ConfigLoader::with_path(file.path()).load();
    assert!(matches!(result, Err(ConfigError::ParseError(_))));
}
