//! Unit tests for configuration loading and endpoint resolution
//!
//! Tests cover:
//! - Endpoint priority order (CLI > env > TOML > default)
//! - Missing or malformed TOML files degrade to defaults
//! - `[sync]` tunables override compiled defaults
//!
//! Note: Uses serial_test crate to prevent ENV variable race conditions.
//! Tests that manipulate COSTLINK_WS_URL are marked with #[serial].

use costlink_common::config::{
    resolve_endpoint, SyncConfig, TomlConfig, DEFAULT_ENDPOINT, ENDPOINT_ENV_VAR,
};
use costlink_common::Error;
use serial_test::serial;
use std::env;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("Failed to create temp file");
    file.write_all(content.as_bytes()).expect("Failed to write config");
    file
}

#[test]
#[serial]
fn test_default_endpoint_when_nothing_configured() {
    env::remove_var(ENDPOINT_ENV_VAR);
    assert_eq!(resolve_endpoint(None, ENDPOINT_ENV_VAR, None), DEFAULT_ENDPOINT);
}

#[test]
#[serial]
fn test_env_var_beats_config_file() {
    env::set_var(ENDPOINT_ENV_VAR, "ws://env-host:9000/ws");
    let resolved = resolve_endpoint(None, ENDPOINT_ENV_VAR, Some("ws://file-host/ws"));
    env::remove_var(ENDPOINT_ENV_VAR);

    assert_eq!(resolved, "ws://env-host:9000/ws");
}

#[test]
#[serial]
fn test_cli_beats_env_var() {
    env::set_var(ENDPOINT_ENV_VAR, "ws://env-host:9000/ws");
    let resolved = resolve_endpoint(Some("wss://cli-host/ws"), ENDPOINT_ENV_VAR, None);
    env::remove_var(ENDPOINT_ENV_VAR);

    assert_eq!(resolved, "wss://cli-host/ws");
}

#[test]
#[serial]
fn test_empty_env_var_is_ignored() {
    env::set_var(ENDPOINT_ENV_VAR, "   ");
    let resolved = resolve_endpoint(None, ENDPOINT_ENV_VAR, Some("ws://file-host/ws"));
    env::remove_var(ENDPOINT_ENV_VAR);

    assert_eq!(resolved, "ws://file-host/ws");
}

#[test]
#[serial]
fn test_load_applies_sync_table() {
    env::remove_var(ENDPOINT_ENV_VAR);
    let file = write_config(
        r#"
[sync]
endpoint_url = "ws://backend.local:8100/ws"
heartbeat_interval_ms = 5000
request_timeout_ms = 1500
reconnect_base_delay_ms = 250
reconnect_max_delay_ms = 8000
max_reconnect_attempts = 3
"#,
    );

    let config = SyncConfig::load(None, Some(file.path())).expect("config should load");

    assert_eq!(config.endpoint_url, "ws://backend.local:8100/ws");
    assert_eq!(config.heartbeat_interval, Duration::from_millis(5000));
    assert_eq!(config.request_timeout, Duration::from_millis(1500));
    assert_eq!(config.reconnect.base_delay, Duration::from_millis(250));
    assert_eq!(config.reconnect.max_delay, Duration::from_millis(8000));
    assert_eq!(config.reconnect.max_attempts, 3);
    // Untouched keys keep their defaults
    assert_eq!(config.connect_timeout, Duration::from_secs(10));
}

#[test]
#[serial]
fn test_malformed_file_falls_back_to_defaults() {
    env::remove_var(ENDPOINT_ENV_VAR);
    let file = write_config("[sync\nendpoint_url = ");

    let config = SyncConfig::load(None, Some(file.path())).expect("malformed file is not fatal");
    assert_eq!(config, SyncConfig::default());
}

#[test]
#[serial]
fn test_missing_file_falls_back_to_defaults() {
    env::remove_var(ENDPOINT_ENV_VAR);
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let missing = dir.path().join("absent.toml");

    let config = SyncConfig::load(None, Some(&missing)).expect("missing file is not fatal");
    assert_eq!(config.endpoint_url, DEFAULT_ENDPOINT);
}

#[test]
#[serial]
fn test_non_websocket_endpoint_is_rejected() {
    env::remove_var(ENDPOINT_ENV_VAR);
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let missing = dir.path().join("absent.toml");

    let result = SyncConfig::load(Some("http://backend/ws"), Some(&missing));
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
fn test_empty_toml_is_valid() {
    let config = TomlConfig::from_toml_str("").expect("empty config is valid");
    assert!(config.sync.endpoint_url.is_none());
}
