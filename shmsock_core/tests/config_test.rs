/// Loading socket configuration from files
use shmsock_core::config::ENDPOINT_ID_ENV;
use shmsock_core::{EndpointId, ShmsockError, SocketConfig};
use std::fs;
use std::time::Duration;

#[test]
fn test_load_toml_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("socket.toml");
    fs::write(
        &path,
        r#"
endpoint_id = 12
namespace = "robots"
buffer_order = 3
send_timeout_ms = 100
shutdown_timeout_ms = 750
"#,
    )
    .unwrap();

    let config = SocketConfig::from_file(&path).unwrap();
    assert_eq!(config.endpoint(), EndpointId(12));
    assert_eq!(config.namespace, "robots");
    assert_eq!(config.buffer_order, 3);
    assert_eq!(config.send_timeout(), Some(Duration::from_millis(100)));
    assert_eq!(config.shutdown_timeout(), Duration::from_millis(750));
    assert_eq!(config.handshake_timeout(), Duration::from_secs(5));
}

#[test]
fn test_load_yaml_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("socket.yml");
    fs::write(&path, "endpoint_id: 4\nconnect_timeout_ms: 20\n").unwrap();

    let config = SocketConfig::from_file(&path).unwrap();
    assert_eq!(config.endpoint(), EndpointId(4));
    assert_eq!(config.connect_timeout(), Some(Duration::from_millis(20)));
}

#[test]
fn test_unknown_extension_tries_both_formats() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("socket.conf");
    fs::write(&path, "endpoint_id: 8\n").unwrap();
    assert_eq!(SocketConfig::from_file(&path).unwrap().endpoint(), EndpointId(8));
}

#[test]
fn test_invalid_file_is_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("socket.toml");
    fs::write(&path, "buffer_order = 40\n").unwrap();
    assert!(matches!(SocketConfig::from_file(&path), Err(ShmsockError::Config(_))));

    let missing = dir.path().join("missing.toml");
    assert!(matches!(SocketConfig::from_file(&missing), Err(ShmsockError::Config(_))));
}

#[test]
fn test_env_override() {
    std::env::set_var(ENDPOINT_ID_ENV, "31");
    let config = SocketConfig::default().with_env_overrides().unwrap();
    assert_eq!(config.endpoint(), EndpointId(31));

    std::env::set_var(ENDPOINT_ID_ENV, "not-a-number");
    assert!(SocketConfig::default().with_env_overrides().is_err());
    std::env::remove_var(ENDPOINT_ID_ENV);
}
