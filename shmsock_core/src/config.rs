/// Configuration file support for SHMSOCK
///
/// An endpoint's identity, directory namespace, ring size and timeouts come
/// from a `SocketConfig`, loaded from TOML/YAML or built in code. Supports
/// auto-detection of file format and multiple search paths.
use crate::core::address::{is_valid_name, EndpointId};
use crate::error::{ShmsockError, ShmsockResult};
use crate::memory::platform::MAX_BUFFER_ORDER;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding [`SocketConfig::endpoint_id`]
pub const ENDPOINT_ID_ENV: &str = "SHMSOCK_ENDPOINT_ID";

fn default_namespace() -> String {
    "shmsock".to_string()
}

fn default_buffer_order() -> u8 {
    5
}

fn default_handshake_timeout_ms() -> u64 {
    5000
}

fn default_shutdown_timeout_ms() -> u64 {
    5000
}

fn default_poll_interval_ms() -> u64 {
    10
}

/// Per-endpoint socket configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketConfig {
    /// Id under which peers reach this endpoint
    #[serde(default)]
    pub endpoint_id: u16,

    /// Root of the rendezvous directory tree
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// log2 of the ring size in pages (5 = 32 pages)
    #[serde(default = "default_buffer_order")]
    pub buffer_order: u8,

    #[serde(default)]
    pub send_timeout_ms: Option<u64>,

    #[serde(default)]
    pub recv_timeout_ms: Option<u64>,

    #[serde(default)]
    pub accept_timeout_ms: Option<u64>,

    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,

    /// How long a connector waits for the acceptor to open the ring window
    /// after its pending entry was consumed
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    /// How long an accepted endpoint waits for its producer to acknowledge
    /// a forced shutdown before unmapping anyway
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,

    /// Upper bound between re-checks of a blocked call's wake condition
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            endpoint_id: 0,
            namespace: default_namespace(),
            buffer_order: default_buffer_order(),
            send_timeout_ms: None,
            recv_timeout_ms: None,
            accept_timeout_ms: None,
            connect_timeout_ms: None,
            handshake_timeout_ms: default_handshake_timeout_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl SocketConfig {
    /// Default configuration for endpoint `id`
    pub fn for_endpoint(id: EndpointId) -> Self {
        Self {
            endpoint_id: id.0,
            ..Self::default()
        }
    }

    pub fn endpoint(&self) -> EndpointId {
        EndpointId(self.endpoint_id)
    }

    pub fn send_timeout(&self) -> Option<Duration> {
        self.send_timeout_ms.map(Duration::from_millis)
    }

    pub fn recv_timeout(&self) -> Option<Duration> {
        self.recv_timeout_ms.map(Duration::from_millis)
    }

    pub fn accept_timeout(&self) -> Option<Duration> {
        self.accept_timeout_ms.map(Duration::from_millis)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Check value ranges
    pub fn validate(&self) -> ShmsockResult<()> {
        if self.buffer_order > MAX_BUFFER_ORDER {
            return Err(ShmsockError::config(format!(
                "buffer_order {} exceeds maximum {}",
                self.buffer_order, MAX_BUFFER_ORDER
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(ShmsockError::config("poll_interval_ms must be positive"));
        }
        if !is_valid_name(&self.namespace) {
            return Err(ShmsockError::config(format!(
                "Invalid namespace '{}'",
                self.namespace
            )));
        }
        Ok(())
    }

    /// Apply `SHMSOCK_ENDPOINT_ID` if it is set
    pub fn with_env_overrides(mut self) -> ShmsockResult<Self> {
        if let Ok(raw) = std::env::var(ENDPOINT_ID_ENV) {
            let id: EndpointId = raw.parse().map_err(|e| {
                ShmsockError::config(format!("{} is not a valid endpoint id: {}", ENDPOINT_ID_ENV, e))
            })?;
            self.endpoint_id = id.0;
        }
        Ok(self)
    }

    /// Load config from a file (auto-detect format)
    pub fn from_file<P: AsRef<Path>>(path: P) -> ShmsockResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ShmsockError::config(format!("Failed to read config file: {}", e)))?;

        let config = match path.extension().and_then(|s| s.to_str()) {
            Some("toml") => Self::from_toml(&contents)?,
            Some("yaml") | Some("yml") => Self::from_yaml(&contents)?,
            _ => Self::from_toml(&contents).or_else(|_| Self::from_yaml(&contents))?,
        };
        log::info!("Loaded socket config from {}", path.display());
        Ok(config)
    }

    /// Parse config from TOML string
    pub fn from_toml(contents: &str) -> ShmsockResult<Self> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse config from YAML string
    pub fn from_yaml(contents: &str) -> ShmsockResult<Self> {
        let config: Self = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Find and load config file from standard search paths
    ///
    /// Search order:
    /// 1. ./shmsock.toml or ./shmsock.yaml
    /// 2. ~/.shmsock/config.toml or ~/.shmsock/config.yaml
    /// 3. /etc/shmsock/config.toml or /etc/shmsock/config.yaml
    pub fn find_and_load() -> ShmsockResult<Self> {
        for path in Self::get_search_paths() {
            if path.exists() {
                return Self::from_file(&path)?.with_env_overrides();
            }
        }

        Err(ShmsockError::config(
            "No config file found in standard locations",
        ))
    }

    /// Get standard config file search paths
    pub fn get_search_paths() -> Vec<PathBuf> {
        let mut paths = vec![
            PathBuf::from("shmsock.toml"),
            PathBuf::from("shmsock.yaml"),
            PathBuf::from("shmsock.yml"),
        ];

        if let Some(home) = dirs::home_dir() {
            let user_dir = home.join(".shmsock");
            paths.push(user_dir.join("config.toml"));
            paths.push(user_dir.join("config.yaml"));
            paths.push(user_dir.join("config.yml"));
        }

        paths.push(PathBuf::from("/etc/shmsock/config.toml"));
        paths.push(PathBuf::from("/etc/shmsock/config.yaml"));

        paths
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_toml() {
        let toml_str = r#"
            endpoint_id = 3
            namespace = "lab"
            buffer_order = 2
            recv_timeout_ms = 250
        "#;

        let config = SocketConfig::from_toml(toml_str).unwrap();
        assert_eq!(config.endpoint(), EndpointId(3));
        assert_eq!(config.namespace, "lab");
        assert_eq!(config.buffer_order, 2);
        assert_eq!(config.recv_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.send_timeout(), None);
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_parse_yaml() {
        let yaml_str = r#"
            endpoint_id: 9
            accept_timeout_ms: 1000
            poll_interval_ms: 2
        "#;

        let config = SocketConfig::from_yaml(yaml_str).unwrap();
        assert_eq!(config.endpoint(), EndpointId(9));
        assert_eq!(config.namespace, "shmsock");
        assert_eq!(config.buffer_order, 5);
        assert_eq!(config.accept_timeout(), Some(Duration::from_secs(1)));
        assert_eq!(config.poll_interval(), Duration::from_millis(2));
    }

    #[test]
    fn test_validation() {
        assert!(SocketConfig::default().validate().is_ok());
        assert!(SocketConfig::from_toml("buffer_order = 17").is_err());
        assert!(SocketConfig::from_toml("poll_interval_ms = 0").is_err());
        assert!(SocketConfig::from_toml("namespace = \"a/b\"").is_err());
        assert!(matches!(
            SocketConfig::from_toml("endpoint_id = \"x\""),
            Err(ShmsockError::Config(_))
        ));
    }

    #[test]
    fn test_search_paths() {
        let paths = SocketConfig::get_search_paths();
        assert_eq!(paths[0], PathBuf::from("shmsock.toml"));
        assert!(paths.iter().any(|p| p.ends_with("etc/shmsock/config.toml")));
    }
}
