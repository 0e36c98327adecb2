//! Rendezvous directory: service discovery and connection handshaking
//!
//! Layout under the configured namespace:
//!
//! ```text
//! /{namespace}/service/{name}           = listener endpoint id ("" while only bound)
//! /{namespace}/service/{name}/{token}   = connector endpoint id, while pending
//! ```
//!
//! `{token}` is the grant token of the connector's descriptor page.

use crate::core::address::ServiceName;
use crate::error::{ShmsockError, ShmsockResult};
use crate::memory::grant::GrantToken;
use crossbeam::channel::{Receiver, RecvTimeoutError};
use std::time::Duration;

/// Shared hierarchical key-value namespace with watches
///
/// Paths are absolute and `/`-separated. A path "exists" when it holds a value
/// or has descendants.
pub trait RendezvousDirectory: Send + Sync {
    fn write(&self, path: &str, value: &str) -> ShmsockResult<()>;

    fn read(&self, path: &str) -> ShmsockResult<Option<String>>;

    fn exists(&self, dir: &str, key: &str) -> ShmsockResult<bool>;

    /// Keys of the immediate children of `dir`
    fn list(&self, dir: &str) -> ShmsockResult<Vec<String>>;

    /// Remove `dir/key` and everything below it; returns whether anything was removed
    fn remove(&self, dir: &str, key: &str) -> ShmsockResult<bool>;

    /// Write `value` only if `path` does not exist yet, as one atomic step
    fn publish_if_absent(&self, path: &str, value: &str) -> ShmsockResult<bool>;

    /// Write `value` at `dir/key` only while `dir` itself holds a value, as one
    /// atomic step
    fn publish_child(&self, dir: &str, key: &str, value: &str) -> ShmsockResult<bool>;

    /// Read `path` and remove its subtree as one atomic step
    ///
    /// Of several concurrent callers at most one gets `Some`.
    fn take(&self, path: &str) -> ShmsockResult<Option<String>>;

    /// Report changes at, above or below `path`
    ///
    /// A new watch fires once immediately with its own path.
    fn watch(&self, path: &str) -> ShmsockResult<Watch>;

    fn unwatch(&self, watch: Watch) -> ShmsockResult<()>;
}

/// Join a directory and a key into a path
pub fn join(dir: &str, key: &str) -> String {
    if key.is_empty() {
        dir.to_string()
    } else {
        format!("{}/{}", dir.trim_end_matches('/'), key)
    }
}

/// Registered watch; events are the changed paths
#[derive(Debug)]
pub struct Watch {
    id: u64,
    path: String,
    events: Receiver<String>,
}

impl Watch {
    pub fn new(id: u64, path: impl Into<String>, events: Receiver<String>) -> Self {
        Self {
            id,
            path: path.into(),
            events,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Next changed path, or `None` if nothing changed within `timeout`
    pub fn next(&self, timeout: Duration) -> ShmsockResult<Option<String>> {
        match self.events.recv_timeout(timeout) {
            Ok(path) => Ok(Some(path)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(ShmsockError::PeerUnreachable(format!(
                "Directory dropped watch on {}",
                self.path
            ))),
        }
    }
}

/// Path builder for one directory namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServicePaths {
    service_dir: String,
}

impl ServicePaths {
    pub fn new(namespace: &str) -> Self {
        Self {
            service_dir: format!("/{}/service", namespace.trim_matches('/')),
        }
    }

    /// `/{namespace}/service`
    pub fn service_dir(&self) -> &str {
        &self.service_dir
    }

    /// `/{namespace}/service/{name}`
    pub fn service(&self, name: &ServiceName) -> String {
        join(&self.service_dir, name.as_str())
    }

    /// `/{namespace}/service/{name}/{token}`
    pub fn pending(&self, name: &ServiceName, token: GrantToken) -> String {
        join(&self.service(name), &token.to_string())
    }
}
