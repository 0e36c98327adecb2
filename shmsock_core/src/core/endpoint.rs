//! Socket-facing endpoint
//!
//! ```text
//! Unbound --bind--> Server(bound) --listen--> Server(listening) --close--> Closed
//!    |                                              |
//!    |                                           accept -> new Connected(server role)
//!    +--connect--> Client(connecting) --> Connected(client role) --close--> Closing --> Closed
//! ```
//!
//! Bytes flow one way per connection: the connecting endpoint sends, the
//! accepted endpoint receives.

use super::address::{EndpointId, ServiceName};
use super::handshake::{Grants, Handshake, Link};
use crate::backend::Backend;
use crate::communication::cancel::CancelToken;
use crate::communication::rendezvous::ServicePaths;
use crate::config::SocketConfig;
use crate::error::{ShmsockError, ShmsockResult};
use crate::memory::ring::{IoMode, RingBuffer, RingStats};
use parking_lot::Mutex;
use std::fmt;
use std::io;
use std::mem;
use std::net::Shutdown;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Which side of the rendezvous an endpoint took
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Unbound,
    /// Bound, listening or accepted; receives
    Server,
    /// Connecting or connected; sends
    Client,
}

/// Externally visible endpoint state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Unbound,
    Server,
    Client,
    Connected,
    Closing,
    Closed,
}

enum Phase {
    Unbound,
    Bound(ServiceName),
    Listening { name: ServiceName, backlog: usize },
    Connecting(ServiceName),
    Connected(Arc<Connection>),
    Closing,
    Closed,
}

/// Live channel owned by a connected endpoint
struct Connection {
    role: Role,
    service: ServiceName,
    peer: EndpointId,
    ring: RingBuffer,
    grants: Mutex<Option<Grants>>,
    read_shut: AtomicBool,
}

impl Connection {
    fn new(role: Role, service: ServiceName, link: Link) -> Self {
        Self {
            role,
            service,
            peer: link.peer,
            ring: link.ring,
            grants: Mutex::new(Some(link.grants)),
            read_shut: AtomicBool::new(false),
        }
    }

    /// Tear the channel down; safe to call more than once
    fn release(&self, backend: &Backend, config: &SocketConfig) -> ShmsockResult<()> {
        let grants = match self.grants.lock().take() {
            Some(grants) => grants,
            None => return Ok(()),
        };

        let mut result = Ok(());
        match grants {
            Grants::Offered {
                descriptor_token,
                mut chain,
            } => {
                self.ring.announce_sender_shutdown();
                if let Err(e) = chain.revoke(backend.grants.as_ref()) {
                    log::warn!("Revoking ring grants for {} failed: {}", self.service, e);
                    result = Err(e);
                }
                if let Err(e) = backend.grants.revoke(descriptor_token) {
                    log::warn!("Revoking descriptor grant {} failed: {}", descriptor_token, e);
                    result = result.and(Err(e));
                }
            }
            Grants::Mapped { pages } => {
                self.ring.demand_sender_shutdown();
                // The producer may still be writing into pages we are about to drop
                if let Err(e) = self.ring.wait_sender_shutdown(Some(config.shutdown_timeout())) {
                    log::warn!(
                        "Endpoint {} did not acknowledge shutdown of {}: {}",
                        self.peer,
                        self.service,
                        e
                    );
                    result = Err(e);
                }
                for page in pages {
                    if let Err(e) = backend.grants.unmap(page) {
                        log::warn!("Unmapping peer page failed: {}", e);
                        result = result.and(Err(e));
                    }
                }
            }
        }

        if let Err(e) = self.ring.doorbell().close() {
            log::warn!("Closing doorbell port {} failed: {}", self.ring.doorbell().port(), e);
        }
        result
    }
}

/// One end of a shared-memory stream connection
pub struct Endpoint {
    config: SocketConfig,
    backend: Backend,
    paths: ServicePaths,
    phase: Mutex<Phase>,
}

impl Endpoint {
    /// Create an unbound endpoint
    pub fn create(config: SocketConfig, backend: Backend) -> ShmsockResult<Self> {
        config.validate()?;
        if config.endpoint() != backend.endpoint {
            return Err(ShmsockError::config(format!(
                "Config names endpoint {} but backend is attached as {}",
                config.endpoint(),
                backend.endpoint
            )));
        }
        let paths = ServicePaths::new(&config.namespace);
        Ok(Self {
            config,
            backend,
            paths,
            phase: Mutex::new(Phase::Unbound),
        })
    }

    fn accepted(&self, service: ServiceName, link: Link) -> Self {
        let connection = Connection::new(Role::Server, service, link);
        Self {
            config: self.config.clone(),
            backend: self.backend.clone(),
            paths: self.paths.clone(),
            phase: Mutex::new(Phase::Connected(Arc::new(connection))),
        }
    }

    pub fn id(&self) -> EndpointId {
        self.backend.endpoint
    }

    pub fn config(&self) -> &SocketConfig {
        &self.config
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.backend.cancel.clone()
    }

    pub fn state(&self) -> SocketState {
        match &*self.phase.lock() {
            Phase::Unbound => SocketState::Unbound,
            Phase::Bound(_) | Phase::Listening { .. } => SocketState::Server,
            Phase::Connecting(_) => SocketState::Client,
            Phase::Connected(_) => SocketState::Connected,
            Phase::Closing => SocketState::Closing,
            Phase::Closed => SocketState::Closed,
        }
    }

    pub fn role(&self) -> Role {
        match &*self.phase.lock() {
            Phase::Bound(_) | Phase::Listening { .. } => Role::Server,
            Phase::Connecting(_) => Role::Client,
            Phase::Connected(conn) => conn.role,
            Phase::Unbound | Phase::Closing | Phase::Closed => Role::Unbound,
        }
    }

    /// Service name this endpoint is bound to or connected through
    pub fn local_name(&self) -> Option<ServiceName> {
        match &*self.phase.lock() {
            Phase::Bound(name) | Phase::Connecting(name) => Some(name.clone()),
            Phase::Listening { name, .. } => Some(name.clone()),
            Phase::Connected(conn) => Some(conn.service.clone()),
            _ => None,
        }
    }

    pub fn peer(&self) -> Option<EndpointId> {
        self.connection().ok().map(|conn| conn.peer)
    }

    /// Backlog passed to [`Endpoint::listen`]
    pub fn backlog(&self) -> Option<usize> {
        match &*self.phase.lock() {
            Phase::Listening { backlog, .. } => Some(*backlog),
            _ => None,
        }
    }

    pub fn stats(&self) -> Option<RingStats> {
        self.connection().ok().map(|conn| conn.ring.stats())
    }

    /// Claim `name` for this endpoint
    pub fn bind(&self, name: &str) -> ShmsockResult<()> {
        let name = ServiceName::new(name)?;
        let mut phase = self.phase.lock();
        match &*phase {
            Phase::Unbound => {}
            Phase::Bound(bound) | Phase::Listening { name: bound, .. } => {
                return Err(ShmsockError::AlreadyBound(bound.to_string()))
            }
            _ => return Err(ShmsockError::invalid_state("bind is only valid on an unbound endpoint")),
        }

        let path = self.paths.service(&name);
        if !self.backend.directory.publish_if_absent(&path, "")? {
            return Err(ShmsockError::ServiceInUse(name.to_string()));
        }
        log::info!("Endpoint {} bound to {}", self.id(), name);
        *phase = Phase::Bound(name);
        Ok(())
    }

    /// Publish the bound name so that peers can connect
    pub fn listen(&self, backlog: usize) -> ShmsockResult<()> {
        let mut phase = self.phase.lock();
        let name = match &*phase {
            Phase::Bound(name) => name.clone(),
            Phase::Listening { .. } => return Ok(()),
            _ => return Err(ShmsockError::invalid_state("listen requires a bound endpoint")),
        };

        self.backend
            .directory
            .write(&self.paths.service(&name), &self.id().to_string())?;
        log::info!("Endpoint {} listening on {} (backlog {})", self.id(), name, backlog);
        *phase = Phase::Listening { name, backlog };
        Ok(())
    }

    /// Wait for a connection and return the endpoint that receives its bytes
    ///
    /// Several threads may accept on the same listener; each pending
    /// connection is handed to exactly one of them.
    pub fn accept(&self) -> ShmsockResult<Endpoint> {
        let name = match &*self.phase.lock() {
            Phase::Listening { name, .. } => name.clone(),
            _ => return Err(ShmsockError::invalid_state("accept requires a listening endpoint")),
        };

        let link = Handshake::new(&self.backend, &self.config, &self.paths).accept(&name)?;
        log::info!(
            "Endpoint {} accepted connection from {} on {}",
            self.id(),
            link.peer,
            name
        );
        Ok(self.accepted(name, link))
    }

    /// Connect to the endpoint listening on `name`
    pub fn connect(&self, name: &str) -> ShmsockResult<()> {
        let name = ServiceName::new(name)?;
        {
            let mut phase = self.phase.lock();
            if !matches!(*phase, Phase::Unbound) {
                return Err(ShmsockError::invalid_state(
                    "connect is only valid on an unbound endpoint",
                ));
            }
            *phase = Phase::Connecting(name.clone());
        }

        let result = Handshake::new(&self.backend, &self.config, &self.paths).connect(&name);

        let mut phase = self.phase.lock();
        match result {
            Ok(link) if matches!(*phase, Phase::Connecting(_)) => {
                log::info!(
                    "Endpoint {} connected to {} (endpoint {})",
                    self.id(),
                    name,
                    link.peer
                );
                *phase = Phase::Connected(Arc::new(Connection::new(Role::Client, name, link)));
                Ok(())
            }
            Ok(link) => {
                drop(phase);
                // Closed while connecting
                let connection = Connection::new(Role::Client, name, link);
                let _ = connection.release(&self.backend, &self.config);
                Err(ShmsockError::invalid_state("Endpoint closed during connect"))
            }
            Err(e) => {
                if matches!(*phase, Phase::Connecting(_)) {
                    *phase = Phase::Unbound;
                }
                Err(e)
            }
        }
    }

    fn connection(&self) -> ShmsockResult<Arc<Connection>> {
        match &*self.phase.lock() {
            Phase::Connected(conn) => Ok(Arc::clone(conn)),
            _ => Err(ShmsockError::invalid_state("Endpoint is not connected")),
        }
    }

    /// Send bytes to the accepting peer; client role only
    ///
    /// In blocking mode this returns once every byte is in the ring, unless the
    /// peer shut down, the send timeout elapsed or the call was cancelled.
    pub fn send(&self, data: &[u8], mode: IoMode) -> ShmsockResult<usize> {
        let conn = self.connection()?;
        if conn.role != Role::Client {
            return Err(ShmsockError::invalid_state("Accepted endpoints only receive"));
        }
        conn.ring.write(data, mode, self.config.send_timeout())
    }

    /// Receive up to `max_len` bytes; an empty result means orderly close
    ///
    /// `max_len` must be non-zero, so that an empty result is never ambiguous.
    pub fn recv(&self, max_len: usize, mode: IoMode) -> ShmsockResult<Vec<u8>> {
        let mut buf = vec![0u8; max_len];
        let n = self.recv_into(&mut buf, mode)?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Receive into `buf`; server role only
    pub fn recv_into(&self, buf: &mut [u8], mode: IoMode) -> ShmsockResult<usize> {
        if buf.is_empty() {
            return Err(ShmsockError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "recv needs room for at least one byte",
            )));
        }
        let conn = self.connection()?;
        if conn.role != Role::Server {
            return Err(ShmsockError::invalid_state("Connecting endpoints only send"));
        }
        if conn.read_shut.load(Ordering::Acquire) {
            return Ok(0);
        }
        conn.ring.read(buf, mode, self.config.recv_timeout())
    }

    /// Fill `buf` completely unless the stream ends first
    ///
    /// Returns the number of bytes read; less than `buf.len()` only at
    /// end-of-stream or when an error interrupted a partially filled read.
    pub fn recv_exact(&self, buf: &mut [u8]) -> ShmsockResult<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.recv_into(&mut buf[filled..], IoMode::Blocking) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if filled == 0 || e.is_fatal() => return Err(e),
                Err(e) => {
                    log::debug!("recv_exact stopped after {} bytes: {}", filled, e);
                    break;
                }
            }
        }
        Ok(filled)
    }

    /// Announce that this side stops sending and/or receiving
    ///
    /// Only the shared flags change and the peer is rung; memory is reclaimed
    /// by [`Endpoint::close`].
    pub fn shutdown(&self, how: Shutdown) -> ShmsockResult<()> {
        let conn = self.connection()?;
        match (conn.role, how) {
            (Role::Client, Shutdown::Write | Shutdown::Both) => {
                log::debug!("Endpoint {} shutting down its send side", self.id());
                conn.ring.announce_sender_shutdown();
            }
            (Role::Server, Shutdown::Read | Shutdown::Both) => {
                log::debug!("Endpoint {} shutting down its receive side", self.id());
                conn.read_shut.store(true, Ordering::Release);
                conn.ring.demand_sender_shutdown();
            }
            // Nothing flows in the other direction
            _ => {}
        }
        Ok(())
    }

    /// Release everything this endpoint holds; calling it again is a no-op
    ///
    /// An accepted endpoint asks its producer to stop and waits, bounded by the
    /// shutdown timeout, for the acknowledgement before unmapping. On timeout
    /// the memory is unmapped anyway and `Timeout` is returned.
    pub fn close(&self) -> ShmsockResult<()> {
        let previous = {
            let mut phase = self.phase.lock();
            if matches!(*phase, Phase::Closing | Phase::Closed) {
                return Ok(());
            }
            if matches!(*phase, Phase::Connecting(_)) {
                // The connecting thread tears down what it built
                *phase = Phase::Closed;
                return Ok(());
            }
            mem::replace(&mut *phase, Phase::Closing)
        };

        let result = match previous {
            Phase::Bound(name) | Phase::Listening { name, .. } => {
                let removed = self
                    .backend
                    .directory
                    .remove(self.paths.service_dir(), name.as_str());
                log::info!("Endpoint {} released {}", self.id(), name);
                removed.map(|_| ())
            }
            Phase::Connected(conn) => {
                log::info!(
                    "Endpoint {} closing connection with {} on {}",
                    self.id(),
                    conn.peer,
                    conn.service
                );
                conn.release(&self.backend, &self.config)
            }
            _ => Ok(()),
        };

        *self.phase.lock() = Phase::Closed;
        result
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("Closing endpoint {} on drop failed: {}", self.id(), e);
        }
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("name", &self.local_name())
            .finish()
    }
}
