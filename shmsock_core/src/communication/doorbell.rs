//! Doorbells: cross-endpoint wakeups
//!
//! A doorbell is a scheduling hint, never a correctness mechanism. Every wait
//! takes a predicate over shared state and re-checks it after each wakeup and
//! at least once per poll interval, so a lost or spurious ring only costs
//! latency.

use super::cancel::CancelToken;
use crate::core::address::EndpointId;
use crate::error::{ShmsockError, ShmsockResult};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default interval at which waits re-check their condition
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Local name of one end of a notification channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Port(pub u32);

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a wait returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    Ready,
    Cancelled,
    TimedOut,
}

impl WaitResult {
    pub fn into_result(self) -> ShmsockResult<()> {
        match self {
            WaitResult::Ready => Ok(()),
            WaitResult::Cancelled => Err(ShmsockError::Cancelled),
            WaitResult::TimedOut => Err(ShmsockError::Timeout),
        }
    }
}

/// Notification primitive consumed by endpoints
pub trait NotificationChannel: Send + Sync {
    /// Open an unbound port that `peer` may bind to; the port number is the
    /// token the peer needs
    fn allocate(&self, peer: EndpointId) -> ShmsockResult<Port>;

    /// Bind a new local port to `remote_port`, previously allocated by `peer`
    fn bind(&self, peer: EndpointId, remote_port: Port) -> ShmsockResult<Port>;

    /// Ring the peer bound to `port`; a no-op while nobody is bound
    fn signal(&self, port: Port) -> ShmsockResult<()>;

    /// Block until `ready` holds, the token is cancelled or `timeout` elapses
    fn wait(
        &self,
        port: Port,
        ready: &dyn Fn() -> bool,
        timeout: Option<Duration>,
        cancel: &CancelToken,
    ) -> WaitResult;

    /// Release a port
    fn close(&self, port: Port) -> ShmsockResult<()>;
}

#[derive(Default)]
struct Bell {
    rings: Mutex<u64>,
    cond: Condvar,
}

impl Bell {
    fn ring(&self) {
        let mut rings = self.rings.lock();
        *rings = rings.wrapping_add(1);
        self.cond.notify_all();
    }

    fn rings(&self) -> u64 {
        *self.rings.lock()
    }

    /// Sleep until the ring count moves past `seen` or `slice` elapses
    fn wait_change(&self, seen: &mut u64, slice: Duration) {
        let mut rings = self.rings.lock();
        if *rings == *seen {
            let _ = self.cond.wait_for(&mut rings, slice);
        }
        *seen = *rings;
    }
}

struct PortState {
    expected_peer: EndpointId,
    remote: Option<(EndpointId, Port)>,
    bell: Arc<Bell>,
}

/// Shared event-channel table for every endpoint on this host
pub struct EventHub {
    ports: Mutex<HashMap<(EndpointId, Port), PortState>>,
    next_port: AtomicU32,
    poll_interval: Duration,
}

impl EventHub {
    pub fn new(poll_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            ports: Mutex::new(HashMap::new()),
            next_port: AtomicU32::new(1),
            poll_interval: poll_interval.max(Duration::from_millis(1)),
        })
    }

    /// View of the hub as seen by endpoint `local`
    pub fn for_endpoint(self: &Arc<Self>, local: EndpointId) -> LoopbackEvents {
        LoopbackEvents {
            hub: Arc::clone(self),
            local,
        }
    }

    /// Number of ports not yet closed
    pub fn open_ports(&self) -> usize {
        self.ports.lock().len()
    }

    fn bell(&self, key: (EndpointId, Port)) -> Option<Arc<Bell>> {
        self.ports.lock().get(&key).map(|s| Arc::clone(&s.bell))
    }
}

impl fmt::Debug for EventHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHub")
            .field("open_ports", &self.open_ports())
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

/// [`NotificationChannel`] bound to one endpoint of an [`EventHub`]
#[derive(Debug, Clone)]
pub struct LoopbackEvents {
    hub: Arc<EventHub>,
    local: EndpointId,
}

impl NotificationChannel for LoopbackEvents {
    fn allocate(&self, peer: EndpointId) -> ShmsockResult<Port> {
        let port = Port(self.hub.next_port.fetch_add(1, Ordering::Relaxed));
        self.hub.ports.lock().insert(
            (self.local, port),
            PortState {
                expected_peer: peer,
                remote: None,
                bell: Arc::new(Bell::default()),
            },
        );
        Ok(port)
    }

    fn bind(&self, peer: EndpointId, remote_port: Port) -> ShmsockResult<Port> {
        let mut ports = self.hub.ports.lock();
        let remote = ports.get_mut(&(peer, remote_port)).ok_or_else(|| {
            ShmsockError::PeerUnreachable(format!(
                "Endpoint {} has no port {}",
                peer, remote_port
            ))
        })?;
        if remote.expected_peer != self.local || remote.remote.is_some() {
            return Err(ShmsockError::PeerUnreachable(format!(
                "Port {} of endpoint {} is not open for endpoint {}",
                remote_port, peer, self.local
            )));
        }

        let port = Port(self.hub.next_port.fetch_add(1, Ordering::Relaxed));
        remote.remote = Some((self.local, port));
        ports.insert(
            (self.local, port),
            PortState {
                expected_peer: peer,
                remote: Some((peer, remote_port)),
                bell: Arc::new(Bell::default()),
            },
        );
        Ok(port)
    }

    fn signal(&self, port: Port) -> ShmsockResult<()> {
        let bell = {
            let ports = self.hub.ports.lock();
            let state = ports.get(&(self.local, port)).ok_or_else(|| {
                ShmsockError::invalid_state(format!("Port {} is not open", port))
            })?;
            state
                .remote
                .and_then(|key| ports.get(&key))
                .map(|remote| Arc::clone(&remote.bell))
        };
        if let Some(bell) = bell {
            bell.ring();
        }
        Ok(())
    }

    fn wait(
        &self,
        port: Port,
        ready: &dyn Fn() -> bool,
        timeout: Option<Duration>,
        cancel: &CancelToken,
    ) -> WaitResult {
        let deadline = timeout.map(|t| Instant::now() + t);
        let bell = self.hub.bell((self.local, port));
        let mut seen = bell.as_ref().map(|b| b.rings()).unwrap_or(0);

        loop {
            if ready() {
                return WaitResult::Ready;
            }
            if cancel.is_cancelled() {
                return WaitResult::Cancelled;
            }

            let mut slice = self.hub.poll_interval;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return WaitResult::TimedOut;
                }
                slice = slice.min(deadline - now);
            }

            match &bell {
                Some(bell) => bell.wait_change(&mut seen, slice),
                None => std::thread::sleep(slice),
            }
        }
    }

    fn close(&self, port: Port) -> ShmsockResult<()> {
        let mut ports = self.hub.ports.lock();
        let state = ports.remove(&(self.local, port)).ok_or_else(|| {
            ShmsockError::invalid_state(format!("Port {} is not open", port))
        })?;
        if let Some(key) = state.remote {
            if let Some(remote) = ports.get_mut(&key) {
                remote.remote = None;
            }
        }
        Ok(())
    }
}

/// One endpoint's end of a bound notification channel
#[derive(Clone)]
pub struct Doorbell {
    channel: Arc<dyn NotificationChannel>,
    port: Port,
    cancel: CancelToken,
}

impl Doorbell {
    pub fn new(channel: Arc<dyn NotificationChannel>, port: Port, cancel: CancelToken) -> Self {
        Self {
            channel,
            port,
            cancel,
        }
    }

    pub fn port(&self) -> Port {
        self.port
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Wake the peer; failures are logged, the peer re-polls anyway
    pub fn ring(&self) {
        if let Err(e) = self.channel.signal(self.port) {
            log::debug!("Doorbell on port {} not delivered: {}", self.port, e);
        }
    }

    pub fn wait_until(&self, ready: impl Fn() -> bool, timeout: Option<Duration>) -> WaitResult {
        self.channel.wait(self.port, &ready, timeout, &self.cancel)
    }

    /// Like [`Doorbell::wait_until`] with an absolute deadline, for loops that
    /// wait more than once against one budget
    pub fn wait_until_deadline(
        &self,
        ready: impl Fn() -> bool,
        deadline: Option<Instant>,
    ) -> WaitResult {
        let timeout = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        if timeout == Some(Duration::ZERO) {
            if ready() {
                return WaitResult::Ready;
            }
            return WaitResult::TimedOut;
        }
        self.wait_until(ready, timeout)
    }

    pub fn close(&self) -> ShmsockResult<()> {
        self.channel.close(self.port)
    }
}

impl fmt::Debug for Doorbell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Doorbell").field("port", &self.port).finish()
    }
}
