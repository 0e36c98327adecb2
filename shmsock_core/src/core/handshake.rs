//! Connection establishment through the rendezvous directory
//!
//! ```text
//! connector                                   acceptor (listening on name)
//! ---------                                   ----------------------------
//! read service/{name} -> listener id
//! allocate descriptor, doorbell, ring pages
//! offer descriptor, write chain, publish order
//! write service/{name}/{token} = own id  -->  watch fires, take() the entry
//!                                             map descriptor, bind doorbell
//!                                             walk chain, open window, ring
//! entry gone, window open: connected          connected
//! ```
//!
//! The connector allocates and owns all shared memory and is the producer; the
//! acceptor only maps it and is the consumer. Until the acceptor opens the
//! window (`avail_bytes = capacity`) the producer cannot write, so the chain
//! links stored in the page heads stay intact while they are walked.

use crate::backend::Backend;
use crate::communication::doorbell::{Doorbell, Port, WaitResult};
use crate::communication::rendezvous::{ServicePaths, Watch};
use crate::config::SocketConfig;
use crate::core::address::{EndpointId, ServiceName};
use crate::error::{ShmsockError, ShmsockResult};
use crate::memory::chain::CapabilityChain;
use crate::memory::descriptor::DescriptorRef;
use crate::memory::grant::GrantToken;
use crate::memory::page::{Page, PageSet};
use crate::memory::platform::pages_for_order;
use crate::memory::ring::RingBuffer;
use std::sync::Arc;
use std::time::Instant;

/// Memory a connection holds on to until it is closed
#[derive(Debug)]
pub(crate) enum Grants {
    /// Connector side: grants to revoke
    Offered {
        descriptor_token: GrantToken,
        chain: CapabilityChain,
    },
    /// Acceptor side: mappings to drop
    Mapped { pages: Vec<Page> },
}

/// Established channel between two endpoints
#[derive(Debug)]
pub(crate) struct Link {
    pub ring: RingBuffer,
    pub peer: EndpointId,
    pub grants: Grants,
}

/// Connector resources acquired so far
#[derive(Default)]
struct ConnectorSetup {
    descriptor: Option<DescriptorRef>,
    port: Option<Port>,
    descriptor_token: Option<GrantToken>,
    chain: CapabilityChain,
    pending: Option<String>,
}

impl ConnectorSetup {
    fn unwind(mut self, backend: &Backend) {
        // An acceptor racing with us must see end-of-stream, not a live producer
        if let Some(descriptor) = &self.descriptor {
            descriptor.mark_sender_shutdown();
        }
        if let Some(path) = self.pending.take() {
            if let Err(e) = backend.directory.remove(&path, "") {
                log::warn!("Failed to withdraw pending connection {}: {}", path, e);
            }
        }
        if let Err(e) = self.chain.revoke(backend.grants.as_ref()) {
            log::warn!("Failed to revoke ring grants: {}", e);
        }
        if let Some(token) = self.descriptor_token {
            if let Err(e) = backend.grants.revoke(token) {
                log::warn!("Failed to revoke descriptor grant {}: {}", token, e);
            }
        }
        if let Some(port) = self.port {
            if let Err(e) = backend.events.close(port) {
                log::warn!("Failed to close doorbell port {}: {}", port, e);
            }
        }
    }
}

/// Acceptor resources acquired so far
#[derive(Default)]
struct AcceptorSetup {
    descriptor: Option<DescriptorRef>,
    port: Option<Port>,
    mapped: Vec<Page>,
}

impl AcceptorSetup {
    fn unwind(self, backend: &Backend) {
        // Tell the connector to give up instead of waiting for the window
        if let Some(descriptor) = &self.descriptor {
            descriptor.demand_sender_shutdown();
        }
        if let Some(port) = self.port {
            let _ = backend.events.signal(port);
            if let Err(e) = backend.events.close(port) {
                log::warn!("Failed to close doorbell port {}: {}", port, e);
            }
        }
        for page in self.mapped {
            if let Err(e) = backend.grants.unmap(page) {
                log::warn!("Failed to unmap peer page: {}", e);
            }
        }
    }
}

/// Both halves of the rendezvous protocol for one endpoint
pub(crate) struct Handshake<'a> {
    backend: &'a Backend,
    config: &'a SocketConfig,
    paths: &'a ServicePaths,
}

impl<'a> Handshake<'a> {
    pub fn new(backend: &'a Backend, config: &'a SocketConfig, paths: &'a ServicePaths) -> Self {
        Self {
            backend,
            config,
            paths,
        }
    }

    /// Id of the endpoint listening on `name`
    pub fn lookup_listener(&self, name: &ServiceName) -> ShmsockResult<EndpointId> {
        match self.backend.directory.read(&self.paths.service(name))? {
            None => Err(ShmsockError::ServiceNotFound(name.to_string())),
            Some(value) if value.is_empty() => Err(ShmsockError::ServiceNotFound(format!(
                "{} is bound but not listening",
                name
            ))),
            Some(value) => value.parse().map_err(|_| {
                ShmsockError::violation(format!(
                    "Service {} advertises malformed endpoint id '{}'",
                    name, value
                ))
            }),
        }
    }

    /// Connector side: allocate a ring and wait until the listener accepts it
    pub fn connect(&self, name: &ServiceName) -> ShmsockResult<Link> {
        let listener = self.lookup_listener(name)?;
        let deadline = self.config.connect_timeout().map(|t| Instant::now() + t);

        let mut setup = ConnectorSetup::default();
        match self.try_connect(name, listener, deadline, &mut setup) {
            Ok((ring, descriptor_token)) => Ok(Link {
                ring,
                peer: listener,
                grants: Grants::Offered {
                    descriptor_token,
                    chain: std::mem::take(&mut setup.chain),
                },
            }),
            Err(e) => {
                log::debug!("Connect to {} failed, unwinding: {}", name, e);
                setup.unwind(self.backend);
                Err(e)
            }
        }
    }

    fn try_connect(
        &self,
        name: &ServiceName,
        listener: EndpointId,
        deadline: Option<Instant>,
        setup: &mut ConnectorSetup,
    ) -> ShmsockResult<(RingBuffer, GrantToken)> {
        let backend = self.backend;
        let grants = backend.grants.as_ref();

        let descriptor_page = grants.alloc_pages(1)?.into_iter().next().ok_or_else(|| {
            ShmsockError::ResourceExhausted("No page for ring descriptor".to_string())
        })?;
        let descriptor = DescriptorRef::create(descriptor_page)?;
        setup.descriptor = Some(descriptor.clone());

        let port = backend.events.allocate(listener)?;
        setup.port = Some(port);
        descriptor.set_notify_port(port);

        let pages = grants.alloc_pages(pages_for_order(self.config.buffer_order))?;
        let ring = RingBuffer::new(
            descriptor.clone(),
            PageSet::new(pages.clone())?,
            Doorbell::new(Arc::clone(&backend.events), port, backend.cancel.clone()),
        )?;

        // Everything is initialized before the first token leaves this endpoint
        let descriptor_token = grants.offer(descriptor.page(), listener)?;
        setup.descriptor_token = Some(descriptor_token);
        setup.chain = CapabilityChain::offer(grants, &pages, listener, &descriptor)?;

        let pending = self.paths.pending(name, descriptor_token);
        let published = backend.directory.publish_child(
            &self.paths.service(name),
            &descriptor_token.to_string(),
            &backend.endpoint.to_string(),
        )?;
        if !published {
            return Err(ShmsockError::ServiceNotFound(format!(
                "{} closed before the connection was offered",
                name
            )));
        }
        setup.pending = Some(pending.clone());
        log::debug!(
            "Offered {}-byte ring to endpoint {} at {}",
            ring.capacity(),
            listener,
            pending
        );

        let watch = backend.directory.watch(&pending)?;
        let consumed = self.watch_until(&watch, deadline, || {
            Ok((!backend.directory.exists(&pending, "")?).then_some(()))
        });
        self.unwatch(watch);
        consumed?;
        setup.pending = None;

        self.await_window(name, &ring)?;
        Ok((ring, descriptor_token))
    }

    /// Wait for the acceptor to open the ring window
    fn await_window(&self, name: &ServiceName, ring: &RingBuffer) -> ShmsockResult<()> {
        let d = ring.descriptor();
        let service = self.paths.service(name);
        let directory = &self.backend.directory;
        let service_gone = || matches!(directory.read(&service), Ok(None));

        let waited = ring.doorbell().wait_until(
            || d.avail_bytes() != 0 || d.force_sender_shutdown() || service_gone(),
            Some(self.config.handshake_timeout()),
        );

        if d.force_sender_shutdown() {
            return Err(ShmsockError::PeerUnreachable(format!(
                "Listener on {} could not map the ring",
                name
            )));
        }
        let avail = d.avail_bytes();
        if avail == ring.capacity() {
            return Ok(());
        }
        if avail != 0 {
            return Err(ShmsockError::violation(format!(
                "Acceptor opened window of {} bytes on a {}-byte ring",
                avail,
                ring.capacity()
            )));
        }
        if service_gone() {
            return Err(ShmsockError::ServiceNotFound(format!(
                "{} closed before accepting",
                name
            )));
        }
        match waited {
            WaitResult::Ready => Err(ShmsockError::violation("Handshake woke without progress")),
            other => other.into_result(),
        }
    }

    /// Listener side: take one pending connection and map its ring
    pub fn accept(&self, name: &ServiceName) -> ShmsockResult<Link> {
        let backend = self.backend;
        let directory = &backend.directory;
        let service = self.paths.service(name);
        let local = backend.endpoint.to_string();
        let deadline = self.config.accept_timeout().map(|t| Instant::now() + t);

        let watch = directory.watch(&service)?;
        let accepted = self.watch_until(&watch, deadline, || {
            if directory.read(&service)?.as_deref() != Some(local.as_str()) {
                return Err(ShmsockError::invalid_state(format!(
                    "Listener on {} was closed",
                    name
                )));
            }

            for key in directory.list(&service)? {
                let token: GrantToken = match key.parse() {
                    Ok(token) => token,
                    Err(e) => {
                        log::warn!("Ignoring malformed pending entry {}/{}: {}", service, key, e);
                        continue;
                    }
                };
                let path = self.paths.pending(name, token);
                // Another accepter may win the race for this entry
                let value = match directory.take(&path)? {
                    Some(value) => value,
                    None => continue,
                };
                let peer: EndpointId = match value.parse() {
                    Ok(peer) => peer,
                    Err(e) => {
                        log::warn!("Dropped pending connection {}: {}", path, e);
                        continue;
                    }
                };
                return self.establish(token, peer).map(Some);
            }
            Ok(None)
        });
        self.unwatch(watch);
        accepted
    }

    fn establish(&self, token: GrantToken, peer: EndpointId) -> ShmsockResult<Link> {
        let mut setup = AcceptorSetup::default();
        match self.try_establish(token, peer, &mut setup) {
            Ok(ring) => Ok(Link {
                ring,
                peer,
                grants: Grants::Mapped {
                    pages: setup.mapped,
                },
            }),
            Err(e) => {
                log::warn!("Accepting connection from endpoint {} failed: {}", peer, e);
                setup.unwind(self.backend);
                Err(e)
            }
        }
    }

    fn try_establish(
        &self,
        token: GrantToken,
        peer: EndpointId,
        setup: &mut AcceptorSetup,
    ) -> ShmsockResult<RingBuffer> {
        let backend = self.backend;
        let grants = backend.grants.as_ref();

        let page = grants.map(token, peer)?;
        setup.mapped.push(page.clone());
        let descriptor = DescriptorRef::attach(page)?;
        setup.descriptor = Some(descriptor.clone());

        let port = backend.events.bind(peer, descriptor.notify_port())?;
        setup.port = Some(port);

        let storage = CapabilityChain::walk(grants, &descriptor, peer)?;
        setup.mapped.extend(storage.pages().iter().cloned());

        let snap = descriptor.snapshot();
        if snap.avail_bytes != 0 || snap.send_offset != 0 || snap.recv_offset != 0 {
            return Err(ShmsockError::violation(format!(
                "Fresh descriptor already in use: {:?}",
                snap
            )));
        }
        if snap.sender_shutdown {
            return Err(ShmsockError::PeerUnreachable(format!(
                "Endpoint {} abandoned the connection",
                peer
            )));
        }

        let ring = RingBuffer::new(
            descriptor.clone(),
            storage,
            Doorbell::new(Arc::clone(&backend.events), port, backend.cancel.clone()),
        )?;
        descriptor.open_window(ring.capacity());
        ring.doorbell().ring();
        Ok(ring)
    }

    /// Re-run `step` on every watch event and at least once per poll interval
    /// until it yields a value
    fn watch_until<T>(
        &self,
        watch: &Watch,
        deadline: Option<Instant>,
        mut step: impl FnMut() -> ShmsockResult<Option<T>>,
    ) -> ShmsockResult<T> {
        let poll = self.config.poll_interval();
        loop {
            if let Some(value) = step()? {
                return Ok(value);
            }
            if self.backend.cancel.is_cancelled() {
                return Err(ShmsockError::Cancelled);
            }
            let mut wait = poll;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return Err(ShmsockError::Timeout);
                }
                wait = wait.min(deadline - now);
            }
            if let Some(path) = watch.next(wait)? {
                log::debug!("Watch on {} fired for {}", watch.path(), path);
            }
        }
    }

    fn unwatch(&self, watch: Watch) {
        let path = watch.path().to_string();
        if let Err(e) = self.backend.directory.unwatch(watch) {
            log::warn!("Failed to remove watch on {}: {}", path, e);
        }
    }
}
