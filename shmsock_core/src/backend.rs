//! Collaborator bundle handed to every endpoint
//!
//! An endpoint needs three platform services: page grants, doorbells and the
//! rendezvous directory. A [`Backend`] carries one implementation of each plus
//! the cancellation token its blocking calls observe. [`LoopbackHost`] builds
//! backends whose services are shared in-process, so every endpoint attached to
//! the same host can reach the others.

use crate::communication::cancel::CancelToken;
use crate::communication::directory::MemDirectory;
use crate::communication::doorbell::{EventHub, NotificationChannel, DEFAULT_POLL_INTERVAL};
use crate::communication::rendezvous::RendezvousDirectory;
use crate::core::address::EndpointId;
use crate::memory::grant::{GrantTable, MemoryGrant, DEFAULT_MAX_GRANTS};
use crate::memory::platform::{page_size, platform_name};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Platform services as seen by one endpoint
#[derive(Clone)]
pub struct Backend {
    pub endpoint: EndpointId,
    pub grants: Arc<dyn MemoryGrant>,
    pub events: Arc<dyn NotificationChannel>,
    pub directory: Arc<dyn RendezvousDirectory>,
    pub cancel: CancelToken,
}

impl Backend {
    pub fn new(
        endpoint: EndpointId,
        grants: Arc<dyn MemoryGrant>,
        events: Arc<dyn NotificationChannel>,
        directory: Arc<dyn RendezvousDirectory>,
    ) -> Self {
        Self {
            endpoint,
            grants,
            events,
            directory,
            cancel: CancelToken::new(),
        }
    }

    /// Replace the cancellation token, e.g. with one wired to Ctrl+C
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("endpoint", &self.endpoint)
            .field("cancel", &self.cancel)
            .finish()
    }
}

/// In-process host: shared grant table, event hub and directory
#[derive(Debug, Clone)]
pub struct LoopbackHost {
    grants: Arc<GrantTable>,
    events: Arc<EventHub>,
    directory: Arc<MemDirectory>,
}

impl LoopbackHost {
    pub fn new() -> Self {
        Self::with_limits(page_size(), DEFAULT_MAX_GRANTS, DEFAULT_POLL_INTERVAL)
    }

    pub fn with_poll_interval(poll_interval: Duration) -> Self {
        Self::with_limits(page_size(), DEFAULT_MAX_GRANTS, poll_interval)
    }

    pub fn with_limits(page_size: usize, max_grants: usize, poll_interval: Duration) -> Self {
        log::debug!(
            "Loopback host on {}: {} byte pages, {} grants max",
            platform_name(),
            page_size,
            max_grants
        );
        Self {
            grants: GrantTable::new(page_size, max_grants),
            events: EventHub::new(poll_interval),
            directory: MemDirectory::new(),
        }
    }

    /// Backend for endpoint `id`
    pub fn attach(&self, id: EndpointId) -> Backend {
        Backend::new(
            id,
            Arc::new(self.grants.for_endpoint(id)),
            Arc::new(self.events.for_endpoint(id)),
            self.directory.clone(),
        )
    }

    pub fn grant_table(&self) -> &Arc<GrantTable> {
        &self.grants
    }

    pub fn event_hub(&self) -> &Arc<EventHub> {
        &self.events
    }

    pub fn directory(&self) -> &Arc<MemDirectory> {
        &self.directory
    }
}

impl Default for LoopbackHost {
    fn default() -> Self {
        Self::new()
    }
}
