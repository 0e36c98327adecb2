//! Page grants: offering local pages to a named peer
//!
//! [`MemoryGrant`] is the capability interface a platform provides for sharing
//! physical pages between endpoints. A grant token is opaque to everyone but the
//! grant table; the owner publishes it and the peer named at offer time maps it.
//!
//! [`GrantTable`] is the in-process implementation. Every endpoint attached to
//! the same table sees the others' grants, which is enough for endpoints living
//! on different threads of one host and for the test-suite.

use super::page::{Page, PageFrame};
use crate::core::address::EndpointId;
use crate::error::{ShmsockError, ShmsockResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

/// Default limit on simultaneously live grants per table
pub const DEFAULT_MAX_GRANTS: usize = 4096;

/// Opaque capability naming one granted page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GrantToken(pub u32);

impl GrantToken {
    /// Sentinel stored in shared memory where no grant exists yet
    pub const NONE: GrantToken = GrantToken(u32::MAX);

    pub fn is_none(&self) -> bool {
        *self == Self::NONE
    }
}

impl fmt::Display for GrantToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for GrantToken {
    type Err = ShmsockError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s
            .parse::<u32>()
            .map_err(|e| ShmsockError::AddressInvalid(format!("Invalid grant token '{}': {}", s, e)))?;
        let token = GrantToken(raw);
        if token.is_none() {
            return Err(ShmsockError::AddressInvalid(format!(
                "Grant token '{}' is reserved",
                s
            )));
        }
        Ok(token)
    }
}

/// Page-sharing primitive consumed by endpoints
pub trait MemoryGrant: Send + Sync {
    /// Size of one grantable page
    fn page_size(&self) -> usize;

    /// Allocate `count` zeroed, physically contiguous local pages
    fn alloc_pages(&self, count: usize) -> ShmsockResult<Vec<Page>>;

    /// Let `peer` map `page`; fails with `ResourceExhausted` when the table is full
    fn offer(&self, page: &Page, peer: EndpointId) -> ShmsockResult<GrantToken>;

    /// End a grant. Existing mappings stay valid until unmapped.
    fn revoke(&self, token: GrantToken) -> ShmsockResult<()>;

    /// Map a page that `owner` granted to us
    fn map(&self, token: GrantToken, owner: EndpointId) -> ShmsockResult<Page>;

    /// Drop a mapping obtained from [`MemoryGrant::map`]
    fn unmap(&self, page: Page) -> ShmsockResult<()>;
}

struct GrantEntry {
    owner: EndpointId,
    grantee: EndpointId,
    page: Page,
}

/// Shared grant table for every endpoint on this host
pub struct GrantTable {
    entries: Mutex<HashMap<GrantToken, GrantEntry>>,
    next_token: AtomicU32,
    active_mappings: AtomicUsize,
    max_grants: usize,
    page_size: usize,
}

impl GrantTable {
    pub fn new(page_size: usize, max_grants: usize) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            next_token: AtomicU32::new(1),
            active_mappings: AtomicUsize::new(0),
            max_grants,
            page_size,
        })
    }

    /// View of the table as seen by endpoint `local`
    pub fn for_endpoint(self: &Arc<Self>, local: EndpointId) -> LoopbackGrants {
        LoopbackGrants {
            table: Arc::clone(self),
            local,
        }
    }

    /// Number of grants that have been offered and not yet revoked
    pub fn live_grants(&self) -> usize {
        self.entries.lock().len()
    }

    /// Number of mappings that have not been unmapped
    pub fn active_mappings(&self) -> usize {
        self.active_mappings.load(Ordering::Acquire)
    }

    fn next_token(&self) -> GrantToken {
        loop {
            let token = GrantToken(self.next_token.fetch_add(1, Ordering::Relaxed));
            if !token.is_none() {
                return token;
            }
        }
    }
}

impl fmt::Debug for GrantTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrantTable")
            .field("live_grants", &self.live_grants())
            .field("active_mappings", &self.active_mappings())
            .field("max_grants", &self.max_grants)
            .finish()
    }
}

/// [`MemoryGrant`] bound to one endpoint of a [`GrantTable`]
#[derive(Debug, Clone)]
pub struct LoopbackGrants {
    table: Arc<GrantTable>,
    local: EndpointId,
}

impl MemoryGrant for LoopbackGrants {
    fn page_size(&self) -> usize {
        self.table.page_size
    }

    fn alloc_pages(&self, count: usize) -> ShmsockResult<Vec<Page>> {
        let frame = PageFrame::allocate(count, self.table.page_size)?;
        Ok(Page::split(&frame))
    }

    fn offer(&self, page: &Page, peer: EndpointId) -> ShmsockResult<GrantToken> {
        let mut entries = self.table.entries.lock();
        if entries.len() >= self.table.max_grants {
            return Err(ShmsockError::ResourceExhausted(format!(
                "Grant table full ({} grants)",
                self.table.max_grants
            )));
        }
        let token = self.table.next_token();
        entries.insert(
            token,
            GrantEntry {
                owner: self.local,
                grantee: peer,
                page: page.clone(),
            },
        );
        Ok(token)
    }

    fn revoke(&self, token: GrantToken) -> ShmsockResult<()> {
        let mut entries = self.table.entries.lock();
        match entries.get(&token) {
            Some(entry) if entry.owner == self.local => {
                entries.remove(&token);
                Ok(())
            }
            Some(_) => Err(ShmsockError::invalid_state(format!(
                "Grant {} is not owned by endpoint {}",
                token, self.local
            ))),
            None => Err(ShmsockError::invalid_state(format!(
                "Grant {} is not live",
                token
            ))),
        }
    }

    fn map(&self, token: GrantToken, owner: EndpointId) -> ShmsockResult<Page> {
        let entries = self.table.entries.lock();
        let entry = entries.get(&token).ok_or_else(|| {
            ShmsockError::PeerUnreachable(format!("Grant {} does not exist", token))
        })?;
        if entry.owner != owner || entry.grantee != self.local {
            return Err(ShmsockError::PeerUnreachable(format!(
                "Mapping grant {} denied for endpoint {}",
                token, self.local
            )));
        }
        self.table.active_mappings.fetch_add(1, Ordering::AcqRel);
        Ok(entry.page.clone())
    }

    fn unmap(&self, page: Page) -> ShmsockResult<()> {
        drop(page);
        self.table.active_mappings.fetch_sub(1, Ordering::AcqRel);
        Ok(())
    }
}
