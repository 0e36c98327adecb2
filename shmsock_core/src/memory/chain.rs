//! Chained capability list for ring buffer pages
//!
//! The directory can carry a single token per pending connection, so the ring's
//! page tokens travel through shared memory instead: the descriptor holds the
//! first token and the head of page `i` holds the token of page `i + 1`. The
//! chain length is explicit (`buffer_order` in the descriptor), and the order
//! is published only after every link has been written.
//!
//! The links occupy the first bytes of each page, which later become ring
//! data. The producer must therefore not write before the mapper has walked
//! the chain; the handshake guarantees this by keeping the ring window closed
//! until the acceptor opens it.

use super::descriptor::Descriptor;
use super::grant::{GrantToken, MemoryGrant};
use super::page::{Page, PageSet};
use super::platform::MAX_BUFFER_ORDER;
use crate::core::address::EndpointId;
use crate::error::{ShmsockError, ShmsockResult};
use std::collections::HashSet;

/// Byte offset of the next-page token inside each page
const LINK_OFFSET: usize = 0;

/// Tokens of a granted ring, in page order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilityChain {
    tokens: Vec<GrantToken>,
}

impl CapabilityChain {
    /// Grant `pages` to `peer` and publish the chain through `descriptor`
    ///
    /// On failure every grant made so far is revoked again.
    pub fn offer(
        grants: &dyn MemoryGrant,
        pages: &[Page],
        peer: EndpointId,
        descriptor: &Descriptor,
    ) -> ShmsockResult<Self> {
        if pages.is_empty() || !pages.len().is_power_of_two() {
            return Err(ShmsockError::ResourceExhausted(format!(
                "Ring needs a power-of-two page count, got {}",
                pages.len()
            )));
        }
        let order = pages.len().trailing_zeros() as u8;
        if order > MAX_BUFFER_ORDER {
            return Err(ShmsockError::ResourceExhausted(format!(
                "Ring order {} exceeds maximum {}",
                order, MAX_BUFFER_ORDER
            )));
        }

        let mut chain = CapabilityChain {
            tokens: Vec::with_capacity(pages.len()),
        };
        for page in pages {
            match grants.offer(page, peer) {
                Ok(token) => chain.tokens.push(token),
                Err(e) => {
                    if let Err(revoke_err) = chain.revoke(grants) {
                        log::warn!("Unwinding partial ring grants failed: {}", revoke_err);
                    }
                    return Err(e);
                }
            }
        }

        for (page, next) in pages.iter().zip(chain.tokens.iter().skip(1)) {
            page.write_u32(LINK_OFFSET, next.0);
        }
        descriptor.set_first_chunk_token(chain.tokens[0]);
        descriptor.publish_buffer_order(order);

        Ok(chain)
    }

    /// Map every page of the chain published in `descriptor`
    ///
    /// On failure every page mapped so far is unmapped again.
    pub fn walk(
        grants: &dyn MemoryGrant,
        descriptor: &Descriptor,
        owner: EndpointId,
    ) -> ShmsockResult<PageSet> {
        let order = descriptor.buffer_order().ok_or_else(|| {
            ShmsockError::PeerUnreachable("Peer has not allocated its buffer pages".to_string())
        })?;
        if order > MAX_BUFFER_ORDER {
            return Err(ShmsockError::violation(format!(
                "Descriptor advertises ring order {}",
                order
            )));
        }

        let count = 1usize << order;
        let mut mapped: Vec<Page> = Vec::with_capacity(count);
        let mut seen: HashSet<GrantToken> = HashSet::with_capacity(count);
        let mut token = descriptor.first_chunk_token();

        for i in 0..count {
            let page = if token.is_none() {
                Err(ShmsockError::violation(format!(
                    "Capability chain ends after {} of {} pages",
                    i, count
                )))
            } else if !seen.insert(token) {
                // Two ring segments would alias one physical page
                Err(ShmsockError::violation(format!(
                    "Capability chain revisits token {} at page {}",
                    token, i
                )))
            } else {
                grants.map(token, owner)
            };

            match page {
                Ok(page) => {
                    if i + 1 < count {
                        token = GrantToken(page.read_u32(LINK_OFFSET));
                    }
                    mapped.push(page);
                }
                Err(e) => {
                    for page in mapped {
                        if let Err(unmap_err) = grants.unmap(page) {
                            log::warn!("Unwinding partial ring mapping failed: {}", unmap_err);
                        }
                    }
                    return Err(e);
                }
            }
        }

        PageSet::new(mapped)
    }

    pub fn tokens(&self) -> &[GrantToken] {
        &self.tokens
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Revoke every grant in the chain, reporting the first failure
    pub fn revoke(&mut self, grants: &dyn MemoryGrant) -> ShmsockResult<()> {
        let mut first_err = None;
        for token in self.tokens.drain(..) {
            if let Err(e) = grants.revoke(token) {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
