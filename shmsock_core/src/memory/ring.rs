//! Single-producer/single-consumer byte ring over shared pages
//!
//! Both endpoints build a [`RingBuffer`] over the same descriptor and the same
//! pages; one of them only ever calls [`RingBuffer::write`], the other only
//! [`RingBuffer::read`]. No lock lives in shared memory. The producer owns
//! `send_offset`, the consumer owns `recv_offset`, and `avail_bytes` is the one
//! counter both update atomically:
//!
//! - the producer copies bytes in, then subtracts from `avail_bytes` (release)
//! - the consumer loads `avail_bytes` (acquire), copies bytes out, then adds
//!   them back (release)
//!
//! so whoever observes a changed `avail_bytes` also observes the bytes behind it.

use super::descriptor::DescriptorRef;
use super::page::PageSet;
use crate::communication::doorbell::{Doorbell, WaitResult};
use crate::error::{ShmsockError, ShmsockResult};
use std::time::{Duration, Instant};

/// Blocking behaviour of a single send or receive call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IoMode {
    #[default]
    Blocking,
    NonBlocking,
}

/// Running totals and fill level of a ring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RingStats {
    pub capacity: u32,
    pub total_sent: u64,
    pub total_received: u64,
    pub in_flight: u32,
    pub free: u32,
}

/// One endpoint's view of a shared ring
#[derive(Debug)]
pub struct RingBuffer {
    descriptor: DescriptorRef,
    storage: PageSet,
    capacity: u32,
    doorbell: Doorbell,
}

impl RingBuffer {
    /// Ring spanning every byte of `storage`
    pub fn new(descriptor: DescriptorRef, storage: PageSet, doorbell: Doorbell) -> ShmsockResult<Self> {
        let capacity = u32::try_from(storage.len()).map_err(|_| {
            ShmsockError::ResourceExhausted(format!(
                "Ring of {} bytes exceeds the 32-bit offset range",
                storage.len()
            ))
        })?;
        Self::with_capacity(descriptor, storage, capacity, doorbell)
    }

    /// Ring using only the first `capacity` bytes of `storage`
    pub fn with_capacity(
        descriptor: DescriptorRef,
        storage: PageSet,
        capacity: u32,
        doorbell: Doorbell,
    ) -> ShmsockResult<Self> {
        if capacity == 0 || capacity as usize > storage.len() {
            return Err(ShmsockError::ResourceExhausted(format!(
                "Ring capacity {} does not fit {} bytes of storage",
                capacity,
                storage.len()
            )));
        }
        Ok(Self {
            descriptor,
            storage,
            capacity,
            doorbell,
        })
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn descriptor(&self) -> &DescriptorRef {
        &self.descriptor
    }

    pub fn doorbell(&self) -> &Doorbell {
        &self.doorbell
    }

    /// Copy `data` into the ring; producer side only
    ///
    /// Returns the number of bytes copied. A call that copied something returns
    /// `Ok` even if it then stopped early because of a forced shutdown, the
    /// deadline or cancellation; the error is reported only when nothing moved.
    pub fn write(&self, data: &[u8], mode: IoMode, timeout: Option<Duration>) -> ShmsockResult<usize> {
        if data.is_empty() {
            return Ok(0);
        }

        let d = &self.descriptor;
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut written = 0usize;

        let outcome = loop {
            if d.force_sender_shutdown() {
                // Acknowledge, so the consumer can unmap without waiting for close
                d.mark_sender_shutdown();
                break Err(ShmsockError::ConnectionClosed);
            }
            if d.sender_shutdown() {
                break Err(ShmsockError::ConnectionClosed);
            }

            let avail = match self.checked_avail() {
                Ok(avail) => avail,
                Err(e) => break Err(e),
            };
            let amount = (avail as usize).min(data.len() - written);

            if amount == 0 {
                if mode == IoMode::NonBlocking {
                    break Err(ShmsockError::WouldBlock);
                }
                // The consumer may be idle; tell it to drain before parking
                d.set_sender_blocking(true);
                self.doorbell.ring();
                log::debug!("Ring full, producer waiting on port {}", self.doorbell.port());
                let waited = self.doorbell.wait_until_deadline(
                    || {
                        d.avail_bytes() != 0
                            || d.force_sender_shutdown()
                            || d.sender_shutdown()
                    },
                    deadline,
                );
                d.set_sender_blocking(false);
                match waited {
                    WaitResult::Ready => continue,
                    other => break other.into_result(),
                }
            }

            let offset = match self.checked_offset(d.send_offset(), "send_offset") {
                Ok(offset) => offset,
                Err(e) => break Err(e),
            };
            self.copy_in(offset, &data[written..written + amount]);
            d.set_send_offset(self.advance(offset, amount));
            d.consume_space(amount as u32);
            d.add_sent(amount as u32);
            written += amount;

            if written == data.len() {
                break Ok(());
            }
        };

        if written > 0 {
            self.doorbell.ring();
        }
        match outcome {
            Err(e) if e.is_fatal() => Err(e),
            Err(e) if written == 0 => Err(e),
            _ => Ok(written),
        }
    }

    /// Copy available bytes into `buf`; consumer side only
    ///
    /// Returns as soon as at least one byte was copied. `Ok(0)` means the ring
    /// is empty and either the producer shut down or this side demanded that
    /// it stop.
    pub fn read(&self, buf: &mut [u8], mode: IoMode, timeout: Option<Duration>) -> ShmsockResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let d = &self.descriptor;
        let capacity = self.capacity;
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let in_flight = capacity - self.checked_avail()?;
            if in_flight == 0 {
                // Producer done, or this side stopped reading
                if d.sender_shutdown() || d.force_sender_shutdown() {
                    // Re-check: the final bytes may have landed just before the flag
                    if d.avail_bytes() == capacity {
                        return Ok(0);
                    }
                    continue;
                }
                if mode == IoMode::NonBlocking {
                    return Err(ShmsockError::WouldBlock);
                }
                log::debug!("Ring empty, consumer waiting on port {}", self.doorbell.port());
                self.doorbell
                    .wait_until_deadline(
                        || {
                            d.avail_bytes() != capacity
                                || d.sender_shutdown()
                                || d.force_sender_shutdown()
                        },
                        deadline,
                    )
                    .into_result()?;
                continue;
            }

            let offset = self.checked_offset(d.recv_offset(), "recv_offset")?;
            let amount = (in_flight as usize).min(buf.len());
            self.copy_out(offset, &mut buf[..amount]);
            d.set_recv_offset(self.advance(offset, amount));
            let before = d.release_space(amount as u32);
            if u64::from(before) + amount as u64 > u64::from(capacity) {
                log::warn!("avail_bytes overflowed ring capacity {}", capacity);
                return Err(ShmsockError::violation(format!(
                    "avail_bytes {} + {} exceeds capacity {}",
                    before, amount, capacity
                )));
            }
            d.add_received(amount as u32);

            if d.sender_blocking() {
                self.doorbell.ring();
            }
            return Ok(amount);
        }
    }

    /// Consumer side: demand that the producer stop
    pub fn demand_sender_shutdown(&self) {
        self.descriptor.demand_sender_shutdown();
        self.doorbell.ring();
    }

    /// Producer side: announce that no more bytes will be written
    ///
    /// The doorbell is skipped when the consumer already demanded shutdown.
    pub fn announce_sender_shutdown(&self) {
        self.descriptor.mark_sender_shutdown();
        if !self.descriptor.force_sender_shutdown() {
            self.doorbell.ring();
        }
    }

    /// Consumer side: wait until the producer acknowledges shutdown
    pub fn wait_sender_shutdown(&self, timeout: Option<Duration>) -> ShmsockResult<()> {
        let d = &self.descriptor;
        self.doorbell
            .wait_until(|| d.sender_shutdown(), timeout)
            .into_result()
    }

    /// Check the descriptor invariants; only meaningful while neither side is
    /// inside `write` or `read`
    pub fn check_invariants(&self) -> ShmsockResult<()> {
        let d = &self.descriptor;
        let avail = self.checked_avail()?;
        let send = self.checked_offset(d.send_offset(), "send_offset")? as u64;
        let recv = self.checked_offset(d.recv_offset(), "recv_offset")? as u64;
        let capacity = u64::from(self.capacity);
        let distance = (send + capacity - recv) % capacity;
        let in_flight = capacity - u64::from(avail);
        if distance != in_flight % capacity {
            return Err(ShmsockError::violation(format!(
                "Offsets {}..{} disagree with {} bytes in flight",
                recv, send, in_flight
            )));
        }
        Ok(())
    }

    pub fn stats(&self) -> RingStats {
        let snap = self.descriptor.snapshot();
        let free = snap.avail_bytes.min(self.capacity);
        RingStats {
            capacity: self.capacity,
            total_sent: snap.total_sent,
            total_received: snap.total_received,
            in_flight: self.capacity - free,
            free,
        }
    }

    fn checked_avail(&self) -> ShmsockResult<u32> {
        let avail = self.descriptor.avail_bytes();
        if avail > self.capacity {
            log::warn!("avail_bytes {} exceeds ring capacity {}", avail, self.capacity);
            return Err(ShmsockError::violation(format!(
                "avail_bytes {} exceeds capacity {}",
                avail, self.capacity
            )));
        }
        Ok(avail)
    }

    fn checked_offset(&self, offset: u32, field: &str) -> ShmsockResult<usize> {
        if offset >= self.capacity {
            log::warn!("{} {} outside ring capacity {}", field, offset, self.capacity);
            return Err(ShmsockError::violation(format!(
                "{} {} outside capacity {}",
                field, offset, self.capacity
            )));
        }
        Ok(offset as usize)
    }

    fn advance(&self, offset: usize, amount: usize) -> u32 {
        ((offset + amount) % self.capacity as usize) as u32
    }

    /// Copy at `offset`, splitting into tail and head segments at the wrap point
    fn copy_in(&self, offset: usize, src: &[u8]) {
        let tail = (self.capacity as usize - offset).min(src.len());
        // SAFETY: the bytes between send_offset and send_offset + avail_bytes
        // are free, so the consumer is not reading them.
        unsafe {
            self.storage.copy_in(offset, &src[..tail]);
            if tail < src.len() {
                self.storage.copy_in(0, &src[tail..]);
            }
        }
    }

    fn copy_out(&self, offset: usize, dst: &mut [u8]) {
        let tail = (self.capacity as usize - offset).min(dst.len());
        // SAFETY: the bytes between recv_offset and recv_offset + in_flight
        // were published by the producer, which will not touch them again until
        // their space is released.
        unsafe {
            self.storage.copy_out(offset, &mut dst[..tail]);
            if tail < dst.len() {
                self.storage.copy_out(0, &mut dst[tail..]);
            }
        }
    }
}
