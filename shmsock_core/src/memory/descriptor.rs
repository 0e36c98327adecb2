use super::grant::GrantToken;
use super::page::Page;
use crate::communication::doorbell::Port;
use crate::error::{ShmsockError, ShmsockResult};
use std::mem;
use std::ops::Deref;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};

/// Control block for one ring buffer, stored at the start of a shared page
///
/// Every field is atomic because both endpoints access the page concurrently.
/// `send_offset` is written only by the producer and `recv_offset` only by the
/// consumer; `avail_bytes` is the single counter both sides update, and it is
/// the edge that orders buffer contents between them.
#[repr(C, align(64))]
pub struct Descriptor {
    notify_port: AtomicU32,
    buffer_order: AtomicI32,
    first_chunk_token: AtomicU32,
    send_offset: AtomicU32,
    recv_offset: AtomicU32,
    sender_blocking: AtomicU32,
    avail_bytes: AtomicU32,
    sender_shutdown: AtomicU32,
    force_sender_shutdown: AtomicU32,
    _reserved: u32,
    total_sent: AtomicU64,
    total_received: AtomicU64,
}

/// Plain copy of every descriptor field, for diagnostics and tests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorSnapshot {
    pub notify_port: u32,
    pub buffer_order: i32,
    pub first_chunk_token: GrantToken,
    pub send_offset: u32,
    pub recv_offset: u32,
    pub sender_blocking: bool,
    pub avail_bytes: u32,
    pub sender_shutdown: bool,
    pub force_sender_shutdown: bool,
    pub total_sent: u64,
    pub total_received: u64,
}

impl Descriptor {
    /// Reset to the "nothing allocated yet" state
    pub fn initialize(&self) {
        self.notify_port.store(0, Ordering::Relaxed);
        self.buffer_order.store(-1, Ordering::Relaxed);
        self.first_chunk_token
            .store(GrantToken::NONE.0, Ordering::Relaxed);
        self.send_offset.store(0, Ordering::Relaxed);
        self.recv_offset.store(0, Ordering::Relaxed);
        self.sender_blocking.store(0, Ordering::Relaxed);
        self.avail_bytes.store(0, Ordering::Relaxed);
        self.sender_shutdown.store(0, Ordering::Relaxed);
        self.force_sender_shutdown.store(0, Ordering::Relaxed);
        self.total_sent.store(0, Ordering::Relaxed);
        self.total_received.store(0, Ordering::Release);
    }

    pub fn notify_port(&self) -> Port {
        Port(self.notify_port.load(Ordering::Acquire))
    }

    pub fn set_notify_port(&self, port: Port) {
        self.notify_port.store(port.0, Ordering::Release);
    }

    /// log2 of the ring size in pages, `None` until the buffer is published
    pub fn buffer_order(&self) -> Option<u8> {
        let order = self.buffer_order.load(Ordering::Acquire);
        u8::try_from(order).ok()
    }

    /// Publishing the order is the last step of buffer setup
    pub fn publish_buffer_order(&self, order: u8) {
        self.buffer_order.store(i32::from(order), Ordering::Release);
    }

    pub fn clear_buffer_order(&self) {
        self.buffer_order.store(-1, Ordering::Release);
    }

    pub fn first_chunk_token(&self) -> GrantToken {
        GrantToken(self.first_chunk_token.load(Ordering::Acquire))
    }

    pub fn set_first_chunk_token(&self, token: GrantToken) {
        self.first_chunk_token.store(token.0, Ordering::Release);
    }

    pub fn send_offset(&self) -> u32 {
        self.send_offset.load(Ordering::Acquire)
    }

    pub(crate) fn set_send_offset(&self, offset: u32) {
        self.send_offset.store(offset, Ordering::Release);
    }

    pub fn recv_offset(&self) -> u32 {
        self.recv_offset.load(Ordering::Acquire)
    }

    pub(crate) fn set_recv_offset(&self, offset: u32) {
        self.recv_offset.store(offset, Ordering::Release);
    }

    pub fn sender_blocking(&self) -> bool {
        self.sender_blocking.load(Ordering::Acquire) != 0
    }

    pub(crate) fn set_sender_blocking(&self, blocking: bool) {
        self.sender_blocking
            .store(u32::from(blocking), Ordering::SeqCst);
    }

    pub fn avail_bytes(&self) -> u32 {
        self.avail_bytes.load(Ordering::Acquire)
    }

    /// Producer side: `amount` bytes were written and are now in flight
    pub(crate) fn consume_space(&self, amount: u32) -> u32 {
        self.avail_bytes.fetch_sub(amount, Ordering::AcqRel)
    }

    /// Consumer side: `amount` bytes were read and their space is free again
    pub(crate) fn release_space(&self, amount: u32) -> u32 {
        self.avail_bytes.fetch_add(amount, Ordering::SeqCst)
    }

    /// Acceptor side: make the whole ring writable once mapping is complete
    pub(crate) fn open_window(&self, capacity: u32) {
        self.avail_bytes.store(capacity, Ordering::Release);
    }

    pub fn sender_shutdown(&self) -> bool {
        self.sender_shutdown.load(Ordering::Acquire) != 0
    }

    pub fn mark_sender_shutdown(&self) {
        self.sender_shutdown.store(1, Ordering::Release);
    }

    pub fn force_sender_shutdown(&self) -> bool {
        self.force_sender_shutdown.load(Ordering::Acquire) != 0
    }

    pub fn demand_sender_shutdown(&self) {
        self.force_sender_shutdown.store(1, Ordering::Release);
    }

    pub(crate) fn add_sent(&self, amount: u32) {
        self.total_sent
            .fetch_add(u64::from(amount), Ordering::Relaxed);
    }

    pub(crate) fn add_received(&self, amount: u32) {
        self.total_received
            .fetch_add(u64::from(amount), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DescriptorSnapshot {
        DescriptorSnapshot {
            notify_port: self.notify_port.load(Ordering::Acquire),
            buffer_order: self.buffer_order.load(Ordering::Acquire),
            first_chunk_token: self.first_chunk_token(),
            send_offset: self.send_offset(),
            recv_offset: self.recv_offset(),
            sender_blocking: self.sender_blocking(),
            avail_bytes: self.avail_bytes(),
            sender_shutdown: self.sender_shutdown(),
            force_sender_shutdown: self.force_sender_shutdown(),
            total_sent: self.total_sent.load(Ordering::Relaxed),
            total_received: self.total_received.load(Ordering::Relaxed),
        }
    }
}

/// Owning handle on a descriptor page
#[derive(Debug, Clone)]
pub struct DescriptorRef {
    page: Page,
}

impl DescriptorRef {
    /// View `page` as a descriptor without touching its contents
    pub fn attach(page: Page) -> ShmsockResult<Self> {
        if page.len() < mem::size_of::<Descriptor>() {
            return Err(ShmsockError::violation(
                "Page too small for ring descriptor",
            ));
        }
        if (page.as_ptr() as usize) % mem::align_of::<Descriptor>() != 0 {
            return Err(ShmsockError::violation(
                "Descriptor page not properly aligned",
            ));
        }
        Ok(Self { page })
    }

    /// View `page` as a descriptor and reset it
    pub fn create(page: Page) -> ShmsockResult<Self> {
        let descriptor = Self::attach(page)?;
        descriptor.initialize();
        Ok(descriptor)
    }

    pub fn page(&self) -> &Page {
        &self.page
    }
}

impl Deref for DescriptorRef {
    type Target = Descriptor;

    fn deref(&self) -> &Descriptor {
        // SAFETY: size and alignment checked in attach(); all fields are
        // atomics, so shared references from both endpoints are sound.
        unsafe { &*(self.page.as_ptr() as *const Descriptor) }
    }
}
