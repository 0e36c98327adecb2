// Page frames backing grants, descriptors and ring storage
use crate::error::{ShmsockError, ShmsockResult};
use memmap2::{MmapMut, MmapOptions};
use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::Arc;

/// Page-aligned anonymous memory region made of whole pages
///
/// The frame is freed when the last [`Page`] referring to it is dropped, which
/// gives revoked grants deferred-free semantics: a peer that still has a page
/// mapped keeps the memory alive until it unmaps.
pub struct PageFrame {
    #[allow(dead_code)]
    mmap: MmapMut,
    base: NonNull<u8>,
    page_size: usize,
    pages: usize,
}

impl PageFrame {
    /// Allocate `pages` zeroed pages of `page_size` bytes
    pub fn allocate(pages: usize, page_size: usize) -> ShmsockResult<Arc<Self>> {
        if pages == 0 || page_size == 0 {
            return Err(ShmsockError::ResourceExhausted(
                "Cannot allocate an empty page frame".to_string(),
            ));
        }

        let len = pages.checked_mul(page_size).ok_or_else(|| {
            ShmsockError::ResourceExhausted("Integer overflow calculating frame size".to_string())
        })?;

        let mut mmap = MmapOptions::new().len(len).map_anon().map_err(|e| {
            ShmsockError::ResourceExhausted(format!("Cannot map {} pages: {}", pages, e))
        })?;

        let base = NonNull::new(mmap.as_mut_ptr()).ok_or_else(|| {
            ShmsockError::ResourceExhausted("Null pointer for page frame".to_string())
        })?;

        Ok(Arc::new(Self {
            mmap,
            base,
            page_size,
            pages,
        }))
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn page_count(&self) -> usize {
        self.pages
    }
}

impl fmt::Debug for PageFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageFrame")
            .field("base", &self.base)
            .field("page_size", &self.page_size)
            .field("pages", &self.pages)
            .finish()
    }
}

// Thread safety: all access to the bytes goes through raw pointers whose
// exclusivity is governed by the ring protocol.
unsafe impl Send for PageFrame {}
unsafe impl Sync for PageFrame {}

/// One page of a [`PageFrame`], cheap to clone
#[derive(Debug, Clone)]
pub struct Page {
    frame: Arc<PageFrame>,
    index: usize,
}

impl Page {
    /// Split a frame into its individual pages
    pub fn split(frame: &Arc<PageFrame>) -> Vec<Page> {
        (0..frame.pages)
            .map(|index| Page {
                frame: Arc::clone(frame),
                index,
            })
            .collect()
    }

    pub fn as_ptr(&self) -> *mut u8 {
        // SAFETY: index < pages, so the offset stays inside the mapping.
        unsafe {
            self.frame
                .base
                .as_ptr()
                .add(self.index * self.frame.page_size)
        }
    }

    pub fn len(&self) -> usize {
        self.frame.page_size
    }

    pub fn is_empty(&self) -> bool {
        self.frame.page_size == 0
    }

    /// True when both handles refer to the same physical page
    pub fn same_page(&self, other: &Page) -> bool {
        Arc::ptr_eq(&self.frame, &other.frame) && self.index == other.index
    }

    /// Read a little-endian u32 stored at `offset`
    pub(crate) fn read_u32(&self, offset: usize) -> u32 {
        assert!(offset + 4 <= self.len(), "u32 read past end of page");
        let mut bytes = [0u8; 4];
        // SAFETY: bounds checked above.
        unsafe {
            ptr::copy_nonoverlapping(self.as_ptr().add(offset), bytes.as_mut_ptr(), 4);
        }
        u32::from_le_bytes(bytes)
    }

    /// Store a little-endian u32 at `offset`
    pub(crate) fn write_u32(&self, offset: usize, value: u32) {
        assert!(offset + 4 <= self.len(), "u32 write past end of page");
        let bytes = value.to_le_bytes();
        // SAFETY: bounds checked above.
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.as_ptr().add(offset), 4);
        }
    }
}

/// Ordered list of pages viewed as one contiguous byte range
///
/// The pages need not be adjacent in the local address space (a mapper gets
/// them one grant at a time), so copies are split at page boundaries.
#[derive(Debug, Clone)]
pub struct PageSet {
    pages: Vec<Page>,
    page_size: usize,
}

impl PageSet {
    pub fn new(pages: Vec<Page>) -> ShmsockResult<Self> {
        let page_size = match pages.first() {
            Some(page) => page.len(),
            None => {
                return Err(ShmsockError::ResourceExhausted(
                    "Page set needs at least one page".to_string(),
                ))
            }
        };
        if pages.iter().any(|p| p.len() != page_size) {
            return Err(ShmsockError::violation("Page set mixes page sizes"));
        }
        Ok(Self { pages, page_size })
    }

    pub fn len(&self) -> usize {
        self.pages.len() * self.page_size
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn pages(&self) -> &[Page] {
        &self.pages
    }

    /// Copy `src` into the set starting at byte `offset`
    ///
    /// # Safety
    ///
    /// No other party may be reading or writing `offset..offset + src.len()`
    /// for the duration of the call.
    pub(crate) unsafe fn copy_in(&self, offset: usize, src: &[u8]) {
        assert!(offset + src.len() <= self.len(), "copy_in past end of page set");
        let mut done = 0;
        while done < src.len() {
            let pos = offset + done;
            let page = &self.pages[pos / self.page_size];
            let within = pos % self.page_size;
            let n = (self.page_size - within).min(src.len() - done);
            ptr::copy_nonoverlapping(src.as_ptr().add(done), page.as_ptr().add(within), n);
            done += n;
        }
    }

    /// Copy bytes starting at `offset` out into `dst`
    ///
    /// # Safety
    ///
    /// No other party may be writing `offset..offset + dst.len()` for the
    /// duration of the call.
    pub(crate) unsafe fn copy_out(&self, offset: usize, dst: &mut [u8]) {
        assert!(offset + dst.len() <= self.len(), "copy_out past end of page set");
        let mut done = 0;
        while done < dst.len() {
            let pos = offset + done;
            let page = &self.pages[pos / self.page_size];
            let within = pos % self.page_size;
            let n = (self.page_size - within).min(dst.len() - done);
            ptr::copy_nonoverlapping(page.as_ptr().add(within), dst.as_mut_ptr().add(done), n);
            done += n;
        }
    }
}
