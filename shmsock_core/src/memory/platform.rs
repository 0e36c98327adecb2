// Platform page geometry
//
// Grants, descriptors and ring storage are all expressed in whole pages, so
// the page size is the one platform fact the rest of the crate depends on.

/// Fallback used when the OS cannot be asked
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Largest supported ring order (2^16 pages)
pub const MAX_BUFFER_ORDER: u8 = 16;

/// Get the size of one memory page in bytes
///
/// - Unix: `sysconf(_SC_PAGESIZE)`
/// - Elsewhere: 4 KiB
pub fn page_size() -> usize {
    #[cfg(unix)]
    {
        // SAFETY: sysconf has no preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            return size as usize;
        }
        DEFAULT_PAGE_SIZE
    }

    #[cfg(not(unix))]
    {
        DEFAULT_PAGE_SIZE
    }
}

/// Number of pages in a buffer of the given order
pub fn pages_for_order(order: u8) -> usize {
    1usize << order
}

/// Get platform name for logging/diagnostics
pub fn platform_name() -> &'static str {
    #[cfg(target_os = "linux")]
    { "Linux" }

    #[cfg(target_os = "macos")]
    { "macOS" }

    #[cfg(target_os = "windows")]
    { "Windows" }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    { "Unix" }
}
