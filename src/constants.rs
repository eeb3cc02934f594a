//! Derives the handful of size constants that every pool needs, from
//! the system page size.  The reference allocator computes these once
//! per process in `ngx_slab_sizes_init`; we do the same thing lazily
//! on first use, and each `Pool` keeps its own copy of the values it
//! was built with so that pools over differently-sized regions never
//! cross-contaminate each other.
use std::sync::atomic::{AtomicUsize, Ordering};

/// The minimum chunk size the allocator will ever hand out, as a
/// shift: `min_size = 1 << min_shift`.
pub const DEFAULT_MIN_SHIFT: u32 = 3;

/// Size constants derived from a single page size.  See §3 of the
/// specification for the classification rules that consume these.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SizeClassConstants {
    pub page_size: usize,
    pub page_shift: u32,
    /// Largest request serviced by a single-page slab (`page_size / 2`).
    pub max_size: usize,
    /// The one chunk size whose occupancy bitmap exactly fills one
    /// machine word: `page_size / (8 * word_size)`.
    pub exact_size: usize,
    pub exact_shift: u32,
}

impl SizeClassConstants {
    /// Derives all constants from a page size that must be a power of two.
    pub fn derive(page_size: usize) -> Self {
        assert!(
            page_size.is_power_of_two(),
            "page size must be a power of two, got {}",
            page_size
        );

        let page_shift = page_size.trailing_zeros();
        let word_size = std::mem::size_of::<usize>();
        let max_size = page_size / 2;
        let exact_size = page_size / (8 * word_size);
        let exact_shift = exact_size.trailing_zeros();

        Self {
            page_size,
            page_shift,
            max_size,
            exact_size,
            exact_shift,
        }
    }
}

/// Queries the operating system's page size.
///
/// Mirrors the approach other allocators in this lineage take: ask
/// `sysconf(_SC_PAGESIZE)` once and cache the result, instead of
/// shelling out through a custom C helper.
#[cfg(unix)]
pub fn system_page_size() -> usize {
    static CACHED: AtomicUsize = AtomicUsize::new(0);

    let cached = CACHED.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }

    // SAFETY: `sysconf` with `_SC_PAGESIZE` has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let size = if size > 0 { size as usize } else { 4096 };

    CACHED.store(size, Ordering::Relaxed);
    size
}

#[cfg(not(unix))]
pub fn system_page_size() -> usize {
    4096
}

/// Process-wide one-shot: derives the size-class constants for the
/// system's page size.  Idempotent.
///
/// Pools that want a non-default page size (e.g. tests shrinking
/// constants via `test_only_small_constants`) should call
/// [`SizeClassConstants::derive`] directly instead.
pub fn size_constants_init() -> SizeClassConstants {
    lazy_static::lazy_static! {
        static ref CONSTANTS: SizeClassConstants =
            SizeClassConstants::derive(system_page_size());
    }

    *CONSTANTS
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn derive_4k() {
        let c = SizeClassConstants::derive(4096);
        assert_eq!(c.page_shift, 12);
        assert_eq!(c.max_size, 2048);
        assert_eq!(c.exact_size, 64);
        assert_eq!(c.exact_shift, 6);
    }

    #[test]
    fn derive_64k() {
        let c = SizeClassConstants::derive(65536);
        assert_eq!(c.page_shift, 16);
        assert_eq!(c.max_size, 32768);
        assert_eq!(c.exact_size, 1024);
        assert_eq!(c.exact_shift, 10);
    }

    #[test]
    fn system_page_size_is_sane() {
        let size = system_page_size();
        assert!(size.is_power_of_two());
        assert!(size >= 4096);
    }

    #[test]
    fn idempotent() {
        let a = size_constants_init();
        let b = size_constants_init();
        assert_eq!(a, b);
    }
}
