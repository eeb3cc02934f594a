//! Top-level allocate/free (§4.E), the pool header they operate on
//! (§3), and the validated configuration surface callers build a pool
//! from (§4.I). This is the module every other component exists to
//! serve.
use std::ptr::NonNull;

use crate::bitmap;
use crate::constants::{system_page_size, SizeClassConstants, DEFAULT_MIN_SHIFT};
use crate::descriptor::{Kind, PageDescriptor, NONE};
use crate::error::{self, Diagnostic, InitError};
use crate::freelist;
use crate::lock::{RegionLock, RegionLockGuard};
use crate::region::{Layout, RegionView};
use crate::slot;
use crate::stats::{self, ClassStats};

const MAGIC: u32 = 0x5343_4c42; // "SCLB"
const VERSION: u32 = 1;
const LOG_CONTEXT_CAPACITY: usize = 64;

/// The region's self-describing header (§3, item 1). Lives at offset
/// 0 of every pool's region; `Pool::attach` trusts `magic`/`version`
/// to decide whether the rest of the region has already been laid
/// out.
#[repr(C)]
pub struct PoolHeader {
    magic: u32,
    version: u32,
    lock: RegionLock,
    page_size: usize,
    page_shift: u32,
    min_shift: u32,
    num_classes: u32,
    num_pages: u32,
    slot_table_offset: usize,
    stat_table_offset: usize,
    descriptor_table_offset: usize,
    data_begin: usize,
    data_end: usize,
    free_page_count: u32,
    free_head: u32,
    log_nomem: bool,
    log_context_len: u8,
    log_context: [u8; LOG_CONTEXT_CAPACITY],
}

/// Validated configuration for [`Pool::init`] (§4.I). Replaces the
/// reference implementation's direct struct-field pokes
/// (`pool->min_shift = 3`) with a constructor that rejects
/// unworkable combinations up front.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub min_shift: u32,
    pub region_len: usize,
    pub log_nomem: bool,
    pub log_context: Option<String>,
    /// Overrides the system page size; only meant for tests exercising
    /// small regions (`test_only_small_constants`).
    pub page_size: Option<usize>,
}

impl PoolConfig {
    pub fn new(region_len: usize) -> Self {
        Self {
            min_shift: DEFAULT_MIN_SHIFT,
            region_len,
            log_nomem: false,
            log_context: None,
            page_size: None,
        }
    }
}

/// A process-local handle to a region already laid out by
/// [`Pool::init`] or reattached to by [`Pool::attach`]. Cheap to
/// clone-by-reconstruction: all of its state but the base pointer
/// lives in the shared region itself.
pub struct Pool {
    view: RegionView,
    constants: SizeClassConstants,
}

unsafe impl Send for Pool {}
unsafe impl Sync for Pool {}

impl Pool {
    /// Lays out a fresh pool over `region_len` bytes starting at
    /// `base`, with one free run covering every data page.
    ///
    /// # Safety
    ///
    /// `base` must point to at least `config.region_len` live,
    /// writable, otherwise-unused bytes, and no other `Pool` may
    /// alias them for the duration of this call.
    pub unsafe fn init(config: PoolConfig, base: NonNull<u8>) -> Result<Self, InitError> {
        let page_size = config.page_size.unwrap_or_else(system_page_size);
        if (base.as_ptr() as usize) % page_size != 0 {
            return Err(InitError::MisalignedRegion);
        }
        let layout = Layout::compute(config.region_len, page_size, config.min_shift)?;
        let constants = SizeClassConstants::derive(page_size);
        let view = RegionView::new(base, layout);

        for slot_head in view.slot_table() {
            *slot_head = NONE;
        }
        for stat in view.stat_table() {
            *stat = ClassStats::default();
        }

        let descriptors = view.descriptor_table();
        for d in descriptors.iter_mut() {
            *d = PageDescriptor::blank();
        }
        descriptors[0] = PageDescriptor {
            kind: Kind::FreeHead,
            run_length: layout.num_pages as u32,
            ..PageDescriptor::blank()
        };
        for i in 1..layout.num_pages as u32 {
            descriptors[i as usize] = PageDescriptor {
                kind: Kind::FreeInterior,
                ..PageDescriptor::blank()
            };
        }
        if layout.num_pages > 1 {
            descriptors[layout.num_pages - 1].prev = 0;
        }

        let mut log_context = [0u8; LOG_CONTEXT_CAPACITY];
        let log_context_len = match &config.log_context {
            Some(s) => {
                let bytes = s.as_bytes();
                let len = bytes.len().min(LOG_CONTEXT_CAPACITY);
                log_context[..len].copy_from_slice(&bytes[..len]);
                len as u8
            }
            None => 0,
        };

        let header = PoolHeader {
            magic: MAGIC,
            version: VERSION,
            lock: RegionLock::new(),
            page_size: layout.page_size,
            page_shift: layout.page_shift,
            min_shift: layout.min_shift,
            num_classes: layout.num_classes,
            num_pages: layout.num_pages as u32,
            slot_table_offset: layout.slot_table_offset,
            stat_table_offset: layout.stat_table_offset,
            descriptor_table_offset: layout.descriptor_table_offset,
            data_begin: layout.data_begin,
            data_end: layout.data_end,
            free_page_count: layout.num_pages as u32,
            free_head: 0,
            log_nomem: config.log_nomem,
            log_context_len,
            log_context,
        };
        std::ptr::write(view.header_ptr(), header);

        Ok(Self { view, constants })
    }

    /// Attaches to a region some process already initialized,
    /// trusting its header rather than re-running layout (§5
    /// re-attach semantics).
    ///
    /// # Safety
    ///
    /// `base` must point to at least `region_len` live bytes produced
    /// by a prior [`Pool::init`] call (possibly in another process
    /// mapping the same backing storage).
    pub unsafe fn attach(base: NonNull<u8>, region_len: usize) -> Result<Self, InitError> {
        let header = &*(base.as_ptr() as *const PoolHeader);
        if header.magic != MAGIC || header.version != VERSION {
            return Err(InitError::NotInitialized);
        }
        if header.data_end > region_len {
            return Err(InitError::RegionTooSmall {
                needed: header.data_end,
                available: region_len,
            });
        }

        let layout = Layout {
            page_size: header.page_size,
            page_shift: header.page_shift,
            min_shift: header.min_shift,
            num_classes: header.num_classes,
            num_pages: header.num_pages as usize,
            slot_table_offset: header.slot_table_offset,
            stat_table_offset: header.stat_table_offset,
            descriptor_table_offset: header.descriptor_table_offset,
            data_begin: header.data_begin,
            data_end: header.data_end,
        };
        let constants = SizeClassConstants::derive(header.page_size);
        let view = RegionView::new(base, layout);

        Ok(Self { view, constants })
    }

    fn header(&self) -> &PoolHeader {
        unsafe { &*self.view.header_ptr() }
    }

    #[allow(clippy::mut_from_ref)]
    fn header_mut(&self) -> &mut PoolHeader {
        unsafe { &mut *self.view.header_ptr() }
    }

    fn log_context_str(&self) -> &str {
        let header = self.header();
        std::str::from_utf8(&header.log_context[..header.log_context_len as usize]).unwrap_or("")
    }

    /// Total pages currently on the free list (invariant 2/8).
    pub fn free_page_count(&self) -> u32 {
        self.header().free_page_count
    }

    pub fn class_stats(&self, class: u32) -> ClassStats {
        unsafe { self.view.stat_table()[class as usize] }
    }

    fn classify(&self, size: usize) -> Classification {
        if size > self.constants.max_size {
            let pages = (size + self.constants.page_size - 1) / self.constants.page_size;
            return Classification::MultiPage(pages as u32);
        }

        let min_size = 1usize << self.header().min_shift;
        let shift = if size <= min_size {
            self.header().min_shift
        } else {
            ceil_log2(size)
        };
        Classification::Class(shift - self.header().min_shift, shift)
    }

    /// Acquires the lock, performs §4.E allocate, releases.
    pub fn allocate(&self, size: usize) -> Option<*mut u8> {
        let _guard = RegionLockGuard::acquire(&self.header().lock);
        self.allocate_locked(size)
    }

    /// As [`Pool::allocate`], then zeroes the returned bytes.
    pub fn allocate_zeroed(&self, size: usize) -> Option<*mut u8> {
        let _guard = RegionLockGuard::acquire(&self.header().lock);
        self.allocate_zeroed_locked(size)
    }

    /// As [`Pool::allocate_zeroed`] without acquiring the lock; the
    /// caller must already hold it.
    pub fn allocate_zeroed_locked(&self, size: usize) -> Option<*mut u8> {
        let ptr = self.allocate_locked(size)?;
        unsafe { std::ptr::write_bytes(ptr, 0, size) };
        Some(ptr)
    }

    /// As [`Pool::allocate`] without acquiring the lock; the caller
    /// must already hold it.
    pub fn allocate_locked(&self, size: usize) -> Option<*mut u8> {
        match self.classify(size) {
            Classification::MultiPage(pages) => self.allocate_pages_locked(pages),
            Classification::Class(class, shift) => self.allocate_class_locked(class, shift),
        }
    }

    fn allocate_pages_locked(&self, pages: u32) -> Option<*mut u8> {
        let header = self.header_mut();
        let descriptors = unsafe { self.view.descriptor_table() };
        let page_index =
            freelist::alloc_pages(descriptors, &mut header.free_head, &mut header.free_page_count, pages);

        let page_index = match page_index {
            Some(i) => i,
            None => {
                if header.log_nomem {
                    error::report_no_memory(self.log_context_str());
                }
                return None;
            }
        };
        Some(self.view.page_ptr(page_index as usize))
    }

    fn allocate_class_locked(&self, class: u32, shift: u32) -> Option<*mut u8> {
        // Fetched once and threaded through as parameters: two calls to
        // `RegionView::{descriptor,slot,stat}_table` would hand back
        // overlapping `&mut` slices over the same shared bytes.
        let descriptors = unsafe { self.view.descriptor_table() };
        let slots = unsafe { self.view.slot_table() };
        let stats = unsafe { self.view.stat_table() };
        let header = self.header_mut();

        stats[class as usize].reqs += 1;

        if slots[class as usize] == NONE {
            let fresh = freelist::alloc_pages(
                descriptors,
                &mut header.free_head,
                &mut header.free_page_count,
                1,
            );
            match fresh {
                Some(page_index) => {
                    self.init_page_for_class(descriptors, page_index, shift);
                    slot::push_front(descriptors, &mut slots[class as usize], page_index);
                    stats[class as usize].total +=
                        stats::chunks_contributed_by_page(self.constants.page_size, self.constants.exact_shift, shift);
                }
                None => {
                    stats[class as usize].fails += 1;
                    if header.log_nomem {
                        error::report_no_memory(self.log_context_str());
                    }
                    return None;
                }
            }
        }

        let page_index = slots[class as usize];
        let ptr = match self.take_chunk_from_page(descriptors, slots, page_index, class, shift) {
            Some(ptr) => ptr,
            None => {
                error::report(Diagnostic::PageIsBusy, self.log_context_str());
                debug_assert!(false, "slot list page had no free chunk");
                stats[class as usize].fails += 1;
                return None;
            }
        };
        stats[class as usize].used += 1;

        Some(ptr)
    }

    fn init_page_for_class(&self, descriptors: &mut [PageDescriptor], idx: u32, shift: u32) {
        let kind = if shift < self.constants.exact_shift {
            Kind::Small
        } else if shift == self.constants.exact_shift {
            Kind::Exact
        } else {
            Kind::Big
        };

        descriptors[idx as usize] = PageDescriptor {
            kind,
            shift: shift as u8,
            bitmap: 0,
            ..PageDescriptor::blank()
        };

        if kind == Kind::Small {
            unsafe {
                bitmap::small_init(self.view.page_ptr(idx as usize), self.constants.page_size, shift);
            }
        }
    }

    /// Finds the first free chunk in `page_index` (a page already
    /// linked on some slot list, per invariant 4), sets it, and
    /// unlinks the page from its slot list if that completed the
    /// bitmap. Returns the chunk's address.
    fn take_chunk_from_page(
        &self,
        descriptors: &mut [PageDescriptor],
        slots: &mut [u32],
        page_index: u32,
        class: u32,
        shift: u32,
    ) -> Option<*mut u8> {
        let page_ptr = self.view.page_ptr(page_index as usize);
        let page_size = self.constants.page_size;

        let (chunk_index, now_full) = if shift < self.constants.exact_shift {
            let idx = unsafe { bitmap::small_first_free(page_ptr, page_size, shift) }?;
            unsafe { bitmap::small_set(page_ptr, page_size, shift, idx) };
            let full = unsafe { bitmap::small_first_free(page_ptr, page_size, shift) }.is_none();
            (idx, full)
        } else if shift == self.constants.exact_shift {
            let bitmap = descriptors[page_index as usize].bitmap;
            let idx = bitmap::exact_first_free(bitmap)?;
            descriptors[page_index as usize].bitmap |= 1u64 << idx;
            let full = descriptors[page_index as usize].bitmap == u64::MAX;
            (idx as usize, full)
        } else {
            let mask = bitmap::big_mask(page_size, shift);
            let bitmap = descriptors[page_index as usize].bitmap;
            let idx = bitmap::big_first_free(bitmap, mask)?;
            descriptors[page_index as usize].bitmap |= 1u64 << idx;
            let full = descriptors[page_index as usize].bitmap == mask;
            (idx as usize, full)
        };

        if now_full {
            slot::unlink(descriptors, &mut slots[class as usize], page_index);
        }

        Some(unsafe { page_ptr.add(chunk_index << shift) })
    }

    /// Acquires the lock, performs §4.E free, releases. Tolerates an
    /// invalid `p` with a logged diagnostic rather than a panic.
    pub fn free(&self, p: *mut u8) {
        let _guard = RegionLockGuard::acquire(&self.header().lock);
        self.free_locked(p);
    }

    /// As [`Pool::free`] without acquiring the lock; the caller must
    /// already hold it.
    pub fn free_locked(&self, p: *mut u8) {
        let addr = p as usize;
        let page_index = match self.view.page_index_of(addr) {
            Some(i) => i as u32,
            None => {
                error::report(Diagnostic::OutsideOfPool, self.log_context_str());
                return;
            }
        };

        // Fetched once and threaded through as parameters: see the
        // comment in `allocate_class_locked`.
        let descriptors = unsafe { self.view.descriptor_table() };
        let slots = unsafe { self.view.slot_table() };
        let stats = unsafe { self.view.stat_table() };
        let kind = descriptors[page_index as usize].kind;

        match kind {
            Kind::FreeHead | Kind::FreeInterior | Kind::AllocBusy | Kind::AllocHead => {
                // nginx's NGX_SLAB_PAGE case checks page alignment
                // first and unconditionally, before it even looks at
                // what role the page plays: a misaligned pointer is a
                // wrong-chunk bug in the caller, not a wrong-page one.
                let page_addr = self.view.page_ptr(page_index as usize) as usize;
                if addr != page_addr {
                    error::report(Diagnostic::WrongChunk, self.log_context_str());
                    return;
                }

                match kind {
                    Kind::FreeHead | Kind::FreeInterior => {
                        error::report(Diagnostic::PageAlreadyFree, self.log_context_str());
                    }
                    Kind::AllocBusy => {
                        error::report(Diagnostic::WrongPage, self.log_context_str());
                    }
                    Kind::AllocHead => {
                        let length = descriptors[page_index as usize].run_length;
                        let header = self.header_mut();
                        freelist::free_pages(
                            descriptors,
                            &mut header.free_head,
                            &mut header.free_page_count,
                            page_index,
                            length,
                        );
                        if cfg!(debug_assertions) {
                            let bytes = length as usize * self.constants.page_size;
                            unsafe { std::ptr::write_bytes(page_addr as *mut u8, 0xA5, bytes) };
                        }
                    }
                    _ => unreachable!("handled above"),
                }
            }
            Kind::Small | Kind::Exact | Kind::Big => {
                self.free_chunk_locked(descriptors, slots, stats, page_index, kind, addr);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn free_chunk_locked(
        &self,
        descriptors: &mut [PageDescriptor],
        slots: &mut [u32],
        stats: &mut [ClassStats],
        page_index: u32,
        kind: Kind,
        addr: usize,
    ) {
        let shift = descriptors[page_index as usize].shift as u32;
        let page_addr = self.view.page_ptr(page_index as usize) as usize;
        let offset = addr - page_addr;

        if offset & ((1usize << shift) - 1) != 0 {
            error::report(Diagnostic::WrongChunk, self.log_context_str());
            return;
        }
        let chunk_index = offset >> shift;
        let class = shift - self.header().min_shift;
        let page_size = self.constants.page_size;

        // Per §4.E: "was full" is detected from the link state prior
        // to the clear, not by re-scanning the bitmap.
        let was_full = descriptors[page_index as usize].next == NONE;

        let cleared = match kind {
            Kind::Small => unsafe {
                bitmap::small_clear(self.view.page_ptr(page_index as usize), page_size, shift, chunk_index)
            },
            Kind::Exact | Kind::Big => {
                let mask = 1u64 << chunk_index;
                let bitmap = &mut descriptors[page_index as usize].bitmap;
                if *bitmap & mask == 0 {
                    false
                } else {
                    *bitmap &= !mask;
                    true
                }
            }
            _ => unreachable!("free_chunk_locked called with non-chunked kind"),
        };

        if !cleared {
            error::report(Diagnostic::ChunkAlreadyFree, self.log_context_str());
            return;
        }

        stats[class as usize].used -= 1;

        if cfg!(debug_assertions) {
            let chunk_size = 1usize << shift;
            unsafe { std::ptr::write_bytes(addr as *mut u8, 0xA5, chunk_size) };
        }

        if was_full {
            slot::push_front(descriptors, &mut slots[class as usize], page_index);
        }

        let now_empty = match kind {
            Kind::Small => unsafe {
                bitmap::small_is_empty(self.view.page_ptr(page_index as usize), page_size, shift)
            },
            Kind::Exact | Kind::Big => descriptors[page_index as usize].bitmap == 0,
            _ => unreachable!(),
        };

        if now_empty {
            slot::unlink(descriptors, &mut slots[class as usize], page_index);
            stats[class as usize].total -=
                stats::chunks_contributed_by_page(page_size, self.constants.exact_shift, shift);
            let header = self.header_mut();
            freelist::free_pages(
                descriptors,
                &mut header.free_head,
                &mut header.free_page_count,
                page_index,
                1,
            );
        }
    }
}

enum Classification {
    MultiPage(u32),
    Class(u32, u32),
}

fn ceil_log2(x: usize) -> u32 {
    debug_assert!(x > 0);
    if x <= 1 {
        0
    } else {
        usize::BITS - (x - 1).leading_zeros()
    }
}
