//! Region layout arithmetic and raw accessors (§3 "Region layout",
//! §4.H), plus the optional mapping helpers a caller (or this crate's
//! own tests) can use to obtain a region in the first place.
//!
//! The layout math mirrors `ngx_slab_init`: lay the header down first,
//! then the slot table, then the stat table, then guess a descriptor
//! count from the remaining bytes and shrink it until the page data
//! area (page-aligned) actually fits, rather than solving the
//! header/descriptor/data simultaneous-fit equation in closed form.
use std::mem::size_of;
use std::ptr::NonNull;
use std::slice;

use crate::constants::SizeClassConstants;
use crate::descriptor::PageDescriptor;
use crate::error::InitError;
use crate::pool::PoolHeader;
use crate::stats::ClassStats;

fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) / align * align
}

/// Byte offsets and page count derived from a region length and the
/// pool's shift parameters. Pure arithmetic: does not touch any
/// memory.
#[derive(Clone, Copy, Debug)]
pub struct Layout {
    pub page_size: usize,
    pub page_shift: u32,
    pub min_shift: u32,
    pub num_classes: u32,
    pub num_pages: usize,
    pub slot_table_offset: usize,
    pub stat_table_offset: usize,
    pub descriptor_table_offset: usize,
    pub data_begin: usize,
    pub data_end: usize,
}

impl Layout {
    /// Computes a layout for a region of `region_len` bytes, or fails
    /// if it cannot hold the header, both tables, and at least one
    /// data page.
    pub fn compute(
        region_len: usize,
        page_size: usize,
        min_shift: u32,
    ) -> Result<Self, InitError> {
        let constants = SizeClassConstants::derive(page_size);
        let page_shift = constants.page_shift;

        if min_shift < 3 || min_shift > constants.exact_shift {
            return Err(InitError::InvalidMinShift {
                min_shift,
                exact_shift: constants.exact_shift,
            });
        }

        let num_classes = page_shift - min_shift;
        let header_size = size_of::<PoolHeader>();

        let slot_table_offset = align_up(header_size, size_of::<u32>());
        let slot_table_size = num_classes as usize * size_of::<u32>();

        let stat_table_offset =
            align_up(slot_table_offset + slot_table_size, size_of::<ClassStats>());
        let stat_table_size = num_classes as usize * size_of::<ClassStats>();

        let descriptor_table_offset = align_up(
            stat_table_offset + stat_table_size,
            size_of::<PageDescriptor>(),
        );
        let descriptor_size = size_of::<PageDescriptor>();

        if region_len <= descriptor_table_offset {
            return Err(InitError::RegionTooSmall {
                needed: descriptor_table_offset + descriptor_size + page_size,
                available: region_len,
            });
        }

        let remaining = region_len - descriptor_table_offset;
        let mut num_pages = remaining / (descriptor_size + page_size);

        loop {
            if num_pages == 0 {
                return Err(InitError::RegionTooSmall {
                    needed: descriptor_table_offset + descriptor_size + page_size,
                    available: region_len,
                });
            }

            let data_begin =
                align_up(descriptor_table_offset + num_pages * descriptor_size, page_size);
            let data_end = data_begin + num_pages * page_size;

            if data_end <= region_len {
                return Ok(Self {
                    page_size,
                    page_shift,
                    min_shift,
                    num_classes,
                    num_pages,
                    slot_table_offset,
                    stat_table_offset,
                    descriptor_table_offset,
                    data_begin,
                    data_end,
                });
            }

            num_pages -= 1;
        }
    }
}

/// A process-local view over a region already laid out per some
/// [`Layout`]: a base pointer plus the arithmetic to find each table
/// and page within it.
///
/// All accessors return raw pointers rather than borrowed references:
/// the region is mutated by many call sites under the pool's single
/// lock, not by Rust's borrow checker, exactly as a C pointer into the
/// same bytes would be.
#[derive(Clone, Copy)]
pub struct RegionView {
    base: NonNull<u8>,
    pub layout: Layout,
}

impl RegionView {
    /// # Safety
    ///
    /// `base` must point to at least `layout.data_end` live, writable
    /// bytes for the lifetime of this view.
    pub unsafe fn new(base: NonNull<u8>, layout: Layout) -> Self {
        Self { base, layout }
    }

    pub fn header_ptr(&self) -> *mut PoolHeader {
        self.base.as_ptr() as *mut PoolHeader
    }

    pub fn slot_table_ptr(&self) -> *mut u32 {
        unsafe { self.base.as_ptr().add(self.layout.slot_table_offset) as *mut u32 }
    }

    pub fn stat_table_ptr(&self) -> *mut ClassStats {
        unsafe { self.base.as_ptr().add(self.layout.stat_table_offset) as *mut ClassStats }
    }

    pub fn descriptor_table_ptr(&self) -> *mut PageDescriptor {
        unsafe {
            self.base.as_ptr().add(self.layout.descriptor_table_offset) as *mut PageDescriptor
        }
    }

    /// # Safety
    ///
    /// The returned slice aliases memory mutated elsewhere under the
    /// pool's lock; callers must only use it while holding that lock.
    pub unsafe fn slot_table(&self) -> &'static mut [u32] {
        slice::from_raw_parts_mut(self.slot_table_ptr(), self.layout.num_classes as usize)
    }

    /// # Safety
    ///
    /// See [`RegionView::slot_table`].
    pub unsafe fn stat_table(&self) -> &'static mut [ClassStats] {
        slice::from_raw_parts_mut(self.stat_table_ptr(), self.layout.num_classes as usize)
    }

    /// # Safety
    ///
    /// See [`RegionView::slot_table`].
    pub unsafe fn descriptor_table(&self) -> &'static mut [PageDescriptor] {
        slice::from_raw_parts_mut(self.descriptor_table_ptr(), self.layout.num_pages)
    }

    /// Pointer to the first byte of data page `index`.
    pub fn page_ptr(&self, index: usize) -> *mut u8 {
        debug_assert!(index < self.layout.num_pages);
        unsafe {
            self.base
                .as_ptr()
                .add(self.layout.data_begin + index * self.layout.page_size)
        }
    }

    /// The descriptor-table index covering address `addr`, if `addr`
    /// falls within `[data_begin, data_end)`.
    pub fn page_index_of(&self, addr: usize) -> Option<usize> {
        let base = self.base.as_ptr() as usize;
        let offset = addr.checked_sub(base)?;
        if offset < self.layout.data_begin || offset >= self.layout.data_end {
            return None;
        }
        Some((offset - self.layout.data_begin) / self.layout.page_size)
    }

    pub fn base_addr(&self) -> usize {
        self.base.as_ptr() as usize
    }
}

/// An owned anonymous or file-backed shared mapping, used by this
/// crate's own tests (and available to callers who don't want to
/// drive `memmap2` themselves). Plays the role the reference
/// implementation's `Mapper` trait and file-backed mapper played,
/// substituting a maintained mapping crate for a bespoke C shim.
pub struct MappedRegion {
    mmap: memmap2::MmapMut,
}

impl MappedRegion {
    /// Maps a fresh anonymous region of `len` bytes, shareable with
    /// child processes via `fork` but not nameable from elsewhere.
    pub fn anonymous(len: usize) -> std::io::Result<Self> {
        let mmap = memmap2::MmapOptions::new().len(len).map_anon()?;
        Ok(Self { mmap })
    }

    /// Maps `len` bytes of `file`, growing it first if it is shorter.
    /// Two processes mapping the same path observe the same bytes,
    /// which is how this crate's re-attach tests simulate a second
    /// process without actually forking one.
    pub fn file_backed(file: &std::fs::File, len: usize) -> std::io::Result<Self> {
        file.set_len(len as u64)?;
        let mmap = unsafe { memmap2::MmapOptions::new().len(len).map_mut(file)? };
        Ok(Self { mmap })
    }

    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    pub fn as_non_null(&mut self) -> NonNull<u8> {
        NonNull::new(self.mmap.as_mut_ptr()).expect("mmap base is never null")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn layout_fits_within_region() {
        let layout = Layout::compute(1 << 20, 4096, 3).expect("should fit");
        assert!(layout.data_end <= (1 << 20));
        assert_eq!(layout.data_begin % layout.page_size, 0);
        assert!(layout.num_pages > 0);
    }

    #[test]
    fn layout_rejects_undersized_region() {
        let err = Layout::compute(64, 4096, 3).unwrap_err();
        assert!(matches!(err, InitError::RegionTooSmall { .. }));
    }

    #[test]
    fn layout_rejects_bad_min_shift() {
        let err = Layout::compute(1 << 20, 4096, 10).unwrap_err();
        assert!(matches!(err, InitError::InvalidMinShift { .. }));
    }

    #[test]
    fn anonymous_region_roundtrip() {
        let mut region = MappedRegion::anonymous(4096).expect("map");
        let ptr = region.as_non_null();
        unsafe {
            *ptr.as_ptr() = 0x42;
            assert_eq!(*ptr.as_ptr(), 0x42);
        }
    }

    #[test]
    fn file_backed_region_is_shared_across_handles() {
        let file = tempfile::tempfile().expect("tempfile");
        let mut a = MappedRegion::file_backed(&file, 4096).expect("map a");
        let mut b = MappedRegion::file_backed(&file, 4096).expect("map b");

        unsafe {
            *a.as_non_null().as_ptr() = 7;
        }
        a.mmap.flush().expect("flush");
        unsafe {
            assert_eq!(*b.as_non_null().as_ptr(), 7);
        }
    }
}
