//! Per-size-class counters, one record per slot.  Mirrors the
//! reference implementation's `ngx_slab_stat_t`: plain counters
//! protected by the pool's lock, not atomics, since every mutation
//! already happens inside the critical section.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct ClassStats {
    /// Live chunks of this class currently carved out of pages
    /// dedicated to the class (i.e. capacity, not usage).
    pub total: u64,
    /// Live allocated chunks.
    pub used: u64,
    /// Lifetime allocation requests.
    pub reqs: u64,
    /// Lifetime allocation failures.
    pub fails: u64,
}

impl ClassStats {
    /// Invariant 7: `used` never exceeds `total`.
    pub fn is_consistent(&self) -> bool {
        self.used <= self.total
    }
}

/// The number of chunks a single fresh page of class `shift`
/// contributes to `total`, for the regime implied by `shift` relative
/// to `exact_shift`.
///
/// Centralized so the SMALL-allocate path (`total += contributed`)
/// and SMALL-free path (`total -= contributed`) can never drift apart
/// (design notes §9, "resolved open question").
pub fn chunks_contributed_by_page(page_size: usize, exact_shift: u32, shift: u32) -> u64 {
    let chunks_per_page = (page_size >> shift) as u64;

    if shift < exact_shift {
        let reserved = crate::bitmap::small_reserved_chunks(page_size, shift);
        chunks_per_page - reserved as u64
    } else if shift == exact_shift {
        8 * std::mem::size_of::<usize>() as u64
    } else {
        chunks_per_page
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn consistency_check() {
        let mut s = ClassStats::default();
        assert!(s.is_consistent());
        s.total = 4;
        s.used = 4;
        assert!(s.is_consistent());
        s.used = 5;
        assert!(!s.is_consistent());
    }

    #[test]
    fn exact_class_contributes_one_word_of_chunks() {
        // page_size=4096, exact_shift=6 (word_size=8): 8*8 = 64 chunks.
        assert_eq!(chunks_contributed_by_page(4096, 6, 6), 64);
    }

    #[test]
    fn big_class_contributes_full_page() {
        // shift=7 (128-byte chunks) on a 4096-byte page: 32 chunks.
        assert_eq!(chunks_contributed_by_page(4096, 6, 7), 32);
    }
}
