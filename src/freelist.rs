//! The free-page list: first-fit allocation with split, and
//! coalescing free (§4.B, invariants 2/3/8). Operates directly on a
//! descriptor slice and a `free_head`/`free_page_count` pair so it
//! can be exercised without a full `Pool` (see the property tests
//! below).
#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use contracts::*;
#[cfg(not(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
)))]
use disabled_contracts::*;

use crate::descriptor::{Kind, PageDescriptor, NONE};
use crate::slot;

/// Finds and removes the first run of at least `n` pages, splitting
/// off any remainder, and stamps the returned run as an allocation
/// head of exactly `n` pages. Returns the head's descriptor index.
#[requires(n > 0, "Must allocate at least one page.")]
#[ensures(ret.is_some() -> *free_page_count == old(*free_page_count) - n,
          "A successful allocation removes exactly n pages from the free list.")]
pub fn alloc_pages(
    descriptors: &mut [PageDescriptor],
    free_head: &mut u32,
    free_page_count: &mut u32,
    n: u32,
) -> Option<u32> {
    let mut cursor = *free_head;
    while cursor != NONE {
        let run_length = descriptors[cursor as usize].run_length;
        let next = descriptors[cursor as usize].next;

        if run_length >= n {
            if run_length > n {
                split_run(descriptors, free_head, cursor, n);
            } else {
                slot::unlink(descriptors, free_head, cursor);
            }

            stamp_allocation(descriptors, cursor, n);
            *free_page_count -= n;
            return Some(cursor);
        }

        cursor = next;
    }

    None
}

/// Splits the run at `head` (known length > `n`) into a leading
/// segment of length `n` (left in place, still linked where `head`
/// was) and a trailing segment of the remainder, installed in the
/// free list in `head`'s place.
fn split_run(descriptors: &mut [PageDescriptor], free_head: &mut u32, head: u32, n: u32) {
    let run_length = descriptors[head as usize].run_length;
    let remainder_index = head + n;
    let remainder_len = run_length - n;
    let prev = descriptors[head as usize].prev;
    let next = descriptors[head as usize].next;

    descriptors[remainder_index as usize] = PageDescriptor {
        kind: Kind::FreeHead,
        run_length: remainder_len,
        prev,
        next,
        ..PageDescriptor::blank()
    };

    if prev != NONE {
        descriptors[prev as usize].next = remainder_index;
    } else {
        *free_head = remainder_index;
    }
    if next != NONE {
        descriptors[next as usize].prev = remainder_index;
    }

    write_tail_back_pointer(descriptors, remainder_index, remainder_len);
}

/// Marks `[head, head+n)` as a live multi-page allocation.
fn stamp_allocation(descriptors: &mut [PageDescriptor], head: u32, n: u32) {
    descriptors[head as usize] = PageDescriptor {
        kind: Kind::AllocHead,
        run_length: n,
        ..PageDescriptor::blank()
    };

    for offset in 1..n {
        descriptors[(head + offset) as usize] = PageDescriptor {
            kind: Kind::AllocBusy,
            ..PageDescriptor::blank()
        };
    }
}

/// Writes `descriptors[run_head + len - 1].prev = run_head` when the
/// run is longer than one page (invariant 3), blanks interior pages
/// otherwise.
fn write_tail_back_pointer(descriptors: &mut [PageDescriptor], run_head: u32, len: u32) {
    for offset in 1..len {
        descriptors[(run_head + offset) as usize] = PageDescriptor {
            kind: Kind::FreeInterior,
            ..PageDescriptor::blank()
        };
    }
    if len > 1 {
        let tail = run_head + len - 1;
        descriptors[tail as usize].kind = Kind::FreeInterior;
        descriptors[tail as usize].prev = run_head;
    }
}

/// Finds the free-run head immediately preceding `page`, if `page -
/// 1` belongs to a free run. Any page immediately preceding another
/// page is, by contiguity, the *tail* of whatever run it belongs to,
/// so a `FreeInterior` neighbor's `prev` field is always a valid
/// back-pointer to that run's head (never an unrelated stale value).
fn backward_neighbor_head(descriptors: &[PageDescriptor], page: u32) -> Option<u32> {
    if page == 0 {
        return None;
    }
    let prev_index = page - 1;
    match descriptors[prev_index as usize].kind {
        Kind::FreeHead => Some(prev_index),
        Kind::FreeInterior => {
            let head = descriptors[prev_index as usize].prev;
            if head == NONE {
                None
            } else {
                Some(head)
            }
        }
        _ => None,
    }
}

/// Returns `[page, page+n)` to the free list, coalescing with an
/// immediately adjacent free run on either side (§4.B). The caller
/// must have already unlinked `page` from any slot list it was on —
/// this function only ever touches the free list.
#[requires(n > 0, "Must free at least one page.")]
#[ensures(*free_page_count == old(*free_page_count) + n,
          "Freeing always grows the free-page count by exactly n.")]
pub fn free_pages(
    descriptors: &mut [PageDescriptor],
    free_head: &mut u32,
    free_page_count: &mut u32,
    page: u32,
    n: u32,
) {
    let mut head = page;
    let mut total_len = n;

    write_tail_back_pointer(descriptors, head, total_len);
    descriptors[head as usize] = PageDescriptor {
        kind: Kind::FreeHead,
        run_length: total_len,
        ..PageDescriptor::blank()
    };

    // Forward coalesce: the page immediately after the run, if itself
    // a linked free-run head.
    let forward = head + total_len;
    if (forward as usize) < descriptors.len() && descriptors[forward as usize].kind == Kind::FreeHead {
        let forward_len = descriptors[forward as usize].run_length;
        slot::unlink(descriptors, free_head, forward);
        total_len += forward_len;
    }

    // Backward coalesce: absorb into whatever free run immediately precedes us.
    if let Some(back_head) = backward_neighbor_head(descriptors, page) {
        let back_len = descriptors[back_head as usize].run_length;
        slot::unlink(descriptors, free_head, back_head);
        total_len += back_len;
        head = back_head;
    }

    descriptors[head as usize] = PageDescriptor {
        kind: Kind::FreeHead,
        run_length: total_len,
        ..PageDescriptor::blank()
    };
    write_tail_back_pointer(descriptors, head, total_len);

    slot::push_front(descriptors, free_head, head);
    *free_page_count += n;
}

#[cfg(test)]
mod test {
    use super::*;

    fn fresh_pool(num_pages: u32) -> (Vec<PageDescriptor>, u32, u32) {
        let mut descriptors = vec![PageDescriptor::blank(); num_pages as usize];
        descriptors[0] = PageDescriptor {
            kind: Kind::FreeHead,
            run_length: num_pages,
            ..PageDescriptor::blank()
        };
        write_tail_back_pointer(&mut descriptors, 0, num_pages);
        (descriptors, 0, num_pages)
    }

    #[test]
    fn alloc_then_free_restores_single_run() {
        let (mut descriptors, mut head, mut count) = fresh_pool(10);

        let page = alloc_pages(&mut descriptors, &mut head, &mut count, 3).expect("room");
        assert_eq!(page, 0);
        assert_eq!(count, 7);
        assert_eq!(descriptors[0].kind, Kind::AllocHead);
        assert_eq!(descriptors[1].kind, Kind::AllocBusy);
        assert_eq!(descriptors[2].kind, Kind::AllocBusy);
        // Remainder run starts at page 3.
        assert_eq!(head, 3);
        assert_eq!(descriptors[3].run_length, 7);

        free_pages(&mut descriptors, &mut head, &mut count, 0, 3);
        assert_eq!(count, 10);
        assert_eq!(head, 0);
        assert_eq!(descriptors[0].kind, Kind::FreeHead);
        assert_eq!(descriptors[0].run_length, 10);
    }

    #[test]
    fn forward_coalesce_merges_adjacent_run() {
        let (mut descriptors, mut head, mut count) = fresh_pool(10);

        let a = alloc_pages(&mut descriptors, &mut head, &mut count, 2).unwrap(); // [0,2)
        let b = alloc_pages(&mut descriptors, &mut head, &mut count, 2).unwrap(); // [2,4)
        assert_eq!(a, 0);
        assert_eq!(b, 2);

        // Free b first, then a: freeing a should forward-coalesce with b's run.
        free_pages(&mut descriptors, &mut head, &mut count, 2, 2);
        free_pages(&mut descriptors, &mut head, &mut count, 0, 2);

        assert_eq!(count, 10);
        assert_eq!(descriptors[0].kind, Kind::FreeHead);
        assert_eq!(descriptors[0].run_length, 10);
    }

    #[test]
    fn backward_coalesce_merges_into_preceding_run() {
        let (mut descriptors, mut head, mut count) = fresh_pool(10);

        let a = alloc_pages(&mut descriptors, &mut head, &mut count, 2).unwrap(); // [0,2)
        let b = alloc_pages(&mut descriptors, &mut head, &mut count, 2).unwrap(); // [2,4)
        assert_eq!(a, 0);
        assert_eq!(b, 2);

        // Free a first so [0,2) rejoins the tail run at [4,10), then free b:
        // it should backward-coalesce into the run that now starts at 0.
        free_pages(&mut descriptors, &mut head, &mut count, 0, 2);
        free_pages(&mut descriptors, &mut head, &mut count, 2, 2);

        assert_eq!(count, 10);
        assert_eq!(descriptors[0].kind, Kind::FreeHead);
        assert_eq!(descriptors[0].run_length, 10);
    }

    #[test]
    fn exhausting_supply_returns_none() {
        let (mut descriptors, mut head, mut count) = fresh_pool(4);
        assert!(alloc_pages(&mut descriptors, &mut head, &mut count, 4).is_some());
        assert_eq!(count, 0);
        assert!(alloc_pages(&mut descriptors, &mut head, &mut count, 1).is_none());
    }

    #[test]
    fn tail_back_pointer_is_maintained_on_every_run() {
        let (mut descriptors, mut head, mut count) = fresh_pool(6);
        let page = alloc_pages(&mut descriptors, &mut head, &mut count, 2).unwrap();
        free_pages(&mut descriptors, &mut head, &mut count, page, 2);

        // Invariant 3: tail of the sole run back-points to its head.
        let run_head = head;
        let run_len = descriptors[run_head as usize].run_length;
        if run_len > 1 {
            let tail = run_head + run_len - 1;
            assert_eq!(descriptors[tail as usize].prev, run_head);
        }
    }
}
