//! Reallocation: shrink in place with a possible trailing split, grow
//! in place by absorbing a free successor or widening into existing
//! slack, or relocate via the ordinary alloc/copy/free path when
//! neither fits. The whole operation runs on one borrow of `HeapState`,
//! so nesting into `placement`/`free`'s internals never re-acquires the
//! heap's lock.
use crate::block_list;
use crate::constants::{self, Alignment, GUARD, WORD};
use crate::free;
use crate::header::{self, Origin, RawHeader};
use crate::heap::HeapState;
use crate::placement;
use crate::validate::{self, PointerClass, ValidationStatus};

pub(crate) fn realloc_locked(
    state: &mut HeapState,
    p: Option<usize>,
    size: usize,
    alignment: Alignment,
    origin: Option<Origin>,
) -> Option<usize> {
    match (p, size) {
        (None, 0) => return None,
        (None, _) => return placement::alloc_locked(state, size, alignment, origin),
        (Some(_), 0) => {
            free::free_locked(state, p);
            return None;
        }
        _ => {}
    }
    let p = p.unwrap();

    if validate::validate(state) != ValidationStatus::Ok {
        return None;
    }
    if validate::classify(state, Some(p)) != PointerClass::Valid {
        return None;
    }

    let addr = header::block_addr_from_payload(p);
    let h = block_list::read(addr);

    use std::cmp::Ordering;
    match size.cmp(&h.size) {
        Ordering::Equal => Some(p),
        Ordering::Less => Some(shrink(addr, h, size)),
        Ordering::Greater => grow(state, addr, h, size, alignment, origin),
    }
}

/// Splits off a trailing free block if there's enough slack past the
/// new, smaller size to host one; otherwise just shrinks in place and
/// leaves the extra slack inside the block, unreachable until the next
/// realloc or free.
fn shrink(addr: usize, h: RawHeader, size: usize) -> usize {
    if let Some(next) = h.next_addr() {
        let q = addr + constants::frame(size);
        let q_payload = header::payload_start(q);
        let q_pad = constants::align_up(q_payload, WORD) - q_payload;
        let q_final = q + q_pad;

        if q_final + constants::frame(1) < next {
            let trailing_size = next - q_final - header::HEADER_SIZE - 2 * GUARD;
            block_list::create(q_final, trailing_size, true, None, Some(addr), Some(next));
            block_list::relink(Some(next), addr, Some(q_final));

            block_list::resize(addr, size);
            let mut h = block_list::read(addr);
            h.set_next(Some(q_final));
            block_list::store(addr, &mut h);
            return header::payload_start(addr);
        }
    }

    block_list::resize(addr, size);
    header::payload_start(addr)
}

fn grow(
    state: &mut HeapState,
    addr: usize,
    h: RawHeader,
    size: usize,
    alignment: Alignment,
    origin: Option<Origin>,
) -> Option<usize> {
    if let Some(next) = h.next_addr() {
        let next_h = block_list::read(next);

        if next_h.is_free() && next + constants::frame(next_h.size) - addr >= constants::frame(size)
        {
            block_list::merge_into(addr, next);
            block_list::resize(addr, size);
            return Some(header::payload_start(addr));
        }

        if next - addr >= constants::frame(size) {
            block_list::resize(addr, size);
            return Some(header::payload_start(addr));
        }

        // Neither the absorbed-successor nor the in-place-widen case
        // fits: relocate to a fresh block of the requested family, copy
        // the live payload, and free the old block.
        let new_p = placement::alloc_locked(state, size, alignment, origin)?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                header::payload_start(addr) as *const u8,
                new_p as *mut u8,
                h.size,
            );
        }
        free::free_locked(state, Some(header::payload_start(addr)));
        Some(new_p)
    } else {
        // `addr` is the tail: grow the region in place rather than
        // relocating. `b` widens at its existing address, so the needed
        // span is measured from `addr` itself, not from its old frame's
        // end.
        if !placement::grow_region(state, addr, constants::frame(size)) {
            return None;
        }
        block_list::resize(addr, size);
        Some(header::payload_start(addr))
    }
}

#[cfg(test)]
mod test {
    use crate::constants::PAGE;
    use crate::expander::StaticRegionExpander;
    use crate::heap::Heap;

    fn fresh_heap(capacity_pages: usize) -> (Heap, Box<StaticRegionExpander>) {
        let expander = Box::new(StaticRegionExpander::new(capacity_pages * PAGE));
        let expander_ref: &'static StaticRegionExpander =
            unsafe { &*(expander.as_ref() as *const StaticRegionExpander) };
        let heap = Heap::new(expander_ref);
        heap.setup().expect("setup");
        (heap, expander)
    }

    #[test]
    fn realloc_null_is_alloc() {
        let (heap, _expander) = fresh_heap(16);
        let p = heap.realloc(None, 32).expect("realloc(NULL, n) == alloc(n)");
        assert_eq!(heap.classify(Some(p)), crate::validate::PointerClass::Valid);
    }

    #[test]
    fn realloc_to_zero_frees_and_returns_none() {
        let (heap, _expander) = fresh_heap(16);
        let p = heap.alloc(32).unwrap();
        assert_eq!(heap.realloc(Some(p), 0), None);
        assert_ne!(
            heap.classify(Some(p)),
            crate::validate::PointerClass::Valid
        );
    }

    #[test]
    fn realloc_same_size_is_a_no_op() {
        let (heap, _expander) = fresh_heap(16);
        let p = heap.alloc(32).unwrap();
        assert_eq!(heap.realloc(Some(p), 32), Some(p));
    }

    #[test]
    fn realloc_preserves_contents_across_relocation() {
        let (heap, _expander) = fresh_heap(16);
        let p = heap.alloc(8).unwrap();
        unsafe {
            std::ptr::write_bytes(p as *mut u8, 0xab, 8);
        }
        // Force a relocation by allocating a neighbor that pins `p` in
        // place, then asking for more than the remaining slack.
        let _pin = heap.alloc(8).unwrap();
        let grown = heap.realloc(Some(p), 256).expect("realloc should relocate");
        let bytes = unsafe { std::slice::from_raw_parts(grown as *const u8, 8) };
        assert_eq!(bytes, &[0xabu8; 8]);
    }

    #[test]
    fn realloc_shrink_keeps_same_address() {
        let (heap, _expander) = fresh_heap(16);
        let p = heap.alloc(256).unwrap();
        let shrunk = heap.realloc(Some(p), 16).unwrap();
        assert_eq!(shrunk, p);
    }
}
