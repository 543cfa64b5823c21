//! Release and coalescing: marks a block free, merges it with any free
//! neighbor on either side, reclaims trailing slack, and re-stamps
//! exactly once.
use crate::block_list;
use crate::constants::GUARD;
use crate::header;
use crate::heap::HeapState;
use crate::validate::{self, PointerClass, ValidationStatus};

pub(crate) fn free_locked(state: &mut HeapState, p: Option<usize>) {
    let p = match p {
        None => return,
        Some(p) => p,
    };

    if validate::validate(state) != ValidationStatus::Ok {
        return;
    }
    if validate::classify(state, Some(p)) != PointerClass::Valid {
        return;
    }

    let mut addr = header::block_addr_from_payload(p);
    block_list::set_free(addr, true);
    let mut h = block_list::read(addr);

    if let Some(prev) = h.prev_addr() {
        if block_list::read(prev).is_free() {
            block_list::merge_into(prev, addr);
            addr = prev;
            h = block_list::read(addr);
        }
    }

    if let Some(next) = h.next_addr() {
        if block_list::read(next).is_free() {
            block_list::merge_into(addr, next);
            h = block_list::read(addr);
        }
    }

    // Reclaim any dead slack between this block's payload and whatever
    // comes next, whether or not a merge just happened above.
    if let Some(next) = h.next_addr() {
        h.size = next - addr - header::HEADER_SIZE - 2 * GUARD;
    }

    unsafe { header::stamp_guards(addr, h.size) };
    block_list::store(addr, &mut h);

    if let Some(prev) = h.prev_addr() {
        block_list::store(prev, &mut block_list::read(prev));
    }
    if let Some(next) = h.next_addr() {
        block_list::store(next, &mut block_list::read(next));
    }
}

#[cfg(test)]
mod test {
    use crate::constants::PAGE;
    use crate::expander::StaticRegionExpander;
    use crate::heap::Heap;
    use crate::validate::PointerClass;

    fn fresh_heap(capacity_pages: usize) -> (Heap, Box<StaticRegionExpander>) {
        let expander = Box::new(StaticRegionExpander::new(capacity_pages * PAGE));
        let expander_ref: &'static StaticRegionExpander =
            unsafe { &*(expander.as_ref() as *const StaticRegionExpander) };
        let heap = Heap::new(expander_ref);
        heap.setup().expect("setup");
        (heap, expander)
    }

    #[test]
    fn freed_pointer_is_no_longer_valid() {
        let (heap, _expander) = fresh_heap(16);
        let p = heap.alloc(32).unwrap();
        heap.free(Some(p));
        assert_ne!(heap.classify(Some(p)), PointerClass::Valid);
    }

    #[test]
    fn adjacent_free_blocks_coalesce_into_a_larger_allocation() {
        let (heap, _expander) = fresh_heap(16);
        let a = heap.alloc(32).unwrap();
        let b = heap.alloc(32).unwrap();
        let c = heap.alloc(32).unwrap();

        heap.free(Some(a));
        heap.free(Some(b));

        // a and b coalesced into one free run; a big-enough request
        // should reuse it rather than growing the tail past c.
        let d = heap.alloc(64).unwrap();
        assert_eq!(d, a);
        let _ = c;
    }

    #[test]
    fn double_free_is_a_no_op() {
        let (heap, _expander) = fresh_heap(16);
        let p = heap.alloc(32).unwrap();
        heap.free(Some(p));
        heap.free(Some(p));
        assert_eq!(heap.validate(), crate::validate::ValidationStatus::Ok);
    }

    #[test]
    fn free_of_null_is_a_no_op() {
        let (heap, _expander) = fresh_heap(16);
        heap.free(None);
        assert_eq!(heap.validate(), crate::validate::ValidationStatus::Ok);
    }
}
