//! The placement engine: first-fit-by-address block reuse and tail
//! growth, parameterized by `Alignment` so the same walk serves both
//! the ordinary (word-aligned) and aligned (page-aligned) producer
//! families.
use crate::block_list;
use crate::constants::{self, Alignment, GUARD, PAGE, WORD};
use crate::header::{self, Origin, RawHeader};
use crate::heap::HeapState;
use crate::validate::{self, ValidationStatus};

/// Validates the heap, rejects zero-size requests, then places. Shared
/// by the safe `Heap` methods and by `realloc`'s relocation path, which
/// calls this on the same borrow rather than re-locking.
pub(crate) fn alloc_locked(
    state: &mut HeapState,
    size: usize,
    alignment: Alignment,
    origin: Option<Origin>,
) -> Option<usize> {
    if size == 0 {
        return None;
    }
    if validate::validate(state) != ValidationStatus::Ok {
        return None;
    }
    place(state, size, alignment, origin)
}

fn place(
    state: &mut HeapState,
    size: usize,
    alignment: Alignment,
    origin: Option<Origin>,
) -> Option<usize> {
    let head = match state.head {
        Some(head) => head,
        None => return place_in_empty_heap(state, size, alignment, origin),
    };

    let mut cursor = Some(head);
    while let Some(addr) = cursor {
        let h = block_list::read(addr);

        if h.is_free() {
            let payload = header::payload_start(addr);
            let pad = constants::align_up(payload, alignment.boundary()) - payload;

            let fits = match alignment {
                Alignment::Word => h.size >= size + pad,
                Alignment::Page => h.size >= constants::frame(size) + pad,
            };

            if fits {
                if pad == 0 {
                    return Some(reuse_in_place(addr, h, size, origin));
                } else if pad > constants::frame(1) {
                    return Some(split_leading_pad_and_restart(addr, h, pad, size, origin));
                }
                // Nonzero pad too small to host even a one-byte free
                // block: this slot can't be carved up, skip it.
            }
        }

        match h.next_addr() {
            Some(next) => cursor = Some(next),
            None => return grow_tail_and_place(state, addr, h, alignment, size, origin),
        }
    }

    unreachable!("a non-empty block list always reaches a tail")
}

/// First placement ever made against this heap: nothing to reuse, just
/// grow until there's room for the (possibly padded) first block.
fn place_in_empty_heap(
    state: &mut HeapState,
    size: usize,
    alignment: Alignment,
    origin: Option<Origin>,
) -> Option<usize> {
    let boundary = alignment.boundary();
    let candidate_payload = header::payload_start(state.base);
    let pad = constants::align_up(candidate_payload, boundary) - candidate_payload;

    if !grow_region(state, state.base, pad + constants::frame(size)) {
        return None;
    }

    let addr = state.base + pad;

    if pad > constants::frame(1) {
        // The alignment gap ahead of the first block is large enough to
        // host a header of its own: represent it as a free block instead
        // of leaving it as unheaded slack, so it validates and coalesces
        // like any other free block in the list.
        let leading_size = pad - header::HEADER_SIZE - 2 * GUARD;
        block_list::create(state.base, leading_size, true, None, None, Some(addr));
        block_list::create(addr, size, false, origin, Some(state.base), None);
        state.head = Some(state.base);
    } else {
        block_list::create(addr, size, false, origin, None, None);
        state.head = Some(addr);
    }

    Some(header::payload_start(addr))
}

/// Reuses a free block whose payload is already aligned where it sits.
/// Splits off a trailing free block if there's enough slack left over
/// to host one; otherwise the whole block (and its slack) goes live.
fn reuse_in_place(addr: usize, h: RawHeader, size: usize, origin: Option<Origin>) -> usize {
    if let Some(next) = h.next_addr() {
        let q = addr + constants::frame(size);
        let q_payload = header::payload_start(q);
        let q_pad = constants::align_up(q_payload, WORD) - q_payload;
        let q_final = q + q_pad;

        if q_final + constants::frame(1) < next {
            let trailing_size = next - q_final - header::HEADER_SIZE - 2 * GUARD;
            block_list::create(q_final, trailing_size, true, None, Some(addr), Some(next));
            block_list::relink(Some(next), addr, Some(q_final));

            let mut live = RawHeader::new(size, false, origin);
            live.set_prev(h.prev_addr());
            live.set_next(Some(q_final));
            unsafe { header::stamp_guards(addr, size) };
            block_list::store(addr, &mut live);
            return header::payload_start(addr);
        }
    }

    let mut live = RawHeader::new(h.size, false, origin);
    live.set_prev(h.prev_addr());
    live.set_next(h.next_addr());
    live.size = size;
    unsafe { header::stamp_guards(addr, size) };
    block_list::store(addr, &mut live);
    header::payload_start(addr)
}

/// Aligned family only: the free block at `addr` is big enough but its
/// payload doesn't land on a page boundary. Carves a small leading free
/// block spanning the pad, then re-examines the remainder (now
/// correctly positioned) through the ordinary reuse path.
fn split_leading_pad_and_restart(
    addr: usize,
    h: RawHeader,
    pad: usize,
    size: usize,
    origin: Option<Origin>,
) -> usize {
    let prev = h.prev_addr();
    let next = h.next_addr();
    let live_addr = addr + pad;
    let leading_size = pad - header::HEADER_SIZE - 2 * GUARD;

    // Leading free block keeps `addr` (its address is unchanged), so
    // `prev.next` still points at it; only its own `next` changes.
    block_list::create(addr, leading_size, true, None, prev, Some(live_addr));

    let remaining_size = h.size - pad;
    block_list::create(live_addr, remaining_size, true, None, Some(addr), next);
    block_list::relink(next, addr, Some(live_addr));

    let relocated = block_list::read(live_addr);
    reuse_in_place(live_addr, relocated, size, origin)
}

/// Appends a brand-new block after the current tail `t`, growing the
/// region one page at a time until there's room. A live `t` is left
/// exactly as it was save for its `next` link; a free `t` absorbs any
/// alignment pad into its own size instead of gaining a second free
/// neighbor.
fn grow_tail_and_place(
    state: &mut HeapState,
    t: usize,
    t_header: RawHeader,
    alignment: Alignment,
    size: usize,
    origin: Option<Origin>,
) -> Option<usize> {
    let boundary = alignment.boundary();
    let t_end = t + constants::frame(t_header.size);

    if !grow_region(state, t_end, constants::frame(size)) {
        return None;
    }

    let candidate_payload = header::payload_start(t_end);
    let pad = constants::align_up(candidate_payload, boundary) - candidate_payload;

    if pad > 0 && !grow_region(state, t_end, pad + constants::frame(size)) {
        return None;
    }

    let (link_prev, new_addr) = if pad > constants::frame(1) {
        if t_header.is_free() {
            // `t` is already a free block; absorb the alignment pad into
            // it directly rather than inserting a second free header
            // right after it, which would leave two free blocks adjacent
            // in the list with nothing left to coalesce them.
            block_list::resize(t, t_header.size + pad);
            (t, t_end + pad)
        } else {
            let pad_size = pad - header::HEADER_SIZE - 2 * GUARD;
            block_list::create(t_end, pad_size, true, None, Some(t), None);
            relink_next(t, t_end);
            (t_end, t_end + pad)
        }
    } else {
        (t, t_end + pad)
    };

    block_list::create(new_addr, size, false, origin, Some(link_prev), None);
    relink_next(link_prev, new_addr);

    Some(header::payload_start(new_addr))
}

fn relink_next(addr: usize, new_next: usize) {
    let mut h = block_list::read(addr);
    h.set_next(Some(new_next));
    block_list::store(addr, &mut h);
}

/// Grows the region one page at a time until at least `needed` bytes
/// are available starting at `from`. Returns `false` (leaving whatever
/// pages were already committed untouched) if the expander runs out of
/// space first.
pub(crate) fn grow_region(state: &mut HeapState, from: usize, needed: usize) -> bool {
    loop {
        let owned_end = state.base + state.pages_owned * PAGE;
        if owned_end.saturating_sub(from) >= needed {
            return true;
        }
        match state.expander.expand(PAGE as isize) {
            Ok(_) => state.pages_owned += 1,
            Err(_) => return false,
        }
    }
}
