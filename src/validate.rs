//! Integrity validation, pointer classification, and the largest-live-
//! block query. These three read-only operations are the primary way a
//! caller (or the block manager itself, on every other public entry
//! point) asks whether the heap's own bookkeeping can still be trusted.
use crate::block_list;
use crate::constants::GUARD;
use crate::header;
use crate::heap::HeapState;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValidationStatus {
    Ok,
    FencesCorrupted,
    Uninitialized,
    ControlCorrupted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PointerClass {
    Null,
    HeapCorrupted,
    ControlBlock,
    InsideFences,
    InsideDataBlock,
    Unallocated,
    Valid,
}

impl ValidationStatus {
    /// Numeric code handed across the C ABI boundary.
    pub fn as_code(self) -> i32 {
        match self {
            ValidationStatus::Ok => 0,
            ValidationStatus::FencesCorrupted => 1,
            ValidationStatus::Uninitialized => 2,
            ValidationStatus::ControlCorrupted => 3,
        }
    }
}

impl PointerClass {
    /// Numeric code handed across the C ABI boundary.
    pub fn as_code(self) -> i32 {
        match self {
            PointerClass::Null => 0,
            PointerClass::HeapCorrupted => 1,
            PointerClass::ControlBlock => 2,
            PointerClass::InsideFences => 3,
            PointerClass::InsideDataBlock => 4,
            PointerClass::Unallocated => 5,
            PointerClass::Valid => 6,
        }
    }
}

/// Walks the block list checksum-then-guards at every node, in address
/// order. The first corrupted node determines the verdict; an empty or
/// never-set-up heap is vacuously `Ok`/`Uninitialized`.
pub(crate) fn validate(state: &HeapState) -> ValidationStatus {
    if state.base == 0 {
        return ValidationStatus::Uninitialized;
    }

    let mut cursor = state.head;
    while let Some(addr) = cursor {
        let h = block_list::read(addr);
        if !h.checksum_ok() {
            return ValidationStatus::ControlCorrupted;
        }
        if unsafe { !header::guards_ok(addr, h.size) } {
            return ValidationStatus::FencesCorrupted;
        }
        cursor = h.next_addr();
    }

    ValidationStatus::Ok
}

/// Classifies `p` against the current block list. Runs `validate`
/// first: a corrupted heap can't be trusted to classify anything.
pub(crate) fn classify(state: &HeapState, p: Option<usize>) -> PointerClass {
    let p = match p {
        None => return PointerClass::Null,
        Some(p) => p,
    };

    if validate(state) != ValidationStatus::Ok {
        return PointerClass::HeapCorrupted;
    }

    if state.base == 0 || p < state.base {
        return PointerClass::Unallocated;
    }

    let head = match state.head {
        Some(head) => head,
        None => return PointerClass::Unallocated,
    };

    if p < head {
        return PointerClass::Unallocated;
    }

    let mut t = head;
    let mut cursor = Some(head);
    while let Some(addr) = cursor {
        if addr > p {
            break;
        }
        t = addr;
        cursor = block_list::read(addr).next_addr();
    }

    classify_against_block(t, p)
}

fn classify_against_block(t: usize, p: usize) -> PointerClass {
    let h = block_list::read(t);
    let header_end = t + header::HEADER_SIZE;
    let left_guard_end = header_end + GUARD;
    let payload_start = header::payload_start(t);
    let payload_end = payload_start + h.size;
    let right_guard_end = payload_end + GUARD;

    if p < header_end {
        return PointerClass::ControlBlock;
    }
    if p < left_guard_end {
        return if h.is_free() {
            PointerClass::Unallocated
        } else {
            PointerClass::InsideFences
        };
    }
    if p == payload_start {
        return if h.is_free() {
            PointerClass::Unallocated
        } else {
            PointerClass::Valid
        };
    }
    if p < payload_end {
        return if h.is_free() {
            PointerClass::Unallocated
        } else {
            PointerClass::InsideDataBlock
        };
    }
    if p < right_guard_end {
        return if h.is_free() {
            PointerClass::Unallocated
        } else {
            PointerClass::InsideFences
        };
    }

    // Past the right guard, before whatever comes next: dead slack or
    // the next block's own header, neither of which belongs to `t`.
    PointerClass::Unallocated
}

/// Largest payload size among currently live (non-free) blocks, or 0 if
/// none are live or the heap is corrupted.
pub(crate) fn largest(state: &HeapState) -> usize {
    if validate(state) != ValidationStatus::Ok {
        return 0;
    }

    let mut max = 0;
    let mut cursor = state.head;
    while let Some(addr) = cursor {
        let h = block_list::read(addr);
        if !h.is_free() && h.size > max {
            max = h.size;
        }
        cursor = h.next_addr();
    }
    max
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::expander::StaticRegionExpander;
    use crate::heap::Heap;

    fn fresh_heap() -> (Heap, Box<StaticRegionExpander>) {
        let expander = Box::new(StaticRegionExpander::new(64 * crate::constants::PAGE));
        let expander_ref: &'static StaticRegionExpander =
            unsafe { &*(expander.as_ref() as *const StaticRegionExpander) };
        let heap = Heap::new(expander_ref);
        heap.setup().expect("setup");
        (heap, expander)
    }

    #[test]
    fn classify_null_and_unallocated() {
        let (heap, _expander) = fresh_heap();
        assert_eq!(heap.classify(None), PointerClass::Null);
        assert_eq!(heap.classify(Some(1)), PointerClass::Unallocated);
    }

    #[test]
    fn classify_valid_and_interior() {
        let (heap, _expander) = fresh_heap();
        let p = heap.alloc(32).expect("alloc");
        assert_eq!(heap.classify(Some(p)), PointerClass::Valid);
        assert_eq!(heap.classify(Some(p + 1)), PointerClass::InsideDataBlock);
        assert_eq!(
            heap.classify(Some(p - 1)),
            PointerClass::InsideFences
        );
    }

    #[test]
    fn largest_tracks_live_blocks_only() {
        let (heap, _expander) = fresh_heap();
        assert_eq!(heap.largest(), 0);

        let a = heap.alloc(64).unwrap();
        let _b = heap.alloc(16).unwrap();
        assert_eq!(heap.largest(), 64);

        heap.free(Some(a));
        assert_eq!(heap.largest(), 16);
    }

    #[test]
    fn stray_guard_byte_is_detected_as_fences_corrupted() {
        let (heap, _expander) = fresh_heap();
        let p = heap.alloc(32).expect("alloc");

        // `p - 1` is the last byte of the left guard, which should hold
        // `GUARD_LEFT_BYTE`.
        unsafe { ((p - 1) as *mut u8).write(0) };

        assert_eq!(heap.validate(), ValidationStatus::FencesCorrupted);
        assert_eq!(heap.classify(Some(p)), PointerClass::HeapCorrupted);
        assert_eq!(heap.alloc(8), None, "any public op short-circuits on corruption");
    }

    #[test]
    fn stray_header_byte_is_detected_as_control_corrupted() {
        let (heap, _expander) = fresh_heap();
        let p = heap.alloc(32).expect("alloc");

        let header_addr = header::block_addr_from_payload(p);
        unsafe {
            let byte = header_addr as *mut u8;
            byte.write(byte.read().wrapping_add(1));
        }

        assert_eq!(heap.validate(), ValidationStatus::ControlCorrupted);
        assert_eq!(heap.classify(Some(p)), PointerClass::HeapCorrupted);
        assert_eq!(heap.alloc(8), None, "any public op short-circuits on corruption");
    }
}
