//! The top-level `Heap` type: a reentrant-locked `HeapState` plus the
//! safe Rust methods that compose the placement, realloc, free, and
//! validation modules into the allocator's public surface.
use std::cell::RefCell;

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
use parking_lot::ReentrantMutex;

use crate::constants::{Alignment, PAGE};
use crate::expander::Expander;
use crate::header::Origin;
use crate::validate::{PointerClass, ValidationStatus};
use crate::{free, placement, realloc, validate};

/// The block manager's mutable state: where the region starts, how many
/// pages it currently owns, the head of the address-ordered block list,
/// and the collaborator it asks for more pages.
///
/// `head` doubles as the "is the heap empty" flag placement relies on:
/// once a first block exists it is never fully unlinked, only merged
/// into or split from, so `head` never reverts to `None` after the first
/// successful placement. A heap fully coalesced back down to one giant
/// free block is therefore still "non-empty" and takes the ordinary
/// reuse path, not the from-scratch placement path.
pub(crate) struct HeapState {
    pub base: usize,
    pub pages_owned: usize,
    pub head: Option<usize>,
    pub expander: &'static dyn Expander,
}

/// One allocator instance: a region of memory plus the bookkeeping
/// needed to hand it out safely. Every public method takes the lock
/// once; `realloc`'s relocation path nests calls into the placement and
/// free internals on the same borrow rather than re-locking, but the
/// lock is reentrant regardless, matching the contract a caller of
/// `realloc` is entitled to assume.
pub struct Heap {
    lock: ReentrantMutex<RefCell<HeapState>>,
}

impl Heap {
    pub const fn new(expander: &'static dyn Expander) -> Self {
        Heap {
            lock: ReentrantMutex::new(RefCell::new(HeapState {
                base: 0,
                pages_owned: 0,
                head: None,
                expander,
            })),
        }
    }

    /// Reserves the first page from the expander and records the base
    /// address. A heap that has already been set up (and not yet torn
    /// down) treats a second call as a successful no-op.
    pub fn setup(&self) -> Result<(), ()> {
        let guard = self.lock.lock();
        let mut state = guard.borrow_mut();
        if state.base != 0 {
            return Ok(());
        }
        match state.expander.expand(PAGE as isize) {
            Ok(base) => {
                state.base = base;
                state.pages_owned = 1;
                state.head = None;
                Ok(())
            }
            Err(_) => Err(()),
        }
    }

    /// Returns every page the heap owns to the expander and resets all
    /// state. A heap that was never set up treats this as a no-op.
    pub fn teardown(&self) {
        let guard = self.lock.lock();
        let mut state = guard.borrow_mut();
        if state.base == 0 {
            return;
        }
        let owned_bytes = state.pages_owned * PAGE;
        let _ = state.expander.expand(-(owned_bytes as isize));
        state.base = 0;
        state.pages_owned = 0;
        state.head = None;
    }

    pub fn validate(&self) -> ValidationStatus {
        let guard = self.lock.lock();
        let state = guard.borrow();
        validate::validate(&state)
    }

    pub fn classify(&self, p: Option<usize>) -> PointerClass {
        let guard = self.lock.lock();
        let state = guard.borrow();
        validate::classify(&state, p)
    }

    pub fn largest(&self) -> usize {
        let guard = self.lock.lock();
        let state = guard.borrow();
        validate::largest(&state)
    }

    pub fn alloc(&self, size: usize) -> Option<usize> {
        self.alloc_with(size, Alignment::Word, None)
    }

    pub fn alloc_debug(&self, size: usize, file: &'static str, line: u32) -> Option<usize> {
        self.alloc_with(size, Alignment::Word, Some(Origin { file, line }))
    }

    pub fn aligned_alloc(&self, size: usize) -> Option<usize> {
        self.alloc_with(size, Alignment::Page, None)
    }

    pub fn aligned_alloc_debug(&self, size: usize, file: &'static str, line: u32) -> Option<usize> {
        self.alloc_with(size, Alignment::Page, Some(Origin { file, line }))
    }

    #[ensures(ret.is_none() || self.validate() == ValidationStatus::Ok,
        "a successful allocation never leaves the heap's own bookkeeping corrupted")]
    fn alloc_with(&self, size: usize, alignment: Alignment, origin: Option<Origin>) -> Option<usize> {
        let guard = self.lock.lock();
        let mut state = guard.borrow_mut();
        placement::alloc_locked(&mut state, size, alignment, origin)
    }

    pub fn zalloc(&self, count: usize, size: usize) -> Option<usize> {
        self.zalloc_with(count, size, Alignment::Word, None)
    }

    pub fn zalloc_debug(
        &self,
        count: usize,
        size: usize,
        file: &'static str,
        line: u32,
    ) -> Option<usize> {
        self.zalloc_with(count, size, Alignment::Word, Some(Origin { file, line }))
    }

    pub fn aligned_zalloc(&self, count: usize, size: usize) -> Option<usize> {
        self.zalloc_with(count, size, Alignment::Page, None)
    }

    pub fn aligned_zalloc_debug(
        &self,
        count: usize,
        size: usize,
        file: &'static str,
        line: u32,
    ) -> Option<usize> {
        self.zalloc_with(count, size, Alignment::Page, Some(Origin { file, line }))
    }

    fn zalloc_with(
        &self,
        count: usize,
        size: usize,
        alignment: Alignment,
        origin: Option<Origin>,
    ) -> Option<usize> {
        let total = count.checked_mul(size)?;
        let guard = self.lock.lock();
        let mut state = guard.borrow_mut();
        let p = placement::alloc_locked(&mut state, total, alignment, origin)?;
        // Safety: `alloc_locked` only returns `Some` for a freshly
        // placed payload span of exactly `total` bytes.
        unsafe { std::ptr::write_bytes(p as *mut u8, 0, total) };
        Some(p)
    }

    #[ensures(self.validate() == ValidationStatus::Ok,
        "free never leaves the heap's own bookkeeping corrupted")]
    pub fn free(&self, p: Option<usize>) {
        let guard = self.lock.lock();
        let mut state = guard.borrow_mut();
        free::free_locked(&mut state, p);
    }

    pub fn realloc(&self, p: Option<usize>, size: usize) -> Option<usize> {
        self.realloc_with(p, size, Alignment::Word, None)
    }

    pub fn realloc_debug(
        &self,
        p: Option<usize>,
        size: usize,
        file: &'static str,
        line: u32,
    ) -> Option<usize> {
        self.realloc_with(p, size, Alignment::Word, Some(Origin { file, line }))
    }

    pub fn aligned_realloc(&self, p: Option<usize>, size: usize) -> Option<usize> {
        self.realloc_with(p, size, Alignment::Page, None)
    }

    pub fn aligned_realloc_debug(
        &self,
        p: Option<usize>,
        size: usize,
        file: &'static str,
        line: u32,
    ) -> Option<usize> {
        self.realloc_with(p, size, Alignment::Page, Some(Origin { file, line }))
    }

    #[ensures(self.validate() == ValidationStatus::Ok,
        "realloc never leaves the heap's own bookkeeping corrupted, even when it fails")]
    fn realloc_with(
        &self,
        p: Option<usize>,
        size: usize,
        alignment: Alignment,
        origin: Option<Origin>,
    ) -> Option<usize> {
        let guard = self.lock.lock();
        let mut state = guard.borrow_mut();
        realloc::realloc_locked(&mut state, p, size, alignment, origin)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::expander::StaticRegionExpander;

    fn fresh_heap() -> (Heap, Box<StaticRegionExpander>) {
        let expander = Box::new(StaticRegionExpander::new(64 * PAGE));
        let expander_ref: &'static StaticRegionExpander =
            unsafe { &*(expander.as_ref() as *const StaticRegionExpander) };
        (Heap::new(expander_ref), expander)
    }

    #[test]
    fn setup_is_idempotent() {
        let (heap, _expander) = fresh_heap();
        assert!(heap.setup().is_ok());
        assert!(heap.setup().is_ok());
        assert_eq!(heap.validate(), ValidationStatus::Ok);
    }

    #[test]
    fn teardown_before_setup_is_a_no_op() {
        let (heap, _expander) = fresh_heap();
        heap.teardown();
        assert_eq!(heap.validate(), ValidationStatus::Uninitialized);
    }

    #[test]
    fn alloc_before_setup_fails() {
        let (heap, _expander) = fresh_heap();
        assert_eq!(heap.alloc(16), None);
    }

    #[test]
    fn zero_size_alloc_fails() {
        let (heap, _expander) = fresh_heap();
        heap.setup().unwrap();
        assert_eq!(heap.alloc(0), None);
    }

    // Bulk allocate, then free and re-allocate in random-ish order,
    // checking validity and classification agreement after every single
    // operation rather than just at the end.
    mod prop {
        use proptest::collection::vec;
        use proptest::prelude::*;

        use super::*;

        proptest! {
            #[test]
            fn random_order_keeps_the_heap_valid_and_classification_consistent(
                ops in vec((0..20usize, 1..512usize), 1..200),
            ) {
                let (heap, _expander) = fresh_heap();
                heap.setup().unwrap();

                let mut slots: Vec<Option<usize>> = vec![None; 20];

                for (index, size) in ops {
                    match slots[index].take() {
                        Some(p) => {
                            heap.free(Some(p));
                            prop_assert_eq!(heap.classify(Some(p)), PointerClass::Unallocated);
                        }
                        None => {
                            if let Some(p) = heap.alloc_with(size, Alignment::Word, None) {
                                prop_assert_eq!(heap.classify(Some(p)), PointerClass::Valid);
                                prop_assert_eq!(p % crate::constants::WORD, 0);
                                slots[index] = Some(p);
                            }
                        }
                    }
                    prop_assert_eq!(heap.validate(), ValidationStatus::Ok);
                }

                for p in slots.into_iter().flatten() {
                    heap.free(Some(p));
                }
                prop_assert_eq!(heap.validate(), ValidationStatus::Ok);
                prop_assert_eq!(heap.largest(), 0);
            }
        }
    }
}
