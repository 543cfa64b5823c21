//! A fence- and checksum-guarded user-space allocator.
//!
//! One contiguous byte region, grown one page at a time from a region
//! expander, managed by an in-band doubly-linked header list with
//! guard-byte and checksum corruption detection, first-fit placement,
//! and release-time coalescing.
//!
//! Most callers want the free functions below, which operate on one
//! process-wide default `Heap`. Embedders that want more than one
//! independent region, or a custom `Expander`, should build a `Heap`
//! directly.
mod block_list;
mod constants;
mod expander;
mod free;
mod header;
mod heap;
mod placement;
mod realloc;
mod validate;

use std::os::raw::c_char;

use lazy_static::lazy_static;

pub use constants::Alignment;
pub use expander::{ExpandError, Expander, StaticRegionExpander};
pub use header::Origin;
pub use heap::Heap;
pub use validate::{PointerClass, ValidationStatus};

/// Capacity reserved by the process-wide default heap's region
/// expander. An embedder who needs more builds their own `Heap` with a
/// bigger (or custom) `Expander` instead of using the free functions.
const DEFAULT_HEAP_CAPACITY: usize = 256 * 1024 * 1024;

lazy_static! {
    static ref DEFAULT_EXPANDER: &'static StaticRegionExpander =
        Box::leak(Box::new(StaticRegionExpander::new(DEFAULT_HEAP_CAPACITY)));
    static ref DEFAULT_HEAP: Heap = Heap::new(*DEFAULT_EXPANDER);
}

/// Reserves the default heap's first page. Idempotent: a heap that is
/// already set up returns `Ok(())`.
pub fn setup() -> Result<(), ()> {
    DEFAULT_HEAP.setup()
}

/// Returns every page the default heap owns to its expander.
pub fn teardown() {
    DEFAULT_HEAP.teardown()
}

/// Checks every block's checksum and guard bytes, in address order.
pub fn validate() -> ValidationStatus {
    DEFAULT_HEAP.validate()
}

/// Classifies an address relative to the default heap's block list.
pub fn classify(p: Option<usize>) -> PointerClass {
    DEFAULT_HEAP.classify(p)
}

/// Largest payload size among currently live blocks, or 0.
pub fn largest() -> usize {
    DEFAULT_HEAP.largest()
}

/// Allocates `size` bytes with ordinary (word) alignment.
pub fn alloc(size: usize) -> Option<usize> {
    DEFAULT_HEAP.alloc(size)
}

/// As `alloc`, recording `file`/`line` as the allocation's origin.
pub fn alloc_debug(size: usize, file: &'static str, line: u32) -> Option<usize> {
    DEFAULT_HEAP.alloc_debug(size, file, line)
}

/// Allocates `size` bytes with page alignment.
pub fn aligned_alloc(size: usize) -> Option<usize> {
    DEFAULT_HEAP.aligned_alloc(size)
}

/// As `aligned_alloc`, recording `file`/`line` as the allocation's origin.
pub fn aligned_alloc_debug(size: usize, file: &'static str, line: u32) -> Option<usize> {
    DEFAULT_HEAP.aligned_alloc_debug(size, file, line)
}

/// Allocates space for `count` elements of `size` bytes each, zeroed.
pub fn zalloc(count: usize, size: usize) -> Option<usize> {
    DEFAULT_HEAP.zalloc(count, size)
}

/// As `zalloc`, recording `file`/`line` as the allocation's origin.
pub fn zalloc_debug(count: usize, size: usize, file: &'static str, line: u32) -> Option<usize> {
    DEFAULT_HEAP.zalloc_debug(count, size, file, line)
}

/// As `zalloc`, with page-aligned payloads.
pub fn aligned_zalloc(count: usize, size: usize) -> Option<usize> {
    DEFAULT_HEAP.aligned_zalloc(count, size)
}

/// As `aligned_zalloc`, recording `file`/`line` as the allocation's origin.
pub fn aligned_zalloc_debug(
    count: usize,
    size: usize,
    file: &'static str,
    line: u32,
) -> Option<usize> {
    DEFAULT_HEAP.aligned_zalloc_debug(count, size, file, line)
}

/// Releases `p`. A `None`, already-freed, or otherwise invalid pointer
/// is a silent no-op.
pub fn free(p: Option<usize>) {
    DEFAULT_HEAP.free(p)
}

/// Resizes the allocation at `p` to `size` bytes, preserving contents
/// up to the smaller of the old and new sizes. `p = None` behaves like
/// `alloc`; `size = 0` behaves like `free` and returns `None`.
pub fn realloc(p: Option<usize>, size: usize) -> Option<usize> {
    DEFAULT_HEAP.realloc(p, size)
}

/// As `realloc`, recording `file`/`line` as the new allocation's origin
/// if a relocation happens.
pub fn realloc_debug(
    p: Option<usize>,
    size: usize,
    file: &'static str,
    line: u32,
) -> Option<usize> {
    DEFAULT_HEAP.realloc_debug(p, size, file, line)
}

/// As `realloc`, with a page-aligned result.
pub fn aligned_realloc(p: Option<usize>, size: usize) -> Option<usize> {
    DEFAULT_HEAP.aligned_realloc(p, size)
}

/// As `aligned_realloc`, recording `file`/`line` as the new allocation's
/// origin if a relocation happens.
pub fn aligned_realloc_debug(
    p: Option<usize>,
    size: usize,
    file: &'static str,
    line: u32,
) -> Option<usize> {
    DEFAULT_HEAP.aligned_realloc_debug(p, size, file, line)
}

fn ptr_to_addr(p: *mut c_char) -> Option<usize> {
    if p.is_null() {
        None
    } else {
        Some(p as usize)
    }
}

fn addr_to_ptr(a: Option<usize>) -> *mut c_char {
    match a {
        Some(a) => a as *mut c_char,
        None => std::ptr::null_mut(),
    }
}

/// Reserves the default heap's first page. Returns 0 on success, -1 on
/// failure (the expander has no page to give).
#[no_mangle]
pub extern "C" fn fencepost_setup() -> i32 {
    match setup() {
        Ok(()) => 0,
        Err(()) => -1,
    }
}

/// Returns every page the default heap owns to its expander.
#[no_mangle]
pub extern "C" fn fencepost_teardown() {
    teardown();
}

/// See `ValidationStatus` for the meaning of the returned code.
#[no_mangle]
pub extern "C" fn fencepost_validate() -> i32 {
    validate().as_code()
}

/// See `PointerClass` for the meaning of the returned code.
///
/// # Safety
///
/// `p` must be NULL or an address previously returned by one of the
/// `fencepost_*` allocation functions.
#[no_mangle]
pub unsafe extern "C" fn fencepost_classify(p: *mut c_char) -> i32 {
    classify(ptr_to_addr(p)).as_code()
}

/// Largest payload size among currently live blocks, or 0.
#[no_mangle]
pub extern "C" fn fencepost_largest() -> usize {
    largest()
}

#[no_mangle]
pub extern "C" fn fencepost_alloc(size: usize) -> *mut c_char {
    addr_to_ptr(alloc(size))
}

#[no_mangle]
pub extern "C" fn fencepost_aligned_alloc(size: usize) -> *mut c_char {
    addr_to_ptr(aligned_alloc(size))
}

#[no_mangle]
pub extern "C" fn fencepost_zalloc(count: usize, size: usize) -> *mut c_char {
    addr_to_ptr(zalloc(count, size))
}

#[no_mangle]
pub extern "C" fn fencepost_aligned_zalloc(count: usize, size: usize) -> *mut c_char {
    addr_to_ptr(aligned_zalloc(count, size))
}

/// # Safety
///
/// `p` must be NULL or a currently-live address returned by one of the
/// `fencepost_*` allocation functions.
#[no_mangle]
pub unsafe extern "C" fn fencepost_realloc(p: *mut c_char, size: usize) -> *mut c_char {
    addr_to_ptr(realloc(ptr_to_addr(p), size))
}

/// # Safety
///
/// `p` must be NULL or a currently-live address returned by one of the
/// `fencepost_*` allocation functions.
#[no_mangle]
pub unsafe extern "C" fn fencepost_aligned_realloc(p: *mut c_char, size: usize) -> *mut c_char {
    addr_to_ptr(aligned_realloc(ptr_to_addr(p), size))
}

/// # Safety
///
/// `p` must be NULL or a currently-live address returned by one of the
/// `fencepost_*` allocation functions, not already freed.
#[no_mangle]
pub unsafe extern "C" fn fencepost_free(p: *mut c_char) {
    free(ptr_to_addr(p));
}
