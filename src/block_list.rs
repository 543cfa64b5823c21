//! Centralized primitives for mutating the address-ordered block list.
//!
//! Every place that creates a block, re-links a neighbor, or changes a
//! block's size or free flag goes through one of these, so guard
//! stamping and checksum refresh can never be forgotten at a call site.
use crate::header::{self, Origin, RawHeader};

#[inline]
pub(crate) fn read(addr: usize) -> RawHeader {
    unsafe { header::read_header(addr) }
}

/// Writes `h` back to `addr` after refreshing its checksum.
pub(crate) fn store(addr: usize, h: &mut RawHeader) {
    h.refresh_checksum();
    unsafe { header::write_header(addr, *h) };
}

/// Builds and stores a brand-new block header at `addr`: stamps guards,
/// sets links, computes the checksum.
#[allow(clippy::too_many_arguments)]
pub(crate) fn create(
    addr: usize,
    size: usize,
    free: bool,
    origin: Option<Origin>,
    prev: Option<usize>,
    next: Option<usize>,
) {
    let mut h = RawHeader::new(size, free, origin);
    h.set_prev(prev);
    h.set_next(next);
    unsafe { header::stamp_guards(addr, size) };
    store(addr, &mut h);
}

/// If `neighbor` is present, repoints any of its links that pointed at
/// `old` to `new`, and re-checksums it. No-op if `neighbor` is `None`.
pub(crate) fn relink(neighbor: Option<usize>, old: usize, new: Option<usize>) {
    if let Some(addr) = neighbor {
        let mut h = read(addr);
        if h.prev_addr() == Some(old) {
            h.set_prev(new);
        }
        if h.next_addr() == Some(old) {
            h.set_next(new);
        }
        store(addr, &mut h);
    }
}

/// Resizes the block at `addr` in place: re-stamps guards at the new
/// size and re-checksums. Links are left untouched.
pub(crate) fn resize(addr: usize, new_size: usize) {
    let mut h = read(addr);
    h.size = new_size;
    unsafe { header::stamp_guards(addr, new_size) };
    store(addr, &mut h);
}

/// Flips the free flag of the block at `addr` in place and re-checksums.
pub(crate) fn set_free(addr: usize, free: bool) {
    let mut h = read(addr);
    h.set_free(free);
    store(addr, &mut h);
}

/// Merges `p2` into `p1`: `p1` absorbs `p2`'s header bytes and payload
/// into its own payload count, and inherits `p2`'s `next` link. Does
/// *not* re-stamp or re-checksum `p1` — the `free` module re-stamps
/// once after both possible merges, per spec.
pub(crate) fn merge_into(p1: usize, p2: usize) {
    let h2 = read(p2);
    let mut h1 = read(p1);

    h1.set_next(h2.next_addr());
    h1.size = h1.size + h2.size + header::HEADER_SIZE;
    // Deliberately not `store`: the checksum is left stale here. The
    // `free` module re-stamps guards and refreshes checksums once,
    // after both possible merges around a released block, not twice.
    unsafe { header::write_header(p1, h1) };

    relink(h2.next_addr(), p2, Some(p1));
}
