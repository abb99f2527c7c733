//! Bounded memory fill/copy/move primitives.
//!
//! These follow the C11 Annex K contract with one twist: any validation
//! failure first zero-fills the destination (when it can be addressed at
//! all) and then halts. A bad length must never leave partially copied
//! partition data behind in a buffer another partition can see.

use core::ptr;

/// Largest size accepted for any destination or count.
pub const RSIZE_MAX: usize = usize::MAX >> 1;

/// Zero `dest` if it can be addressed, then halt.
///
/// # Safety
/// `dest` must be null or valid for `destsz` writes whenever
/// `destsz <= RSIZE_MAX`.
unsafe fn zero_fill_and_halt(dest: *mut u8, destsz: usize, what: &str) -> ! {
    if !dest.is_null() && destsz <= RSIZE_MAX {
        ptr::write_bytes(dest, 0, destsz);
    }
    log::error!("{}: bounds check failed, destination erased", what);
    panic!("{}: bounds check failed", what);
}

/// Fill `count` bytes of `dest` (capacity `destsz`) with `ch`.
///
/// # Safety
/// `dest` must be valid for `destsz` writes.
pub unsafe fn memset_s(dest: *mut u8, destsz: usize, ch: u8, count: usize) {
    if dest.is_null() || destsz > RSIZE_MAX || count > destsz {
        zero_fill_and_halt(dest, destsz, "memset_s");
    }
    ptr::write_bytes(dest, ch, count);
}

/// Copy `count` non-overlapping bytes from `src` into `dest`.
///
/// # Safety
/// `dest` must be valid for `destsz` writes and `src` for `count` reads.
pub unsafe fn memcpy_s(dest: *mut u8, destsz: usize, src: *const u8, count: usize) {
    let d = dest as usize;
    let s = src as usize;
    let overlap = d == s || (d < s && d.saturating_add(count) > s) || (s < d && s.saturating_add(count) > d);
    if dest.is_null() || src.is_null() || destsz > RSIZE_MAX || count > destsz || overlap {
        zero_fill_and_halt(dest, destsz, "memcpy_s");
    }
    ptr::copy_nonoverlapping(src, dest, count);
}

/// Copy `count` possibly overlapping bytes from `src` into `dest`.
///
/// # Safety
/// `dest` must be valid for `destsz` writes and `src` for `count` reads.
pub unsafe fn memmove_s(dest: *mut u8, destsz: usize, src: *const u8, count: usize) {
    if dest.is_null() || src.is_null() || destsz > RSIZE_MAX || count > destsz {
        zero_fill_and_halt(dest, destsz, "memmove_s");
    }
    ptr::copy(src, dest, count);
}

/// Length of the NUL-terminated string in `s`, scanning at most `max` bytes.
/// A missing string has length 0.
pub fn strnlen_s(s: Option<&[u8]>, max: usize) -> usize {
    match s {
        None => 0,
        Some(s) => {
            let limit = max.min(s.len());
            s[..limit].iter().position(|&b| b == 0).unwrap_or(limit)
        }
    }
}

/// Fill the first `count` bytes of `dest`.
pub fn fill_bounded(dest: &mut [u8], ch: u8, count: usize) {
    unsafe { memset_s(dest.as_mut_ptr(), dest.len(), ch, count) }
}

/// Copy all of `src` to the start of `dest`.
pub fn copy_bounded(dest: &mut [u8], src: &[u8]) {
    unsafe { memcpy_s(dest.as_mut_ptr(), dest.len(), src.as_ptr(), src.len()) }
}

/// Move `count` bytes inside `buf` from offset `from` to offset `to`.
/// A move that does not fit at either end erases all of `buf`.
pub fn move_within(buf: &mut [u8], to: usize, from: usize, count: usize) {
    let len = buf.len();
    let base = buf.as_mut_ptr();
    if to > len || from > len || count > len - from || count > len - to {
        unsafe { zero_fill_and_halt(base, len, "move_within") };
    }
    unsafe { memmove_s(base.add(to), len - to, base.add(from), count) }
}
