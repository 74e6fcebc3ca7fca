//! Low-level page mapping primitives.
//!
//! This crate is the boundary between the allocation engine and the
//! operating system: it can reserve runs of anonymous pages, return them,
//! decommit page ranges back to the OS while keeping the address range
//! reserved, and change page protection for guard pages.
//!
//! All lengths must be multiples of [`page_size()`]. All mappings are
//! readable and writable unless protection is changed afterwards.

use std::io;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

/// Total bytes currently reserved from the operating system by this crate.
static RESERVED: AtomicUsize = AtomicUsize::new(0);

/// Returns the system allocation granularity.
///
/// On Windows, this is typically 64KB. On Unix, this is the system page
/// size. Mapped regions are always aligned to at least this granularity.
#[must_use]
pub fn allocation_granularity() -> usize {
    #[cfg(windows)]
    {
        os::allocation_granularity()
    }
    #[cfg(unix)]
    {
        os::page_size()
    }
}

/// Total bytes currently reserved from the operating system.
///
/// Decommitted ranges still count as reserved: the address space is held
/// even though the backing pages have been returned.
#[must_use]
pub fn reserved_bytes() -> usize {
    RESERVED.load(Ordering::Relaxed)
}

/// Maps `len` bytes of anonymous read-write memory aligned to `align`.
///
/// # Errors
///
/// Returns the underlying OS error when the mapping cannot be satisfied,
/// or `InvalidInput` when `len` is zero or `align` is not a power of two.
///
/// # Safety
///
/// The returned range is owned by the caller, who must eventually pass it
/// to [`unmap`] with the same base and length.
pub unsafe fn map_aligned(len: usize, align: usize) -> io::Result<NonNull<u8>> {
    if len == 0 || !align.is_power_of_two() {
        return Err(io::Error::from(io::ErrorKind::InvalidInput));
    }
    let ptr = unsafe { os::map_aligned(len, align.max(allocation_granularity()))? };
    RESERVED.fetch_add(len, Ordering::Relaxed);
    Ok(ptr)
}

/// Returns a mapping to the operating system.
///
/// # Errors
///
/// Returns the underlying OS error when the range cannot be unmapped.
///
/// # Safety
///
/// `ptr` and `len` must describe a full range previously returned by
/// [`map_aligned`]; no pointers into the range may be used afterwards.
pub unsafe fn unmap(ptr: NonNull<u8>, len: usize) -> io::Result<()> {
    unsafe { os::unmap(ptr.as_ptr(), len)? };
    RESERVED.fetch_sub(len, Ordering::Relaxed);
    Ok(())
}

/// Returns the backing pages of a range to the OS while keeping the
/// address range reserved. Touching the range afterwards is only defined
/// after a matching [`commit`].
///
/// # Errors
///
/// Returns the underlying OS error on failure.
///
/// # Safety
///
/// The range must lie within a single mapping obtained from
/// [`map_aligned`] and must be page-aligned.
pub unsafe fn decommit(ptr: NonNull<u8>, len: usize) -> io::Result<()> {
    unsafe { os::decommit(ptr.as_ptr(), len) }
}

/// Re-commits a previously decommitted range. The range reads as zero
/// afterwards.
///
/// # Errors
///
/// Returns the underlying OS error on failure.
///
/// # Safety
///
/// The range must have been passed to [`decommit`] earlier and must be
/// page-aligned.
pub unsafe fn commit(ptr: NonNull<u8>, len: usize) -> io::Result<()> {
    unsafe { os::commit(ptr.as_ptr(), len) }
}

/// Makes a page range inaccessible. Any access faults deterministically.
///
/// # Errors
///
/// Returns the underlying OS error on failure.
///
/// # Safety
///
/// The range must lie within a mapping obtained from [`map_aligned`] and
/// must be page-aligned.
pub unsafe fn protect_none(ptr: NonNull<u8>, len: usize) -> io::Result<()> {
    unsafe { os::protect(ptr.as_ptr(), len, false) }
}

/// Restores read-write access to a range made inaccessible by
/// [`protect_none`].
///
/// # Errors
///
/// Returns the underlying OS error on failure.
///
/// # Safety
///
/// Same contract as [`protect_none`].
pub unsafe fn protect_read_write(ptr: NonNull<u8>, len: usize) -> io::Result<()> {
    unsafe { os::protect(ptr.as_ptr(), len, true) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;

    #[test]
    fn test_page_size() {
        let ps = page_size();
        assert!(ps > 0);
        assert_eq!(ps & (ps - 1), 0, "page size should be a power of two");
    }

    #[test]
    fn test_allocation_granularity() {
        let ag = allocation_granularity();
        assert!(ag >= page_size());
        assert_eq!(ag & (ag - 1), 0);
    }

    #[test]
    fn test_map_unmap_roundtrip() {
        let len = page_size() * 4;
        let before = reserved_bytes();
        let ptr = unsafe { map_aligned(len, page_size()).expect("map failed") };
        assert_eq!(ptr.as_ptr() as usize % page_size(), 0);
        assert_eq!(reserved_bytes(), before + len);

        unsafe {
            ptr::write_volatile(ptr.as_ptr(), 42);
            assert_eq!(ptr::read_volatile(ptr.as_ptr()), 42);
            unmap(ptr, len).expect("unmap failed");
        }
        assert_eq!(reserved_bytes(), before);
    }

    #[test]
    fn test_map_with_large_alignment() {
        let align = 1 << 18;
        let len = page_size() * 2;
        let ptr = unsafe { map_aligned(len, align).expect("aligned map failed") };
        assert_eq!(ptr.as_ptr() as usize % align, 0);
        unsafe {
            ptr::write_volatile(ptr.as_ptr().add(len - 1), 7);
            unmap(ptr, len).expect("unmap failed");
        }
    }

    #[test]
    fn test_decommit_commit_roundtrip() {
        let len = page_size() * 2;
        let ptr = unsafe { map_aligned(len, page_size()).expect("map failed") };
        unsafe {
            ptr::write_volatile(ptr.as_ptr(), 9);
            decommit(ptr, len).expect("decommit failed");
            commit(ptr, len).expect("commit failed");
            // A recommitted range must be usable again and read as zero.
            assert_eq!(ptr::read_volatile(ptr.as_ptr()), 0);
            unmap(ptr, len).expect("unmap failed");
        }
    }

    #[test]
    fn test_zero_length_is_rejected() {
        assert!(unsafe { map_aligned(0, page_size()) }.is_err());
    }
}
