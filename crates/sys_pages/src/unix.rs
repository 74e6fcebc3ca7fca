use std::io::{self, Error};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Returns the system page size, cached atomically.
pub fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            #[allow(clippy::cast_sign_loss)]
            let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
            PAGE_SIZE.store(page_size, Ordering::Relaxed);
            page_size
        }
        page_size => page_size,
    }
}

fn mmap_anon(len: usize) -> io::Result<*mut u8> {
    let flags = libc::MAP_PRIVATE | libc::MAP_ANON;
    let prot = libc::PROT_READ | libc::PROT_WRITE;

    let ptr = unsafe { libc::mmap(ptr::null_mut(), len, prot, flags, -1, 0) };
    if ptr == libc::MAP_FAILED {
        return Err(Error::last_os_error());
    }
    Ok(ptr.cast::<u8>())
}

/// Maps `len` bytes aligned to `align` by over-mapping and trimming the
/// misaligned head and tail.
pub unsafe fn map_aligned(len: usize, align: usize) -> io::Result<NonNull<u8>> {
    if align <= page_size() {
        let ptr = mmap_anon(len)?;
        // mmap never returns a misaligned page, and null was rejected above.
        return Ok(unsafe { NonNull::new_unchecked(ptr) });
    }

    let padded = len
        .checked_add(align)
        .ok_or_else(|| Error::from(io::ErrorKind::InvalidInput))?;
    let raw = mmap_anon(padded)?;
    let addr = raw as usize;
    let aligned = (addr + align - 1) & !(align - 1);

    let head = aligned - addr;
    if head > 0 {
        unsafe {
            libc::munmap(raw.cast::<libc::c_void>(), head);
        }
    }
    let tail = padded - head - len;
    if tail > 0 {
        unsafe {
            libc::munmap((aligned + len) as *mut libc::c_void, tail);
        }
    }

    Ok(unsafe { NonNull::new_unchecked(aligned as *mut u8) })
}

pub unsafe fn unmap(ptr: *mut u8, len: usize) -> io::Result<()> {
    if unsafe { libc::munmap(ptr.cast::<libc::c_void>(), len) } != 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

/// Returns the backing pages to the OS. The range stays reserved and
/// reads as zero after the next touch.
pub unsafe fn decommit(ptr: *mut u8, len: usize) -> io::Result<()> {
    if unsafe { libc::madvise(ptr.cast::<libc::c_void>(), len, libc::MADV_DONTNEED) } != 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

/// Re-commits a decommitted range. `madvise(MADV_DONTNEED)` keeps the
/// mapping intact, so this is a no-op on Unix.
pub unsafe fn commit(_ptr: *mut u8, _len: usize) -> io::Result<()> {
    Ok(())
}

pub unsafe fn protect(ptr: *mut u8, len: usize, read_write: bool) -> io::Result<()> {
    let prot = if read_write {
        libc::PROT_READ | libc::PROT_WRITE
    } else {
        libc::PROT_NONE
    };
    if unsafe { libc::mprotect(ptr.cast::<libc::c_void>(), len, prot) } != 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}
