use std::io::{self, Error};
use std::mem;
use std::ptr::{self, NonNull};

use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, VirtualProtect, MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE,
    PAGE_NOACCESS, PAGE_PROTECTION_FLAGS, PAGE_READWRITE,
};
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

/// Returns the system allocation granularity (typically 64KB).
///
/// `VirtualAlloc` bases are aligned to this value, which is usually
/// larger than the page size.
pub fn allocation_granularity() -> usize {
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        let gran = info.dwAllocationGranularity as usize;
        if gran == 0 {
            65536
        } else {
            gran
        }
    }
}

pub fn page_size() -> usize {
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        let size = info.dwPageSize as usize;
        if size == 0 {
            4096
        } else {
            size
        }
    }
}

pub unsafe fn map_aligned(len: usize, align: usize) -> io::Result<NonNull<u8>> {
    if align <= allocation_granularity() {
        let ptr =
            unsafe { VirtualAlloc(ptr::null(), len, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE) };
        return NonNull::new(ptr.cast::<u8>()).ok_or_else(Error::last_os_error);
    }

    // Over-aligned: reserve a padded range to learn an aligned address,
    // release it, then claim that exact address. Another thread can steal
    // the address in between, so retry a few times.
    let padded = len
        .checked_add(align)
        .ok_or_else(|| Error::from(io::ErrorKind::InvalidInput))?;
    for _ in 0..8 {
        let probe = unsafe { VirtualAlloc(ptr::null(), padded, MEM_RESERVE, PAGE_READWRITE) };
        if probe.is_null() {
            return Err(Error::last_os_error());
        }
        let aligned = (probe as usize + align - 1) & !(align - 1);
        unsafe {
            VirtualFree(probe, 0, MEM_RELEASE);
        }
        let ptr = unsafe {
            VirtualAlloc(
                aligned as *const std::ffi::c_void,
                len,
                MEM_COMMIT | MEM_RESERVE,
                PAGE_READWRITE,
            )
        };
        if let Some(ptr) = NonNull::new(ptr.cast::<u8>()) {
            return Ok(ptr);
        }
    }
    Err(Error::last_os_error())
}

pub unsafe fn unmap(ptr: *mut u8, _len: usize) -> io::Result<()> {
    // MEM_RELEASE requires dwSize to be 0.
    if unsafe { VirtualFree(ptr.cast::<std::ffi::c_void>(), 0, MEM_RELEASE) } == 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

pub unsafe fn decommit(ptr: *mut u8, len: usize) -> io::Result<()> {
    if unsafe { VirtualFree(ptr.cast::<std::ffi::c_void>(), len, MEM_DECOMMIT) } == 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

pub unsafe fn commit(ptr: *mut u8, len: usize) -> io::Result<()> {
    let out = unsafe {
        VirtualAlloc(
            ptr.cast::<std::ffi::c_void>(),
            len,
            MEM_COMMIT,
            PAGE_READWRITE,
        )
    };
    if out.is_null() {
        return Err(Error::last_os_error());
    }
    Ok(())
}

pub unsafe fn protect(ptr: *mut u8, len: usize, read_write: bool) -> io::Result<()> {
    let new: PAGE_PROTECTION_FLAGS = if read_write {
        PAGE_READWRITE
    } else {
        PAGE_NOACCESS
    };
    let mut old: PAGE_PROTECTION_FLAGS = 0;
    if unsafe { VirtualProtect(ptr.cast::<std::ffi::c_void>(), len, new, &mut old) } == 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}
