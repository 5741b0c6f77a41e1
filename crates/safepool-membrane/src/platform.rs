//! Thin wrappers over the OS virtual-memory calls the engine needs.
//!
//! Slab pages are mapped `MAP_SHARED` so that Linux `mremap` with a zero old
//! size can create a second virtual alias of the same physical page. That
//! alias is the shadow address handed to the program.

#![allow(unsafe_code)]

use std::io;
use std::ptr;
use std::sync::OnceLock;

use crate::error::RuntimeError;

/// OS page size, queried once.
#[must_use]
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        // SAFETY: sysconf has no preconditions.
        let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if raw > 0 { raw as usize } else { 4096 }
    })
}

/// Round `len` up to a whole number of pages.
#[must_use]
pub fn page_round_up(len: usize) -> usize {
    let page = page_size();
    len.div_ceil(page).max(1) * page
}

/// Page containing `addr`.
#[must_use]
pub fn page_floor(addr: usize) -> usize {
    addr & !(page_size() - 1)
}

fn mmap_raw(len: usize, prot: libc::c_int, flags: libc::c_int) -> Result<usize, RuntimeError> {
    // SAFETY: anonymous mapping with a null hint never aliases existing memory.
    let result = unsafe { libc::mmap(ptr::null_mut(), len, prot, flags, -1, 0) };
    if result == libc::MAP_FAILED {
        Err(RuntimeError::last_os_map(len))
    } else {
        Ok(result as usize)
    }
}

/// Map `len` bytes of shared anonymous read-write memory.
pub fn map_shared(len: usize) -> Result<usize, RuntimeError> {
    mmap_raw(
        len,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_SHARED | libc::MAP_ANONYMOUS,
    )
}

/// Reserve `len` bytes of address space that is never accessible.
pub fn map_reserved(len: usize) -> Result<usize, RuntimeError> {
    mmap_raw(
        len,
        libc::PROT_NONE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
    )
}

/// Map `len` bytes of zeroed read-write memory that is only committed on
/// first touch.
pub fn map_noreserve(len: usize) -> Result<usize, RuntimeError> {
    mmap_raw(
        len,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
    )
}

/// Unmap a region previously returned by one of the `map_*` functions.
///
/// # Safety
/// `addr..addr+len` must be a mapping owned by the caller with no live
/// references into it.
pub unsafe fn unmap(addr: usize, len: usize) {
    // SAFETY: guaranteed by the caller.
    let rc = unsafe { libc::munmap(addr as *mut libc::c_void, len) };
    debug_assert_eq!(rc, 0, "munmap failed");
}

fn protect(addr: usize, len: usize, prot: libc::c_int) -> Result<(), RuntimeError> {
    // SAFETY: mprotect only changes permissions; an invalid range is reported
    // through the return value.
    let rc = unsafe { libc::mprotect(addr as *mut libc::c_void, len, prot) };
    if rc == 0 {
        Ok(())
    } else {
        Err(RuntimeError::Protect {
            addr,
            len,
            source: io::Error::last_os_error(),
        })
    }
}

/// Make a page range inaccessible.
pub fn protect_none(addr: usize, len: usize) -> Result<(), RuntimeError> {
    protect(addr, len, libc::PROT_NONE)
}

/// Make a page range readable and writable.
pub fn protect_read_write(addr: usize, len: usize) -> Result<(), RuntimeError> {
    protect(addr, len, libc::PROT_READ | libc::PROT_WRITE)
}

/// Create a second virtual mapping of the shared pages at `addr..addr+len`.
#[cfg(target_os = "linux")]
pub fn alias_pages(addr: usize, len: usize) -> Result<usize, RuntimeError> {
    // SAFETY: an old size of zero with MREMAP_MAYMOVE duplicates a shared
    // mapping without touching the original.
    let result = unsafe {
        libc::mremap(
            addr as *mut libc::c_void,
            0,
            len,
            libc::MREMAP_MAYMOVE,
        )
    };
    if result == libc::MAP_FAILED {
        Err(RuntimeError::Remap {
            addr,
            len,
            source: io::Error::last_os_error(),
        })
    } else {
        Ok(result as usize)
    }
}

#[cfg(not(target_os = "linux"))]
pub fn alias_pages(addr: usize, len: usize) -> Result<usize, RuntimeError> {
    Err(RuntimeError::Remap {
        addr,
        len,
        source: io::Error::from(io::ErrorKind::Unsupported),
    })
}

/// Async-signal-safe write of `bytes` to stderr.
pub fn write_stderr(bytes: &[u8]) {
    let mut rest = bytes;
    while !rest.is_empty() {
        // SAFETY: the buffer is valid for `rest.len()` bytes.
        let n = unsafe { libc::write(2, rest.as_ptr().cast(), rest.len()) };
        if n <= 0 {
            return;
        }
        rest = &rest[n as usize..];
    }
}
