//! Shared helpers for the entry points.

use std::ffi::{CStr, c_char, c_int, c_uchar, c_uint};

use safepool_membrane::{Completeness, SourceSite};

/// Call site named by a `_debug` entry point. A null file name gives a site
/// with only the line.
///
/// # Safety
///
/// `file` must be null or point to a NUL-terminated string.
pub(crate) unsafe fn debug_site(file: *const c_char, line: c_uint) -> SourceSite {
    if file.is_null() {
        return SourceSite::new(0, None, line);
    }
    // SAFETY: non-null and NUL-terminated per the caller contract.
    let name = unsafe { CStr::from_ptr(file) }.to_string_lossy();
    SourceSite::new(0, Some(&name), line)
}

/// The `complete` flag of a checked library call.
pub(crate) fn completeness(complete: c_uchar) -> Completeness {
    if complete == 0 {
        Completeness::Incomplete
    } else {
        Completeness::Complete
    }
}

/// Store `code` in the calling thread's `errno`.
pub(crate) fn set_errno(code: c_int) {
    #[cfg(target_os = "linux")]
    // SAFETY: `__errno_location` returns the calling thread's errno slot.
    unsafe {
        *libc::__errno_location() = code;
    }
    #[cfg(not(target_os = "linux"))]
    let _ = code;
}
