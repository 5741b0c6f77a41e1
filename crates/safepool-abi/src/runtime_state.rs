//! The process-wide runtime behind the C entry points.
//!
//! Instrumented code carries no context pointer, so every entry point reaches
//! one lazily built [`Runtime`]. Uses manual atomic init instead of OnceLock:
//! the runtime's own setup may fault into the trap handler or reenter through
//! an instrumented allocator, and a reentrant caller must get `None` instead
//! of blocking on itself.

use std::sync::atomic::{AtomicPtr, AtomicU8, Ordering};

use safepool_membrane::platform;
use safepool_membrane::{Runtime, RuntimeConfig};

const STATE_UNINIT: u8 = 0;
const STATE_INITIALIZING: u8 = 1;
const STATE_READY: u8 = 2;
const STATE_FAILED: u8 = 3;

static RUNTIME_STATE: AtomicU8 = AtomicU8::new(STATE_UNINIT);
static RUNTIME_PTR: AtomicPtr<Runtime> = AtomicPtr::new(std::ptr::null_mut());

fn ready() -> Option<&'static Runtime> {
    let ptr = RUNTIME_PTR.load(Ordering::Acquire);
    // SAFETY: the pointer is published once, after the box is fully built,
    // and never freed.
    (!ptr.is_null()).then(|| unsafe { &*ptr })
}

/// The global runtime, built from the environment on first use.
///
/// Returns `None` while initialization is in progress on another path and
/// after a failed initialization; entry points then fall back to unchecked
/// behavior.
pub fn global_runtime() -> Option<&'static Runtime> {
    match RUNTIME_STATE.load(Ordering::Acquire) {
        STATE_READY => return ready(),
        STATE_INITIALIZING | STATE_FAILED => return None,
        _ => {}
    }

    if RUNTIME_STATE
        .compare_exchange(
            STATE_UNINIT,
            STATE_INITIALIZING,
            Ordering::SeqCst,
            Ordering::Relaxed,
        )
        .is_err()
    {
        return if RUNTIME_STATE.load(Ordering::Acquire) == STATE_READY {
            ready()
        } else {
            None
        };
    }

    let built = RuntimeConfig::from_env().and_then(Runtime::init);
    match built {
        Ok(runtime) => {
            let ptr = Box::into_raw(Box::new(runtime));
            RUNTIME_PTR.store(ptr, Ordering::Release);
            RUNTIME_STATE.store(STATE_READY, Ordering::Release);
            ready()
        }
        Err(err) => {
            let line = format!("safepool: runtime initialization failed: {err}\n");
            platform::write_stderr(line.as_bytes());
            RUNTIME_STATE.store(STATE_FAILED, Ordering::Release);
            None
        }
    }
}

/// Run `f` on the global runtime, or return `fallback` without one.
pub(crate) fn with_runtime<T>(fallback: T, f: impl FnOnce(&'static Runtime) -> T) -> T {
    global_runtime().map_or(fallback, f)
}

/// Whether [`global_runtime`] has completed successfully.
#[must_use]
pub fn is_ready() -> bool {
    RUNTIME_STATE.load(Ordering::Acquire) == STATE_READY
}
