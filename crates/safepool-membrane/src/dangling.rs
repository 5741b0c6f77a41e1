//! Page-remap dangling-pointer detector.
//!
//! Every pool allocation is handed out through a private virtual alias of the
//! slab page(s) backing it. Freeing the object makes that alias inaccessible
//! while the canonical page goes back to the slab allocator, so any later
//! access through the old pointer faults. A process-wide SIGSEGV/SIGBUS
//! handler resolves the faulting address in the fault table, reports the
//! dangling access with its allocation and free epochs, restores access to
//! the page so the faulting instruction can complete, and then either aborts
//! or returns according to the owning runtime's mode.
//!
//! The fault table is the one piece of process-global state: a signal
//! handler receives no context pointer. It is only ever `try_lock`ed from the
//! handler, and the handler neither allocates nor blocks.

#![allow(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt::{self, Write as _};
use std::mem;
use std::ptr;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::RuntimeError;
use crate::platform;
use crate::provenance::Provenance;

/// Fault-table entry for one retired shadow region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultRecord {
    /// Protected page span `[start, end)`.
    pub start: usize,
    pub end: usize,
    pub object: usize,
    pub object_len: usize,
    pub provenance: Provenance,
    /// Runtime that retired the region.
    pub owner: u64,
    /// Abort after reporting.
    pub terminate: bool,
    pub traps: u32,
    pub synced: u32,
    pub last_fault: usize,
    pub last_pc: usize,
}

static FAULT_TABLE: Mutex<BTreeMap<usize, FaultRecord>> = parking_lot::const_mutex(BTreeMap::new());
static TRAPS: AtomicU64 = AtomicU64::new(0);
static ALERTS: AtomicU64 = AtomicU64::new(0);

/// Handler lock attempts before a fault is treated as foreign.
const SPIN_LIMIT: usize = 1 << 20;

/// Dangling accesses trapped by the handler since process start.
#[must_use]
pub fn trap_count() -> u64 {
    TRAPS.load(Ordering::Relaxed)
}

/// Fault-table entry covering `addr`.
#[must_use]
pub fn fault_record(addr: usize) -> Option<FaultRecord> {
    let table = FAULT_TABLE.lock();
    let (_, record) = table.range(..=addr).next_back()?;
    (addr < record.end).then_some(*record)
}

/// Records of `owner` that trapped since the last call, marked as synced.
pub fn drain_traps(owner: u64) -> Vec<FaultRecord> {
    let mut table = FAULT_TABLE.lock();
    table
        .values_mut()
        .filter(|record| record.owner == owner && record.traps > record.synced)
        .map(|record| {
            record.synced = record.traps;
            *record
        })
        .collect()
}

/// Shadow aliases created for one pool.
pub struct ShadowPages {
    owner: u64,
    terminate: bool,
    regions: BTreeMap<usize, usize>,
}

impl ShadowPages {
    #[must_use]
    pub fn new(owner: u64, terminate: bool) -> Self {
        Self {
            owner,
            terminate,
            regions: BTreeMap::new(),
        }
    }

    /// Number of shadow regions still mapped (live or retired).
    #[must_use]
    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    /// Alias the page(s) holding `canonical..canonical+len` and return the
    /// object's address inside the alias.
    pub fn remap(&mut self, canonical: usize, len: usize) -> Result<usize, RuntimeError> {
        let (page, span) = page_span(canonical, len);
        let alias = platform::alias_pages(page, span)?;
        self.regions.insert(alias, span);
        Ok(alias + (canonical - page))
    }

    /// Make the shadow pages of a freed object inaccessible and register them
    /// with the fault handler.
    pub fn retire(
        &mut self,
        shadow: usize,
        len: usize,
        provenance: Provenance,
    ) -> Result<(), RuntimeError> {
        ensure_fault_handler()?;
        let (page, span) = page_span(shadow, len);
        platform::protect_none(page, span)?;
        FAULT_TABLE.lock().insert(
            page,
            FaultRecord {
                start: page,
                end: page + span,
                object: shadow,
                object_len: len,
                provenance,
                owner: self.owner,
                terminate: self.terminate,
                traps: 0,
                synced: 0,
                last_fault: 0,
                last_pc: 0,
            },
        );
        Ok(())
    }
}

impl Drop for ShadowPages {
    fn drop(&mut self) {
        let mut table = FAULT_TABLE.lock();
        for (&start, &span) in &self.regions {
            table.remove(&start);
            // SAFETY: the alias was created by `remap` and its pool is gone.
            unsafe { platform::unmap(start, span) };
        }
    }
}

fn page_span(addr: usize, len: usize) -> (usize, usize) {
    let page = platform::page_floor(addr);
    let span = platform::page_round_up(addr + len.max(1) - page);
    (page, span)
}

// ---------------------------------------------------------------------------
// Signal handling
// ---------------------------------------------------------------------------

const SIGNALS: [libc::c_int; 2] = [libc::SIGSEGV, libc::SIGBUS];

type Previous = Result<[libc::sigaction; 2], (libc::c_int, i32)>;

static PREVIOUS: OnceLock<Previous> = OnceLock::new();

/// Install the fault handler once, and re-arm it if something replaced it.
pub fn ensure_fault_handler() -> Result<(), RuntimeError> {
    match PREVIOUS.get_or_init(install) {
        Ok(_) => rearm(),
        Err((signal, errno)) => Err(RuntimeError::SignalInstall {
            signal: *signal,
            source: std::io::Error::from_raw_os_error(*errno),
        }),
    }
}

fn handler_action() -> libc::sigaction {
    // SAFETY: sigaction is plain data; all-zero is a valid starting point.
    let mut action: libc::sigaction = unsafe { mem::zeroed() };
    action.sa_sigaction = fault_handler as *const () as usize;
    action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
    // SAFETY: sa_mask is a valid sigset_t owned by `action`.
    unsafe { libc::sigemptyset(&mut action.sa_mask) };
    action
}

fn install() -> Previous {
    // SAFETY: zeroed sigaction values are only written by the kernel below.
    let mut previous: [libc::sigaction; 2] = unsafe { mem::zeroed() };
    let action = handler_action();
    for (slot, &signal) in SIGNALS.iter().enumerate() {
        // SAFETY: both pointers reference valid sigaction structs.
        let rc = unsafe { libc::sigaction(signal, &action, &mut previous[slot]) };
        if rc != 0 {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            return Err((signal, errno));
        }
    }
    Ok(previous)
}

fn rearm() -> Result<(), RuntimeError> {
    let action = handler_action();
    for &signal in &SIGNALS {
        // SAFETY: querying the current action writes into `current` only.
        let mut current: libc::sigaction = unsafe { mem::zeroed() };
        let rc = unsafe { libc::sigaction(signal, ptr::null(), &mut current) };
        if rc == 0 && current.sa_sigaction == fault_handler as *const () as usize {
            continue;
        }
        // SAFETY: installing a fully initialized action.
        if unsafe { libc::sigaction(signal, &action, ptr::null_mut()) } != 0 {
            return Err(RuntimeError::SignalInstall {
                signal,
                source: std::io::Error::last_os_error(),
            });
        }
    }
    Ok(())
}

extern "C" fn fault_handler(
    signal: libc::c_int,
    info: *mut libc::siginfo_t,
    context: *mut libc::c_void,
) {
    let addr = if info.is_null() {
        0
    } else {
        // SAFETY: the kernel passes a valid siginfo for SA_SIGINFO handlers.
        unsafe { (*info).si_addr() as usize }
    };
    let pc = context_pc(context);

    match claim_fault(addr, pc) {
        Some(record) => {
            TRAPS.fetch_add(1, Ordering::Relaxed);
            write_trap_report(addr, pc, &record);
            if record.terminate {
                // SAFETY: abort is async-signal-safe.
                unsafe { libc::abort() };
            }
        }
        None => chain(signal, info, context),
    }
}

fn claim_fault(addr: usize, pc: usize) -> Option<FaultRecord> {
    for _ in 0..SPIN_LIMIT {
        if let Some(mut table) = FAULT_TABLE.try_lock() {
            let (_, record) = table.range_mut(..=addr).next_back()?;
            if addr >= record.end {
                return None;
            }
            record.traps = record.traps.saturating_add(1);
            record.last_fault = addr;
            record.last_pc = pc;
            // Failure leaves the page protected; the retry faults again and
            // lands here, so there is nothing better to do than report.
            let _ = platform::protect_read_write(record.start, record.end - record.start);
            return Some(*record);
        }
        std::hint::spin_loop();
    }
    None
}

fn chain(signal: libc::c_int, info: *mut libc::siginfo_t, context: *mut libc::c_void) {
    let slot = usize::from(signal == libc::SIGBUS);
    let previous = match PREVIOUS.get() {
        Some(Ok(previous)) => Some(previous[slot]),
        _ => None,
    };
    match previous {
        Some(prev) if prev.sa_sigaction != libc::SIG_DFL && prev.sa_sigaction != libc::SIG_IGN => {
            if prev.sa_flags & libc::SA_SIGINFO != 0 {
                // SAFETY: the previous owner registered this as an SA_SIGINFO handler.
                let handler: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void) =
                    unsafe { mem::transmute(prev.sa_sigaction) };
                handler(signal, info, context);
            } else {
                // SAFETY: the previous owner registered a plain handler.
                let handler: extern "C" fn(libc::c_int) =
                    unsafe { mem::transmute(prev.sa_sigaction) };
                handler(signal);
            }
        }
        _ => {
            // Not ours and nobody else wants it: restore the default action so
            // the retried access terminates the process normally.
            // SAFETY: zeroed sigaction with SIG_DFL is a valid action.
            let mut default: libc::sigaction = unsafe { mem::zeroed() };
            default.sa_sigaction = libc::SIG_DFL;
            unsafe { libc::sigaction(signal, &default, ptr::null_mut()) };
        }
    }
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
fn context_pc(context: *mut libc::c_void) -> usize {
    if context.is_null() {
        return 0;
    }
    // SAFETY: the kernel passes a ucontext_t to SA_SIGINFO handlers.
    unsafe { (*(context as *const libc::ucontext_t)).uc_mcontext.gregs[libc::REG_RIP as usize] as usize }
}

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
fn context_pc(context: *mut libc::c_void) -> usize {
    if context.is_null() {
        return 0;
    }
    // SAFETY: the kernel passes a ucontext_t to SA_SIGINFO handlers.
    unsafe { (*(context as *const libc::ucontext_t)).uc_mcontext.pc as usize }
}

#[cfg(not(all(
    target_os = "linux",
    any(target_arch = "x86_64", target_arch = "aarch64")
)))]
fn context_pc(_context: *mut libc::c_void) -> usize {
    0
}

/// Fixed-capacity formatter for signal context.
struct StackText {
    buf: [u8; 1024],
    len: usize,
}

impl fmt::Write for StackText {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = self.buf.len() - self.len;
        let take = s.len().min(room);
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

fn write_trap_report(addr: usize, pc: usize, record: &FaultRecord) {
    let id = ALERTS.fetch_add(1, Ordering::Relaxed) + 1;
    let mut out = StackText {
        buf: [0; 1024],
        len: 0,
    };
    let prov = &record.provenance;
    let _ = writeln!(
        out,
        "=======+++++++    SAFEPOOL RUNTIME ALERT #T{id:04}   +++++++======="
    );
    let _ = writeln!(out, "T{id:04}: Dangling pointer access to memory address {addr:#x}");
    let _ = writeln!(out, "T{id:04}:    at program counter {pc:#x}");
    let _ = writeln!(
        out,
        "T{id:04}:\tObject lower bound   : {:#x}",
        record.object
    );
    let _ = writeln!(
        out,
        "T{id:04}:\tObject upper bound   : {:#x}",
        record.object + record.object_len
    );
    let _ = writeln!(
        out,
        "T{id:04}:\tObject allocated at program counter   : {:#x}",
        prov.alloc_pc
    );
    let _ = writeln!(
        out,
        "T{id:04}:\tObject allocation generation number   : {}",
        prov.alloc_epoch
    );
    let _ = writeln!(
        out,
        "T{id:04}:\tObject freed at program counter       : {:#x}",
        prov.free_pc.unwrap_or(0)
    );
    let _ = writeln!(
        out,
        "T{id:04}:\tObject free generation number         : {}",
        prov.free_epoch.unwrap_or(0)
    );
    let _ = out.write_str("=======+++++++    end of runtime error report    +++++++=======\n");
    platform::write_stderr(&out.buf[..out.len]);
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    #[test]
    fn remap_returns_alias_with_same_offset() {
        let page = platform::page_size();
        let canonical = platform::map_shared(page).expect("map");
        let mut shadows = ShadowPages::new(u64::MAX - 1, false);
        let shadow = shadows.remap(canonical + 48, 16).expect("remap");
        assert_eq!(shadow % page, 48);
        // SAFETY: shadow aliases the mapped canonical page.
        unsafe {
            (shadow as *mut u64).write(0x1122);
            assert_eq!(((canonical + 48) as *const u64).read(), 0x1122);
        }
        assert_eq!(shadows.region_count(), 1);
        drop(shadows);
        // SAFETY: mapped above.
        unsafe { platform::unmap(canonical, page) };
    }

    #[test]
    fn installed_action_points_at_the_fault_handler() {
        ensure_fault_handler().expect("install");
        // SAFETY: querying the current action writes into `current` only.
        let mut current: libc::sigaction = unsafe { mem::zeroed() };
        let rc = unsafe { libc::sigaction(libc::SIGSEGV, ptr::null(), &mut current) };
        assert_eq!(rc, 0);
        assert_eq!(current.sa_sigaction, fault_handler as *const () as usize);
        assert_ne!(current.sa_flags & libc::SA_SIGINFO, 0);
    }

    #[test]
    fn retired_region_traps_and_recovers() {
        let page = platform::page_size();
        let owner = u64::MAX - 2;
        let canonical = platform::map_shared(page).expect("map");
        let mut shadows = ShadowPages::new(owner, false);
        let shadow = shadows.remap(canonical, 32).expect("remap");
        let prov = Provenance {
            alloc_epoch: 5,
            free_epoch: Some(3),
            alloc_pc: 0,
            free_pc: Some(0),
            canonical,
        };
        shadows.retire(shadow, 32, prov).expect("retire");
        let record = fault_record(shadow + 8).expect("registered");
        assert_eq!(record.provenance.free_epoch, Some(3));

        let before = trap_count();
        // SAFETY: the page is protected; the handler restores access and the
        // read completes.
        let value = unsafe { ptr::read_volatile(shadow as *const u8) };
        assert_eq!(value, 0);
        assert!(trap_count() > before);

        let trapped = drain_traps(owner);
        assert_eq!(trapped.len(), 1);
        assert_eq!(trapped[0].last_fault, shadow);
        assert!(drain_traps(owner).is_empty());

        drop(shadows);
        assert!(fault_record(shadow).is_none());
        // SAFETY: mapped above.
        unsafe { platform::unmap(canonical, page) };
    }
}
