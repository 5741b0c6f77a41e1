//! Violation reporting.
//!
//! Each violation is rendered once as a numbered alert on stderr and,
//! when a report log is configured, appended as one JSON line. The sink keeps
//! a bounded history so callers running in diagnostic mode can inspect what
//! was reported.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::error::RuntimeError;
use crate::violation::Violation;

/// Reports kept for inspection.
const HISTORY: usize = 256;

pub struct ReportSink {
    next_id: AtomicU32,
    log: Mutex<Option<File>>,
    history: Mutex<VecDeque<Violation>>,
    echo: bool,
}

impl ReportSink {
    /// A sink that writes alerts to stderr and optionally to `log_path`.
    pub fn open(log_path: Option<&Path>) -> Result<Self, RuntimeError> {
        let log = match log_path {
            Some(path) => Some(OpenOptions::new().create(true).append(true).open(path)?),
            None => None,
        };
        Ok(Self {
            next_id: AtomicU32::new(1),
            log: Mutex::new(log),
            history: Mutex::new(VecDeque::with_capacity(16)),
            echo: true,
        })
    }

    /// A sink that only records history. Used by tests and the harness.
    #[must_use]
    pub fn quiet() -> Self {
        Self {
            next_id: AtomicU32::new(1),
            log: Mutex::new(None),
            history: Mutex::new(VecDeque::with_capacity(16)),
            echo: false,
        }
    }

    /// Emit one violation. Returns the alert number.
    pub fn emit(&self, violation: &Violation) -> u32 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if self.echo {
            let text = render_alert(id, violation);
            let _ = io::stderr().lock().write_all(text.as_bytes());
        }
        self.record(violation);
        id
    }

    /// Log and remember a violation whose alert text was already written
    /// elsewhere (the fault handler prints its own).
    pub fn record(&self, violation: &Violation) {
        if let Some(file) = self.log.lock().as_mut() {
            if let Ok(line) = serde_json::to_string(violation) {
                let _ = writeln!(file, "{line}");
            }
        }
        let mut history = self.history.lock();
        if history.len() == HISTORY {
            history.pop_front();
        }
        history.push_back(violation.clone());
    }

    /// Number of alerts emitted so far.
    #[must_use]
    pub fn emitted(&self) -> u32 {
        self.next_id.load(Ordering::Relaxed) - 1
    }

    /// Remove and return the recorded history.
    pub fn drain(&self) -> Vec<Violation> {
        self.history.lock().drain(..).collect()
    }

    #[must_use]
    pub fn recent(&self) -> Vec<Violation> {
        self.history.lock().iter().cloned().collect()
    }
}

/// Render the human-readable alert block.
#[must_use]
pub fn render_alert(id: u32, violation: &Violation) -> String {
    let mut out = String::with_capacity(512);
    let _ = writeln!(
        out,
        "=======+++++++    SAFEPOOL RUNTIME ALERT #{id:04}   +++++++======="
    );
    let _ = writeln!(
        out,
        "{id:04}: {} to memory address {:#x}",
        violation.kind.headline(),
        violation.fault_address
    );
    let _ = writeln!(out, "{id:04}:    at program counter {:#x}", violation.pc);
    if let Some(src) = violation.source_pointer {
        let _ = writeln!(out, "{id:04}:\tIndex source pointer : {src:#x}");
    }
    if let Some(dst) = violation.result_pointer {
        let _ = writeln!(out, "{id:04}:\tIndex result pointer : {dst:#x}");
    }
    if let Some(file) = &violation.source_file {
        let _ = writeln!(out, "{id:04}:\tSource filename      : {file}");
    }
    if let Some(line) = violation.source_line {
        let _ = writeln!(out, "{id:04}:\tSource line number   : {line}");
    }
    match violation.object {
        Some(bounds) => {
            let _ = writeln!(out, "{id:04}:\tObject lower bound   : {:#x}", bounds.start);
            let _ = writeln!(out, "{id:04}:\tObject upper bound   : {:#x}", bounds.end);
        }
        None => {
            let _ = writeln!(out, "{id:04}:\tNot found within object");
        }
    }
    if let Some(prov) = violation.provenance {
        let _ = writeln!(
            out,
            "{id:04}:\tObject allocated at program counter   : {:#x}",
            prov.alloc_pc
        );
        let _ = writeln!(
            out,
            "{id:04}:\tObject allocation generation number   : {}",
            prov.alloc_epoch
        );
        if let Some(free_pc) = prov.free_pc {
            let _ = writeln!(
                out,
                "{id:04}:\tObject freed at program counter       : {free_pc:#x}"
            );
        }
        if let Some(free_epoch) = prov.free_epoch {
            let _ = writeln!(
                out,
                "{id:04}:\tObject free generation number         : {free_epoch}"
            );
        }
    }
    if let Some(detail) = &violation.detail {
        let _ = writeln!(out, "{id:04}:\t{detail}");
    }
    out.push_str("=======+++++++    end of runtime error report    +++++++=======\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::violation::{ObjectBounds, ViolationKind};

    #[test]
    fn alert_has_banner_and_fields() {
        let violation = Violation::new(ViolationKind::OutOfBounds, 0x1028)
            .with_index(0x1000, 0x1028)
            .with_object(ObjectBounds::new(0x1000, 40));
        let text = render_alert(7, &violation);
        assert!(text.starts_with("=======+++++++    SAFEPOOL RUNTIME ALERT #0007"));
        assert!(text.contains("0007: Bounds violation to memory address 0x1028"));
        assert!(text.contains("Object upper bound   : 0x1028"));
        assert!(text.ends_with("end of runtime error report    +++++++=======\n"));
    }

    #[test]
    fn quiet_sink_keeps_history() {
        let sink = ReportSink::quiet();
        assert_eq!(sink.emit(&Violation::new(ViolationKind::DoubleFree, 1)), 1);
        assert_eq!(sink.emit(&Violation::new(ViolationKind::InvalidFree, 2)), 2);
        assert_eq!(sink.emitted(), 2);
        let drained = sink.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].kind, ViolationKind::DoubleFree);
        assert!(sink.recent().is_empty());
    }

    #[test]
    fn jsonl_log_receives_one_line_per_violation() {
        let path = std::env::temp_dir().join(format!(
            "safepool-report-{}-{:?}.jsonl",
            std::process::id(),
            std::thread::current().id()
        ));
        let _ = std::fs::remove_file(&path);
        {
            let mut sink = ReportSink::open(Some(&path)).expect("log opens");
            sink.echo = false;
            sink.emit(&Violation::new(ViolationKind::TemporalViolation, 0x10));
            sink.emit(&Violation::new(ViolationKind::OutOfBounds, 0x20));
        }
        let text = std::fs::read_to_string(&path).expect("log readable");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: Violation = serde_json::from_str(lines[0]).expect("valid json");
        assert_eq!(first.kind, ViolationKind::TemporalViolation);
        let _ = std::fs::remove_file(&path);
    }
}
