//! Speculative checking.
//!
//! Checks are pushed onto a bounded queue and evaluated by a worker thread
//! while the program keeps running. A full queue blocks the submitter.
//! [`CheckQueue::wait_for_completion`] is the synchronization point: once it
//! returns, every check submitted before the call has been evaluated and
//! any violation it found has been enforced.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex, RwLock};

use crate::error::RuntimeError;
use crate::pool::Pool;
use crate::provenance::SourceSite;
use crate::runtime::Runtime;
use crate::violation::Violation;

/// A check to run off the program's thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckRequest {
    Dereference { ptr: usize },
    DereferenceIncomplete { ptr: usize },
    Index { src: usize, dst: usize },
    IndexIncomplete { src: usize, dst: usize },
}

enum Message {
    Check(CheckRequest, SourceSite),
    Stop,
}

#[derive(Default)]
struct Progress {
    pending: Mutex<usize>,
    idle: Condvar,
    found: Mutex<Vec<Violation>>,
}

impl Progress {
    fn finish_one(&self) {
        let mut pending = self.pending.lock();
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            self.idle.notify_all();
        }
    }
}

pub struct CheckQueue {
    sender: Sender<Message>,
    progress: Arc<Progress>,
    worker: Option<JoinHandle<()>>,
}

impl CheckQueue {
    /// Start a worker checking against `pool` with room for `capacity`
    /// queued requests.
    pub fn spawn(
        runtime: Arc<Runtime>,
        pool: Arc<RwLock<Pool>>,
        capacity: usize,
    ) -> Result<Self, RuntimeError> {
        let (sender, receiver) = crossbeam_channel::bounded(capacity.max(1));
        let progress = Arc::new(Progress::default());
        let worker_progress = Arc::clone(&progress);
        let worker = thread::Builder::new()
            .name("safepool-check".into())
            .spawn(move || run_worker(&runtime, &pool, &receiver, &worker_progress))
            .map_err(RuntimeError::Worker)?;
        Ok(Self {
            sender,
            progress,
            worker: Some(worker),
        })
    }

    /// Queue a check. Returns false if the worker has gone away.
    pub fn submit(&self, request: CheckRequest, site: SourceSite) -> bool {
        *self.progress.pending.lock() += 1;
        if self.sender.send(Message::Check(request, site)).is_err() {
            self.progress.finish_one();
            return false;
        }
        true
    }

    /// Block until every submitted check has been evaluated.
    pub fn wait_for_completion(&self) {
        let mut pending = self.progress.pending.lock();
        while *pending > 0 {
            self.progress.idle.wait(&mut pending);
        }
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        *self.progress.pending.lock()
    }

    /// Violations found by the worker since the last call.
    pub fn take_violations(&self) -> Vec<Violation> {
        std::mem::take(&mut *self.progress.found.lock())
    }
}

impl Drop for CheckQueue {
    fn drop(&mut self) {
        let _ = self.sender.send(Message::Stop);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn run_worker(
    runtime: &Runtime,
    pool: &RwLock<Pool>,
    receiver: &Receiver<Message>,
    progress: &Progress,
) {
    for message in receiver {
        let (request, site) = match message {
            Message::Check(request, site) => (request, site),
            Message::Stop => break,
        };
        let outcome = {
            let pool = pool.read();
            match request {
                CheckRequest::Dereference { ptr } => runtime.try_check_dereference(&pool, ptr),
                CheckRequest::DereferenceIncomplete { ptr } => {
                    runtime.try_check_dereference_incomplete(&pool, ptr)
                }
                CheckRequest::Index { src, dst } => {
                    runtime.try_check_index(&pool, src, dst).map(drop)
                }
                CheckRequest::IndexIncomplete { src, dst } => {
                    runtime.try_check_index_incomplete(&pool, src, dst).map(drop)
                }
            }
        };
        if let Err(violation) = outcome {
            let violation = violation.at(&site);
            progress.found.lock().push(violation.clone());
            runtime.enforce(violation);
        }
        progress.finish_one();
    }
}
