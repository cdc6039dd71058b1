//! A fixed pool of worker threads fed by a bounded queue, with a single
//! submit-then-[`Fanout::sync`] barrier idiom.
//!
//! Tasks are plain closures and receive no handle back to the pool, so
//! nested scheduling (the classic bounded-queue deadlock) is impossible to
//! express. Work that wants to fan out further (like the small-file
//! batches) runs inline inside its parent task instead.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use anyhow::{Result, bail};
use crossbeam_channel::{Receiver, Sender, bounded};
use tracing::*;

use crate::WORK_QUEUE_DEPTH;
use crate::error::HoloError;

pub type Task = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

#[derive(Default)]
struct Progress {
    in_flight: usize,
    first_error: Option<anyhow::Error>,
    later_errors: usize,
}

struct PoolState {
    progress: Mutex<Progress>,
    drained: Condvar,
    cancelled: AtomicBool,
}

pub struct Fanout {
    tx: Option<Sender<Task>>,
    workers: Vec<JoinHandle<()>>,
    state: Arc<PoolState>,
}

/// Worker count for restore-style workloads.
pub fn default_workers() -> usize {
    num_cpus::get().min(16)
}

impl Fanout {
    pub fn new() -> Self {
        Self::with_workers(default_workers())
    }

    pub fn with_workers(count: usize) -> Self {
        let (tx, rx) = bounded::<Task>(WORK_QUEUE_DEPTH);
        let state = Arc::new(PoolState {
            progress: Mutex::new(Progress::default()),
            drained: Condvar::new(),
            cancelled: AtomicBool::new(false),
        });

        let workers = (0..count.max(1))
            .map(|i| {
                let rx: Receiver<Task> = rx.clone();
                let state = state.clone();
                std::thread::Builder::new()
                    .name(format!("fanout-{i}"))
                    .spawn(move || worker(rx, state))
                    .expect("spawning a worker thread failed")
            })
            .collect();

        Self {
            tx: Some(tx),
            workers,
            state,
        }
    }

    /// Queue a task, blocking while the queue is full. Fails once the pool
    /// has been cancelled.
    pub fn submit(&self, task: Task) -> Result<()> {
        if self.state.cancelled.load(Ordering::Relaxed) {
            bail!(HoloError::Cancelled);
        }
        self.state.progress.lock().unwrap().in_flight += 1;
        if self
            .tx
            .as_ref()
            .expect("submit after shutdown")
            .send(task)
            .is_err()
        {
            let mut progress = self.state.progress.lock().unwrap();
            progress.in_flight -= 1;
            bail!("Work queue closed");
        }
        Ok(())
    }

    /// Block until every submitted task has finished, then surface the
    /// first error (later ones are only counted).
    pub fn sync(&self) -> Result<()> {
        let mut progress = self.state.progress.lock().unwrap();
        while progress.in_flight > 0 {
            progress = self.state.drained.wait(progress).unwrap();
        }
        if progress.later_errors > 0 {
            warn!("{} additional task failures suppressed", progress.later_errors);
            progress.later_errors = 0;
        }
        if let Some(err) = progress.first_error.take() {
            return Err(err);
        }
        if self.state.cancelled.load(Ordering::Relaxed) {
            bail!(HoloError::Cancelled);
        }
        Ok(())
    }

    /// Cooperative shutdown: in-flight tasks finish, queued tasks are
    /// dropped, further submits fail.
    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Relaxed)
    }
}

impl Drop for Fanout {
    fn drop(&mut self) {
        self.tx = None; // Closes the queue; workers drain out.
        for w in self.workers.drain(..) {
            let _ = w.join();
        }
    }
}

fn worker(rx: Receiver<Task>, state: Arc<PoolState>) {
    while let Ok(task) = rx.recv() {
        let result = if state.cancelled.load(Ordering::Relaxed) {
            Ok(()) // Dropped, not run.
        } else {
            task()
        };

        let mut progress = state.progress.lock().unwrap();
        if let Err(err) = result {
            if progress.first_error.is_none() {
                debug!("First task failure: {err:#}");
                progress.first_error = Some(err);
                // Everything still queued is pointless now.
                state.cancelled.store(true, Ordering::Relaxed);
            } else {
                progress.later_errors += 1;
            }
        }
        progress.in_flight -= 1;
        if progress.in_flight == 0 {
            state.drained.notify_all();
        }
    }
}
