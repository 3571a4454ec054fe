//! Fixed-size worker pool for passive scan tasks
//!
//! Workers run one job at a time and exit once the pool is shut down and
//! the queue has drained. They are joined, never detached, so the process
//! does not lose a scan half way through.

use crossbeam_channel::{Receiver, Sender, TrySendError};
use std::panic::{self, AssertUnwindSafe};
use std::thread::JoinHandle;
use tracing::{debug, error};

use crate::error::{PscanError, Result};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct WorkerPool {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    size: usize,
}

impl WorkerPool {
    /// Spawns `size` workers. `queue_capacity` bounds the number of queued
    /// jobs; `None` means unbounded.
    pub fn new(name: &str, size: usize, queue_capacity: Option<usize>) -> Result<Self> {
        if size == 0 {
            return Err(PscanError::ConfigError(
                "worker pool needs at least one thread".to_string(),
            ));
        }

        let (sender, receiver) = match queue_capacity {
            Some(cap) => crossbeam_channel::bounded(cap),
            None => crossbeam_channel::unbounded(),
        };

        let mut workers = Vec::with_capacity(size);
        for i in 0..size {
            let receiver: Receiver<Job> = receiver.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{name}-{i}"))
                .spawn(move || worker_loop(receiver))
                .map_err(PscanError::IoError)?;
            workers.push(handle);
        }
        debug!("Started worker pool '{}' with {} threads", name, size);

        Ok(Self {
            sender: Some(sender),
            workers,
            size,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn submit(&self, job: Job) -> Result<()> {
        let sender = self.sender.as_ref().ok_or(PscanError::PoolShutDown)?;
        sender.try_send(job).map_err(|e| match e {
            TrySendError::Full(_) => PscanError::PoolSaturated,
            TrySendError::Disconnected(_) => PscanError::PoolShutDown,
        })
    }

    /// True when a bounded queue has no room for another job
    pub fn is_full(&self) -> bool {
        self.sender.as_ref().is_some_and(|s| s.is_full())
    }

    /// Stops accepting jobs. Queued jobs still run.
    pub fn shutdown(&mut self) {
        self.sender = None;
    }

    pub fn is_shut_down(&self) -> bool {
        self.sender.is_none()
    }

    /// True once every worker thread has exited
    pub fn is_terminated(&self) -> bool {
        self.workers.iter().all(|w| w.is_finished())
    }

    /// Joins workers that have already exited
    pub fn reap(&mut self) {
        let (done, live): (Vec<_>, Vec<_>) =
            self.workers.drain(..).partition(|w| w.is_finished());
        for handle in done {
            let _ = handle.join();
        }
        self.workers = live;
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(receiver: Receiver<Job>) {
    lower_current_thread_priority();
    while let Ok(job) = receiver.recv() {
        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!("Passive scan job panicked");
        }
    }
}

/// Drops the calling thread one nice level so scanning yields to proxy
/// traffic. Only Linux has per-thread nice values.
#[cfg(target_os = "linux")]
fn lower_current_thread_priority() {
    // SAFETY: getpriority/setpriority with who = 0 act on the calling
    // thread on Linux and take no pointers.
    let rc = unsafe {
        let current = libc::getpriority(libc::PRIO_PROCESS, 0);
        libc::setpriority(libc::PRIO_PROCESS, 0, current + 1)
    };
    if rc != 0 {
        debug!(
            "Could not lower worker thread priority: {}",
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn lower_current_thread_priority() {}
