//! Background loop that tails the history log and dispatches scan tasks
//!
//! The loop keeps two cursors: `next_id`, the next history id to look at,
//! and `last_seen_max`, the highest committed id it has observed. It only
//! resolves ids up to `last_seen_max`, so a record is never considered
//! before it is fully written and no id is skipped while it is still
//! being written. Both cursors only move forward.
//!
//! The pool queue is bounded. When it is full the loop keeps `next_id`
//! where it is and retries the same record shortly after, so queued work
//! never exceeds a few records per worker and a changed thread count
//! applies to the rest of the backlog.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::pool::WorkerPool;
use super::registry::TaskRegistry;
use super::task::{ScanTask, TaskState};
use crate::config::{OptionsHandle, PassiveScanOptions};
use crate::error::{PscanError, Result};
use crate::history::{HistoryLog, HistoryRef};

const POOL_NAME: &str = "pscan-worker";

/// Queued jobs allowed per worker thread
const QUEUE_SLOTS_PER_THREAD: usize = 2;

/// Pause before retrying a record the full pool refused
const SATURATION_BACKOFF: Duration = Duration::from_millis(20);

/// What happened to the record the loop looked at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dispatch {
    Submitted,
    Skipped,
    /// The queue is full; look at the same id again
    Retry,
}

/// Cheap handle the capture path uses to wake the scheduler early
#[derive(Clone)]
pub struct ScanWaker {
    sender: Sender<()>,
}

impl ScanWaker {
    /// Never blocks. Several notifications before the loop wakes collapse
    /// into one.
    pub fn notify(&self) {
        let _ = self.sender.try_send(());
    }
}

#[derive(Debug, Clone, Copy)]
struct Cursor {
    next_id: u64,
    last_seen_max: u64,
}

impl Default for Cursor {
    fn default() -> Self {
        Self {
            next_id: 1,
            last_seen_max: 0,
        }
    }
}

#[derive(Default)]
struct PoolSlot {
    current: Option<WorkerPool>,
    /// Shut down pools whose workers may still be draining
    retired: Vec<WorkerPool>,
}

struct Shared {
    registry: Arc<TaskRegistry>,
    history: Arc<dyn HistoryLog>,
    options: OptionsHandle,
    cursor: Mutex<Cursor>,
    pool: Mutex<PoolSlot>,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    shutdown: AtomicBool,
    /// Cleared while passive scanning is switched off
    enabled: AtomicBool,
}

pub struct PassiveScanScheduler {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl PassiveScanScheduler {
    pub fn new(
        registry: Arc<TaskRegistry>,
        history: Arc<dyn HistoryLog>,
        options: OptionsHandle,
    ) -> Self {
        let (wake_tx, wake_rx) = crossbeam_channel::bounded(1);
        Self {
            shared: Arc::new(Shared {
                registry,
                history,
                options,
                cursor: Mutex::new(Cursor::default()),
                pool: Mutex::new(PoolSlot::default()),
                wake_tx,
                wake_rx,
                shutdown: AtomicBool::new(false),
                enabled: AtomicBool::new(true),
            }),
            thread: Mutex::new(None),
        }
    }

    /// Starts the loop. Records already in the history are not scanned.
    pub fn start(&self) -> Result<()> {
        let first = self.shared.history.highest_committed_id() + 1;
        self.start_at(first)
    }

    /// Starts the loop with `first_id` as the first id to consider
    pub fn start_at(&self, first_id: u64) -> Result<()> {
        let mut thread = self.thread.lock().unwrap_or_else(|e| e.into_inner());
        if self.shared.is_shutdown() {
            return Err(PscanError::ConfigError(
                "passive scan scheduler was already shut down".to_string(),
            ));
        }
        if thread.is_some() {
            debug!("Passive scan scheduler already running");
            return Ok(());
        }

        {
            let mut cursor = self.shared.lock_cursor();
            cursor.next_id = first_id.max(1);
            cursor.last_seen_max = self.shared.history.highest_committed_id();
            self.shared
                .registry
                .metrics()
                .set_high_water_mark(cursor.last_seen_max);
        }

        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name("pscan-scheduler".to_string())
            .spawn(move || shared.run_loop())?;
        *thread = Some(handle);
        Ok(())
    }

    /// Non-blocking hint that a new transaction was recorded
    pub fn notify_new_transaction(&self) {
        let _ = self.shared.wake_tx.try_send(());
    }

    pub fn waker(&self) -> ScanWaker {
        ScanWaker {
            sender: self.shared.wake_tx.clone(),
        }
    }

    /// Switches dispatching on or off. While off, records keep
    /// accumulating and are scanned once dispatching resumes.
    pub fn set_enabled(&self, enabled: bool) {
        let was = self.shared.enabled.swap(enabled, Ordering::AcqRel);
        if was != enabled {
            info!(
                "Passive scanning {}",
                if enabled { "enabled" } else { "disabled" }
            );
        }
        if enabled {
            let _ = self.shared.wake_tx.try_send(());
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.is_enabled()
    }

    /// Records not yet considered plus tasks not yet completed. A task
    /// for `next_id` is being submitted and already counts as unscanned.
    pub fn backlog_size(&self) -> u64 {
        let cursor = *self.shared.lock_cursor();
        let unscanned = (cursor.last_seen_max + 1).saturating_sub(cursor.next_id);
        let pending = self
            .shared
            .registry
            .running_tasks()
            .iter()
            .filter(|t| t.history_id() < cursor.next_id)
            .count();
        unscanned + pending as u64
    }

    /// Highest history id the loop has observed
    pub fn high_water_mark(&self) -> u64 {
        self.shared.lock_cursor().last_seen_max
    }

    /// Skips everything recorded so far. Queued tasks that have not started
    /// are told to stop; tasks already running finish.
    pub fn clear_backlog(&self) {
        {
            let mut cursor = self.shared.lock_cursor();
            let highest = self.shared.history.highest_committed_id();
            cursor.last_seen_max = cursor.last_seen_max.max(highest);
            cursor.next_id = cursor.next_id.max(cursor.last_seen_max + 1);
        }
        for task in self.shared.registry.running_tasks() {
            if task.state() == TaskState::NotStarted {
                task.request_shutdown();
            }
        }
        info!("Passive scan backlog cleared");
    }

    pub fn running_tasks(&self) -> Vec<Arc<ScanTask>> {
        self.shared.registry.running_tasks()
    }

    pub fn oldest_running_task(&self) -> Option<Arc<ScanTask>> {
        self.shared.registry.oldest_running_task()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.is_shutdown()
    }

    /// Stops the loop, stops the pool taking work and asks every task to
    /// stop before its next rule. Returns once the loop thread has exited.
    /// Rules that are executing are not interrupted; use
    /// [`await_termination`](Self::await_termination) to wait for them.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down passive scan scheduler");
        let _ = self.shared.wake_tx.try_send(());
        self.shared.registry.request_shutdown();
        {
            let mut slot = self.shared.lock_pool();
            if let Some(mut pool) = slot.current.take() {
                pool.shutdown();
                slot.retired.push(pool);
            }
        }
        let handle = self
            .thread
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("Passive scan scheduler thread panicked");
            }
        }
    }

    /// Waits for all worker threads to exit. Returns false on timeout,
    /// which means a rule is still executing.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let done = {
                let mut slot = self.shared.lock_pool();
                for pool in slot.retired.iter_mut() {
                    pool.reap();
                }
                slot.retired.retain(|p| !p.is_terminated());
                slot.retired.is_empty() && slot.current.is_none()
            };
            if done {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

impl Drop for PassiveScanScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn lock_cursor(&self) -> std::sync::MutexGuard<'_, Cursor> {
        self.cursor.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_pool(&self) -> std::sync::MutexGuard<'_, PoolSlot> {
        self.pool.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn run_loop(&self) {
        info!(
            "Passive scan scheduler started at history id {}",
            self.lock_cursor().next_id
        );
        while !self.is_shutdown() {
            if !self.is_enabled() {
                self.wait();
                self.refresh_high_water_mark();
                continue;
            }

            let next = {
                let cursor = self.lock_cursor();
                (cursor.next_id <= cursor.last_seen_max).then_some(cursor.next_id)
            };

            match next {
                Some(id) => {
                    if self.consider(id) == Dispatch::Retry {
                        let interval = self.options.snapshot().poll_interval();
                        std::thread::sleep(SATURATION_BACKOFF.min(interval));
                        continue;
                    }
                    let mut cursor = self.lock_cursor();
                    if cursor.next_id == id {
                        cursor.next_id = id + 1;
                    }
                }
                None => {
                    // Caught up: look once more before sleeping
                    if !self.refresh_high_water_mark() {
                        self.wait();
                        self.refresh_high_water_mark();
                    }
                }
            }
        }
        debug!("Passive scan scheduler loop exited");
    }

    fn wait(&self) {
        let interval = self.options.snapshot().poll_interval();
        match self.wake_rx.recv_timeout(interval) {
            Ok(()) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => std::thread::sleep(interval),
        }
    }

    /// Returns true if new records became visible
    fn refresh_high_water_mark(&self) -> bool {
        let highest = self.history.highest_committed_id();
        let mut cursor = self.lock_cursor();
        if highest > cursor.last_seen_max {
            cursor.last_seen_max = highest;
            self.registry.metrics().set_high_water_mark(highest);
            true
        } else {
            false
        }
    }

    fn consider(&self, id: u64) -> Dispatch {
        let Some(href) = self.history.resolve(id) else {
            debug!("History {} not available, skipping", id);
            return Dispatch::Skipped;
        };
        let options = self.options.snapshot();
        if options.scan_only_in_scope && !self.history.is_in_scope(&href) {
            debug!("History {} out of scope, skipping", id);
            return Dispatch::Skipped;
        }
        self.submit(href, &options)
    }

    /// The task is only created once the queue has room, so the running
    /// list holds at most the queued and executing tasks
    fn submit(&self, href: HistoryRef, options: &PassiveScanOptions) -> Dispatch {
        let id = href.id;
        let registry = Arc::clone(&self.registry);
        let result = self.with_pool(options, |pool| {
            if pool.is_full() {
                return Err(PscanError::PoolSaturated);
            }
            let task = ScanTask::new(href, registry);
            let job_task = Arc::clone(&task);
            match pool.submit(Box::new(move || job_task.run())) {
                Ok(()) => Ok(()),
                Err(e) => {
                    task.abandon();
                    Err(e)
                }
            }
        });
        match result {
            Ok(()) => {
                self.registry.metrics().task_submitted();
                Dispatch::Submitted
            }
            Err(PscanError::PoolSaturated) => {
                debug!("Passive scan queue full, retrying history {}", id);
                self.registry.metrics().queue_full();
                Dispatch::Retry
            }
            Err(e) => {
                warn!("Failed to submit passive scan of history {}: {}", id, e);
                self.registry.metrics().submission_failed();
                Dispatch::Skipped
            }
        }
    }

    /// Runs `f` on the live pool, creating it first when there is none or
    /// when the configured thread count changed. A replaced pool drains
    /// its queue before its workers exit.
    fn with_pool<F>(&self, options: &PassiveScanOptions, f: F) -> Result<()>
    where
        F: FnOnce(&WorkerPool) -> Result<()>,
    {
        let mut slot = self.lock_pool();
        if self.is_shutdown() {
            return Err(PscanError::PoolShutDown);
        }

        let stale = match slot.current.as_ref() {
            Some(pool) => pool.is_shut_down() || pool.size() != options.threads,
            None => true,
        };
        if stale {
            if let Some(mut old) = slot.current.take() {
                debug!(
                    "Replacing passive scan pool of {} threads with {}",
                    old.size(),
                    options.threads
                );
                old.shutdown();
                slot.retired.push(old);
            }
            slot.current = Some(WorkerPool::new(
                POOL_NAME,
                options.threads,
                Some(options.threads * QUEUE_SLOTS_PER_THREAD),
            )?);
        }
        slot.retired.retain(|p| !p.is_terminated());

        match slot.current.as_ref() {
            Some(pool) => f(pool),
            None => Err(PscanError::PoolShutDown),
        }
    }
}
