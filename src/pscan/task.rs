//! One passive scan of one history record

use serde::Serialize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

use super::registry::TaskRegistry;
use crate::error::Result;
use crate::history::HistoryRef;
use crate::models::Transaction;
use crate::rules::{PassiveScanRule, ResponseBody, RuleContext, RuleEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum TaskState {
    NotStarted = 0,
    Running = 1,
    Completed = 2,
}

impl TaskState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => TaskState::NotStarted,
            1 => TaskState::Running,
            _ => TaskState::Completed,
        }
    }
}

/// Monitoring view of a task
#[derive(Debug, Clone, Serialize)]
pub struct TaskInfo {
    pub history_id: u64,
    pub url: String,
    /// Empty when no rule is executing
    pub rule: String,
    /// Zero until the task starts
    pub elapsed_ms: u64,
    pub state: TaskState,
}

/// Runs every applicable rule against one history record.
///
/// Created and registered by the scheduler at submission time; `run` is
/// called once on a worker thread. The task always deregisters itself
/// when `run` returns, including by unwinding.
pub struct ScanTask {
    href: HistoryRef,
    registry: Arc<TaskRegistry>,
    current_rule: Mutex<Option<Arc<RuleEntry>>>,
    started: OnceLock<Instant>,
    stopped: OnceLock<Instant>,
    state: AtomicU8,
    shutdown: AtomicBool,
}

impl ScanTask {
    /// Creates the task and adds it to the registry's running list
    pub fn new(href: HistoryRef, registry: Arc<TaskRegistry>) -> Arc<Self> {
        let task = Arc::new(Self {
            href,
            registry: Arc::clone(&registry),
            current_rule: Mutex::new(None),
            started: OnceLock::new(),
            stopped: OnceLock::new(),
            state: AtomicU8::new(TaskState::NotStarted as u8),
            shutdown: AtomicBool::new(false),
        });
        registry.add_task(Arc::clone(&task));
        task
    }

    pub fn history_ref(&self) -> &HistoryRef {
        &self.href
    }

    pub fn history_id(&self) -> u64 {
        self.href.id
    }

    pub fn url(&self) -> &str {
        &self.href.url
    }

    pub fn current_rule(&self) -> Option<Arc<RuleEntry>> {
        self.current_rule
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn start_time(&self) -> Option<Instant> {
        self.started.get().copied()
    }

    pub fn stop_time(&self) -> Option<Instant> {
        self.stopped.get().copied()
    }

    /// Time spent so far, or total run time once completed
    pub fn elapsed(&self) -> Option<Duration> {
        let start = self.start_time()?;
        Some(match self.stop_time() {
            Some(stop) => stop.duration_since(start),
            None => start.elapsed(),
        })
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_completed(&self) -> bool {
        self.state() == TaskState::Completed
    }

    /// Asks the task to stop before its next rule. A rule that is
    /// already executing is not interrupted.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub fn info(&self) -> TaskInfo {
        TaskInfo {
            history_id: self.href.id,
            url: self.href.url.clone(),
            rule: self
                .current_rule()
                .map(|r| r.name().to_string())
                .unwrap_or_default(),
            elapsed_ms: self
                .elapsed()
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            state: self.state(),
        }
    }

    /// Completes a task that will never run, e.g. after the pool refused it
    pub fn abandon(&self) {
        self.finish();
    }

    fn finish(&self) {
        let now = Instant::now();
        let _ = self.started.set(now);
        let _ = self.stopped.set(now);
        self.set_current_rule(None);
        self.state
            .store(TaskState::Completed as u8, Ordering::Release);
        self.registry.remove_task(self);
    }

    /// Either this task or the whole engine was told to stop
    fn should_stop(&self) -> bool {
        self.is_shutdown_requested() || self.registry.is_shutdown()
    }

    fn set_current_rule(&self, rule: Option<Arc<RuleEntry>>) {
        *self.current_rule.lock().unwrap_or_else(|e| e.into_inner()) = rule;
    }

    /// Scans the record. Never panics out and never returns an error:
    /// every failure is logged here.
    pub fn run(&self) {
        let _guard = CompletionGuard(self);
        let _ = self.started.set(Instant::now());
        self.state.store(TaskState::Running as u8, Ordering::Release);

        if self.should_stop() {
            debug!("Skipping history {}: shutting down", self.href.id);
            return;
        }

        let transaction = match self.registry.history().load(&self.href) {
            Ok(t) => t,
            Err(e) => {
                if self.href.kind.is_temporary() {
                    debug!(
                        "Temporary history {} vanished before it was scanned",
                        self.href.id
                    );
                } else {
                    error!(
                        "Failed to load history {} ({} {}, kind {}): {}",
                        self.href.id, self.href.method, self.href.url, self.href.kind, e
                    );
                }
                return;
            }
        };

        self.scan(&transaction);
    }

    fn scan(&self, transaction: &Transaction) {
        let registry = self.registry.as_ref();
        let options = registry.options();
        let slow_threshold = options.slow_rule_threshold();
        let rules = registry.available_scan_rules(transaction.kind);

        let response = transaction.response.as_ref().filter(|r| r.from_target);
        let request_too_big = options.body_too_big(transaction.request.body.len());
        let response_too_big = response.is_some_and(|r| options.body_too_big(r.body.len()));
        // an oversized body is never parsed
        let body = response
            .filter(|_| !response_too_big)
            .map(ResponseBody::new);

        for entry in rules {
            if self.should_stop() {
                debug!(
                    "Stopping scan of history {} before rule '{}': shutting down",
                    transaction.history_id,
                    entry.name()
                );
                break;
            }
            if !entry.is_enabled() || !entry.applies_to(transaction.kind, registry.kinds()) {
                continue;
            }

            let rule = entry.instance();
            self.set_current_rule(Some(Arc::clone(&entry)));
            let ctx = RuleContext::new(
                registry,
                transaction,
                entry.id(),
                entry.alert_threshold(),
            );
            let started = Instant::now();
            registry.metrics().rule_invoked();

            let outcome = panic::catch_unwind(AssertUnwindSafe(|| -> Result<()> {
                if request_too_big {
                    registry.metrics().request_too_big();
                    debug!(
                        "Request body of history {} too big for rule '{}'",
                        transaction.history_id,
                        entry.name()
                    );
                } else {
                    rule.scan_request(transaction, &ctx)?;
                }

                if response_too_big {
                    registry.metrics().response_too_big();
                    debug!(
                        "Response body of history {} too big for rule '{}'",
                        transaction.history_id,
                        entry.name()
                    );
                } else if let Some(body) = body.as_ref() {
                    rule.scan_response(transaction, body, &ctx)?;
                }
                Ok(())
            }));

            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    registry.metrics().rule_failed();
                    error!(
                        "Passive rule '{}' failed on history {} {}: {}",
                        entry.name(),
                        transaction.history_id,
                        transaction.url(),
                        e
                    );
                }
                Err(payload) => {
                    registry.metrics().rule_failed();
                    error!(
                        "Passive rule '{}' panicked on history {} {}: {}",
                        entry.name(),
                        transaction.history_id,
                        transaction.url(),
                        panic_message(payload.as_ref())
                    );
                }
            }

            let elapsed = started.elapsed();
            if elapsed > slow_threshold {
                registry.metrics().slow_rule();
                warn_slow_rule(rule.as_ref(), transaction, elapsed);
            }
        }
        self.set_current_rule(None);
    }
}

impl std::fmt::Debug for ScanTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanTask")
            .field("history_id", &self.href.id)
            .field("state", &self.state())
            .finish()
    }
}

struct CompletionGuard<'a>(&'a ScanTask);

impl Drop for CompletionGuard<'_> {
    fn drop(&mut self) {
        self.0.finish();
        self.0.registry.metrics().task_completed();
    }
}

fn warn_slow_rule(rule: &dyn PassiveScanRule, transaction: &Transaction, elapsed: Duration) {
    let (content_type, size) = transaction
        .response
        .as_ref()
        .map(|r| (r.content_type().unwrap_or("-").to_string(), r.body.len()))
        .unwrap_or_else(|| ("-".to_string(), 0));
    warn!(
        "Passive rule '{}' took {:.1}s on history {} {} (content-type: {}, response size: {} bytes)",
        rule.name(),
        elapsed.as_secs_f64(),
        transaction.history_id,
        transaction.url(),
        content_type,
        size
    );
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
