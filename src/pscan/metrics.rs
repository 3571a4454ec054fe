//! Counters for the passive scan engine

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct ScanMetrics {
    tasks_submitted: AtomicU64,
    tasks_completed: AtomicU64,
    submission_failures: AtomicU64,
    queue_full_retries: AtomicU64,
    rule_invocations: AtomicU64,
    rule_failures: AtomicU64,
    slow_rules: AtomicU64,
    request_body_too_big: AtomicU64,
    response_body_too_big: AtomicU64,
    alerts_raised: AtomicU64,
    alerts_dropped_shutdown: AtomicU64,
    rules_auto_disabled: AtomicU64,
    high_water_mark: AtomicU64,
}

/// Point-in-time copy of [`ScanMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub tasks_submitted: u64,
    pub tasks_completed: u64,
    pub submission_failures: u64,
    pub queue_full_retries: u64,
    pub rule_invocations: u64,
    pub rule_failures: u64,
    pub slow_rules: u64,
    pub request_body_too_big: u64,
    pub response_body_too_big: u64,
    pub alerts_raised: u64,
    pub alerts_dropped_shutdown: u64,
    pub rules_auto_disabled: u64,
    pub high_water_mark: u64,
}

macro_rules! counter {
    ($($inc:ident => $field:ident),* $(,)?) => {
        $(
            pub fn $inc(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl ScanMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    counter! {
        task_submitted => tasks_submitted,
        task_completed => tasks_completed,
        submission_failed => submission_failures,
        queue_full => queue_full_retries,
        rule_invoked => rule_invocations,
        rule_failed => rule_failures,
        slow_rule => slow_rules,
        request_too_big => request_body_too_big,
        response_too_big => response_body_too_big,
        alert_raised => alerts_raised,
        alert_dropped => alerts_dropped_shutdown,
        rule_auto_disabled => rules_auto_disabled,
    }

    /// Only ever moves forward
    pub fn set_high_water_mark(&self, id: u64) {
        self.high_water_mark.fetch_max(id, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            tasks_submitted: self.tasks_submitted.load(Ordering::Relaxed),
            tasks_completed: self.tasks_completed.load(Ordering::Relaxed),
            submission_failures: self.submission_failures.load(Ordering::Relaxed),
            queue_full_retries: self.queue_full_retries.load(Ordering::Relaxed),
            rule_invocations: self.rule_invocations.load(Ordering::Relaxed),
            rule_failures: self.rule_failures.load(Ordering::Relaxed),
            slow_rules: self.slow_rules.load(Ordering::Relaxed),
            request_body_too_big: self.request_body_too_big.load(Ordering::Relaxed),
            response_body_too_big: self.response_body_too_big.load(Ordering::Relaxed),
            alerts_raised: self.alerts_raised.load(Ordering::Relaxed),
            alerts_dropped_shutdown: self.alerts_dropped_shutdown.load(Ordering::Relaxed),
            rules_auto_disabled: self.rules_auto_disabled.load(Ordering::Relaxed),
            high_water_mark: self.high_water_mark.load(Ordering::Relaxed),
        }
    }
}
