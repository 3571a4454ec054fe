//! Shared state between the scheduler and every running task
//!
//! The running-task list and the per-rule alert counters live behind a
//! single lock. Raising alerts and tagging history go through here so
//! they are serialized and can be cut off during shutdown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use super::kinds::ApplicableKinds;
use super::metrics::ScanMetrics;
use super::task::ScanTask;
use crate::alerts::AlertSink;
use crate::config::{OptionsHandle, PassiveScanOptions};
use crate::history::HistoryLog;
use crate::models::{AlertSource, Finding, HistoryKind, Transaction};
use crate::rules::{RuleCatalog, RuleEntry, RuleId, ScanActions};

#[derive(Default)]
struct RegistryState {
    /// Submission order
    running: Vec<Arc<ScanTask>>,
    alert_counts: HashMap<RuleId, u32>,
}

pub struct TaskRegistry {
    state: Mutex<RegistryState>,
    catalog: Arc<RuleCatalog>,
    kinds: Arc<ApplicableKinds>,
    history: Arc<dyn HistoryLog>,
    alerts: Arc<dyn AlertSink>,
    options: OptionsHandle,
    metrics: Arc<ScanMetrics>,
    shutdown: AtomicBool,
}

impl TaskRegistry {
    pub fn new(
        catalog: Arc<RuleCatalog>,
        kinds: Arc<ApplicableKinds>,
        history: Arc<dyn HistoryLog>,
        alerts: Arc<dyn AlertSink>,
        options: OptionsHandle,
        metrics: Arc<ScanMetrics>,
    ) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            catalog,
            kinds,
            history,
            alerts,
            options,
            metrics,
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn history(&self) -> &Arc<dyn HistoryLog> {
        &self.history
    }

    pub fn catalog(&self) -> &Arc<RuleCatalog> {
        &self.catalog
    }

    pub fn kinds(&self) -> &ApplicableKinds {
        &self.kinds
    }

    pub fn metrics(&self) -> &ScanMetrics {
        &self.metrics
    }

    pub fn options(&self) -> PassiveScanOptions {
        self.options.snapshot()
    }

    pub fn add_task(&self, task: Arc<ScanTask>) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.running.push(task);
    }

    pub fn remove_task(&self, task: &ScanTask) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .running
            .retain(|t| !std::ptr::eq(Arc::as_ptr(t), task));
    }

    /// Tasks that have not completed yet, in submission order
    pub fn running_tasks(&self) -> Vec<Arc<ScanTask>> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .running
            .iter()
            .filter(|t| !t.is_completed())
            .cloned()
            .collect()
    }

    /// First task in submission order that is still pending or running
    pub fn oldest_running_task(&self) -> Option<Arc<ScanTask>> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.running.iter().find(|t| !t.is_completed()).cloned()
    }

    /// Rules a new task should run against a record of `kind`
    pub fn available_scan_rules(&self, kind: HistoryKind) -> Vec<Arc<RuleEntry>> {
        let include_tags = self.options.snapshot().enable_tags;
        self.catalog
            .enabled_applicable_rules(kind, &self.kinds, include_tags)
    }

    /// Number of alerts a rule has raised so far
    pub fn alert_count(&self, rule_id: RuleId) -> u32 {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.alert_counts.get(&rule_id).copied().unwrap_or(0)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Stops alerting and tagging, and asks every task to stop between rules
    pub fn request_shutdown(&self) {
        let tasks = {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            self.shutdown.store(true, Ordering::Release);
            state.running.clone()
        };
        for task in tasks {
            task.request_shutdown();
        }
    }

    /// Delivers a finding and applies the per-rule alert cap.
    ///
    /// The counter is bumped after delivery; once it is strictly greater
    /// than `max_alerts_per_rule` the rule is disabled for later tasks.
    /// The alert that crosses the cap is still delivered.
    pub fn raise_alert(&self, transaction: &Transaction, mut finding: Finding) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if self.is_shutdown() {
            self.metrics.alert_dropped();
            debug!(
                "Dropping alert '{}' on history {}: shutting down",
                finding.title, transaction.history_id
            );
            return;
        }

        finding.source = AlertSource::Passive;
        finding.history_id = Some(transaction.history_id);
        if finding.url.is_empty() {
            finding.url = transaction.url().to_string();
        }
        let rule_id = finding.rule_id;
        self.alerts.raise(finding);
        self.metrics.alert_raised();

        let Some(rule_id) = rule_id else {
            return;
        };
        let count = state.alert_counts.entry(rule_id).or_insert(0);
        *count += 1;
        let count = *count;
        drop(state);

        let max = self.options.snapshot().max_alerts_per_rule;
        if max == 0 || count <= max {
            return;
        }
        if let Some(entry) = self.catalog.scan_rule_by_id(rule_id) {
            if entry.disable() {
                self.metrics.rule_auto_disabled();
                info!(
                    "Disabling passive rule '{}' ({}): raised {} alerts, maximum is {}",
                    entry.name(),
                    rule_id,
                    count,
                    max
                );
            }
        }
    }

    /// Tags a history record unless it already carries the tag
    pub fn add_history_tag(&self, transaction: &Transaction, tag: &str) {
        let _state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if self.is_shutdown() {
            return;
        }
        let id = transaction.history_id;
        if self.history.tags(id).iter().any(|t| t == tag) {
            return;
        }
        if let Err(e) = self.history.add_tag(id, tag) {
            debug!("Could not tag history {} with '{}': {}", id, tag, e);
        }
    }
}

impl ScanActions for TaskRegistry {
    fn raise_alert(&self, transaction: &Transaction, finding: Finding) {
        TaskRegistry::raise_alert(self, transaction, finding);
    }

    fn add_history_tag(&self, transaction: &Transaction, tag: &str) {
        TaskRegistry::add_history_tag(self, transaction, tag);
    }
}
