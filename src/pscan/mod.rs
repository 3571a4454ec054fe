//! Passive scan engine
//!
//! [`PassiveScanner`] wires the history log, the rule catalog and the
//! alert store to a [`TaskRegistry`] and a [`PassiveScanScheduler`], and
//! exposes the operational controls (rule toggles, limits, backlog and
//! task views).

pub mod kinds;
pub mod metrics;
pub mod pool;
pub mod registry;
pub mod scheduler;
pub mod task;

use chrono::{DateTime, Local};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::alerts::AlertSink;
use crate::config::{OptionsHandle, PassiveScanOptions};
use crate::error::{PscanError, Result};
use crate::history::HistoryLog;
use crate::models::{Finding, ScanReport};
use crate::rules::{AlertThreshold, RuleCatalog, RuleId};

pub use kinds::{ApplicableKinds, KindRegistration};
pub use metrics::{MetricsSnapshot, ScanMetrics};
pub use registry::TaskRegistry;
pub use scheduler::{PassiveScanScheduler, ScanWaker};
pub use task::{ScanTask, TaskInfo, TaskState};

/// Listing entry for a registered rule
#[derive(Debug, Clone, Serialize)]
pub struct RuleInfo {
    pub id: RuleId,
    pub name: String,
    pub enabled: bool,
    pub alert_threshold: AlertThreshold,
    pub is_tag: bool,
}

pub struct PassiveScanner {
    history: Arc<dyn HistoryLog>,
    catalog: Arc<RuleCatalog>,
    kinds: Arc<ApplicableKinds>,
    options: OptionsHandle,
    metrics: Arc<ScanMetrics>,
    registry: Arc<TaskRegistry>,
    scheduler: PassiveScanScheduler,
    started_at: DateTime<Local>,
}

impl PassiveScanner {
    pub fn new(
        history: Arc<dyn HistoryLog>,
        alerts: Arc<dyn AlertSink>,
        catalog: Arc<RuleCatalog>,
        options: PassiveScanOptions,
    ) -> Result<Self> {
        Self::with_kinds(history, alerts, catalog, options, Arc::new(ApplicableKinds::new()))
    }

    /// Like [`new`](Self::new) with a caller-owned set of opted-in kinds
    pub fn with_kinds(
        history: Arc<dyn HistoryLog>,
        alerts: Arc<dyn AlertSink>,
        catalog: Arc<RuleCatalog>,
        options: PassiveScanOptions,
        kinds: Arc<ApplicableKinds>,
    ) -> Result<Self> {
        options.validate()?;
        let options = OptionsHandle::new(options);
        let metrics = Arc::new(ScanMetrics::new());
        let registry = Arc::new(TaskRegistry::new(
            Arc::clone(&catalog),
            Arc::clone(&kinds),
            Arc::clone(&history),
            alerts,
            options.clone(),
            Arc::clone(&metrics),
        ));
        let scheduler =
            PassiveScanScheduler::new(Arc::clone(&registry), Arc::clone(&history), options.clone());

        Ok(Self {
            history,
            catalog,
            kinds,
            options,
            metrics,
            registry,
            scheduler,
            started_at: Local::now(),
        })
    }

    /// Starts scanning records committed from now on
    pub fn start(&self) -> Result<()> {
        self.scheduler.start()
    }

    /// Starts scanning at `first_id`, including records already in history
    pub fn start_at(&self, first_id: u64) -> Result<()> {
        self.scheduler.start_at(first_id)
    }

    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }

    pub fn await_termination(&self, timeout: Duration) -> bool {
        self.scheduler.await_termination(timeout)
    }

    /// Switches passive scanning on or off without losing its place in
    /// the history
    pub fn set_enabled(&self, enabled: bool) {
        self.scheduler.set_enabled(enabled);
    }

    pub fn is_enabled(&self) -> bool {
        self.scheduler.is_enabled()
    }

    pub fn notify_new_transaction(&self) {
        self.scheduler.notify_new_transaction();
    }

    pub fn waker(&self) -> ScanWaker {
        self.scheduler.waker()
    }

    pub fn history(&self) -> &Arc<dyn HistoryLog> {
        &self.history
    }

    pub fn catalog(&self) -> &Arc<RuleCatalog> {
        &self.catalog
    }

    pub fn kinds(&self) -> &Arc<ApplicableKinds> {
        &self.kinds
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn options(&self) -> PassiveScanOptions {
        self.options.snapshot()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    // Views

    pub fn scan_only_in_scope(&self) -> bool {
        self.options.snapshot().scan_only_in_scope
    }

    /// Records waiting to be scanned plus tasks in flight
    pub fn records_to_scan(&self) -> u64 {
        self.scheduler.backlog_size()
    }

    pub fn high_water_mark(&self) -> u64 {
        self.scheduler.high_water_mark()
    }

    pub fn rules(&self) -> Vec<RuleInfo> {
        self.catalog
            .entries()
            .iter()
            .map(|e| RuleInfo {
                id: e.id(),
                name: e.name().to_string(),
                enabled: e.is_enabled(),
                alert_threshold: e.alert_threshold(),
                is_tag: e.is_tag_rule(),
            })
            .collect()
    }

    /// The oldest unfinished task, the first place to look for a stuck rule
    pub fn current_rule(&self) -> Option<TaskInfo> {
        self.scheduler.oldest_running_task().map(|t| t.info())
    }

    pub fn current_tasks(&self) -> Vec<TaskInfo> {
        self.scheduler
            .running_tasks()
            .iter()
            .map(|t| t.info())
            .collect()
    }

    pub fn max_alerts_per_rule(&self) -> u32 {
        self.options.snapshot().max_alerts_per_rule
    }

    // Actions

    pub fn set_scan_only_in_scope(&self, only_in_scope: bool) -> Result<()> {
        self.options.update(|o| o.scan_only_in_scope = only_in_scope)
    }

    pub fn enable_all_rules(&self) {
        self.catalog.set_all_enabled(true);
    }

    pub fn disable_all_rules(&self) {
        self.catalog.set_all_enabled(false);
    }

    /// Applies the change to each id in order, stopping at the first
    /// unknown one
    pub fn set_rules_enabled(&self, ids: &[RuleId], enabled: bool) -> Result<()> {
        for &id in ids {
            let entry = self
                .catalog
                .scan_rule_by_id(id)
                .ok_or(PscanError::RuleNotFound(id))?;
            entry.set_enabled(enabled);
        }
        Ok(())
    }

    pub fn set_rule_alert_threshold(&self, id: RuleId, threshold: AlertThreshold) -> Result<()> {
        let entry = self
            .catalog
            .scan_rule_by_id(id)
            .ok_or(PscanError::RuleNotFound(id))?;
        entry.set_alert_threshold(threshold);
        Ok(())
    }

    pub fn set_max_alerts_per_rule(&self, max: u32) -> Result<()> {
        self.options.update(|o| o.max_alerts_per_rule = max)
    }

    pub fn set_max_body_size(&self, bytes: usize) -> Result<()> {
        self.options.update(|o| o.max_body_size_bytes = bytes)
    }

    /// Takes effect for the next pool; the running pool drains first
    pub fn set_thread_count(&self, threads: usize) -> Result<()> {
        self.options.update(|o| o.threads = threads)?;
        info!("Passive scan thread count set to {}", threads);
        Ok(())
    }

    pub fn enable_all_tags(&self) -> Result<()> {
        self.options.update(|o| o.enable_tags = true)?;
        self.catalog.set_all_tags_enabled(true);
        Ok(())
    }

    pub fn disable_all_tags(&self) -> Result<()> {
        self.catalog.set_all_tags_enabled(false);
        Ok(())
    }

    pub fn clear_queue(&self) {
        self.scheduler.clear_backlog();
    }

    /// Packs the given findings into a report for this session
    pub fn report(&self, findings: Vec<Finding>) -> ScanReport {
        let mut report = ScanReport::new();
        report.started_at = self.started_at;
        report.findings = findings;
        report.findings.sort_by(|a, b| a.severity.cmp(&b.severity));
        report.transactions_scanned = self.metrics.snapshot().tasks_completed;
        report.finish();
        report
    }
}
