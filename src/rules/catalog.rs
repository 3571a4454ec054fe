//! Registered rules and their mutable enable/threshold state

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

use super::{AlertThreshold, PassiveScanRule, RuleId};
use crate::error::{PscanError, Result};
use crate::models::HistoryKind;
use crate::pscan::kinds::ApplicableKinds;

/// A rule plus the state operators and the registry may change at any time
pub struct RuleEntry {
    rule: Arc<dyn PassiveScanRule>,
    enabled: AtomicBool,
    threshold: RwLock<AlertThreshold>,
}

impl RuleEntry {
    fn new(rule: Arc<dyn PassiveScanRule>) -> Self {
        Self {
            rule,
            enabled: AtomicBool::new(true),
            threshold: RwLock::new(AlertThreshold::Default),
        }
    }

    pub fn id(&self) -> RuleId {
        self.rule.id()
    }

    pub fn name(&self) -> &str {
        self.rule.name()
    }

    pub fn rule(&self) -> &Arc<dyn PassiveScanRule> {
        &self.rule
    }

    pub fn is_tag_rule(&self) -> bool {
        self.rule.is_tag_rule()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// Returns true if this call is the one that switched the rule off
    pub fn disable(&self) -> bool {
        self.enabled.swap(false, Ordering::AcqRel)
    }

    pub fn alert_threshold(&self) -> AlertThreshold {
        *self.threshold.read().unwrap_or_else(|e| e.into_inner())
    }

    /// `Off` disables the rule, any other threshold enables it
    pub fn set_alert_threshold(&self, threshold: AlertThreshold) {
        *self.threshold.write().unwrap_or_else(|e| e.into_inner()) = threshold;
        self.set_enabled(threshold != AlertThreshold::Off);
    }

    /// Whether this rule should run against a record of `kind`
    pub fn applies_to(&self, kind: HistoryKind, kinds: &ApplicableKinds) -> bool {
        self.rule.applies_to_history_kind(kind) || kinds.contains(kind)
    }

    /// The instance to run for one task: a private fork for stateful
    /// rules, the shared rule otherwise
    pub fn instance(&self) -> Arc<dyn PassiveScanRule> {
        match self.rule.fork() {
            Some(fork) => Arc::from(fork),
            None => Arc::clone(&self.rule),
        }
    }
}

impl std::fmt::Debug for RuleEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleEntry")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

/// Ordered set of registered rules
#[derive(Default)]
pub struct RuleCatalog {
    entries: RwLock<Vec<Arc<RuleEntry>>>,
}

impl RuleCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a catalog holding the given rules in order
    pub fn with_rules(rules: Vec<Arc<dyn PassiveScanRule>>) -> Result<Self> {
        let catalog = Self::new();
        for rule in rules {
            catalog.register(rule)?;
        }
        Ok(catalog)
    }

    /// Appends a rule. Ids must be unique.
    pub fn register(&self, rule: Arc<dyn PassiveScanRule>) -> Result<()> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if entries.iter().any(|e| e.id() == rule.id()) {
            return Err(PscanError::DuplicateRule(rule.id()));
        }
        debug!("Registered passive rule {} ({})", rule.name(), rule.id());
        entries.push(Arc::new(RuleEntry::new(rule)));
        Ok(())
    }

    /// Removes a rule. Tasks already holding it finish with it.
    pub fn unregister(&self, id: RuleId) -> Result<()> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|e| e.id() != id);
        if entries.len() == before {
            return Err(PscanError::RuleNotFound(id));
        }
        Ok(())
    }

    /// Snapshot of every registered rule in registration order
    pub fn entries(&self) -> Vec<Arc<RuleEntry>> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn scan_rule_by_id(&self, id: RuleId) -> Option<Arc<RuleEntry>> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|e| e.id() == id)
            .cloned()
    }

    /// Enabled rules applicable to `kind`, in registration order
    pub fn enabled_applicable_rules(
        &self,
        kind: HistoryKind,
        kinds: &ApplicableKinds,
        include_tags: bool,
    ) -> Vec<Arc<RuleEntry>> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|e| e.is_enabled())
            .filter(|e| include_tags || !e.is_tag_rule())
            .filter(|e| e.applies_to(kind, kinds))
            .cloned()
            .collect()
    }

    /// Disables a rule. Returns false if the rule is unknown.
    pub fn disable(&self, id: RuleId) -> bool {
        match self.scan_rule_by_id(id) {
            Some(entry) => {
                if entry.disable() {
                    info!("Passive rule {} ({}) disabled", entry.name(), id);
                }
                true
            }
            None => false,
        }
    }

    /// Enables or disables every non-tag rule
    pub fn set_all_enabled(&self, enabled: bool) {
        for entry in self.entries().iter().filter(|e| !e.is_tag_rule()) {
            entry.set_enabled(enabled);
        }
    }

    /// Enables or disables every tag rule
    pub fn set_all_tags_enabled(&self, enabled: bool) {
        for entry in self.entries().iter().filter(|e| e.is_tag_rule()) {
            entry.set_enabled(enabled);
        }
    }
}
