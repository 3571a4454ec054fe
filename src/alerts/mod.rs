//! Alert store collaborator

use crate::models::Finding;
use std::sync::{Arc, Mutex};

/// Receives every finding the passive scanner raises
pub trait AlertSink: Send + Sync {
    fn raise(&self, finding: Finding);
}

/// Collects findings in memory for reporting
#[derive(Debug, Clone, Default)]
pub struct MemoryAlertStore {
    findings: Arc<Mutex<Vec<Finding>>>,
}

impl MemoryAlertStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all findings raised so far
    pub fn findings(&self) -> Vec<Finding> {
        let findings = self.findings.lock().unwrap_or_else(|e| e.into_inner());
        findings.clone()
    }

    pub fn len(&self) -> usize {
        let findings = self.findings.lock().unwrap_or_else(|e| e.into_inner());
        findings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AlertSink for MemoryAlertStore {
    fn raise(&self, finding: Finding) {
        let mut findings = self.findings.lock().unwrap_or_else(|e| e.into_inner());
        findings.push(finding);
    }
}
