//! In-memory history log used by the intercept proxy and HAR import

use chrono::Utc;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};

use super::{HistoryLog, HistoryRef};
use crate::error::{PscanError, Result};
use crate::models::{HistoryKind, HttpRequest, HttpResponse, Transaction};

struct Record {
    transaction: Arc<Transaction>,
    tags: Vec<String>,
}

#[derive(Default)]
struct State {
    records: BTreeMap<u64, Record>,
    last_id: u64,
}

/// Thread-safe, append-only history
#[derive(Clone, Default)]
pub struct MemoryHistory {
    state: Arc<Mutex<State>>,
    scope: Arc<RwLock<Vec<Regex>>>,
}

impl MemoryHistory {
    /// Create a new empty history
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a transaction and returns its id. The record is fully
    /// written before the id becomes visible through `highest_committed_id`.
    pub fn record(
        &self,
        kind: HistoryKind,
        request: HttpRequest,
        response: Option<HttpResponse>,
    ) -> u64 {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.last_id += 1;
        let id = state.last_id;
        let transaction = Transaction {
            history_id: id,
            kind,
            recorded_at: Utc::now(),
            request,
            response,
        };
        state.records.insert(
            id,
            Record {
                transaction: Arc::new(transaction),
                tags: Vec::new(),
            },
        );
        id
    }

    /// Deletes a record. Returns false if it did not exist.
    pub fn purge(&self, id: u64) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.records.remove(&id).is_some()
    }

    /// Replaces the scope with the given URL regexes
    pub fn set_scope(&self, patterns: &[String]) -> Result<()> {
        let compiled = patterns
            .iter()
            .map(|p| Regex::new(p))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let mut scope = self.scope.write().unwrap_or_else(|e| e.into_inner());
        *scope = compiled;
        Ok(())
    }

    /// Get the total number of live records
    pub fn len(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.records.len()
    }

    /// Check if the history is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl HistoryLog for MemoryHistory {
    fn highest_committed_id(&self) -> u64 {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.last_id
    }

    fn resolve(&self, id: u64) -> Option<HistoryRef> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.records.get(&id).map(|r| HistoryRef {
            id,
            kind: r.transaction.kind,
            method: r.transaction.request.method.clone(),
            url: r.transaction.request.url.clone(),
        })
    }

    fn load(&self, href: &HistoryRef) -> Result<Transaction> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .records
            .get(&href.id)
            .map(|r| Transaction::clone(&r.transaction))
            .ok_or(PscanError::HistoryUnavailable(href.id))
    }

    fn is_in_scope(&self, href: &HistoryRef) -> bool {
        let scope = self.scope.read().unwrap_or_else(|e| e.into_inner());
        scope.iter().any(|re| re.is_match(&href.url))
    }

    fn tags(&self, id: u64) -> Vec<String> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .records
            .get(&id)
            .map(|r| r.tags.clone())
            .unwrap_or_default()
    }

    fn add_tag(&self, id: u64, tag: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let record = state
            .records
            .get_mut(&id)
            .ok_or(PscanError::HistoryUnavailable(id))?;
        record.tags.push(tag.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get(url: &str) -> HttpRequest {
        HttpRequest {
            method: "GET".to_string(),
            url: url.to_string(),
            ..HttpRequest::default()
        }
    }

    #[test]
    fn test_ids_are_monotonic_and_survive_purge() {
        let history = MemoryHistory::new();
        let a = history.record(HistoryKind::Proxied, get("http://a.test/"), None);
        let b = history.record(HistoryKind::Temporary, get("http://b.test/"), None);
        assert_eq!((a, b), (1, 2));
        assert!(history.purge(b));
        assert!(history.resolve(b).is_none());
        let c = history.record(HistoryKind::Proxied, get("http://c.test/"), None);
        assert_eq!(c, 3);
        assert_eq!(history.highest_committed_id(), 3);
    }

    #[test]
    fn test_scope_matching() {
        let history = MemoryHistory::new();
        history
            .set_scope(&["^https://app\\.test/".to_string()])
            .expect("scope");
        let inside = history.record(HistoryKind::Proxied, get("https://app.test/x"), None);
        let outside = history.record(HistoryKind::Proxied, get("https://other.test/"), None);
        let inside = history.resolve(inside).expect("inside");
        let outside = history.resolve(outside).expect("outside");
        assert!(history.is_in_scope(&inside));
        assert!(!history.is_in_scope(&outside));
    }

    #[test]
    fn test_load_after_purge_is_unavailable() {
        let history = MemoryHistory::new();
        let id = history.record(HistoryKind::Temporary, get("http://a.test/"), None);
        let href = history.resolve(id).expect("resolve");
        history.purge(id);
        assert!(matches!(
            history.load(&href),
            Err(PscanError::HistoryUnavailable(1))
        ));
    }
}
