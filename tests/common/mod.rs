//! Common test utilities
#![allow(dead_code)]

use argos_pscan::alerts::MemoryAlertStore;
use argos_pscan::config::PassiveScanOptions;
use argos_pscan::error::{PscanError, Result};
use argos_pscan::history::MemoryHistory;
use argos_pscan::models::{Finding, HistoryKind, HttpRequest, HttpResponse, Severity, Transaction};
use argos_pscan::pscan::PassiveScanner;
use argos_pscan::rules::{PassiveScanRule, ResponseBody, RuleCatalog, RuleContext, RuleId};
use crossbeam_channel::{Receiver, Sender};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub fn get(url: &str) -> HttpRequest {
    HttpRequest {
        method: "GET".to_string(),
        url: url.to_string(),
        headers: vec![("Host".to_string(), "app.test".to_string())],
        body: Vec::new(),
    }
}

pub fn html(body: &str) -> HttpResponse {
    HttpResponse {
        status: 200,
        headers: vec![("Content-Type".to_string(), "text/html".to_string())],
        body: body.as_bytes().to_vec(),
        from_target: true,
    }
}

pub fn with_header(mut response: HttpResponse, name: &str, value: &str) -> HttpResponse {
    response.headers.push((name.to_string(), value.to_string()));
    response
}

pub fn transaction(request: HttpRequest, response: Option<HttpResponse>) -> Transaction {
    Transaction {
        history_id: 1,
        kind: HistoryKind::Proxied,
        recorded_at: chrono::Utc::now(),
        request,
        response,
    }
}

/// Fast-polling options for tests
pub fn test_options(threads: usize) -> PassiveScanOptions {
    PassiveScanOptions {
        threads,
        poll_interval_ms: 20,
        ..PassiveScanOptions::default()
    }
}

pub fn wait_until(mut f: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

/// History, alert store and scanner wired together
pub struct Engine {
    pub history: MemoryHistory,
    pub alerts: MemoryAlertStore,
    pub scanner: PassiveScanner,
}

impl Engine {
    pub fn new(rules: Vec<Arc<dyn PassiveScanRule>>, options: PassiveScanOptions) -> Self {
        let history = MemoryHistory::new();
        let alerts = MemoryAlertStore::new();
        let catalog = Arc::new(RuleCatalog::with_rules(rules).expect("catalog"));
        let scanner = PassiveScanner::new(
            Arc::new(history.clone()),
            Arc::new(alerts.clone()),
            catalog,
            options,
        )
        .expect("scanner");
        Self {
            history,
            alerts,
            scanner,
        }
    }

    pub fn record(&self, url: &str) -> u64 {
        self.history
            .record(HistoryKind::Proxied, get(url), Some(html("<p>hello</p>")))
    }

    pub fn wait_idle(&self) -> bool {
        wait_until(|| self.scanner.records_to_scan() == 0)
    }
}

/// Records which history ids it saw and which phases ran
#[derive(Clone, Default)]
pub struct Seen {
    pub requests: Arc<Mutex<Vec<u64>>>,
    pub responses: Arc<Mutex<Vec<u64>>>,
}

impl Seen {
    pub fn requests(&self) -> Vec<u64> {
        let mut ids = self.requests.lock().expect("lock").clone();
        ids.sort_unstable();
        ids
    }

    pub fn responses(&self) -> Vec<u64> {
        let mut ids = self.responses.lock().expect("lock").clone();
        ids.sort_unstable();
        ids
    }
}

pub struct CountingRule {
    pub id: RuleId,
    pub seen: Seen,
}

impl CountingRule {
    pub fn new(id: RuleId) -> (Self, Seen) {
        let seen = Seen::default();
        (
            Self {
                id,
                seen: seen.clone(),
            },
            seen,
        )
    }
}

impl PassiveScanRule for CountingRule {
    fn id(&self) -> RuleId {
        self.id
    }
    fn name(&self) -> &str {
        "counting"
    }
    fn scan_request(&self, tx: &Transaction, _ctx: &RuleContext<'_>) -> Result<()> {
        self.seen.requests.lock().expect("lock").push(tx.history_id);
        Ok(())
    }
    fn scan_response(
        &self,
        tx: &Transaction,
        _body: &ResponseBody<'_>,
        _ctx: &RuleContext<'_>,
    ) -> Result<()> {
        self.seen.responses.lock().expect("lock").push(tx.history_id);
        Ok(())
    }
}

/// Raises one alert per response
pub struct AlertingRule(pub RuleId);

impl PassiveScanRule for AlertingRule {
    fn id(&self) -> RuleId {
        self.0
    }
    fn name(&self) -> &str {
        "alerting"
    }
    fn scan_response(
        &self,
        tx: &Transaction,
        _body: &ResponseBody<'_>,
        ctx: &RuleContext<'_>,
    ) -> Result<()> {
        ctx.raise(Finding::new(
            "Test finding",
            "raised by a test rule",
            Severity::Low,
            "Test",
            tx.url(),
        ));
        Ok(())
    }
}

pub struct FailingRule(pub RuleId);

impl PassiveScanRule for FailingRule {
    fn id(&self) -> RuleId {
        self.0
    }
    fn name(&self) -> &str {
        "failing"
    }
    fn scan_request(&self, _tx: &Transaction, _ctx: &RuleContext<'_>) -> Result<()> {
        Err(PscanError::rule_failed("failing", "always fails"))
    }
}

pub struct PanickingRule(pub RuleId);

impl PassiveScanRule for PanickingRule {
    fn id(&self) -> RuleId {
        self.0
    }
    fn name(&self) -> &str {
        "panicking"
    }
    fn scan_response(
        &self,
        _tx: &Transaction,
        _body: &ResponseBody<'_>,
        _ctx: &RuleContext<'_>,
    ) -> Result<()> {
        panic!("rule bug");
    }
}

/// Blocks in the request phase until released, on URLs containing
/// `pattern`. Raises an alert after being released.
pub struct BlockingRule {
    pub id: RuleId,
    pub pattern: String,
    pub started: Arc<AtomicUsize>,
    pub release: Receiver<()>,
}

pub struct BlockingHandle {
    pub started: Arc<AtomicUsize>,
    release: Sender<()>,
}

impl BlockingHandle {
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    /// Lets exactly one blocked invocation through, waiting for one if
    /// none is blocked yet
    pub fn release_one(&self) {
        let _ = self.release.send(());
    }

    /// Lets every blocked and future invocation through
    pub fn release_all(self) {
        drop(self.release);
    }
}

impl BlockingRule {
    pub fn new(id: RuleId) -> (Self, BlockingHandle) {
        Self::matching(id, "")
    }

    pub fn matching(id: RuleId, pattern: &str) -> (Self, BlockingHandle) {
        let (tx, rx) = crossbeam_channel::bounded::<()>(0);
        let started = Arc::new(AtomicUsize::new(0));
        (
            Self {
                id,
                pattern: pattern.to_string(),
                started: Arc::clone(&started),
                release: rx,
            },
            BlockingHandle {
                started,
                release: tx,
            },
        )
    }
}

impl PassiveScanRule for BlockingRule {
    fn id(&self) -> RuleId {
        self.id
    }
    fn name(&self) -> &str {
        "blocking"
    }
    fn scan_request(&self, tx: &Transaction, ctx: &RuleContext<'_>) -> Result<()> {
        if !tx.url().contains(&self.pattern) {
            return Ok(());
        }
        self.started.fetch_add(1, Ordering::SeqCst);
        // returns Err once the sender is dropped
        let _ = self.release.recv();
        ctx.raise(Finding::new(
            "Blocked finding",
            "raised after release",
            Severity::Info,
            "Test",
            tx.url(),
        ));
        Ok(())
    }
}
