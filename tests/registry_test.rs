//! Integration tests for the task registry: alert cap, tagging, shutdown

mod common;

use argos_pscan::alerts::MemoryAlertStore;
use argos_pscan::config::OptionsHandle;
use argos_pscan::history::{HistoryLog, MemoryHistory};
use argos_pscan::models::{AlertSource, Finding, HistoryKind, Severity};
use argos_pscan::pscan::{ApplicableKinds, ScanMetrics, ScanTask, TaskRegistry};
use argos_pscan::rules::{RuleCatalog, ScanActions};
use common::*;
use std::sync::Arc;

struct Fixture {
    history: MemoryHistory,
    alerts: MemoryAlertStore,
    registry: Arc<TaskRegistry>,
}

fn fixture(max_alerts: u32) -> Fixture {
    let history = MemoryHistory::new();
    let alerts = MemoryAlertStore::new();
    let catalog = Arc::new(
        RuleCatalog::with_rules(vec![Arc::new(AlertingRule(7))]).expect("catalog"),
    );
    let mut options = test_options(1);
    options.max_alerts_per_rule = max_alerts;
    let registry = Arc::new(TaskRegistry::new(
        catalog,
        Arc::new(ApplicableKinds::new()),
        Arc::new(history.clone()),
        Arc::new(alerts.clone()),
        OptionsHandle::new(options),
        Arc::new(ScanMetrics::new()),
    ));
    Fixture {
        history,
        alerts,
        registry,
    }
}

fn finding(rule_id: u32) -> Finding {
    let mut f = Finding::new("t", "d", Severity::Low, "Test", "");
    f.rule_id = Some(rule_id);
    f
}

#[test]
fn test_alert_is_stamped_with_history_and_source() {
    let fx = fixture(0);
    let id = fx.history.record(
        HistoryKind::Proxied,
        get("http://app.test/x"),
        Some(html("")),
    );
    let tx = fx
        .history
        .load(&fx.history.resolve(id).expect("resolve"))
        .expect("load");

    fx.registry.raise_alert(&tx, finding(7));

    let findings = fx.alerts.findings();
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].history_id, Some(id));
    assert_eq!(findings[0].source, AlertSource::Passive);
    assert_eq!(findings[0].url, "http://app.test/x");
    assert_eq!(fx.registry.alert_count(7), 1);
}

#[test]
fn test_alert_cap_disables_rule_after_crossing_alert() {
    let fx = fixture(2);
    let tx = transaction(get("http://app.test/"), None);
    let entry = fx.registry.catalog().scan_rule_by_id(7).expect("entry");

    fx.registry.raise_alert(&tx, finding(7));
    fx.registry.raise_alert(&tx, finding(7));
    assert!(entry.is_enabled(), "at the cap, not over it");

    fx.registry.raise_alert(&tx, finding(7));
    assert!(!entry.is_enabled());
    assert_eq!(fx.alerts.len(), 3, "the crossing alert is delivered");
    assert_eq!(fx.registry.metrics().snapshot().rules_auto_disabled, 1);
}

#[test]
fn test_alert_cap_end_to_end() {
    let mut options = test_options(1);
    options.max_alerts_per_rule = 2;
    let engine = Engine::new(vec![Arc::new(AlertingRule(7))], options);
    for i in 0..5 {
        engine.record(&format!("http://app.test/{i}"));
    }

    engine.scanner.start_at(1).expect("start");
    assert!(wait_until(|| engine.scanner.metrics().tasks_completed == 5));

    assert_eq!(engine.alerts.len(), 3);
    let rules = engine.scanner.rules();
    assert!(!rules[0].enabled);
}

#[test]
fn test_zero_cap_is_unlimited() {
    let fx = fixture(0);
    let tx = transaction(get("http://app.test/"), None);
    for _ in 0..50 {
        fx.registry.raise_alert(&tx, finding(7));
    }
    assert_eq!(fx.alerts.len(), 50);
    assert!(fx
        .registry
        .catalog()
        .scan_rule_by_id(7)
        .expect("entry")
        .is_enabled());
}

#[test]
fn test_history_tag_added_once() {
    let fx = fixture(0);
    let id = fx
        .history
        .record(HistoryKind::Proxied, get("http://app.test/"), None);
    let mut tx = transaction(get("http://app.test/"), None);
    tx.history_id = id;

    fx.registry.add_history_tag(&tx, "FORM");
    fx.registry.add_history_tag(&tx, "FORM");
    fx.registry.add_history_tag(&tx, "SCRIPT");

    assert_eq!(
        fx.history.tags(id),
        vec!["FORM".to_string(), "SCRIPT".to_string()]
    );
}

#[test]
fn test_tagging_purged_record_is_ignored() {
    let fx = fixture(0);
    let id = fx
        .history
        .record(HistoryKind::Temporary, get("http://app.test/"), None);
    fx.history.purge(id);
    let mut tx = transaction(get("http://app.test/"), None);
    tx.history_id = id;

    fx.registry.add_history_tag(&tx, "FORM");
    assert!(fx.history.tags(id).is_empty());
}

#[test]
fn test_no_alerts_or_tags_after_shutdown() {
    let fx = fixture(0);
    let id = fx
        .history
        .record(HistoryKind::Proxied, get("http://app.test/"), None);
    let mut tx = transaction(get("http://app.test/"), None);
    tx.history_id = id;

    fx.registry.request_shutdown();
    assert!(fx.registry.is_shutdown());

    let actions: &dyn ScanActions = fx.registry.as_ref();
    actions.raise_alert(&tx, finding(7));
    actions.add_history_tag(&tx, "FORM");

    assert!(fx.alerts.is_empty());
    assert!(fx.history.tags(id).is_empty());
    assert_eq!(fx.registry.metrics().snapshot().alerts_dropped_shutdown, 1);
}

#[test]
fn test_task_created_after_shutdown_runs_no_rules() {
    let fx = fixture(0);
    let id = fx.history.record(
        HistoryKind::Proxied,
        get("http://app.test/late"),
        Some(html("late")),
    );

    fx.registry.request_shutdown();
    let href = fx.history.resolve(id).expect("resolve");
    let task = ScanTask::new(href, Arc::clone(&fx.registry));
    assert!(!task.is_shutdown_requested());
    task.run();

    assert!(task.is_completed());
    assert!(fx.registry.running_tasks().is_empty());
    assert!(fx.alerts.is_empty());
    let metrics = fx.registry.metrics().snapshot();
    assert_eq!(metrics.rule_invocations, 0);
    assert_eq!(metrics.alerts_dropped_shutdown, 0);
}
