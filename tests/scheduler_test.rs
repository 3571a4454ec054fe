//! Integration tests for the passive scan scheduler

mod common;

use argos_pscan::error::PscanError;
use argos_pscan::models::HistoryKind;
use argos_pscan::pscan::TaskState;
use argos_pscan::history::HistoryLog;
use common::*;
use std::sync::Arc;
use std::time::Duration;

#[test]
fn test_each_record_scanned_exactly_once() {
    let (rule, seen) = CountingRule::new(1);
    let engine = Engine::new(vec![Arc::new(rule)], test_options(3));
    for i in 0..5 {
        engine.record(&format!("http://app.test/{i}"));
    }

    engine.scanner.start_at(1).expect("start");
    assert!(wait_until(|| seen.requests().len() == 5));
    // give a double dispatch a chance to show up
    std::thread::sleep(Duration::from_millis(100));

    assert_eq!(seen.requests(), vec![1, 2, 3, 4, 5]);
    assert_eq!(seen.responses(), vec![1, 2, 3, 4, 5]);
    assert!(wait_until(|| engine.scanner.metrics().tasks_completed == 5));
    assert_eq!(engine.scanner.metrics().tasks_submitted, 5);
    assert_eq!(engine.scanner.records_to_scan(), 0);
}

#[test]
fn test_start_skips_existing_history() {
    let (rule, seen) = CountingRule::new(1);
    let engine = Engine::new(vec![Arc::new(rule)], test_options(1));
    engine.record("http://app.test/old-1");
    engine.record("http://app.test/old-2");

    engine.scanner.start().expect("start");
    assert_eq!(engine.scanner.high_water_mark(), 2);

    engine.record("http://app.test/new");
    engine.scanner.notify_new_transaction();

    assert!(wait_until(|| seen.requests() == vec![3]));
    assert!(engine.wait_idle());
    assert_eq!(engine.scanner.high_water_mark(), 3);
    assert_eq!(engine.scanner.metrics().high_water_mark, 3);
}

#[test]
fn test_records_arriving_while_running_are_picked_up() {
    let (rule, seen) = CountingRule::new(1);
    let engine = Engine::new(vec![Arc::new(rule)], test_options(2));
    engine.scanner.start().expect("start");
    let waker = engine.scanner.waker();

    for i in 0..20 {
        engine.record(&format!("http://app.test/{i}"));
        waker.notify();
    }

    assert!(wait_until(|| seen.requests().len() == 20));
    assert_eq!(seen.requests(), (1..=20).collect::<Vec<u64>>());
}

#[test]
fn test_purged_temporary_record_is_skipped() {
    let (rule, seen) = CountingRule::new(1);
    let engine = Engine::new(vec![Arc::new(rule)], test_options(1));
    engine.record("http://app.test/1");
    let temp = engine
        .history
        .record(HistoryKind::Temporary, get("http://app.test/2"), None);
    engine.record("http://app.test/3");
    assert!(engine.history.purge(temp));

    engine.scanner.start_at(1).expect("start");

    assert!(wait_until(|| seen.requests().len() == 2));
    assert!(engine.wait_idle());
    assert_eq!(seen.requests(), vec![1, 3]);
    assert_eq!(engine.scanner.metrics().tasks_submitted, 2);
}

#[test]
fn test_backlog_counts_pending_records_and_tasks() {
    let (rule, handle) = BlockingRule::new(1);
    let engine = Engine::new(vec![Arc::new(rule)], test_options(1));
    for i in 0..3 {
        engine.record(&format!("http://app.test/{i}"));
    }
    assert_eq!(engine.scanner.records_to_scan(), 0, "not started yet");

    engine.scanner.start_at(1).expect("start");
    assert!(wait_until(|| handle.started() == 1));
    // one running plus two queued, nothing left unconsidered
    assert!(wait_until(|| engine.scanner.current_tasks().len() == 3
        && engine.scanner.records_to_scan() == 3));

    let oldest = engine.scanner.current_rule().expect("a task is running");
    assert_eq!(oldest.history_id, 1);
    assert_eq!(oldest.rule, "blocking");
    assert_eq!(oldest.state, TaskState::Running);

    // the backlog only shrinks while tasks finish one by one
    let mut last = engine.scanner.records_to_scan();
    assert_eq!(last, 3);
    for expected in [2, 1, 0] {
        handle.release_one();
        assert!(wait_until(|| {
            let now = engine.scanner.records_to_scan();
            assert!(now <= last, "backlog grew from {last} to {now}");
            last = now;
            now == expected
        }));
    }
    assert!(engine.wait_idle());
    assert!(engine.scanner.current_rule().is_none());
    assert_eq!(engine.alerts.len(), 3);
}

#[test]
fn test_backlog_beyond_queue_waits_for_room() {
    let (rule, handle) = BlockingRule::new(1);
    let engine = Engine::new(vec![Arc::new(rule)], test_options(1));
    for i in 0..10 {
        engine.record(&format!("http://app.test/{i}"));
    }

    engine.scanner.start_at(1).expect("start");
    assert!(wait_until(|| handle.started() == 1));
    // one worker holds one running and two queued tasks
    assert!(wait_until(|| engine.scanner.metrics().queue_full_retries > 0));
    assert_eq!(engine.scanner.current_tasks().len(), 3);
    assert_eq!(engine.scanner.metrics().tasks_submitted, 3);
    assert_eq!(engine.scanner.records_to_scan(), 10);

    handle.release_all();
    assert!(engine.wait_idle());
    assert_eq!(engine.alerts.len(), 10);
    let metrics = engine.scanner.metrics();
    assert_eq!(metrics.tasks_submitted, 10);
    assert_eq!(metrics.submission_failures, 0);
}

#[test]
fn test_resize_applies_to_existing_backlog() {
    let (rule, handle) = BlockingRule::new(1);
    let engine = Engine::new(vec![Arc::new(rule)], test_options(1));
    for i in 0..10 {
        engine.record(&format!("http://app.test/{i}"));
    }

    engine.scanner.start_at(1).expect("start");
    assert!(wait_until(|| handle.started() == 1));
    assert!(wait_until(|| engine.scanner.metrics().queue_full_retries > 0));
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(handle.started(), 1, "one worker is all there is");

    // records still waiting go to a three thread pool
    engine.scanner.set_thread_count(3).expect("threads");
    assert!(wait_until(|| handle.started() == 4));
    assert_eq!(engine.scanner.records_to_scan(), 10);

    handle.release_all();
    assert!(engine.wait_idle());
    assert_eq!(engine.alerts.len(), 10);
    assert_eq!(engine.scanner.metrics().tasks_submitted, 10);
}

#[test]
fn test_no_alerts_after_shutdown() {
    let (rule, handle) = BlockingRule::new(1);
    let engine = Engine::new(vec![Arc::new(rule)], test_options(1));
    engine.record("http://app.test/1");
    engine.record("http://app.test/2");

    engine.scanner.start_at(1).expect("start");
    assert!(wait_until(|| handle.started() == 1));

    engine.scanner.shutdown();
    handle.release_all();

    assert!(engine.scanner.await_termination(Duration::from_secs(5)));
    assert!(engine.alerts.is_empty());
    let metrics = engine.scanner.metrics();
    assert_eq!(metrics.alerts_dropped_shutdown, 1);
    assert_eq!(metrics.rule_invocations, 1, "queued task stops before its rules");
}

#[test]
fn test_await_termination_reports_stuck_rule() {
    let (rule, handle) = BlockingRule::new(1);
    let engine = Engine::new(vec![Arc::new(rule)], test_options(1));
    engine.record("http://app.test/1");
    engine.scanner.start_at(1).expect("start");
    assert!(wait_until(|| handle.started() == 1));

    engine.scanner.shutdown();
    assert!(!engine.scanner.await_termination(Duration::from_millis(100)));

    handle.release_all();
    assert!(engine.scanner.await_termination(Duration::from_secs(5)));
}

#[test]
fn test_start_after_shutdown_fails() {
    let engine = Engine::new(Vec::new(), test_options(1));
    engine.scanner.shutdown();
    assert!(matches!(
        engine.scanner.start(),
        Err(PscanError::ConfigError(_))
    ));
}

#[test]
fn test_clear_queue_skips_unstarted_tasks() {
    let (blocking, handle) = BlockingRule::new(1);
    let (counting, seen) = CountingRule::new(2);
    let engine = Engine::new(
        vec![Arc::new(blocking), Arc::new(counting)],
        test_options(1),
    );
    for i in 0..3 {
        engine.record(&format!("http://app.test/{i}"));
    }
    engine.scanner.start_at(1).expect("start");
    assert!(wait_until(|| handle.started() == 1));
    assert!(wait_until(|| engine.scanner.current_tasks().len() == 3));

    engine.scanner.clear_queue();
    handle.release_all();

    assert!(engine.wait_idle());
    assert_eq!(seen.requests(), vec![1], "only the running task finishes");

    // new traffic after the clear is scanned again
    engine.record("http://app.test/after");
    engine.scanner.notify_new_transaction();
    assert!(wait_until(|| seen.requests() == vec![1, 4]));
}

#[test]
fn test_out_of_scope_records_skipped_when_scope_only() {
    let (rule, seen) = CountingRule::new(1);
    let mut options = test_options(1);
    options.scan_only_in_scope = true;
    let engine = Engine::new(vec![Arc::new(rule)], options);
    engine
        .history
        .set_scope(&["^http://in\\.test/".to_string()])
        .expect("scope");

    engine.record("http://in.test/a");
    engine.record("http://out.test/b");
    engine.record("http://in.test/c");

    engine.scanner.start_at(1).expect("start");
    assert!(wait_until(|| seen.requests().len() == 2));
    assert!(engine.wait_idle());
    assert_eq!(seen.requests(), vec![1, 3]);

    engine.scanner.set_scan_only_in_scope(false).expect("update");
    engine.record("http://out.test/d");
    engine.scanner.notify_new_transaction();
    assert!(wait_until(|| seen.requests() == vec![1, 3, 4]));
}

#[test]
fn test_thread_count_change_applies_to_new_pool() {
    let (blocking, handle) = BlockingRule::matching(1, "/block");
    let (counting, seen) = CountingRule::new(2);
    let engine = Engine::new(
        vec![Arc::new(blocking), Arc::new(counting)],
        test_options(1),
    );
    engine.scanner.start().expect("start");

    engine.record("http://app.test/warmup");
    engine.scanner.notify_new_transaction();
    assert!(wait_until(|| seen.requests() == vec![1]));

    engine.scanner.set_thread_count(3).expect("threads");
    assert_eq!(engine.scanner.options().threads, 3);
    for i in 0..3 {
        engine.record(&format!("http://app.test/block/{i}"));
    }
    engine.scanner.notify_new_transaction();

    // three rules blocked at once needs three workers
    assert!(wait_until(|| handle.started() == 3));
    handle.release_all();
    assert!(engine.wait_idle());
    assert_eq!(seen.requests(), vec![1, 2, 3, 4]);
    assert_eq!(engine.alerts.len(), 3);
}

#[test]
fn test_zero_thread_count_rejected() {
    let engine = Engine::new(Vec::new(), test_options(2));
    assert!(matches!(
        engine.scanner.set_thread_count(0),
        Err(PscanError::ConfigError(_))
    ));
    assert_eq!(engine.scanner.options().threads, 2);
}

#[test]
fn test_high_water_mark_never_moves_backwards() {
    let engine = Engine::new(Vec::new(), test_options(1));
    engine.record("http://app.test/1");
    engine.record("http://app.test/2");
    engine.scanner.start_at(1).expect("start");
    assert!(engine.wait_idle());
    let mark = engine.scanner.high_water_mark();
    assert_eq!(mark, 2);
    engine.history.purge(2);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(engine.scanner.high_water_mark(), mark);
    assert_eq!(engine.history.highest_committed_id(), 2);
}
