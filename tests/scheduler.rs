//! Daemon behaviour driven step by step through the scheduler.

mod helpers;

use chrono::Duration;
use dnsmon::{
    app::Launch,
    history::{HistoryDocument, MeasurementStatus, FAILED_RESPONSE_TIME_MS},
    lease::Lease,
    probe::{test_utils::FakeProbe, ProbeError},
    scheduler::{LoopState, Step},
    signals::ControlIntent,
    slow_query::SlowQueryDocument,
    store,
};
use helpers::{start_time, TestEnv};

fn history(env: &TestEnv) -> HistoryDocument {
    store::read_json(&env.paths().history).unwrap().unwrap()
}

fn expect_cycle(step: Step) -> dnsmon::scheduler::CycleReport {
    match step {
        Step::Cycle(report) => report,
        other => panic!("expected a cycle, got {other:?}"),
    }
}

#[tokio::test]
async fn test_successful_measurement_is_recorded() {
    let env = TestEnv::new(FakeProbe::new());
    env.write_watch_list(&["8.8.8.8"], &["example.com"]);
    env.probe.add_success("8.8.8.8", "example.com", 42.3);

    let mut app = env.app().await;
    let report = expect_cycle(app.scheduler().step().await);

    assert_eq!(report.cycle_id, start_time());
    assert!(report.persisted);
    assert_eq!(report.slow_queries, 0);

    let doc = history(&env);
    assert_eq!(doc.metadata.current_cycle_id, Some(report.cycle_id));
    assert_eq!(doc.metadata.schema_version, "2.0");
    assert_eq!(doc.tests.len(), 1);
    let record = &doc.tests[0];
    assert_eq!(record.server, "8.8.8.8");
    assert_eq!(record.domain, "example.com");
    assert_eq!(record.response_time_ms, 42.3);
    assert_eq!(record.status, MeasurementStatus::Success);
    assert_eq!(record.cycle_id, report.cycle_id);

    assert!(!env.paths().slow_queries.exists());
}

#[tokio::test]
async fn test_failed_measurement_uses_sentinel() {
    let env = TestEnv::new(FakeProbe::new());
    env.write_watch_list(&["192.0.2.1"], &["example.com"]);
    env.probe.add_failure(
        "192.0.2.1",
        "example.com",
        ProbeError::Timeout("no answer".to_string()),
    );

    let mut app = env.app().await;
    expect_cycle(app.scheduler().step().await);

    let doc = history(&env);
    assert_eq!(doc.tests.len(), 1);
    assert_eq!(doc.tests[0].status, MeasurementStatus::Failed);
    assert_eq!(doc.tests[0].response_time_ms, FAILED_RESPONSE_TIME_MS);
    assert_eq!(env.probe.call_count("192.0.2.1", "example.com"), 1);
    assert!(!env.paths().slow_queries.exists());
}

#[tokio::test]
async fn test_slow_measurement_is_logged() {
    let env = TestEnv::new(FakeProbe::new());
    env.write_watch_list(&["8.8.8.8"], &["example.com"]);
    env.probe.add_success("8.8.8.8", "example.com", 1500.0);

    let mut app = env.app().await;
    let report = expect_cycle(app.scheduler().step().await);
    assert_eq!(report.slow_queries, 1);

    let slow: SlowQueryDocument = store::read_json(&env.paths().slow_queries)
        .unwrap()
        .unwrap();
    assert_eq!(slow.queries.len(), 1);
    assert_eq!(slow.queries[0].server, "8.8.8.8");
    assert_eq!(slow.queries[0].domain, "example.com");
    assert_eq!(slow.queries[0].response_time_ms, 1500.0);
    assert_eq!(slow.queries[0].timestamp, start_time());
}

#[tokio::test]
async fn test_threshold_itself_is_not_slow() {
    let env = TestEnv::new(FakeProbe::new());
    env.write_watch_list(&["8.8.8.8"], &["example.com"]);
    env.probe.add_success("8.8.8.8", "example.com", 1000.0);

    let mut app = env.app().await;
    let report = expect_cycle(app.scheduler().step().await);
    assert_eq!(report.slow_queries, 0);
    assert!(!env.paths().slow_queries.exists());
}

#[tokio::test]
async fn test_every_pair_is_measured_in_order() {
    let env = TestEnv::new(FakeProbe::with_default(Ok(10.0)));
    env.write_watch_list(&["8.8.8.8", "1.1.1.1"], &["example.com", "example.org", "example.net"]);

    let mut app = env.app().await;
    let report = expect_cycle(app.scheduler().step().await);

    assert_eq!(report.records.len(), 6);
    assert_eq!(history(&env).tests.len(), 6);
    let calls = env.probe.calls();
    assert_eq!(
        calls[..3],
        [
            ("8.8.8.8".to_string(), "example.com".to_string()),
            ("8.8.8.8".to_string(), "example.org".to_string()),
            ("8.8.8.8".to_string(), "example.net".to_string()),
        ]
    );
    assert!(report.records.iter().all(|r| r.cycle_id == report.cycle_id));
}

#[tokio::test]
async fn test_idle_until_interval_elapses() {
    let env = TestEnv::new(FakeProbe::with_default(Ok(10.0)));
    env.write_watch_list(&["8.8.8.8"], &["example.com"]);

    let mut app = env.app().await;
    let first = expect_cycle(app.scheduler().step().await);
    assert_eq!(app.scheduler().state(), LoopState::IdleWait);

    assert_eq!(app.scheduler().step().await, Step::Idle);
    env.clock.advance(Duration::seconds(59));
    assert_eq!(app.scheduler().step().await, Step::Idle);

    env.clock.advance(Duration::seconds(1));
    let second = expect_cycle(app.scheduler().step().await);
    assert!(second.cycle_id > first.cycle_id);
    assert_eq!(history(&env).tests.len(), 2);
}

#[tokio::test]
async fn test_forced_cycle_gets_a_distinct_id() {
    let env = TestEnv::new(FakeProbe::with_default(Ok(10.0)));
    env.write_watch_list(&["8.8.8.8"], &["example.com"]);

    let mut app = env.app().await;
    let first = expect_cycle(app.scheduler().step().await);

    env.control.apply(ControlIntent::ForceCycle);
    let forced = expect_cycle(app.scheduler().step().await);
    assert!(forced.cycle_id > first.cycle_id);

    // The force was consumed.
    assert_eq!(app.scheduler().step().await, Step::Idle);

    let doc = history(&env);
    assert_eq!(doc.metadata.current_cycle_id, Some(forced.cycle_id));
    assert_eq!(doc.current_cycle().len(), 1);
}

#[tokio::test]
async fn test_reload_picks_up_new_watch_list() {
    let env = TestEnv::new(FakeProbe::with_default(Ok(10.0)));
    env.write_watch_list(&["8.8.8.8"], &["example.com"]);

    let mut app = env.app().await;
    expect_cycle(app.scheduler().step().await);

    env.write_watch_list(&["8.8.8.8", "9.9.9.9"], &["example.com"]);

    // Without a reload the cached list is still used.
    env.control.apply(ControlIntent::ForceCycle);
    let cached = expect_cycle(app.scheduler().step().await);
    assert_eq!(cached.records.len(), 1);

    env.control.apply(ControlIntent::Reload);
    env.control.apply(ControlIntent::ForceCycle);
    let reloaded = expect_cycle(app.scheduler().step().await);
    assert_eq!(reloaded.records.len(), 2);
    assert_eq!(env.probe.call_count("9.9.9.9", "example.com"), 1);
}

#[tokio::test]
async fn test_empty_watch_list_skips_without_consuming_the_interval() {
    let env = TestEnv::new(FakeProbe::with_default(Ok(10.0)));

    let mut app = env.app().await;
    assert_eq!(app.scheduler().step().await, Step::Skipped);
    assert!(env.probe.calls().is_empty());
    assert!(history(&env).tests.is_empty());

    env.write_watch_list(&["8.8.8.8"], &["example.com"]);
    env.control.apply(ControlIntent::Reload);

    // No time has passed, yet the cycle runs: the skip did not count.
    let report = expect_cycle(app.scheduler().step().await);
    assert_eq!(report.records.len(), 1);
}

#[tokio::test]
async fn test_servers_without_domains_is_empty() {
    let env = TestEnv::new(FakeProbe::with_default(Ok(10.0)));
    env.write_watch_list(&["8.8.8.8"], &[]);

    let mut app = env.app().await;
    assert_eq!(app.scheduler().step().await, Step::Skipped);
}

#[tokio::test]
async fn test_oversized_history_is_rotated() {
    let mut env = TestEnv::new(FakeProbe::with_default(Ok(10.0)));
    env.config.history.max_bytes = 1500;
    env.config.history.target_bytes = 1000;
    env.config.history.min_records = 3;
    env.write_watch_list(&["8.8.8.8", "1.1.1.1"], &["example.com", "example.org"]);

    let mut app = env.app().await;
    let mut rotated = false;
    let mut last = None;
    for _ in 0..10 {
        env.control.apply(ControlIntent::ForceCycle);
        let report = expect_cycle(app.scheduler().step().await);
        rotated |= report.rotation.is_some();
        last = Some(report.cycle_id);
    }

    assert!(rotated);
    let doc = history(&env);
    assert!(doc.tests.len() >= 3);
    assert!(doc.tests.len() < 40);
    assert_eq!(doc.tests.last().map(|r| r.cycle_id), last);
    assert_eq!(doc.metadata.current_cycle_id, last);
}

#[tokio::test]
async fn test_cycle_ids_resume_after_restart() {
    let env = TestEnv::new(FakeProbe::with_default(Ok(10.0)));
    env.write_watch_list(&["8.8.8.8"], &["example.com"]);

    let first = {
        let mut app = env.app().await;
        expect_cycle(app.scheduler().step().await).cycle_id
    };

    // A clock stepped backwards must not reuse or reorder ids.
    env.clock.set(start_time() - Duration::hours(1));
    let mut app = env.app().await;
    let second = expect_cycle(app.scheduler().step().await).cycle_id;
    assert!(second > first);
}

#[tokio::test]
async fn test_shutdown_stops_loop_and_releases_lease() {
    let env = TestEnv::new(FakeProbe::with_default(Ok(10.0)));
    env.write_watch_list(&["8.8.8.8"], &["example.com"]);

    let app = env.app().await;
    assert!(env.paths().pid_file.exists());

    let control = env.control.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        control.apply(ControlIntent::Shutdown);
    });

    tokio::time::timeout(std::time::Duration::from_secs(5), app.run())
        .await
        .expect("daemon did not stop")
        .unwrap();

    assert!(!env.paths().pid_file.exists());
    assert_eq!(history(&env).tests.len(), 1);
}

#[tokio::test]
async fn test_missing_tool_aborts_startup() {
    let env = TestEnv::new(FakeProbe::new().unavailable());

    assert!(env.launch().await.is_err());
    assert!(!env.paths().pid_file.exists());
    assert!(!env.paths().history.exists());
}

#[tokio::test]
async fn test_second_instance_exits_quietly() {
    let env = TestEnv::new(FakeProbe::with_default(Ok(10.0)));
    let _held = Lease::acquire(&env.paths().pid_file).unwrap();

    assert!(matches!(env.launch().await.unwrap(), Launch::AlreadyRunning));
    assert!(env.probe.calls().is_empty());
    assert!(env.paths().pid_file.exists());
}
