//! Integration tests for `Harness::run`.
//!
//! Covers the scoped-acquisition guarantees:
//! 1. Scenarios only ever see ready containers
//! 2. Every started container is disposed exactly once, on every exit path
//! 3. Errors are reported in setup, scenario, disposal priority
//! 4. Lifecycle events reach subscribers

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use berth_common::config::HarnessConfig;
use berth_common::error::BerthError;
use berth_common::types::{ContainerState, LogStream};
use berth_runtime::backend::simulated::{SimulatedImage, SimulatedRuntime};
use berth_runtime::logs;
use berth_sdk::event::ContainerEvent;
use berth_sdk::harness::Harness;
use berth_sdk::{ContainerDefinition, WaitStrategy};
use futures::FutureExt;

fn runtime() -> SimulatedRuntime {
    SimulatedRuntime::new()
        .with_image(
            "web",
            SimulatedImage::new().serve_http_after(80, Duration::from_millis(50), 200),
        )
        .with_image(
            "worker",
            SimulatedImage::new().log_after(Duration::from_millis(100), LogStream::Stdout, "worker ready"),
        )
        .with_image("crash", SimulatedImage::new().exit_after(Duration::from_millis(20), 3))
        .with_image("silent", SimulatedImage::new())
        .with_image(
            "db",
            SimulatedImage::new().exec_succeeds_after(Duration::from_millis(150)),
        )
}

fn harness(runtime: &SimulatedRuntime) -> Harness {
    Harness::new(Arc::new(runtime.clone()), HarnessConfig::default()).expect("harness")
}

fn web(name: &str) -> ContainerDefinition {
    ContainerDefinition::builder("web")
        .name(name)
        .port(80)
        .wait_for(WaitStrategy::http(80, "/"))
        .poll_interval(Duration::from_millis(25))
        .startup_timeout(Duration::from_secs(5))
        .build()
        .expect("web")
}

fn worker(name: &str) -> ContainerDefinition {
    ContainerDefinition::builder("worker")
        .name(name)
        .wait_for(WaitStrategy::log_message("worker ready", LogStream::Stdout))
        .poll_interval(Duration::from_millis(25))
        .startup_timeout(Duration::from_secs(5))
        .build()
        .expect("worker")
}

fn image(image: &str, name: &str, timeout: Duration) -> ContainerDefinition {
    ContainerDefinition::builder(image)
        .name(name)
        .port(9000)
        .wait_for(WaitStrategy::port_open(9000))
        .poll_interval(Duration::from_millis(25))
        .startup_timeout(timeout)
        .build()
        .expect("definition")
}

// ── Happy path ───────────────────────────────────────────────────────

#[tokio::test]
async fn scenario_sees_every_container_ready() {
    let runtime = runtime();
    let harness = harness(&runtime);

    let status = harness
        .run(vec![web("web-1"), worker("worker-1")], |ready| async move {
            assert_eq!(ready.len(), 2);
            let worker = ready.require("worker-1")?;
            assert!(worker.logs().contains(LogStream::Stdout, "worker ready"));
            assert!(worker.startup_duration() >= Duration::from_millis(100));

            let url = ready.require("web-1")?.endpoint(80)?.http_url("/");
            let response = reqwest::get(&url).await?;
            Ok::<_, Box<dyn std::error::Error + Send + Sync>>(response.status().as_u16())
        })
        .await
        .expect("run");

    assert_eq!(status, 200);
    assert_eq!(runtime.live_containers(), 0);
    assert_eq!(runtime.remove_calls("web-1"), 1);
    assert_eq!(runtime.remove_calls("worker-1"), 1);
    assert!(harness.context().ports().leased().is_empty());
}

#[tokio::test]
async fn ready_container_exec_runs_in_container() {
    let runtime = runtime();
    let harness = harness(&runtime);
    let db = ContainerDefinition::builder("db")
        .name("db-1")
        .wait_for(WaitStrategy::command(["pg_isready"]))
        .poll_interval(Duration::from_millis(25))
        .startup_timeout(Duration::from_secs(5))
        .build()
        .expect("db");

    let output = harness
        .run(vec![db], |ready| async move {
            ready.require("db-1")?.exec(&["psql", "-tAc", "SELECT 1"]).await
        })
        .await
        .expect("run");
    assert!(output.success());
    assert_eq!(runtime.live_containers(), 0);
}

// ── Failures ─────────────────────────────────────────────────────────

#[tokio::test]
async fn early_exit_aborts_setup_and_disposes_everything() {
    let runtime = runtime();
    let harness = harness(&runtime);
    let ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ran);

    let err = harness
        .run(
            vec![image("crash", "crash-1", Duration::from_secs(10)), worker("worker-2")],
            |_| async move {
                flag.store(true, Ordering::SeqCst);
                Ok::<_, BerthError>(())
            },
        )
        .await
        .expect_err("crash fails setup");

    assert!(
        matches!(err, BerthError::Failed { ref container, exit_code: Some(3), .. } if container == "crash-1"),
        "{err}"
    );
    assert!(!ran.load(Ordering::SeqCst));
    assert_eq!(runtime.remove_calls("crash-1"), 1);
    assert_eq!(runtime.remove_calls("worker-2"), 1);
    assert_eq!(runtime.live_containers(), 0);
}

#[tokio::test]
async fn timeout_is_reported_as_retryable() {
    let runtime = runtime();
    let harness = harness(&runtime);

    let err = harness
        .run(
            vec![image("silent", "silent-1", Duration::from_millis(200))],
            |_| async { Ok::<_, BerthError>(()) },
        )
        .await
        .expect_err("never ready");

    assert!(matches!(err, BerthError::TimedOut { .. }), "{err}");
    assert!(err.is_retryable());
    assert_eq!(runtime.live_containers(), 0);
}

#[tokio::test]
async fn unknown_image_is_a_start_error() {
    let runtime = runtime();
    let harness = harness(&runtime);

    let err = harness
        .run(
            vec![web("web-2"), image("missing", "missing-1", Duration::from_secs(1))],
            |_| async { Ok::<_, BerthError>(()) },
        )
        .await
        .expect_err("pull fails");

    assert!(matches!(err, BerthError::Start { .. }), "{err}");
    assert_eq!(runtime.remove_calls("missing-1"), 1);
    assert_eq!(runtime.remove_calls("web-2"), 1);
    assert!(harness.context().ports().leased().is_empty());
}

#[tokio::test]
async fn scenario_error_is_wrapped_and_containers_disposed() {
    let runtime = runtime();
    let harness = harness(&runtime);

    let err = harness
        .run(vec![worker("worker-3")], |_| async { Err::<(), _>("assertion failed: 3 rows") })
        .await
        .expect_err("scenario fails");

    let BerthError::Scenario { source } = err else {
        panic!("expected a scenario error");
    };
    assert_eq!(source.to_string(), "assertion failed: 3 rows");
    assert_eq!(runtime.remove_calls("worker-3"), 1);
}

#[tokio::test]
async fn scenario_panic_still_disposes() {
    let runtime = runtime();
    let harness = harness(&runtime);

    let explode = true;
    let run = harness.run(vec![worker("worker-4")], |_| async move {
        if explode {
            panic!("scenario blew up");
        }
        Ok::<(), BerthError>(())
    });
    let outcome = AssertUnwindSafe(run).catch_unwind().await;

    assert!(outcome.is_err());
    assert_eq!(runtime.remove_calls("worker-4"), 1);
    assert_eq!(runtime.live_containers(), 0);
}

#[tokio::test]
async fn shutdown_during_bring_up_disposes_started_containers() {
    let runtime = runtime();
    let harness = harness(&runtime);
    let ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ran);

    let began = std::time::Instant::now();
    let err = harness
        .run_until(
            vec![worker("worker-6"), image("silent", "silent-2", Duration::from_secs(10))],
            tokio::time::sleep(Duration::from_millis(200)),
            |_| async move {
                flag.store(true, Ordering::SeqCst);
                Ok::<_, BerthError>(())
            },
        )
        .await
        .expect_err("interrupted");

    assert!(matches!(err, BerthError::Interrupted), "{err}");
    assert!(began.elapsed() < Duration::from_secs(5));
    assert!(!ran.load(Ordering::SeqCst));
    assert_eq!(runtime.remove_calls("worker-6"), 1);
    assert_eq!(runtime.remove_calls("silent-2"), 1);
    assert_eq!(runtime.live_containers(), 0);
    assert!(harness.context().ports().leased().is_empty());
}

#[tokio::test]
async fn shutdown_is_not_watched_once_the_scenario_runs() {
    let runtime = runtime();
    let harness = harness(&runtime);

    let value = harness
        .run_until(
            vec![worker("worker-7")],
            tokio::time::sleep(Duration::from_millis(250)),
            |_| async {
                tokio::time::sleep(Duration::from_millis(400)).await;
                Ok::<_, BerthError>(7)
            },
        )
        .await
        .expect("run");

    assert_eq!(value, 7);
    assert_eq!(runtime.remove_calls("worker-7"), 1);
}

#[tokio::test]
async fn duplicate_names_fail_before_anything_starts() {
    let runtime = runtime();
    let harness = harness(&runtime);

    let err = harness
        .run(vec![worker("twin"), worker("twin")], |_| async { Ok::<_, BerthError>(()) })
        .await
        .expect_err("duplicate");

    assert!(matches!(err, BerthError::Configuration { .. }));
    assert!(runtime.created_names().is_empty());
}

#[tokio::test]
async fn failed_container_output_is_persisted() {
    let runtime = SimulatedRuntime::new().with_image(
        "noisy",
        SimulatedImage::new()
            .log_after(Duration::from_millis(10), LogStream::Stderr, "fatal: config missing")
            .exit_after(Duration::from_millis(40), 2),
    );
    let dir = tempfile::tempdir().expect("tempdir");
    let config = HarnessConfig {
        log_dir: Some(dir.path().to_path_buf()),
        ..HarnessConfig::default()
    };
    let harness = Harness::new(Arc::new(runtime.clone()), config).expect("harness");

    let err = harness
        .run(
            vec![image("noisy", "noisy-1", Duration::from_secs(5))],
            |_| async { Ok::<_, BerthError>(()) },
        )
        .await
        .expect_err("exits");

    assert!(matches!(err, BerthError::Failed { exit_code: Some(2), .. }), "{err}");
    let persisted = std::fs::read_to_string(logs::log_path(dir.path(), "noisy-1")).expect("log file");
    assert!(persisted.contains("fatal: config missing"), "{persisted}");
}

// ── Events ───────────────────────────────────────────────────────────

#[tokio::test]
async fn subscribers_see_each_container_reach_disposed() {
    let runtime = runtime();
    let harness = harness(&runtime);
    let mut events = harness.subscribe();

    harness
        .run(vec![web("web-3"), worker("worker-5")], |_| async { Ok::<_, BerthError>(()) })
        .await
        .expect("run");

    let events = events.drain();
    for name in ["web-3", "worker-5"] {
        let states: Vec<_> = events
            .iter()
            .filter_map(|event| match event {
                ContainerEvent::StateChange { container, to, .. } if container == name => Some(*to),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            [
                ContainerState::Starting,
                ContainerState::Running,
                ContainerState::Ready,
                ContainerState::Stopped,
                ContainerState::Disposed,
            ],
            "{name}"
        );
    }
}
