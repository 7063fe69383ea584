//! Startup and shutdown ordering across the dependency graph.

#![cfg(unix)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use process_compose::{
    Error, EventBus, ProbeKind, ProbeSettings, Reason, RestartPolicy, Scheduler, ServiceSpec,
    ServiceState, StatusBoard, SupervisorOptions, TransitionEvent,
};

fn spec_in(dir: &Path, name: &str, cmd: &[&str], deps: &[&str]) -> ServiceSpec {
    ServiceSpec {
        name: name.to_string(),
        work_dir: dir.join(name),
        start_cmd: cmd.iter().map(|s| s.to_string()).collect(),
        environment: HashMap::new(),
        log_redirect: false,
        log_dir: dir.join(name).join("logs"),
        log_max_size: 1024 * 1024,
        log_keep: 2,
        data_dir: dir.join(name),
        startup_delay: Duration::ZERO,
        depends_on: deps.iter().map(|s| s.to_string()).collect(),
        probe: None,
        restart: true,
    }
}

fn fast_opts() -> SupervisorOptions {
    SupervisorOptions {
        restart: RestartPolicy {
            backoff_base: Duration::from_millis(50),
            backoff_cap: Duration::from_millis(200),
            budget_max: 2,
            budget_window: Duration::from_secs(60),
        },
        liveness_tick: Duration::from_millis(100),
        stop_grace: Duration::from_secs(2),
    }
}

fn scheduler(
    specs: Vec<ServiceSpec>,
    opts: SupervisorOptions,
) -> (Arc<Scheduler>, broadcast::Receiver<TransitionEvent>) {
    let events = EventBus::new(1024);
    let rx = events.subscribe();
    let scheduler = Scheduler::new(
        specs,
        opts,
        StatusBoard::new(),
        events,
        CancellationToken::new(),
    )
    .unwrap();
    (Arc::new(scheduler), rx)
}

async fn collect_until<F>(
    rx: &mut broadcast::Receiver<TransitionEvent>,
    mut done: F,
) -> Vec<TransitionEvent>
where
    F: FnMut(&[TransitionEvent]) -> bool,
{
    let mut events = Vec::new();
    tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            match rx.recv().await {
                Ok(ev) => {
                    events.push(ev);
                    if done(&events) {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
    .await
    .expect("timed out waiting for events");
    events
}

/// Service names in order of their first transition into `state`.
fn first_order(events: &[TransitionEvent], state: ServiceState) -> Vec<String> {
    let mut seen = Vec::new();
    for ev in events {
        if ev.to == state && !seen.contains(&ev.service) {
            seen.push(ev.service.clone());
        }
    }
    seen
}

fn count_in(events: &[TransitionEvent], state: ServiceState) -> usize {
    first_order(events, state).len()
}

#[tokio::test]
async fn linear_chain_starts_in_order_and_stops_in_reverse() {
    let dir = TempDir::new().unwrap();
    let specs = vec![
        spec_in(dir.path(), "c", &["sleep", "30"], &["b"]),
        spec_in(dir.path(), "a", &["sleep", "30"], &[]),
        spec_in(dir.path(), "b", &["sleep", "30"], &["a"]),
    ];
    let (scheduler, mut rx) = scheduler(specs, fast_opts());

    scheduler.start_all().await.unwrap();
    let events = collect_until(&mut rx, |evs| count_in(evs, ServiceState::Healthy) == 3).await;
    assert_eq!(first_order(&events, ServiceState::Healthy), ["a", "b", "c"]);

    // A dependent may only start after its prerequisite first turned
    // healthy.
    let a_healthy = events
        .iter()
        .find(|ev| ev.service == "a" && ev.to == ServiceState::Healthy)
        .unwrap();
    let b_starting = events
        .iter()
        .find(|ev| ev.service == "b" && ev.to == ServiceState::Starting)
        .unwrap();
    assert!(b_starting.ts >= a_healthy.ts);

    scheduler.stop_all(Duration::from_secs(2)).await.unwrap();
    let events = collect_until(&mut rx, |evs| count_in(evs, ServiceState::Stopped) == 3).await;
    assert_eq!(first_order(&events, ServiceState::Stopped), ["c", "b", "a"]);
}

#[tokio::test]
async fn fan_out_releases_dependents_only_after_root() {
    let dir = TempDir::new().unwrap();
    let specs = vec![
        spec_in(dir.path(), "a", &["sleep", "30"], &[]),
        spec_in(dir.path(), "b", &["sleep", "30"], &["a"]),
        spec_in(dir.path(), "c", &["sleep", "30"], &["a"]),
        spec_in(dir.path(), "d", &["sleep", "30"], &["a"]),
    ];
    let (scheduler, mut rx) = scheduler(specs, fast_opts());

    scheduler.start_all().await.unwrap();
    let events = collect_until(&mut rx, |evs| count_in(evs, ServiceState::Healthy) == 4).await;

    let healthy = first_order(&events, ServiceState::Healthy);
    assert_eq!(healthy[0], "a");
    let mut rest = healthy[1..].to_vec();
    rest.sort();
    assert_eq!(rest, ["b", "c", "d"]);

    scheduler.stop_all(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn cycle_is_a_config_error() {
    let dir = TempDir::new().unwrap();
    let specs = vec![
        spec_in(dir.path(), "a", &["sleep", "30"], &["b"]),
        spec_in(dir.path(), "b", &["sleep", "30"], &["a"]),
    ];
    let err = Scheduler::new(
        specs,
        fast_opts(),
        StatusBoard::new(),
        EventBus::default(),
        CancellationToken::new(),
    )
    .err()
    .expect("cycle must be rejected");
    match &err {
        Error::DependencyCycle(names) => {
            assert_eq!(names, &["a", "b"]);
        }
        other => panic!("expected cycle error, got {:?}", other),
    }
    assert_eq!(err.exit_code(), 2);
}

#[tokio::test]
async fn failed_prerequisite_fails_waiting_dependents() {
    let dir = TempDir::new().unwrap();
    let mut broken = spec_in(dir.path(), "a", &["sh", "-c", "exit 1"], &[]);
    broken.restart = false;
    let specs = vec![broken, spec_in(dir.path(), "b", &["sleep", "30"], &["a"])];
    let (scheduler, mut rx) = scheduler(specs, fast_opts());

    scheduler.start_all().await.unwrap();
    let events = collect_until(&mut rx, |evs| count_in(evs, ServiceState::Failed) == 2).await;
    assert_eq!(count_in(&events, ServiceState::Healthy), 0);

    // The dependent never spawned.
    let b = scheduler.board().get("b").await.unwrap();
    assert_eq!(b.state, ServiceState::Failed);
    assert_eq!(b.generation, 0);
    assert!(b.pid.is_none());
}

#[tokio::test]
async fn unhealthy_prerequisite_fails_waiting_dependents() {
    let dir = TempDir::new().unwrap();
    // Never passes its probe and never restarts: parks in Unhealthy.
    let mut sick = spec_in(dir.path(), "a", &["sleep", "30"], &[]);
    sick.restart = false;
    sick.probe = Some(ProbeSettings {
        kind: ProbeKind::Cmd {
            command: "false".to_string(),
        },
        timeout: Duration::from_secs(1),
        interval: Duration::from_millis(50),
        retries: 2,
        start_period: Duration::ZERO,
    });
    let specs = vec![sick, spec_in(dir.path(), "b", &["sleep", "30"], &["a"])];
    let (scheduler, mut rx) = scheduler(specs, fast_opts());

    tokio::time::timeout(Duration::from_secs(10), scheduler.start_all())
        .await
        .expect("start_all must not hang on a parked-unhealthy prerequisite")
        .unwrap();

    let events = collect_until(&mut rx, |evs| {
        evs.iter()
            .any(|ev| ev.service == "b" && ev.to == ServiceState::Failed)
    })
    .await;
    let failed = events
        .iter()
        .find(|ev| ev.service == "b" && ev.to == ServiceState::Failed)
        .unwrap();
    assert_eq!(failed.reason, Reason::DepFailed("a".to_string()));

    let a = scheduler.board().get("a").await.unwrap();
    assert_eq!(a.state, ServiceState::Unhealthy);
    let b = scheduler.board().get("b").await.unwrap();
    assert_eq!(b.state, ServiceState::Failed);
    assert_eq!(b.generation, 0);
    assert!(b.pid.is_none());

    scheduler.stop_all(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn start_all_and_stop_all_are_idempotent() {
    let dir = TempDir::new().unwrap();
    let specs = vec![spec_in(dir.path(), "a", &["sleep", "30"], &[])];
    let (scheduler, mut rx) = scheduler(specs, fast_opts());

    scheduler.start_all().await.unwrap();
    collect_until(&mut rx, |evs| count_in(evs, ServiceState::Healthy) == 1).await;
    let before = scheduler.status().await;

    scheduler.start_all().await.unwrap();
    let after = scheduler.status().await;
    assert_eq!(before.len(), after.len());
    for (b, a) in before.iter().zip(after.iter()) {
        assert_eq!(b.state, a.state);
        assert_eq!(b.generation, a.generation);
        assert_eq!(b.pid, a.pid);
    }

    scheduler.stop_all(Duration::from_secs(2)).await.unwrap();
    let stopped = scheduler.board().get("a").await.unwrap();
    assert_eq!(stopped.state, ServiceState::Stopped);

    scheduler.stop_all(Duration::from_secs(2)).await.unwrap();
    let still = scheduler.board().get("a").await.unwrap();
    assert_eq!(still.state, ServiceState::Stopped);
    assert_eq!(still.generation, stopped.generation);
}

#[tokio::test]
async fn startup_delay_is_applied_after_dependencies() {
    let dir = TempDir::new().unwrap();
    let mut delayed = spec_in(dir.path(), "b", &["sleep", "30"], &["a"]);
    delayed.startup_delay = Duration::from_millis(300);
    let specs = vec![spec_in(dir.path(), "a", &["sleep", "30"], &[]), delayed];
    let (scheduler, mut rx) = scheduler(specs, fast_opts());

    scheduler.start_all().await.unwrap();
    let events = collect_until(&mut rx, |evs| count_in(evs, ServiceState::Healthy) == 2).await;

    let delaying = events
        .iter()
        .find(|ev| ev.service == "b" && ev.to == ServiceState::Delaying)
        .expect("b must pass through Delaying");
    let starting = events
        .iter()
        .find(|ev| ev.service == "b" && ev.to == ServiceState::Starting)
        .unwrap();
    let elapsed = (starting.ts - delaying.ts).num_milliseconds();
    assert!(elapsed >= 250, "delay was only {}ms", elapsed);

    scheduler.stop_all(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn stubborn_service_is_force_killed_within_the_cap() {
    let dir = TempDir::new().unwrap();
    // Ignores SIGTERM; only the kill escalation ends it.
    let specs = vec![spec_in(
        dir.path(),
        "a",
        &["sh", "-c", "trap '' TERM; while :; do sleep 1; done"],
        &[],
    )];
    let (scheduler, mut rx) = scheduler(specs, fast_opts());

    scheduler.start_all().await.unwrap();
    collect_until(&mut rx, |evs| count_in(evs, ServiceState::Healthy) == 1).await;

    let started = std::time::Instant::now();
    scheduler.stop_all(Duration::from_millis(500)).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(6));

    let snap = scheduler.board().get("a").await.unwrap();
    assert_eq!(snap.state, ServiceState::Stopped);
    assert_eq!(snap.last_exit.as_ref().unwrap().signal, Some(9));
}
