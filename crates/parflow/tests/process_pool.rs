#![cfg(feature = "cli")]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parflow::exec::FutureState;
use parflow::{
    join, Context, JoinOptions, NodeRef, Pool, PoolError, ProcessPool, ProcessPoolConfig, Scope,
    ScopeConfig, Task, TaskError, WorkFuture,
};
use serde_json::{json, Value};

fn scope(name: &str) -> Arc<Scope> {
    Scope::init(ScopeConfig::default().with_name(name)).expect("scope should start")
}

fn config() -> ProcessPoolConfig {
    ProcessPoolConfig::new(env!("CARGO_BIN_EXE_parflow-worker"))
        .with_worker_args(["--log-level", "warn"])
        .with_poll_interval(Duration::from_millis(100))
}

fn wait_running(future: &WorkFuture<Value>) {
    let start = Instant::now();
    while future.state() != FutureState::Running {
        assert!(
            start.elapsed() < Duration::from_secs(10),
            "task never started: {:?}",
            future.state()
        );
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn tasks_run_in_worker_processes() {
    let scope = scope("pp-roundtrip");
    let pool = ProcessPool::new(scope.clone(), config().with_max_workers(2));
    pool.open().expect("pool should open");

    let ctx = Context::root();
    let futures: Vec<_> = (0..4)
        .map(|i| {
            pool.submit(&ctx, Task::new("sum").with_args(vec![json!(i), json!(10)]), true)
                .expect("submit should succeed")
        })
        .collect();
    for (i, future) in futures.iter().enumerate() {
        assert_eq!(future.result(), Ok(json!(i + 10)));
    }

    let pids = pool.worker_pids();
    assert!(!pids.is_empty() && pids.len() <= 2);
    assert!(!pids.contains(&std::process::id()));
    assert_eq!(ctx.children().len(), 4);

    pool.shutdown(Some(Duration::from_secs(10)))
        .expect("clean shutdown");
    assert!(scope.worker_pids().is_empty());
    scope.teardown(Duration::from_secs(2)).expect("teardown");
}

#[test]
fn context_and_settings_reach_the_worker() {
    let scope = scope("pp-context");
    let pool = ProcessPool::new(
        scope.clone(),
        config()
            .with_max_workers(1)
            .with_settings(json!({"run": "r-42"})),
    );
    pool.open().unwrap();

    let mut ctx = Context::root()
        .enter(NodeRef::new("suite"))
        .enter(NodeRef::new("case"));
    ctx.set_framework("attempt", json!(2));
    ctx.set_local("scratch", json!("stays here"));

    let seen = pool
        .submit(&ctx, Task::new("context"), true)
        .unwrap()
        .result()
        .expect("context task should succeed");

    assert_eq!(seen["top"]["name"], json!("suite"));
    assert_eq!(seen["previous"]["name"], json!("suite"));
    assert_eq!(seen["current"]["name"], json!("case"));
    assert_eq!(seen["framework"]["attempt"], json!(2));
    assert_eq!(seen["framework"]["settings"], json!({"run": "r-42"}));
    assert!(!seen.to_string().contains("stays here"));

    pool.shutdown(Some(Duration::from_secs(10))).unwrap();
    scope.teardown(Duration::from_secs(2)).unwrap();
}

#[test]
fn worker_exceptions_carry_the_remote_traceback() {
    let scope = scope("pp-exception");
    let pool = ProcessPool::new(scope.clone(), config().with_max_workers(1));
    pool.open().unwrap();

    let future = pool
        .submit(
            &Context::root(),
            Task::new("fail")
                .with_args(vec![json!("negative input")])
                .with_kwarg("kind", json!("ValueError")),
            true,
        )
        .unwrap();

    let err = future.result().expect_err("task should fail");
    assert_eq!(err.kind(), "ValueError");
    let TaskError::Remote { exception } = &err else {
        panic!("expected a remote failure, got {err:?}");
    };
    assert_eq!(exception.message, "negative input");
    assert!(exception
        .traceback
        .iter()
        .any(|frame| frame.starts_with("in task 'fail' (worker pid ")));
    assert!(err.to_string().contains("remote traceback:"));

    let unknown = pool
        .submit(&Context::root(), Task::new("no-such-task"), true)
        .unwrap()
        .result()
        .expect_err("unknown task should fail");
    assert_eq!(unknown.kind(), "UnknownTask");

    pool.shutdown(Some(Duration::from_secs(10))).unwrap();
    scope.teardown(Duration::from_secs(2)).unwrap();
}

#[test]
fn join_surfaces_the_first_failure() {
    let scope = scope("pp-join");
    let pool = ProcessPool::new(scope.clone(), config().with_max_workers(3));
    pool.open().unwrap();

    let ctx = Context::root();
    pool.submit(&ctx, Task::new("sleep_ms").with_args(vec![json!(300)]), true)
        .unwrap();
    pool.submit(&ctx, Task::new("fail"), true).unwrap();
    pool.submit(&ctx, Task::new("sleep_ms").with_args(vec![json!(300)]), true)
        .unwrap();

    let err = parflow::exec::join_children(&ctx, &JoinOptions::default())
        .expect_err("join should surface the failure");
    assert!(err.to_string().contains("TaskFailed"));

    join(&ctx.children()[..1], &JoinOptions::all()).expect("sleep finishes");

    pool.shutdown(Some(Duration::from_secs(10))).unwrap();
    scope.teardown(Duration::from_secs(2)).unwrap();
}

#[test]
fn shutdown_lets_running_tasks_finish() {
    let scope = scope("pp-drain");
    let pool = ProcessPool::new(scope.clone(), config().with_max_workers(1));
    pool.open().unwrap();

    let future = pool
        .submit(&Context::root(), Task::new("sleep_ms").with_args(vec![json!(200)]), true)
        .unwrap();
    wait_running(&future);

    pool.shutdown(Some(Duration::from_secs(10))).unwrap();
    assert_eq!(future.try_result(), Some(Ok(json!(200))));
    assert!(matches!(
        pool.submit(&Context::root(), Task::new("echo"), true),
        Err(PoolError::ShutDown(_))
    ));
    scope.teardown(Duration::from_secs(2)).unwrap();
}

#[test]
fn shutdown_timeout_kills_busy_workers() {
    let scope = scope("pp-kill");
    let pool = ProcessPool::new(scope.clone(), config().with_max_workers(1));
    pool.open().unwrap();

    let future = pool
        .submit(&Context::root(), Task::new("sleep_ms").with_args(vec![json!(30_000)]), true)
        .unwrap();
    wait_running(&future);

    let err = pool
        .shutdown(Some(Duration::from_millis(200)))
        .expect_err("killed worker is reported");
    assert!(matches!(err, PoolError::Worker(_)));
    assert_eq!(future.error().map(|e| e.kind().to_string()).as_deref(), Some("WorkerDied"));
    scope.teardown(Duration::from_secs(2)).unwrap();
}

#[test]
fn worker_that_never_gets_ready_fails_the_submit() {
    let scope = scope("pp-bad-start");
    let pool = ProcessPool::new(
        scope.clone(),
        config()
            .with_worker_args(["--no-such-flag"])
            .with_max_workers(1)
            .with_start_timeout(Duration::from_secs(5)),
    );
    pool.open().unwrap();

    let err = pool
        .submit(&Context::root(), Task::new("echo"), true)
        .expect_err("worker cannot start");
    assert!(matches!(err, PoolError::Worker(_)));

    let _ = pool.shutdown(Some(Duration::from_secs(2)));
    scope.teardown(Duration::from_secs(2)).unwrap();
}

#[test]
fn non_blocking_submit_runs_inline_when_workers_are_busy() {
    let scope = scope("pp-inline");
    let pool = ProcessPool::new(scope.clone(), config().with_max_workers(1));
    pool.open().unwrap();

    let busy = pool
        .submit(&Context::root(), Task::new("sleep_ms").with_args(vec![json!(300)]), true)
        .unwrap();
    let inline = pool
        .submit(&Context::root(), Task::new("sum").with_args(vec![json!(1), json!(1)]), false)
        .unwrap();
    assert_eq!(inline.try_result(), Some(Ok(json!(2))));

    assert_eq!(busy.result(), Ok(json!(300)));
    pool.shutdown(Some(Duration::from_secs(10))).unwrap();
    scope.teardown(Duration::from_secs(2)).unwrap();
}
