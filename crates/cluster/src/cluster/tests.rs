use std::sync::Arc;

use serde_json::{json, Value};
use smart_cluster_protocol::TaskOutcome;
use tokio::sync::oneshot;

use super::engine::ClusterCore;
use super::SmartCluster;
use crate::config::ClusterSettings;
use crate::error::ClusterError;
use crate::id::{ProcessId, TaskId};
use crate::process::ProcessState;
use crate::testing::MockLauncher;

type Receiver = oneshot::Receiver<Result<Value, ClusterError>>;

// ── Engine helpers ──────────────────────────────────────────────────

fn core(launcher: &MockLauncher, settings: ClusterSettings) -> ClusterCore {
    ClusterCore::new(Arc::new(launcher.clone()), settings).unwrap()
}

fn submit(core: &mut ClusterCore, label: &str) -> Result<(TaskId, Receiver), ClusterError> {
    let (tx, rx) = oneshot::channel();
    let task_id = core.submit(label.to_string(), vec![json!(label)], tx)?;
    Ok((task_id, rx))
}

/// Wait for one launch to finish and apply it.
async fn settle_spawn(core: &mut ClusterCore) -> ProcessId {
    let outcome = core.spawn_rx.recv().await.unwrap();
    let process_id = outcome.process_id.clone();
    core.finish_spawn(outcome);
    core.drain_events();
    process_id
}

/// Apply worker signals the mock has already produced.
fn settle_signals(core: &mut ClusterCore) {
    core.processes.pump_ready();
    core.drain_events();
}

async fn core_with_worker(
    launcher: &MockLauncher,
    settings: ClusterSettings,
) -> (ClusterCore, ProcessId) {
    let mut core = core(launcher, settings);
    core.start_spawn(None);
    let process_id = settle_spawn(&mut core).await;
    assert_eq!(core.processes().state(&process_id), Some(ProcessState::Idle));
    (core, process_id)
}

// ── Engine scenarios ────────────────────────────────────────────────

#[tokio::test]
async fn task_submitted_before_spawn_is_dispatched_on_spawn() {
    let launcher = MockLauncher::gated();
    let mut core = core(&launcher, ClusterSettings::new(1));
    core.start_spawn(None);

    let (t1, _rx) = submit(&mut core, "t1").unwrap();
    assert!(core.tasks().is_queued(&t1));
    assert!(launcher.dispatched().is_empty());

    launcher.release_spawns(1);
    let worker = settle_spawn(&mut core).await;

    assert_eq!(core.assignment(&worker), Some(&t1));
    assert_eq!(core.processes().state(&worker), Some(ProcessState::Busy));
    assert!(core.processes().idle_ids().is_empty());
    assert_eq!(launcher.sent(&worker)[0].task_id, t1.as_str());

    let infos = core.process_infos();
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].process_id, worker);
    assert_eq!(infos[0].state, ProcessState::Busy);
    assert_eq!(infos[0].task_id.as_ref(), Some(&t1));
}

#[tokio::test]
async fn queued_task_follows_reply_on_same_worker() {
    let launcher = MockLauncher::new();
    let (mut core, worker) = core_with_worker(&launcher, ClusterSettings::new(1)).await;

    let (t1, rx1) = submit(&mut core, "t1").unwrap();
    let (t2, _rx2) = submit(&mut core, "t2").unwrap();
    assert_eq!(core.assignment(&worker), Some(&t1));
    assert!(core.tasks().is_queued(&t2));

    launcher.reply(&worker, t1.as_str(), TaskOutcome::Success(json!("one")));
    settle_signals(&mut core);

    assert_eq!(rx1.await.unwrap().unwrap(), json!("one"));
    assert_eq!(core.assignment(&worker), Some(&t2));
    assert_eq!(core.processes().state(&worker), Some(ProcessState::Busy));
    assert!(core.processes().idle_ids().is_empty());
    assert!(!core.tasks().contains(&t1));

    let sent: Vec<String> = launcher.sent(&worker).into_iter().map(|r| r.task_id).collect();
    assert_eq!(sent, vec![t1.to_string(), t2.to_string()]);
}

#[tokio::test]
async fn worker_returns_to_idle_when_queue_is_empty() {
    let launcher = MockLauncher::new();
    let (mut core, worker) = core_with_worker(&launcher, ClusterSettings::new(1)).await;

    let (t1, rx) = submit(&mut core, "t1").unwrap();
    launcher.reply(&worker, t1.as_str(), TaskOutcome::Success(Value::Null));
    settle_signals(&mut core);

    assert_eq!(rx.await.unwrap().unwrap(), Value::Null);
    assert_eq!(core.processes().idle_ids(), vec![worker.clone()]);
    assert!(core.assignment(&worker).is_none());
    assert_eq!(core.stats().completed_tasks, 1);
}

#[tokio::test]
async fn exit_mid_task_requeues_and_purges_worker() {
    let launcher = MockLauncher::new();
    let (mut core, worker) =
        core_with_worker(&launcher, ClusterSettings::new(1).max_processes(2)).await;

    let (t1, rx) = submit(&mut core, "t1").unwrap();
    launcher.exit(&worker, Some(101));
    settle_signals(&mut core);

    assert!(core.assignment(&worker).is_none());
    assert!(!core.processes().is_live(&worker));
    assert!(core.processes().idle_ids().is_empty());
    assert!(core.tasks().is_queued(&t1));
    assert_eq!(core.stats().requeued_tasks, 1);
    assert_eq!(core.tasks().requeues(&t1).unwrap(), 1);

    // No automatic respawn: growth is explicit, and the new worker picks the task up.
    assert_eq!(launcher.launched().len(), 1);
    let (reply, spawned) = oneshot::channel();
    core.start_spawn(Some(reply));
    let replacement = settle_spawn(&mut core).await;
    assert_eq!(spawned.await.unwrap().unwrap(), replacement);
    assert_eq!(core.assignment(&replacement), Some(&t1));

    launcher.reply(&replacement, t1.as_str(), TaskOutcome::Success(json!(1)));
    settle_signals(&mut core);
    assert_eq!(rx.await.unwrap().unwrap(), json!(1));
}

#[tokio::test]
async fn exit_of_idle_worker_only_purges_it() {
    let launcher = MockLauncher::new();
    let (mut core, worker) = core_with_worker(&launcher, ClusterSettings::new(1)).await;

    launcher.exit(&worker, Some(0));
    settle_signals(&mut core);

    assert!(core.processes().is_empty());
    assert_eq!(core.stats().requeued_tasks, 0);

    // Without workers, tasks wait.
    let (t1, _rx) = submit(&mut core, "t1").unwrap();
    assert!(core.tasks().is_queued(&t1));
}

#[tokio::test]
async fn full_queue_rejects_without_retaining() {
    let launcher = MockLauncher::gated();
    let mut core = core(&launcher, ClusterSettings::new(1).task_bounds(0, 1));

    let (t1, _rx) = submit(&mut core, "t1").unwrap();
    let err = submit(&mut core, "t2").unwrap_err();

    assert!(err.is_capacity());
    assert_eq!(core.tasks().len(), 1);
    assert_eq!(core.tasks().queued_ids(), vec![t1]);
    assert_eq!(core.stats().pending_tasks, 1);
}

#[tokio::test]
async fn requeue_at_capacity_rejects_the_task() {
    let launcher = MockLauncher::new();
    let (mut core, worker) =
        core_with_worker(&launcher, ClusterSettings::new(1).task_bounds(0, 1)).await;

    let (_t1, rx1) = submit(&mut core, "t1").unwrap();
    let (t2, _rx2) = submit(&mut core, "t2").unwrap();
    assert!(core.tasks().is_queued(&t2));

    launcher.exit(&worker, None);
    settle_signals(&mut core);

    assert!(rx1.await.unwrap().unwrap_err().is_capacity());
    assert_eq!(core.tasks().queued_ids(), vec![t2]);
    assert_eq!(core.stats().pending_tasks, 1);
}

#[tokio::test]
async fn requeue_limit_fails_the_task() {
    let launcher = MockLauncher::new();
    let settings = ClusterSettings::new(1).max_processes(3).max_requeues(1);
    let (mut core, first) = core_with_worker(&launcher, settings).await;

    let (t1, rx) = submit(&mut core, "t1").unwrap();
    launcher.exit(&first, None);
    settle_signals(&mut core);
    assert!(core.tasks().is_queued(&t1));

    core.start_spawn(None);
    let second = settle_spawn(&mut core).await;
    assert_eq!(core.assignment(&second), Some(&t1));
    launcher.exit(&second, None);
    settle_signals(&mut core);

    match rx.await.unwrap() {
        Err(ClusterError::TaskFailed { task_id, reason }) => {
            assert_eq!(task_id, t1.as_str());
            assert!(reason.contains("2 times"));
        }
        other => panic!("expected TaskFailed, got {other:?}"),
    }
    assert!(!core.tasks().contains(&t1));
    let stats = core.stats();
    assert_eq!(stats.requeued_tasks, 1);
    assert_eq!(stats.failed_tasks, 1);
    assert_eq!(stats.pending_tasks, 0);

    // A fresh worker stays idle.
    core.start_spawn(None);
    let third = settle_spawn(&mut core).await;
    assert_eq!(core.processes().state(&third), Some(ProcessState::Idle));
}

#[tokio::test]
async fn worker_failure_resolves_as_task_failed() {
    let launcher = MockLauncher::new();
    let (mut core, worker) = core_with_worker(&launcher, ClusterSettings::new(1)).await;

    let (t1, rx) = submit(&mut core, "t1").unwrap();
    launcher.reply(&worker, t1.as_str(), TaskOutcome::Failure("boom".into()));
    settle_signals(&mut core);

    match rx.await.unwrap() {
        Err(ClusterError::TaskFailed { task_id, reason }) => {
            assert_eq!(task_id, t1.as_str());
            assert_eq!(reason, "boom");
        }
        other => panic!("expected TaskFailed, got {other:?}"),
    }
    assert_eq!(core.stats().failed_tasks, 1);
    assert_eq!(core.processes().idle_ids(), vec![worker]);
}

#[tokio::test]
async fn orphaned_reply_is_dropped() {
    let launcher = MockLauncher::new();
    let (mut core, worker) = core_with_worker(&launcher, ClusterSettings::new(1)).await;
    let (t1, _rx) = submit(&mut core, "t1").unwrap();

    launcher.reply(&worker, "not-a-task", TaskOutcome::Success(Value::Null));
    settle_signals(&mut core);

    assert_eq!(core.assignment(&worker), Some(&t1));
    assert_eq!(core.stats().pending_tasks, 1);
    assert_eq!(core.stats().completed_tasks, 0);
}

#[tokio::test]
async fn reply_for_another_workers_task_is_dropped() {
    let launcher = MockLauncher::new();
    let mut core = core(&launcher, ClusterSettings::new(2));
    core.start_spawn(None);
    let p = settle_spawn(&mut core).await;
    core.start_spawn(None);
    let q = settle_spawn(&mut core).await;

    let (t1, mut rx1) = submit(&mut core, "t1").unwrap();
    let (t2, _rx2) = submit(&mut core, "t2").unwrap();
    assert_eq!(core.assignment(&p), Some(&t1));
    assert_eq!(core.assignment(&q), Some(&t2));

    // q answers with p's task id: nothing is resolved and both stay busy.
    launcher.reply(&q, t1.as_str(), TaskOutcome::Success(json!("wrong")));
    settle_signals(&mut core);
    assert!(rx1.try_recv().is_err());
    assert!(core.tasks().contains(&t1));
    assert_eq!(core.assignment(&p), Some(&t1));
    assert_eq!(core.assignment(&q), Some(&t2));
    assert_eq!(core.stats().pending_tasks, 2);

    // p's own reply still completes t1 and frees p for the next task.
    launcher.reply(&p, t1.as_str(), TaskOutcome::Success(json!("right")));
    settle_signals(&mut core);
    assert_eq!(rx1.await.unwrap().unwrap(), json!("right"));
    assert_eq!(core.processes().state(&p), Some(ProcessState::Idle));

    let (t3, _rx3) = submit(&mut core, "t3").unwrap();
    assert_eq!(core.assignment(&p), Some(&t3));
    assert!(!core.tasks().is_queued(&t3));
}

#[tokio::test]
async fn idle_workers_are_used_oldest_first() {
    let launcher = MockLauncher::new();
    let mut core = core(&launcher, ClusterSettings::new(2));
    core.start_spawn(None);
    let first = settle_spawn(&mut core).await;
    core.start_spawn(None);
    let second = settle_spawn(&mut core).await;

    let (t1, _) = submit(&mut core, "t1").unwrap();
    let (t2, _) = submit(&mut core, "t2").unwrap();
    assert_eq!(core.assignment(&first), Some(&t1));
    assert_eq!(core.assignment(&second), Some(&t2));
}

#[tokio::test]
async fn spawn_beyond_max_processes_is_capacity() {
    let launcher = MockLauncher::new();
    let (mut core, _) = core_with_worker(&launcher, ClusterSettings::new(1)).await;

    let (reply, result) = oneshot::channel();
    core.start_spawn(Some(reply));
    assert!(result.await.unwrap().unwrap_err().is_capacity());
}

#[tokio::test]
async fn shutdown_rejects_pending_and_kills_workers() {
    let launcher = MockLauncher::new();
    let (mut core, worker) = core_with_worker(&launcher, ClusterSettings::new(1)).await;
    let (_t1, rx1) = submit(&mut core, "t1").unwrap();
    let (_t2, rx2) = submit(&mut core, "t2").unwrap();

    core.shutdown();

    assert!(matches!(rx1.await.unwrap(), Err(ClusterError::Shutdown)));
    assert!(matches!(rx2.await.unwrap(), Err(ClusterError::Shutdown)));
    assert!(launcher.was_killed(&worker));
    assert!(core.processes().is_empty());
}

// ── Handle ──────────────────────────────────────────────────────────

fn start(launcher: &MockLauncher, settings: ClusterSettings) -> SmartCluster {
    SmartCluster::start_with_launcher(Arc::new(launcher.clone()), settings).unwrap()
}

#[tokio::test]
async fn submit_and_await_result() {
    let launcher = MockLauncher::new();
    let cluster = start(&launcher, ClusterSettings::new(2));

    let handle = cluster.submit_task("echo", vec![json!("hi")]).await.unwrap();
    let (worker, request) = launcher.wait_for_dispatches(1).await.remove(0);
    assert_eq!(request.task_id, handle.task_id().as_str());
    assert_eq!(request.label, "echo");
    assert_eq!(request.args, vec![json!("hi")]);

    launcher.reply(&worker, &request.task_id, TaskOutcome::Success(json!("hi")));
    assert_eq!(handle.await.unwrap(), json!("hi"));

    let stats = cluster.stats().await.unwrap();
    assert_eq!(stats.completed_tasks, 1);
    assert_eq!(stats.pending_tasks, 0);
    assert_eq!(stats.max_processes, 2);
    cluster.shutdown().await.unwrap();
}

#[tokio::test]
async fn killed_worker_hands_task_to_another() {
    let launcher = MockLauncher::new();
    let cluster = start(&launcher, ClusterSettings::new(2));
    launcher.wait_for_workers(2).await;

    let handle = cluster.submit_task("slow", vec![]).await.unwrap();
    let (first, _) = launcher.wait_for_dispatches(1).await.remove(0);
    cluster.kill_process(&first).await.unwrap();

    let (second, request) = launcher.wait_for_dispatches(2).await.remove(1);
    assert_ne!(first, second);
    assert_eq!(request.task_id, handle.task_id().as_str());
    assert!(launcher.was_killed(&first));

    launcher.reply(&second, &request.task_id, TaskOutcome::Success(json!(true)));
    assert_eq!(handle.await.unwrap(), json!(true));
    assert_eq!(cluster.stats().await.unwrap().requeued_tasks, 1);
}

#[tokio::test]
async fn spawn_process_surfaces_errors() {
    let launcher = MockLauncher::new();
    let cluster = start(&launcher, ClusterSettings::new(1).max_processes(3));
    launcher.wait_for_workers(1).await;

    let grown = cluster.spawn_process().await.unwrap();
    assert_eq!(launcher.launched().len(), 2);
    assert!(launcher.launched().contains(&grown));

    launcher.fail_next_spawn("exec format error");
    match cluster.spawn_process().await {
        Err(ClusterError::SpawnError { reason, .. }) => assert_eq!(reason, "exec format error"),
        other => panic!("expected SpawnError, got {other:?}"),
    }

    let ghost = ProcessId::from("ghost");
    assert!(matches!(
        cluster.kill_process(&ghost).await,
        Err(ClusterError::UnknownProcess(_))
    ));
}

#[tokio::test]
async fn shutdown_stops_the_cluster() {
    let launcher = MockLauncher::gated();
    let cluster = start(&launcher, ClusterSettings::new(1));

    let handle = cluster.submit_task("never", vec![]).await.unwrap();
    cluster.shutdown().await.unwrap();

    assert!(matches!(handle.await, Err(ClusterError::Shutdown)));
    assert!(matches!(
        cluster.submit_task("late", vec![]).await,
        Err(ClusterError::Shutdown)
    ));
    assert!(!cluster.is_running());
    cluster.shutdown().await.unwrap();
}

#[tokio::test]
async fn dropping_every_handle_releases_pending_tasks() {
    let launcher = MockLauncher::gated();
    let cluster = start(&launcher, ClusterSettings::new(1));
    let handle = cluster.submit_task("never", vec![]).await.unwrap();

    drop(cluster);
    assert!(matches!(handle.await, Err(ClusterError::Shutdown)));
}

#[tokio::test]
async fn invalid_settings_are_rejected() {
    let launcher = MockLauncher::new();
    let err = SmartCluster::start_with_launcher(
        Arc::new(launcher),
        ClusterSettings::new(2).max_processes(1),
    )
    .err()
    .unwrap();
    assert!(matches!(err, ClusterError::InvalidConfiguration(_)));
}
