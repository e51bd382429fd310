//! End-to-end tests against the real `echo-worker` binary.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use smart_cluster::process::WorkerSignal;
use smart_cluster::{
    ClusterConfig, ClusterError, ClusterSettings, ClusterStats, CommandLauncher, ProcessId,
    ProcessState, SmartCluster, WorkerHandle, WorkerLauncher,
};
use smart_cluster_protocol::{TaskOutcome, TaskRequest};
use tokio::sync::mpsc;

const ECHO_WORKER: &str = env!("CARGO_BIN_EXE_echo-worker");

fn cluster(workers: usize) -> SmartCluster {
    SmartCluster::start(ClusterConfig::local(ECHO_WORKER, workers)).unwrap()
}

/// Poll stats until `done` holds.
async fn wait_for_stats(
    cluster: &SmartCluster,
    done: impl Fn(&ClusterStats) -> bool,
) -> ClusterStats {
    for _ in 0..500 {
        let stats = cluster.stats().await.unwrap();
        if done(&stats) {
            return stats;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("cluster did not reach the expected state");
}

#[tokio::test]
async fn tasks_round_trip_through_workers() {
    let cluster = cluster(2);

    let echo = cluster.submit_task("echo", vec![json!({"a": [1, 2]})]).await.unwrap();
    let sum = cluster.submit_task("sum", vec![json!(1), json!(2.5)]).await.unwrap();

    assert_eq!(echo.await.unwrap(), json!({"a": [1, 2]}));
    assert_eq!(sum.await.unwrap(), json!(3.5));

    let stats = wait_for_stats(&cluster, |s| s.idle_processes == 2).await;
    assert_eq!(stats.completed_tasks, 2);
    assert_eq!(stats.live_processes, 2);
    cluster.shutdown().await.unwrap();
}

#[tokio::test]
async fn results_arrive_for_more_tasks_than_workers() {
    let cluster = cluster(2);

    let mut handles = Vec::new();
    for i in 0..20 {
        handles.push(cluster.submit_task("echo", vec![json!(i)]).await.unwrap());
    }
    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.await.unwrap(), json!(i));
    }
    cluster.shutdown().await.unwrap();
}

#[tokio::test]
async fn worker_reported_failure_is_task_failed() {
    let cluster = cluster(1);

    let handle = cluster.submit_task("fail", vec![json!("bad input")]).await.unwrap();
    match handle.await {
        Err(ClusterError::TaskFailed { reason, .. }) => assert_eq!(reason, "bad input"),
        other => panic!("expected TaskFailed, got {other:?}"),
    }

    // The worker survives a failed task.
    let handle = cluster.submit_task("echo", vec![json!(7)]).await.unwrap();
    assert_eq!(handle.await.unwrap(), json!(7));
    cluster.shutdown().await.unwrap();
}

#[tokio::test]
async fn crashed_worker_requeues_its_task() {
    let cluster = cluster(1);

    let handle = cluster.submit_task("crash", vec![]).await.unwrap();
    let stats = wait_for_stats(&cluster, |s| s.requeued_tasks == 1).await;
    assert_eq!(stats.live_processes, 0);
    assert_eq!(stats.queued_tasks, 1);

    cluster.shutdown().await.unwrap();
    assert!(matches!(handle.await, Err(ClusterError::Shutdown)));
}

#[tokio::test]
async fn killing_a_busy_worker_moves_its_task() {
    let cluster = cluster(2);
    wait_for_stats(&cluster, |s| s.idle_processes == 2).await;

    let handle = cluster.submit_task("sleep", vec![json!(300)]).await.unwrap();
    let busy = cluster
        .processes()
        .await
        .unwrap()
        .into_iter()
        .find(|p| p.task_id.as_ref() == Some(handle.task_id()))
        .expect("task should be assigned to an idle worker");
    assert_eq!(busy.state, ProcessState::Busy);
    assert!(busy.pid.is_some());

    cluster.kill_process(&busy.process_id).await.unwrap();
    assert_eq!(handle.await.unwrap(), json!(300));

    let stats = cluster.stats().await.unwrap();
    assert_eq!(stats.requeued_tasks, 1);
    assert_eq!(stats.live_processes, 1);
    let survivors = cluster.processes().await.unwrap();
    assert!(survivors.iter().all(|p| p.process_id != busy.process_id));
    cluster.shutdown().await.unwrap();
}

#[tokio::test]
async fn refused_startup_is_spawn_error() {
    let mut config = ClusterConfig::local(ECHO_WORKER, 1);
    config.max_processes = Some(2);
    config
        .worker
        .env
        .insert("ECHO_WORKER_FAIL_STARTUP".into(), "no licence".into());
    let cluster = SmartCluster::start(config).unwrap();

    match cluster.spawn_process().await {
        Err(ClusterError::SpawnError { reason, .. }) => assert_eq!(reason, "no licence"),
        other => panic!("expected SpawnError, got {other:?}"),
    }
    let stats = cluster.stats().await.unwrap();
    assert_eq!(stats.live_processes, 0);
    cluster.shutdown().await.unwrap();
}

#[tokio::test]
async fn missing_program_is_spawn_error() {
    let launcher = CommandLauncher::new("/definitely/not/a/worker");
    let cluster = SmartCluster::start_with_launcher(
        Arc::new(launcher),
        ClusterSettings::new(1).max_processes(2),
    )
    .unwrap();

    assert!(matches!(
        cluster.spawn_process().await,
        Err(ClusterError::SpawnError { .. })
    ));
    cluster.shutdown().await.unwrap();
}

#[tokio::test]
async fn launcher_reports_replies_then_exit() {
    let launcher = CommandLauncher::new(ECHO_WORKER).ready_timeout(Duration::from_secs(5));
    let (signals, mut events) = mpsc::unbounded_channel();
    let process_id = ProcessId::from("p-test");

    let mut handle = launcher.launch(process_id.clone(), signals).await.unwrap();
    assert!(handle.pid().is_some());

    handle
        .send(TaskRequest::new("t1", "echo", vec![json!("x")]))
        .unwrap();
    match events.recv().await.unwrap() {
        WorkerSignal::Message { process_id: from, reply } => {
            assert_eq!(from, process_id);
            assert_eq!(reply.task_id, "t1");
            assert_eq!(reply.outcome, TaskOutcome::Success(json!("x")));
        }
        other => panic!("expected a reply, got {other:?}"),
    }

    handle.kill().unwrap();
    match events.recv().await.unwrap() {
        WorkerSignal::Exited { process_id: from, code, signal } => {
            assert_eq!(from, process_id);
            assert_eq!(code, None);
            if cfg!(unix) {
                assert_eq!(signal, Some(9));
            }
        }
        other => panic!("expected an exit, got {other:?}"),
    }
}

#[tokio::test]
async fn released_worker_exits_on_its_own() {
    let launcher = CommandLauncher::new(ECHO_WORKER);
    let (signals, mut events) = mpsc::unbounded_channel();

    let mut handle = launcher
        .launch(ProcessId::from("p-release"), signals)
        .await
        .unwrap();
    handle.request_shutdown().unwrap();
    drop(handle);

    match events.recv().await.unwrap() {
        WorkerSignal::Exited { code, .. } => assert_eq!(code, Some(0)),
        other => panic!("expected an exit, got {other:?}"),
    }
}
