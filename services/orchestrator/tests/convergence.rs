mod common;

use std::time::Duration;

use common::{drain, Fixture, LOCAL_ADDRESS};
use sparkling_orchestrator::error::OrchestratorError;
use sparkling_orchestrator::model::ContainerRole;
use sparkling_orchestrator::runtime::{ContainerRuntime, MockOp, LABEL_NODE, LABEL_ROLE};
use sparkling_orchestrator::store::Store;
use sparkling_reconcile::ConvergenceOutcome;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_activating_local_node_creates_coordinator() {
    let fx = Fixture::new();
    let node = fx.local_node(false).await;
    let mut sub = fx.progress.subscribe(64);

    let outcome = fx
        .state
        .activator()
        .activate(node.id, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome, ConvergenceOutcome::Created);

    let node = fx.store.get_node(node.id).await.unwrap().unwrap();
    assert!(node.is_active);

    let records = fx.store.containers_for_node(node.id).await.unwrap();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.role, ContainerRole::Coordinator);
    assert_eq!(record.ports, vec![7077, 8080]);

    let name = record.id.to_string();
    assert!(fx.runtime.is_running(&name));
    let spec = fx.runtime.spec(&name).unwrap();
    assert_eq!(spec.image, "spark-cuda:latest");
    assert_eq!(spec.labels.get(LABEL_NODE), Some(&node.id.to_string()));
    assert_eq!(spec.labels.get(LABEL_ROLE).map(String::as_str), Some("coordinator"));
    assert!(spec.restart_always);
    assert!(spec.interactive);
    assert!(fx.runtime.volumes().contains(&format!("{name}-data")));
    assert_eq!(fx.runtime.pulled_images(), vec!["spark-cuda:latest".to_string()]);
    assert!(fx.shared_dir.path().join("shared-volume").is_dir());

    let steps: Vec<String> = drain(&mut sub).into_iter().map(|e| e.step).collect();
    assert_eq!(
        steps,
        vec!["starting", "pulling_image", "creating_container", "activated"]
    );
}

#[tokio::test]
async fn test_reactivation_restarts_existing_container() {
    let fx = Fixture::new();
    let node = fx.local_node(false).await;
    let activator = fx.state.activator();

    activator
        .activate(node.id, CancellationToken::new())
        .await
        .unwrap();
    let outcome = activator
        .activate(node.id, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome, ConvergenceOutcome::Restarted);
    assert_eq!(fx.runtime.calls(MockOp::Restart), 1);
    assert_eq!(fx.runtime.calls(MockOp::Create), 1);
    assert_eq!(fx.store.containers_for_node(node.id).await.unwrap().len(), 1);
    assert_eq!(fx.runtime.container_names().len(), 1);
}

#[tokio::test]
async fn test_stale_record_is_replaced() {
    let fx = Fixture::new();
    let node = fx.local_node(false).await;
    let activator = fx.state.activator();

    activator
        .activate(node.id, CancellationToken::new())
        .await
        .unwrap();
    let old = fx.store.containers_for_node(node.id).await.unwrap().remove(0);
    fx.runtime
        .remove_container(&old.id.to_string(), true)
        .await
        .unwrap();

    let outcome = activator
        .activate(node.id, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome, ConvergenceOutcome::Created);

    let records = fx.store.containers_for_node(node.id).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_ne!(records[0].id, old.id);
    assert!(fx.runtime.is_running(&records[0].id.to_string()));
}

#[tokio::test]
async fn test_failed_restart_replaces_container() {
    let fx = Fixture::new();
    let node = fx.local_node(false).await;
    let activator = fx.state.activator();

    activator
        .activate(node.id, CancellationToken::new())
        .await
        .unwrap();
    let old = fx.store.containers_for_node(node.id).await.unwrap().remove(0);
    fx.runtime.fail_always(MockOp::Restart);

    let outcome = activator
        .activate(node.id, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome, ConvergenceOutcome::Created);
    assert!(!fx.runtime.contains(&old.id.to_string()));
    assert_eq!(fx.runtime.container_names().len(), 1);
    assert_eq!(fx.store.containers_for_node(node.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let fx = Fixture::new();
    let node = fx.local_node(false).await;
    fx.runtime.fail(MockOp::Create, 2);

    let outcome = fx
        .state
        .activator()
        .activate(node.id, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome, ConvergenceOutcome::Created);
    assert_eq!(fx.runtime.calls(MockOp::Create), 3);
    assert_eq!(fx.store.containers_for_node(node.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_exhausted_retries_leave_node_inactive() {
    let fx = Fixture::new();
    let node = fx.local_node(false).await;
    fx.runtime.fail_always(MockOp::Create);
    let mut sub = fx.progress.subscribe(64);

    let err = fx
        .state
        .activator()
        .activate(node.id, CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, OrchestratorError::RuntimeOperation(_)));
    assert_eq!(fx.runtime.calls(MockOp::Create), 3);
    assert!(!fx.store.get_node(node.id).await.unwrap().unwrap().is_active);
    assert!(fx.store.containers_for_node(node.id).await.unwrap().is_empty());
    assert!(fx.runtime.volumes().is_empty());

    let last = drain(&mut sub).pop().unwrap();
    assert!(last.is_error());
    assert!(last.message.starts_with("Activation failed"));
}

#[tokio::test]
async fn test_container_missing_after_create_is_an_error() {
    let fx = Fixture::new();
    let node = fx.local_node(false).await;
    fx.runtime.hide_created_containers();

    let err = fx
        .state
        .activator()
        .activate(node.id, CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, OrchestratorError::RuntimeOperation(_)));
    assert!(fx.store.containers_for_node(node.id).await.unwrap().is_empty());
    assert!(fx.runtime.container_names().is_empty());
    assert!(fx.runtime.volumes().is_empty());
}

#[tokio::test]
async fn test_start_failure_removes_container_and_volume() {
    let fx = Fixture::new();
    let node = fx.local_node(false).await;
    fx.runtime.fail_always(MockOp::Start);

    fx.state
        .activator()
        .activate(node.id, CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(fx.runtime.calls(MockOp::Start), 3);
    assert_eq!(fx.runtime.calls(MockOp::RemoveVolume), 3);
    assert!(fx.runtime.container_names().is_empty());
    assert!(fx.runtime.volumes().is_empty());
}

#[tokio::test]
async fn test_worker_needs_active_coordinator() {
    let fx = Fixture::new();
    fx.local_node(false).await;
    let remote = fx.remote_node().await;

    let err = fx
        .state
        .activator()
        .activate(remote.id, CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, OrchestratorError::Conflict(_)));
    assert_eq!(fx.runtime.calls(MockOp::Create), 0);
    assert_eq!(fx.tunnels.opened_total(), 0);
}

#[tokio::test]
async fn test_worker_joins_coordinator_through_tunnel() {
    let fx = Fixture::new();
    let local = fx.local_node(false).await;
    let remote = fx.remote_node().await;
    let activator = fx.state.activator();

    activator
        .activate(local.id, CancellationToken::new())
        .await
        .unwrap();
    let outcome = activator
        .activate(remote.id, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome, ConvergenceOutcome::Created);

    let records = fx.store.containers_for_node(remote.id).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].role, ContainerRole::Worker);
    assert_eq!(records[0].ports, vec![8081]);

    let spec = fx.runtime.spec(&records[0].id.to_string()).unwrap();
    let cmd = spec.cmd.unwrap().join(" ");
    assert!(cmd.contains(&format!("start-worker.sh {LOCAL_ADDRESS}:7077")));

    assert_eq!(fx.tunnels.opened_total(), 1);
    assert_eq!(fx.tunnels.open_tunnels(), 0);
    assert_eq!(
        fx.tunnels.targets(),
        vec![("sparkling".to_string(), "10.0.0.2".to_string())]
    );
}

#[tokio::test]
async fn test_failed_coordinator_reactivation_deactivates_workers() {
    let fx = Fixture::new();
    let local = fx.local_node(false).await;
    let remote = fx.remote_node().await;
    let activator = fx.state.activator();

    activator
        .activate(local.id, CancellationToken::new())
        .await
        .unwrap();
    activator
        .activate(remote.id, CancellationToken::new())
        .await
        .unwrap();
    assert!(fx.store.get_node(remote.id).await.unwrap().unwrap().is_active);

    fx.runtime.fail_always(MockOp::Restart);
    fx.runtime.fail_always(MockOp::Create);
    activator
        .activate(local.id, CancellationToken::new())
        .await
        .unwrap_err();

    assert!(!fx.store.get_node(local.id).await.unwrap().unwrap().is_active);
    assert!(!fx.store.get_node(remote.id).await.unwrap().unwrap().is_active);
}

#[tokio::test]
async fn test_concurrent_activations_share_one_convergence() {
    let fx = Fixture::new();
    let node = fx.local_node(false).await;
    fx.runtime.slow_pulls(Duration::from_millis(50));
    let activator = fx.state.activator();

    let (a, b) = tokio::join!(
        activator.activate(node.id, CancellationToken::new()),
        activator.activate(node.id, CancellationToken::new()),
    );

    assert_eq!(a.unwrap(), ConvergenceOutcome::Created);
    assert_eq!(b.unwrap(), ConvergenceOutcome::Created);
    assert_eq!(fx.runtime.calls(MockOp::Create), 1);
    assert_eq!(fx.store.containers_for_node(node.id).await.unwrap().len(), 1);
    assert!(!activator.is_activating(node.id));
}

#[tokio::test]
async fn test_cancelled_activation_does_nothing() {
    let fx = Fixture::new();
    let node = fx.local_node(false).await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = fx
        .state
        .activator()
        .activate(node.id, cancel)
        .await
        .unwrap_err();

    assert_eq!(err, OrchestratorError::Cancelled);
    assert_eq!(fx.runtime.calls(MockOp::PullImage), 0);
}

#[tokio::test]
async fn test_unknown_node_is_not_found() {
    let fx = Fixture::new();
    let err = fx
        .state
        .activator()
        .activate(sparkling_id::NodeId::new(), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::NotFound(_)));
}
