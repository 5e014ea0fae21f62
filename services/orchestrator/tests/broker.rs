mod common;

use std::sync::Arc;

use common::{local_endpoints, Fixture};
use sparkling_orchestrator::broker::{ConnectionBroker, MockConnector, MockTunnelClient};
use sparkling_orchestrator::config::BrokerSettings;
use sparkling_orchestrator::error::OrchestratorError;
use sparkling_orchestrator::runtime::{MockOp, MockRuntime};

struct Harness {
    runtime: Arc<MockRuntime>,
    connector: Arc<MockConnector>,
    tunnels: Arc<MockTunnelClient>,
    broker: ConnectionBroker,
}

fn harness() -> Harness {
    let runtime = Arc::new(MockRuntime::new());
    let connector = Arc::new(MockConnector::new(runtime.clone()));
    let tunnels = Arc::new(MockTunnelClient::new());
    let broker = ConnectionBroker::new(
        connector.clone(),
        tunnels.clone(),
        BrokerSettings {
            local_endpoints: local_endpoints(),
            ..BrokerSettings::default()
        },
    );
    Harness {
        runtime,
        connector,
        tunnels,
        broker,
    }
}

#[tokio::test]
async fn test_local_falls_back_through_endpoints() {
    let h = harness();
    let fx = Fixture::new();
    let node = fx.local_node(true).await;
    let endpoints = local_endpoints();
    h.connector.set_unreachable(&endpoints[0]);
    h.connector.set_unreachable(&endpoints[1]);

    let mut lease = h.broker.acquire(&node).await.unwrap();
    assert_eq!(lease.endpoint(), endpoints[2].to_string());
    assert!(!lease.is_tunneled());
    assert_eq!(h.connector.attempts().len(), 3);
    assert_eq!(h.tunnels.opened_total(), 0);
    lease.release().await;
}

#[tokio::test]
async fn test_first_reachable_local_endpoint_wins() {
    let h = harness();
    let fx = Fixture::new();
    let node = fx.local_node(true).await;

    let lease = h.broker.acquire(&node).await.unwrap();
    assert_eq!(lease.endpoint(), local_endpoints()[0].to_string());
    assert_eq!(h.connector.attempts().len(), 1);
}

#[tokio::test]
async fn test_no_local_endpoint_reachable() {
    let h = harness();
    let fx = Fixture::new();
    let node = fx.local_node(true).await;
    h.runtime.fail_always(MockOp::Ping);

    let err = h.broker.acquire(&node).await.err().unwrap();
    match err {
        OrchestratorError::Connectivity(message) => assert!(message.contains("tried")),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(h.connector.attempts().len(), 3);
}

#[tokio::test]
async fn test_remote_lease_owns_its_tunnel() {
    let h = harness();
    let fx = Fixture::new();
    let node = fx.remote_node().await;

    let mut lease = h.broker.acquire(&node).await.unwrap();
    assert!(lease.is_tunneled());
    assert!(lease.endpoint().starts_with("tcp://127.0.0.1:"));
    assert_eq!(h.tunnels.open_tunnels(), 1);

    lease.release().await;
    assert_eq!(h.tunnels.open_tunnels(), 0);
    lease.release().await;
    assert_eq!(h.tunnels.open_tunnels(), 0);
}

#[tokio::test]
async fn test_dropped_lease_closes_tunnel() {
    let h = harness();
    let fx = Fixture::new();
    let node = fx.remote_node().await;

    let lease = h.broker.acquire(&node).await.unwrap();
    assert_eq!(h.tunnels.open_tunnels(), 1);
    drop(lease);
    assert_eq!(h.tunnels.open_tunnels(), 0);
}

#[tokio::test]
async fn test_unreachable_remote_runtime_closes_tunnel() {
    let h = harness();
    let fx = Fixture::new();
    let node = fx.remote_node().await;
    h.runtime.fail_always(MockOp::Ping);

    let err = h.broker.acquire(&node).await.err().unwrap();
    assert!(matches!(err, OrchestratorError::Connectivity(_)));
    assert_eq!(h.tunnels.opened_total(), 1);
    assert_eq!(h.tunnels.open_tunnels(), 0);
}

#[tokio::test]
async fn test_tunnel_failure_is_connectivity_error() {
    let h = harness();
    let fx = Fixture::new();
    let node = fx.remote_node().await;
    h.tunnels.fail_open(true);

    let err = h.broker.acquire(&node).await.err().unwrap();
    assert!(matches!(err, OrchestratorError::Connectivity(_)));
    assert_eq!(h.tunnels.opened_total(), 0);
    assert!(h.connector.attempts().is_empty());
}
