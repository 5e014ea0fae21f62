#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use sparkling_events::{ProgressBroadcaster, ProgressEvent, Subscription};
use sparkling_id::{NodeId, UserId};
use sparkling_orchestrator::{
    broker::{ConnectionBroker, MockConnector, MockTunnelClient, RuntimeEndpoint},
    clock::{Clock, ManualClock},
    config::{BrokerSettings, ClusterSettings, SessionSettings},
    jobs::JobRunner,
    model::{Node, User},
    nodes::StaticKeyPair,
    runtime::MockRuntime,
    state::{AppState, Components, Settings},
    store::{MemoryStore, Store},
};
use sparkling_reconcile::RetryPolicy;
use tempfile::TempDir;

pub const LOCAL_ADDRESS: &str = "10.0.0.1";

pub fn local_endpoints() -> Vec<RuntimeEndpoint> {
    vec![
        RuntimeEndpoint::Unix(PathBuf::from("/var/run/docker.sock")),
        RuntimeEndpoint::Unix(PathBuf::from("/run/user/1000/docker.sock")),
        RuntimeEndpoint::Tcp {
            host: "127.0.0.1".to_string(),
            port: 5763,
        },
    ]
}

/// Orchestrator wired to in-memory collaborators.
pub struct Fixture {
    pub store: Arc<MemoryStore>,
    pub runtime: Arc<MockRuntime>,
    pub connector: Arc<MockConnector>,
    pub tunnels: Arc<MockTunnelClient>,
    pub clock: Arc<ManualClock>,
    pub progress: ProgressBroadcaster,
    pub jobs: JobRunner,
    pub broker: ConnectionBroker,
    pub state: AppState,
    pub shared_dir: TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let runtime = Arc::new(MockRuntime::new());
        let connector = Arc::new(MockConnector::new(runtime.clone()));
        let tunnels = Arc::new(MockTunnelClient::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
        ));
        let progress = ProgressBroadcaster::new();
        let jobs = JobRunner::new(progress.clone());
        let shared_dir = tempfile::tempdir().unwrap();
        let shared = shared_dir.path().join("shared-volume");

        let broker = ConnectionBroker::new(
            connector.clone(),
            tunnels.clone(),
            BrokerSettings {
                local_endpoints: local_endpoints(),
                ..BrokerSettings::default()
            },
        );

        let settings = Settings {
            cluster: ClusterSettings {
                shared_volume: shared.clone(),
                ..ClusterSettings::default()
            },
            session: SessionSettings {
                shared_volume: shared,
                poll_interval: Duration::from_millis(1),
                poll_attempts: 3,
                ..SessionSettings::default()
            },
            retry: RetryPolicy::new(3),
            ..Settings::default()
        };

        let state = AppState::new(
            Components {
                store: store.clone(),
                broker: broker.clone(),
                keys: Arc::new(StaticKeyPair::default()),
                clock: clock.clone(),
                progress: progress.clone(),
                jobs: jobs.clone(),
            },
            settings,
        );

        Self {
            store,
            runtime,
            connector,
            tunnels,
            clock,
            progress,
            jobs,
            broker,
            state,
            shared_dir,
        }
    }

    pub async fn insert_node(&self, name: &str, address: &str, is_local: bool, is_active: bool) -> Node {
        let node = Node {
            id: NodeId::new(),
            name: name.to_string(),
            description: String::new(),
            address: address.to_string(),
            is_local,
            is_active,
            ssh_public_key: "ssh-ed25519 AAAA test".to_string(),
            ssh_private_key: "private".to_string(),
            created_at: self.clock_now(),
        };
        self.store.insert_node(&node).await.unwrap();
        node
    }

    pub async fn local_node(&self, is_active: bool) -> Node {
        self.insert_node("coordinator", LOCAL_ADDRESS, true, is_active)
            .await
    }

    pub async fn remote_node(&self) -> Node {
        self.insert_node("worker", "10.0.0.2", false, false).await
    }

    pub async fn user(&self, balance_hours: f64, unlimited: bool) -> User {
        let user = User {
            id: UserId::new(),
            name: "ada".to_string(),
            balance_hours,
            unlimited,
        };
        self.store.insert_user(&user).await.unwrap();
        user
    }

    pub fn clock_now(&self) -> chrono::DateTime<Utc> {
        self.clock.now()
    }
}

/// Collect every event already delivered to `sub`.
pub fn drain(sub: &mut Subscription) -> Vec<ProgressEvent> {
    use futures_util::FutureExt;

    let mut events = Vec::new();
    while let Some(Some(event)) = sub.recv().now_or_never() {
        events.push(event);
    }
    events
}
