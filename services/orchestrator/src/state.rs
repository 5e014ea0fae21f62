//! Application state shared across request handlers and workers.

use std::sync::Arc;

use sparkling_events::ProgressBroadcaster;
use sparkling_reconcile::RetryPolicy;

use crate::broker::ConnectionBroker;
use crate::clock::Clock;
use crate::config::{BrokerSettings, ClusterSettings, Config, SessionSettings};
use crate::convergence::{ConvergenceEngine, NodeActivator};
use crate::jobs::JobRunner;
use crate::nodes::{KeyPairGenerator, NodeRegistry};
use crate::quota::QuotaSweeper;
use crate::sessions::{SessionProvisioner, SessionService, SessionTeardown};
use crate::store::Store;

/// Collaborators the orchestrator is assembled from.
pub struct Components {
    pub store: Arc<dyn Store>,
    pub broker: ConnectionBroker,
    pub keys: Arc<dyn KeyPairGenerator>,
    pub clock: Arc<dyn Clock>,
    pub progress: ProgressBroadcaster,
    pub jobs: JobRunner,
}

/// Workflow tuning.
#[derive(Debug, Clone)]
pub struct Settings {
    pub cluster: ClusterSettings,
    pub session: SessionSettings,
    pub retry: RetryPolicy,
    pub runtime_port: u16,
    pub ssh_user: String,
}

impl Default for Settings {
    fn default() -> Self {
        let broker = BrokerSettings::default();
        Self {
            cluster: ClusterSettings::default(),
            session: SessionSettings::default(),
            retry: RetryPolicy::default(),
            runtime_port: broker.remote_runtime_port,
            ssh_user: broker.ssh_user,
        }
    }
}

impl Settings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            cluster: config.cluster.clone(),
            session: config.session.clone(),
            retry: RetryPolicy::new(config.retry_attempts),
            runtime_port: config.broker.remote_runtime_port,
            ssh_user: config.broker.ssh_user.clone(),
        }
    }
}

/// Shared application state.
///
/// Passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    store: Arc<dyn Store>,
    progress: ProgressBroadcaster,
    jobs: JobRunner,
    nodes: NodeRegistry,
    activator: Arc<NodeActivator>,
    sessions: SessionService,
    sweeper: Arc<QuotaSweeper>,
}

impl AppState {
    pub fn new(components: Components, settings: Settings) -> Self {
        let Components {
            store,
            broker,
            keys,
            clock,
            progress,
            jobs,
        } = components;

        let engine = ConvergenceEngine::new(
            Arc::clone(&store),
            broker.clone(),
            settings.cluster,
            settings.retry,
            progress.clone(),
            Arc::clone(&clock),
        );
        let activator = Arc::new(NodeActivator::new(
            Arc::clone(&store),
            engine,
            progress.clone(),
        ));

        let provisioner = Arc::new(SessionProvisioner::new(
            Arc::clone(&store),
            broker.clone(),
            settings.session,
            settings.retry,
            progress.clone(),
            Arc::clone(&clock),
        ));
        let teardown = Arc::new(SessionTeardown::new(
            Arc::clone(&store),
            broker.clone(),
            settings.retry,
            progress.clone(),
        ));
        let sessions = SessionService::new(
            Arc::clone(&store),
            provisioner,
            teardown,
            jobs.clone(),
            Arc::clone(&clock),
        );
        let sweeper = Arc::new(QuotaSweeper::new(
            Arc::clone(&store),
            sessions.clone(),
            Arc::clone(&clock),
        ));

        let nodes = NodeRegistry::new(
            Arc::clone(&store),
            broker,
            keys,
            sessions.clone(),
            progress.clone(),
            clock,
            settings.runtime_port,
            settings.ssh_user,
        );

        Self {
            inner: Arc::new(AppStateInner {
                store,
                progress,
                jobs,
                nodes,
                activator,
                sessions,
                sweeper,
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.inner.store
    }

    pub fn progress(&self) -> &ProgressBroadcaster {
        &self.inner.progress
    }

    pub fn jobs(&self) -> &JobRunner {
        &self.inner.jobs
    }

    pub fn nodes(&self) -> &NodeRegistry {
        &self.inner.nodes
    }

    pub fn activator(&self) -> &Arc<NodeActivator> {
        &self.inner.activator
    }

    pub fn sessions(&self) -> &SessionService {
        &self.inner.sessions
    }

    pub fn sweeper(&self) -> &Arc<QuotaSweeper> {
        &self.inner.sweeper
    }
}
