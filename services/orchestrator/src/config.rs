use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::broker::RuntimeEndpoint;
use crate::db::DbConfig;

/// Settings for the cluster (coordinator/worker) containers.
#[derive(Debug, Clone)]
pub struct ClusterSettings {
    pub image: String,
    pub image_tag: String,
    /// Host directory bind-mounted into every container at `/shared-volume`.
    pub shared_volume: PathBuf,
    /// Reserve all GPUs for cluster containers.
    pub gpu: bool,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            image: "spark-cuda".to_string(),
            image_tag: "latest".to_string(),
            shared_volume: PathBuf::from("./shared-volume"),
            gpu: false,
        }
    }
}

/// Settings for per-user session containers.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub image: String,
    pub image_tag: String,
    pub shared_volume: PathBuf,
    pub token_env: String,
    pub port_env: String,
    pub poll_interval: Duration,
    pub poll_attempts: u32,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            image: "jupyter-custom".to_string(),
            image_tag: "latest".to_string(),
            shared_volume: PathBuf::from("./shared-volume"),
            token_env: "JUPYTER_TOKEN".to_string(),
            port_env: "JUPYTER_PORT".to_string(),
            poll_interval: Duration::from_secs(10),
            poll_attempts: 10,
        }
    }
}

/// How the broker reaches container runtimes.
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    /// Ordered fallback chain for the local node.
    pub local_endpoints: Vec<RuntimeEndpoint>,
    /// Port the runtime listens on inside remote nodes.
    pub remote_runtime_port: u16,
    pub ssh_user: String,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            local_endpoints: RuntimeEndpoint::local_defaults(5763),
            remote_runtime_port: 5763,
            ssh_user: "sparkling".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    pub database: DbConfig,
    pub cluster: ClusterSettings,
    pub session: SessionSettings,
    pub broker: BrokerSettings,
    pub quota_interval: Duration,
    pub retry_attempts: u32,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let listen_addr = std::env::var("SPARKLING_LISTEN_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
            .parse()
            .context("invalid SPARKLING_LISTEN_ADDR")?;

        let log_level = std::env::var("SPARKLING_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let database = DbConfig::from_env();

        let shared_volume = std::env::var("SPARKLING_SHARED_VOLUME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./shared-volume"));

        let gpu = std::env::var("SPARKLING_GPU")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let cluster = ClusterSettings {
            image: std::env::var("SPARKLING_CLUSTER_IMAGE")
                .unwrap_or_else(|_| "spark-cuda".to_string()),
            image_tag: std::env::var("SPARKLING_CLUSTER_IMAGE_TAG")
                .unwrap_or_else(|_| "latest".to_string()),
            shared_volume: shared_volume.clone(),
            gpu,
        };

        let defaults = SessionSettings::default();
        let session = SessionSettings {
            image: std::env::var("SPARKLING_SESSION_IMAGE")
                .unwrap_or_else(|_| "jupyter-custom".to_string()),
            image_tag: std::env::var("SPARKLING_SESSION_IMAGE_TAG")
                .unwrap_or_else(|_| "latest".to_string()),
            shared_volume,
            poll_interval: env_parse("SPARKLING_SESSION_POLL_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            poll_attempts: env_parse("SPARKLING_SESSION_POLL_ATTEMPTS")
                .unwrap_or(defaults.poll_attempts),
            ..defaults
        };

        let remote_runtime_port: u16 = env_parse("SPARKLING_RUNTIME_PORT").unwrap_or(5763);
        let local_endpoints = match std::env::var("SPARKLING_LOCAL_ENDPOINTS") {
            Ok(raw) => RuntimeEndpoint::parse_list(&raw)
                .context("invalid SPARKLING_LOCAL_ENDPOINTS")?,
            Err(_) => RuntimeEndpoint::local_defaults(remote_runtime_port),
        };
        let broker = BrokerSettings {
            local_endpoints,
            remote_runtime_port,
            ssh_user: std::env::var("SPARKLING_SSH_USER")
                .unwrap_or_else(|_| "sparkling".to_string()),
        };

        let quota_interval = Duration::from_secs(
            env_parse("SPARKLING_QUOTA_INTERVAL_SECS").unwrap_or(300),
        );

        let retry_attempts = env_parse("SPARKLING_RETRY_ATTEMPTS")
            .unwrap_or(sparkling_reconcile::DEFAULT_MAX_ATTEMPTS);

        Ok(Self {
            listen_addr,
            log_level,
            database,
            cluster,
            session,
            broker,
            quota_interval,
            retry_attempts,
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_runtime_port() {
        let broker = BrokerSettings::default();
        assert_eq!(broker.remote_runtime_port, 5763);
        assert_eq!(broker.local_endpoints.len(), 3);
        assert_eq!(broker.ssh_user, "sparkling");
    }

    #[test]
    fn test_session_defaults() {
        let session = SessionSettings::default();
        assert_eq!(session.token_env, "JUPYTER_TOKEN");
        assert_eq!(session.port_env, "JUPYTER_PORT");
        assert_eq!(session.poll_attempts, 10);
        assert_eq!(session.poll_interval, Duration::from_secs(10));
    }
}
