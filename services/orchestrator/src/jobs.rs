//! Tracked background jobs.
//!
//! Activation, provisioning and teardown are triggered by requests but run
//! detached from them. Jobs are tracked so shutdown can cancel and drain
//! them, and failures are logged (and optionally reported to observers)
//! instead of vanishing with the task.

use std::future::Future;
use std::time::Duration;

use sparkling_events::{ProgressBroadcaster, ProgressEvent, ProgressStep};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::error::OrchestratorError;

/// What to tell observers when a job fails.
#[derive(Debug, Clone)]
pub struct JobReport {
    pub subject: String,
    pub node_id: Option<String>,
}

#[derive(Clone)]
pub struct JobRunner {
    tracker: TaskTracker,
    cancel: CancellationToken,
    progress: ProgressBroadcaster,
}

impl JobRunner {
    pub fn new(progress: ProgressBroadcaster) -> Self {
        Self {
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            progress,
        }
    }

    /// Token for a new job; cancelled on shutdown.
    pub fn token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    /// Spawn a job whose failures are only logged.
    pub fn spawn<F>(&self, name: &'static str, job: F)
    where
        F: Future<Output = Result<(), OrchestratorError>> + Send + 'static,
    {
        self.spawn_inner(name, None, job);
    }

    /// Spawn a job whose failures are also broadcast as `error` events.
    pub fn spawn_reported<F>(&self, name: &'static str, report: JobReport, job: F)
    where
        F: Future<Output = Result<(), OrchestratorError>> + Send + 'static,
    {
        self.spawn_inner(name, Some(report), job);
    }

    fn spawn_inner<F>(&self, name: &'static str, report: Option<JobReport>, job: F)
    where
        F: Future<Output = Result<(), OrchestratorError>> + Send + 'static,
    {
        let progress = self.progress.clone();
        self.tracker.spawn(async move {
            match job.await {
                Ok(()) => debug!(job = name, "job finished"),
                Err(OrchestratorError::Cancelled) => info!(job = name, "job cancelled"),
                Err(e) => {
                    error!(job = name, error = %e, "job failed");
                    if let Some(report) = report {
                        let mut event = ProgressEvent::new(
                            &report.subject,
                            ProgressStep::Error,
                            format!("{name} failed: {e}"),
                        );
                        event.node_id = report.node_id;
                        progress.broadcast(event);
                    }
                }
            }
        });
    }

    /// Number of jobs still running.
    pub fn active(&self) -> usize {
        self.tracker.len()
    }

    /// Wait until every job spawned so far has finished. New jobs may be
    /// spawned while waiting; they are waited for too.
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Cancel all jobs and wait up to `timeout` for them to finish.
    /// Returns false if some jobs were still running at the deadline.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.cancel.cancel();
        self.tracker.close();
        tokio::time::timeout(timeout, self.tracker.wait())
            .await
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reported_failure_reaches_observers() {
        let progress = ProgressBroadcaster::new();
        let mut sub = progress.subscribe(8);
        let jobs = JobRunner::new(progress);

        jobs.spawn_reported(
            "teardown",
            JobReport {
                subject: "ses_1".into(),
                node_id: Some("node_1".into()),
            },
            async { Err(OrchestratorError::runtime("boom")) },
        );
        jobs.wait_idle().await;

        let event = sub.recv().await.unwrap();
        assert!(event.is_error());
        assert_eq!(event.subject, "ses_1");
        assert_eq!(event.node_id.as_deref(), Some("node_1"));
        assert!(event.message.contains("boom"));
    }

    #[tokio::test]
    async fn test_unreported_failure_is_silent() {
        let progress = ProgressBroadcaster::new();
        let mut sub = progress.subscribe(8);
        let jobs = JobRunner::new(progress.clone());

        jobs.spawn("activate", async { Err(OrchestratorError::runtime("boom")) });
        jobs.wait_idle().await;
        drop(jobs);

        progress.unsubscribe(sub.id());
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_cancels_jobs() {
        let jobs = JobRunner::new(ProgressBroadcaster::new());
        let token = jobs.token();
        jobs.spawn("wait", async move {
            token.cancelled().await;
            Err(OrchestratorError::Cancelled)
        });
        assert_eq!(jobs.active(), 1);
        assert!(jobs.shutdown(Duration::from_secs(1)).await);
        assert_eq!(jobs.active(), 0);
    }
}
