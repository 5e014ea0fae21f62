//! User sessions: requests, provisioning, teardown.

mod provisioner;
mod teardown;

pub use provisioner::{SessionCredentials, SessionProvisioner, SESSION_PORT_RANGE};
pub use teardown::SessionTeardown;

use std::sync::Arc;

use sparkling_id::{ContainerId, SessionId, UserId};
use tracing::{info, instrument};

use crate::clock::{elapsed_hours, Clock};
use crate::error::OrchestratorError;
use crate::jobs::{JobReport, JobRunner};
use crate::model::{Session, SessionStatus};
use crate::store::Store;

/// Entry point for session requests. Container work happens in background
/// jobs; callers get the session back as soon as it is recorded.
#[derive(Clone)]
pub struct SessionService {
    store: Arc<dyn Store>,
    provisioner: Arc<SessionProvisioner>,
    teardown: Arc<SessionTeardown>,
    jobs: JobRunner,
    clock: Arc<dyn Clock>,
}

impl SessionService {
    pub fn new(
        store: Arc<dyn Store>,
        provisioner: Arc<SessionProvisioner>,
        teardown: Arc<SessionTeardown>,
        jobs: JobRunner,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            provisioner,
            teardown,
            jobs,
            clock,
        }
    }

    /// Record a `Starting` session for `user_id` and provision it in the
    /// background.
    #[instrument(skip(self))]
    pub async fn request(&self, user_id: UserId) -> Result<Session, OrchestratorError> {
        let user = self
            .store
            .get_user(user_id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found(format!("user {user_id}")))?;
        if !user.unlimited && user.balance_hours <= 0.0 {
            return Err(OrchestratorError::conflict(format!(
                "user {user_id} has no remaining balance"
            )));
        }

        let session = Session::starting(user_id, self.clock.now());
        self.store.insert_session(&session).await?;
        info!(session_id = %session.id, "session requested");

        let provisioner = Arc::clone(&self.provisioner);
        let session_id = session.id;
        let cancel = self.jobs.token();
        self.jobs.spawn("provision_session", async move {
            provisioner.provision(session_id, &cancel).await.map(|_| ())
        });

        Ok(session)
    }

    /// End a live session, charge a limited owner for the time used and
    /// tear its container down in the background.
    #[instrument(skip(self))]
    pub async fn stop(&self, session_id: SessionId) -> Result<Session, OrchestratorError> {
        let mut session = self.get(session_id).await?;
        if !session.status.is_live() {
            return Err(OrchestratorError::conflict(format!(
                "session {session_id} is already {}",
                session.status
            )));
        }

        self.finish(&mut session, SessionStatus::Ended).await?;
        self.store.save_session(&session).await?;
        info!("session stopped");

        if session.container_id.is_some() {
            self.spawn_teardown(session_id);
        }
        Ok(session)
    }

    /// End every session backed by one of `containers`, whose runtime
    /// containers are gone for good, and drop their container links. Live
    /// sessions are charged like a stop; no teardown is queued.
    pub async fn end_detached(
        &self,
        containers: &[ContainerId],
    ) -> Result<usize, OrchestratorError> {
        if containers.is_empty() {
            return Ok(0);
        }

        let mut ended = 0;
        for mut session in self.store.list_sessions(None).await? {
            let Some(container_id) = session.container_id else {
                continue;
            };
            if !containers.contains(&container_id) {
                continue;
            }
            if session.status.is_live() {
                self.finish(&mut session, SessionStatus::Ended).await?;
                ended += 1;
            }
            session.container_id = None;
            self.store.save_session(&session).await?;
            info!(
                session_id = %session.id,
                %container_id,
                "session detached from removed container"
            );
        }
        Ok(ended)
    }

    /// Close `session` with `status` at the current time, debiting a limited
    /// owner for the hours used. The caller persists the session.
    async fn finish(
        &self,
        session: &mut Session,
        status: SessionStatus,
    ) -> Result<(), OrchestratorError> {
        let now = self.clock.now();
        if let Some(mut user) = self.store.get_user(session.user_id).await? {
            if !user.unlimited {
                let used = elapsed_hours(session.start_time, now);
                user.balance_hours = (user.balance_hours - used).max(0.0);
                self.store.save_user(&user).await?;
            }
        }
        session.status = status;
        session.end_time = Some(now);
        Ok(())
    }

    pub async fn get(&self, session_id: SessionId) -> Result<Session, OrchestratorError> {
        self.store
            .get_session(session_id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found(format!("session {session_id}")))
    }

    pub async fn list(&self, user_id: Option<UserId>) -> Result<Vec<Session>, OrchestratorError> {
        Ok(self.store.list_sessions(user_id).await?)
    }

    /// Queue a teardown job for `session_id`.
    pub fn spawn_teardown(&self, session_id: SessionId) {
        let teardown = Arc::clone(&self.teardown);
        let cancel = self.jobs.token();
        self.jobs.spawn_reported(
            "teardown_session",
            JobReport {
                subject: session_id.to_string(),
                node_id: None,
            },
            async move { teardown.teardown(session_id, &cancel).await },
        );
    }
}
