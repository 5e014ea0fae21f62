use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::clock::{elapsed_hours, Clock};
use crate::error::OrchestratorError;
use crate::model::{Session, SessionStatus};
use crate::sessions::SessionService;
use crate::store::Store;

/// What a sweep did with one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepAction {
    /// Owner no longer exists; session ended.
    Orphaned,
    Unlimited,
    WithinQuota,
    /// Balance exhausted; session stopped and teardown queued.
    Stopped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub examined: usize,
    pub orphaned: usize,
    pub stopped: usize,
    pub failed: usize,
}

/// Stops running sessions whose owners have used up their balance.
pub struct QuotaSweeper {
    store: Arc<dyn Store>,
    sessions: SessionService,
    clock: Arc<dyn Clock>,
}

impl QuotaSweeper {
    pub fn new(store: Arc<dyn Store>, sessions: SessionService, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            sessions,
            clock,
        }
    }

    /// One pass over every running session. Each session is committed on
    /// its own; a failure is counted and the pass moves on.
    #[instrument(skip(self))]
    pub async fn sweep(&self) -> Result<SweepStats, OrchestratorError> {
        let running = self
            .store
            .sessions_with_status(SessionStatus::Running)
            .await?;

        let mut stats = SweepStats::default();
        for session in running.into_iter().filter(|s| s.end_time.is_none()) {
            stats.examined += 1;
            let session_id = session.id;
            match self.enforce(session).await {
                Ok(SweepAction::Orphaned) => stats.orphaned += 1,
                Ok(SweepAction::Stopped) => stats.stopped += 1,
                Ok(_) => {}
                Err(e) => {
                    warn!(%session_id, error = %e, "quota enforcement failed for session");
                    stats.failed += 1;
                }
            }
        }

        if stats.orphaned > 0 || stats.stopped > 0 || stats.failed > 0 {
            info!(
                examined = stats.examined,
                orphaned = stats.orphaned,
                stopped = stats.stopped,
                failed = stats.failed,
                "quota sweep complete"
            );
        }
        Ok(stats)
    }

    async fn enforce(&self, mut session: Session) -> Result<SweepAction, OrchestratorError> {
        let now = self.clock.now();

        let Some(mut user) = self.store.get_user(session.user_id).await? else {
            session.status = SessionStatus::Ended;
            session.end_time = Some(now);
            self.store.save_session(&session).await?;
            if session.container_id.is_some() {
                self.sessions.spawn_teardown(session.id);
            }
            return Ok(SweepAction::Orphaned);
        };

        if user.unlimited {
            return Ok(SweepAction::Unlimited);
        }

        let used = elapsed_hours(session.start_time, now);
        if used <= user.balance_hours {
            return Ok(SweepAction::WithinQuota);
        }

        session.status = SessionStatus::Stopped;
        session.end_time = Some(now);
        user.balance_hours = 0.0;
        self.store.save_user(&user).await?;
        self.store.save_session(&session).await?;
        info!(
            session_id = %session.id,
            user_id = %user.id,
            used_hours = used,
            "session stopped: balance exhausted"
        );

        self.sessions.spawn_teardown(session.id);
        Ok(SweepAction::Stopped)
    }
}
