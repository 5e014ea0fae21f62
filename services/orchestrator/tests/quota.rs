mod common;

use std::time::Duration;

use chrono::Duration as ChronoDuration;
use common::Fixture;
use sparkling_id::{SessionId, UserId};
use sparkling_orchestrator::model::{Session, SessionStatus};
use sparkling_orchestrator::quota::{QuotaWorker, QuotaWorkerConfig, SweepStats};
use sparkling_orchestrator::store::Store;
use tokio::sync::watch;

/// A running session for `user_id` that started `hours` ago, with a live
/// container on the local node.
async fn running_for(fx: &Fixture, user_id: UserId, hours: i64) -> Session {
    fx.local_node(true).await;
    let session = fx.state.sessions().request(user_id).await.unwrap();
    fx.jobs.wait_idle().await;

    let mut session = fx.state.sessions().get(session.id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Running);
    session.start_time = fx.clock_now() - ChronoDuration::hours(hours);
    fx.store.save_session(&session).await.unwrap();
    session
}

async fn status_of(fx: &Fixture, id: SessionId) -> SessionStatus {
    fx.store.get_session(id).await.unwrap().unwrap().status
}

#[tokio::test]
async fn test_exhausted_balance_stops_session() {
    let fx = Fixture::new();
    let user = fx.user(1.0, false).await;
    let session = running_for(&fx, user.id, 2).await;
    let container = session.container_id.unwrap();

    let stats = fx.state.sweeper().sweep().await.unwrap();
    assert_eq!(
        stats,
        SweepStats {
            examined: 1,
            orphaned: 0,
            stopped: 1,
            failed: 0,
        }
    );

    let stored = fx.store.get_session(session.id).await.unwrap().unwrap();
    assert_eq!(stored.status, SessionStatus::Stopped);
    assert_eq!(stored.end_time, Some(fx.clock_now()));
    let user = fx.store.get_user(user.id).await.unwrap().unwrap();
    assert_eq!(user.balance_hours, 0.0);

    fx.jobs.wait_idle().await;
    assert!(!fx.runtime.contains(&container.to_string()));
    let stored = fx.store.get_session(session.id).await.unwrap().unwrap();
    assert!(stored.container_id.is_none());
    assert_eq!(stored.status, SessionStatus::Stopped);
}

#[tokio::test]
async fn test_session_within_quota_keeps_running() {
    let fx = Fixture::new();
    let user = fx.user(3.0, false).await;
    let session = running_for(&fx, user.id, 2).await;

    let stats = fx.state.sweeper().sweep().await.unwrap();
    assert_eq!(stats.examined, 1);
    assert_eq!(stats.stopped, 0);
    assert_eq!(status_of(&fx, session.id).await, SessionStatus::Running);
    let user = fx.store.get_user(user.id).await.unwrap().unwrap();
    assert_eq!(user.balance_hours, 3.0);
}

#[tokio::test]
async fn test_unlimited_users_are_exempt() {
    let fx = Fixture::new();
    let user = fx.user(0.5, true).await;
    let session = running_for(&fx, user.id, 10).await;

    let stats = fx.state.sweeper().sweep().await.unwrap();
    assert_eq!(stats.stopped, 0);
    assert_eq!(status_of(&fx, session.id).await, SessionStatus::Running);
}

#[tokio::test]
async fn test_orphaned_session_is_ended() {
    let fx = Fixture::new();
    let session = Session {
        status: SessionStatus::Running,
        ..Session::starting(UserId::new(), fx.clock_now())
    };
    fx.store.insert_session(&session).await.unwrap();

    let stats = fx.state.sweeper().sweep().await.unwrap();
    assert_eq!(stats.orphaned, 1);

    let stored = fx.store.get_session(session.id).await.unwrap().unwrap();
    assert_eq!(stored.status, SessionStatus::Ended);
    assert_eq!(stored.end_time, Some(fx.clock_now()));
}

#[tokio::test]
async fn test_only_running_sessions_are_examined() {
    let fx = Fixture::new();
    let user = fx.user(0.1, false).await;
    let mut session = Session::starting(user.id, fx.clock_now() - ChronoDuration::hours(5));
    fx.store.insert_session(&session).await.unwrap();

    let stats = fx.state.sweeper().sweep().await.unwrap();
    assert_eq!(stats.examined, 0);

    session.status = SessionStatus::Ended;
    session.end_time = Some(fx.clock_now());
    fx.store.save_session(&session).await.unwrap();
    assert_eq!(fx.state.sweeper().sweep().await.unwrap().examined, 0);
}

#[tokio::test]
async fn test_each_session_is_judged_on_its_own() {
    let fx = Fixture::new();
    let over = fx.user(1.0, false).await;
    let under = fx.user(10.0, false).await;
    let over_session = running_for(&fx, over.id, 2).await;

    let under_session = Session {
        status: SessionStatus::Running,
        ..Session::starting(under.id, fx.clock_now() - ChronoDuration::hours(2))
    };
    fx.store.insert_session(&under_session).await.unwrap();

    let stats = fx.state.sweeper().sweep().await.unwrap();
    assert_eq!(stats.examined, 2);
    assert_eq!(stats.stopped, 1);
    assert_eq!(status_of(&fx, over_session.id).await, SessionStatus::Stopped);
    assert_eq!(status_of(&fx, under_session.id).await, SessionStatus::Running);
    fx.jobs.wait_idle().await;
}

#[tokio::test]
async fn test_worker_sweeps_until_shutdown() {
    let fx = Fixture::new();
    let user = fx.user(1.0, false).await;
    let session = running_for(&fx, user.id, 2).await;

    let worker = QuotaWorker::new(
        fx.state.sweeper().clone(),
        QuotaWorkerConfig {
            interval: Duration::from_millis(10),
        },
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move { worker.run(shutdown_rx).await });

    let mut stopped = false;
    for _ in 0..100 {
        if status_of(&fx, session.id).await == SessionStatus::Stopped {
            stopped = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(stopped);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .unwrap()
        .unwrap();
    fx.jobs.wait_idle().await;
}
