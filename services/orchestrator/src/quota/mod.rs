//! Quota enforcement for limited users.

mod sweeper;
mod worker;

pub use sweeper::{QuotaSweeper, SweepAction, SweepStats};
pub use worker::{QuotaWorker, QuotaWorkerConfig};
