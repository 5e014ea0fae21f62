//! # sparkling-events
//!
//! Progress events emitted by long-running orchestrator workflows and the
//! broadcaster that fans them out to observers.
//!
//! ## Design Principles
//!
//! - Delivery is best-effort: a slow or gone observer is dropped, never waited on
//! - Broadcasting never fails and never blocks the emitting workflow
//! - Events carry human-readable messages, never secrets (tokens, keys)

mod broadcaster;
mod error;
mod event;

pub use broadcaster::{ProgressBroadcaster, SubscriberId, Subscription};
pub use error::EventError;
pub use event::{ProgressEvent, ProgressStep};
