//! Sparkling orchestrator library.
//!
//! Ships the `orchestrator` binary; the library surface exists so the
//! workflows can be driven from integration tests with in-memory runtimes,
//! tunnels and stores.

pub mod api;
pub mod broker;
pub mod clock;
pub mod config;
pub mod convergence;
pub mod db;
pub mod error;
pub mod jobs;
pub mod model;
pub mod nodes;
pub mod quota;
pub mod runtime;
pub mod sessions;
pub mod state;
pub mod store;
