//! cutover-orchestrator — the entry point for deployments.
//!
//! The `Orchestrator` owns the service registry and the set of running
//! deployments. It:
//! - Registers services and persists them to the history store
//! - Accepts deployment requests, at most one non-terminal per service
//! - Runs each deployment's state machine on its own tokio task
//! - Appends terminal deployments to the history store
//! - Answers status, cancel, and history queries

pub mod error;
pub mod orchestrator;

pub use error::{OrchestratorError, OrchestratorResult};
pub use orchestrator::Orchestrator;
