//! cutover-state — embedded persistence for Cutover.
//!
//! Backed by [redb](https://docs.rs/redb). Holds two things:
//!
//! - the service registry (one JSON-encoded `ServiceSpec` per service id)
//! - the deployment history, an append-only log of terminal `Deployment`
//!   records keyed by deployment id
//!
//! History is never pruned here; retention belongs to whoever operates the
//! database file. The `StateStore` is `Clone + Send + Sync` (an
//! `Arc<Database>` inside) and is shared across async tasks.

pub mod error;
pub mod history;
pub mod store;
pub mod tables;

pub use error::{StateError, StateResult};
pub use history::HistoryStore;
pub use store::StateStore;
