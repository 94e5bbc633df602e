//! Meshstore: Replicated-Store Engine
//!
//! CRDT stores materialized from causal operation logs, live views that
//! redeliver materialized content on every change, reachability tracking over
//! stores that reference each other by address, and recursive store merging.

pub mod config;
pub mod engine;
pub mod error;
pub mod live;
pub mod logging;
pub mod merge;
pub mod reach;
pub mod registry;
pub mod store;
pub mod types;

pub use engine::Engine;
pub use error::{EngineError, StoreError};
pub use live::{Callback, Forget};
pub use store::{Store, StoreKind, StoreProvider};
pub use types::{Address, Map, Value};
