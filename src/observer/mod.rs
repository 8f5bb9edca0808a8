//! Cluster state observation.
//!
//! - `state`: `EsState`, the per-pass memoizing cache of cluster facts
//! - `manager`: `ObserverManager`, background health polling per cluster

pub mod manager;
pub mod state;

pub use manager::{ClusterKey, ObserverManager};
pub use state::{EsState, Memo};
