//! Custom Resource Definitions (CRDs) for es-operator.
//!
//! - `Elasticsearch`: desired cluster topology and change budget

mod elasticsearch;

pub use elasticsearch::*;
