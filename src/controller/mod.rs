//! Controller module for es-operator.
//!
//! Contains the reconciliation loop, the downscale and rolling upgrade
//! strategies driving topology changes, error handling and status reporting.

// Shared modules
pub mod context;
pub mod error;
pub mod results;
pub mod status;

// Topology change strategies
pub mod downscale;
pub mod upgrade;
pub mod zen;

// Reconciliation
pub mod driver;
pub mod reconciler;
