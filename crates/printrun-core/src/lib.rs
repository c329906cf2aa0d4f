//! Production run lifecycle and material reconciliation.
//!
//! - [`run`]: run state machine, creation, edits and terminal transitions
//! - [`plate`]: per-plate lifecycle and item rollup
//! - [`reconcile`]: material weights, costs and variance
//! - [`metrics`]: run-level cost and yield aggregates
//! - [`ledger`]: the only writer of spool weights
//! - [`catalog`]: failure reasons accepted by `fail_run`

pub mod catalog;
pub mod error;
pub mod ledger;
pub mod metrics;
pub mod plate;
pub mod reconcile;
pub mod run;

pub use error::{Entity, FieldError, RunError, RunResult};
