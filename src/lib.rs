//! Keeps three stores of academic documents consistent: canonical blob
//! storage, the SQLite catalog and the full-text search index.

pub mod config;
pub mod reconcile;
pub mod vault;

pub use config::Config;
pub use reconcile::{JobOptions, JobReport, Reconciler};
