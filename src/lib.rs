//! fixloop library crate
//!
//! Exposes the loop and its parts so the CLI, integration tests and other
//! drivers can plug in their own proposer, oracle and telemetry.

pub mod branch;
pub mod config;
pub mod control;
pub mod critic;
pub mod diff;
pub mod git_ops;
pub mod oracle;
pub mod patch;
pub mod proposer;
pub mod safety;
pub mod telemetry;
pub mod util;
pub mod validate;
pub mod violation;
