//! Provides types and functions that are common to both the runner and operator.
#![deny(missing_docs)]
pub mod load_test;
#[cfg(feature = "telemetry")]
pub mod telemetry;
