//! Reconciliation of LoadTest resources into gang-scheduled worker pods.

/// Cluster snapshot used for admission decisions.
pub mod cluster;
/// Controller arm reconciling LoadTest resources.
pub mod controller;
/// Pure construction of worker pod specs.
pub mod pod;
/// Status derivation from observed pods.
pub mod status;

pub use controller::run;

/// Key of the scenarios ConfigMap entry and name of the mounted file.
pub const SCENARIOS_KEY: &str = "scenarios.json";
