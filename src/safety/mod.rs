pub mod reconcile;
pub mod state;

pub use reconcile::{reconcile_snapshots, PositionSnapshot, ReconcileMode, ReconcileParams, ReconciliationResult};
pub use state::{SafetyMode, SafetyService, SafetyStateSnapshot};
