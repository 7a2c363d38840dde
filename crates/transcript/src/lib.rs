pub mod reconcile;
pub mod snapshot;
pub mod types;

pub use reconcile::{KeyedMerge, TurnReconciler, WholesaleReplace};
pub use snapshot::turns_from_snapshot;
pub use types::{Speaker, Turn, WordTimestamp};
