//! Two reconciliation strategies with different trust models.
//!
//! [`KeyedMerge`] is the recorder path: the local baseline is authoritative
//! for order, incoming turns revise in place or append. [`WholesaleReplace`]
//! is the subscriber path: the upstream snapshot is already reconciled
//! server-side and replaces the list outright. They are deliberately not
//! unified; the call sites make different assumptions about how complete an
//! incoming set is.

use crate::types::Turn;

pub trait TurnReconciler: Send + Sync {
    fn reconcile(&self, baseline: &[Turn], incoming: Vec<Turn>) -> Vec<Turn>;
}

/// Strategy A: replace by `turn_id` at the same index, append unknown ids at
/// the end in incoming order. Never sorts; `turn_index` is only comparable
/// within one sub-session, and the baseline already has the true order.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyedMerge;

impl TurnReconciler for KeyedMerge {
    fn reconcile(&self, baseline: &[Turn], incoming: Vec<Turn>) -> Vec<Turn> {
        let mut merged = baseline.to_vec();

        for turn in incoming {
            match merged.iter().position(|existing| same_turn(existing, &turn)) {
                Some(idx) => merged[idx] = turn,
                None => merged.push(turn),
            }
        }

        merged
    }
}

/// Strategy B: the incoming set wins wholesale.
#[derive(Debug, Clone, Copy, Default)]
pub struct WholesaleReplace;

impl TurnReconciler for WholesaleReplace {
    fn reconcile(&self, _baseline: &[Turn], incoming: Vec<Turn>) -> Vec<Turn> {
        incoming
    }
}

fn same_turn(existing: &Turn, incoming: &Turn) -> bool {
    match (existing.turn_id, incoming.turn_id) {
        (Some(a), Some(b)) => a == b,
        // Not yet persisted on either side: match on the provider result id.
        (None, None) => !incoming.result_id.is_empty() && existing.result_id == incoming.result_id,
        _ => false,
    }
}
