//! Condition bookkeeping on the group status.
//!
//! Conditions are keyed by type: writing a condition replaces the previous
//! one of the same type. The transition time only moves when the status
//! value actually changes.

use chrono::{DateTime, Utc};
use keepalived_api::{Condition, KeepalivedGroupStatus};

/// Condition type set after a successful pass.
pub const RECONCILE_SUCCESS: &str = "ReconcileSuccess";

/// Condition type set after a failed pass.
pub const RECONCILE_ERROR: &str = "ReconcileError";

pub const RECONCILE_SUCCESS_REASON: &str = "LastReconcileCycleSucceded";
pub const RECONCILE_ERROR_REASON: &str = "LastReconcileCycleFailed";

pub const STATUS_TRUE: &str = "True";
pub const STATUS_FALSE: &str = "False";

/// Add or replace the condition with the same type.
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time;
            }
            *existing = condition;
        }
        None => conditions.push(condition),
    }
}

/// Remove the condition with the given type. Returns true if one was removed.
pub fn remove_condition(conditions: &mut Vec<Condition>, type_: &str) -> bool {
    let before = conditions.len();
    conditions.retain(|c| c.type_ != type_);
    conditions.len() != before
}

fn condition(
    type_: &str,
    status: &str,
    reason: &str,
    message: String,
    generation: Option<i64>,
    now: DateTime<Utc>,
) -> Condition {
    Condition {
        type_: type_.to_string(),
        status: status.to_string(),
        reason: reason.to_string(),
        message,
        last_transition_time: now,
        observed_generation: generation,
    }
}

/// Record a successful pass. Clears any previous error condition.
pub fn mark_success(status: &mut KeepalivedGroupStatus, generation: Option<i64>, now: DateTime<Utc>) {
    set_condition(
        &mut status.conditions,
        condition(
            RECONCILE_SUCCESS,
            STATUS_TRUE,
            RECONCILE_SUCCESS_REASON,
            String::new(),
            generation,
            now,
        ),
    );
    remove_condition(&mut status.conditions, RECONCILE_ERROR);
}

/// Record a failed pass with the error text as message.
pub fn mark_error(
    status: &mut KeepalivedGroupStatus,
    generation: Option<i64>,
    message: &str,
    now: DateTime<Utc>,
) {
    set_condition(
        &mut status.conditions,
        condition(
            RECONCILE_ERROR,
            STATUS_TRUE,
            RECONCILE_ERROR_REASON,
            message.to_string(),
            generation,
            now,
        ),
    );
    set_condition(
        &mut status.conditions,
        condition(
            RECONCILE_SUCCESS,
            STATUS_FALSE,
            RECONCILE_ERROR_REASON,
            message.to_string(),
            generation,
            now,
        ),
    );
}
