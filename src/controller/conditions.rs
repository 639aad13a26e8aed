//! Condition management helpers following Kubernetes API conventions

use chrono::Utc;

use crate::crd::Condition;

/// Condition types
pub const CONDITION_TYPE_READY: &str = "Ready";
pub const CONDITION_TYPE_ANNOTATIONS_VALID: &str = "AnnotationsValid";

/// Standard condition statuses
pub const CONDITION_STATUS_TRUE: &str = "True";
pub const CONDITION_STATUS_FALSE: &str = "False";

/// Ready reasons
pub const REASON_SYNCED: &str = "Synced";
pub const REASON_INVALID_SPEC: &str = "InvalidSpec";
pub const REASON_DEPENDENCY_PENDING: &str = "DependencyPending";
pub const REASON_INVALID_ANNOTATION: &str = "InvalidAnnotation";
pub const REASON_ANNOTATIONS_PARSED: &str = "AnnotationsParsed";

/// Update or add a condition to the conditions list
///
/// The transition time only moves when the status flips. Returns whether
/// anything observable changed.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: &str,
    reason: &str,
    message: &str,
    observed_generation: Option<i64>,
) -> bool {
    let now = Utc::now().to_rfc3339();

    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == type_) {
        let changed = existing.status != status
            || existing.reason != reason
            || existing.message != message
            || existing.observed_generation != observed_generation;

        if existing.status != status {
            existing.last_transition_time = now;
        }
        existing.status = status.to_string();
        existing.reason = reason.to_string();
        existing.message = message.to_string();
        existing.observed_generation = observed_generation;
        changed
    } else {
        conditions.push(Condition {
            type_: type_.to_string(),
            status: status.to_string(),
            last_transition_time: now,
            reason: reason.to_string(),
            message: message.to_string(),
            observed_generation,
        });
        true
    }
}

/// Find a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Check if a condition is true
pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_)
        .map(|c| c.status == CONDITION_STATUS_TRUE)
        .unwrap_or(false)
}

/// Remove a condition by type
pub fn remove_condition(conditions: &mut Vec<Condition>, type_: &str) {
    conditions.retain(|c| c.type_ != type_);
}

/// Set Ready, True or False
pub fn set_ready(
    conditions: &mut Vec<Condition>,
    ready: bool,
    reason: &str,
    message: &str,
    observed_generation: Option<i64>,
) -> bool {
    let status = if ready {
        CONDITION_STATUS_TRUE
    } else {
        CONDITION_STATUS_FALSE
    };
    set_condition(
        conditions,
        CONDITION_TYPE_READY,
        status,
        reason,
        message,
        observed_generation,
    )
}

/// Whether the given generation already failed validation
pub fn invalid_for_generation(conditions: &[Condition], generation: Option<i64>) -> bool {
    find_condition(conditions, CONDITION_TYPE_READY).is_some_and(|c| {
        c.status == CONDITION_STATUS_FALSE
            && c.reason == REASON_INVALID_SPEC
            && c.observed_generation.is_some()
            && c.observed_generation == generation
    })
}
