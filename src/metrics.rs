//! Event Metrics
//!
//! A single counter vector counts drive events handled and consistency
//! checks performed. Every event type is pre-registered at 0 so that users
//! know which (possibly rare) events can occur.

use once_cell::sync::Lazy;
use prometheus::{register_int_counter_vec, IntCounterVec};

/// Counts events processed by the converger, labeled by event type.
pub static EVENT_COUNTER: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "swift_drive_autopilot_events",
        "Counts drive events handled and consistency checks performed.",
        &["type"]
    )
    .unwrap()
});

/// All event type labels, in a fixed order.
pub const EVENT_TYPES: &[&str] = &[
    "drive-added",
    "drive-removed",
    "drive-error",
    "drive-reinstated",
    "consistency-check",
];

/// Force registration of the counter and pre-register every event type at 0.
pub fn register_event_types() {
    for event_type in EVENT_TYPES {
        EVENT_COUNTER.with_label_values(&[event_type]).inc_by(0);
    }
}
