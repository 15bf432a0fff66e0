//! Instance reconciliation.
//!
//! A pass fetches the instance, picks the lifecycle action matching the
//! desired state, and for `present` runs diff -> plan -> submit. Nothing is
//! cached between passes; the cluster is the only source of truth.

pub mod diff;
pub mod instance;
pub mod plan;

use serde::Serialize;

use crate::job::{ActionReport, JobOutcome};

pub use instance::{build_create_request, InstanceReconciler};

/// Message reported when a modify pass finds nothing to do.
pub const NOT_MODIFIED: &str = "Instance not modified.";

/// Result of one reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileOutcome {
    pub changed: bool,
    pub message: String,
    /// A hot-unchangeable attribute was altered; the instance must restart
    /// for it to take effect.
    pub reboot_required: bool,
    /// Submitted jobs in submission order.
    #[serde(skip)]
    pub actions: Vec<ActionReport>,
}

impl ReconcileOutcome {
    pub fn unchanged(message: impl Into<String>) -> Self {
        Self {
            changed: false,
            message: message.into(),
            reboot_required: false,
            actions: Vec::new(),
        }
    }

    fn from_actions(actions: Vec<ActionReport>, reboot_required: bool) -> Self {
        let message = actions
            .iter()
            .map(|a| a.message())
            .collect::<Vec<_>>()
            .join(", ");
        Self {
            changed: !actions.is_empty(),
            message,
            reboot_required,
            actions,
        }
    }

    /// False when at least one job was submitted without waiting for it.
    pub fn is_confirmed(&self) -> bool {
        self.actions
            .iter()
            .all(|a| a.outcome == JobOutcome::Completed)
    }
}
