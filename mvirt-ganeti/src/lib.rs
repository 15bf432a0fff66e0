//! mvirt-ganeti - declarative reconciliation of Ganeti instances.
//!
//! Compares a desired instance document with what the cluster reports,
//! derives the legal set of RAPI calls, submits them and tracks the
//! resulting jobs.

pub mod clients;
pub mod config;
pub mod error;
pub mod job;
pub mod reconciler;
pub mod spec;

pub use clients::{ClientError, ControlPlane, JobId, JobStatus, RapiClient};
pub use config::{RapiConfig, ReconcileConfig};
pub use error::{Error, Result};
pub use reconciler::{InstanceReconciler, ReconcileOutcome};
pub use spec::{DesiredState, InstanceSpec};
