//! Control-plane collaborator.
//!
//! The reconciler only talks to Ganeti through [`ControlPlane`]. The RAPI
//! client is the production implementation; tests inject an in-memory fake.

pub mod rapi;
pub mod types;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use rapi::RapiClient;
pub use types::{
    BeParams, CreateInstanceRequest, DiskParams, GroupInfo, GrowDiskRequest, InstanceStatus,
    ModOp, ModifyInstanceRequest, NicParams, ObservedBeParams, ObservedInstance,
    RenameInstanceRequest, StopReason,
};

/// Errors reported by the control-plane client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The requested object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// DNS or connection failure; nothing was sent.
    #[error("could not reach {address}: {message}")]
    Unreachable { address: String, message: String },

    /// Non-success HTTP answer.
    #[error("{status}: {message}")]
    Api { status: u16, message: String },

    /// Answer could not be decoded.
    #[error("invalid response: {0}")]
    Decode(String),

    /// Request failed after connecting (timeout, reset...).
    #[error("request failed: {0}")]
    Request(String),
}

/// Opaque identifier of a submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        JobId(s.to_string())
    }
}

/// Job state as reported by the job queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Waiting,
    Canceling,
    Running,
    Success,
    Error,
    Canceled,
}

impl JobStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Error | JobStatus::Canceled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Waiting => "waiting",
            JobStatus::Canceling => "canceling",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Error => "error",
            JobStatus::Canceled => "canceled",
        }
    }
}

impl FromStr for JobStatus {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "waiting" => Ok(JobStatus::Waiting),
            "canceling" => Ok(JobStatus::Canceling),
            "running" => Ok(JobStatus::Running),
            "success" => Ok(JobStatus::Success),
            "error" => Ok(JobStatus::Error),
            "canceled" => Ok(JobStatus::Canceled),
            other => Err(ClientError::Decode(format!("unknown job status {}", other))),
        }
    }
}

/// Operations the reconciler needs from the cluster.
///
/// Every mutating call returns the id of the job Ganeti queued for it; the
/// call itself does not wait for the job.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Fetch an instance; `ClientError::NotFound` when it does not exist.
    async fn get_instance(&self, name: &str) -> Result<ObservedInstance, ClientError>;

    async fn create_instance(&self, request: &CreateInstanceRequest) -> Result<JobId, ClientError>;

    async fn modify_instance(
        &self,
        name: &str,
        request: &ModifyInstanceRequest,
    ) -> Result<JobId, ClientError>;

    async fn delete_instance(&self, name: &str) -> Result<JobId, ClientError>;

    async fn startup_instance(&self, name: &str) -> Result<JobId, ClientError>;

    async fn shutdown_instance(&self, name: &str) -> Result<JobId, ClientError>;

    async fn reboot_instance(&self, name: &str) -> Result<JobId, ClientError>;

    async fn migrate_instance(&self, name: &str) -> Result<JobId, ClientError>;

    async fn rename_instance(
        &self,
        name: &str,
        request: &RenameInstanceRequest,
    ) -> Result<JobId, ClientError>;

    async fn add_instance_tags(&self, name: &str, tags: &[String]) -> Result<JobId, ClientError>;

    async fn delete_instance_tags(&self, name: &str, tags: &[String])
        -> Result<JobId, ClientError>;

    async fn grow_instance_disk(
        &self,
        name: &str,
        request: &GrowDiskRequest,
    ) -> Result<JobId, ClientError>;

    /// Names of all node groups.
    async fn get_groups(&self) -> Result<Vec<String>, ClientError>;

    async fn get_group(&self, name: &str) -> Result<GroupInfo, ClientError>;

    /// Current state of a job; the job tracker polls this.
    async fn job_status(&self, job: &JobId) -> Result<JobStatus, ClientError>;
}
