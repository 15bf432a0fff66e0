//! Reconciliation error types.

use thiserror::Error;

use crate::clients::{ClientError, JobId};

/// Errors that abort a reconciliation pass.
#[derive(Debug, Error)]
pub enum Error {
    /// Illegal or contradictory desired state (disk shrink, disk removal,
    /// excess NIC removal, group change, nested osparams, bad NIC key...).
    #[error("instance {instance}: {message}")]
    Configuration { instance: String, message: String },

    /// Action requested against a state that forbids it.
    #[error("instance {instance}: {message}")]
    Precondition { instance: String, message: String },

    /// Control plane answered with something other than success.
    #[error("control plane error: {0}")]
    Transport(String),

    /// Control plane could not be reached at all.
    #[error("could not reach ganeti master {address}: {message}")]
    HostUnreachable { address: String, message: String },

    /// Job did not finish within the configured window.
    #[error("{action} action for instance {instance} timed out waiting for job {job_id}")]
    JobTimeout {
        instance: String,
        action: String,
        job_id: JobId,
    },

    /// Control plane reported the job as failed or canceled.
    #[error("{action} action for instance {instance} failed with job_id: {job_id} ({status})")]
    JobFailed {
        instance: String,
        action: String,
        job_id: JobId,
        status: String,
    },
}

impl Error {
    pub fn configuration(instance: &str, message: impl Into<String>) -> Self {
        Error::Configuration {
            instance: instance.to_string(),
            message: message.into(),
        }
    }

    pub fn precondition(instance: &str, message: impl Into<String>) -> Self {
        Error::Precondition {
            instance: instance.to_string(),
            message: message.into(),
        }
    }

    /// True for errors detected before any mutating call was issued.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Error::Configuration { .. } | Error::Precondition { .. }
        )
    }
}

impl From<ClientError> for Error {
    fn from(e: ClientError) -> Self {
        match e {
            ClientError::Unreachable { address, message } => {
                Error::HostUnreachable { address, message }
            }
            other => Error::Transport(other.to_string()),
        }
    }
}

/// Result type for reconciliation.
pub type Result<T> = std::result::Result<T, Error>;
