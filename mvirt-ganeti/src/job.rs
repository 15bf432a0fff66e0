//! Tracking of submitted control-plane jobs.
//!
//! A job keeps running on the cluster whether or not anyone waits for it;
//! there is no cancellation. Waiting is a fixed-interval poll with a fixed
//! retry budget.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clients::{ControlPlane, JobId, JobStatus};
use crate::error::{Error, Result};

/// How to treat a freshly submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitPolicy {
    /// Poll every `poll_period` up to `max_retries` times.
    Wait {
        poll_period: Duration,
        max_retries: u32,
    },
    /// Report the job as submitted without checking its outcome.
    FireAndForget,
}

/// What is known about a job after handing it to the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    /// The job finished successfully.
    Completed,
    /// The job was submitted; its result was not observed.
    SubmittedUnconfirmed,
}

/// One submitted action and what became of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionReport {
    pub action: String,
    pub job_id: JobId,
    pub outcome: JobOutcome,
}

impl ActionReport {
    /// Human-readable summary, e.g. "shutdown complete".
    pub fn message(&self) -> String {
        match self.outcome {
            JobOutcome::Completed => format!("{} complete", self.action),
            JobOutcome::SubmittedUnconfirmed => format!("{} signal sent", self.action),
        }
    }
}

/// Awaits jobs submitted on behalf of one instance.
pub struct JobTracker {
    client: Arc<dyn ControlPlane>,
    instance: String,
}

impl JobTracker {
    pub fn new(client: Arc<dyn ControlPlane>, instance: &str) -> Self {
        Self {
            client,
            instance: instance.to_string(),
        }
    }

    /// Poll `job` until it finishes or the retry budget runs out.
    ///
    /// Transport errors while polling fail the wait immediately.
    pub async fn await_job(
        &self,
        job: &JobId,
        action: &str,
        poll_period: Duration,
        max_retries: u32,
    ) -> Result<()> {
        debug!(
            "Waiting for {} job {} of {} ({} x {:?})",
            action, job, self.instance, max_retries, poll_period
        );

        for attempt in 0..max_retries {
            let status = self.client.job_status(job).await?;
            if !status.is_finished() {
                debug!("{} job {} is {}", action, job, status.as_str());
                if attempt + 1 < max_retries {
                    tokio::time::sleep(poll_period).await;
                }
                continue;
            }

            if status == JobStatus::Success {
                info!("{} job {} for {} succeeded", action, job, self.instance);
                return Ok(());
            }

            warn!(
                "{} job {} for {} ended with status {}",
                action,
                job,
                self.instance,
                status.as_str()
            );
            return Err(Error::JobFailed {
                instance: self.instance.clone(),
                action: action.to_string(),
                job_id: job.clone(),
                status: status.as_str().to_string(),
            });
        }

        warn!(
            "Gave up waiting for {} job {} of {} after {} polls",
            action, job, self.instance, max_retries
        );
        Err(Error::JobTimeout {
            instance: self.instance.clone(),
            action: action.to_string(),
            job_id: job.clone(),
        })
    }

    /// Apply `policy` to a submitted job.
    pub async fn track(&self, job: JobId, action: &str, policy: WaitPolicy) -> Result<ActionReport> {
        let outcome = match policy {
            WaitPolicy::Wait {
                poll_period,
                max_retries,
            } => {
                self.await_job(&job, action, poll_period, max_retries).await?;
                JobOutcome::Completed
            }
            WaitPolicy::FireAndForget => {
                info!("{} job {} for {} submitted, not waiting", action, job, self.instance);
                JobOutcome::SubmittedUnconfirmed
            }
        };

        Ok(ActionReport {
            action: action.to_string(),
            job_id: job,
            outcome,
        })
    }
}
