//! Connection and wait-policy settings.

use std::time::Duration;

/// Where and how to reach the Ganeti RAPI.
#[derive(Debug, Clone)]
pub struct RapiConfig {
    pub address: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    /// Accept self-signed certificates (the RAPI default setup).
    pub insecure: bool,
    pub request_timeout: Duration,
}

impl RapiConfig {
    /// Base URL of the v2 API, e.g. `https://cluster:5080/2`.
    pub fn base_url(&self) -> String {
        if self.address.starts_with("http://") || self.address.starts_with("https://") {
            format!("{}:{}/2", self.address.trim_end_matches('/'), self.port)
        } else {
            format!("https://{}:{}/2", self.address, self.port)
        }
    }
}

impl Default for RapiConfig {
    fn default() -> Self {
        Self {
            address: "localhost".to_string(),
            port: 5080,
            user: None,
            password: None,
            insecure: false,
            request_timeout: Duration::from_secs(60),
        }
    }
}

/// How submitted jobs are awaited.
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Block until jobs finish. When false, jobs are submitted and reported
    /// as "signal sent" without checking their outcome.
    pub wait: bool,
    pub poll_period: Duration,
    /// Number of polls before a job counts as timed out.
    pub job_retries: u32,
    /// Poll budget for tag jobs, which are always awaited.
    pub tag_job_retries: u32,
}

impl ReconcileConfig {
    /// Derive the retry count from a timeout in seconds and the poll period.
    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        let period = self.poll_period.as_millis().max(1);
        let retries = (timeout.as_millis() / period).max(1);
        self.job_retries = u32::try_from(retries).unwrap_or(u32::MAX);
        self
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            wait: true,
            poll_period: Duration::from_secs(1),
            job_retries: 300,
            tag_job_retries: 30,
        }
    }
}
