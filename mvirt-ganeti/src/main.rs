//! mvirt-ganeti: converge one Ganeti instance to a declared state.
//!
//! Reads the desired-state document, runs a single reconciliation pass
//! against the cluster's RAPI and prints the outcome as JSON on stdout:
//! `{"changed": .., "message": .., "reboot_required": ..}`.

use std::io::Read;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mvirt_ganeti::{InstanceReconciler, InstanceSpec, RapiClient, RapiConfig, ReconcileConfig};

/// mvirt Ganeti reconciler
#[derive(Parser, Debug)]
#[command(name = "mvirt-ganeti", version, about)]
struct Args {
    /// Desired-state document (JSON), `-` for stdin
    #[arg(long)]
    spec: String,

    /// Ganeti RAPI host
    #[arg(long, default_value = "localhost")]
    address: String,

    /// Ganeti RAPI port
    #[arg(long, default_value = "5080")]
    port: u16,

    /// RAPI user
    #[arg(long)]
    user: Option<String>,

    /// RAPI password
    #[arg(long, env = "GANETI_RAPI_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Accept self-signed RAPI certificates
    #[arg(long)]
    insecure: bool,

    /// HTTP request timeout in seconds
    #[arg(long, default_value = "60")]
    request_timeout: u64,

    /// Seconds to wait for a job before reporting a failure
    #[arg(long, default_value = "300")]
    job_timeout: u64,

    /// Seconds between job status polls
    #[arg(long, default_value = "1", value_parser = clap::value_parser!(u64).range(1..))]
    poll_period: u64,

    /// Submit jobs without waiting for them to finish
    #[arg(long)]
    no_wait: bool,

    /// Polls to spend on each tag job
    #[arg(long, default_value = "30")]
    tag_job_retries: u32,
}

fn read_spec(path: &str) -> Result<InstanceSpec> {
    let raw = if path == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read desired state from stdin")?;
        buf
    } else {
        std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read desired state from {}", path))?
    };
    serde_json::from_str(&raw).context("Invalid desired-state document")
}

fn fail(message: String, code: u8) -> ExitCode {
    println!(
        "{}",
        json!({ "failed": true, "changed": false, "msg": message })
    );
    ExitCode::from(code)
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging; stdout is reserved for the result document
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mvirt_ganeti=info,reqwest=warn,hyper=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    let spec = match read_spec(&args.spec) {
        Ok(spec) => spec,
        Err(e) => {
            error!("{:#}", e);
            return fail(format!("{:#}", e), 2);
        }
    };

    let rapi = RapiConfig {
        address: args.address,
        port: args.port,
        user: args.user,
        password: args.password,
        insecure: args.insecure,
        request_timeout: Duration::from_secs(args.request_timeout),
    };
    info!("Ganeti RAPI endpoint: {}", rapi.base_url());

    let client = match RapiClient::new(&rapi) {
        Ok(client) => client,
        Err(e) => return fail(format!("Failed to build RAPI client: {}", e), 1),
    };

    let config = ReconcileConfig {
        wait: !args.no_wait,
        poll_period: Duration::from_secs(args.poll_period),
        tag_job_retries: args.tag_job_retries,
        ..Default::default()
    }
    .with_job_timeout(Duration::from_secs(args.job_timeout));

    let reconciler = InstanceReconciler::new(Arc::new(client), config);
    match reconciler.reconcile(&spec).await {
        Ok(outcome) => {
            info!(
                "Instance {}: changed={} reboot_required={} ({})",
                spec.name, outcome.changed, outcome.reboot_required, outcome.message
            );
            match serde_json::to_string(&outcome) {
                Ok(doc) => {
                    println!("{}", doc);
                    ExitCode::SUCCESS
                }
                Err(e) => fail(format!("Failed to encode result: {}", e), 1),
            }
        }
        Err(e) => {
            error!("Reconciliation of {} failed: {}", spec.name, e);
            let code = if e.is_user_error() { 2 } else { 1 };
            fail(e.to_string(), code)
        }
    }
}
