//! In-workload sidecar: waits for the plugin's results and submits them to
//! the aggregation server over mutual TLS.

mod gather;

use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sonde_core::{RetryConfig, mtls_client, submit};
use sonde_model::plugin::worker_env;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "sonde-worker",
    about = "Submit plugin results to the sonde aggregation server"
)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,

    /// Results prefix of the aggregation server
    #[arg(long, env = worker_env::MASTER_URL)]
    master_url: String,

    /// Result type the plugin reports under
    #[arg(long, env = worker_env::RESULT_TYPE)]
    result_type: String,

    /// Directory shared with the plugin container
    #[arg(long, env = worker_env::RESULTS_DIR, default_value = "/tmp/results")]
    results_dir: PathBuf,

    /// PEM root certificate of this run
    #[arg(long, env = worker_env::CA_CERT, hide_env_values = true)]
    ca_cert: String,

    /// PEM client certificate issued to this plugin
    #[arg(long, env = worker_env::CLIENT_CERT, hide_env_values = true)]
    client_cert: String,

    /// PEM private key for the client certificate
    #[arg(long, env = worker_env::CLIENT_KEY, hide_env_values = true)]
    client_key: String,

    /// Seconds between checks for the done marker
    #[arg(long, default_value_t = 1)]
    poll_interval_seconds: u64,
}

#[derive(Subcommand)]
enum Mode {
    /// Submit one cluster-wide result
    Global,
    /// Submit the result for the node this worker runs on
    SingleNode {
        #[arg(long, env = worker_env::NODE_NAME)]
        node_name: String,
    },
}

impl Cli {
    fn results_url(&self) -> String {
        let prefix = self.master_url.trim_end_matches('/');
        match &self.mode {
            Mode::Global => format!("{prefix}/{}", self.result_type),
            Mode::SingleNode { node_name } => {
                format!("{prefix}/{node_name}/{}", self.result_type)
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let url = cli.results_url();

    let client = mtls_client(&cli.ca_cert, &cli.client_cert, &cli.client_key)
        .context("failed to build mutual TLS client")?;

    let poll = Duration::from_secs(cli.poll_interval_seconds.max(1));
    let results_dir = cli.results_dir.clone();
    let receipt = submit(&url, &client, &RetryConfig::default(), || async {
        let path = gather::wait_for_result(&results_dir, poll).await?;
        gather::read_result(&path).await
    })
    .await
    .with_context(|| format!("failed to submit results to {url}"))?;

    info!(
        %url,
        status = %receipt.status,
        attempts = receipt.attempts,
        "results delivered"
    );
    Ok(())
}
