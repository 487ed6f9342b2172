//! One orchestration run, end to end.

use std::{path::Path, sync::Arc, time::Duration};

use sonde_model::{ExpectedResult, RunStatus};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinSet,
    time,
};
use tracing::{error, info, warn};

use super::{
    aggregator::{Aggregator, WaitOutcome},
    error::RunError,
    server::AggregationServer,
};
use crate::{
    ca::CertificateAuthority,
    cluster::{ClusterClient, Node},
    config::AggregationConfig,
    plugin::PluginDriver,
};

/// Subdirectory of the output directory results are filed under.
pub const PLUGINS_DIR: &str = "plugins";

/// How long the last submitters get to read their responses.
const DRAIN_PERIOD: Duration = Duration::from_secs(5);

/// Dispatch every plugin, serve their results, and wait for all of them.
///
/// Returns the final status once every expected result has arrived. Plugins
/// are cleaned up on every exit path, and again at the soft timeout.
pub async fn run(
    client: Arc<dyn ClusterClient>,
    plugins: Vec<Arc<dyn PluginDriver>>,
    config: &AggregationConfig,
    output_dir: &Path,
) -> Result<RunStatus, RunError> {
    if plugins.is_empty() {
        info!("no plugins to run");
        return Ok(RunStatus::new(&[]));
    }

    let result =
        run_plugins(client.clone(), &plugins, config, output_dir).await;
    cleanup_all(client.as_ref(), &plugins).await;

    match &result {
        Ok(status) => info!(status = %status.status, "run finished"),
        Err(err) => error!("run failed: {err}"),
    }
    result
}

async fn run_plugins(
    client: Arc<dyn ClusterClient>,
    plugins: &[Arc<dyn PluginDriver>],
    config: &AggregationConfig,
    output_dir: &Path,
) -> Result<RunStatus, RunError> {
    config.validate().map_err(RunError::Config)?;
    let addr = config.bind_socket_addr().map_err(RunError::Config)?;

    let nodes: Arc<[Node]> = client.list_nodes().await?.into();
    let expected: Vec<ExpectedResult> = plugins
        .iter()
        .flat_map(|plugin| plugin.expected_results(&nodes))
        .collect();
    info!(
        plugins = plugins.len(),
        nodes = nodes.len(),
        expected = expected.len(),
        "starting run"
    );

    let authority = CertificateAuthority::new()?;
    let tls = authority.make_server_config(&config.advertise_address)?;
    let aggregator = Arc::new(Aggregator::new(
        output_dir.join(PLUGINS_DIR),
        &expected,
    ));

    let mut server = AggregationServer::spawn(addr, tls, aggregator.clone());

    let (stop_tx, stop_rx) = oneshot::channel();
    let mut waiter = {
        let aggregator = aggregator.clone();
        tokio::spawn(async move { aggregator.wait(stop_rx).await })
    };

    let (results_tx, results_rx) = mpsc::channel(expected.len().max(1));
    let mut monitors = JoinSet::new();

    for plugin in plugins {
        let dispatched = match authority.client_key_pair(plugin.name()) {
            Ok(credential) => plugin
                .run(client.as_ref(), &config.advertise_address, &credential)
                .await
                .map_err(|source| RunError::Dispatch {
                    plugin: plugin.name().to_string(),
                    source,
                }),
            Err(err) => Err(err.into()),
        };

        if let Err(err) = dispatched {
            server.shutdown();
            let _ = stop_tx.send(());
            return Err(err);
        }

        let plugin = plugin.clone();
        let client = client.clone();
        let nodes = nodes.clone();
        let results = results_tx.clone();
        monitors.spawn(async move {
            plugin.monitor(client.as_ref(), &nodes, results).await;
        });
    }
    drop(results_tx);

    let ingest = {
        let aggregator = aggregator.clone();
        tokio::spawn(
            async move { aggregator.ingest_failures(results_rx).await },
        )
    };

    let soft = time::sleep(config.soft_timeout());
    let hard = time::sleep(config.hard_timeout());
    tokio::pin!(soft, hard);
    let mut soft_fired = false;

    let outcome = loop {
        tokio::select! {
            _ = &mut soft, if !soft_fired => {
                soft_fired = true;
                warn!(
                    outstanding = aggregator.outstanding(),
                    "soft timeout reached, cleaning up plugins"
                );
                cleanup_all(client.as_ref(), plugins).await;
            }
            _ = &mut hard => {
                server.shutdown();
                let _ = stop_tx.send(());
                break Err(RunError::Timeout(config.hard_timeout()));
            }
            ended = server.finished() => {
                let _ = stop_tx.send(());
                let reason = ended
                    .err()
                    .unwrap_or_else(|| "listener closed".to_string());
                break Err(RunError::Server(reason));
            }
            waited = &mut waiter => {
                server.graceful_shutdown(DRAIN_PERIOD);
                break match waited {
                    Ok(Ok(WaitOutcome::Complete)) => {
                        Ok(aggregator.status().await)
                    }
                    Ok(Ok(WaitOutcome::Stopped)) => Err(RunError::Server(
                        "aggregator stopped before completion".to_string(),
                    )),
                    Ok(Err(err)) => Err(err.into()),
                    Err(err) => Err(RunError::Server(format!(
                        "aggregator task failed: {err}"
                    ))),
                };
            }
        }
    };

    // Closing every sender lets the ingest task finish the failure it may
    // be writing, then drain the rest.
    monitors.shutdown().await;
    if let Err(err) = ingest.await {
        warn!("failure ingestion task ended abnormally: {err}");
    }
    outcome
}

/// Best-effort cleanup of every plugin. Each driver only reaches the
/// cluster on its first call.
async fn cleanup_all(
    client: &dyn ClusterClient,
    plugins: &[Arc<dyn PluginDriver>],
) {
    for plugin in plugins {
        plugin.cleanup(client).await;
    }
}
