//! Single-unit dispatch: one pod for the whole cluster, one global result.

use async_trait::async_trait;
use sonde_model::{ExpectedResult, PluginDefinition, routes};
use tokio::sync::mpsc;
use tracing::debug;

use super::{
    DriverError, DriverSettings, PluginBase, PluginDriver, PluginResult,
    health,
    manifest::{UnitKind, WorkloadManifest},
};
use crate::{
    ca::ClientCredential,
    cluster::{ClusterClient, Node},
};

const WORKER_MODE: &str = "global";

/// Runs one unit for the whole cluster and owes one global result.
#[derive(Debug)]
pub struct JobDriver {
    base: PluginBase,
}

impl JobDriver {
    /// Driver with a fresh session id.
    pub fn new(definition: PluginDefinition, settings: &DriverSettings) -> Self {
        Self {
            base: PluginBase::new(definition, settings),
        }
    }

    /// Name of the single unit, `sonde-{plugin}-job-{session}`.
    pub fn unit_name(&self) -> String {
        format!(
            "sonde-{}-job-{}",
            self.base.name(),
            self.base.session_id()
        )
    }

    fn key(&self) -> ExpectedResult {
        ExpectedResult::global(self.base.result_type())
    }

    /// One observation of the cluster. `Some` ends the monitor loop.
    async fn check(
        &self,
        client: &dyn ClusterClient,
    ) -> Option<PluginResult> {
        let units = match client
            .list_units(self.base.namespace(), &self.base.selector())
            .await
        {
            Ok(units) => units,
            Err(err) => {
                return Some(PluginResult::failure(
                    self.key(),
                    format!("failed to list units: {err}"),
                    None,
                ));
            }
        };

        match units.as_slice() {
            [unit] => health::unit_failure(unit).map(|reason| {
                PluginResult::failure(
                    self.key(),
                    reason,
                    Some(unit.name.as_str()),
                )
            }),
            other => Some(PluginResult::failure(
                self.key(),
                format!("expected 1 unit, found {}", other.len()),
                None,
            )),
        }
    }
}

#[async_trait]
impl PluginDriver for JobDriver {
    fn base(&self) -> &PluginBase {
        &self.base
    }

    fn expected_results(&self, _nodes: &[Node]) -> Vec<ExpectedResult> {
        vec![self.key()]
    }

    fn render(
        &self,
        advertise_address: &str,
        credential: &ClientCredential,
    ) -> Result<WorkloadManifest, DriverError> {
        self.base.check_names()?;

        let mut spec = self.base.unit_spec(
            routes::global_results_url(advertise_address),
            WORKER_MODE,
            credential,
        );
        spec.restart_policy = Some("Never".to_string());

        Ok(WorkloadManifest {
            kind: UnitKind::Pod,
            metadata: self.base.metadata(self.unit_name()),
            spec,
        })
    }

    async fn monitor(
        &self,
        client: &dyn ClusterClient,
        _nodes: &[Node],
        results: mpsc::Sender<PluginResult>,
    ) {
        loop {
            tokio::time::sleep(self.base.monitor_interval()).await;
            if self.base.is_cleaned() {
                debug!(plugin = self.base.name(), "monitor stopping");
                return;
            }

            if let Some(failure) = self.check(client).await {
                self.base.report(&results, failure).await;
                return;
            }
        }
    }
}
