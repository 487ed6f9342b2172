//! Per-node dispatch: a daemon set placing one unit on every node, each
//! owing a node-scoped result.

use std::collections::HashSet;

use async_trait::async_trait;
use sonde_model::{ExpectedResult, PluginDefinition, routes};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{
    DriverError, DriverSettings, PluginBase, PluginDriver, PluginResult,
    health,
    manifest::{Toleration, UnitKind, WorkloadManifest},
};
use crate::{
    ca::ClientCredential,
    cluster::{ClusterClient, Node},
};

const WORKER_MODE: &str = "single-node";

/// Runs one unit on every node and owes one result per node.
#[derive(Debug)]
pub struct DaemonSetDriver {
    base: PluginBase,
}

impl DaemonSetDriver {
    /// Driver with a fresh session id.
    pub fn new(definition: PluginDefinition, settings: &DriverSettings) -> Self {
        Self {
            base: PluginBase::new(definition, settings),
        }
    }

    /// Name of the DaemonSet, `sonde-{plugin}-daemon-set-{session}`.
    pub fn unit_name(&self) -> String {
        format!(
            "sonde-{}-daemon-set-{}",
            self.base.name(),
            self.base.session_id()
        )
    }

    fn tolerations() -> Vec<Toleration> {
        vec![
            Toleration::exists(
                "node-role.kubernetes.io/master",
                Some("NoSchedule"),
            ),
            Toleration::exists(
                "node-role.kubernetes.io/control-plane",
                Some("NoSchedule"),
            ),
            Toleration::exists("CriticalAddonsOnly", None),
        ]
    }
}

#[async_trait]
impl PluginDriver for DaemonSetDriver {
    fn base(&self) -> &PluginBase {
        &self.base
    }

    fn expected_results(&self, nodes: &[Node]) -> Vec<ExpectedResult> {
        nodes
            .iter()
            .map(|node| {
                ExpectedResult::for_node(&node.name, self.base.result_type())
            })
            .collect()
    }

    fn render(
        &self,
        advertise_address: &str,
        credential: &ClientCredential,
    ) -> Result<WorkloadManifest, DriverError> {
        self.base.check_names()?;

        let mut spec = self.base.unit_spec(
            routes::by_node_results_url(advertise_address),
            WORKER_MODE,
            credential,
        );
        spec.host_network = true;
        spec.host_pid = true;
        spec.host_ipc = true;
        spec.dns_policy = Some("ClusterFirstWithHostNet".to_string());
        spec.tolerations = Self::tolerations();

        Ok(WorkloadManifest {
            kind: UnitKind::DaemonSet,
            metadata: self.base.metadata(self.unit_name()),
            spec,
        })
    }

    /// Report each failing node once. The loop only ends when every node
    /// has been reported or the instance is cleaned up, so one bad node does
    /// not hide failures on the others.
    async fn monitor(
        &self,
        client: &dyn ClusterClient,
        nodes: &[Node],
        results: mpsc::Sender<PluginResult>,
    ) {
        let expected: HashSet<&str> =
            nodes.iter().map(|node| node.name.as_str()).collect();
        let mut reported: HashSet<String> = HashSet::new();

        while reported.len() < expected.len() {
            tokio::time::sleep(self.base.monitor_interval()).await;
            if self.base.is_cleaned() {
                debug!(plugin = self.base.name(), "monitor stopping");
                return;
            }

            let units = match client
                .list_units(self.base.namespace(), &self.base.selector())
                .await
            {
                Ok(units) => units,
                Err(err) => {
                    warn!(
                        plugin = self.base.name(),
                        "failed to list units, will retry: {err}"
                    );
                    continue;
                }
            };

            for unit in &units {
                let Some(node) = unit.node_name.as_deref() else {
                    continue;
                };
                if !expected.contains(node) || reported.contains(node) {
                    continue;
                }

                if let Some(reason) = health::unit_failure(unit) {
                    reported.insert(node.to_string());
                    let failure = PluginResult::failure(
                        ExpectedResult::for_node(node, self.base.result_type()),
                        reason,
                        Some(unit.name.as_str()),
                    );
                    if !self.base.report(&results, failure).await {
                        return;
                    }
                }
            }
        }
    }
}
