//! Plugin drivers: how a plugin's workload reaches the cluster, how its
//! health is watched, and how it is torn down.
//!
//! Two dispatch shapes exist. [`JobDriver`] runs one execution unit for the
//! whole cluster and owes a single global result; [`DaemonSetDriver`] runs
//! one unit per node and owes one result per node. Both embed a
//! [`PluginBase`] carrying the shared identity (definition, session id,
//! namespace) and the `cleaned` flag their monitor loops watch.

pub mod daemonset;
pub mod health;
pub mod job;
pub mod manifest;
pub mod result;

use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use sonde_model::{
    ContainerSpec, DriverKind, EnvSource, EnvVar, ExpectedResult,
    PluginDefinition, plugin::worker_env, result::validate_segment,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    ca::ClientCredential,
    cluster::{
        ClusterClient, ClusterError, Node, TLS_CERT_KEY, TLS_KEY_KEY,
        TlsSecret,
    },
};

pub use daemonset::DaemonSetDriver;
pub use job::JobDriver;
pub use manifest::WorkloadManifest;
pub use result::PluginResult;

use manifest::{
    ObjectMeta, RESULTS_DIR, UnitSpec, WORKER_CONTAINER, producer_container,
    results_mount, results_volume,
};

/// Label binding every cluster object of a plugin instance to its session.
pub const SESSION_LABEL: &str = "sonde-run";

const COMPONENT_LABEL: &str = "component";
const TIER_LABEL: &str = "tier";
const PROJECT: &str = "sonde";
const SERVICE_ACCOUNT: &str = "sonde-serviceaccount";
const WORKER_BINARY: &str = "sonde-worker";

const DRIVER_ANNOTATION: &str = "sonde-driver";
const PLUGIN_ANNOTATION: &str = "sonde-plugin";
const RESULT_TYPE_ANNOTATION: &str = "sonde-result-type";

/// Dispatch failures. Either one aborts the run.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// The definition cannot be rendered into a workload.
    #[error("failed to render workload for plugin {plugin}: {reason}")]
    Manifest {
        /// Plugin name.
        plugin: String,
        /// What was wrong with the definition.
        reason: String,
    },

    /// The cluster refused the secret or the unit.
    #[error("cluster rejected workload for plugin {plugin}: {source}")]
    Cluster {
        /// Plugin name.
        plugin: String,
        /// Cluster failure.
        #[source]
        source: ClusterError,
    },
}

/// Cluster-side settings shared by every driver of a run.
#[derive(Clone, Debug)]
pub struct DriverSettings {
    /// Namespace every unit and secret is created in.
    pub namespace: String,
    /// Image of the result-submitting sidecar.
    pub worker_image: String,
    /// Delay between monitor checks.
    pub monitor_interval: Duration,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            namespace: PROJECT.to_string(),
            worker_image: "sonde/worker:latest".to_string(),
            monitor_interval: Duration::from_secs(10),
        }
    }
}

/// 16 lowercase hex characters drawn from a random v4 UUID.
pub fn new_session_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(16);
    id
}

/// Identity and lifecycle state shared by all driver variants.
pub struct PluginBase {
    definition: PluginDefinition,
    session_id: String,
    namespace: String,
    worker_image: String,
    monitor_interval: Duration,
    cleaned: AtomicBool,
}

impl fmt::Debug for PluginBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginBase")
            .field("name", &self.definition.name)
            .field("result_type", &self.definition.result_type)
            .field("session_id", &self.session_id)
            .field("namespace", &self.namespace)
            .field("cleaned", &self.is_cleaned())
            .finish()
    }
}

impl PluginBase {
    pub fn new(definition: PluginDefinition, settings: &DriverSettings) -> Self {
        Self {
            definition,
            session_id: new_session_id(),
            namespace: settings.namespace.clone(),
            worker_image: settings.worker_image.clone(),
            monitor_interval: settings.monitor_interval,
            cleaned: AtomicBool::new(false),
        }
    }

    pub fn definition(&self) -> &PluginDefinition {
        &self.definition
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn result_type(&self) -> &str {
        &self.definition.result_type
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn monitor_interval(&self) -> Duration {
        self.monitor_interval
    }

    pub fn is_cleaned(&self) -> bool {
        self.cleaned.load(Ordering::SeqCst)
    }

    /// Label selector matching every unit of this instance.
    pub fn selector(&self) -> String {
        format!("{SESSION_LABEL}={}", self.session_id)
    }

    pub fn secret_name(&self) -> String {
        format!("{PROJECT}-plugin-{}-{}", self.name(), self.session_id)
    }

    fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (COMPONENT_LABEL.to_string(), PROJECT.to_string()),
            (SESSION_LABEL.to_string(), self.session_id.clone()),
            (TIER_LABEL.to_string(), "analysis".to_string()),
        ])
    }

    pub(crate) fn check_names(&self) -> Result<(), DriverError> {
        for segment in [self.name(), self.result_type()] {
            validate_segment(segment).map_err(|err| DriverError::Manifest {
                plugin: self.name().to_string(),
                reason: err.to_string(),
            })?;
        }
        Ok(())
    }

    pub(crate) fn metadata(&self, name: String) -> ObjectMeta {
        let annotations = BTreeMap::from([
            (
                DRIVER_ANNOTATION.to_string(),
                self.definition.driver.to_string(),
            ),
            (PLUGIN_ANNOTATION.to_string(), self.name().to_string()),
            (
                RESULT_TYPE_ANNOTATION.to_string(),
                self.result_type().to_string(),
            ),
        ]);

        ObjectMeta {
            name,
            namespace: self.namespace.clone(),
            labels: self.labels(),
            annotations,
        }
    }

    /// Producer plus worker sidecar sharing the results volume.
    pub(crate) fn unit_spec(
        &self,
        master_url: String,
        mode: &str,
        credential: &ClientCredential,
    ) -> UnitSpec {
        UnitSpec {
            containers: vec![
                producer_container(&self.definition.spec),
                self.worker_container(master_url, mode, credential),
            ],
            service_account_name: Some(SERVICE_ACCOUNT.to_string()),
            volumes: vec![results_volume()],
            ..Default::default()
        }
    }

    fn worker_container(
        &self,
        master_url: String,
        mode: &str,
        credential: &ClientCredential,
    ) -> ContainerSpec {
        let secret = self.secret_name();
        let secret_ref = |key: &str| EnvSource::SecretKeyRef {
            name: secret.clone(),
            key: key.to_string(),
        };

        ContainerSpec {
            name: WORKER_CONTAINER.to_string(),
            image: self.worker_image.clone(),
            image_pull_policy: Some("IfNotPresent".to_string()),
            command: vec![WORKER_BINARY.to_string()],
            args: vec![mode.to_string()],
            env: vec![
                EnvVar::from_source(
                    worker_env::NODE_NAME,
                    EnvSource::FieldRef {
                        field_path: "spec.nodeName".to_string(),
                    },
                ),
                EnvVar::value(worker_env::RESULTS_DIR, RESULTS_DIR),
                EnvVar::value(worker_env::MASTER_URL, master_url),
                EnvVar::value(worker_env::RESULT_TYPE, self.result_type()),
                EnvVar::value(worker_env::CA_CERT, credential.ca_cert_pem()),
                EnvVar::from_source(
                    worker_env::CLIENT_CERT,
                    secret_ref(TLS_CERT_KEY),
                ),
                EnvVar::from_source(
                    worker_env::CLIENT_KEY,
                    secret_ref(TLS_KEY_KEY),
                ),
            ],
            volume_mounts: vec![results_mount()],
            ..Default::default()
        }
    }

    fn secret(&self, credential: &ClientCredential) -> TlsSecret {
        TlsSecret {
            name: self.secret_name(),
            namespace: self.namespace.clone(),
            labels: self.labels(),
            data: BTreeMap::from([
                (TLS_CERT_KEY.to_string(), credential.cert_pem().to_string()),
                (TLS_KEY_KEY.to_string(), credential.key_pem().to_string()),
            ]),
        }
    }

    /// Create the credential secret, then the unit that mounts it.
    pub async fn dispatch(
        &self,
        client: &dyn ClusterClient,
        credential: &ClientCredential,
        manifest: &WorkloadManifest,
    ) -> Result<(), DriverError> {
        let cluster_error = |source| DriverError::Cluster {
            plugin: self.name().to_string(),
            source,
        };

        client
            .create_secret(&self.secret(credential))
            .await
            .map_err(cluster_error)?;
        client.create_unit(manifest).await.map_err(cluster_error)?;

        info!(
            plugin = self.name(),
            session_id = %self.session_id,
            unit = manifest.name(),
            "dispatched plugin"
        );
        Ok(())
    }

    /// Mark the instance cleaned, then delete its units and secret.
    ///
    /// Only the first call reaches the cluster. Deletion errors are logged.
    pub async fn cleanup(&self, client: &dyn ClusterClient) {
        if self.cleaned.swap(true, Ordering::SeqCst) {
            debug!(plugin = self.name(), "plugin already cleaned up");
            return;
        }

        let selector = self.selector();
        if let Err(err) = client.delete_units(&self.namespace, &selector).await
        {
            warn!(
                plugin = self.name(),
                selector = %selector,
                "failed to delete plugin units: {err}"
            );
        }

        if let Err(err) = client
            .delete_secret(&self.namespace, &self.secret_name())
            .await
        {
            warn!(plugin = self.name(), "failed to delete plugin secret: {err}");
        }

        info!(
            plugin = self.name(),
            session_id = %self.session_id,
            "cleaned up plugin"
        );
    }

    /// Push a synthesized result to the aggregator. Returns `false` once the
    /// receiving side has gone away.
    pub(crate) async fn report(
        &self,
        results: &mpsc::Sender<PluginResult>,
        result: PluginResult,
    ) -> bool {
        warn!(
            plugin = self.name(),
            key = %result.key,
            error = result.error.as_deref().unwrap_or_default(),
            "plugin unit failed"
        );
        if results.send(result).await.is_err() {
            warn!(plugin = self.name(), "results channel closed");
            return false;
        }
        true
    }
}

/// Lifecycle operations of one dispatched plugin.
#[async_trait]
pub trait PluginDriver: Send + Sync + fmt::Debug {
    fn base(&self) -> &PluginBase;

    fn name(&self) -> &str {
        self.base().name()
    }

    fn result_type(&self) -> &str {
        self.base().result_type()
    }

    fn session_id(&self) -> &str {
        self.base().session_id()
    }

    /// Results this instance owes given the cluster's nodes.
    fn expected_results(&self, nodes: &[Node]) -> Vec<ExpectedResult>;

    fn render(
        &self,
        advertise_address: &str,
        credential: &ClientCredential,
    ) -> Result<WorkloadManifest, DriverError>;

    async fn run(
        &self,
        client: &dyn ClusterClient,
        advertise_address: &str,
        credential: &ClientCredential,
    ) -> Result<(), DriverError> {
        let manifest = self.render(advertise_address, credential)?;
        self.base().dispatch(client, credential, &manifest).await
    }

    /// Poll the instance's units until they fail or the instance is cleaned
    /// up, pushing a failure result for whatever can no longer report.
    async fn monitor(
        &self,
        client: &dyn ClusterClient,
        nodes: &[Node],
        results: mpsc::Sender<PluginResult>,
    );

    async fn cleanup(&self, client: &dyn ClusterClient) {
        self.base().cleanup(client).await
    }
}

/// Build the driver variant named by the definition.
pub fn instantiate(
    definition: PluginDefinition,
    settings: &DriverSettings,
) -> Arc<dyn PluginDriver> {
    match definition.driver {
        DriverKind::Job => Arc::new(JobDriver::new(definition, settings)),
        DriverKind::DaemonSet => {
            Arc::new(DaemonSetDriver::new(definition, settings))
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ca::CertificateAuthority, cluster::MockClusterClient};
    use test_support::definition;

    #[test]
    fn session_ids_are_sixteen_hex_chars() {
        let id = new_session_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, new_session_id());
    }

    #[test]
    fn instantiate_picks_variant_from_driver_kind() {
        let settings = DriverSettings::default();
        let job = instantiate(definition("e2e", DriverKind::Job), &settings);
        let daemon = instantiate(
            definition("systemd", DriverKind::DaemonSet),
            &settings,
        );

        let nodes = [Node::new("node1"), Node::new("node2")];
        assert_eq!(job.expected_results(&nodes).len(), 1);
        assert_eq!(daemon.expected_results(&nodes).len(), 2);
        assert_ne!(job.session_id(), daemon.session_id());
    }

    #[tokio::test]
    async fn dispatch_creates_secret_before_unit() {
        let authority = CertificateAuthority::new().unwrap();
        let driver = JobDriver::new(
            definition("e2e", DriverKind::Job),
            &DriverSettings::default(),
        );
        let credential = authority.client_key_pair("e2e").unwrap();

        let mut seq = mockall::Sequence::new();
        let mut client = MockClusterClient::new();
        let secret_name = driver.base().secret_name();
        client
            .expect_create_secret()
            .withf(move |secret| {
                secret.name == secret_name
                    && secret.data.contains_key(TLS_CERT_KEY)
                    && secret.data.contains_key(TLS_KEY_KEY)
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        client
            .expect_create_unit()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        driver
            .run(&client, "10.0.0.1:8080", &credential)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn dispatch_failure_names_the_plugin() {
        let authority = CertificateAuthority::new().unwrap();
        let driver = JobDriver::new(
            definition("e2e", DriverKind::Job),
            &DriverSettings::default(),
        );
        let credential = authority.client_key_pair("e2e").unwrap();

        let mut client = MockClusterClient::new();
        client.expect_create_secret().returning(|_| Ok(()));
        client
            .expect_create_unit()
            .returning(|_| Err(ClusterError::Api("quota exceeded".into())));

        let err = driver
            .run(&client, "10.0.0.1:8080", &credential)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DriverError::Cluster { ref plugin, .. } if plugin == "e2e"
        ));
    }

    #[tokio::test]
    async fn cleanup_reaches_cluster_once() {
        let driver = DaemonSetDriver::new(
            definition("systemd", DriverKind::DaemonSet),
            &DriverSettings::default(),
        );

        let mut client = MockClusterClient::new();
        let selector = driver.base().selector();
        client
            .expect_delete_units()
            .withf(move |namespace, sel| namespace == "sonde" && sel == selector)
            .times(1)
            .returning(|_, _| Err(ClusterError::Api("gone".into())));
        client
            .expect_delete_secret()
            .times(1)
            .returning(|_, _| Ok(()));

        driver.cleanup(&client).await;
        driver.cleanup(&client).await;
        assert!(driver.base().is_cleaned());
    }
}
