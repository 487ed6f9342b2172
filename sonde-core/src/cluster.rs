//! The cluster execution capability the dispatcher calls into.
//!
//! Only the operations plugin dispatch needs are modelled: list nodes,
//! create a TLS secret, and create/list/delete execution units selected by
//! label. A real backend (the Kubernetes API, a test double, ...) implements
//! [`ClusterClient`]; nothing in this crate talks to a cluster directly.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Serialize;

use crate::plugin::manifest::WorkloadManifest;

/// Secret key holding the PEM certificate.
pub const TLS_CERT_KEY: &str = "tls.crt";
/// Secret key holding the PEM private key.
pub const TLS_KEY_KEY: &str = "tls.key";

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("cluster API request failed: {0}")]
    Api(String),

    #[error("cluster object not found: {0}")]
    NotFound(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Node {
    pub name: String,
}

impl Node {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// A scheduled execution unit as observed through the cluster API.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionUnit {
    pub name: String,
    /// Node the unit was scheduled onto, if any yet.
    pub node_name: Option<String>,
    pub conditions: Vec<UnitCondition>,
    pub containers: Vec<ContainerState>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct UnitCondition {
    pub reason: String,
    pub message: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ContainerState {
    pub name: String,
    pub restart_count: u32,
    /// Reason reported while the container is waiting, e.g. `ErrImagePull`.
    pub waiting_reason: Option<String>,
}

/// TLS secret mounted into a workload so its submitter can authenticate.
#[derive(Clone, PartialEq, Eq)]
pub struct TlsSecret {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub data: BTreeMap<String, String>,
}

impl std::fmt::Debug for TlsSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsSecret")
            .field("name", &self.name)
            .field("namespace", &self.namespace)
            .field("labels", &self.labels)
            .field("keys", &self.data.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn list_nodes(&self) -> Result<Vec<Node>, ClusterError>;

    async fn create_secret(&self, secret: &TlsSecret)
    -> Result<(), ClusterError>;

    async fn delete_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(), ClusterError>;

    async fn create_unit(
        &self,
        manifest: &WorkloadManifest,
    ) -> Result<(), ClusterError>;

    /// List units in `namespace` matching a `key=value` label selector.
    async fn list_units(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<ExecutionUnit>, ClusterError>;

    async fn delete_units(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<(), ClusterError>;
}
