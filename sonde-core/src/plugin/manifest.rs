//! Typed workload manifests handed to the cluster capability.
//!
//! These mirror the subset of the Kubernetes object model the drivers fill
//! in. They serialize to the same camelCase JSON shape so a real backend can
//! forward them as-is.

use std::collections::BTreeMap;

use serde::Serialize;
use sonde_model::{ContainerSpec, EnvVar, VolumeMount};

/// Container name of the result-submitting sidecar.
pub const WORKER_CONTAINER: &str = "sonde-worker";
/// Shared volume the producer writes its result into.
pub const RESULTS_VOLUME: &str = "results";
/// Where the results volume is mounted in every container.
pub const RESULTS_DIR: &str = "/tmp/results";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum UnitKind {
    Pod,
    DaemonSet,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadManifest {
    pub kind: UnitKind,
    pub metadata: ObjectMeta,
    pub spec: UnitSpec,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitSpec {
    pub containers: Vec<ContainerSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub host_network: bool,
    #[serde(rename = "hostPID", skip_serializing_if = "std::ops::Not::not")]
    pub host_pid: bool,
    #[serde(rename = "hostIPC", skip_serializing_if = "std::ops::Not::not")]
    pub host_ipc: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_policy: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,
    pub volumes: Vec<Volume>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Toleration {
    pub key: String,
    pub operator: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effect: Option<String>,
}

impl Toleration {
    pub fn exists(key: &str, effect: Option<&str>) -> Self {
        Self {
            key: key.to_string(),
            operator: "Exists".to_string(),
            effect: effect.map(str::to_string),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub name: String,
    #[serde(flatten)]
    pub source: VolumeSource,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum VolumeSource {
    EmptyDir {},
    HostPath { path: String },
}

impl WorkloadManifest {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn container(&self, name: &str) -> Option<&ContainerSpec> {
        self.spec.containers.iter().find(|c| c.name == name)
    }

    /// Literal value of an environment variable on one container.
    pub fn env_value(&self, container: &str, var: &str) -> Option<&str> {
        self.container(container)?
            .env
            .iter()
            .find(|env| env.name == var)?
            .value
            .as_deref()
    }

    pub fn env_var(&self, container: &str, var: &str) -> Option<&EnvVar> {
        self.container(container)?
            .env
            .iter()
            .find(|env| env.name == var)
    }
}

/// Producer container with the results volume mounted.
pub(crate) fn producer_container(spec: &ContainerSpec) -> ContainerSpec {
    let mut container = spec.clone();
    if !container
        .volume_mounts
        .iter()
        .any(|mount| mount.name == RESULTS_VOLUME)
    {
        container.volume_mounts.push(results_mount());
    }
    container
}

pub(crate) fn results_mount() -> VolumeMount {
    VolumeMount {
        name: RESULTS_VOLUME.to_string(),
        mount_path: RESULTS_DIR.to_string(),
        read_only: false,
    }
}

pub(crate) fn results_volume() -> Volume {
    Volume {
        name: RESULTS_VOLUME.to_string(),
        source: VolumeSource::EmptyDir {},
    }
}
