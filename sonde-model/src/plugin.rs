use std::fmt;
use std::str::FromStr;

/// Environment variables the worker sidecar is configured through.
pub mod worker_env {
    pub const NODE_NAME: &str = "NODE_NAME";
    pub const RESULTS_DIR: &str = "RESULTS_DIR";
    pub const MASTER_URL: &str = "MASTER_URL";
    pub const RESULT_TYPE: &str = "RESULT_TYPE";
    pub const CA_CERT: &str = "CA_CERT";
    pub const CLIENT_CERT: &str = "CLIENT_CERT";
    pub const CLIENT_KEY: &str = "CLIENT_KEY";
}

/// How a plugin's workload is laid onto the cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DriverKind {
    /// One execution unit for the whole cluster, reporting a global result.
    Job,
    /// One execution unit per node, each reporting a node-scoped result.
    DaemonSet,
}

impl DriverKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverKind::Job => "Job",
            DriverKind::DaemonSet => "DaemonSet",
        }
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DriverKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Job" | "job" => Ok(DriverKind::Job),
            "DaemonSet" | "daemonset" | "daemon-set" => {
                Ok(DriverKind::DaemonSet)
            }
            other => Err(format!("unknown driver {other:?}")),
        }
    }
}

/// An already-validated plugin definition.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PluginDefinition {
    pub name: String,
    pub result_type: String,
    pub driver: DriverKind,
    /// The producer container that does the plugin's actual work.
    pub spec: ContainerSpec,
}

/// Container description embedded verbatim into rendered workloads.
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct ContainerSpec {
    pub name: String,
    #[cfg_attr(
        feature = "serde",
        serde(default, skip_serializing_if = "String::is_empty")
    )]
    pub image: String,
    #[cfg_attr(
        feature = "serde",
        serde(default, skip_serializing_if = "Option::is_none")
    )]
    pub image_pull_policy: Option<String>,
    #[cfg_attr(
        feature = "serde",
        serde(default, skip_serializing_if = "Vec::is_empty")
    )]
    pub command: Vec<String>,
    #[cfg_attr(
        feature = "serde",
        serde(default, skip_serializing_if = "Vec::is_empty")
    )]
    pub args: Vec<String>,
    #[cfg_attr(
        feature = "serde",
        serde(default, skip_serializing_if = "Vec::is_empty")
    )]
    pub env: Vec<EnvVar>,
    #[cfg_attr(
        feature = "serde",
        serde(default, skip_serializing_if = "Vec::is_empty")
    )]
    pub volume_mounts: Vec<VolumeMount>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct EnvVar {
    pub name: String,
    #[cfg_attr(
        feature = "serde",
        serde(default, skip_serializing_if = "Option::is_none")
    )]
    pub value: Option<String>,
    #[cfg_attr(
        feature = "serde",
        serde(default, skip_serializing_if = "Option::is_none")
    )]
    pub value_from: Option<EnvSource>,
}

impl EnvVar {
    pub fn value(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
            value_from: None,
        }
    }

    pub fn from_source(name: impl Into<String>, source: EnvSource) -> Self {
        Self {
            name: name.into(),
            value: None,
            value_from: Some(source),
        }
    }
}

/// Indirect environment values resolved by the cluster at schedule time.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(
    feature = "serde",
    serde(rename_all = "camelCase", rename_all_fields = "camelCase")
)]
pub enum EnvSource {
    /// A field of the scheduled unit, e.g. `spec.nodeName`.
    FieldRef { field_path: String },
    /// One key of a named secret.
    SecretKeyRef { name: String, key: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct VolumeMount {
    pub name: String,
    pub mount_path: String,
    #[cfg_attr(feature = "serde", serde(default))]
    pub read_only: bool,
}
