//! Core data model definitions shared across sonde crates.
//!
//! Everything here is plain data: the keys the aggregator tracks, the plugin
//! definitions handed to the dispatcher, run status reporting, and the wire
//! constants both the aggregation server and the in-workload submitter agree
//! on.
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod error;
pub mod plugin;
pub mod result;
pub mod routes;
pub mod status;

pub use error::{ModelError, Result as ModelResult};
pub use plugin::{
    ContainerSpec, DriverKind, EnvSource, EnvVar, PluginDefinition,
    VolumeMount,
};
pub use result::{ExpectedResult, GLOBAL_SCOPE};
pub use status::{PluginStatus, RunStatus, Status};
