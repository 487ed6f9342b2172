//! # Sonde Core
//!
//! Plugin dispatch and result aggregation for one diagnostic run.
//!
//! ## Overview
//!
//! A run takes a list of plugins and a cluster, and ends when every plugin
//! has reported or time runs out:
//!
//! - [`ca`]: a per-run certificate authority issuing the server certificate
//!   and one client certificate per plugin
//! - [`plugin`]: drivers that render, dispatch, watch and clean up a plugin's
//!   workload (one unit cluster-wide, or one per node)
//! - [`aggregation`]: the completion state machine, its mutual-TLS endpoint
//!   and the [`run`](aggregation::run) loop with soft and hard timeouts
//! - [`worker`]: the submitter dispatched workloads use to deliver results
//! - [`cluster`]: the cluster capability the drivers call into
//! - [`config`]: run configuration and its loader
//!
//! Results are written to `<output>/plugins/{global|<node>}/<result type>`.

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod aggregation;
pub mod ca;
pub mod cluster;
pub mod config;
pub mod plugin;
pub mod worker;

pub use aggregation::{
    AggregationServer, Aggregator, AggregatorError, RunError, WaitOutcome, run,
};
pub use ca::{CaError, CertificateAuthority, ClientCredential};
pub use cluster::{ClusterClient, ClusterError, ExecutionUnit, Node};
pub use config::{AggregationConfig, ConfigLoadError, ConfigLoader};
pub use plugin::{
    DaemonSetDriver, DriverError, DriverSettings, JobDriver, PluginDriver,
    PluginResult, WorkloadManifest, instantiate,
};
pub use worker::{RetryConfig, SubmitError, Submission, mtls_client, submit};
