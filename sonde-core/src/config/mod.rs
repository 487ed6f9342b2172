//! Run configuration.
//!
//! [`AggregationConfig`] is a plain value handed to
//! [`run`](crate::aggregation::run); [`ConfigLoader`] is one way of building
//! it from a TOML file and `SONDE_*` environment variables.

mod loader;

use std::{
    net::{IpAddr, SocketAddr},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::plugin::DriverSettings;

pub use loader::{ConfigLoadError, ConfigLoader, EnvConfig};

pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0";
pub const DEFAULT_BIND_PORT: u16 = 8080;
/// Three hours.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 10_800;
pub const DEFAULT_GRACE_PERIOD_SECONDS: u64 = 45;
pub const DEFAULT_NAMESPACE: &str = "sonde";
pub const DEFAULT_WORKER_IMAGE: &str = "sonde/worker:latest";
pub const DEFAULT_MONITOR_INTERVAL_SECONDS: u64 = 10;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    pub bind_address: String,
    pub bind_port: u16,
    /// Address workloads use to reach the server; the server certificate is
    /// issued for its host part.
    pub advertise_address: String,
    pub timeout_seconds: u64,
    /// Time between the soft timeout (cleanup) and the hard timeout.
    pub grace_period_seconds: u64,
    pub namespace: String,
    pub worker_image: String,
    pub monitor_interval_seconds: u64,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            bind_port: DEFAULT_BIND_PORT,
            advertise_address: String::new(),
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            grace_period_seconds: DEFAULT_GRACE_PERIOD_SECONDS,
            namespace: DEFAULT_NAMESPACE.to_string(),
            worker_image: DEFAULT_WORKER_IMAGE.to_string(),
            monitor_interval_seconds: DEFAULT_MONITOR_INTERVAL_SECONDS,
        }
    }
}

impl AggregationConfig {
    pub fn bind_socket_addr(&self) -> Result<SocketAddr, String> {
        let ip: IpAddr = self.bind_address.parse().map_err(|err| {
            format!("invalid bind address {:?}: {err}", self.bind_address)
        })?;
        Ok(SocketAddr::new(ip, self.bind_port))
    }

    pub fn hard_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// When plugins are cleaned up ahead of the hard timeout.
    pub fn soft_timeout(&self) -> Duration {
        Duration::from_secs(
            self.timeout_seconds
                .saturating_sub(self.grace_period_seconds),
        )
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_seconds)
    }

    pub fn driver_settings(&self) -> DriverSettings {
        DriverSettings {
            namespace: self.namespace.clone(),
            worker_image: self.worker_image.clone(),
            monitor_interval: self.monitor_interval(),
        }
    }

    /// Reject configurations a run cannot start with.
    pub fn validate(&self) -> Result<(), String> {
        if self.advertise_address.trim().is_empty() {
            return Err("advertise_address is required".to_string());
        }
        if self.bind_port == 0 {
            return Err("bind_port must be non-zero".to_string());
        }
        if self.timeout_seconds == 0 {
            return Err("timeout_seconds must be non-zero".to_string());
        }
        if self.grace_period_seconds >= self.timeout_seconds {
            return Err(format!(
                "grace_period_seconds ({}) must be shorter than \
                 timeout_seconds ({})",
                self.grace_period_seconds, self.timeout_seconds
            ));
        }
        if self.monitor_interval_seconds == 0 {
            return Err("monitor_interval_seconds must be non-zero".to_string());
        }
        if self.namespace.trim().is_empty() {
            return Err("namespace is required".to_string());
        }
        self.bind_socket_addr().map(|_| ())
    }
}
