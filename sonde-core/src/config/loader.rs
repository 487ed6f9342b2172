use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use super::AggregationConfig;

const DEFAULT_CONFIG_LOCATIONS: [&str; 2] = ["sonde.toml", "config/sonde.toml"];
const ENV_PREFIX: &str = "SONDE_";

/// Raw configuration as written in a TOML file. Every field is optional so
/// the file only needs to name what it changes.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    bind_address: Option<String>,
    bind_port: Option<u16>,
    advertise_address: Option<String>,
    timeout_seconds: Option<u64>,
    grace_period_seconds: Option<u64>,
    namespace: Option<String>,
    worker_image: Option<String>,
    monitor_interval_seconds: Option<u64>,
}

/// `SONDE_*` overrides, captured once.
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    vars: HashMap<String, String>,
}

impl EnvConfig {
    /// Snapshot the process environment.
    pub fn gather() -> Self {
        Self::from_vars(std::env::vars())
    }

    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .filter(|(k, _)| k.starts_with(ENV_PREFIX))
            .collect();
        Self { vars }
    }

    fn string(&self, name: &str) -> Option<String> {
        self.vars
            .get(&format!("{ENV_PREFIX}{name}"))
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn parsed<T>(&self, name: &str) -> Result<Option<T>, ConfigLoadError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.string(name)
            .map(|raw| {
                raw.parse().map_err(|err| {
                    ConfigLoadError::Invalid(format!(
                        "{ENV_PREFIX}{name}={raw:?}: {err}"
                    ))
                })
            })
            .transpose()
    }

    fn config_path(&self) -> Option<PathBuf> {
        self.string("CONFIG").map(PathBuf::from)
    }
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("configuration file missing: {path}")]
    MissingConfig { path: PathBuf },
    #[error("failed to read configuration {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error(transparent)]
    EnvFile(#[from] dotenvy::Error),
}

#[derive(Debug, Default, Clone)]
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
    env_file: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.env_file = Some(path.into());
        self
    }

    /// Load `.env` (if present), then compose file and environment.
    pub fn load(&self) -> Result<AggregationConfig, ConfigLoadError> {
        let loaded = match &self.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| true),
            None => dotenvy::dotenv().map(|_| true),
        }
        .or_else(|err| match err {
            dotenvy::Error::Io(_) => Ok(false),
            _ => Err(err),
        })?;
        debug!(env_file_loaded = loaded, "environment prepared");

        self.load_with_env(&EnvConfig::gather())
    }

    /// Compose a configuration from defaults, the TOML file, then `env`,
    /// and validate the result.
    pub fn load_with_env(
        &self,
        env: &EnvConfig,
    ) -> Result<AggregationConfig, ConfigLoadError> {
        let file = self.load_file_config(env)?.unwrap_or_default();
        let defaults = AggregationConfig::default();

        let config = AggregationConfig {
            bind_address: env
                .string("BIND_ADDRESS")
                .or(file.bind_address)
                .unwrap_or(defaults.bind_address),
            bind_port: env
                .parsed("BIND_PORT")?
                .or(file.bind_port)
                .unwrap_or(defaults.bind_port),
            advertise_address: env
                .string("ADVERTISE_ADDRESS")
                .or(file.advertise_address)
                .unwrap_or(defaults.advertise_address),
            timeout_seconds: env
                .parsed("TIMEOUT_SECONDS")?
                .or(file.timeout_seconds)
                .unwrap_or(defaults.timeout_seconds),
            grace_period_seconds: env
                .parsed("GRACE_PERIOD_SECONDS")?
                .or(file.grace_period_seconds)
                .unwrap_or(defaults.grace_period_seconds),
            namespace: env
                .string("NAMESPACE")
                .or(file.namespace)
                .unwrap_or(defaults.namespace),
            worker_image: env
                .string("WORKER_IMAGE")
                .or(file.worker_image)
                .unwrap_or(defaults.worker_image),
            monitor_interval_seconds: env
                .parsed("MONITOR_INTERVAL_SECONDS")?
                .or(file.monitor_interval_seconds)
                .unwrap_or(defaults.monitor_interval_seconds),
        };

        config.validate().map_err(ConfigLoadError::Invalid)?;
        info!(
            bind_address = %config.bind_address,
            bind_port = config.bind_port,
            advertise_address = %config.advertise_address,
            timeout_seconds = config.timeout_seconds,
            "configuration loaded"
        );
        Ok(config)
    }

    fn load_file_config(
        &self,
        env: &EnvConfig,
    ) -> Result<Option<FileConfig>, ConfigLoadError> {
        let explicit = self.config_path.clone().or_else(|| env.config_path());

        let path = match explicit {
            Some(path) if !path.exists() => {
                return Err(ConfigLoadError::MissingConfig { path });
            }
            Some(path) => path,
            None => match DEFAULT_CONFIG_LOCATIONS
                .iter()
                .map(Path::new)
                .find(|candidate| candidate.exists())
            {
                Some(found) => found.to_path_buf(),
                None => return Ok(None),
            },
        };

        let contents =
            fs::read_to_string(&path).map_err(|source| ConfigLoadError::Io {
                path: path.clone(),
                source,
            })?;
        let file = toml::from_str(&contents).map_err(|source| {
            ConfigLoadError::Parse {
                path: path.clone(),
                source,
            }
        })?;

        debug!(path = %path.display(), "read configuration file");
        Ok(Some(file))
    }
}
