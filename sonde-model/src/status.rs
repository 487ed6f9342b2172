//! Run status reporting.
//!
//! A [`RunStatus`] holds one [`PluginStatus`] per expected result and an
//! aggregate [`Status`] derived from them. A single failed result fails the
//! whole run straight away; the run only completes once every entry has.

use std::fmt;

use crate::error::{ModelError, Result};
use crate::result::ExpectedResult;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Status {
    Running,
    Complete,
    Failed,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Status::Running => "running",
            Status::Complete => "complete",
            Status::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Status of a single expected result.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PluginStatus {
    /// Result type of the plugin that owes this result.
    pub plugin: String,
    /// Node the result belongs to; empty for global results.
    #[cfg_attr(feature = "serde", serde(default))]
    pub node: String,
    pub status: Status,
}

impl PluginStatus {
    fn matches(&self, key: &ExpectedResult) -> bool {
        self.plugin == key.result_type && self.node == key.node_name
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RunStatus {
    pub status: Status,
    pub plugins: Vec<PluginStatus>,
}

impl RunStatus {
    /// Seed a status with every expected result still running. An empty
    /// expectation set is complete from the start.
    pub fn new(expected: &[ExpectedResult]) -> Self {
        let plugins = expected
            .iter()
            .map(|key| PluginStatus {
                plugin: key.result_type.clone(),
                node: key.node_name.clone(),
                status: Status::Running,
            })
            .collect();

        let mut status = Self {
            status: Status::Running,
            plugins,
        };
        status.recompute();
        status
    }

    /// Record a new status for one key and refresh the aggregate.
    pub fn update(&mut self, key: &ExpectedResult, status: Status) -> Result<()> {
        let entry = self
            .plugins
            .iter_mut()
            .find(|entry| entry.matches(key))
            .ok_or_else(|| ModelError::UnknownResult(key.clone()))?;

        entry.status = status;
        self.recompute();
        Ok(())
    }

    pub fn get(&self, key: &ExpectedResult) -> Option<Status> {
        self.plugins
            .iter()
            .find(|entry| entry.matches(key))
            .map(|entry| entry.status)
    }

    fn recompute(&mut self) {
        self.status = if self
            .plugins
            .iter()
            .any(|entry| entry.status == Status::Failed)
        {
            Status::Failed
        } else if self
            .plugins
            .iter()
            .all(|entry| entry.status == Status::Complete)
        {
            Status::Complete
        } else {
            Status::Running
        };
    }
}
