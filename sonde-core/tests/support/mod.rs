// Not every test binary uses every helper.
#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet},
    net::TcpListener,
    sync::Mutex,
    time::Duration,
};

use async_trait::async_trait;
use sonde_core::{
    AggregationConfig, ClusterClient, ClusterError, ExecutionUnit, Node,
    WorkloadManifest,
    cluster::{ContainerState, TlsSecret},
    plugin::{SESSION_LABEL, manifest::UnitKind},
};
use sonde_model::{ContainerSpec, DriverKind, PluginDefinition};

/// In-memory cluster recording everything the drivers ask of it.
#[derive(Debug, Default)]
pub struct FakeCluster {
    nodes: Vec<Node>,
    reject_units: bool,
    /// node name -> waiting reason reported for units scheduled there
    failing_nodes: HashMap<String, String>,
    state: Mutex<FakeState>,
}

#[derive(Debug, Default)]
struct FakeState {
    list_node_calls: usize,
    secrets: Vec<TlsSecret>,
    deleted_secrets: Vec<String>,
    units: Vec<WorkloadManifest>,
    deleted_selectors: HashSet<String>,
    delete_calls: HashMap<String, usize>,
}

impl FakeCluster {
    pub fn with_nodes(names: &[&str]) -> Self {
        Self {
            nodes: names.iter().map(|name| Node::new(*name)).collect(),
            ..Default::default()
        }
    }

    pub fn rejecting_units(mut self) -> Self {
        self.reject_units = true;
        self
    }

    pub fn failing_on(mut self, node: &str, waiting_reason: &str) -> Self {
        self.failing_nodes
            .insert(node.to_string(), waiting_reason.to_string());
        self
    }

    pub fn list_node_calls(&self) -> usize {
        self.state.lock().unwrap().list_node_calls
    }

    pub fn units(&self) -> Vec<WorkloadManifest> {
        self.state.lock().unwrap().units.clone()
    }

    pub fn secret(&self, name: &str) -> Option<TlsSecret> {
        self.state
            .lock()
            .unwrap()
            .secrets
            .iter()
            .find(|secret| secret.name == name)
            .cloned()
    }

    pub fn deleted_secrets(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted_secrets.clone()
    }

    /// How many times units matching `selector` were deleted.
    pub fn delete_calls(&self, selector: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .delete_calls
            .get(selector)
            .copied()
            .unwrap_or_default()
    }

    /// Wait until `count` units have been created.
    pub async fn wait_for_units(&self, count: usize) -> Vec<WorkloadManifest> {
        for _ in 0..200 {
            let units = self.units();
            if units.len() >= count {
                return units;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("timed out waiting for {count} units");
    }

    fn observe(&self, manifest: &WorkloadManifest) -> Vec<ExecutionUnit> {
        let on = |node: &Node, name: String| ExecutionUnit {
            name,
            node_name: Some(node.name.clone()),
            containers: vec![ContainerState {
                name: "plugin".to_string(),
                restart_count: 0,
                waiting_reason: self.failing_nodes.get(&node.name).cloned(),
            }],
            ..Default::default()
        };

        match manifest.kind {
            UnitKind::Pod => self
                .nodes
                .first()
                .map(|node| on(node, manifest.name().to_string()))
                .into_iter()
                .collect(),
            UnitKind::DaemonSet => self
                .nodes
                .iter()
                .map(|node| {
                    on(node, format!("{}-{}", manifest.name(), node.name))
                })
                .collect(),
        }
    }
}

fn matches_selector(manifest: &WorkloadManifest, selector: &str) -> bool {
    selector.split_once('=').is_some_and(|(key, value)| {
        manifest.metadata.labels.get(key).map(String::as_str) == Some(value)
    })
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn list_nodes(&self) -> Result<Vec<Node>, ClusterError> {
        self.state.lock().unwrap().list_node_calls += 1;
        Ok(self.nodes.clone())
    }

    async fn create_secret(
        &self,
        secret: &TlsSecret,
    ) -> Result<(), ClusterError> {
        self.state.lock().unwrap().secrets.push(secret.clone());
        Ok(())
    }

    async fn delete_secret(
        &self,
        _namespace: &str,
        name: &str,
    ) -> Result<(), ClusterError> {
        self.state
            .lock()
            .unwrap()
            .deleted_secrets
            .push(name.to_string());
        Ok(())
    }

    async fn create_unit(
        &self,
        manifest: &WorkloadManifest,
    ) -> Result<(), ClusterError> {
        if self.reject_units {
            return Err(ClusterError::Api("admission webhook denied".into()));
        }
        assert!(manifest.metadata.labels.contains_key(SESSION_LABEL));
        self.state.lock().unwrap().units.push(manifest.clone());
        Ok(())
    }

    async fn list_units(
        &self,
        _namespace: &str,
        selector: &str,
    ) -> Result<Vec<ExecutionUnit>, ClusterError> {
        let state = self.state.lock().unwrap();
        if state.deleted_selectors.contains(selector) {
            return Ok(Vec::new());
        }
        Ok(state
            .units
            .iter()
            .filter(|manifest| matches_selector(manifest, selector))
            .flat_map(|manifest| self.observe(manifest))
            .collect())
    }

    async fn delete_units(
        &self,
        _namespace: &str,
        selector: &str,
    ) -> Result<(), ClusterError> {
        let mut state = self.state.lock().unwrap();
        *state.delete_calls.entry(selector.to_string()).or_default() += 1;
        state.deleted_selectors.insert(selector.to_string());
        Ok(())
    }
}

pub fn definition(name: &str, driver: DriverKind) -> PluginDefinition {
    PluginDefinition {
        name: name.to_string(),
        result_type: name.to_string(),
        driver,
        spec: ContainerSpec {
            name: "plugin".to_string(),
            image: format!("example/{name}:v1"),
            ..Default::default()
        },
    }
}

/// A loopback port nothing is listening on right now.
pub fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .unwrap()
}

pub fn loopback_config(port: u16) -> AggregationConfig {
    AggregationConfig {
        bind_address: "127.0.0.1".to_string(),
        bind_port: port,
        advertise_address: format!("127.0.0.1:{port}"),
        timeout_seconds: 60,
        grace_period_seconds: 10,
        monitor_interval_seconds: 1,
        ..Default::default()
    }
}
