//! Per-attempt container creation request.

use std::collections::BTreeMap;

use crate::config::{ContainerSet, Ulimit};
use crate::runtime::labels;

/// Everything the runtime needs to create one container.
///
/// Built fresh from a deep copy of a [`ContainerSet`] for every create
/// attempt, mutated in place by the hook pipeline, then dropped once the
/// runtime has accepted it.
#[derive(Debug, Clone, PartialEq)]
pub struct CreationRequest {
    /// Id of the set this request was built from.
    pub set_id: String,
    pub name: Option<String>,
    pub image: String,
    /// Ordered `KEY=VALUE` entries.
    pub env: Vec<String>,
    pub labels: BTreeMap<String, String>,
    /// `host:container[:mode]` or `volume:container` strings.
    pub binds: Vec<String>,
    /// Container paths backed by anonymous volumes.
    pub volumes: Vec<String>,
    /// Container ids whose volumes are mounted in.
    pub volumes_from: Vec<String>,
    /// Container port (`8080/tcp`) to host port.
    pub port_bindings: BTreeMap<String, u16>,
    /// Container ports exposed without a host binding.
    pub exposed_ports: Vec<String>,
    pub memory: Option<i64>,
    pub memory_swap: Option<i64>,
    pub cpu_percent: Option<i64>,
    pub ulimits: Vec<Ulimit>,
    pub network_mode: Option<String>,
    pub extra_hosts: Vec<String>,
    pub restart: bool,
}

impl CreationRequest {
    /// Build a request from a set, stamping the controller's labels.
    pub fn from_set(set: &ContainerSet) -> Self {
        let set = set.clone();

        let mut request_labels = BTreeMap::new();
        request_labels.insert(labels::AUTO_DEPLOYED.to_string(), "true".to_string());
        request_labels.insert(labels::SOURCE_IMAGE.to_string(), set.image.clone());
        request_labels.insert(labels::GROUP_ID.to_string(), set.id.clone());
        request_labels.insert(
            labels::DATA_CONTAINER.to_string(),
            set.is_data_container.to_string(),
        );

        Self {
            set_id: set.id,
            name: set.name,
            image: set.image,
            env: set.env,
            labels: request_labels,
            binds: Vec::new(),
            volumes: Vec::new(),
            volumes_from: Vec::new(),
            port_bindings: BTreeMap::new(),
            exposed_ports: Vec::new(),
            memory: set.memory,
            memory_swap: set.memory_swap,
            cpu_percent: set.cpu_percent,
            ulimits: set.ulimits,
            network_mode: set.network_mode,
            extra_hosts: set.extra_hosts,
            restart: set.restart,
        }
    }

    /// Current value of env `key`.
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env.iter().find_map(|entry| {
            entry
                .split_once('=')
                .filter(|(k, _)| *k == key)
                .map(|(_, v)| v)
        })
    }

    /// Set env `key`, replacing an existing entry in place or appending.
    pub fn set_env(&mut self, key: &str, value: impl std::fmt::Display) {
        let entry = format!("{key}={value}");
        let prefix = format!("{key}=");
        match self.env.iter_mut().find(|e| e.starts_with(&prefix)) {
            Some(existing) => *existing = entry,
            None => self.env.push(entry),
        }
    }

    /// Publish a TCP container port on a host port.
    pub fn publish(&mut self, container_port: u16, host_port: u16) {
        self.port_bindings
            .insert(format!("{container_port}/tcp"), host_port);
    }

    /// Host ports this request already claims.
    pub fn host_ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.port_bindings.values().copied()
    }
}
