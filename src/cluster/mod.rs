//! Cluster membership primitives

pub mod machine;

pub use machine::{machine_id, Machine};

use std::path::Path;
use std::sync::RwLock;

use tracing::{error, info, warn};

/// The set of peer agents sharing a coordination-store namespace, plus the
/// cluster configuration blob loaded at startup. A passive container mutated
/// by the coordination backend.
pub struct Cluster {
    machines: RwLock<Vec<Machine>>,
    config: Option<serde_json::Value>,
}

impl Cluster {
    pub fn new(config: Option<serde_json::Value>) -> Self {
        Self {
            machines: RwLock::new(Vec::new()),
            config,
        }
    }

    /// Parse `cluster.json` from the configuration directory.
    pub fn load_config(config_dir: &Path) -> Option<serde_json::Value> {
        let file = config_dir.join("cluster.json");
        info!("Loading cluster configuration from {}", file.display());
        let data = match std::fs::read_to_string(&file) {
            Ok(data) => data,
            Err(e) => {
                warn!("Failed to read file {}: {}", file.display(), e);
                return None;
            }
        };
        match serde_json::from_str(&data) {
            Ok(config) => Some(config),
            Err(e) => {
                error!("Failed to parse file {}: {}", file.display(), e);
                None
            }
        }
    }

    pub fn config(&self) -> Option<&serde_json::Value> {
        self.config.as_ref()
    }

    /// Add or replace a machine; membership is unique by id.
    pub fn add_machine(&self, machine: Machine) {
        let mut machines = self.machines.write().expect("cluster lock poisoned");
        match machines.iter_mut().find(|m| m.id == machine.id) {
            Some(existing) => *existing = machine,
            None => machines.push(machine),
        }
    }

    pub fn remove_machine(&self, id: &str) {
        let mut machines = self.machines.write().expect("cluster lock poisoned");
        machines.retain(|m| m.id != id);
    }

    pub fn get_machine(&self, id: &str) -> Option<Machine> {
        self.machines
            .read()
            .expect("cluster lock poisoned")
            .iter()
            .find(|m| m.id == id)
            .cloned()
    }

    pub fn machines(&self) -> Vec<Machine> {
        self.machines
            .read()
            .expect("cluster lock poisoned")
            .clone()
    }

    pub fn len(&self) -> usize {
        self.machines.read().expect("cluster lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_membership_unique_by_id() {
        let cluster = Cluster::new(None);
        cluster.add_machine(Machine {
            id: "m1".into(),
            endpoint: "10.0.0.1:8480".into(),
            tags: vec![],
        });
        cluster.add_machine(Machine {
            id: "m1".into(),
            endpoint: "10.0.0.2:8480".into(),
            tags: vec![],
        });
        assert_eq!(cluster.len(), 1);
        assert_eq!(cluster.get_machine("m1").unwrap().endpoint, "10.0.0.2:8480");

        cluster.remove_machine("m1");
        assert!(cluster.is_empty());
    }
}
