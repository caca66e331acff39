//! Machine identity

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::deployment::Deployment;

/// One peer agent, as serialized into the membership key space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    pub id: String,
    pub endpoint: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Machine {
    /// Identity for this host: advertised endpoint plus the machine id.
    pub fn local(endpoint: String, tags: Vec<String>) -> Self {
        Self {
            id: machine_id(Path::new("/")),
            endpoint,
            tags,
        }
    }

    pub fn serialize(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn deserialize(data: &str) -> Option<Machine> {
        match serde_json::from_str(data) {
            Ok(machine) => Some(machine),
            Err(e) => {
                error!("Failed to parse machine json: {} {:?}", e, data);
                None
            }
        }
    }

    /// Offer a recovered deployment to this peer. Acceptance is currently
    /// unconditional; the reassignment planner only needs the yes/no answer.
    /// TODO: post the deployment to the peer's /packages/{id}/deploy endpoint
    /// and surface its response.
    pub fn try_deploy(&self, deployment: &Deployment) -> bool {
        info!(
            "Offering deployment {} of package {} to {}",
            deployment.id, deployment.package_id, self.id
        );
        true
    }
}

/// Content of `{root}/etc/machine-id` when present, hostname otherwise.
pub fn machine_id(root: &Path) -> String {
    let path = root.join("etc/machine-id");
    if let Ok(id) = std::fs::read_to_string(&path) {
        let id = id.trim();
        if !id.is_empty() {
            return id.to_string();
        }
    }
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .map(|h| h.trim().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_machine_json_roundtrip() {
        let machine = Machine {
            id: "abc".into(),
            endpoint: "10.1.2.3:8480".into(),
            tags: vec!["web".into()],
        };
        let data = machine.serialize();
        let parsed = Machine::deserialize(&data).unwrap();
        assert_eq!(parsed, machine);
    }

    #[test]
    fn test_machine_id_falls_back_to_hostname() {
        let dir = tempfile::tempdir().unwrap();
        // No etc/machine-id under the temp root
        let id = machine_id(dir.path());
        assert!(!id.is_empty());
    }
}
