//! Peer failure handling and recovery
//!
//! When a peer's liveness key expires, every recovery participant waits out
//! a grace window (cancelled if the peer re-registers), then contests the
//! recovery lock with a set-if-absent. The single winner redistributes the
//! victim's deployments over the surviving peers, least-loaded first.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info, trace, warn};

use super::CoordinationBackend;
use crate::cluster::Machine;
use crate::deployment::Deployment;
use crate::kv::{GetOptions, KvError, PrevExist, SetOptions};

impl CoordinationBackend {
    /// Grace window for an expired peer. One of three things ends it: the
    /// peer re-registers (listener fires), shutdown, or the failover timeout
    /// elapses and recovery begins.
    pub(crate) async fn handle_failure(self: Arc<Self>, machine: Machine) {
        self.emit("Waiting to recover").await;

        if machine.id == self.machine().id {
            error!("Our key expired but we are still alive! {}", machine.id);
            return;
        }
        if self.cluster().get_machine(&machine.id).is_none() {
            error!(
                "Received expiration of a machine we weren't aware of {}",
                machine.id
            );
            return;
        }

        info!("Handling machine failure of {:?}", machine);
        let mut listener: mpsc::Receiver<Machine> = self.register_listener(&machine.id);
        let mut shutdown_rx = self.subscribe_shutdown();

        tokio::select! {
            _ = listener.recv() => {
                // The machine came back; nothing to recover
                self.emit("Not Recovering").await;
                self.drop_listener(&machine.id);
            }
            _ = shutdown_rx.recv() => {
                trace!("Received shutdown: aborting recovery");
                self.emit("Not Recovering").await;
                self.drop_listener(&machine.id);
            }
            _ = tokio::time::sleep(self.config().failover_timeout) => {
                self.attempt_recovery(machine).await;
            }
        }
    }

    /// Re-check the victim, contest the lock, and, as the single winner,
    /// redistribute its deployments.
    pub(crate) async fn attempt_recovery(self: &Arc<Self>, machine: Machine) {
        self.emit("Attempting Recovery").await;
        info!("Starting recovery for node: {}", machine.id);

        // A re-registration can beat the listener setup; the quorum read is
        // the authoritative check
        let options = GetOptions {
            quorum: true,
            recursive: false,
        };
        if self
            .kv()
            .get(&self.status_key(&machine.id), options)
            .await
            .is_ok()
        {
            self.drop_listener(&machine.id);
            self.emit("Not Recovering").await;
            return;
        }

        let lock = SetOptions {
            ttl: Some(self.config().recovery_lock_ttl),
            prev_exist: PrevExist::MustNot,
            prev_value: None,
        };
        match self
            .kv()
            .set(&self.recovery_key(&machine.id), &self.machine().id, lock)
            .await
        {
            Ok(_) => {}
            Err(KvError::NodeExists(_)) | Err(KvError::CasFailed(_)) => {
                info!("Could not obtain recovery lock for {}", machine.id);
                self.drop_listener(&machine.id);
                self.emit("Not Recovering").await;
                return;
            }
            Err(e) => {
                error!("Recovery lock attempt for {} failed: {}", machine.id, e);
                self.drop_listener(&machine.id);
                self.emit("Not Recovering").await;
                return;
            }
        }

        self.emit("Recovering").await;
        info!("Performing recovery of {}", machine.id);
        self.reassign_deployments(&machine).await;
        self.cluster().remove_machine(&machine.id);
        self.drop_listener(&machine.id);
        self.emit("Recovered").await;
    }

    /// Build the load-ordered peer list and walk the victim's deployment
    /// records through it.
    async fn reassign_deployments(&self, victim: &Machine) {
        let counts_prefix = format!("{}/deployments", self.config().machine_prefix);
        let options = GetOptions {
            quorum: false,
            recursive: true,
        };
        let mut peers: Vec<(String, u64)> = match self.kv().get(&counts_prefix, options).await {
            Ok(node) => node
                .nodes
                .iter()
                .filter_map(|n| {
                    let id = n.key.rsplit('/').next()?.to_string();
                    Some((id, n.value.parse().unwrap_or(0)))
                })
                .collect(),
            Err(e) => {
                warn!("Could not load machine deployment counts in recovery: {}", e);
                return;
            }
        };
        peers.sort_by(|a, b| a.1.cmp(&b.1));

        let victim_prefix = format!("{}/{}", self.config().deployment_prefix, victim.id);
        let records = match self.kv().get(&victim_prefix, options).await {
            Ok(node) => node.nodes,
            Err(e) => {
                warn!("Could not load deployments in recovery: {}", e);
                return;
            }
        };

        for record in records {
            let deployment: Deployment = match serde_json::from_str(&record.value) {
                Ok(deployment) => deployment,
                Err(e) => {
                    error!("Failed to parse deployment json: {} {:?}", e, record.value);
                    continue;
                }
            };
            self.place_deployment(&deployment, victim, &mut peers).await;
        }
    }

    /// Offer one deployment to the least-loaded acceptable peer. On
    /// acceptance the peer's count is bumped and walked back into sort
    /// order with adjacent swaps.
    async fn place_deployment(
        &self,
        deployment: &Deployment,
        victim: &Machine,
        peers: &mut [(String, u64)],
    ) {
        for index in 0..peers.len() {
            let (peer_id, count) = peers[index].clone();
            if peer_id == self.machine().id || peer_id == victim.id {
                continue;
            }

            // A peer that already holds this deployment is skipped
            let held_key = format!(
                "{}/{}/{}",
                self.config().deployment_prefix,
                peer_id,
                deployment.id
            );
            if self.kv().get(&held_key, GetOptions::default()).await.is_ok() {
                continue;
            }

            let Some(peer) = self.cluster().get_machine(&peer_id) else {
                error!(
                    "Attempted to get info for a machine we aren't aware of: {}",
                    peer_id
                );
                continue;
            };

            if peer.try_deploy(deployment) {
                trace!("Deployed: {} to machine {}", deployment.id, peer_id);
                peers[index].1 = count + 1;
                let mut i = index;
                while i + 1 < peers.len() && peers[i].1 > peers[i + 1].1 {
                    peers.swap(i, i + 1);
                    i += 1;
                }
                return;
            }
        }
        warn!(
            "No peer accepted deployment {}, operator attention required",
            deployment.id
        );
    }
}
