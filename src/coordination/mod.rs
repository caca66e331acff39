//! Cluster coordination backend
//!
//! Keeps this agent visible to its peers and watches theirs. Under a
//! configurable prefix the backend maintains:
//!
//! ```text
//! <machine-prefix>/status/<machineId>       TTL-refreshed liveness, JSON Machine
//! <machine-prefix>/deployments/<machineId>  per-peer completed-deployment count
//! <machine-prefix>/recovery/<victimId>      recovery lock, value = winner id
//! <deployment-prefix>/<machineId>/<depId>   one record per completed deployment
//! ```
//!
//! Liveness expiry drives the failure/recovery protocol in [`recovery`].

pub mod recovery;

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, trace, warn};

use crate::cluster::{Cluster, Machine};
use crate::deployment::{CompletionSink, Deployment, FailureSink, WatchCallback, WatchRegistrar};
use crate::errors::AgentError;
use crate::kv::{GetOptions, KvAction, KvError, KvStore, PrevExist, SetOptions};

const KEEPALIVE_RETRIES: u32 = 10;
const KEEPALIVE_BACKOFF: Duration = Duration::from_secs(2);

fn default_failover_timeout() -> String {
    "30s".to_string()
}

fn default_recovery_lock_ttl() -> String {
    "5m".to_string()
}

fn default_ttl() -> u64 {
    30
}

#[derive(Debug, Deserialize)]
struct RawBackendConfig {
    endpoints: Vec<String>,

    #[serde(default, rename = "recovery-participant")]
    recovery_participant: bool,

    #[serde(default, rename = "node-prefix")]
    node_prefix: String,

    #[serde(rename = "machine-prefix")]
    machine_prefix: String,

    #[serde(rename = "deployment-prefix")]
    deployment_prefix: String,

    #[serde(default = "default_failover_timeout", rename = "failover-timeout")]
    failover_timeout: String,

    /// Liveness key TTL in seconds
    #[serde(default = "default_ttl")]
    ttl: u64,

    /// TTL on the recovery lock, so a crashed recoverer's lock expires and
    /// the contest can rerun
    #[serde(default = "default_recovery_lock_ttl", rename = "recovery-lock-ttl")]
    recovery_lock_ttl: String,
}

/// Parsed `backend-config` section of the cluster configuration blob.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub endpoints: Vec<String>,
    pub recovery_participant: bool,
    pub machine_prefix: String,
    pub deployment_prefix: String,
    pub ttl: Duration,
    pub failover_timeout: Duration,
    pub recovery_lock_ttl: Duration,
}

impl BackendConfig {
    pub fn parse(cluster_config: &serde_json::Value) -> Result<Self, AgentError> {
        let raw = cluster_config
            .get("backend-config")
            .ok_or_else(|| AgentError::Config("cluster config missing backend-config".into()))?;
        let raw: RawBackendConfig = serde_json::from_value(raw.clone())
            .map_err(|e| AgentError::Config(format!("invalid backend-config: {}", e)))?;

        let failover_timeout = humantime::parse_duration(&raw.failover_timeout)
            .map_err(|e| AgentError::Config(format!("invalid failover-timeout: {}", e)))?;
        let recovery_lock_ttl = humantime::parse_duration(&raw.recovery_lock_ttl)
            .map_err(|e| AgentError::Config(format!("invalid recovery-lock-ttl: {}", e)))?;

        let config = Self {
            endpoints: raw.endpoints,
            recovery_participant: raw.recovery_participant,
            machine_prefix: join_prefix(&raw.machine_prefix, &raw.node_prefix),
            deployment_prefix: join_prefix(&raw.deployment_prefix, &raw.node_prefix),
            ttl: Duration::from_secs(raw.ttl),
            failover_timeout,
            recovery_lock_ttl,
        };
        trace!("Loaded backend config: {:?}", config);
        Ok(config)
    }
}

fn join_prefix(prefix: &str, node_prefix: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    if node_prefix.is_empty() {
        prefix.to_string()
    } else {
        format!("{}/{}", prefix, node_prefix.trim_matches('/'))
    }
}

/// Handles for the backend's long-running tasks, joined at shutdown.
pub struct BackendHandles {
    pub keep_alive: JoinHandle<()>,
    pub monitor: JoinHandle<()>,
}

pub struct CoordinationBackend {
    kv: Arc<dyn KvStore>,
    config: BackendConfig,
    machine: Machine,
    machine_json: String,
    cluster: Arc<Cluster>,
    deployment_count: Arc<Mutex<u64>>,
    node_listeners: StdMutex<HashMap<String, mpsc::Sender<Machine>>>,
    status_tx: mpsc::Sender<String>,
    shutdown: broadcast::Sender<()>,
}

impl CoordinationBackend {
    /// Join the cluster and start the keep-alive and monitor tasks.
    ///
    /// Fails fatally when the membership key for this machine id already
    /// exists; exactly one machine may carry each id.
    pub async fn init(
        kv: Arc<dyn KvStore>,
        cluster: Arc<Cluster>,
        machine: Machine,
        shutdown: broadcast::Sender<()>,
    ) -> Result<(Arc<Self>, mpsc::Receiver<String>, BackendHandles), AgentError> {
        let cluster_config = cluster
            .config()
            .ok_or_else(|| AgentError::Config("no cluster configuration loaded".into()))?;
        let config = BackendConfig::parse(cluster_config)?;

        let (status_tx, status_rx) = mpsc::channel(100);
        let machine_json = machine.serialize();
        let backend = Arc::new(Self {
            kv,
            config,
            machine,
            machine_json,
            cluster,
            deployment_count: Arc::new(Mutex::new(0)),
            node_listeners: StdMutex::new(HashMap::new()),
            status_tx,
            shutdown,
        });

        backend.load_deployment_count().await;

        // Notify the cluster of this node; an existing key means a peer
        // already holds our id
        let status_key = backend.status_key(&backend.machine.id);
        let join = backend
            .kv
            .set(
                &status_key,
                &backend.machine_json,
                SetOptions {
                    ttl: Some(backend.config.ttl),
                    prev_exist: PrevExist::MustNot,
                    prev_value: None,
                },
            )
            .await;
        match join {
            Ok(_) => {}
            Err(KvError::NodeExists(_)) => {
                error!("Could not join the cluster, another node exists with our machine ID");
                return Err(AgentError::PeerIdConflict(backend.machine.id.clone()));
            }
            Err(e) => return Err(e.into()),
        }

        backend.load_machines().await;

        let handles = BackendHandles {
            keep_alive: tokio::spawn(backend.clone().keep_alive()),
            monitor: tokio::spawn(backend.clone().monitor()),
        };
        backend.emit("Started").await;
        Ok((backend, status_rx, handles))
    }

    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    pub(crate) fn kv(&self) -> &Arc<dyn KvStore> {
        &self.kv
    }

    pub(crate) fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    pub(crate) fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    fn status_key(&self, id: &str) -> String {
        format!("{}/status/{}", self.config.machine_prefix, id)
    }

    fn count_key(&self, id: &str) -> String {
        format!("{}/deployments/{}", self.config.machine_prefix, id)
    }

    fn recovery_key(&self, id: &str) -> String {
        format!("{}/recovery/{}", self.config.machine_prefix, id)
    }

    pub(crate) async fn emit(&self, status: &str) {
        let _ = self.status_tx.send(status.to_string()).await;
    }

    async fn load_deployment_count(&self) {
        let key = self.count_key(&self.machine.id);
        let options = GetOptions {
            quorum: true,
            recursive: false,
        };
        match self.kv.get(&key, options).await {
            Ok(node) => {
                info!("Received existing deployment count: {}", node.value);
                let mut count = self.deployment_count.lock().await;
                *count = node.value.parse().unwrap_or(0);
            }
            Err(e) => {
                info!("No existing deployment count ({}), starting at 0", e);
                if let Err(e) = self.kv.set(&key, "0", SetOptions::default()).await {
                    error!("Failed to initialize deployment count: {}", e);
                }
            }
        }
    }

    async fn load_machines(&self) {
        let prefix = format!("{}/status", self.config.machine_prefix);
        let options = GetOptions {
            quorum: false,
            recursive: true,
        };
        let node = match self.kv.get(&prefix, options).await {
            Ok(node) => node,
            Err(e) => {
                warn!("Could not load cluster machine list: {}", e);
                return;
            }
        };
        for child in &node.nodes {
            let Some(machine) = Machine::deserialize(&child.value) else {
                continue;
            };
            if machine.id != self.machine.id {
                self.cluster.add_machine(machine);
            }
        }
    }

    /// Refresh the liveness key forever. On shutdown the key is re-set with
    /// a one-second TTL so peers notice promptly.
    async fn keep_alive(self: Arc<Self>) {
        let key = self.status_key(&self.machine.id);
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut retries = KEEPALIVE_RETRIES;

        let interval = if self.config.ttl > Duration::from_secs(30) {
            // Leave a margin to reset the TTL before it expires
            self.config.ttl - Duration::from_secs(15)
        } else {
            self.config.ttl / 2
        };

        loop {
            let refresh = self
                .kv
                .set(
                    &key,
                    &self.machine_json,
                    SetOptions {
                        ttl: Some(self.config.ttl),
                        prev_exist: PrevExist::Must,
                        prev_value: None,
                    },
                )
                .await;

            let wait = match refresh {
                Ok(_) => {
                    retries = KEEPALIVE_RETRIES;
                    interval
                }
                Err(e) => {
                    error!("Failed to refresh liveness key: {}", e);
                    retries -= 1;
                    if retries == 0 {
                        error!("Giving up on liveness refresh after repeated failures");
                        return;
                    }
                    KEEPALIVE_BACKOFF
                }
            };

            tokio::select! {
                _ = shutdown_rx.recv() => {
                    let _ = self.kv.set(&key, &self.machine_json, SetOptions {
                        ttl: Some(Duration::from_secs(1)),
                        prev_exist: PrevExist::Must,
                        prev_value: None,
                    }).await;
                    trace!("Received shutdown: aborting keepalive");
                    self.emit("Not Recovering").await;
                    return;
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Watch the membership key space. Expirations start the failure
    /// protocol; creations update the cluster and cancel any in-flight grace
    /// window for the re-registered machine.
    async fn monitor(self: Arc<Self>) {
        trace!("Starting machine monitor");
        let prefix = format!("{}/status", self.config.machine_prefix);
        let mut stream = match self.kv.watch(&prefix, true).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("Could not start membership watch: {}", e);
                return;
            }
        };
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            let event = tokio::select! {
                _ = shutdown_rx.recv() => {
                    trace!("Received shutdown: aborting monitor");
                    self.emit("Not Recovering").await;
                    return;
                }
                event = stream.recv() => event,
            };
            let Some(event) = event else {
                trace!("Membership watch ended: aborting monitor");
                self.emit("Not Recovering").await;
                return;
            };

            match event.action {
                KvAction::Expire => {
                    if !self.config.recovery_participant {
                        continue;
                    }
                    let Some(prev) = &event.prev_node else { continue };
                    let Some(machine) = Machine::deserialize(&prev.value) else {
                        continue;
                    };
                    tokio::spawn(self.clone().handle_failure(machine));
                }
                KvAction::Create => {
                    let Some(machine) = Machine::deserialize(&event.node.value) else {
                        continue;
                    };
                    // A re-registration during the grace window cancels the
                    // pending recovery
                    self.poke_listener(&machine);
                    if machine.id != self.machine.id {
                        self.cluster.add_machine(machine);
                    }
                }
                _ => {}
            }
        }
    }

    fn poke_listener(&self, machine: &Machine) {
        let listeners = self.node_listeners.lock().expect("listener lock poisoned");
        if let Some(listener) = listeners.get(&machine.id) {
            let _ = listener.try_send(machine.clone());
        }
    }

    pub(crate) fn register_listener(&self, id: &str) -> mpsc::Receiver<Machine> {
        let (tx, rx) = mpsc::channel(8);
        self.node_listeners
            .lock()
            .expect("listener lock poisoned")
            .insert(id.to_string(), tx);
        rx
    }

    pub(crate) fn drop_listener(&self, id: &str) {
        self.node_listeners
            .lock()
            .expect("listener lock poisoned")
            .remove(id);
    }
}

impl CompletionSink for CoordinationBackend {
    /// Record the completed deployment and bump this machine's count. The
    /// count is compare-and-set on its previous value; a miss is logged and
    /// left for the next completion to correct.
    fn deployment_complete(&self, deployment: &Deployment) {
        let data = match serde_json::to_string(deployment) {
            Ok(data) => data,
            Err(e) => {
                error!("Could not serialize deployment {}: {}", deployment.id, e);
                return;
            }
        };
        let kv = self.kv.clone();
        let record_key = format!(
            "{}/{}/{}",
            self.config.deployment_prefix, self.machine.id, deployment.id
        );
        let count_key = self.count_key(&self.machine.id);
        let count = self.deployment_count.clone();

        tokio::spawn(async move {
            if let Err(e) = kv.set(&record_key, &data, SetOptions::default()).await {
                error!("Failed to store deployment record: {}", e);
                return;
            }
            let mut count = count.lock().await;
            let next = *count + 1;
            let cas = SetOptions {
                ttl: None,
                prev_exist: PrevExist::Must,
                prev_value: Some(count.to_string()),
            };
            match kv.set(&count_key, &next.to_string(), cas).await {
                Ok(_) => *count = next,
                Err(e) => error!("Failed to increment deployment count: {}", e),
            }
        });
    }
}

impl FailureSink for CoordinationBackend {
    fn deployment_failed(&self, _deployment: &Deployment) {
        // Failures are journaled locally; peers only observe completions
    }
}

impl WatchRegistrar for CoordinationBackend {
    fn watch(&self, key: &str, callback: WatchCallback) {
        trace!("Starting watch on {}", key);
        let kv = self.kv.clone();
        let key = key.to_string();
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut stream = match kv.watch(&key, true).await {
                Ok(stream) => stream,
                Err(e) => {
                    error!("Could not start watch on {}: {}", key, e);
                    return;
                }
            };
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        trace!("Received shutdown: aborting watch on {}", key);
                        return;
                    }
                    event = stream.recv() => {
                        let Some(event) = event else { return };
                        callback(event.node.value.clone());
                    }
                }
            }
        });
    }
}
