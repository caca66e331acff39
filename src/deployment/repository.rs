//! In-memory registry of packages and deployments
//!
//! Single owner of the live collections. Deployments reference packages by
//! id and resolve them through the repository; there are no back-pointers.
//! As the engine's notifier, the repository journals every terminal
//! transition before forwarding it to the cluster layer.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tracing::{error, info, trace, warn};

use super::engine::Engine;
use super::{
    CompletionSink, Deployment, DeploymentNotifier, DeploymentStatus, FailureSink, WatchCallback,
    WatchRegistrar,
};
use crate::journal::FileJournal;
use crate::kv::KvStore;
use crate::pkg::{load_packages, Package};

type SharedDeployment = Arc<RwLock<Deployment>>;

pub struct Repository {
    config_dir: PathBuf,
    packages: Vec<Arc<Package>>,
    deployments: StdRwLock<HashMap<String, SharedDeployment>>,
    journal: Option<Arc<FileJournal>>,
    /// Feeds the single writer task; one queue keeps record order matching
    /// submission order, which replay treats as the source of truth
    journal_tx: Option<mpsc::UnboundedSender<Deployment>>,
    cluster_notifier: Option<Arc<dyn DeploymentNotifier>>,
    command_timeout: Option<Duration>,
}

impl Repository {
    /// Load packages and build the repository. Journal replay is a separate
    /// step ([`Repository::load_journaled_deployments`]) so the caller can
    /// decide when redeploys may start.
    pub fn init(
        config_dir: &Path,
        journal: Option<Arc<FileJournal>>,
        cluster_notifier: Option<Arc<dyn DeploymentNotifier>>,
        kv: Option<Arc<dyn KvStore>>,
        command_timeout: Option<Duration>,
    ) -> Arc<Self> {
        trace!("Initializing repository");
        let packages = load_packages(config_dir, kv);

        let journal_tx = journal.as_ref().map(|journal| {
            let journal = journal.clone();
            let (tx, mut rx) = mpsc::unbounded_channel::<Deployment>();
            tokio::spawn(async move {
                while let Some(entry) = rx.recv().await {
                    let journal = journal.clone();
                    let written =
                        tokio::task::spawn_blocking(move || journal.write_entry(&entry)).await;
                    match written {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => error!("Failed to write entry to journal: {}", e),
                        Err(e) => error!("Journal writer task failed: {}", e),
                    }
                }
            });
            tx
        });

        Arc::new(Self {
            config_dir: config_dir.to_path_buf(),
            packages,
            deployments: StdRwLock::new(HashMap::new()),
            journal,
            journal_tx,
            cluster_notifier,
            command_timeout,
        })
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn packages(&self) -> &[Arc<Package>] {
        &self.packages
    }

    pub fn find_package(&self, id: &str) -> Option<Arc<Package>> {
        self.packages.iter().find(|p| p.id == id).cloned()
    }

    pub fn find_deployment(&self, id: &str) -> Option<SharedDeployment> {
        self.deployments
            .read()
            .expect("deployments lock poisoned")
            .get(id)
            .cloned()
    }

    pub fn add_deployment(&self, deployment: SharedDeployment, id: String) {
        self.deployments
            .write()
            .expect("deployments lock poisoned")
            .insert(id, deployment);
    }

    /// Point-in-time clone of every deployment, keyed by id.
    pub async fn deployments_snapshot(&self) -> HashMap<String, Deployment> {
        let shared: Vec<SharedDeployment> = {
            let map = self.deployments.read().expect("deployments lock poisoned");
            map.values().cloned().collect()
        };
        let mut snapshot = HashMap::with_capacity(shared.len());
        for deployment in shared {
            let d = deployment.read().await.clone();
            snapshot.insert(d.id.clone(), d);
        }
        snapshot
    }

    /// Create and start a full-package deployment. Returns the submitted
    /// snapshot; progress is observed by polling `/deployments/{id}`.
    pub fn submit_deployment(
        self: &Arc<Self>,
        pkg: Arc<Package>,
        variables: HashMap<String, String>,
        watch: bool,
    ) -> Deployment {
        let deployment = Deployment::new(pkg.id.clone(), variables, watch, None);
        info!("Deploying {} - {}", pkg.name, deployment.id);
        self.start(pkg, deployment)
    }

    /// Create and start a single-template deployment.
    pub fn submit_template_deployment(
        self: &Arc<Self>,
        pkg: Arc<Package>,
        template_name: &str,
        variables: HashMap<String, String>,
        watch: bool,
    ) -> Deployment {
        let deployment = Deployment::new(
            pkg.id.clone(),
            variables,
            watch,
            Some(template_name.to_string()),
        );
        info!(
            "Deploying {} - {}:{}",
            deployment.id, pkg.name, template_name
        );
        self.start(pkg, deployment)
    }

    fn start(self: &Arc<Self>, pkg: Arc<Package>, deployment: Deployment) -> Deployment {
        let snapshot = deployment.clone();
        let shared = Arc::new(RwLock::new(deployment));
        self.add_deployment(shared.clone(), snapshot.id.clone());
        self.journal_deployment(&snapshot);

        trace!("Starting deployment {} of {}", snapshot.id, pkg.name);
        let engine = self.engine();
        let template = snapshot.template.clone();
        tokio::spawn(async move {
            match template {
                Some(name) => engine.deploy_template(pkg, shared, &name).await,
                None => engine.deploy(pkg, shared).await,
            }
        });
        snapshot
    }

    fn engine(self: &Arc<Self>) -> Engine {
        Engine::new(self.clone(), self.command_timeout)
    }

    /// Persist a deployment snapshot to the journal. Write failures are
    /// logged and otherwise ignored; the deployment proceeds.
    pub fn journal_deployment(&self, deployment: &Deployment) {
        let Some(journal_tx) = &self.journal_tx else {
            trace!("No journal backend loaded");
            return;
        };
        if journal_tx.send(deployment.clone()).is_err() {
            error!("Journal writer is gone, dropping entry for {}", deployment.id);
        }
    }

    /// Replay the journal: rebuild the deployment map (log order wins),
    /// reinstall watches for completed watch deployments, and re-run every
    /// deployment that never reached `COMPLETE`, including failed ones; the
    /// journal doubles as a recovery queue.
    pub async fn load_journaled_deployments(self: &Arc<Self>) {
        let Some(journal) = &self.journal else {
            return;
        };

        let entries: Vec<Deployment> = journal.read_entries();
        {
            let mut map = self.deployments.write().expect("deployments lock poisoned");
            for deployment in entries {
                map.insert(
                    deployment.id.clone(),
                    Arc::new(RwLock::new(deployment)),
                );
            }
            info!("Read {} journaled deployments", map.len());
        }

        let replayed: Vec<SharedDeployment> = {
            let map = self.deployments.read().expect("deployments lock poisoned");
            map.values().cloned().collect()
        };

        let mut redeploys = 0;
        for shared in replayed {
            let deployment = shared.read().await.clone();
            let Some(pkg) = self.find_package(&deployment.package_id) else {
                warn!(
                    "Journaled deployment {} references unknown package {}, skipping",
                    deployment.id, deployment.package_id
                );
                continue;
            };

            if deployment.status != DeploymentStatus::Complete {
                // The engine re-runs it; watches reinstall along the way
                redeploys += 1;
                let engine = self.engine();
                tokio::spawn(async move {
                    match deployment.template {
                        Some(name) => engine.deploy_template(pkg, shared, &name).await,
                        None => engine.deploy(pkg, shared).await,
                    }
                });
                continue;
            }

            if deployment.watch {
                self.reinstall_watches(&pkg, &deployment);
            }
        }
        if redeploys > 0 {
            info!("Redeployed {} journaled deployments", redeploys);
        }
    }

    fn reinstall_watches(self: &Arc<Self>, pkg: &Arc<Package>, deployment: &Deployment) {
        let engine = self.engine();
        for (index, template) in pkg.templates.iter().enumerate() {
            if template.watch.is_empty() {
                continue;
            }
            if let Some(name) = &deployment.template {
                if &template.src != name {
                    continue;
                }
            }
            match pkg
                .table
                .render(&format!("{}_dest", template.src), &deployment.variables)
            {
                Ok(dest) => engine.install_watches(
                    pkg.clone(),
                    index,
                    deployment.variables.clone(),
                    dest,
                ),
                Err(e) => {
                    warn!(
                        "Could not resume watch for deployment {}: {}",
                        deployment.id, e
                    );
                }
            }
        }
    }
}

impl CompletionSink for Repository {
    fn deployment_complete(&self, deployment: &Deployment) {
        self.journal_deployment(deployment);
        if let Some(notifier) = &self.cluster_notifier {
            notifier.deployment_complete(deployment);
        }
    }
}

impl FailureSink for Repository {
    fn deployment_failed(&self, deployment: &Deployment) {
        self.journal_deployment(deployment);
        if let Some(notifier) = &self.cluster_notifier {
            notifier.deployment_failed(deployment);
        }
    }
}

impl WatchRegistrar for Repository {
    fn watch(&self, key: &str, callback: WatchCallback) {
        match &self.cluster_notifier {
            Some(notifier) => notifier.watch(key, callback),
            None => trace!("No cluster backend loaded, watch on {} ignored", key),
        }
    }
}
