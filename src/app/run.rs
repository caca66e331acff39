//! Main application run loop

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::app::options::AppOptions;
use crate::cluster::{Cluster, Machine};
use crate::conf::ServerConfiguration;
use crate::coordination::{BackendConfig, BackendHandles, CoordinationBackend};
use crate::deployment::{DeploymentNotifier, Repository};
use crate::errors::AgentError;
use crate::journal::FileJournal;
use crate::kv::{EtcdKv, KvStore};
use crate::server::{serve, ServerState};

const MAX_SHUTDOWN_DELAY: Duration = Duration::from_secs(30);

/// Run the deployd agent until the shutdown signal fires.
pub async fn run(
    options: AppOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), AgentError> {
    info!("Initializing deployd agent...");

    let (shutdown_tx, _shutdown_rx): (broadcast::Sender<()>, _) = broadcast::channel(1);
    let mut manager = ShutdownManager::new(shutdown_tx.clone());

    if let Err(e) = init(&options, shutdown_tx.clone(), &mut manager).await {
        error!("Failed to start agent: {}", e);
        manager.shutdown().await?;
        return Err(e);
    }

    shutdown_signal.await;
    info!("Shutdown signal received, shutting down...");
    manager.shutdown().await
}

async fn init(
    options: &AppOptions,
    shutdown_tx: broadcast::Sender<()>,
    manager: &mut ShutdownManager,
) -> Result<(), AgentError> {
    // Configuration, from disk or a config backend
    let (config, config_backend) = match &options.config_from {
        Some(location) => {
            let (config, backend) = ServerConfiguration::load_from(location).await?;
            (config, Some(backend))
        }
        None => (ServerConfiguration::load(&options.config_dir)?, None),
    };
    info!("Starting... {}:{}", config.addr, config.port);

    // Cluster membership and the coordination backend
    let mut cluster_notifier: Option<Arc<dyn DeploymentNotifier>> = None;
    let mut template_kv: Option<Arc<dyn KvStore>> = None;
    if !options.no_cluster {
        info!("Starting with clustering");
        let cluster_config = match &config_backend {
            Some(backend) => backend.cluster_config().await,
            None => Cluster::load_config(&options.config_dir),
        };
        let cluster_config = cluster_config
            .ok_or_else(|| AgentError::Config("no cluster configuration found".into()))?;
        let backend_config = BackendConfig::parse(&cluster_config)?;

        let kv: Arc<dyn KvStore> = Arc::new(EtcdKv::new(
            backend_config.endpoints.clone(),
            shutdown_tx.clone(),
        )?);

        let endpoint = options
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("{}:{}", config.addr, config.port));
        let machine = Machine::local(endpoint, config.allowed_tags.clone());
        let cluster = Arc::new(Cluster::new(Some(cluster_config)));

        let (backend, mut status_rx, handles) =
            CoordinationBackend::init(kv.clone(), cluster, machine, shutdown_tx.clone()).await?;
        manager.with_backend_handles(handles)?;

        let status_handle = tokio::spawn(async move {
            while let Some(status) = status_rx.recv().await {
                info!("Cluster status: {}", status);
            }
        });
        manager.with_status_handle(status_handle)?;

        cluster_notifier = Some(backend);
        template_kv = Some(kv);
    }

    // Journal
    let journal = if options.no_journal {
        None
    } else {
        let journal_config = config.journal.clone().unwrap_or_default();
        Some(Arc::new(FileJournal::new(journal_config)?))
    };

    // Repository: packages, then journal replay and redeploys
    let repository = Repository::init(
        &options.config_dir,
        journal,
        cluster_notifier,
        template_kv,
        config.parsed_command_timeout(),
    );
    repository.load_journaled_deployments().await;

    // HTTP server
    let state = Arc::new(ServerState::new(repository, config.auth_token.clone()));
    let mut server_shutdown = shutdown_tx.subscribe();
    let server_handle = serve(&config.addr, config.port, state, async move {
        let _ = server_shutdown.recv().await;
    })
    .await?;
    manager.with_server_handle(server_handle)?;

    Ok(())
}

// ================================= SHUTDOWN ===================================== //

struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    server_handle: Option<JoinHandle<Result<(), AgentError>>>,
    backend_handles: Option<BackendHandles>,
    status_handle: Option<JoinHandle<()>>,
}

impl ShutdownManager {
    fn new(shutdown_tx: broadcast::Sender<()>) -> Self {
        Self {
            shutdown_tx,
            server_handle: None,
            backend_handles: None,
            status_handle: None,
        }
    }

    fn with_server_handle(
        &mut self,
        handle: JoinHandle<Result<(), AgentError>>,
    ) -> Result<(), AgentError> {
        if self.server_handle.is_some() {
            return Err(AgentError::Shutdown("server handle already set".to_string()));
        }
        self.server_handle = Some(handle);
        Ok(())
    }

    fn with_backend_handles(&mut self, handles: BackendHandles) -> Result<(), AgentError> {
        if self.backend_handles.is_some() {
            return Err(AgentError::Shutdown(
                "backend handles already set".to_string(),
            ));
        }
        self.backend_handles = Some(handles);
        Ok(())
    }

    fn with_status_handle(&mut self, handle: JoinHandle<()>) -> Result<(), AgentError> {
        if self.status_handle.is_some() {
            return Err(AgentError::Shutdown("status handle already set".to_string()));
        }
        self.status_handle = Some(handle);
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), AgentError> {
        let _ = self.shutdown_tx.send(());

        match tokio::time::timeout(MAX_SHUTDOWN_DELAY, self.shutdown_impl()).await {
            Ok(result) => result,
            Err(_) => {
                error!(
                    "Shutdown timed out after {:?}, forcing shutdown...",
                    MAX_SHUTDOWN_DELAY
                );
                std::process::exit(1);
            }
        }
    }

    async fn shutdown_impl(&mut self) -> Result<(), AgentError> {
        info!("Shutting down deployd agent...");

        // 1. Coordination backend
        if let Some(handles) = self.backend_handles.take() {
            handles
                .keep_alive
                .await
                .map_err(|e| AgentError::Shutdown(e.to_string()))?;
            handles
                .monitor
                .await
                .map_err(|e| AgentError::Shutdown(e.to_string()))?;
        }

        // 2. Status drain (ends with the backend's status channel)
        if let Some(handle) = self.status_handle.take() {
            handle.abort();
        }

        // 3. HTTP server
        if let Some(handle) = self.server_handle.take() {
            handle
                .await
                .map_err(|e| AgentError::Shutdown(e.to_string()))??;
        }

        info!("Shutdown complete");
        Ok(())
    }
}
