//! Deployment lifecycle
//!
//! A deployment is one execution of a package against a variable binding. It
//! is created on HTTP submission or journal replay, mutated by exactly one
//! engine task, journaled on each durable transition, and never deleted.

pub mod engine;
pub mod repository;

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use engine::Engine;
pub use repository::Repository;

/// Lifecycle states. `Waiting` and `Replicating` are reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeploymentStatus {
    #[serde(rename = "NOT_STARTED")]
    NotStarted,
    #[serde(rename = "WORKING")]
    Working,
    #[serde(rename = "WAITING")]
    Waiting,
    #[serde(rename = "REPLICATING")]
    Replicating,
    #[serde(rename = "COMPLETE")]
    Complete,
    #[serde(rename = "FAILED")]
    Failed,
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeploymentStatus::NotStarted => "NOT_STARTED",
            DeploymentStatus::Working => "WORKING",
            DeploymentStatus::Waiting => "WAITING",
            DeploymentStatus::Replicating => "REPLICATING",
            DeploymentStatus::Complete => "COMPLETE",
            DeploymentStatus::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// One execution of a package. The id is assigned at submission and never
/// changes; restarts reuse it when re-running an incomplete deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,

    #[serde(rename = "packageId")]
    pub package_id: String,

    #[serde(rename = "statusMessage")]
    pub status_message: String,

    pub status: DeploymentStatus,

    /// Substitution map; augmented with `__package`, `__packageId` and
    /// `__deploymentId` when the engine picks the deployment up.
    pub variables: HashMap<String, String>,

    /// Whether to install long-lived watches for the package's templates
    pub watch: bool,

    /// When set, only this template of the package is deployed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,

    /// 0..=100 progress estimate from fragment/template wall-clock averages
    #[serde(rename = "estComplete", default)]
    pub est_complete: u8,
}

impl Deployment {
    pub fn new(
        package_id: String,
        variables: HashMap<String, String>,
        watch: bool,
        template: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            package_id,
            status_message: "Not Started".to_string(),
            status: DeploymentStatus::NotStarted,
            variables,
            watch,
            template,
            est_complete: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            DeploymentStatus::Complete | DeploymentStatus::Failed
        )
    }
}

/// Callback fired with the new value each time a watched key changes.
pub type WatchCallback = Arc<dyn Fn(String) + Send + Sync>;

/// Consumes successful terminal transitions.
pub trait CompletionSink: Send + Sync {
    fn deployment_complete(&self, deployment: &Deployment);
}

/// Consumes failed terminal transitions.
pub trait FailureSink: Send + Sync {
    fn deployment_failed(&self, deployment: &Deployment);
}

/// Installs long-lived key watches on behalf of the engine.
pub trait WatchRegistrar: Send + Sync {
    fn watch(&self, key: &str, callback: WatchCallback);
}

/// The full notifier surface the engine talks to. The repository implements
/// it by composition: journal first, then forward to the cluster layer.
pub trait DeploymentNotifier: CompletionSink + FailureSink + WatchRegistrar {}

impl<T: CompletionSink + FailureSink + WatchRegistrar> DeploymentNotifier for T {}
