//! Deployment execution engine
//!
//! Drives a single deployment through its state machine: variable
//! augmentation, the package-level before fragments, each template's
//! dest/before/body/write/watch/after cycle, the after fragments, and the
//! terminal transition. Any failure short-circuits to `FAILED`; there are no
//! transitions out of a terminal state; retrying means a new deployment id.

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::RwLock;
use tracing::{debug, info, trace, warn};

use super::{Deployment, DeploymentNotifier, DeploymentStatus, WatchCallback};
use crate::errors::AgentError;
use crate::pkg::{ExecutionFragment, Package, Template};

type SharedDeployment = Arc<RwLock<Deployment>>;
type Variables = HashMap<String, String>;

pub struct Engine {
    notifier: Arc<dyn DeploymentNotifier>,
    command_timeout: Option<Duration>,
}

impl Engine {
    pub fn new(notifier: Arc<dyn DeploymentNotifier>, command_timeout: Option<Duration>) -> Self {
        Self {
            notifier,
            command_timeout,
        }
    }

    /// Full package deployment.
    pub async fn deploy(&self, pkg: Arc<Package>, deployment: SharedDeployment) {
        info!("Deploying {}", pkg.name);
        let measure = pkg.metrics.start_measure();
        let variables = self.prepare(&pkg, &deployment).await;

        self.update(&deployment, |d| {
            d.status = DeploymentStatus::Working;
            d.status_message = "Running initialization commands".to_string();
            d.est_complete = 0;
        })
        .await;

        if let Err(e) = self
            .run_fragments(&pkg, &pkg.templates_before, &variables, Some(&deployment))
            .await
        {
            self.fail(&pkg, &deployment, e).await;
            return;
        }

        let watch = deployment.read().await.watch;
        for index in 0..pkg.templates.len() {
            if let Err(e) = self
                .handle_template(&pkg, index, &variables, &deployment, watch)
                .await
            {
                self.fail(&pkg, &deployment, e).await;
                return;
            }
        }

        self.update(&deployment, |d| {
            d.status_message = "Running finalization commands".to_string();
        })
        .await;

        if let Err(e) = self
            .run_fragments(&pkg, &pkg.templates_after, &variables, Some(&deployment))
            .await
        {
            self.fail(&pkg, &deployment, e).await;
            return;
        }

        pkg.metrics.stop_measure(measure);
        self.update(&deployment, |d| {
            d.status = DeploymentStatus::Complete;
            d.status_message = "Package Deployed".to_string();
            d.est_complete = 100;
        })
        .await;
        let snapshot = deployment.read().await.clone();
        self.notifier.deployment_complete(&snapshot);
    }

    /// Single-template deployment: runs only the matching template's cycle,
    /// skipping the package-level before/after fragments.
    pub async fn deploy_template(
        &self,
        pkg: Arc<Package>,
        deployment: SharedDeployment,
        template_name: &str,
    ) {
        info!("Deploying {}:{}", pkg.name, template_name);
        let variables = self.prepare(&pkg, &deployment).await;

        self.update(&deployment, |d| {
            d.status = DeploymentStatus::Working;
            d.est_complete = 0;
        })
        .await;

        let watch = deployment.read().await.watch;
        for index in 0..pkg.templates.len() {
            if pkg.templates[index].src != template_name {
                continue;
            }
            if let Err(e) = self
                .handle_template(&pkg, index, &variables, &deployment, watch)
                .await
            {
                self.fail(&pkg, &deployment, e).await;
                return;
            }
        }

        self.update(&deployment, |d| {
            d.status = DeploymentStatus::Complete;
            d.status_message = "Package Template Deployed".to_string();
            d.est_complete = 100;
        })
        .await;
        let snapshot = deployment.read().await.clone();
        self.notifier.deployment_complete(&snapshot);
    }

    /// Install the live watches for one template. Also used by journal replay
    /// to reconstruct handlers for completed deployments.
    pub fn install_watches(
        &self,
        pkg: Arc<Package>,
        template_index: usize,
        variables: Variables,
        dest: String,
    ) {
        let template = &pkg.templates[template_index];
        for expr in &template.watch {
            let key = match pkg.table.render(expr, &variables) {
                Ok(key) => key,
                Err(e) => {
                    warn!("Could not render watch key for {}: {}", template.src, e);
                    continue;
                }
            };
            info!(
                "Starting watch for template {} on key {}",
                template.src, key
            );

            let pkg = pkg.clone();
            let variables = variables.clone();
            let dest = dest.clone();
            let command_timeout = self.command_timeout;
            let handler: WatchCallback = Arc::new(move |_value: String| {
                let pkg = pkg.clone();
                let variables = variables.clone();
                let dest = dest.clone();
                tokio::spawn(async move {
                    rewrite_template(pkg, template_index, variables, dest, command_timeout).await;
                });
            });
            self.notifier.watch(&key, handler);
        }
    }

    async fn prepare(&self, pkg: &Arc<Package>, deployment: &SharedDeployment) -> Variables {
        let mut d = deployment.write().await;
        d.variables
            .insert("__package".to_string(), pkg.name.clone());
        d.variables
            .insert("__packageId".to_string(), pkg.id.clone());
        let id = d.id.clone();
        d.variables.insert("__deploymentId".to_string(), id);
        d.variables.clone()
    }

    async fn handle_template(
        &self,
        pkg: &Arc<Package>,
        index: usize,
        variables: &Variables,
        deployment: &SharedDeployment,
        watch: bool,
    ) -> Result<(), AgentError> {
        let template = &pkg.templates[index];
        let measure = template.metrics.start_measure();
        if !template.description.is_empty() {
            let description = template.description.clone();
            self.update(deployment, |d| d.status_message = description).await;
        }

        let dest = pkg
            .table
            .render(&format!("{}_dest", template.src), variables)?;

        self.run_fragments(pkg, &template.before, variables, Some(deployment))
            .await?;

        let body = pkg
            .table
            .render(&format!("{}.tpl", template.src), variables)?;

        trace!("Writing to file {}", dest);
        write_output(&dest, &body, template).await?;

        if watch {
            self.install_watches(pkg.clone(), index, variables.clone(), dest);
        }

        self.run_fragments(pkg, &template.after, variables, Some(deployment))
            .await?;

        template.metrics.stop_measure(measure);
        let bump = template.metrics.percent_of_total(&pkg.metrics);
        self.bump_progress(deployment, bump).await;
        Ok(())
    }

    async fn run_fragments(
        &self,
        pkg: &Arc<Package>,
        fragments: &[ExecutionFragment],
        variables: &Variables,
        deployment: Option<&SharedDeployment>,
    ) -> Result<(), AgentError> {
        for fragment in fragments {
            self.run_fragment(pkg, fragment, variables, deployment)
                .await?;
        }
        Ok(())
    }

    /// Apply the fragment rules to one fragment. A `None` deployment means a
    /// watch-handler context: no status updates, no progress accounting.
    async fn run_fragment(
        &self,
        pkg: &Arc<Package>,
        fragment: &ExecutionFragment,
        variables: &Variables,
        deployment: Option<&SharedDeployment>,
    ) -> Result<(), AgentError> {
        let measure = fragment.metrics.start_measure();

        let message = match &fragment.status_cmd {
            Some(expr) => pkg.table.render(expr, variables)?,
            None => fragment.status.clone(),
        };
        if let Some(deployment) = deployment {
            self.update(deployment, |d| d.status_message = message).await;
        }

        match &fragment.check {
            Some(check) => {
                let rendered = pkg.table.render(check, variables)?;
                let (passed, _) = exec_shell(&rendered, self.command_timeout).await;
                if passed {
                    // Check passed: the command must now succeed regardless
                    // of the package strict flag
                    let cmd = pkg.table.render(&fragment.cmd, variables)?;
                    let (ok, output) = exec_shell(&cmd, self.command_timeout).await;
                    if !ok {
                        return Err(AgentError::Deploy(format!(
                            "checked command {:?} failed: {}",
                            fragment.cmd,
                            output.trim()
                        )));
                    }
                } else {
                    trace!("Check {:?} did not pass, skipping command", check);
                }
            }
            None => {
                let cmd = pkg.table.render(&fragment.cmd, variables)?;
                let (ok, output) = exec_shell(&cmd, self.command_timeout).await;
                if !ok && pkg.strict {
                    return Err(AgentError::Deploy(format!(
                        "command {:?} failed: {}",
                        fragment.cmd,
                        output.trim()
                    )));
                }
            }
        }

        fragment.metrics.stop_measure(measure);
        if let Some(deployment) = deployment {
            let bump = fragment.metrics.percent_of_total(&pkg.metrics);
            self.bump_progress(deployment, bump).await;
        }
        Ok(())
    }

    async fn update<F: FnOnce(&mut Deployment)>(&self, deployment: &SharedDeployment, apply: F) {
        let mut d = deployment.write().await;
        apply(&mut d);
    }

    async fn bump_progress(&self, deployment: &SharedDeployment, amount: u8) {
        if amount == 0 {
            return;
        }
        let mut d = deployment.write().await;
        d.est_complete = d.est_complete.saturating_add(amount).min(100);
    }

    async fn fail(&self, pkg: &Arc<Package>, deployment: &SharedDeployment, error: AgentError) {
        let snapshot = {
            let mut d = deployment.write().await;
            info!(
                "Deployment for package {} failed to complete: {}",
                d.package_id, error
            );
            d.status_message = format!(
                "Deployment {} of package {} failed: {}",
                d.id, pkg.id, error
            );
            d.status = DeploymentStatus::Failed;
            d.clone()
        };
        self.notifier.deployment_failed(&snapshot);
    }
}

/// Re-render and rewrite a watched template: before fragments, body, file
/// write with mode/owner, after fragments. Fire-and-forget; failures are
/// logged and leave the previous file contents in place.
async fn rewrite_template(
    pkg: Arc<Package>,
    template_index: usize,
    variables: Variables,
    dest: String,
    command_timeout: Option<Duration>,
) {
    let template = &pkg.templates[template_index];

    for fragment in &template.before {
        if let Err(e) = run_watch_fragment(&pkg, fragment, &variables, command_timeout).await {
            warn!("Watch rewrite of {} aborted: {}", dest, e);
            return;
        }
    }

    let body = match pkg.table.render(&format!("{}.tpl", template.src), &variables) {
        Ok(body) => body,
        Err(e) => {
            warn!("Watch rewrite of {} could not render: {}", dest, e);
            return;
        }
    };

    trace!("Writing to file {}", dest);
    if let Err(e) = write_output(&dest, &body, template).await {
        warn!("Watch rewrite of {} could not write: {}", dest, e);
        return;
    }

    for fragment in &template.after {
        if let Err(e) = run_watch_fragment(&pkg, fragment, &variables, command_timeout).await {
            warn!("Watch rewrite of {} post-command failed: {}", dest, e);
            return;
        }
    }
}

async fn run_watch_fragment(
    pkg: &Arc<Package>,
    fragment: &ExecutionFragment,
    variables: &Variables,
    command_timeout: Option<Duration>,
) -> Result<(), AgentError> {
    match &fragment.check {
        Some(check) => {
            let rendered = pkg.table.render(check, variables)?;
            let (passed, _) = exec_shell(&rendered, command_timeout).await;
            if passed {
                let cmd = pkg.table.render(&fragment.cmd, variables)?;
                let (ok, output) = exec_shell(&cmd, command_timeout).await;
                if !ok {
                    return Err(AgentError::Deploy(format!(
                        "checked command {:?} failed: {}",
                        fragment.cmd,
                        output.trim()
                    )));
                }
            }
        }
        None => {
            let cmd = pkg.table.render(&fragment.cmd, variables)?;
            let (ok, output) = exec_shell(&cmd, command_timeout).await;
            if !ok && pkg.strict {
                return Err(AgentError::Deploy(format!(
                    "command {:?} failed: {}",
                    fragment.cmd,
                    output.trim()
                )));
            }
        }
    }
    Ok(())
}

/// Execute a command as `sh -c`, returning success and the combined
/// stdout/stderr buffer. Without a timeout the wait is unbounded.
pub async fn exec_shell(cmd: &str, timeout: Option<Duration>) -> (bool, String) {
    let future = Command::new("sh").arg("-c").arg(cmd).output();
    let output = match timeout {
        Some(limit) => match tokio::time::timeout(limit, future).await {
            Ok(output) => output,
            Err(_) => {
                info!("Command {:?} timed out after {:?}", cmd, limit);
                return (false, format!("command timed out after {:?}", limit));
            }
        },
        None => future.await,
    };

    match output {
        Ok(output) => {
            let mut buffer = String::from_utf8_lossy(&output.stdout).into_owned();
            buffer.push_str(&String::from_utf8_lossy(&output.stderr));
            if output.status.success() {
                trace!("Executed command {:?}: {}", cmd, buffer.trim());
                (true, buffer)
            } else {
                info!("Failed to execute command {:?}: {}", cmd, output.status);
                trace!("Command output: {}", buffer.trim());
                (false, buffer)
            }
        }
        Err(e) => {
            info!("Failed to spawn command {:?}: {}", cmd, e);
            (false, e.to_string())
        }
    }
}

async fn write_output(dest: &str, body: &str, template: &Template) -> Result<(), AgentError> {
    if let Some(parent) = Path::new(dest).parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(dest, body).await?;
    tokio::fs::set_permissions(dest, std::fs::Permissions::from_mode(template.file_mode)).await?;
    if let Err(e) = std::os::unix::fs::chown(dest, Some(template.uid), Some(template.gid)) {
        debug!("Could not chown {}: {}", dest, e);
    }
    Ok(())
}
