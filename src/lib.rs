//! Warden - hardened supervision agent for verified miner workloads.
//!
//! Runs exactly one worker process at a time inside a locked-down Docker
//! sandbox, follows its output to rank workloads by throughput, and keeps
//! the worker binaries current through signature-verified, atomically
//! installed releases.
//!
//! # Security Boundaries
//!
//! - Workers: separate container, all capabilities dropped, read-only
//!   root, unprivileged uid, pids/memory/cpu ceilings
//! - Binaries: regular 0755 files with a verifying detached signature,
//!   or they do not run
//! - Updates: unsigned or unverified assets are surfaced for human
//!   review, never installed; installs are atomic same-directory renames

pub mod config;
pub mod sandbox;
pub mod signing;
pub mod supervisor;
pub mod update;
pub mod workload;

use std::sync::Arc;

use config::AgentConfig;
use sandbox::SandboxLauncher;
use signing::{GpgVerifier, Verifier};
use supervisor::{ProcessSupervisor, SupervisorError, SupervisorStatus};
use update::{GithubReleases, InstallOutcome, UpdateController, UpdateError};
use workload::WorkloadKind;

/// The assembled agent: supervised worker slot plus update pipeline,
/// both sharing one signature verifier.
pub struct Agent {
    pub config: AgentConfig,
    pub supervisor: Arc<ProcessSupervisor>,
    pub updates: UpdateController,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Self {
        let verifier: Arc<dyn Verifier> = Arc::new(GpgVerifier);

        let launcher = SandboxLauncher::new(config.secure.sandbox.clone(), verifier.clone());
        let supervisor = Arc::new(ProcessSupervisor::new(
            config.workload.clone(),
            launcher,
            config.supervisor_config(),
        ));

        let source = Arc::new(GithubReleases::new(verifier));
        let updates = UpdateController::new(
            source,
            config.update_policy(),
            config.secure.pubkey_path.clone(),
        );

        Self { config, supervisor, updates }
    }

    pub async fn start_workload(&self, kind: WorkloadKind) -> Result<Option<u32>, SupervisorError> {
        self.supervisor.start(kind).await
    }

    pub async fn stop_workload(&self) {
        self.supervisor.stop().await;
    }

    pub async fn status(&self) -> SupervisorStatus {
        self.supervisor.status().await
    }

    /// One update check against the configured channel. Unconfigured
    /// channels report no update.
    pub async fn check_for_update(&self) -> bool {
        if !self.config.update.is_configured() {
            return false;
        }
        self.updates
            .check_for_update(
                &self.config.update.owner,
                &self.config.update.repo,
                &config::current_version(),
            )
            .await
    }

    /// Fetch, verify, and install (or stage) the configured update asset.
    pub async fn request_install(&self) -> Result<InstallOutcome, UpdateError> {
        let channel = &self.config.update;
        let install_path = match &channel.install_path {
            Some(path) => path.clone(),
            None => match std::env::current_exe() {
                Ok(path) => path,
                Err(e) => {
                    tracing::warn!(error = %e, "cannot resolve install target");
                    return Ok(InstallOutcome::NoVerifiedAsset);
                }
            },
        };
        self.updates
            .request_install(&channel.owner, &channel.repo, &channel.asset_contains, &install_path)
            .await
    }

    pub async fn confirm_install(&self, token: &str) -> Result<InstallOutcome, UpdateError> {
        self.updates.confirm_install(token).await
    }
}
