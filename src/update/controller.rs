//! Update orchestration: check, stage, confirm, install.
//!
//! A verified asset only reaches disk through [`atomic_install`], and only
//! when the configured policy allows it. With confirmation required, the
//! install is staged under an unguessable token and completes exclusively
//! through [`UpdateController::confirm_install`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use rand::RngCore;
use thiserror::Error;

use super::installer::{atomic_install, validate_installed, InstallError, INSTALL_MODE};
use super::release::{surface_release_page, ReleaseSource};

/// Policy knobs for binary replacement.
#[derive(Debug, Clone, Copy)]
pub struct UpdatePolicy {
    /// Whether verified assets may be installed at all.
    pub auto_replace: bool,
    /// Whether an install must be staged and explicitly confirmed.
    pub require_confirmation: bool,
}

impl Default for UpdatePolicy {
    fn default() -> Self {
        Self { auto_replace: false, require_confirmation: true }
    }
}

/// A staged, verified install awaiting explicit confirmation.
///
/// Entries live until confirmed; there is deliberately no TTL or cap,
/// matching the agent's long-standing ledger semantics.
#[derive(Debug, Clone)]
pub struct PendingInstall {
    pub owner: String,
    pub repo: String,
    pub asset_contains: String,
    pub staged_path: PathBuf,
    pub install_path: PathBuf,
}

/// Outcome of an install request or confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    /// No asset passed the signature gate; nothing was written.
    NoVerifiedAsset,
    /// Replacement is disabled by policy; nothing was written.
    ManualInstallRequired,
    /// Staged and awaiting confirmation under `token`; nothing written yet.
    Pending { token: String },
    /// Installed and validated at `path`.
    Installed { path: PathBuf, validated: bool },
}

#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("pending install token not found: {0}")]
    UnknownToken(String),

    #[error(transparent)]
    Install(#[from] InstallError),
}

/// Owns the pending-install ledger and drives the fetch → verify →
/// install pipeline.
pub struct UpdateController {
    source: Arc<dyn ReleaseSource>,
    policy: UpdatePolicy,
    pubkey_path: Option<PathBuf>,
    pending: DashMap<String, PendingInstall>,
}

impl UpdateController {
    pub fn new(
        source: Arc<dyn ReleaseSource>,
        policy: UpdatePolicy,
        pubkey_path: Option<PathBuf>,
    ) -> Self {
        Self { source, policy, pubkey_path, pending: DashMap::new() }
    }

    /// True iff the latest release tag differs from `current_version`.
    /// Any fetch failure is treated as "no update", not escalated.
    pub async fn check_for_update(&self, owner: &str, repo: &str, current_version: &str) -> bool {
        let Some(info) = self.source.latest_release(owner, repo).await else {
            return false;
        };
        if !info.tag_name.is_empty() && info.tag_name != current_version {
            tracing::info!(tag = %info.tag_name, current = %current_version, "update available");
            surface_release_page(&info.html_url);
            true
        } else {
            false
        }
    }

    /// Fetch and verify an asset, then install, stage, or refuse per
    /// policy. Nothing is written to `install_path` unless policy allows
    /// an immediate install.
    pub async fn request_install(
        &self,
        owner: &str,
        repo: &str,
        asset_contains: &str,
        install_path: &Path,
    ) -> Result<InstallOutcome, UpdateError> {
        let staged = match self
            .source
            .fetch_and_verify_asset(owner, repo, asset_contains, self.pubkey_path.as_deref())
            .await
        {
            Some(path) => path,
            None => return Ok(InstallOutcome::NoVerifiedAsset),
        };

        if !self.policy.auto_replace {
            tracing::info!("auto_replace disabled in configuration; manual install required");
            return Ok(InstallOutcome::ManualInstallRequired);
        }

        if self.policy.require_confirmation {
            let token = fresh_token();
            self.pending.insert(
                token.clone(),
                PendingInstall {
                    owner: owner.to_string(),
                    repo: repo.to_string(),
                    asset_contains: asset_contains.to_string(),
                    staged_path: staged,
                    install_path: install_path.to_path_buf(),
                },
            );
            tracing::info!(%token, "install staged; awaiting confirmation");
            return Ok(InstallOutcome::Pending { token });
        }

        let (path, validated) = install(staged, install_path.to_path_buf()).await?;
        Ok(InstallOutcome::Installed { path, validated })
    }

    /// Complete a staged install. The entry is taken from the ledger
    /// atomically, so a token is consumable exactly once; on install
    /// failure it is restored for retry.
    pub async fn confirm_install(&self, token: &str) -> Result<InstallOutcome, UpdateError> {
        let (key, entry) = self
            .pending
            .remove(token)
            .ok_or_else(|| UpdateError::UnknownToken(token.to_string()))?;

        match install(entry.staged_path.clone(), entry.install_path.clone()).await {
            Ok((path, validated)) => {
                tracing::info!(%key, path = %path.display(), "confirmed install completed");
                Ok(InstallOutcome::Installed { path, validated })
            }
            Err(e) => {
                self.pending.insert(key, entry);
                Err(e.into())
            }
        }
    }

    /// Number of staged installs awaiting confirmation.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

/// Run the blocking install off the scheduling path.
async fn install(src: PathBuf, dest: PathBuf) -> Result<(PathBuf, bool), InstallError> {
    tokio::task::spawn_blocking(move || {
        let path = atomic_install(&src, &dest, INSTALL_MODE)?;
        let validated = validate_installed(&path, INSTALL_MODE);
        Ok((path, validated))
    })
    .await
    .map_err(|e| InstallError::Io(std::io::Error::other(e.to_string())))?
}

fn fresh_token() -> String {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}
