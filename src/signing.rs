//! Detached-signature verification via the host `gpg` tool.
//!
//! Verification never returns an error: any failure of the underlying
//! tool, including a failed public-key import or an unspawnable binary,
//! collapses to `false`. Callers must treat `false` as "unverified" and
//! refuse to proceed; there is no unverified fallback anywhere in this
//! crate.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

/// Seam for detached-signature verification.
///
/// The production implementation shells out to gpg; tests substitute a
/// stub so the refusal gates can be exercised without a trust store.
#[async_trait]
pub trait Verifier: Send + Sync {
    /// Verify `data_path` against the detached signature at `sig_path`.
    ///
    /// When `pubkey_path` is given it is imported into the trust store
    /// first; an import failure counts as verification failure.
    async fn verify(&self, sig_path: &Path, data_path: &Path, pubkey_path: Option<&Path>) -> bool;
}

/// Verifier backed by the host `gpg` binary.
#[derive(Debug, Clone, Copy, Default)]
pub struct GpgVerifier;

#[async_trait]
impl Verifier for GpgVerifier {
    async fn verify(&self, sig_path: &Path, data_path: &Path, pubkey_path: Option<&Path>) -> bool {
        if let Some(key) = pubkey_path {
            let imported = Command::new("gpg")
                .arg("--import")
                .arg(key)
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
            match imported {
                Ok(status) if status.success() => {}
                Ok(status) => {
                    tracing::warn!(key = %key.display(), %status, "public key import failed");
                    return false;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "could not invoke gpg for key import");
                    return false;
                }
            }
        }

        match Command::new("gpg")
            .arg("--verify")
            .arg(sig_path)
            .arg(data_path)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
        {
            Ok(status) => status.success(),
            Err(e) => {
                tracing::warn!(error = %e, "could not invoke gpg for verification");
                false
            }
        }
    }
}
