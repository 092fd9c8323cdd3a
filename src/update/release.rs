//! Release discovery and verified asset fetching.
//!
//! Talks to the GitHub releases API for a configured project. An asset is
//! only ever returned to the caller when a companion detached signature
//! exists and verifies; an unsigned download is hashed and surfaced for
//! manual review but never treated as verified. That asymmetry is the
//! trust boundary of the whole update path.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use crate::signing::Verifier;

const GITHUB_API: &str = "https://api.github.com";

/// One downloadable artifact of a release.
#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseAsset {
    pub name: String,
    pub browser_download_url: String,
}

/// Release metadata, transient per update check.
#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseInfo {
    #[serde(default)]
    pub tag_name: String,
    #[serde(default)]
    pub html_url: String,
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("download failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Seam over release discovery so the update controller is testable
/// without network access.
#[async_trait]
pub trait ReleaseSource: Send + Sync {
    /// Latest published release, or `None` on any non-success status or
    /// transport failure. No retries at this layer.
    async fn latest_release(&self, owner: &str, repo: &str) -> Option<ReleaseInfo>;

    /// Download and signature-gate the first asset whose name contains
    /// `contains`. Returns the verified local path, or `None` when no
    /// asset matched, the signature failed, or no signature exists.
    async fn fetch_and_verify_asset(
        &self,
        owner: &str,
        repo: &str,
        contains: &str,
        pubkey_path: Option<&Path>,
    ) -> Option<PathBuf>;
}

/// Surface a release page for manual human review.
///
/// Spawns `$BROWSER` when set (devcontainer host-browser convention) and
/// always logs the URL so headless hosts still get the pointer.
pub fn surface_release_page(url: &str) {
    if url.is_empty() {
        return;
    }
    tracing::warn!(%url, "release requires manual review");
    if let Ok(browser) = std::env::var("BROWSER") {
        if !browser.is_empty() {
            let _ = std::process::Command::new(browser)
                .arg(url)
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null())
                .spawn();
        }
    }
}

/// Pick the first asset containing `contains`, plus its companion
/// signature: an `.asc`/`.sig` asset whose name starts with the chosen
/// asset's file stem.
fn select_assets<'a>(
    assets: &'a [ReleaseAsset],
    contains: &str,
) -> (Option<&'a ReleaseAsset>, Option<&'a ReleaseAsset>) {
    let mut chosen: Option<&ReleaseAsset> = None;
    let mut sig: Option<&ReleaseAsset> = None;
    for asset in assets {
        if chosen.is_none() && asset.name.contains(contains) {
            chosen = Some(asset);
        }
        if asset.name.ends_with(".asc") || asset.name.ends_with(".sig") {
            if let Some(c) = chosen {
                let stem = Path::new(&c.name)
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or(c.name.as_str());
                if sig.is_none() && asset.name.starts_with(stem) {
                    sig = Some(asset);
                }
            }
        }
    }
    (chosen, sig)
}

async fn sha256_of(path: &Path) -> std::io::Result<String> {
    let bytes = tokio::fs::read(path).await?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

/// GitHub-backed release source.
pub struct GithubReleases {
    client: reqwest::Client,
    api_base: String,
    verifier: Arc<dyn Verifier>,
}

impl GithubReleases {
    pub fn new(verifier: Arc<dyn Verifier>) -> Self {
        Self::with_api_base(verifier, GITHUB_API)
    }

    /// Override the API base URL (test hook).
    pub fn with_api_base(verifier: Arc<dyn Verifier>, api_base: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("warden/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self { client, api_base: api_base.into(), verifier }
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<(), FetchError> {
        let mut resp = self.client.get(url).send().await?.error_for_status()?;
        let mut file = tokio::fs::File::create(dest).await?;
        while let Some(chunk) = resp.chunk().await? {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(())
    }

    /// Signature-gate an already-downloaded asset.
    ///
    /// Signed: the verifier decides; failure surfaces the release page and
    /// yields `None`. Unsigned: the digest is reported for audit, the
    /// release page is surfaced, and the result is always `None`.
    async fn gate_downloaded(
        &self,
        data_path: PathBuf,
        sig_path: Option<PathBuf>,
        pubkey_path: Option<&Path>,
        release_url: &str,
    ) -> Option<PathBuf> {
        match sig_path {
            Some(sig) => {
                if self.verifier.verify(&sig, &data_path, pubkey_path).await {
                    tracing::info!(asset = %data_path.display(), "release asset verified");
                    Some(data_path)
                } else {
                    tracing::warn!(asset = %data_path.display(), "release asset failed verification");
                    surface_release_page(release_url);
                    None
                }
            }
            None => {
                match sha256_of(&data_path).await {
                    Ok(digest) => tracing::warn!(
                        asset = %data_path.display(),
                        sha256 = %digest,
                        "asset has no detached signature; refusing to treat as verified"
                    ),
                    Err(e) => tracing::warn!(error = %e, "could not hash unsigned asset"),
                }
                surface_release_page(release_url);
                None
            }
        }
    }
}

#[async_trait]
impl ReleaseSource for GithubReleases {
    async fn latest_release(&self, owner: &str, repo: &str) -> Option<ReleaseInfo> {
        let url = format!("{}/repos/{}/{}/releases/latest", self.api_base, owner, repo);
        match self
            .client
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .send()
            .await
        {
            Ok(resp) if resp.status() == reqwest::StatusCode::OK => resp.json().await.ok(),
            Ok(resp) => {
                tracing::debug!(status = %resp.status(), %owner, %repo, "release query refused");
                None
            }
            Err(e) => {
                tracing::debug!(error = %e, %owner, %repo, "release query failed");
                None
            }
        }
    }

    async fn fetch_and_verify_asset(
        &self,
        owner: &str,
        repo: &str,
        contains: &str,
        pubkey_path: Option<&Path>,
    ) -> Option<PathBuf> {
        let info = self.latest_release(owner, repo).await?;
        let (chosen, sig_asset) = select_assets(&info.assets, contains);
        let chosen = chosen?;

        // Fresh scratch directory per fetch; kept on disk so a verified
        // path stays valid for the install step.
        let scratch = tempfile::Builder::new()
            .prefix("warden-fetch-")
            .tempdir()
            .ok()?
            .into_path();

        let data_path = scratch.join(&chosen.name);
        if let Err(e) = self.download(&chosen.browser_download_url, &data_path).await {
            tracing::warn!(error = %e, asset = %chosen.name, "asset download failed");
            return None;
        }

        let sig_path = match sig_asset {
            Some(sig) => {
                let path = scratch.join(&sig.name);
                if let Err(e) = self.download(&sig.browser_download_url, &path).await {
                    tracing::warn!(error = %e, asset = %sig.name, "signature download failed");
                    return None;
                }
                Some(path)
            }
            None => None,
        };

        self.gate_downloaded(data_path, sig_path, pubkey_path, &info.html_url)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedVerifier(bool);

    #[async_trait]
    impl Verifier for FixedVerifier {
        async fn verify(&self, _sig: &Path, _data: &Path, _pubkey: Option<&Path>) -> bool {
            self.0
        }
    }

    fn asset(name: &str) -> ReleaseAsset {
        ReleaseAsset {
            name: name.to_string(),
            browser_download_url: format!("https://example.invalid/{name}"),
        }
    }

    #[test]
    fn selects_first_matching_asset_and_companion_signature() {
        let assets = vec![
            asset("miner-windows.zip"),
            asset("miner-linux.tar.gz"),
            asset("miner-linux.tar.asc"),
        ];
        let (chosen, sig) = select_assets(&assets, "linux");
        assert_eq!(chosen.unwrap().name, "miner-linux.tar.gz");
        assert_eq!(sig.unwrap().name, "miner-linux.tar.asc");
    }

    #[test]
    fn unrelated_signature_is_not_paired() {
        let assets = vec![asset("miner-linux.tar.gz"), asset("checksums.sig")];
        let (chosen, sig) = select_assets(&assets, "linux");
        assert!(chosen.is_some());
        assert!(sig.is_none());
    }

    #[test]
    fn no_match_yields_nothing() {
        let assets = vec![asset("miner-windows.zip")];
        let (chosen, _) = select_assets(&assets, "linux");
        assert!(chosen.is_none());
    }

    #[tokio::test]
    async fn signed_and_verified_asset_is_returned() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("miner");
        let sig = dir.path().join("miner.sig");
        std::fs::write(&data, b"payload").unwrap();
        std::fs::write(&sig, b"signature").unwrap();

        let source = GithubReleases::with_api_base(Arc::new(FixedVerifier(true)), "http://unused");
        let out = source
            .gate_downloaded(data.clone(), Some(sig), None, "")
            .await;
        assert_eq!(out, Some(data));
    }

    #[tokio::test]
    async fn signed_but_failing_asset_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("miner");
        let sig = dir.path().join("miner.sig");
        std::fs::write(&data, b"payload").unwrap();
        std::fs::write(&sig, b"signature").unwrap();

        let source = GithubReleases::with_api_base(Arc::new(FixedVerifier(false)), "http://unused");
        let out = source.gate_downloaded(data, Some(sig), None, "").await;
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn unsigned_asset_is_never_verified() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("miner");
        std::fs::write(&data, b"payload").unwrap();

        // Even with a verifier that would accept anything.
        let source = GithubReleases::with_api_base(Arc::new(FixedVerifier(true)), "http://unused");
        let out = source.gate_downloaded(data, None, None, "").await;
        assert!(out.is_none());
    }
}
