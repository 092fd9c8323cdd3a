//! Hardened container sandbox for worker binaries.
//!
//! Turns a trusted binary path into a locked-down `docker run` invocation:
//! all capabilities dropped, no-new-privileges, read-only root with a
//! size-capped tmpfs, explicit PID/CPU/memory ceilings, an unprivileged
//! uid/gid, and read-only bind mounts only. Every precondition is checked
//! before anything is spawned; a violation is a typed refusal, never a
//! downgraded launch.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::{Child, Command};

use crate::signing::Verifier;

/// Fixed path the worker binary is bind-mounted to inside the sandbox.
pub const WORKER_MOUNT_PATH: &str = "/opt/worker";

/// Certificate store every sandbox gets read-only.
const BASE_CERT_MOUNT: &str = "/etc/ssl/certs:/etc/ssl/certs:ro";

const DEFAULT_IMAGE: &str = "debian:bookworm-slim";
const TMPFS_SPEC: &str = "/tmp:rw,size=100m";
const SANDBOX_USER: &str = "65534:65534";

/// Resource and security constraints for the sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SandboxProfile {
    /// Container image the worker runs in.
    #[serde(default = "default_image")]
    pub image: String,
    /// CPU share handed to the container.
    #[serde(default = "default_cpus")]
    pub cpus: f64,
    /// Memory ceiling in megabytes.
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,
    /// Process-count ceiling.
    #[serde(default = "default_pids_limit")]
    pub pids_limit: u32,
    /// Additional read-only mounts, `host:container:ro`.
    #[serde(default)]
    pub extra_mounts: Vec<String>,
    /// Optional seccomp profile applied to the container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seccomp_path: Option<PathBuf>,
    /// Detached signature for the seccomp profile; verified before use
    /// when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seccomp_sig_path: Option<PathBuf>,
    /// Optional AppArmor profile name, which must already be installed
    /// under `/etc/apparmor.d/` on the host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apparmor_profile: Option<String>,
    /// Public key used to verify worker binaries and seccomp profiles.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pubkey_path: Option<PathBuf>,
}

fn default_image() -> String {
    DEFAULT_IMAGE.to_string()
}
fn default_cpus() -> f64 {
    0.5
}
fn default_memory_mb() -> u64 {
    512
}
fn default_pids_limit() -> u32 {
    200
}

impl Default for SandboxProfile {
    fn default() -> Self {
        Self {
            image: default_image(),
            cpus: default_cpus(),
            memory_mb: default_memory_mb(),
            pids_limit: default_pids_limit(),
            extra_mounts: Vec::new(),
            seccomp_path: None,
            seccomp_sig_path: None,
            apparmor_profile: None,
            pubkey_path: None,
        }
    }
}

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("docker not reachable; install or start Docker to use the sandbox runner")]
    DockerUnavailable,

    #[error("binary not found: {0}")]
    BinaryNotFound(PathBuf),

    #[error("binary is not a regular file: {0}")]
    NotRegularFile(PathBuf),

    #[error("binary permissions must be 0755 (found {found:04o}): {path}")]
    BadBinaryMode { path: PathBuf, found: u32 },

    #[error("signature required: refusing to run unverified binary {0}")]
    SignatureRequired(PathBuf),

    #[error("signature verification failed for {0}")]
    VerificationFailed(PathBuf),

    #[error("mount mode must be explicit and read-only (add ':ro'): {0}")]
    MountModeMissing(String),

    #[error("writable mount mode not allowed: {0}")]
    MountNotReadOnly(String),

    #[error("mount host path does not exist: {0}")]
    MountHostMissing(PathBuf),

    #[error("mount host path must not be writable: {0}")]
    MountHostWritable(PathBuf),

    #[error("seccomp profile not found: {0}")]
    SeccompMissing(PathBuf),

    #[error("seccomp signature not found: {0}")]
    SeccompSignatureMissing(PathBuf),

    #[error("seccomp profile signature verification failed: {0}")]
    SeccompUnverified(PathBuf),

    #[error("AppArmor profile not found on host: {0}")]
    ApparmorMissing(String),

    #[error("failed to spawn sandbox container: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Check that the docker engine answers on this host.
pub async fn ensure_docker_available() -> Result<(), SandboxError> {
    let probe = Command::new("docker")
        .arg("version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    match probe {
        Ok(status) if status.success() => Ok(()),
        _ => Err(SandboxError::DockerUnavailable),
    }
}

/// Require an existing regular file with permission bits exactly 0755.
/// A wrong mode is rejected, never auto-corrected.
pub fn check_binary(path: &Path) -> Result<(), SandboxError> {
    let meta = std::fs::metadata(path).map_err(|_| SandboxError::BinaryNotFound(path.to_path_buf()))?;
    if !meta.is_file() {
        return Err(SandboxError::NotRegularFile(path.to_path_buf()));
    }
    let mode = meta.permissions().mode() & 0o7777;
    if mode != 0o755 {
        return Err(SandboxError::BadBinaryMode { path: path.to_path_buf(), found: mode });
    }
    Ok(())
}

/// Validate every bind-mount spec: an explicit `:ro` third segment, an
/// existing host path, and no write bit (owner, group, or other) on the
/// host side. Anything else is a refusal, not a fallback.
pub fn validate_mounts(mounts: &[String]) -> Result<(), SandboxError> {
    for spec in mounts {
        let parts: Vec<&str> = spec.split(':').collect();
        let host = Path::new(parts[0]);
        match parts.get(2) {
            None => return Err(SandboxError::MountModeMissing(spec.clone())),
            Some(&"ro") => {}
            Some(_) => return Err(SandboxError::MountNotReadOnly(spec.clone())),
        }
        let meta = std::fs::metadata(host)
            .map_err(|_| SandboxError::MountHostMissing(host.to_path_buf()))?;
        if meta.permissions().mode() & 0o222 != 0 {
            return Err(SandboxError::MountHostWritable(host.to_path_buf()));
        }
    }
    Ok(())
}

/// Assembles and launches hardened worker containers.
pub struct SandboxLauncher {
    profile: SandboxProfile,
    verifier: Arc<dyn Verifier>,
}

impl SandboxLauncher {
    pub fn new(profile: SandboxProfile, verifier: Arc<dyn Verifier>) -> Self {
        Self { profile, verifier }
    }

    pub fn profile(&self) -> &SandboxProfile {
        &self.profile
    }

    /// Launch `binary_path` with `args` inside the sandbox.
    ///
    /// Preconditions, in order, each a hard failure with no process
    /// spawned: docker reachable; binary a regular 0755 file; signature
    /// path present; signature verifies. Then every mount is validated
    /// and optional seccomp/AppArmor profiles are gated before the
    /// invocation is assembled, logged, and spawned with piped stdout.
    pub async fn launch(
        &self,
        binary_path: &Path,
        args: &[String],
        sig_path: Option<&Path>,
        container_name: &str,
    ) -> Result<Child, SandboxError> {
        ensure_docker_available().await?;
        let invocation = self
            .preflight(binary_path, args, sig_path, container_name)
            .await?;

        tracing::info!(cmd = %invocation.join(" "), "running hardened container");
        let child = Command::new(&invocation[0])
            .args(&invocation[1..])
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;
        Ok(child)
    }

    /// Everything `launch` checks and builds short of the docker probe
    /// and the spawn itself. Returns the full argument vector.
    pub async fn preflight(
        &self,
        binary_path: &Path,
        args: &[String],
        sig_path: Option<&Path>,
        container_name: &str,
    ) -> Result<Vec<String>, SandboxError> {
        check_binary(binary_path)?;

        let sig = sig_path.ok_or_else(|| SandboxError::SignatureRequired(binary_path.to_path_buf()))?;
        if !self
            .verifier
            .verify(sig, binary_path, self.profile.pubkey_path.as_deref())
            .await
        {
            return Err(SandboxError::VerificationFailed(binary_path.to_path_buf()));
        }
        tracing::info!(binary = %binary_path.display(), "binary signature verified");

        let abs_binary = binary_path
            .canonicalize()
            .map_err(|_| SandboxError::BinaryNotFound(binary_path.to_path_buf()))?;

        // The binary mount is pinned read-only by construction; the cert
        // store and any profile-supplied mounts are validated host-side.
        let mut validated = vec![BASE_CERT_MOUNT.to_string()];
        validated.extend(self.profile.extra_mounts.iter().cloned());
        validate_mounts(&validated)?;

        let mut mounts = vec![format!("{}:{}:ro", abs_binary.display(), WORKER_MOUNT_PATH)];
        mounts.extend(validated);

        self.assemble_invocation(args, container_name, &mounts).await
    }

    /// Build the full `docker run` argument vector. Verifies the seccomp
    /// profile's signature (when configured) and requires any named
    /// AppArmor profile to exist on the host.
    async fn assemble_invocation(
        &self,
        args: &[String],
        container_name: &str,
        mounts: &[String],
    ) -> Result<Vec<String>, SandboxError> {
        let mut cmd = vec![
            "docker".to_string(),
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            container_name.to_string(),
            "--cap-drop=ALL".to_string(),
            "--security-opt".to_string(),
            "no-new-privileges".to_string(),
            "--read-only".to_string(),
            "--pids-limit".to_string(),
            self.profile.pids_limit.to_string(),
            "--memory".to_string(),
            format!("{}m", self.profile.memory_mb),
            "--cpus".to_string(),
            self.profile.cpus.to_string(),
            "--tmpfs".to_string(),
            TMPFS_SPEC.to_string(),
        ];

        if let Some(seccomp) = &self.profile.seccomp_path {
            if !seccomp.exists() {
                return Err(SandboxError::SeccompMissing(seccomp.clone()));
            }
            if let Some(seccomp_sig) = &self.profile.seccomp_sig_path {
                if !seccomp_sig.exists() {
                    return Err(SandboxError::SeccompSignatureMissing(seccomp_sig.clone()));
                }
                if !self
                    .verifier
                    .verify(seccomp_sig, seccomp, self.profile.pubkey_path.as_deref())
                    .await
                {
                    return Err(SandboxError::SeccompUnverified(seccomp.clone()));
                }
            }
            cmd.push("--security-opt".to_string());
            cmd.push(format!("seccomp={}", seccomp.display()));
        }

        if let Some(profile_name) = &self.profile.apparmor_profile {
            let profile_path = Path::new("/etc/apparmor.d").join(profile_name);
            if !profile_path.exists() {
                return Err(SandboxError::ApparmorMissing(profile_name.clone()));
            }
            cmd.push("--security-opt".to_string());
            cmd.push(format!("apparmor={profile_name}"));
        }

        for mount in mounts {
            cmd.push("-v".to_string());
            cmd.push(mount.clone());
        }

        cmd.push("--user".to_string());
        cmd.push(SANDBOX_USER.to_string());

        cmd.push(self.profile.image.clone());
        cmd.push(WORKER_MOUNT_PATH.to_string());
        cmd.extend(args.iter().cloned());

        Ok(cmd)
    }
}
