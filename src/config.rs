//! Agent configuration: TOML file plus `WARDEN_*` environment overrides.
//!
//! The file is optional; a missing file yields the built-in defaults.
//! Environment overrides are applied after the file and win. Invalid
//! override values fall back to the file/default value without crashing.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `WARDEN_CONFIG` | `warden.toml` | Config file path |
//! | `WARDEN_USE_SANDBOX` | true | Launch workers in the hardened sandbox |
//! | `WARDEN_AUTO_REPLACE` | false | Install verified updates without confirmation |
//! | `WARDEN_REQUIRE_CONFIRMATION` | true | Stage installs behind a confirmation token |
//! | `WARDEN_POLICY_INTERVAL` | 10 | Policy re-evaluation interval (secs) |
//! | `WARDEN_STOP_GRACE` | 10 | Graceful worker stop budget (secs) |
//! | `WARDEN_UPDATE_OWNER` | — | GitHub owner for the update channel |
//! | `WARDEN_UPDATE_REPO` | — | GitHub repo for the update channel |
//! | `WARDEN_PUBKEY` | — | Trusted signing public key path |
//! | `WARDEN_VERSION` | crate version | Version string used for update comparison |

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sandbox::SandboxProfile;
use crate::supervisor::SupervisorConfig;
use crate::update::UpdatePolicy;
use crate::workload::{WorkloadKind, WorkloadSet};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },

    #[error("failed to parse config file {path}: {source}")]
    Parse { path: PathBuf, source: toml::de::Error },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Workload selection policy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PolicyConfig {
    /// Preference order; also the cold-start order.
    pub prefer: Vec<WorkloadKind>,
    /// Seconds between idle-slot re-evaluations.
    pub interval_secs: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self { prefer: vec![WorkloadKind::Soulvan, WorkloadKind::Bitcoin], interval_secs: 10 }
    }
}

impl PolicyConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

/// Security posture: sandboxing and update gating.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SecureConfig {
    pub use_sandbox: bool,
    pub auto_replace: bool,
    pub require_confirmation: bool,
    /// Graceful worker stop budget in seconds.
    pub stop_grace_secs: u64,
    /// Trusted signing public key imported before each verification.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pubkey_path: Option<PathBuf>,
    pub sandbox: SandboxProfile,
}

impl Default for SecureConfig {
    fn default() -> Self {
        Self {
            use_sandbox: true,
            auto_replace: false,
            require_confirmation: true,
            stop_grace_secs: 10,
            pubkey_path: None,
            sandbox: SandboxProfile::default(),
        }
    }
}

/// Where to look for agent updates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UpdateChannel {
    pub owner: String,
    pub repo: String,
    /// Substring that selects the release asset to fetch.
    pub asset_contains: String,
    /// Where a confirmed update is installed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub install_path: Option<PathBuf>,
}

impl UpdateChannel {
    /// True when both coordinates are set and update checks can run.
    pub fn is_configured(&self) -> bool {
        !self.owner.is_empty() && !self.repo.is_empty()
    }
}

/// Complete agent configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    pub workload: WorkloadSet,
    pub policy: PolicyConfig,
    pub secure: SecureConfig,
    pub update: UpdateChannel,
}

/// Parse a boolean env var, returning `default` on missing or invalid.
fn parse_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => match val.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

/// Parse a `u64` env var, returning `default` on missing or invalid.
fn parse_u64(key: &str, default: u64) -> u64 {
    match std::env::var(key) {
        Ok(val) => val.parse::<u64>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Version string used when comparing against release tags.
pub fn current_version() -> String {
    std::env::var("WARDEN_VERSION").unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string())
}

impl AgentConfig {
    /// Load from `WARDEN_CONFIG` (default `warden.toml`), then apply
    /// environment overrides. A missing file is not an error.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("WARDEN_CONFIG").unwrap_or_else(|_| "warden.toml".to_string());
        Self::load_from(Path::new(&path))
    }

    /// Load from an explicit path, then apply environment overrides.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
            toml::from_str::<AgentConfig>(&raw)
                .map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })?
        } else {
            tracing::info!(path = %path.display(), "no config file; using defaults");
            AgentConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        self.secure.use_sandbox = parse_bool("WARDEN_USE_SANDBOX", self.secure.use_sandbox);
        self.secure.auto_replace = parse_bool("WARDEN_AUTO_REPLACE", self.secure.auto_replace);
        self.secure.require_confirmation =
            parse_bool("WARDEN_REQUIRE_CONFIRMATION", self.secure.require_confirmation);
        self.secure.stop_grace_secs = parse_u64("WARDEN_STOP_GRACE", self.secure.stop_grace_secs);
        self.policy.interval_secs = parse_u64("WARDEN_POLICY_INTERVAL", self.policy.interval_secs);
        if let Ok(owner) = std::env::var("WARDEN_UPDATE_OWNER") {
            self.update.owner = owner;
        }
        if let Ok(repo) = std::env::var("WARDEN_UPDATE_REPO") {
            self.update.repo = repo;
        }
        if let Ok(pubkey) = std::env::var("WARDEN_PUBKEY") {
            self.secure.pubkey_path = Some(PathBuf::from(pubkey));
        }
    }

    /// Reject configurations that cannot work at runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (kind, spec) in &self.workload {
            if spec.binary.as_os_str().is_empty() {
                return Err(ConfigError::Invalid(format!("workload {kind}: empty binary path")));
            }
            if spec.pool.is_empty() {
                return Err(ConfigError::Invalid(format!("workload {kind}: empty pool endpoint")));
            }
            if spec.user.is_empty() {
                return Err(ConfigError::Invalid(format!("workload {kind}: empty pool user")));
            }
        }
        if !self.workload.is_empty() {
            for kind in &self.policy.prefer {
                if !self.workload.contains_key(kind) {
                    return Err(ConfigError::Invalid(format!(
                        "policy prefers {kind} but no such workload is configured"
                    )));
                }
            }
        }
        if self.update.is_configured() && self.update.asset_contains.is_empty() {
            return Err(ConfigError::Invalid(
                "update channel is configured but asset_contains is empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            use_sandbox: self.secure.use_sandbox,
            stop_grace: Duration::from_secs(self.secure.stop_grace_secs.max(1)),
        }
    }

    pub fn update_policy(&self) -> UpdatePolicy {
        UpdatePolicy {
            auto_replace: self.secure.auto_replace,
            require_confirmation: self.secure.require_confirmation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Serialize env-mutating tests to avoid cross-test pollution.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const ENV_KEYS: &[&str] = &[
        "WARDEN_CONFIG",
        "WARDEN_USE_SANDBOX",
        "WARDEN_AUTO_REPLACE",
        "WARDEN_REQUIRE_CONFIRMATION",
        "WARDEN_POLICY_INTERVAL",
        "WARDEN_STOP_GRACE",
        "WARDEN_UPDATE_OWNER",
        "WARDEN_UPDATE_REPO",
        "WARDEN_PUBKEY",
        "WARDEN_VERSION",
    ];

    fn clear_env_vars() {
        for k in ENV_KEYS {
            std::env::remove_var(k);
        }
    }

    #[test]
    fn defaults_are_safe() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        let cfg = AgentConfig::load_from(Path::new("/nonexistent/warden.toml")).unwrap();
        assert!(cfg.secure.use_sandbox);
        assert!(!cfg.secure.auto_replace);
        assert!(cfg.secure.require_confirmation);
        assert_eq!(cfg.policy.interval_secs, 10);
        assert_eq!(cfg.policy.prefer, vec![WorkloadKind::Soulvan, WorkloadKind::Bitcoin]);
        assert!(!cfg.update.is_configured());
    }

    #[test]
    fn toml_file_is_loaded() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warden.toml");
        std::fs::write(
            &path,
            r#"
[workload.bitcoin]
binary = "/opt/miners/bitcoin"
signature = "/opt/miners/bitcoin.asc"
pool = "stratum+tcp://pool.example:3333"
user = "wallet.rig0"

[policy]
prefer = ["bitcoin"]
interval_secs = 5

[secure]
use_sandbox = false

[update]
owner = "example"
repo = "agent"
asset_contains = "warden"
"#,
        )
        .unwrap();

        let cfg = AgentConfig::load_from(&path).unwrap();
        assert_eq!(cfg.workload.len(), 1);
        assert_eq!(cfg.workload[&WorkloadKind::Bitcoin].user, "wallet.rig0");
        assert_eq!(cfg.policy.prefer, vec![WorkloadKind::Bitcoin]);
        assert_eq!(cfg.policy.interval_secs, 5);
        assert!(!cfg.secure.use_sandbox);
        assert!(cfg.update.is_configured());
    }

    #[test]
    fn env_overrides_win_over_file() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("WARDEN_USE_SANDBOX", "false");
        std::env::set_var("WARDEN_AUTO_REPLACE", "true");
        std::env::set_var("WARDEN_POLICY_INTERVAL", "30");
        let cfg = AgentConfig::load_from(Path::new("/nonexistent/warden.toml")).unwrap();
        assert!(!cfg.secure.use_sandbox);
        assert!(cfg.secure.auto_replace);
        assert_eq!(cfg.policy.interval_secs, 30);
        clear_env_vars();
    }

    #[test]
    fn invalid_env_values_fall_back() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("WARDEN_USE_SANDBOX", "maybe");
        std::env::set_var("WARDEN_POLICY_INTERVAL", "soon");
        let cfg = AgentConfig::load_from(Path::new("/nonexistent/warden.toml")).unwrap();
        assert!(cfg.secure.use_sandbox);
        assert_eq!(cfg.policy.interval_secs, 10);
        clear_env_vars();
    }

    #[test]
    fn preference_for_unconfigured_workload_is_rejected() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        let mut cfg = AgentConfig::default();
        cfg.workload.insert(
            WorkloadKind::Soulvan,
            crate::workload::WorkloadSpec {
                binary: PathBuf::from("/opt/miners/soulvan"),
                signature: PathBuf::from("/opt/miners/soulvan.asc"),
                pool: "stratum+tcp://pool.example:3333".to_string(),
                user: "wallet".to_string(),
                extra: vec![],
            },
        );
        cfg.policy.prefer = vec![WorkloadKind::Bitcoin];
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn interval_has_a_one_second_floor() {
        let cfg = PolicyConfig { prefer: vec![], interval_secs: 0 };
        assert_eq!(cfg.interval(), Duration::from_secs(1));
    }
}
