//! Workload definitions and typed command construction.
//!
//! Each supervised workload kind carries its own argument-vector builder,
//! so launch commands are assembled from typed configuration fields rather
//! than interpolated and re-split strings.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The managed workload kinds this agent knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadKind {
    Bitcoin,
    Soulvan,
}

impl WorkloadKind {
    pub const ALL: &'static [WorkloadKind] = &[WorkloadKind::Bitcoin, WorkloadKind::Soulvan];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadKind::Bitcoin => "bitcoin",
            WorkloadKind::Soulvan => "soulvan",
        }
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
#[error("unknown workload kind: {0}")]
pub struct UnknownWorkload(pub String);

impl FromStr for WorkloadKind {
    type Err = UnknownWorkload;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bitcoin" => Ok(WorkloadKind::Bitcoin),
            "soulvan" => Ok(WorkloadKind::Soulvan),
            other => Err(UnknownWorkload(other.to_string())),
        }
    }
}

/// Immutable per-workload configuration: trusted binary, its detached
/// signature, and pool/endpoint parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadSpec {
    /// Path to the trusted worker binary on the host.
    pub binary: PathBuf,
    /// Path to the binary's detached signature. Mandatory for sandboxed
    /// launches; there is no run-unverified fallback.
    pub signature: PathBuf,
    /// Pool endpoint, e.g. `stratum+tcp://pool.example:3333`.
    pub pool: String,
    /// Pool user / wallet address.
    pub user: String,
    /// Extra arguments appended verbatim after the typed ones.
    #[serde(default)]
    pub extra: Vec<String>,
}

impl WorkloadSpec {
    /// Build the launch argument vector for `kind`. Index 0 is the binary
    /// path; the remaining entries are its arguments.
    pub fn argv(&self, kind: WorkloadKind) -> Vec<String> {
        let mut cmd = vec![self.binary.display().to_string()];
        match kind {
            WorkloadKind::Bitcoin => {
                cmd.push("-o".to_string());
                cmd.push(self.pool.clone());
                cmd.push("-u".to_string());
                cmd.push(self.user.clone());
            }
            WorkloadKind::Soulvan => {
                cmd.push("--pool".to_string());
                cmd.push(self.pool.clone());
                cmd.push("--user".to_string());
                cmd.push(self.user.clone());
            }
        }
        cmd.extend(self.extra.iter().cloned());
        cmd
    }
}

/// Configured workloads keyed by kind.
pub type WorkloadSet = HashMap<WorkloadKind, WorkloadSpec>;

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> WorkloadSpec {
        WorkloadSpec {
            binary: PathBuf::from("/opt/bin/miner"),
            signature: PathBuf::from("/opt/bin/miner.sig"),
            pool: "stratum+tcp://pool.example:3333".to_string(),
            user: "wallet".to_string(),
            extra: vec![],
        }
    }

    #[test]
    fn bitcoin_argv_uses_short_flags() {
        let argv = spec().argv(WorkloadKind::Bitcoin);
        assert_eq!(
            argv,
            vec!["/opt/bin/miner", "-o", "stratum+tcp://pool.example:3333", "-u", "wallet"]
        );
    }

    #[test]
    fn soulvan_argv_uses_long_flags() {
        let argv = spec().argv(WorkloadKind::Soulvan);
        assert_eq!(
            argv,
            vec!["/opt/bin/miner", "--pool", "stratum+tcp://pool.example:3333", "--user", "wallet"]
        );
    }

    #[test]
    fn extra_args_are_appended_verbatim() {
        let mut s = spec();
        s.extra = vec!["--threads".to_string(), "4".to_string()];
        let argv = s.argv(WorkloadKind::Soulvan);
        assert_eq!(&argv[argv.len() - 2..], &["--threads".to_string(), "4".to_string()]);
    }

    #[test]
    fn kind_round_trips_through_str() {
        for &kind in WorkloadKind::ALL {
            assert_eq!(kind.as_str().parse::<WorkloadKind>().unwrap(), kind);
        }
        assert!("dogecoin".parse::<WorkloadKind>().is_err());
    }
}
