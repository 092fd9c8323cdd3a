//! Single-slot process supervision.
//!
//! The supervisor owns the one worker process this agent may run at a
//! time. Starting while the slot is occupied is refused, not queued. An
//! observer task follows the worker's stdout for its entire lifetime,
//! feeding the hash-rate table, and ends only when the stream closes.

pub mod hashrate;
pub mod policy;

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::Mutex;

use crate::sandbox::{SandboxError, SandboxLauncher};
use crate::workload::{WorkloadKind, WorkloadSet, WorkloadSpec};
use self::hashrate::{parse_hash_rate, HashrateTable};

/// Supervised-slot lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Idle,
    Starting,
    Running,
    Stopping,
}

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("no workload configured for kind: {0}")]
    UnknownWorkload(WorkloadKind),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Supervisor behavior knobs.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Launch through the hardened sandbox, or directly on the host.
    pub use_sandbox: bool,
    /// How long a graceful stop may take before escalating to a kill.
    pub stop_grace: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self { use_sandbox: true, stop_grace: Duration::from_secs(10) }
    }
}

struct Slot {
    state: SlotState,
    child: Option<Child>,
    workload: Option<WorkloadKind>,
    started_at: Option<DateTime<Utc>>,
}

impl Slot {
    fn clear(&mut self) {
        self.state = SlotState::Idle;
        self.child = None;
        self.workload = None;
        self.started_at = None;
    }
}

/// Point-in-time view of the supervised slot.
#[derive(Debug, Clone, Serialize)]
pub struct SupervisorStatus {
    pub pid: Option<u32>,
    pub workload: Option<WorkloadKind>,
    pub started_at: Option<DateTime<Utc>>,
    pub hash_rates: HashMap<WorkloadKind, f64>,
}

/// Owns the single supervised worker slot.
pub struct ProcessSupervisor {
    slot: Mutex<Slot>,
    hashrate: Arc<HashrateTable>,
    workloads: WorkloadSet,
    launcher: SandboxLauncher,
    config: SupervisorConfig,
}

impl ProcessSupervisor {
    pub fn new(workloads: WorkloadSet, launcher: SandboxLauncher, config: SupervisorConfig) -> Self {
        Self {
            slot: Mutex::new(Slot {
                state: SlotState::Idle,
                child: None,
                workload: None,
                started_at: None,
            }),
            hashrate: Arc::new(HashrateTable::new()),
            workloads,
            launcher,
            config,
        }
    }

    pub fn hashrate(&self) -> &HashrateTable {
        &self.hashrate
    }

    /// Start the given workload. Returns the pid, or `None` when the
    /// slot is already occupied by a live process (refusal, not an
    /// error, and never queued).
    pub async fn start(&self, kind: WorkloadKind) -> Result<Option<u32>, SupervisorError> {
        let mut slot = self.slot.lock().await;
        Self::reap_if_exited(&mut slot);
        if slot.state != SlotState::Idle {
            tracing::warn!(workload = %kind, "a worker is already running; stop it first");
            return Ok(None);
        }

        let spec = self
            .workloads
            .get(&kind)
            .ok_or(SupervisorError::UnknownWorkload(kind))?;

        slot.state = SlotState::Starting;
        match self.launch(kind, spec).await {
            Ok(mut child) => {
                let pid = child.id();
                if let Some(stdout) = child.stdout.take() {
                    spawn_observer(stdout, kind, self.hashrate.clone());
                } else {
                    tracing::warn!(workload = %kind, "worker stdout not captured; no throughput observer");
                }
                slot.child = Some(child);
                slot.workload = Some(kind);
                slot.started_at = Some(Utc::now());
                slot.state = SlotState::Running;
                tracing::info!(workload = %kind, ?pid, "worker started");
                Ok(pid)
            }
            Err(e) => {
                slot.clear();
                Err(e)
            }
        }
    }

    async fn launch(&self, kind: WorkloadKind, spec: &WorkloadSpec) -> Result<Child, SupervisorError> {
        let argv = spec.argv(kind);
        if self.config.use_sandbox {
            let child = self
                .launcher
                .launch(
                    Path::new(&argv[0]),
                    &argv[1..],
                    Some(spec.signature.as_path()),
                    &format!("miner-{kind}"),
                )
                .await?;
            Ok(child)
        } else {
            tracing::info!(cmd = %argv.join(" "), "starting worker directly");
            let child = Command::new(&argv[0])
                .args(&argv[1..])
                .stdout(Stdio::piped())
                .stderr(Stdio::inherit())
                .spawn()?;
            Ok(child)
        }
    }

    /// Stop the supervised process: graceful termination, bounded wait,
    /// forced kill on timeout or wait error. The slot is unconditionally
    /// Idle afterwards. No-op when nothing is running.
    pub async fn stop(&self) {
        let mut slot = self.slot.lock().await;
        let Some(mut child) = slot.child.take() else {
            slot.clear();
            return;
        };
        slot.state = SlotState::Stopping;

        if let Some(pid) = child.id() {
            tracing::info!(pid, "stopping worker");
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                tracing::debug!(error = %e, "SIGTERM delivery failed");
            }
        }

        match tokio::time::timeout(self.config.stop_grace, child.wait()).await {
            Ok(Ok(status)) => tracing::info!(%status, "worker stopped"),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "wait failed; killing worker");
                let _ = child.kill().await;
            }
            Err(_) => {
                tracing::warn!("graceful stop timed out; killing worker");
                let _ = child.kill().await;
            }
        }

        slot.clear();
    }

    /// True when the slot can accept a start. An exited child is reaped
    /// to Idle here.
    pub async fn is_idle(&self) -> bool {
        let mut slot = self.slot.lock().await;
        Self::reap_if_exited(&mut slot);
        slot.state == SlotState::Idle
    }

    pub async fn status(&self) -> SupervisorStatus {
        let mut slot = self.slot.lock().await;
        Self::reap_if_exited(&mut slot);
        SupervisorStatus {
            pid: slot.child.as_ref().and_then(|c| c.id()),
            workload: slot.workload,
            started_at: slot.started_at,
            hash_rates: self.hashrate.snapshot(),
        }
    }

    fn reap_if_exited(slot: &mut Slot) {
        if let Some(child) = slot.child.as_mut() {
            match child.try_wait() {
                Ok(Some(status)) => {
                    tracing::info!(workload = ?slot.workload, %status, "worker exited");
                    slot.clear();
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "could not poll worker; clearing slot");
                    slot.clear();
                }
            }
        }
    }
}

/// Follow the worker's stdout for its entire lifetime, recording every
/// extracted hash rate. Ends when the stream closes; performs no slot
/// transitions itself.
fn spawn_observer(stdout: ChildStdout, kind: WorkloadKind, table: Arc<HashrateTable>) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if let Some(rate) = parse_hash_rate(&line) {
                        table.record(kind, rate);
                        tracing::info!(workload = %kind, rate, "hash rate observed");
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(workload = %kind, error = %e, "worker output read failed");
                    break;
                }
            }
        }
        tracing::info!(workload = %kind, "worker output stream closed");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::SandboxProfile;
    use crate::signing::GpgVerifier;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;

    fn script_workload(dir: &Path, body: &str) -> WorkloadSpec {
        let script = dir.join("worker.sh");
        fs::write(&script, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        WorkloadSpec {
            binary: script,
            signature: PathBuf::from("/unused.sig"),
            pool: "stratum+tcp://pool:3333".to_string(),
            user: "wallet".to_string(),
            extra: vec![],
        }
    }

    fn direct_supervisor(spec: WorkloadSpec) -> ProcessSupervisor {
        let mut workloads = WorkloadSet::new();
        workloads.insert(WorkloadKind::Soulvan, spec);
        ProcessSupervisor::new(
            workloads,
            SandboxLauncher::new(SandboxProfile::default(), Arc::new(GpgVerifier)),
            SupervisorConfig { use_sandbox: false, stop_grace: Duration::from_secs(2) },
        )
    }

    #[tokio::test]
    async fn start_is_refused_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let sup = direct_supervisor(script_workload(dir.path(), "sleep 30"));

        let pid = sup.start(WorkloadKind::Soulvan).await.unwrap();
        assert!(pid.is_some());
        assert!(!sup.is_idle().await);

        // Slot occupied: second start refused, not queued.
        let second = sup.start(WorkloadKind::Soulvan).await.unwrap();
        assert!(second.is_none());

        sup.stop().await;
        assert!(sup.is_idle().await);
    }

    #[tokio::test]
    async fn stop_on_idle_slot_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let sup = direct_supervisor(script_workload(dir.path(), "sleep 30"));
        sup.stop().await;
        assert!(sup.is_idle().await);
    }

    #[tokio::test]
    async fn unknown_workload_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let sup = direct_supervisor(script_workload(dir.path(), "sleep 30"));
        let err = sup.start(WorkloadKind::Bitcoin).await.unwrap_err();
        assert!(matches!(err, SupervisorError::UnknownWorkload(WorkloadKind::Bitcoin)));
    }

    #[tokio::test]
    async fn observer_records_hash_rates_until_stream_closes() {
        let dir = tempfile::tempdir().unwrap();
        let sup = direct_supervisor(script_workload(
            dir.path(),
            "echo 'hashrate 12.5 KH/s'; sleep 30",
        ));

        sup.start(WorkloadKind::Soulvan).await.unwrap();
        let mut observed = 0.0;
        for _ in 0..40 {
            observed = sup.hashrate().get(WorkloadKind::Soulvan);
            if observed > 0.0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(observed, 12_500.0);

        sup.stop().await;
        // Sample persists after process restart boundaries.
        assert_eq!(sup.hashrate().get(WorkloadKind::Soulvan), 12_500.0);
    }

    #[tokio::test]
    async fn exited_worker_is_reaped_to_idle() {
        let dir = tempfile::tempdir().unwrap();
        let sup = direct_supervisor(script_workload(dir.path(), "exit 0"));

        sup.start(WorkloadKind::Soulvan).await.unwrap();
        let mut idle = false;
        for _ in 0..40 {
            idle = sup.is_idle().await;
            if idle {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(idle, "exited worker should clear the slot");
    }
}
