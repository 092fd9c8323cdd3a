//! Workload selection policy and the idle-slot control loop.

use std::sync::Arc;
use std::time::Duration;

use super::hashrate::HashrateTable;
use super::ProcessSupervisor;
use crate::workload::WorkloadKind;

/// Pick the workload to (re)start from `prefer`, highest last-known hash
/// rate first. When the best score is exactly zero (nothing observed
/// yet), the first preference wins so cold starts are deterministic.
pub fn decide(prefer: &[WorkloadKind], table: &HashrateTable) -> Option<WorkloadKind> {
    let first = *prefer.first()?;
    let mut best = first;
    for &kind in prefer {
        if table.get(kind) > table.get(best) {
            best = kind;
        }
    }
    if table.get(best) == 0.0 {
        Some(first)
    } else {
        Some(best)
    }
}

/// Re-evaluate the policy at a fixed interval whenever the supervised
/// slot is idle. A running process is never preempted. Runs until the
/// task is dropped.
pub async fn policy_loop(
    supervisor: Arc<ProcessSupervisor>,
    prefer: Vec<WorkloadKind>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if !supervisor.is_idle().await {
            continue;
        }
        let Some(kind) = decide(&prefer, supervisor.hashrate()) else {
            continue;
        };
        match supervisor.start(kind).await {
            Ok(Some(pid)) => tracing::info!(workload = %kind, pid, "policy started workload"),
            Ok(None) => {}
            Err(e) => tracing::error!(workload = %kind, error = %e, "policy start failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use WorkloadKind::{Bitcoin, Soulvan};

    #[test]
    fn all_zero_samples_pick_the_first_preference() {
        let table = HashrateTable::new();
        assert_eq!(decide(&[Bitcoin, Soulvan], &table), Some(Bitcoin));
        assert_eq!(decide(&[Soulvan, Bitcoin], &table), Some(Soulvan));
    }

    #[test]
    fn highest_sample_wins() {
        let table = HashrateTable::new();
        table.record(Bitcoin, 5.0);
        table.record(Soulvan, 9.0);
        assert_eq!(decide(&[Bitcoin, Soulvan], &table), Some(Soulvan));
    }

    #[test]
    fn empty_preference_order_decides_nothing() {
        let table = HashrateTable::new();
        assert_eq!(decide(&[], &table), None);
    }
}
