//! Hash-rate extraction from worker output and the last-known-rate table.

use std::collections::HashMap;
use std::sync::OnceLock;

use parking_lot::RwLock;
use regex::Regex;

use crate::workload::WorkloadKind;

/// Extract a hash rate in H/s from one line of worker output.
///
/// Matches a number followed by one of the recognized rate units
/// (case-insensitive) and normalizes with the unit's power-of-ten
/// multiplier. Lines without a recognized unit yield `None`.
pub fn parse_hash_rate(line: &str) -> Option<f64> {
    static RATE_RE: OnceLock<Regex> = OnceLock::new();
    let re = RATE_RE.get_or_init(|| {
        Regex::new(r"(?i)([0-9.]+)\s*(H/s|KH/s|MH/s|GH/s|TH/s)").expect("rate pattern is valid")
    });

    let caps = re.captures(line)?;
    let value: f64 = caps[1].parse().ok()?;
    let multiplier = match caps[2].to_ascii_lowercase().as_str() {
        "h/s" => 1.0,
        "kh/s" => 1e3,
        "mh/s" => 1e6,
        "gh/s" => 1e9,
        "th/s" => 1e12,
        _ => return None,
    };
    Some(value * multiplier)
}

/// Last observed hash rate per workload.
///
/// Written only by the observer of the currently supervised process;
/// values persist until overwritten. Read by the policy engine and the
/// status surface.
#[derive(Debug, Default)]
pub struct HashrateTable {
    rates: RwLock<HashMap<WorkloadKind, f64>>,
}

impl HashrateTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, kind: WorkloadKind, rate: f64) {
        self.rates.write().insert(kind, rate);
    }

    /// Last-known rate for `kind`, 0.0 when never observed.
    pub fn get(&self, kind: WorkloadKind) -> f64 {
        self.rates.read().get(&kind).copied().unwrap_or(0.0)
    }

    pub fn snapshot(&self) -> HashMap<WorkloadKind, f64> {
        self.rates.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognized_units_scale_by_powers_of_ten() {
        assert_eq!(parse_hash_rate("speed 12 H/s"), Some(12.0));
        assert_eq!(parse_hash_rate("speed 12.5 KH/s"), Some(12_500.0));
        assert_eq!(parse_hash_rate("speed 3 MH/s"), Some(3e6));
        assert_eq!(parse_hash_rate("speed 2 GH/s"), Some(2e9));
        assert_eq!(parse_hash_rate("speed 1.5 TH/s"), Some(1.5e12));
    }

    #[test]
    fn unit_matching_is_case_insensitive() {
        assert_eq!(parse_hash_rate("hashrate: 7.25 mh/s"), Some(7_250_000.0));
        assert_eq!(parse_hash_rate("hashrate: 7 Gh/S"), Some(7e9));
    }

    #[test]
    fn lines_without_a_rate_yield_nothing() {
        assert_eq!(parse_hash_rate("connected to pool"), None);
        assert_eq!(parse_hash_rate("worker up, 42 shares"), None);
        assert_eq!(parse_hash_rate(""), None);
    }

    #[test]
    fn table_overwrites_and_defaults_to_zero() {
        let table = HashrateTable::new();
        assert_eq!(table.get(WorkloadKind::Bitcoin), 0.0);
        table.record(WorkloadKind::Bitcoin, 5.0);
        table.record(WorkloadKind::Bitcoin, 9.0);
        assert_eq!(table.get(WorkloadKind::Bitcoin), 9.0);
        assert_eq!(table.snapshot().len(), 1);
    }
}
