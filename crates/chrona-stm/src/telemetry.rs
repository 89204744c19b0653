//! Commit telemetry and hotspot aggregation
//!
//! `Telemetry` is owned by one runtime. Counters are plain atomics; the
//! per-variable table sits behind a mutex touched once per commit.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrona_core::VarId;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

/// Default number of hotspots in a report
pub const DEFAULT_TOP_N: usize = 5;

/// Per-variable contention counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct VarStats {
    /// Commits that wrote the variable
    pub commits: u64,
    /// Validation failures attributed to the variable
    pub validation_failures: u64,
    /// Lock-hold time summed over commits that wrote the variable
    pub lock_hold_total_us: u64,
}

impl VarStats {
    /// Share of attempts on this variable that failed validation
    pub fn abort_rate(&self) -> f64 {
        let attempts = self.commits + self.validation_failures;
        if attempts == 0 {
            0.0
        } else {
            self.validation_failures as f64 / attempts as f64
        }
    }

    pub fn avg_lock_hold_us(&self) -> f64 {
        if self.commits == 0 {
            0.0
        } else {
            self.lock_hold_total_us as f64 / self.commits as f64
        }
    }

    /// Attempts observed for the variable
    pub fn samples(&self) -> u64 {
        self.commits + self.validation_failures
    }
}

/// One row of the hotspot table
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Hotspot {
    pub var: VarId,
    pub validation_failures: u64,
    pub commits: u64,
    pub abort_rate: f64,
    pub avg_lock_hold_us: f64,
}

/// Point-in-time copy of every counter
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct TelemetrySnapshot {
    pub commits: u64,
    pub read_only_commits: u64,
    pub retries: u64,
    pub aborts: u64,
    pub validation_failures: u64,
    pub writes_applied: u64,
    pub lock_hold_total_us: u64,
    pub lock_hold_max_us: u64,
    pub hotspots: Vec<Hotspot>,
}

impl fmt::Display for TelemetrySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Transaction Telemetry ===")?;
        writeln!(f, "commits:             {}", self.commits)?;
        writeln!(f, "read-only commits:   {}", self.read_only_commits)?;
        writeln!(f, "retries:             {}", self.retries)?;
        writeln!(f, "aborts:              {}", self.aborts)?;
        writeln!(f, "validation failures: {}", self.validation_failures)?;
        writeln!(f, "writes applied:      {}", self.writes_applied)?;
        writeln!(f, "lock hold total:     {}us", self.lock_hold_total_us)?;
        writeln!(f, "lock hold max:       {}us", self.lock_hold_max_us)?;
        writeln!(f, "hotspots:")?;
        if self.hotspots.is_empty() {
            writeln!(f, "  (none)")?;
        }
        for spot in &self.hotspots {
            writeln!(
                f,
                "  {} failures={} commits={} abort_rate={:.2} avg_lock_hold={:.1}us",
                spot.var, spot.validation_failures, spot.commits, spot.abort_rate, spot.avg_lock_hold_us
            )?;
        }
        Ok(())
    }
}

/// Commit / retry / abort counters of one runtime
#[derive(Debug)]
pub struct Telemetry {
    commits: AtomicU64,
    read_only_commits: AtomicU64,
    retries: AtomicU64,
    aborts: AtomicU64,
    validation_failures: AtomicU64,
    writes_applied: AtomicU64,
    lock_hold_total_us: AtomicU64,
    lock_hold_max_us: AtomicU64,
    per_var: Mutex<HashMap<VarId, VarStats>>,
    top_n: usize,
}

impl Telemetry {
    pub fn new(top_n: usize) -> Self {
        Telemetry {
            commits: AtomicU64::new(0),
            read_only_commits: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            aborts: AtomicU64::new(0),
            validation_failures: AtomicU64::new(0),
            writes_applied: AtomicU64::new(0),
            lock_hold_total_us: AtomicU64::new(0),
            lock_hold_max_us: AtomicU64::new(0),
            per_var: Mutex::new(HashMap::new()),
            top_n,
        }
    }

    /// Record a successful commit. `written` is empty on the read-only path.
    pub fn record_commit(&self, written: &[VarId], lock_hold: Duration) {
        self.commits.fetch_add(1, Ordering::Relaxed);
        if written.is_empty() {
            self.read_only_commits.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let hold_us = lock_hold.as_micros() as u64;
        self.writes_applied
            .fetch_add(written.len() as u64, Ordering::Relaxed);
        self.lock_hold_total_us.fetch_add(hold_us, Ordering::Relaxed);
        self.lock_hold_max_us.fetch_max(hold_us, Ordering::Relaxed);

        let mut per_var = self.per_var.lock();
        for var in written {
            let stats = per_var.entry(*var).or_default();
            stats.commits += 1;
            stats.lock_hold_total_us += hold_us;
        }
    }

    pub fn record_validation_failure(&self, var: VarId) {
        self.validation_failures.fetch_add(1, Ordering::Relaxed);
        self.per_var.lock().entry(var).or_default().validation_failures += 1;
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_abort(&self) {
        self.aborts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    pub fn aborts(&self) -> u64 {
        self.aborts.load(Ordering::Relaxed)
    }

    /// Counters of one variable
    pub fn var_stats(&self, var: VarId) -> VarStats {
        self.per_var.lock().get(&var).copied().unwrap_or_default()
    }

    /// Every tracked variable with its counters
    pub fn all_var_stats(&self) -> Vec<(VarId, VarStats)> {
        let mut all: Vec<_> = self.per_var.lock().iter().map(|(k, v)| (*k, *v)).collect();
        all.sort_by_key(|(var, _)| *var);
        all
    }

    /// The `n` most contended variables, most failures first
    pub fn hotspots(&self, n: usize) -> Vec<Hotspot> {
        let mut all = self.all_var_stats();
        all.retain(|(_, stats)| stats.validation_failures > 0);
        all.sort_by(|(a_var, a), (b_var, b)| {
            b.validation_failures
                .cmp(&a.validation_failures)
                .then(a_var.cmp(b_var))
        });
        all.into_iter()
            .take(n)
            .map(|(var, stats)| Hotspot {
                var,
                validation_failures: stats.validation_failures,
                commits: stats.commits,
                abort_rate: stats.abort_rate(),
                avg_lock_hold_us: stats.avg_lock_hold_us(),
            })
            .collect()
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            commits: self.commits.load(Ordering::Relaxed),
            read_only_commits: self.read_only_commits.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            aborts: self.aborts.load(Ordering::Relaxed),
            validation_failures: self.validation_failures.load(Ordering::Relaxed),
            writes_applied: self.writes_applied.load(Ordering::Relaxed),
            lock_hold_total_us: self.lock_hold_total_us.load(Ordering::Relaxed),
            lock_hold_max_us: self.lock_hold_max_us.load(Ordering::Relaxed),
            hotspots: self.hotspots(self.top_n),
        }
    }

    /// Text report of the current counters
    pub fn report(&self) -> String {
        self.snapshot().to_string()
    }

    pub fn reset(&self) {
        for counter in [
            &self.commits,
            &self.read_only_commits,
            &self.retries,
            &self.aborts,
            &self.validation_failures,
            &self.writes_applied,
            &self.lock_hold_total_us,
            &self.lock_hold_max_us,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.per_var.lock().clear();
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new(DEFAULT_TOP_N)
    }
}

/// Policy deciding when a contended variable needs mitigation. The core only
/// signals; enforcement belongs to the strategy.
pub trait MitigationStrategy: Send + Sync {
    fn name(&self) -> &str;

    fn should_mitigate(&self, var: VarId, stats: &VarStats) -> bool;

    fn apply_mitigation(&self, var: VarId);
}

/// Marks variables for single-writer handling once they abort too often
#[derive(Debug)]
pub struct PromoteToSingleWriter {
    /// Minimum attempts before a variable is judged
    pub min_samples: u64,
    /// Abort rate at or above which the variable is promoted
    pub abort_rate_threshold: f64,
    promoted: Mutex<BTreeSet<VarId>>,
}

impl PromoteToSingleWriter {
    pub fn new(min_samples: u64, abort_rate_threshold: f64) -> Self {
        PromoteToSingleWriter {
            min_samples,
            abort_rate_threshold,
            promoted: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn is_promoted(&self, var: VarId) -> bool {
        self.promoted.lock().contains(&var)
    }

    pub fn promoted(&self) -> Vec<VarId> {
        self.promoted.lock().iter().copied().collect()
    }
}

impl Default for PromoteToSingleWriter {
    fn default() -> Self {
        Self::new(20, 0.5)
    }
}

impl MitigationStrategy for PromoteToSingleWriter {
    fn name(&self) -> &str {
        "promote-to-single-writer"
    }

    fn should_mitigate(&self, var: VarId, stats: &VarStats) -> bool {
        !self.is_promoted(var)
            && stats.samples() >= self.min_samples
            && stats.abort_rate() >= self.abort_rate_threshold
    }

    fn apply_mitigation(&self, var: VarId) {
        self.promoted.lock().insert(var);
    }
}

/// A mitigation that fired
#[derive(Clone, Debug, PartialEq)]
pub struct Mitigation {
    pub var: VarId,
    pub strategy: String,
    pub stats: VarStats,
}

/// Runs mitigation strategies over the telemetry table
#[derive(Default)]
pub struct HotspotAggregator {
    strategies: Vec<Box<dyn MitigationStrategy>>,
}

impl HotspotAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_strategy(mut self, strategy: impl MitigationStrategy + 'static) -> Self {
        self.strategies.push(Box::new(strategy));
        self
    }

    pub fn add_strategy(&mut self, strategy: Box<dyn MitigationStrategy>) {
        self.strategies.push(strategy);
    }

    /// Evaluate every strategy against every variable, applying those whose
    /// thresholds are crossed
    pub fn evaluate(&self, telemetry: &Telemetry) -> Vec<Mitigation> {
        let mut fired = Vec::new();
        for (var, stats) in telemetry.all_var_stats() {
            for strategy in &self.strategies {
                if strategy.should_mitigate(var, &stats) {
                    strategy.apply_mitigation(var);
                    info!(
                        %var,
                        strategy = strategy.name(),
                        abort_rate = stats.abort_rate(),
                        "hotspot mitigation applied"
                    );
                    fired.push(Mitigation {
                        var,
                        strategy: strategy.name().to_string(),
                        stats,
                    });
                }
            }
        }
        fired
    }
}

impl fmt::Debug for HotspotAggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.strategies.iter().map(|s| s.name()).collect();
        f.debug_struct("HotspotAggregator")
            .field("strategies", &names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_counters() {
        let telemetry = Telemetry::default();
        telemetry.record_commit(&[], Duration::ZERO);
        telemetry.record_commit(&[VarId(1), VarId(2)], Duration::from_micros(40));
        telemetry.record_commit(&[VarId(1)], Duration::from_micros(10));

        let snap = telemetry.snapshot();
        assert_eq!(snap.commits, 3);
        assert_eq!(snap.read_only_commits, 1);
        assert_eq!(snap.writes_applied, 3);
        assert_eq!(snap.lock_hold_total_us, 50);
        assert_eq!(snap.lock_hold_max_us, 40);
        assert_eq!(telemetry.var_stats(VarId(1)).commits, 2);
    }

    #[test]
    fn test_hotspots_ranked_by_failures() {
        let telemetry = Telemetry::new(2);
        for _ in 0..3 {
            telemetry.record_validation_failure(VarId(7));
        }
        telemetry.record_validation_failure(VarId(2));
        for _ in 0..2 {
            telemetry.record_validation_failure(VarId(5));
        }

        let spots = telemetry.snapshot().hotspots;
        assert_eq!(spots.len(), 2);
        assert_eq!(spots[0].var, VarId(7));
        assert_eq!(spots[1].var, VarId(5));
        assert!((spots[0].abort_rate - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_report_text() {
        let telemetry = Telemetry::default();
        telemetry.record_commit(&[VarId(1)], Duration::from_micros(3));
        telemetry.record_validation_failure(VarId(1));
        telemetry.record_retry();

        let report = telemetry.report();
        assert!(report.contains("commits:             1"));
        assert!(report.contains("retries:             1"));
        assert!(report.contains("v1 failures=1 commits=1"));
    }

    #[test]
    fn test_reset() {
        let telemetry = Telemetry::default();
        telemetry.record_commit(&[VarId(1)], Duration::from_micros(3));
        telemetry.record_abort();
        telemetry.reset();
        assert_eq!(telemetry.snapshot(), TelemetrySnapshot::default());
    }

    #[test]
    fn test_promote_to_single_writer() {
        let telemetry = Telemetry::default();
        for _ in 0..6 {
            telemetry.record_validation_failure(VarId(3));
        }
        for _ in 0..4 {
            telemetry.record_commit(&[VarId(3)], Duration::ZERO);
            telemetry.record_commit(&[VarId(4)], Duration::ZERO);
        }

        let aggregator = HotspotAggregator::new().with_strategy(PromoteToSingleWriter::new(10, 0.5));
        let fired = aggregator.evaluate(&telemetry);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].var, VarId(3));
        assert_eq!(fired[0].strategy, "promote-to-single-writer");

        // Already promoted: no second signal
        assert!(aggregator.evaluate(&telemetry).is_empty());
    }
}
