//! Run statistics.
//!
//! Pure bookkeeping types filled in by the pipeline and printed by the CLI.

use std::collections::BTreeMap;

use crate::models::Operation;

/// Counters for one resource within one run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ResourceStats {
    /// Pages fetched from upstream.
    pub pages_fetched: usize,
    /// Batch files applied to every destination and marked done.
    pub batches_applied: usize,
    /// Records upserted, summed over destinations.
    pub records_loaded: usize,
    /// Rows deleted, summed over destinations.
    pub ids_purged: u64,
    /// Keys flagged missing or stale by reconcile.
    pub ids_flagged: usize,
}

impl ResourceStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn merge(&mut self, other: &ResourceStats) {
        self.pages_fetched += other.pages_fetched;
        self.batches_applied += other.batches_applied;
        self.records_loaded += other.records_loaded;
        self.ids_purged += other.ids_purged;
        self.ids_flagged += other.ids_flagged;
    }

    /// True when the run changed nothing for this resource.
    pub fn is_idle(&self) -> bool {
        self.batches_applied == 0 && self.ids_purged == 0 && self.ids_flagged == 0
    }
}

/// Statistics of one operation run on one source, keyed by resource name.
#[derive(Debug, Default, Clone)]
pub struct RunStats {
    pub resources: BTreeMap<String, ResourceStats>,
}

impl RunStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mutable counters for `resource`, created on first use.
    pub fn resource(&mut self, resource: &str) -> &mut ResourceStats {
        self.resources.entry(resource.to_string()).or_default()
    }

    pub fn total(&self) -> ResourceStats {
        let mut total = ResourceStats::new();
        for stats in self.resources.values() {
            total.merge(stats);
        }
        total
    }
}

/// Result of running one operation for one source.
#[derive(Debug, Clone)]
pub struct SourceRunResult {
    pub source: String,
    pub operation: Operation,
    pub stats: RunStats,
    /// Error message if the run failed, None if successful.
    pub error: Option<String>,
}

impl SourceRunResult {
    pub fn success(source: String, operation: Operation, stats: RunStats) -> Self {
        Self {
            source,
            operation,
            stats,
            error: None,
        }
    }

    pub fn failure(source: String, operation: Operation, error: String) -> Self {
        Self {
            source,
            operation,
            stats: RunStats::default(),
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Aggregated results of one CLI invocation across sources.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub results: Vec<SourceRunResult>,
}

impl RunSummary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, result: SourceRunResult) {
        self.results.push(result);
    }

    pub fn successful_count(&self) -> usize {
        self.results.iter().filter(|r| r.is_success()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.results.iter().filter(|r| !r.is_success()).count()
    }

    /// Totals across every successful run.
    pub fn total(&self) -> ResourceStats {
        let mut total = ResourceStats::new();
        for result in &self.results {
            total.merge(&result.stats.total());
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(batches: usize, records: usize) -> ResourceStats {
        ResourceStats {
            pages_fetched: batches,
            batches_applied: batches,
            records_loaded: records,
            ids_purged: 0,
            ids_flagged: 0,
        }
    }

    #[test]
    fn test_resource_stats_default_is_idle() {
        assert!(ResourceStats::new().is_idle());
        assert!(!stats(1, 2).is_idle());
    }

    #[test]
    fn test_run_stats_total() {
        let mut run = RunStats::new();
        *run.resource("Property") = stats(3, 5);
        run.resource("Media").merge(&stats(2, 7));
        run.resource("Media").ids_purged = 4;

        let total = run.total();
        assert_eq!(total.batches_applied, 5);
        assert_eq!(total.records_loaded, 12);
        assert_eq!(total.ids_purged, 4);
    }

    #[test]
    fn test_source_run_result_failure() {
        let result =
            SourceRunResult::failure("ure".into(), Operation::Sync, "Connection timeout".into());
        assert!(!result.is_success());
        assert_eq!(result.error, Some("Connection timeout".to_string()));
        assert!(result.stats.total().is_idle());
    }

    #[test]
    fn test_run_summary_mixed_results() {
        let mut summary = RunSummary::new();
        let mut run = RunStats::new();
        *run.resource("Property") = stats(3, 5);
        summary.add(SourceRunResult::success("a".into(), Operation::Sync, run));
        summary.add(SourceRunResult::failure(
            "b".into(),
            Operation::Purge,
            "error".into(),
        ));

        assert_eq!(summary.successful_count(), 1);
        assert_eq!(summary.failed_count(), 1);
        assert_eq!(summary.total().records_loaded, 5);
    }
}
