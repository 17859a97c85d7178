//! Run-wide resource tracker.
//!
//! One [`AnalysisBudget`] exists per run. Every component that consumes
//! lines, files or call depth records into its atomic counters; status is
//! recomputed only from the aggregated counts at unit boundaries, so the
//! transition sequence is deterministic for identical inputs and limits.
//! Status only ever moves forward: ok → warning → exceeded → terminated.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::Instant;
use thiserror::Error;

pub const DEFAULT_MAX_CALL_DEPTH: i64 = 5;
pub const DEFAULT_TIME_BUDGET_MS: i64 = 300_000;
pub const DEFAULT_SIZE_BUDGET_LINES: i64 = 10_000;
pub const DEFAULT_NODE_VISIT_LIMIT: i64 = 10_000;

/// Effective call depth once the budget reaches warning.
pub const DEGRADED_CALL_DEPTH: u64 = 3;

const WARNING_PCT: u64 = 80;
const EXCEEDED_PCT: u64 = 100;
const TERMINATED_PCT: u64 = 110;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
/// Budget limits as resolved by the surrounding pipeline. Signed so that
/// malformed (negative) values can be rejected up front instead of
/// wrapping silently.
pub struct BudgetConfig {
    pub time_budget_ms: i64,
    pub size_budget_lines: i64,
    pub max_call_depth: i64,
    pub node_visit_limit: i64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            time_budget_ms: DEFAULT_TIME_BUDGET_MS,
            size_budget_lines: DEFAULT_SIZE_BUDGET_LINES,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
            node_visit_limit: DEFAULT_NODE_VISIT_LIMIT,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BudgetError {
    #[error("budget limit '{field}' is negative ({value}); configuration rejected")]
    NegativeLimit { field: &'static str, value: i64 },
}

#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord,
)]
#[serde(rename_all = "lowercase")]
pub enum BudgetStatus {
    Ok,
    Warning,
    Exceeded,
    Terminated,
}

impl BudgetStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => BudgetStatus::Ok,
            1 => BudgetStatus::Warning,
            2 => BudgetStatus::Exceeded,
            _ => BudgetStatus::Terminated,
        }
    }
}

impl std::fmt::Display for BudgetStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BudgetStatus::Ok => "ok",
            BudgetStatus::Warning => "warning",
            BudgetStatus::Exceeded => "exceeded",
            BudgetStatus::Terminated => "terminated",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug)]
/// Mutable run-wide tracker, shared by reference across all components.
pub struct AnalysisBudget {
    start: Instant,
    time_budget_ms: u64,
    size_budget_lines: u64,
    max_call_depth: u64,
    node_visit_limit: u64,
    lines: AtomicU64,
    files: AtomicU64,
    functions: AtomicU64,
    status: AtomicU8,
    /// Elapsed ms at the first forward transition out of `Ok`;
    /// `u64::MAX` until then.
    degraded_since_ms: AtomicU64,
}

impl AnalysisBudget {
    /// Validates the configuration and starts the run clock. Negative
    /// limits are fatal before any analysis begins.
    pub fn new(config: &BudgetConfig) -> Result<Self, BudgetError> {
        let check = |field: &'static str, value: i64| -> Result<u64, BudgetError> {
            if value < 0 {
                Err(BudgetError::NegativeLimit { field, value })
            } else {
                Ok(value as u64)
            }
        };
        Ok(Self {
            start: Instant::now(),
            time_budget_ms: check("timeBudgetMs", config.time_budget_ms)?,
            size_budget_lines: check("sizeBudgetLines", config.size_budget_lines)?,
            max_call_depth: check("maxCallDepth", config.max_call_depth)?,
            node_visit_limit: check("nodeVisitLimit", config.node_visit_limit)?,
            lines: AtomicU64::new(0),
            files: AtomicU64::new(0),
            functions: AtomicU64::new(0),
            status: AtomicU8::new(0),
            degraded_since_ms: AtomicU64::new(u64::MAX),
        })
    }

    pub fn add_lines(&self, n: u64) {
        self.lines.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_file(&self) {
        self.files.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_function(&self) {
        self.functions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn lines_analyzed(&self) -> u64 {
        self.lines.load(Ordering::Relaxed)
    }

    pub fn files_analyzed(&self) -> u64 {
        self.files.load(Ordering::Relaxed)
    }

    pub fn functions_analyzed(&self) -> u64 {
        self.functions.load(Ordering::Relaxed)
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    pub fn status(&self) -> BudgetStatus {
        BudgetStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Elapsed ms at which the run first left `Ok`, if it has.
    pub fn degraded_since_ms(&self) -> Option<u64> {
        match self.degraded_since_ms.load(Ordering::Relaxed) {
            u64::MAX => None,
            ms => Some(ms),
        }
    }

    /// Call-depth ceiling for inter-procedural analysis, reduced once the
    /// budget reaches warning.
    pub fn effective_call_depth(&self) -> u64 {
        if self.status() >= BudgetStatus::Warning {
            self.max_call_depth.min(DEGRADED_CALL_DEPTH)
        } else {
            self.max_call_depth
        }
    }

    pub fn node_visit_limit(&self) -> u64 {
        self.node_visit_limit
    }

    /// Recomputes status from the aggregated counters and advances it if
    /// a threshold was crossed. Never moves backwards.
    pub fn refresh(&self) -> BudgetStatus {
        let line_pct = percent_of(self.lines.load(Ordering::Relaxed), self.size_budget_lines);
        let time_pct = percent_of(self.elapsed_ms(), self.time_budget_ms);
        let pct = line_pct.max(time_pct);
        let target = if pct >= TERMINATED_PCT {
            BudgetStatus::Terminated
        } else if pct >= EXCEEDED_PCT {
            BudgetStatus::Exceeded
        } else if pct >= WARNING_PCT {
            BudgetStatus::Warning
        } else {
            BudgetStatus::Ok
        };
        self.advance_to(target)
    }

    /// Forces the hard stop. Used when an external invariant demands it.
    pub fn terminate(&self) {
        self.advance_to(BudgetStatus::Terminated);
    }

    fn advance_to(&self, target: BudgetStatus) -> BudgetStatus {
        let mut current = self.status.load(Ordering::Acquire);
        let wanted = target as u8;
        while wanted > current {
            match self.status.compare_exchange(
                current,
                wanted,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    if current == 0 {
                        let _ = self.degraded_since_ms.compare_exchange(
                            u64::MAX,
                            self.elapsed_ms(),
                            Ordering::Relaxed,
                            Ordering::Relaxed,
                        );
                    }
                    return target;
                }
                Err(actual) => current = actual,
            }
        }
        BudgetStatus::from_u8(current.max(wanted))
    }
}

fn percent_of(used: u64, limit: u64) -> u64 {
    if limit == 0 {
        if used == 0 {
            0
        } else {
            // Zero budget: any usage at all is past the hard ceiling.
            TERMINATED_PCT
        }
    } else {
        used.saturating_mul(100) / limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn budget(lines: i64) -> AnalysisBudget {
        AnalysisBudget::new(&BudgetConfig {
            size_budget_lines: lines,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn negative_limits_are_fatal() {
        let err = AnalysisBudget::new(&BudgetConfig {
            time_budget_ms: -1,
            ..Default::default()
        })
        .unwrap_err();
        assert_eq!(
            err,
            BudgetError::NegativeLimit {
                field: "timeBudgetMs",
                value: -1
            }
        );
    }

    #[test]
    fn status_crosses_thresholds_at_80_100_110_percent() {
        let b = budget(100);
        assert_eq!(b.refresh(), BudgetStatus::Ok);
        b.add_lines(79);
        assert_eq!(b.refresh(), BudgetStatus::Ok);
        b.add_lines(1);
        assert_eq!(b.refresh(), BudgetStatus::Warning);
        b.add_lines(20);
        assert_eq!(b.refresh(), BudgetStatus::Exceeded);
        b.add_lines(10);
        assert_eq!(b.refresh(), BudgetStatus::Terminated);
    }

    #[test]
    fn status_never_moves_backwards() {
        let b = budget(100);
        b.add_lines(110);
        assert_eq!(b.refresh(), BudgetStatus::Terminated);
        // Counters cannot shrink, but even a stale recomputation must not
        // regress the status.
        assert_eq!(b.status(), BudgetStatus::Terminated);
        assert_eq!(b.refresh(), BudgetStatus::Terminated);
    }

    #[test]
    fn warning_reduces_effective_call_depth() {
        let b = budget(100);
        assert_eq!(b.effective_call_depth(), DEFAULT_MAX_CALL_DEPTH as u64);
        b.add_lines(85);
        b.refresh();
        assert_eq!(b.status(), BudgetStatus::Warning);
        assert_eq!(b.effective_call_depth(), DEGRADED_CALL_DEPTH);
    }

    #[test]
    fn shallow_configured_depth_is_not_raised_by_degradation() {
        let b = AnalysisBudget::new(&BudgetConfig {
            max_call_depth: 2,
            size_budget_lines: 100,
            ..Default::default()
        })
        .unwrap();
        b.add_lines(90);
        b.refresh();
        assert_eq!(b.effective_call_depth(), 2);
    }

    #[test]
    fn degraded_since_is_recorded_once() {
        let b = budget(100);
        assert_eq!(b.degraded_since_ms(), None);
        b.add_lines(80);
        b.refresh();
        let first = b.degraded_since_ms().expect("marker set");
        b.add_lines(40);
        b.refresh();
        assert_eq!(b.degraded_since_ms(), Some(first));
    }

    #[test]
    fn zero_line_budget_terminates_on_first_line() {
        let b = budget(0);
        assert_eq!(b.refresh(), BudgetStatus::Ok);
        b.add_lines(1);
        assert_eq!(b.refresh(), BudgetStatus::Terminated);
    }
}
