//! Per-scope budget enforcement.
//!
//! The enforcer sits between cost estimation and provider invocation.
//! Checks compare rolling spend plus the estimate's midpoint against
//! the scope's limit. An unknown scope fails closed.

use chrono::{Datelike, TimeZone, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::cost::CostRange;
use crate::error::{ControlError, Result};
use crate::store::{now_ms, BudgetPeriod, BudgetScope, Store};

/// Verdict returned by a budget check. `warning` is advisory only.
#[derive(Debug, Clone, Serialize)]
pub struct BudgetCheck {
    pub scope: String,
    pub spent_cents: f64,
    pub limit_cents: f64,
    pub remaining_cents: f64,
    pub warning: bool,
}

/// Advisory anomaly report for a scope. Never blocks execution.
#[derive(Debug, Clone, Serialize)]
pub struct AnomalyReport {
    pub scope: String,
    pub spend_velocity_ratio: f64,
    pub op_count_ratio: f64,
    pub anomalous: bool,
}

/// Start of the current period in unix millis, UTC.
fn period_start_ms(period: BudgetPeriod) -> i64 {
    let now = Utc::now();
    let start = match period {
        BudgetPeriod::Daily => Utc
            .with_ymd_and_hms(now.year(), now.month(), now.day(), 0, 0, 0)
            .single(),
        BudgetPeriod::Monthly => Utc
            .with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
            .single(),
    };
    start.map(|d| d.timestamp_millis()).unwrap_or(0)
}

/// Start of the same-length window one period back (for anomaly baselines).
fn previous_window(period: BudgetPeriod) -> (i64, i64) {
    let start = period_start_ms(period);
    let span = now_ms() - start;
    (start - span.max(1), start)
}

pub struct BudgetEnforcer {
    store: Arc<Store>,
}

impl BudgetEnforcer {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Fetch the scope row, rolling the period over first when the stored
    /// counters belong to an earlier period. The rollover is a guarded
    /// update, so concurrent callers reset at most once.
    fn current_scope(&self, scope: &str) -> Result<Option<BudgetScope>> {
        let Some(row) = self.store.get_budget_scope(scope)? else {
            return Ok(None);
        };
        let boundary = period_start_ms(row.period);
        if row.last_reset.timestamp_millis() < boundary {
            if self.store.reset_budget_scope_before(scope, boundary)? {
                info!(scope, period = %row.period, "budget period rolled over");
            }
            return self.store.get_budget_scope(scope);
        }
        Ok(Some(row))
    }

    /// Check whether `estimate` fits the scope's remaining budget.
    /// Fails closed: a scope with no configured budget row rejects.
    pub fn enforce(&self, scope: &str, estimate: &CostRange) -> Result<BudgetCheck> {
        let row = self.current_scope(scope)?.ok_or_else(|| ControlError::BudgetExceeded {
            scope: scope.to_string(),
            spent_cents: 0.0,
            attempted_cents: estimate.mid_cents,
            limit_cents: 0.0,
        })?;

        let attempted = estimate.mid_cents;
        if row.spent_cents + attempted > row.limit_cents {
            return Err(ControlError::BudgetExceeded {
                scope: scope.to_string(),
                spent_cents: row.spent_cents,
                attempted_cents: attempted,
                limit_cents: row.limit_cents,
            });
        }

        let warning = row.spent_cents + attempted >= row.limit_cents * row.warn_ratio;
        if warning {
            warn!(
                scope,
                spent_cents = row.spent_cents,
                limit_cents = row.limit_cents,
                "budget warn threshold crossed"
            );
        }
        Ok(BudgetCheck {
            scope: scope.to_string(),
            spent_cents: row.spent_cents,
            limit_cents: row.limit_cents,
            remaining_cents: row.limit_cents - row.spent_cents,
            warning,
        })
    }

    /// Record actual spend against a scope after a successful invocation.
    pub fn record_spend(&self, scope: &str, cents: f64) -> Result<()> {
        self.store.add_budget_spend(scope, cents)
    }

    /// Compare the current period's spend velocity and operation count
    /// against the previous same-length window. Purely advisory; the
    /// report is logged and surfaced, never enforced.
    pub fn detect_anomalies(&self, scope: &str) -> Result<AnomalyReport> {
        let row = self.current_scope(scope)?.ok_or_else(|| ControlError::NotFound {
            kind: "budget scope",
            id: scope.to_string(),
        })?;

        let current_start = period_start_ms(row.period);
        let (prev_start, prev_end) = previous_window(row.period);
        let (current_spend, current_count) =
            self.store.spend_between(scope, current_start, now_ms() + 1)?;
        let (prev_spend, prev_count) = self.store.spend_between(scope, prev_start, prev_end)?;

        let velocity_ratio = if prev_spend > 0.0 {
            current_spend / prev_spend
        } else if current_spend > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };
        let count_ratio = if prev_count > 0 {
            current_count as f64 / prev_count as f64
        } else if current_count > 0 {
            f64::INFINITY
        } else {
            0.0
        };

        // No baseline means no verdict; a fresh scope is not anomalous.
        let has_baseline = prev_spend > 0.0 || prev_count > 0;
        let anomalous = has_baseline && (velocity_ratio > 2.0 || count_ratio > 3.0);
        if anomalous {
            warn!(
                scope,
                velocity_ratio, count_ratio, "anomalous spend pattern detected"
            );
            self.store.insert_audit(
                "budget.anomaly",
                scope,
                &format!(
                    "velocity_ratio={velocity_ratio:.2} count_ratio={count_ratio:.2}"
                ),
            )?;
        }
        Ok(AnomalyReport {
            scope: scope.to_string(),
            spend_velocity_ratio: velocity_ratio,
            op_count_ratio: count_ratio,
            anomalous,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enforcer_with_scope(limit: f64) -> BudgetEnforcer {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store
            .ensure_budget_scope("user:1", BudgetPeriod::Monthly, limit, 0.8)
            .unwrap();
        BudgetEnforcer::new(store)
    }

    #[test]
    fn test_enforce_allows_within_limit() {
        let enforcer = enforcer_with_scope(100.0);
        let check = enforcer.enforce("user:1", &CostRange::around(50.0, 0.2)).unwrap();
        assert!(!check.warning);
        assert_eq!(check.remaining_cents, 100.0);
    }

    #[test]
    fn test_enforce_rejects_over_limit_with_reason() {
        let enforcer = enforcer_with_scope(100.0);
        enforcer.record_spend("user:1", 90.0).unwrap();
        let err = enforcer
            .enforce("user:1", &CostRange::around(20.0, 0.2))
            .unwrap_err();
        match err {
            ControlError::BudgetExceeded {
                spent_cents,
                limit_cents,
                ..
            } => {
                assert_eq!(spent_cents, 90.0);
                assert_eq!(limit_cents, 100.0);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_enforce_fails_closed_for_unknown_scope() {
        let enforcer = enforcer_with_scope(100.0);
        let err = enforcer
            .enforce("team:ghost", &CostRange::around(1.0, 0.2))
            .unwrap_err();
        assert!(matches!(err, ControlError::BudgetExceeded { .. }));
    }

    #[test]
    fn test_warn_threshold() {
        let enforcer = enforcer_with_scope(100.0);
        enforcer.record_spend("user:1", 70.0).unwrap();
        // 70 + 12 (high end of 10 at 20% margin) crosses 80% of 100.
        let check = enforcer.enforce("user:1", &CostRange::around(10.0, 0.2)).unwrap();
        assert!(check.warning);
    }

    #[test]
    fn test_fresh_scope_is_not_anomalous() {
        let enforcer = enforcer_with_scope(100.0);
        let report = enforcer.detect_anomalies("user:1").unwrap();
        assert!(!report.anomalous);
    }
}
