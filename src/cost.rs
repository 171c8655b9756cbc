//! Cost estimation.
//!
//! Estimates are always a `{low, mid, high}` range, never a single point
//! value: callers making budget decisions need the uncertainty spread. The
//! point estimate comes from a provider's unit pricing applied to an
//! estimated workload size; the low/high bounds apply a fixed confidence
//! margin around it.

use serde::{Deserialize, Serialize};

use crate::config::OperationDef;
use crate::error::{ControlError, Result};
use crate::provider::ProviderRegistry;

/// A cost estimate range in cents. Invariant: `low <= mid <= high`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostRange {
    pub low_cents: f64,
    pub mid_cents: f64,
    pub high_cents: f64,
}

impl CostRange {
    /// Build a range around a point estimate with a symmetric confidence
    /// margin (`0.2` = ±20%). The margin is clamped to keep the invariant.
    pub fn around(mid_cents: f64, margin: f64) -> Self {
        let margin = margin.clamp(0.0, 1.0);
        let mid = mid_cents.max(0.0);
        Self {
            low_cents: mid * (1.0 - margin),
            mid_cents: mid,
            high_cents: mid * (1.0 + margin),
        }
    }

    pub fn zero() -> Self {
        Self {
            low_cents: 0.0,
            mid_cents: 0.0,
            high_cents: 0.0,
        }
    }

    /// Element-wise sum, used for batch aggregates.
    pub fn add(&self, other: &CostRange) -> Self {
        Self {
            low_cents: self.low_cents + other.low_cents,
            mid_cents: self.mid_cents + other.mid_cents,
            high_cents: self.high_cents + other.high_cents,
        }
    }
}

/// Rough workload sizing: one unit per KiB of serialized parameters, with a
/// floor of one unit so that empty params still cost something.
pub fn estimate_units(params: &serde_json::Value) -> f64 {
    let payload = params.to_string();
    (payload.len() as f64 / 1024.0).max(1.0)
}

/// Computes cost ranges for prospective invocations.
///
/// Depends only on the `Provider` capability interface via the registry,
/// never on a concrete provider type.
pub struct CostEstimator {
    registry: std::sync::Arc<ProviderRegistry>,
    margin: f64,
}

impl CostEstimator {
    pub fn new(registry: std::sync::Arc<ProviderRegistry>, margin: f64) -> Self {
        Self { registry, margin }
    }

    /// Estimate the cost of routing `operation` with `params`, priced at the
    /// first registered candidate. Returns an error when no candidate is
    /// registered at all.
    pub fn estimate(&self, operation: &OperationDef, params: &serde_json::Value) -> Result<CostRange> {
        let provider = operation
            .candidates
            .iter()
            .find_map(|id| self.registry.get(id))
            .ok_or_else(|| ControlError::CandidatesExhausted {
                operation: operation.id.clone(),
            })?;
        Ok(self.estimate_for(provider.unit_cost_cents(), params))
    }

    /// Estimate against a specific unit price (degrade-on-budget re-checks
    /// with the cheapest candidate's pricing).
    pub fn estimate_for(&self, unit_cost_cents: f64, params: &serde_json::Value) -> CostRange {
        let mid = estimate_units(params) * unit_cost_cents;
        CostRange::around(mid, self.margin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_ordering_invariant() {
        for mid in [0.0, 0.01, 1.0, 25.0, 10_000.0] {
            for margin in [0.0, 0.1, 0.2, 0.5, 1.0, 2.0] {
                let r = CostRange::around(mid, margin);
                assert!(r.low_cents <= r.mid_cents, "low > mid for {mid}/{margin}");
                assert!(r.mid_cents <= r.high_cents, "mid > high for {mid}/{margin}");
            }
        }
    }

    #[test]
    fn test_margin_spread() {
        let r = CostRange::around(100.0, 0.2);
        assert!((r.low_cents - 80.0).abs() < 1e-9);
        assert!((r.high_cents - 120.0).abs() < 1e-9);
    }

    #[test]
    fn test_unit_floor() {
        assert_eq!(estimate_units(&serde_json::json!({})), 1.0);
        let big = serde_json::json!({ "text": "x".repeat(4096) });
        assert!(estimate_units(&big) > 3.0);
    }

    #[test]
    fn test_aggregate_sum() {
        let a = CostRange::around(10.0, 0.2);
        let b = CostRange::around(20.0, 0.2);
        let sum = a.add(&b);
        assert!((sum.mid_cents - 30.0).abs() < 1e-9);
        assert!(sum.low_cents <= sum.mid_cents && sum.mid_cents <= sum.high_cents);
    }
}
