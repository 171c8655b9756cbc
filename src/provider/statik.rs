//! Deterministic in-process provider for tests and offline runs.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use super::{Provider, ProviderOutput};
use crate::error::{ControlError, Result};

/// Provider that returns a canned response without network access.
///
/// Can be configured to fail the first N invocations (exercises the
/// router's candidate fallback) or to report itself unhealthy.
pub struct StaticProvider {
    id: String,
    unit_cost_cents: f64,
    output: serde_json::Value,
    units_consumed: f64,
    fail_first: AtomicU32,
    always_fail: AtomicBool,
    healthy: AtomicBool,
    invocations: AtomicU32,
}

impl StaticProvider {
    pub fn new(id: impl Into<String>, unit_cost_cents: f64) -> Self {
        let id = id.into();
        Self {
            output: serde_json::json!({ "content": format!("static output from {}", id) }),
            id,
            unit_cost_cents,
            units_consumed: 1.0,
            fail_first: AtomicU32::new(0),
            always_fail: AtomicBool::new(false),
            healthy: AtomicBool::new(true),
            invocations: AtomicU32::new(0),
        }
    }

    pub fn with_units(mut self, units: f64) -> Self {
        self.units_consumed = units;
        self
    }

    /// Fail the first `n` invocations with a transient provider error.
    pub fn failing_first(self, n: u32) -> Self {
        self.fail_first.store(n, Ordering::SeqCst);
        self
    }

    /// Fail every invocation.
    pub fn always_failing(self) -> Self {
        self.always_fail.store(true, Ordering::SeqCst);
        self
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Number of times `invoke` was called.
    pub fn invocations(&self) -> u32 {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for StaticProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn unit_cost_cents(&self) -> f64 {
        self.unit_cost_cents
    }

    fn healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    async fn invoke(&self, _params: &serde_json::Value) -> Result<ProviderOutput> {
        self.invocations.fetch_add(1, Ordering::SeqCst);

        if self.always_fail.load(Ordering::SeqCst) {
            return Err(ControlError::Provider {
                provider: self.id.clone(),
                message: "static provider configured to fail".to_string(),
            });
        }

        let remaining = self.fail_first.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_first.store(remaining - 1, Ordering::SeqCst);
            return Err(ControlError::Provider {
                provider: self.id.clone(),
                message: "transient failure (simulated)".to_string(),
            });
        }

        Ok(ProviderOutput {
            output: self.output.clone(),
            units_consumed: self.units_consumed,
            latency_ms: 1,
        })
    }
}
