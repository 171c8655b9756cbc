//! Operation router.
//!
//! Routing an invocation walks a fixed pipeline: resolve the operation,
//! enforce its toggle, estimate the cost, pass the approval gate, pass
//! the budget enforcer (optionally degrading to the cheapest candidate),
//! then invoke candidates in preference order until one succeeds. Every
//! provider attempt and every pre-invocation rejection leaves an
//! execution record, so the store reconstructs the full decision trail.

use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;

use crate::approval::ApprovalGate;
use crate::budget::BudgetEnforcer;
use crate::config::{CatalogStore, CostTier, OperationDef};
use crate::cost::{CostEstimator, CostRange};
use crate::error::{ControlError, Result};
use crate::provider::{Provider, ProviderRegistry};
use crate::store::{ExecutionRecord, Store};
use crate::toggles::ToggleRegistry;

/// Outcome of a successfully routed invocation.
#[derive(Debug, Clone, Serialize)]
pub struct RouteResult {
    pub execution_id: Uuid,
    pub operation_id: String,
    pub provider_id: String,
    pub output: serde_json::Value,
    pub estimate: CostRange,
    pub actual_cost_cents: f64,
    pub latency_ms: i64,
    /// True when budget pressure downgraded the invocation to the
    /// cheapest candidate.
    pub degraded: bool,
    /// Approval request this invocation passed through, if it was gated.
    pub approval_id: Option<Uuid>,
}

struct CachedOperation {
    def: OperationDef,
    catalog_version: u64,
    fetched_at: Instant,
}

pub struct Router {
    catalog: Arc<CatalogStore>,
    registry: Arc<ProviderRegistry>,
    estimator: CostEstimator,
    budget: Arc<BudgetEnforcer>,
    toggles: Arc<ToggleRegistry>,
    approvals: Arc<ApprovalGate>,
    store: Arc<Store>,
    op_cache: RwLock<HashMap<String, CachedOperation>>,
    op_ttl: Duration,
    approval_threshold_cents: f64,
    max_attempts: u32,
}

impl Router {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        catalog: Arc<CatalogStore>,
        registry: Arc<ProviderRegistry>,
        estimator: CostEstimator,
        budget: Arc<BudgetEnforcer>,
        toggles: Arc<ToggleRegistry>,
        approvals: Arc<ApprovalGate>,
        store: Arc<Store>,
        op_ttl: Duration,
        approval_threshold_cents: f64,
        max_attempts: u32,
    ) -> Self {
        Self {
            catalog,
            registry,
            estimator,
            budget,
            toggles,
            approvals,
            store,
            op_cache: RwLock::new(HashMap::new()),
            op_ttl,
            approval_threshold_cents,
            max_attempts,
        }
    }

    /// Resolve an operation definition, serving from a short TTL cache.
    /// A catalog reload bumps the version and invalidates every cached
    /// resolution immediately, regardless of TTL.
    async fn resolve_operation(&self, operation_id: &str) -> Result<OperationDef> {
        let version = self.catalog.version();
        {
            let cache = self.op_cache.read().unwrap_or_else(|p| p.into_inner());
            if let Some(entry) = cache.get(operation_id) {
                if entry.catalog_version == version && entry.fetched_at.elapsed() < self.op_ttl {
                    return Ok(entry.def.clone());
                }
            }
        }
        let catalog = self.catalog.get().await;
        let def = catalog
            .operation(operation_id)
            .cloned()
            .ok_or_else(|| ControlError::UnknownOperation(operation_id.to_string()))?;
        let mut cache = self.op_cache.write().unwrap_or_else(|p| p.into_inner());
        cache.insert(
            operation_id.to_string(),
            CachedOperation {
                def: def.clone(),
                catalog_version: version,
                fetched_at: Instant::now(),
            },
        );
        Ok(def)
    }

    fn record_rejection(
        &self,
        operation_id: &str,
        scope: &str,
        estimate: CostRange,
        err: &ControlError,
    ) {
        let rec = ExecutionRecord::failure(operation_id, None, scope, estimate, &err.to_string());
        if let Err(store_err) = self.store.insert_execution_record(&rec) {
            warn!(operation = operation_id, error = %store_err, "failed to persist rejection record");
        }
    }

    /// Route one invocation end to end.
    pub async fn route(
        &self,
        operation_id: &str,
        scope: &str,
        params: &serde_json::Value,
    ) -> Result<RouteResult> {
        // 1. Resolve the operation.
        let op = self.resolve_operation(operation_id).await?;
        if !op.enabled {
            return Err(ControlError::OperationDisabled(op.id.clone()));
        }

        // 2. Toggle gate.
        if let Some(toggle) = &op.toggle {
            if let Err(err) = self.toggles.enforce(toggle) {
                self.record_rejection(operation_id, scope, CostRange::zero(), &err);
                return Err(err);
            }
        }

        // 3. Cost estimate, priced at the preferred candidate.
        let mut estimate = self.estimator.estimate(&op, params)?;

        // 4. Approval gate for forced-approval operations and expensive
        //    high-tier invocations.
        let needs_approval = op.requires_approval
            || (op.tier == CostTier::High && estimate.mid_cents > self.approval_threshold_cents);
        let mut approval_id = None;
        if needs_approval {
            let req = self.approvals.request(
                operation_id,
                scope,
                json!({ "params": params, "tier": op.tier }),
                estimate,
                "router",
            )?;
            approval_id = Some(req.id);
            if let Err(err) = self.approvals.wait_for_decision(req.id).await {
                self.record_rejection(operation_id, scope, estimate, &err);
                return Err(err);
            }
        }

        // 5. Budget gate, with optional degrade to the cheapest candidate.
        let mut candidates = self.registry.healthy_candidates(&op.candidates);
        let mut degraded = false;
        if let Err(err) = self.budget.enforce(scope, &estimate) {
            let can_degrade = op.degrade_on_budget
                && matches!(err, ControlError::BudgetExceeded { .. });
            if !can_degrade {
                self.record_rejection(operation_id, scope, estimate, &err);
                return Err(err);
            }
            let cheapest = self
                .registry
                .cheapest_candidate(&op.candidates)
                .ok_or_else(|| ControlError::CandidatesExhausted {
                    operation: op.id.clone(),
                })?;
            let cheap_estimate = self.estimator.estimate_for(cheapest.unit_cost_cents(), params);
            if let Err(cheap_err) = self.budget.enforce(scope, &cheap_estimate) {
                self.record_rejection(operation_id, scope, cheap_estimate, &cheap_err);
                return Err(cheap_err);
            }
            info!(
                operation = operation_id,
                scope,
                provider = cheapest.id(),
                "degrading to cheapest candidate under budget pressure"
            );
            estimate = cheap_estimate;
            candidates = vec![cheapest];
            degraded = true;
        }

        // 6-7. Invoke candidates in order until one succeeds.
        self.invoke_candidates(&op, scope, params, estimate, candidates, degraded, approval_id)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn invoke_candidates(
        &self,
        op: &OperationDef,
        scope: &str,
        params: &serde_json::Value,
        estimate: CostRange,
        candidates: Vec<Arc<dyn Provider>>,
        degraded: bool,
        approval_id: Option<Uuid>,
    ) -> Result<RouteResult> {
        if candidates.is_empty() {
            let err = ControlError::CandidatesExhausted {
                operation: op.id.clone(),
            };
            self.record_rejection(&op.id, scope, estimate, &err);
            return Err(err);
        }

        let mut attempts = 0u32;
        for provider in candidates {
            if attempts >= self.max_attempts {
                break;
            }
            attempts += 1;
            match provider.invoke(params).await {
                Ok(output) => {
                    let actual = output.cost_cents(provider.unit_cost_cents());
                    let rec = ExecutionRecord::success(
                        &op.id,
                        provider.id(),
                        scope,
                        estimate,
                        actual,
                        output.latency_ms,
                    );
                    self.store.insert_execution_record(&rec)?;
                    self.budget.record_spend(scope, actual)?;
                    info!(
                        operation = %op.id,
                        provider = provider.id(),
                        scope,
                        actual_cost_cents = actual,
                        degraded,
                        "invocation succeeded"
                    );
                    return Ok(RouteResult {
                        execution_id: rec.id,
                        operation_id: op.id.clone(),
                        provider_id: provider.id().to_string(),
                        output: output.output,
                        estimate,
                        actual_cost_cents: actual,
                        latency_ms: output.latency_ms,
                        degraded,
                        approval_id,
                    });
                }
                Err(err) => {
                    let rec = ExecutionRecord::failure(
                        &op.id,
                        Some(provider.id()),
                        scope,
                        estimate,
                        &err.to_string(),
                    );
                    self.store.insert_execution_record(&rec)?;
                    if err.is_transient() {
                        warn!(
                            operation = %op.id,
                            provider = provider.id(),
                            error = %err,
                            "provider failed, trying next candidate"
                        );
                        continue;
                    }
                    return Err(err);
                }
            }
        }
        Err(ControlError::CandidatesExhausted {
            operation: op.id.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Catalog, OperationDef};
    use crate::notify::Notifier;
    use crate::provider::StaticProvider;
    use crate::store::{BudgetPeriod, ExecStatus};

    fn operation(id: &str, candidates: &[&str]) -> OperationDef {
        OperationDef {
            id: id.to_string(),
            tier: CostTier::Low,
            candidates: candidates.iter().map(|c| c.to_string()).collect(),
            quality_threshold: 0.0,
            enabled: true,
            requires_approval: false,
            degrade_on_budget: false,
            toggle: None,
        }
    }

    struct Fixture {
        router: Router,
        store: Arc<Store>,
    }

    fn fixture(ops: Vec<OperationDef>, providers: Vec<StaticProvider>, limit: f64) -> Fixture {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store
            .ensure_budget_scope("user:1", BudgetPeriod::Monthly, limit, 0.8)
            .unwrap();
        let catalog = Arc::new(CatalogStore::from_catalog(Catalog {
            operations: ops,
            providers: vec![],
            toggles: vec![],
            schedules: vec![],
        }));
        let mut registry = ProviderRegistry::new();
        for provider in providers {
            registry.register(Arc::new(provider));
        }
        let registry = Arc::new(registry);
        let estimator = CostEstimator::new(registry.clone(), 0.2);
        let budget = Arc::new(BudgetEnforcer::new(store.clone()));
        let toggles = Arc::new(ToggleRegistry::new(store.clone(), Duration::from_secs(10)));
        let approvals = Arc::new(ApprovalGate::new(
            store.clone(),
            Notifier::new(None),
            3600,
            Duration::from_millis(20),
            Duration::from_millis(5),
        ));
        let router = Router::new(
            catalog,
            registry,
            estimator,
            budget,
            toggles,
            approvals,
            store.clone(),
            Duration::from_secs(30),
            100.0,
            3,
        );
        Fixture { router, store }
    }

    #[tokio::test]
    async fn test_route_happy_path() {
        let fx = fixture(
            vec![operation("summarize", &["fast"])],
            vec![StaticProvider::new("fast", 0.5)],
            1000.0,
        );
        let result = fx.router.route("summarize", "user:1", &json!({})).await.unwrap();
        assert_eq!(result.provider_id, "fast");
        assert!(!result.degraded);
        assert!(result.actual_cost_cents > 0.0);

        let records = fx.store.list_execution_records(Some("user:1"), 10).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, ExecStatus::Success);
    }

    #[tokio::test]
    async fn test_candidate_fallback_records_every_attempt() {
        let fx = fixture(
            vec![operation("summarize", &["flaky", "steady"])],
            vec![
                StaticProvider::new("flaky", 0.5).failing_first(1),
                StaticProvider::new("steady", 0.3),
            ],
            1000.0,
        );
        let result = fx.router.route("summarize", "user:1", &json!({})).await.unwrap();
        assert_eq!(result.provider_id, "steady");

        // One failed record for the flaky attempt, one success.
        let records = fx.store.list_execution_records(Some("user:1"), 10).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records.iter().filter(|r| r.status == ExecStatus::Failed).count(), 1);
        assert_eq!(records.iter().filter(|r| r.status == ExecStatus::Success).count(), 1);
    }

    #[tokio::test]
    async fn test_all_candidates_failing_exhausts() {
        let fx = fixture(
            vec![operation("summarize", &["down"])],
            vec![StaticProvider::new("down", 0.5).always_failing()],
            1000.0,
        );
        let err = fx.router.route("summarize", "user:1", &json!({})).await.unwrap_err();
        assert!(matches!(err, ControlError::CandidatesExhausted { .. }));
    }

    #[tokio::test]
    async fn test_budget_rejection_without_degrade() {
        let fx = fixture(
            vec![operation("summarize", &["fast"])],
            vec![StaticProvider::new("fast", 0.5)],
            0.1,
        );
        let err = fx.router.route("summarize", "user:1", &json!({})).await.unwrap_err();
        assert!(matches!(err, ControlError::BudgetExceeded { .. }));
        // The rejection is recorded.
        let records = fx.store.list_execution_records(Some("user:1"), 10).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, ExecStatus::Failed);
    }

    #[tokio::test]
    async fn test_degrade_to_cheapest_candidate() {
        let mut op = operation("summarize", &["fancy", "cheap"]);
        op.degrade_on_budget = true;
        // Limit fits the cheap candidate's estimate (0.1) but not the
        // fancy one's (10.0).
        let fx = fixture(
            vec![op],
            vec![
                StaticProvider::new("fancy", 10.0),
                StaticProvider::new("cheap", 0.1),
            ],
            1.0,
        );
        let result = fx.router.route("summarize", "user:1", &json!({})).await.unwrap();
        assert!(result.degraded);
        assert_eq!(result.provider_id, "cheap");
    }

    #[tokio::test]
    async fn test_disabled_operation_rejected() {
        let mut op = operation("summarize", &["fast"]);
        op.enabled = false;
        let fx = fixture(vec![op], vec![StaticProvider::new("fast", 0.5)], 1000.0);
        let err = fx.router.route("summarize", "user:1", &json!({})).await.unwrap_err();
        assert!(matches!(err, ControlError::OperationDisabled(_)));
    }

    #[tokio::test]
    async fn test_unknown_operation_rejected() {
        let fx = fixture(vec![], vec![], 1000.0);
        let err = fx.router.route("ghost", "user:1", &json!({})).await.unwrap_err();
        assert!(matches!(err, ControlError::UnknownOperation(_)));
    }

    #[tokio::test]
    async fn test_locked_toggle_blocks_operation() {
        let mut op = operation("summarize", &["fast"]);
        op.toggle = Some("expensive_ops".to_string());
        let fx = fixture(vec![op], vec![StaticProvider::new("fast", 0.5)], 1000.0);
        fx.store
            .seed_toggle("expensive_ops", false, true, Some("platform"))
            .unwrap();
        let err = fx.router.route("summarize", "user:1", &json!({})).await.unwrap_err();
        assert!(matches!(err, ControlError::ToggleLocked { .. }));
    }

    #[tokio::test]
    async fn test_approval_timeout_blocks_invocation() {
        let mut op = operation("summarize", &["fast"]);
        op.requires_approval = true;
        let fx = fixture(vec![op], vec![StaticProvider::new("fast", 0.5)], 1000.0);
        let err = fx.router.route("summarize", "user:1", &json!({})).await.unwrap_err();
        assert!(matches!(err, ControlError::ApprovalTimeout { .. }));
        // No provider was invoked.
        let records = fx.store.list_execution_records(Some("user:1"), 10).unwrap();
        assert!(records.iter().all(|r| r.provider_id.is_none()));
    }

    #[tokio::test]
    async fn test_catalog_reload_invalidates_resolution_cache() {
        let fx = fixture(
            vec![operation("summarize", &["fast"])],
            vec![StaticProvider::new("fast", 0.5)],
            1000.0,
        );
        fx.router.route("summarize", "user:1", &json!({})).await.unwrap();

        // Replace the catalog with one where the operation is disabled.
        let mut disabled = operation("summarize", &["fast"]);
        disabled.enabled = false;
        fx.router
            .catalog
            .replace(Catalog {
                operations: vec![disabled],
                providers: vec![],
                toggles: vec![],
                schedules: vec![],
            })
            .await;

        let err = fx.router.route("summarize", "user:1", &json!({})).await.unwrap_err();
        assert!(matches!(err, ControlError::OperationDisabled(_)));
    }
}
