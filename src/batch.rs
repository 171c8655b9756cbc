//! Batch execution.
//!
//! A batch groups routed operations under one id with an aggregate cost
//! estimate. Three dispatch modes:
//! - parallel: steps run in waves bounded by the worker pool size; every
//!   step of a wave settles before the next wave starts.
//! - sequential: steps run in declared order.
//! - conditional: sequential, but a step whose dependency did not
//!   complete is skipped instead of run.
//!
//! Batches continue on error: a failed step never aborts its siblings.
//! Cancellation is cooperative, checked between waves (parallel) or
//! between steps (sequential/conditional); in-flight steps settle.
//! At termination `completed + failed + skipped == total` always holds.

use futures::future::join_all;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::CatalogStore;
use crate::cost::{CostEstimator, CostRange};
use crate::error::{ControlError, Result};
use crate::router::Router;
use crate::store::{
    Batch, BatchCounts, BatchMode, BatchOperation, BatchStatus, StepStatus, Store,
};

/// Caller-supplied step definition. `depends_on` indexes an earlier step
/// in the same request (conditional mode only).
#[derive(Debug, Clone, Deserialize)]
pub struct BatchStepSpec {
    pub operation_id: String,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub depends_on: Option<usize>,
}

/// Full batch state returned to callers.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BatchView {
    pub batch: Batch,
    pub steps: Vec<BatchOperation>,
    pub counts: BatchCounts,
}

pub struct BatchExecutor {
    store: Arc<Store>,
    router: Arc<Router>,
    catalog: Arc<CatalogStore>,
    estimator: CostEstimator,
    concurrency: usize,
}

impl BatchExecutor {
    pub fn new(
        store: Arc<Store>,
        router: Arc<Router>,
        catalog: Arc<CatalogStore>,
        estimator: CostEstimator,
        concurrency: usize,
    ) -> Self {
        Self {
            store,
            router,
            catalog,
            estimator,
            concurrency: concurrency.max(1),
        }
    }

    /// Create a batch in `queued` state with a per-step validated spec
    /// and an aggregate estimate. Unknown operations and forward or
    /// self-referencing dependencies are rejected up front.
    pub async fn create(
        &self,
        mode: BatchMode,
        scope: &str,
        specs: Vec<BatchStepSpec>,
    ) -> Result<BatchView> {
        if specs.is_empty() {
            return Err(ControlError::Config("batch has no steps".to_string()));
        }
        let catalog = self.catalog.get().await;
        let batch_id = Uuid::new_v4();
        let mut estimate = CostRange::zero();
        let mut step_ids: Vec<Uuid> = Vec::with_capacity(specs.len());
        let mut steps = Vec::with_capacity(specs.len());

        for (idx, spec) in specs.iter().enumerate() {
            let op = catalog
                .operation(&spec.operation_id)
                .ok_or_else(|| ControlError::UnknownOperation(spec.operation_id.clone()))?;
            estimate = estimate.add(&self.estimator.estimate(op, &spec.params)?);

            let depends_on = match spec.depends_on {
                Some(dep) if mode != BatchMode::Conditional => {
                    return Err(ControlError::Config(format!(
                        "step {idx}: depends_on={dep} is only valid in conditional mode"
                    )));
                }
                Some(dep) if dep >= idx => {
                    return Err(ControlError::Config(format!(
                        "step {idx}: depends_on={dep} must reference an earlier step"
                    )));
                }
                Some(dep) => Some(step_ids[dep]),
                None => None,
            };

            let step_id = Uuid::new_v4();
            step_ids.push(step_id);
            steps.push(BatchOperation {
                id: step_id,
                batch_id,
                operation_id: spec.operation_id.clone(),
                params: spec.params.clone(),
                seq: idx as i64,
                depends_on,
                status: StepStatus::Pending,
                result: None,
                error: None,
                cost_cents: None,
            });
        }

        let batch = Batch {
            id: batch_id,
            mode,
            scope: scope.to_string(),
            status: BatchStatus::Queued,
            cancel_reason: None,
            estimate,
            actual_cost_cents: None,
            created_at: chrono::Utc::now(),
            finished_at: None,
        };
        self.store.insert_batch(&batch, &steps)?;
        info!(batch = %batch_id, mode = %mode, steps = steps.len(), "batch created");
        self.view(batch_id)
    }

    /// Run a queued batch to completion. Exactly one caller wins the
    /// queued-to-running transition; a second call observes `BatchState`.
    pub async fn execute(&self, batch_id: Uuid) -> Result<BatchView> {
        let batch = self.load(batch_id)?;
        if !self
            .store
            .transition_batch(batch_id, &[BatchStatus::Queued], BatchStatus::Running, None)?
        {
            return Err(ControlError::BatchState {
                batch_id: batch_id.to_string(),
                status: batch.status.as_str().to_string(),
                expected: "queued",
            });
        }

        let steps = self.store.batch_operations(batch_id)?;
        match batch.mode {
            BatchMode::Parallel => self.run_parallel(&batch, &steps).await?,
            BatchMode::Sequential => self.run_ordered(&batch, &steps, false).await?,
            BatchMode::Conditional => self.run_ordered(&batch, &steps, true).await?,
        }

        self.settle(batch_id)
    }

    /// Cancel a batch. Pending steps are skipped immediately; running
    /// steps settle on their own and keep their outcome.
    pub fn cancel(&self, batch_id: Uuid, reason: &str) -> Result<BatchView> {
        let batch = self.load(batch_id)?;
        if !self.store.transition_batch(
            batch_id,
            &[BatchStatus::Queued, BatchStatus::Running],
            BatchStatus::Cancelled,
            Some(reason),
        )? {
            return Err(ControlError::BatchState {
                batch_id: batch_id.to_string(),
                status: batch.status.as_str().to_string(),
                expected: "queued or running",
            });
        }
        let skipped = self.store.skip_pending_steps(batch_id)?;
        info!(batch = %batch_id, reason, skipped, "batch cancelled");
        self.store.insert_audit(
            "batch.cancelled",
            &batch_id.to_string(),
            &format!("reason={reason} skipped={skipped}"),
        )?;
        self.view(batch_id)
    }

    pub fn view(&self, batch_id: Uuid) -> Result<BatchView> {
        let batch = self.load(batch_id)?;
        let steps = self.store.batch_operations(batch_id)?;
        let counts = self.store.batch_counts(batch_id)?;
        Ok(BatchView {
            batch,
            steps,
            counts,
        })
    }

    fn load(&self, batch_id: Uuid) -> Result<Batch> {
        self.store.get_batch(batch_id)?.ok_or(ControlError::NotFound {
            kind: "batch",
            id: batch_id.to_string(),
        })
    }

    fn cancelled(&self, batch_id: Uuid) -> Result<bool> {
        Ok(self
            .store
            .get_batch(batch_id)?
            .map(|b| b.status == BatchStatus::Cancelled)
            .unwrap_or(false))
    }

    async fn run_parallel(&self, batch: &Batch, steps: &[BatchOperation]) -> Result<()> {
        for wave in steps.chunks(self.concurrency) {
            if self.cancelled(batch.id)? {
                self.store.skip_pending_steps(batch.id)?;
                break;
            }
            let futures = wave.iter().map(|step| self.run_step(batch, step, None));
            // The whole wave settles before the next one starts, so the
            // worker pool never holds more than `concurrency` in flight.
            for result in join_all(futures).await {
                result?;
            }
        }
        Ok(())
    }

    async fn run_ordered(
        &self,
        batch: &Batch,
        steps: &[BatchOperation],
        conditional: bool,
    ) -> Result<()> {
        let mut outcomes: HashMap<Uuid, StepStatus> = HashMap::new();
        for step in steps {
            if self.cancelled(batch.id)? {
                self.store.skip_pending_steps(batch.id)?;
                break;
            }
            let dep_status = if conditional {
                step.depends_on.map(|dep| {
                    outcomes
                        .get(&dep)
                        .copied()
                        .unwrap_or(StepStatus::Skipped)
                })
            } else {
                None
            };
            let status = self.run_step(batch, step, dep_status).await?;
            outcomes.insert(step.id, status);
        }
        Ok(())
    }

    /// Execute one step: claim it, honor its dependency, route, settle.
    /// Returns the terminal status the step reached.
    async fn run_step(
        &self,
        batch: &Batch,
        step: &BatchOperation,
        dep_status: Option<StepStatus>,
    ) -> Result<StepStatus> {
        if !self.store.claim_step(step.id)? {
            // Cancelled away or already handled.
            return Ok(StepStatus::Skipped);
        }
        if let Some(dep) = dep_status {
            if dep != StepStatus::Completed {
                self.store.finish_step(
                    step.id,
                    StepStatus::Skipped,
                    None,
                    Some(&format!("dependency finished {dep}, not completed")),
                    None,
                )?;
                return Ok(StepStatus::Skipped);
            }
        }
        match self
            .router
            .route(&step.operation_id, &batch.scope, &step.params)
            .await
        {
            Ok(result) => {
                self.store.finish_step(
                    step.id,
                    StepStatus::Completed,
                    Some(&json!({
                        "execution_id": result.execution_id,
                        "provider_id": result.provider_id,
                        "output": result.output,
                    })),
                    None,
                    Some(result.actual_cost_cents),
                )?;
                Ok(StepStatus::Completed)
            }
            Err(err) => {
                // Continue-on-error: the failure is recorded on the step
                // and the batch carries on.
                warn!(batch = %batch.id, step = %step.id, error = %err, "batch step failed");
                self.store
                    .finish_step(step.id, StepStatus::Failed, None, Some(&err.to_string()), None)?;
                Ok(StepStatus::Failed)
            }
        }
    }

    /// Write the terminal batch status from the step outcomes.
    fn settle(&self, batch_id: Uuid) -> Result<BatchView> {
        let counts = self.store.batch_counts(batch_id)?;
        debug_assert_eq!(
            counts.completed + counts.failed + counts.skipped,
            counts.total
        );
        let actual = self.store.batch_actual_cost(batch_id)?;
        // Continue-on-error: step failures stay on the steps. A run that
        // finished without cancellation settles as completed no matter how
        // many steps failed; the counts carry the detail.
        let status = if self.cancelled(batch_id)? {
            BatchStatus::Cancelled
        } else {
            BatchStatus::Completed
        };
        self.store.finish_batch(batch_id, status, actual)?;
        info!(
            batch = %batch_id,
            completed = counts.completed,
            failed = counts.failed,
            skipped = counts.skipped,
            actual_cost_cents = actual,
            "batch settled"
        );
        self.view(batch_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::ApprovalGate;
    use crate::budget::BudgetEnforcer;
    use crate::config::{Catalog, CostTier, OperationDef};
    use crate::notify::Notifier;
    use crate::provider::StaticProvider;
    use crate::provider::ProviderRegistry;
    use crate::store::BudgetPeriod;
    use crate::toggles::ToggleRegistry;
    use std::time::Duration;

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

    fn executor(providers: Vec<StaticProvider>) -> BatchExecutor {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store
            .ensure_budget_scope("team:a", BudgetPeriod::Monthly, 100_000.0, 0.8)
            .unwrap();
        let catalog = Arc::new(CatalogStore::from_catalog(Catalog {
            operations: vec![
                operation("summarize", &["fast"]),
                operation("classify", &["broken"]),
            ],
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
        let router = Arc::new(Router::new(
            catalog.clone(),
            registry.clone(),
            CostEstimator::new(registry, 0.2),
            Arc::new(BudgetEnforcer::new(store.clone())),
            Arc::new(ToggleRegistry::new(store.clone(), Duration::from_secs(10))),
            Arc::new(ApprovalGate::new(
                store.clone(),
                Notifier::new(None),
                3600,
                Duration::from_millis(20),
                Duration::from_millis(5),
            )),
            store.clone(),
            Duration::from_secs(30),
            100.0,
            3,
        ));
        BatchExecutor::new(store, router, catalog, estimator, 2)
    }

    fn step(op: &str) -> BatchStepSpec {
        BatchStepSpec {
            operation_id: op.to_string(),
            params: json!({}),
            depends_on: None,
        }
    }

    #[tokio::test]
    async fn test_parallel_batch_completes() {
        let exec = executor(vec![StaticProvider::new("fast", 0.5)]);
        let view = exec
            .create(
                BatchMode::Parallel,
                "team:a",
                vec![step("summarize"), step("summarize"), step("summarize")],
            )
            .await
            .unwrap();
        assert_eq!(view.batch.estimate.mid_cents, 1.5);

        let done = exec.execute(view.batch.id).await.unwrap();
        assert_eq!(done.batch.status, BatchStatus::Completed);
        assert_eq!(done.counts.completed, 3);
        assert_eq!(
            done.counts.completed + done.counts.failed + done.counts.skipped,
            done.counts.total
        );
        assert!(done.batch.actual_cost_cents.unwrap() > 0.0);
    }

    #[tokio::test]
    async fn test_continue_on_error() {
        let exec = executor(vec![
            StaticProvider::new("fast", 0.5),
            StaticProvider::new("broken", 0.5).always_failing(),
        ]);
        let view = exec
            .create(
                BatchMode::Sequential,
                "team:a",
                vec![step("summarize"), step("classify"), step("summarize")],
            )
            .await
            .unwrap();
        let done = exec.execute(view.batch.id).await.unwrap();
        // The failed middle step does not stop the third, and does not
        // fail the batch.
        assert_eq!(done.batch.status, BatchStatus::Completed);
        assert_eq!(done.counts.completed, 2);
        assert_eq!(done.counts.failed, 1);
        assert_eq!(
            done.counts.completed + done.counts.failed + done.counts.skipped,
            done.counts.total
        );
    }

    #[tokio::test]
    async fn test_all_steps_failing_still_settles_completed() {
        let exec = executor(vec![StaticProvider::new("broken", 0.5).always_failing()]);
        let view = exec
            .create(
                BatchMode::Parallel,
                "team:a",
                vec![step("classify"), step("classify")],
            )
            .await
            .unwrap();
        let done = exec.execute(view.batch.id).await.unwrap();
        // No cancellation happened, so the batch itself is completed even
        // though every step failed.
        assert_eq!(done.batch.status, BatchStatus::Completed);
        assert_eq!(done.counts.completed, 0);
        assert_eq!(done.counts.failed, 2);
    }

    #[tokio::test]
    async fn test_conditional_skips_dependents_of_failure() {
        let exec = executor(vec![
            StaticProvider::new("fast", 0.5),
            StaticProvider::new("broken", 0.5).always_failing(),
        ]);
        let specs = vec![
            step("classify"), // fails
            BatchStepSpec {
                operation_id: "summarize".to_string(),
                params: json!({}),
                depends_on: Some(0),
            },
            step("summarize"), // independent, still runs
        ];
        let view = exec.create(BatchMode::Conditional, "team:a", specs).await.unwrap();
        let done = exec.execute(view.batch.id).await.unwrap();
        assert_eq!(done.counts.failed, 1);
        assert_eq!(done.counts.skipped, 1);
        assert_eq!(done.counts.completed, 1);
        let dependent = &done.steps[1];
        assert_eq!(dependent.status, StepStatus::Skipped);
        assert!(dependent.error.as_deref().unwrap().contains("dependency"));
    }

    #[tokio::test]
    async fn test_execute_twice_rejected() {
        let exec = executor(vec![StaticProvider::new("fast", 0.5)]);
        let view = exec
            .create(BatchMode::Sequential, "team:a", vec![step("summarize")])
            .await
            .unwrap();
        exec.execute(view.batch.id).await.unwrap();
        let err = exec.execute(view.batch.id).await.unwrap_err();
        assert!(matches!(err, ControlError::BatchState { .. }));
    }

    #[tokio::test]
    async fn test_cancel_skips_pending_steps() {
        let exec = executor(vec![StaticProvider::new("fast", 0.5)]);
        let view = exec
            .create(
                BatchMode::Sequential,
                "team:a",
                vec![step("summarize"), step("summarize")],
            )
            .await
            .unwrap();
        let cancelled = exec.cancel(view.batch.id, "operator request").unwrap();
        assert_eq!(cancelled.batch.status, BatchStatus::Cancelled);
        assert_eq!(cancelled.counts.skipped, 2);
        assert_eq!(
            cancelled.counts.completed + cancelled.counts.failed + cancelled.counts.skipped,
            cancelled.counts.total
        );

        // A cancelled batch cannot be executed.
        let err = exec.execute(view.batch.id).await.unwrap_err();
        assert!(matches!(err, ControlError::BatchState { .. }));
    }

    #[tokio::test]
    async fn test_forward_dependency_rejected() {
        let exec = executor(vec![StaticProvider::new("fast", 0.5)]);
        let specs = vec![
            BatchStepSpec {
                operation_id: "summarize".to_string(),
                params: json!({}),
                depends_on: Some(1),
            },
            step("summarize"),
        ];
        let err = exec
            .create(BatchMode::Conditional, "team:a", specs)
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Config(_)));
    }

    #[tokio::test]
    async fn test_unknown_operation_rejected_at_create() {
        let exec = executor(vec![StaticProvider::new("fast", 0.5)]);
        let err = exec
            .create(BatchMode::Parallel, "team:a", vec![step("ghost")])
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::UnknownOperation(_)));
    }
}
