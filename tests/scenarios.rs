//! End-to-end scenarios across the routing, scheduling and batch layers.

use std::sync::Arc;
use std::time::Duration;

use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;
use uuid::Uuid;

use opsgate::approval::ApprovalGate;
use opsgate::batch::{BatchExecutor, BatchStepSpec};
use opsgate::budget::BudgetEnforcer;
use opsgate::config::{
    Catalog, CatalogStore, CostTier, OperationDef, ScheduleSeed,
};
use opsgate::cost::CostEstimator;
use opsgate::error::ControlError;
use opsgate::notify::Notifier;
use opsgate::provider::StaticProvider;
use opsgate::provider::ProviderRegistry;
use opsgate::router::Router;
use opsgate::scheduler::Scheduler;
use opsgate::secrets::SecretStore;
use opsgate::store::{
    now_ms, BatchMode, BatchStatus, BudgetPeriod, ExecStatus, ScheduleExecStatus, StepStatus,
    Store, TriggerKind,
};
use opsgate::toggles::ToggleRegistry;

struct ControlPlane {
    store: Arc<Store>,
    router: Arc<Router>,
    scheduler: Arc<Scheduler>,
    batches: BatchExecutor,
    _secrets_dir: tempfile::TempDir,
}

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

fn control_plane(operations: Vec<OperationDef>, providers: Vec<StaticProvider>) -> ControlPlane {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let catalog = Arc::new(CatalogStore::from_catalog(Catalog {
        operations,
        providers: vec![],
        toggles: vec![],
        schedules: vec![],
    }));
    let mut registry = ProviderRegistry::new();
    for provider in providers {
        registry.register(Arc::new(provider));
    }
    let registry = Arc::new(registry);
    let router = Arc::new(Router::new(
        Arc::clone(&catalog),
        Arc::clone(&registry),
        CostEstimator::new(Arc::clone(&registry), 0.2),
        Arc::new(BudgetEnforcer::new(Arc::clone(&store))),
        Arc::new(ToggleRegistry::new(Arc::clone(&store), Duration::from_secs(10))),
        Arc::new(ApprovalGate::new(
            Arc::clone(&store),
            Notifier::new(None),
            3600,
            Duration::from_millis(20),
            Duration::from_millis(5),
        )),
        Arc::clone(&store),
        Duration::from_secs(30),
        100.0,
        3,
    ));
    let secrets_dir = tempfile::tempdir().unwrap();
    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&store),
        Arc::clone(&router),
        Arc::clone(&catalog),
        CostEstimator::new(Arc::clone(&registry), 0.2),
        Arc::new(SecretStore::new(secrets_dir.path().to_path_buf())),
        Notifier::new(None),
        Duration::from_secs(15),
        3600,
    ));
    let batches = BatchExecutor::new(
        Arc::clone(&store),
        Arc::clone(&router),
        Arc::clone(&catalog),
        CostEstimator::new(registry, 0.2),
        5,
    );
    ControlPlane {
        store,
        router,
        scheduler,
        batches,
        _secrets_dir: secrets_dir,
    }
}

fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// A schedule firing while a fresh execution still runs is skipped and
/// never reaches a provider.
#[tokio::test]
async fn scenario_a_running_schedule_skips_second_fire() {
    let plane = control_plane(
        vec![operation("digest", &["fast"])],
        vec![StaticProvider::new("fast", 0.5)],
    );
    plane
        .store
        .ensure_budget_scope("ops", BudgetPeriod::Monthly, 10_000.0, 0.8)
        .unwrap();
    plane
        .scheduler
        .seed(&[ScheduleSeed {
            name: "digest-schedule".to_string(),
            operation_id: "digest".to_string(),
            params: json!({}),
            scope: "ops".to_string(),
            trigger: "interval".to_string(),
            interval_secs: Some(60),
            webhook_secret_ref: None,
            monthly_ceiling_cents: None,
            timezone: "UTC".to_string(),
        }])
        .unwrap();
    let schedule = plane
        .store
        .get_schedule_by_name("digest-schedule")
        .unwrap()
        .unwrap();
    assert_eq!(schedule.trigger, TriggerKind::Interval);

    // A prior execution younger than the staleness bound holds the lock.
    let prior = Uuid::new_v4();
    assert!(plane
        .store
        .try_acquire_schedule_lock(schedule.id, prior, now_ms() - 3_600_000)
        .unwrap());

    let exec = plane.scheduler.fire(schedule.id, "interval").await.unwrap();
    assert_eq!(exec.status, ScheduleExecStatus::Skipped);

    // The router was never invoked: no execution records exist.
    let records = plane.store.list_execution_records(None, 10).unwrap();
    assert!(records.is_empty());
}

/// A $5.00 monthly budget with $4.80 spent rejects a $0.25 invocation,
/// and the rejection is recorded as a failed execution.
#[tokio::test]
async fn scenario_b_budget_rejection_is_recorded() {
    // unit cost 25c, one unit -> estimate.mid = 25c.
    let plane = control_plane(
        vec![operation("enrich", &["pricey"])],
        vec![StaticProvider::new("pricey", 25.0)],
    );
    plane
        .store
        .ensure_budget_scope("team:data", BudgetPeriod::Monthly, 500.0, 0.8)
        .unwrap();
    plane.store.add_budget_spend("team:data", 480.0).unwrap();

    let err = plane
        .router
        .route("enrich", "team:data", &json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::BudgetExceeded { .. }));
    assert!(err.to_string().contains("team:data"));

    let records = plane.store.list_execution_records(Some("team:data"), 10).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, ExecStatus::Failed);
    assert!(records[0].error.as_deref().unwrap().contains("budget exceeded"));
}

/// One failing step in a parallel batch of three leaves the batch
/// completed with counts completed=2, failed=1, skipped=0.
#[tokio::test]
async fn scenario_c_parallel_batch_completes_despite_failure() {
    let plane = control_plane(
        vec![operation("ok_op", &["fast"]), operation("bad_op", &["broken"])],
        vec![
            StaticProvider::new("fast", 0.5),
            StaticProvider::new("broken", 0.5).always_failing(),
        ],
    );
    plane
        .store
        .ensure_budget_scope("ops", BudgetPeriod::Monthly, 10_000.0, 0.8)
        .unwrap();

    let spec = |op: &str| BatchStepSpec {
        operation_id: op.to_string(),
        params: json!({}),
        depends_on: None,
    };
    let view = plane
        .batches
        .create(
            BatchMode::Parallel,
            "ops",
            vec![spec("ok_op"), spec("bad_op"), spec("ok_op")],
        )
        .await
        .unwrap();
    let done = plane.batches.execute(view.batch.id).await.unwrap();

    assert_eq!(done.batch.status, BatchStatus::Completed);
    assert_eq!(done.counts.completed, 2);
    assert_eq!(done.counts.failed, 1);
    assert_eq!(done.counts.skipped, 0);
    assert_eq!(
        done.counts.completed + done.counts.failed + done.counts.skipped,
        done.counts.total
    );
}

/// Cancelling a sequential batch skips the not-yet-run steps and leaves
/// completed steps untouched.
#[tokio::test]
async fn scenario_d_cancel_sequential_batch_skips_remaining() {
    let plane = control_plane(
        vec![operation("step_op", &["fast"])],
        vec![StaticProvider::new("fast", 0.5)],
    );
    plane
        .store
        .ensure_budget_scope("ops", BudgetPeriod::Monthly, 10_000.0, 0.8)
        .unwrap();

    let spec = || BatchStepSpec {
        operation_id: "step_op".to_string(),
        params: json!({}),
        depends_on: None,
    };
    let view = plane
        .batches
        .create(BatchMode::Sequential, "ops", vec![spec(), spec(), spec(), spec()])
        .await
        .unwrap();

    // Simulate "after step 2": mark the first two steps completed, then
    // cancel before the rest run.
    for step in view.steps.iter().take(2) {
        assert!(plane.store.claim_step(step.id).unwrap());
        plane
            .store
            .finish_step(step.id, StepStatus::Completed, None, None, Some(0.5))
            .unwrap();
    }
    let cancelled = plane.batches.cancel(view.batch.id, "operator request").unwrap();

    assert_eq!(cancelled.batch.status, BatchStatus::Cancelled);
    assert_eq!(cancelled.counts.completed, 2);
    assert_eq!(cancelled.counts.skipped, 2);
    assert_eq!(cancelled.counts.failed, 0);
    assert!(cancelled
        .steps
        .iter()
        .take(2)
        .all(|s| s.status == StepStatus::Completed));
}

/// A webhook with a bad signature creates no execution, answers with a
/// verification error, and leaves an audit trail entry.
#[tokio::test]
async fn scenario_e_invalid_webhook_signature() {
    let plane = control_plane(
        vec![operation("digest", &["fast"])],
        vec![StaticProvider::new("fast", 0.5)],
    );
    std::env::set_var("SCENARIO_E_SECRET", "hook-secret");
    plane
        .scheduler
        .seed(&[ScheduleSeed {
            name: "hooked".to_string(),
            operation_id: "digest".to_string(),
            params: json!({}),
            scope: "ops".to_string(),
            trigger: "webhook".to_string(),
            interval_secs: None,
            webhook_secret_ref: Some("env:SCENARIO_E_SECRET".to_string()),
            monthly_ceiling_cents: None,
            timezone: "UTC".to_string(),
        }])
        .unwrap();

    let body = br#"{"go": true}"#;
    let bad = sign("not-the-secret", body);
    let err = plane
        .scheduler
        .trigger_webhook("hooked", body, &bad)
        .unwrap_err();
    assert!(matches!(err, ControlError::SignatureVerificationFailed { .. }));

    // No execution was created.
    let schedule = plane.store.get_schedule_by_name("hooked").unwrap().unwrap();
    assert!(plane
        .store
        .list_schedule_executions(schedule.id, 10)
        .unwrap()
        .is_empty());

    // The rejection is in the audit log.
    let audit = plane.store.list_audit(10).unwrap();
    assert!(audit.iter().any(|e| e.kind == "schedule.signature_rejected"));
}

/// Creating a batch of N steps and reading it back yields N pending steps.
#[tokio::test]
async fn batch_create_read_back_round_trip() {
    let plane = control_plane(
        vec![operation("step_op", &["fast"])],
        vec![StaticProvider::new("fast", 0.5)],
    );
    let specs: Vec<BatchStepSpec> = (0..5)
        .map(|i| BatchStepSpec {
            operation_id: "step_op".to_string(),
            params: json!({ "n": i }),
            depends_on: None,
        })
        .collect();
    let view = plane
        .batches
        .create(BatchMode::Parallel, "ops", specs)
        .await
        .unwrap();

    let read = plane.batches.view(view.batch.id).unwrap();
    assert_eq!(read.counts.total, 5);
    assert_eq!(read.steps.len(), 5);
    assert!(read.steps.iter().all(|s| s.status == StepStatus::Pending));
    assert!(read.batch.estimate.low_cents <= read.batch.estimate.mid_cents);
    assert!(read.batch.estimate.mid_cents <= read.batch.estimate.high_cents);
}
