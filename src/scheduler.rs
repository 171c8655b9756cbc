//! Durable schedule execution.
//!
//! All schedule state lives in the store; the scheduler itself is
//! stateless and safe to restart at any point. Double firing is
//! prevented by the `running_execution_id` lock on the schedule row,
//! acquired with create-if-not-running semantics and a staleness bound
//! so a crashed run cannot wedge a schedule forever. On startup a
//! recovery scan clears abandoned locks and marks their executions
//! failed.

use chrono::{Datelike, Duration as ChronoDuration, TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde::Serialize;
use serde_json::json;
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cost::{CostEstimator, CostRange};
use crate::error::{ControlError, Result};
use crate::notify::Notifier;
use crate::router::Router;
use crate::secrets::SecretStore;
use crate::store::{
    now_ms, Schedule, ScheduleExecStatus, ScheduleExecution, Store, TriggerKind,
};
use crate::config::{CatalogStore, ScheduleSeed};

type HmacSha256 = Hmac<Sha256>;

/// Point-in-time scheduler summary.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerHealth {
    pub schedules_total: usize,
    pub schedules_enabled: usize,
    pub locked: usize,
    pub executions_by_status: Vec<(ScheduleExecStatus, i64)>,
}

pub struct Scheduler {
    store: Arc<Store>,
    router: Arc<Router>,
    catalog: Arc<CatalogStore>,
    estimator: CostEstimator,
    secrets: Arc<SecretStore>,
    notifier: Notifier,
    tick: Duration,
    stale_secs: i64,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        router: Arc<Router>,
        catalog: Arc<CatalogStore>,
        estimator: CostEstimator,
        secrets: Arc<SecretStore>,
        notifier: Notifier,
        tick: Duration,
        stale_secs: i64,
    ) -> Self {
        Self {
            store,
            router,
            catalog,
            estimator,
            secrets,
            notifier,
            tick,
            stale_secs,
        }
    }

    fn stale_before(&self) -> i64 {
        now_ms() - self.stale_secs * 1000
    }

    /// Insert catalog-declared schedules by name; existing rows keep
    /// their state (enabled flag, run history, lock) across restarts.
    pub fn seed(&self, seeds: &[ScheduleSeed]) -> Result<()> {
        for seed in seeds {
            if self.store.get_schedule_by_name(&seed.name)?.is_some() {
                continue;
            }
            let trigger = TriggerKind::parse(&seed.trigger).ok_or_else(|| {
                ControlError::Config(format!(
                    "schedule '{}': unknown trigger '{}'",
                    seed.name, seed.trigger
                ))
            })?;
            if trigger == TriggerKind::Interval && seed.interval_secs.is_none() {
                return Err(ControlError::Config(format!(
                    "schedule '{}': interval trigger requires interval_secs",
                    seed.name
                )));
            }
            let next_run_at = seed
                .interval_secs
                .filter(|_| trigger == TriggerKind::Interval)
                .map(|secs| Utc::now() + ChronoDuration::seconds(secs));
            let schedule = Schedule {
                id: Uuid::new_v4(),
                name: seed.name.clone(),
                operation_id: seed.operation_id.clone(),
                params: seed.params.clone(),
                scope: seed.scope.clone(),
                trigger,
                interval_secs: seed.interval_secs,
                webhook_secret_ref: seed.webhook_secret_ref.clone(),
                enabled: true,
                timezone: seed.timezone.clone(),
                monthly_ceiling_cents: seed.monthly_ceiling_cents,
                last_run_at: None,
                next_run_at,
                running_execution_id: None,
                running_since: None,
            };
            self.store.insert_schedule(&schedule)?;
            info!(schedule = %schedule.name, trigger = %schedule.trigger, "schedule seeded");
        }
        Ok(())
    }

    /// Clear locks abandoned by a previous process and fail their
    /// executions. Run once before serving. Returns the number of
    /// schedules recovered.
    pub fn recover(&self) -> Result<usize> {
        let cutoff = self.stale_before();
        let mut recovered = 0;
        for schedule in self.store.list_schedules()? {
            let Some(exec_id) = schedule.running_execution_id else {
                continue;
            };
            let stale = schedule
                .running_since
                .map(|since| since.timestamp_millis() < cutoff)
                .unwrap_or(true);
            if !stale {
                continue;
            }
            self.store.update_schedule_execution(
                exec_id,
                ScheduleExecStatus::Failed,
                None,
                None,
                Some("abandoned by a previous process"),
                None,
            )?;
            self.store.release_schedule_lock(schedule.id, exec_id)?;
            self.store.insert_audit(
                "schedule.recovered",
                &schedule.name,
                &format!("execution {exec_id} abandoned, lock cleared"),
            )?;
            warn!(schedule = %schedule.name, execution = %exec_id, "recovered abandoned execution");
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Verify an HMAC-SHA256 webhook signature over the raw body. The
    /// secret is loaded fresh on every call so rotations take effect
    /// without restart.
    pub fn verify_webhook(&self, schedule: &Schedule, body: &[u8], signature_hex: &str) -> Result<()> {
        let reject = || ControlError::SignatureVerificationFailed {
            schedule_id: schedule.id.to_string(),
        };
        let secret_ref = schedule.webhook_secret_ref.as_deref().ok_or_else(reject)?;
        let secret = self.secrets.load(secret_ref)?;
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|_| reject())?;
        mac.update(body);
        let signature = hex::decode(signature_hex.trim()).map_err(|_| reject())?;
        mac.verify_slice(&signature).map_err(|_| reject())
    }

    /// Handle an inbound webhook: verify the signature, enqueue an
    /// execution and return its id without waiting for the run.
    pub fn trigger_webhook(
        self: &Arc<Self>,
        schedule_name: &str,
        body: &[u8],
        signature_hex: &str,
    ) -> Result<Uuid> {
        let schedule = self
            .store
            .get_schedule_by_name(schedule_name)?
            .ok_or_else(|| ControlError::NotFound {
                kind: "schedule",
                id: schedule_name.to_string(),
            })?;
        if schedule.trigger != TriggerKind::Webhook {
            return Err(ControlError::Config(format!(
                "schedule '{}' is not webhook-triggered",
                schedule.name
            )));
        }
        // A paused schedule honors no trigger, webhook included.
        if !schedule.enabled {
            return Err(ControlError::OperationDisabled(schedule.name.clone()));
        }
        if let Err(err) = self.verify_webhook(&schedule, body, signature_hex) {
            self.store.insert_audit(
                "schedule.signature_rejected",
                &schedule.name,
                "webhook signature verification failed",
            )?;
            warn!(schedule = %schedule.name, "webhook signature rejected");
            return Err(err);
        }
        let exec = self.prepare_execution(&schedule, "webhook")?;
        let this = Arc::clone(self);
        let exec_id = exec.id;
        tokio::spawn(async move {
            if let Err(err) = this.execute(&schedule, exec_id).await {
                error!(schedule = %schedule.name, execution = %exec_id, error = %err, "webhook execution failed");
            }
        });
        Ok(exec_id)
    }

    /// Fire a schedule and wait for the outcome (manual triggers, the
    /// interval loop).
    pub async fn fire(&self, schedule_id: Uuid, trigger_source: &str) -> Result<ScheduleExecution> {
        let schedule = self
            .store
            .get_schedule(schedule_id)?
            .ok_or_else(|| ControlError::NotFound {
                kind: "schedule",
                id: schedule_id.to_string(),
            })?;
        if !schedule.enabled {
            return Err(ControlError::OperationDisabled(schedule.name.clone()));
        }
        let exec = self.prepare_execution(&schedule, trigger_source)?;
        self.execute(&schedule, exec.id).await
    }

    fn prepare_execution(&self, schedule: &Schedule, trigger_source: &str) -> Result<ScheduleExecution> {
        let exec = ScheduleExecution {
            id: Uuid::new_v4(),
            schedule_id: schedule.id,
            status: ScheduleExecStatus::Pending,
            estimate: None,
            actual_cost_cents: None,
            trigger_source: trigger_source.to_string(),
            error: None,
            started_at: None,
            finished_at: None,
            duration_ms: None,
            created_at: Utc::now(),
        };
        self.store.insert_schedule_execution(&exec)?;
        Ok(exec)
    }

    /// Run one prepared execution: take the dedup lock, check the
    /// monthly ceiling, route, settle. Exactly one terminal status is
    /// written, and the lock is released on every path after acquisition.
    async fn execute(&self, schedule: &Schedule, exec_id: Uuid) -> Result<ScheduleExecution> {
        if !self
            .store
            .try_acquire_schedule_lock(schedule.id, exec_id, self.stale_before())?
        {
            self.store.update_schedule_execution(
                exec_id,
                ScheduleExecStatus::Skipped,
                None,
                None,
                Some("another execution is running"),
                None,
            )?;
            self.store.insert_audit(
                "schedule.skipped",
                &schedule.name,
                &format!("execution {exec_id} skipped, dedup lock held"),
            )?;
            info!(schedule = %schedule.name, execution = %exec_id, "skipped, schedule already running");
            return self.load_execution(exec_id);
        }

        let outcome = self.run_locked(schedule, exec_id).await;
        self.store.release_schedule_lock(schedule.id, exec_id)?;
        outcome?;
        self.load_execution(exec_id)
    }

    async fn run_locked(&self, schedule: &Schedule, exec_id: Uuid) -> Result<()> {
        if let Some(ceiling) = schedule.monthly_ceiling_cents {
            let estimate = match self.estimate(schedule).await {
                Ok(estimate) => estimate,
                Err(err) => {
                    self.store.update_schedule_execution(
                        exec_id,
                        ScheduleExecStatus::Failed,
                        None,
                        None,
                        Some(&err.to_string()),
                        None,
                    )?;
                    return Err(err);
                }
            };
            let now = Utc::now();
            let month_start = Utc
                .with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
                .single()
                .map(|d| d.timestamp_millis())
                .unwrap_or(0);
            let spent = self.store.schedule_spend_since(schedule.id, month_start)?;
            // The ceiling covers the prospective run too: an estimate that
            // would push the month over is rejected before spending.
            if spent + estimate.mid_cents > ceiling {
                let err = ControlError::ScheduleCeilingExceeded {
                    schedule_id: schedule.id.to_string(),
                    ceiling_cents: ceiling,
                    spent_cents: spent,
                };
                self.store.update_schedule_execution(
                    exec_id,
                    ScheduleExecStatus::Failed,
                    Some(estimate),
                    None,
                    Some(&err.to_string()),
                    None,
                )?;
                self.store.insert_audit(
                    "schedule.ceiling",
                    &schedule.name,
                    &format!(
                        "monthly ceiling {ceiling:.2}c reached, spent {spent:.2}c, estimated {:.2}c",
                        estimate.mid_cents
                    ),
                )?;
                return Err(err);
            }
        }

        self.store.mark_execution_running(exec_id)?;
        let started = std::time::Instant::now();
        let routed = self
            .router
            .route(&schedule.operation_id, &schedule.scope, &schedule.params)
            .await;
        let duration_ms = started.elapsed().as_millis() as i64;
        self.advance_run_times(schedule)?;

        match routed {
            Ok(result) => {
                self.store.update_schedule_execution(
                    exec_id,
                    ScheduleExecStatus::Success,
                    Some(result.estimate),
                    Some(result.actual_cost_cents),
                    None,
                    Some(duration_ms),
                )?;
                info!(
                    schedule = %schedule.name,
                    execution = %exec_id,
                    provider = %result.provider_id,
                    duration_ms,
                    "schedule execution succeeded"
                );
                self.notifier.send(
                    "schedule.succeeded",
                    json!({ "schedule": schedule.name, "execution_id": exec_id }),
                );
                Ok(())
            }
            Err(err) => {
                self.store.update_schedule_execution(
                    exec_id,
                    ScheduleExecStatus::Failed,
                    None,
                    None,
                    Some(&err.to_string()),
                    Some(duration_ms),
                )?;
                self.store.insert_audit(
                    "schedule.failed",
                    &schedule.name,
                    &format!("execution {exec_id}: {err}"),
                )?;
                warn!(schedule = %schedule.name, execution = %exec_id, error = %err, "schedule execution failed");
                self.notifier.send(
                    "schedule.failed",
                    json!({ "schedule": schedule.name, "execution_id": exec_id, "error": err.to_string() }),
                );
                Err(err)
            }
        }
    }

    async fn estimate(&self, schedule: &Schedule) -> Result<CostRange> {
        let catalog = self.catalog.get().await;
        let op = catalog
            .operation(&schedule.operation_id)
            .ok_or_else(|| ControlError::UnknownOperation(schedule.operation_id.clone()))?;
        self.estimator.estimate(op, &schedule.params)
    }

    /// Record the run and advance `next_run_at` for interval schedules,
    /// whether the run succeeded or failed, so a failing schedule does
    /// not hot-loop.
    fn advance_run_times(&self, schedule: &Schedule) -> Result<()> {
        let next = schedule
            .interval_secs
            .filter(|_| schedule.trigger == TriggerKind::Interval)
            .map(|secs| now_ms() + secs * 1000);
        self.store.record_schedule_run(schedule.id, now_ms(), next)
    }

    fn load_execution(&self, exec_id: Uuid) -> Result<ScheduleExecution> {
        self.store
            .get_schedule_execution(exec_id)?
            .ok_or_else(|| ControlError::NotFound {
                kind: "schedule execution",
                id: exec_id.to_string(),
            })
    }

    pub fn health(&self) -> Result<SchedulerHealth> {
        let schedules = self.store.list_schedules()?;
        Ok(SchedulerHealth {
            schedules_total: schedules.len(),
            schedules_enabled: schedules.iter().filter(|s| s.enabled).count(),
            locked: schedules
                .iter()
                .filter(|s| s.running_execution_id.is_some())
                .count(),
            executions_by_status: self.store.schedule_execution_counts()?,
        })
    }

    /// Interval loop: fire every due schedule once per tick. Runs until
    /// the task is dropped at shutdown.
    pub async fn run_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let due = match self.store.due_schedules(now_ms()) {
                Ok(due) => due,
                Err(err) => {
                    error!(error = %err, "failed to query due schedules");
                    continue;
                }
            };
            for schedule in due {
                if let Err(err) = self.fire(schedule.id, "interval").await {
                    // Already recorded against the execution; keep ticking.
                    warn!(schedule = %schedule.name, error = %err, "interval fire failed");
                }
            }
        }
    }
}
