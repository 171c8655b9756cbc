//! Durable SQLite store.
//!
//! The store is the single source of truth for every control-plane
//! decision: execution records, budget scopes, approvals, schedules and
//! their dedup locks, batches and steps, feature toggles, audit events.
//! No in-process mutable state is authoritative.
//!
//! Concurrency discipline: mutations are scoped by primary key with
//! optimistic semantics — guarded `UPDATE ... WHERE <expected prior state>`
//! statements whose affected-row count decides whether the transition won.
//! The schedule dedup lock (`running_execution_id`) and batch/step status
//! transitions all go through this path.

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, ToSql};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::cost::CostRange;
use crate::error::Result;

/// Current wall-clock time in unix milliseconds (store representation).
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Convert store milliseconds back to a UTC timestamp.
pub fn ms_to_dt(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

macro_rules! sql_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }

            pub fn parse(value: &str) -> Option<Self> {
                match value {
                    $($text => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let text = value.as_str()?;
                Self::parse(text).ok_or(FromSqlError::InvalidType)
            }
        }
    };
}

sql_enum!(ExecStatus {
    Success => "success",
    Failed => "failed",
});

sql_enum!(BudgetPeriod {
    Daily => "daily",
    Monthly => "monthly",
});

sql_enum!(ApprovalStatus {
    Pending => "pending",
    Approved => "approved",
    Rejected => "rejected",
    Expired => "expired",
});

sql_enum!(TriggerKind {
    Interval => "interval",
    Webhook => "webhook",
    Manual => "manual",
});

sql_enum!(ScheduleExecStatus {
    Pending => "pending",
    Running => "running",
    Success => "success",
    Failed => "failed",
    Skipped => "skipped",
});

sql_enum!(BatchMode {
    Parallel => "parallel",
    Sequential => "sequential",
    Conditional => "conditional",
});

sql_enum!(BatchStatus {
    Queued => "queued",
    Running => "running",
    Completed => "completed",
    Failed => "failed",
    Cancelled => "cancelled",
});

impl BatchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

sql_enum!(StepStatus {
    Pending => "pending",
    Running => "running",
    Completed => "completed",
    Failed => "failed",
    Skipped => "skipped",
});

/// One completed (or failed) invocation attempt. Append-only.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub operation_id: String,
    pub provider_id: Option<String>,
    pub scope: String,
    pub estimate: CostRange,
    pub actual_cost_cents: Option<f64>,
    pub latency_ms: Option<i64>,
    pub status: ExecStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ExecutionRecord {
    pub fn success(
        operation_id: &str,
        provider_id: &str,
        scope: &str,
        estimate: CostRange,
        actual_cost_cents: f64,
        latency_ms: i64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            operation_id: operation_id.to_string(),
            provider_id: Some(provider_id.to_string()),
            scope: scope.to_string(),
            estimate,
            actual_cost_cents: Some(actual_cost_cents),
            latency_ms: Some(latency_ms),
            status: ExecStatus::Success,
            error: None,
            created_at: Utc::now(),
        }
    }

    pub fn failure(
        operation_id: &str,
        provider_id: Option<&str>,
        scope: &str,
        estimate: CostRange,
        error: &str,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            operation_id: operation_id.to_string(),
            provider_id: provider_id.map(|p| p.to_string()),
            scope: scope.to_string(),
            estimate,
            actual_cost_cents: None,
            latency_ms: None,
            status: ExecStatus::Failed,
            error: Some(error.to_string()),
            created_at: Utc::now(),
        }
    }
}

/// Per-scope budget row. Mutated only by the budget enforcer.
#[derive(Debug, Clone, Serialize)]
pub struct BudgetScope {
    pub scope: String,
    pub period: BudgetPeriod,
    pub limit_cents: f64,
    pub warn_ratio: f64,
    pub spent_cents: f64,
    pub op_count: i64,
    pub last_reset: DateTime<Utc>,
}

/// Human-in-the-loop approval request.
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalRequest {
    pub id: Uuid,
    pub operation_id: String,
    pub scope: String,
    pub context: String,
    pub estimate: CostRange,
    pub status: ApprovalStatus,
    pub requester: String,
    pub decided_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

/// Durable schedule definition. `running_execution_id` doubles as the
/// dedup lock; `running_since` bounds its staleness.
#[derive(Debug, Clone, Serialize)]
pub struct Schedule {
    pub id: Uuid,
    pub name: String,
    pub operation_id: String,
    pub params: serde_json::Value,
    pub scope: String,
    pub trigger: TriggerKind,
    pub interval_secs: Option<i64>,
    pub webhook_secret_ref: Option<String>,
    pub enabled: bool,
    pub timezone: String,
    pub monthly_ceiling_cents: Option<f64>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub running_execution_id: Option<Uuid>,
    pub running_since: Option<DateTime<Utc>>,
}

/// One firing of a schedule.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleExecution {
    pub id: Uuid,
    pub schedule_id: Uuid,
    pub status: ScheduleExecStatus,
    pub estimate: Option<CostRange>,
    pub actual_cost_cents: Option<f64>,
    pub trigger_source: String,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// A caller-defined group of operations executed as one unit.
#[derive(Debug, Clone, Serialize)]
pub struct Batch {
    pub id: Uuid,
    pub mode: BatchMode,
    pub scope: String,
    pub status: BatchStatus,
    pub cancel_reason: Option<String>,
    pub estimate: CostRange,
    pub actual_cost_cents: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// One step inside a batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchOperation {
    pub id: Uuid,
    pub batch_id: Uuid,
    pub operation_id: String,
    pub params: serde_json::Value,
    pub seq: i64,
    pub depends_on: Option<Uuid>,
    pub status: StepStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub cost_cents: Option<f64>,
}

/// Aggregate step counts for a batch.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct BatchCounts {
    pub total: i64,
    pub completed: i64,
    pub failed: i64,
    pub skipped: i64,
}

/// Feature toggle row.
#[derive(Debug, Clone, Serialize)]
pub struct FeatureToggle {
    pub name: String,
    pub enabled: bool,
    pub locked: bool,
    pub controller: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Audit trail entry.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub id: i64,
    pub kind: String,
    pub subject: String,
    pub detail: String,
    pub created_at: DateTime<Utc>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS execution_records (
    id              TEXT PRIMARY KEY,
    operation_id    TEXT NOT NULL,
    provider_id     TEXT,
    scope           TEXT NOT NULL,
    estimate_low    REAL NOT NULL,
    estimate_mid    REAL NOT NULL,
    estimate_high   REAL NOT NULL,
    actual_cost     REAL,
    latency_ms      INTEGER,
    status          TEXT NOT NULL,
    error           TEXT,
    created_at      INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_exec_scope_time ON execution_records(scope, created_at);

CREATE TABLE IF NOT EXISTS budget_scopes (
    scope           TEXT PRIMARY KEY,
    period          TEXT NOT NULL,
    limit_cents     REAL NOT NULL,
    warn_ratio      REAL NOT NULL DEFAULT 0.8,
    spent_cents     REAL NOT NULL DEFAULT 0,
    op_count        INTEGER NOT NULL DEFAULT 0,
    last_reset      INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS approvals (
    id              TEXT PRIMARY KEY,
    operation_id    TEXT NOT NULL,
    scope           TEXT NOT NULL,
    context         TEXT NOT NULL,
    estimate_low    REAL NOT NULL,
    estimate_mid    REAL NOT NULL,
    estimate_high   REAL NOT NULL,
    status          TEXT NOT NULL,
    requester       TEXT NOT NULL,
    decided_by      TEXT,
    created_at      INTEGER NOT NULL,
    decided_at      INTEGER
);

CREATE TABLE IF NOT EXISTS schedules (
    id                   TEXT PRIMARY KEY,
    name                 TEXT NOT NULL UNIQUE,
    operation_id         TEXT NOT NULL,
    params               TEXT NOT NULL,
    scope                TEXT NOT NULL,
    trigger              TEXT NOT NULL,
    interval_secs        INTEGER,
    webhook_secret_ref   TEXT,
    enabled              INTEGER NOT NULL DEFAULT 1,
    timezone             TEXT NOT NULL DEFAULT 'UTC',
    monthly_ceiling      REAL,
    last_run_at          INTEGER,
    next_run_at          INTEGER,
    running_execution_id TEXT,
    running_since        INTEGER
);

CREATE TABLE IF NOT EXISTS schedule_executions (
    id              TEXT PRIMARY KEY,
    schedule_id     TEXT NOT NULL,
    status          TEXT NOT NULL,
    estimate_low    REAL,
    estimate_mid    REAL,
    estimate_high   REAL,
    actual_cost     REAL,
    trigger_source  TEXT NOT NULL,
    error           TEXT,
    started_at      INTEGER,
    finished_at     INTEGER,
    duration_ms     INTEGER,
    created_at      INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sched_exec ON schedule_executions(schedule_id, created_at);

CREATE TABLE IF NOT EXISTS batches (
    id              TEXT PRIMARY KEY,
    mode            TEXT NOT NULL,
    scope           TEXT NOT NULL,
    status          TEXT NOT NULL,
    cancel_reason   TEXT,
    estimate_low    REAL NOT NULL DEFAULT 0,
    estimate_mid    REAL NOT NULL DEFAULT 0,
    estimate_high   REAL NOT NULL DEFAULT 0,
    actual_cost     REAL,
    created_at      INTEGER NOT NULL,
    finished_at     INTEGER
);

CREATE TABLE IF NOT EXISTS batch_operations (
    id              TEXT PRIMARY KEY,
    batch_id        TEXT NOT NULL,
    operation_id    TEXT NOT NULL,
    params          TEXT NOT NULL,
    seq             INTEGER NOT NULL,
    depends_on      TEXT,
    status          TEXT NOT NULL,
    result          TEXT,
    error           TEXT,
    cost_cents      REAL
);
CREATE INDEX IF NOT EXISTS idx_batch_ops ON batch_operations(batch_id, seq);

CREATE TABLE IF NOT EXISTS toggles (
    name            TEXT PRIMARY KEY,
    enabled         INTEGER NOT NULL,
    locked          INTEGER NOT NULL DEFAULT 0,
    controller      TEXT,
    updated_at      INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS audit_events (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    kind            TEXT NOT NULL,
    subject         TEXT NOT NULL,
    detail          TEXT NOT NULL,
    created_at      INTEGER NOT NULL
);
";

/// Handle to the SQLite store. Cheap to share behind an `Arc`; the inner
/// connection is serialized by a mutex and every critical section is a
/// single short statement or transaction.
pub struct Store {
    conn: Mutex<Connection>,
}

fn parse_uuid(idx: usize, s: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(s)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

fn parse_json(idx: usize, s: &str) -> rusqlite::Result<serde_json::Value> {
    serde_json::from_str(s)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

impl Store {
    /// Open (or create) the store at `path` and run schema setup.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                let _ = std::fs::create_dir_all(parent);
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ---- execution records -------------------------------------------------

    pub fn insert_execution_record(&self, rec: &ExecutionRecord) -> Result<()> {
        self.conn().execute(
            "INSERT INTO execution_records
             (id, operation_id, provider_id, scope, estimate_low, estimate_mid, estimate_high,
              actual_cost, latency_ms, status, error, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                rec.id.to_string(),
                rec.operation_id,
                rec.provider_id,
                rec.scope,
                rec.estimate.low_cents,
                rec.estimate.mid_cents,
                rec.estimate.high_cents,
                rec.actual_cost_cents,
                rec.latency_ms,
                rec.status,
                rec.error,
                rec.created_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    pub fn list_execution_records(&self, scope: Option<&str>, limit: i64) -> Result<Vec<ExecutionRecord>> {
        let conn = self.conn();
        let mut rows = Vec::new();
        let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<ExecutionRecord> {
            let id: String = row.get(0)?;
            Ok(ExecutionRecord {
                id: parse_uuid(0, &id)?,
                operation_id: row.get(1)?,
                provider_id: row.get(2)?,
                scope: row.get(3)?,
                estimate: CostRange {
                    low_cents: row.get(4)?,
                    mid_cents: row.get(5)?,
                    high_cents: row.get(6)?,
                },
                actual_cost_cents: row.get(7)?,
                latency_ms: row.get(8)?,
                status: row.get(9)?,
                error: row.get(10)?,
                created_at: ms_to_dt(row.get(11)?),
            })
        };
        match scope {
            Some(scope) => {
                let mut stmt = conn.prepare(
                    "SELECT id, operation_id, provider_id, scope, estimate_low, estimate_mid,
                            estimate_high, actual_cost, latency_ms, status, error, created_at
                     FROM execution_records WHERE scope = ?1
                     ORDER BY created_at DESC LIMIT ?2",
                )?;
                let mapped = stmt.query_map(params![scope, limit], map_row)?;
                for rec in mapped {
                    rows.push(rec?);
                }
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT id, operation_id, provider_id, scope, estimate_low, estimate_mid,
                            estimate_high, actual_cost, latency_ms, status, error, created_at
                     FROM execution_records
                     ORDER BY created_at DESC LIMIT ?1",
                )?;
                let mapped = stmt.query_map(params![limit], map_row)?;
                for rec in mapped {
                    rows.push(rec?);
                }
            }
        }
        Ok(rows)
    }

    /// Successful spend and operation count for a scope inside a window.
    pub fn spend_between(&self, scope: &str, from_ms: i64, to_ms: i64) -> Result<(f64, i64)> {
        let conn = self.conn();
        let row = conn.query_row(
            "SELECT COALESCE(SUM(actual_cost), 0), COUNT(*)
             FROM execution_records
             WHERE scope = ?1 AND status = 'success' AND created_at >= ?2 AND created_at < ?3",
            params![scope, from_ms, to_ms],
            |row| Ok((row.get::<_, f64>(0)?, row.get::<_, i64>(1)?)),
        )?;
        Ok(row)
    }

    // ---- budget scopes -----------------------------------------------------

    /// Create the scope row if absent (no-op otherwise).
    pub fn ensure_budget_scope(
        &self,
        scope: &str,
        period: BudgetPeriod,
        limit_cents: f64,
        warn_ratio: f64,
    ) -> Result<()> {
        self.conn().execute(
            "INSERT OR IGNORE INTO budget_scopes (scope, period, limit_cents, warn_ratio, spent_cents, op_count, last_reset)
             VALUES (?1, ?2, ?3, ?4, 0, 0, ?5)",
            params![scope, period, limit_cents, warn_ratio, now_ms()],
        )?;
        Ok(())
    }

    pub fn get_budget_scope(&self, scope: &str) -> Result<Option<BudgetScope>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT scope, period, limit_cents, warn_ratio, spent_cents, op_count, last_reset
                 FROM budget_scopes WHERE scope = ?1",
                params![scope],
                |row| {
                    Ok(BudgetScope {
                        scope: row.get(0)?,
                        period: row.get(1)?,
                        limit_cents: row.get(2)?,
                        warn_ratio: row.get(3)?,
                        spent_cents: row.get(4)?,
                        op_count: row.get(5)?,
                        last_reset: ms_to_dt(row.get(6)?),
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_budget_scopes(&self) -> Result<Vec<BudgetScope>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT scope, period, limit_cents, warn_ratio, spent_cents, op_count, last_reset
             FROM budget_scopes ORDER BY scope",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(BudgetScope {
                scope: row.get(0)?,
                period: row.get(1)?,
                limit_cents: row.get(2)?,
                warn_ratio: row.get(3)?,
                spent_cents: row.get(4)?,
                op_count: row.get(5)?,
                last_reset: ms_to_dt(row.get(6)?),
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn add_budget_spend(&self, scope: &str, cents: f64) -> Result<()> {
        self.conn().execute(
            "UPDATE budget_scopes
             SET spent_cents = spent_cents + ?2, op_count = op_count + 1
             WHERE scope = ?1",
            params![scope, cents],
        )?;
        Ok(())
    }

    /// Reset a scope whose last reset predates the period boundary.
    /// Idempotent: `last_reset` is advanced at least to the boundary, so a
    /// second call for the same boundary affects no rows.
    pub fn reset_budget_scope_before(&self, scope: &str, boundary_ms: i64) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE budget_scopes
             SET spent_cents = 0, op_count = 0, last_reset = MAX(?2, ?3)
             WHERE scope = ?1 AND last_reset < ?2",
            params![scope, boundary_ms, now_ms()],
        )?;
        Ok(affected > 0)
    }

    // ---- approvals ---------------------------------------------------------

    pub fn insert_approval(&self, req: &ApprovalRequest) -> Result<()> {
        self.conn().execute(
            "INSERT INTO approvals
             (id, operation_id, scope, context, estimate_low, estimate_mid, estimate_high,
              status, requester, decided_by, created_at, decided_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                req.id.to_string(),
                req.operation_id,
                req.scope,
                req.context,
                req.estimate.low_cents,
                req.estimate.mid_cents,
                req.estimate.high_cents,
                req.status,
                req.requester,
                req.decided_by,
                req.created_at.timestamp_millis(),
                req.decided_at.map(|d| d.timestamp_millis()),
            ],
        )?;
        Ok(())
    }

    pub fn get_approval(&self, id: Uuid) -> Result<Option<ApprovalRequest>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT id, operation_id, scope, context, estimate_low, estimate_mid, estimate_high,
                        status, requester, decided_by, created_at, decided_at
                 FROM approvals WHERE id = ?1",
                params![id.to_string()],
                Self::map_approval,
            )
            .optional()?;
        Ok(row)
    }

    fn map_approval(row: &rusqlite::Row<'_>) -> rusqlite::Result<ApprovalRequest> {
        let id: String = row.get(0)?;
        Ok(ApprovalRequest {
            id: parse_uuid(0, &id)?,
            operation_id: row.get(1)?,
            scope: row.get(2)?,
            context: row.get(3)?,
            estimate: CostRange {
                low_cents: row.get(4)?,
                mid_cents: row.get(5)?,
                high_cents: row.get(6)?,
            },
            status: row.get(7)?,
            requester: row.get(8)?,
            decided_by: row.get(9)?,
            created_at: ms_to_dt(row.get(10)?),
            decided_at: row.get::<_, Option<i64>>(11)?.map(ms_to_dt),
        })
    }

    pub fn list_approvals(&self, status: Option<ApprovalStatus>) -> Result<Vec<ApprovalRequest>> {
        let conn = self.conn();
        let mut out = Vec::new();
        match status {
            Some(status) => {
                let mut stmt = conn.prepare(
                    "SELECT id, operation_id, scope, context, estimate_low, estimate_mid,
                            estimate_high, status, requester, decided_by, created_at, decided_at
                     FROM approvals WHERE status = ?1 ORDER BY created_at DESC",
                )?;
                let rows = stmt.query_map(params![status], Self::map_approval)?;
                for r in rows {
                    out.push(r?);
                }
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT id, operation_id, scope, context, estimate_low, estimate_mid,
                            estimate_high, status, requester, decided_by, created_at, decided_at
                     FROM approvals ORDER BY created_at DESC",
                )?;
                let rows = stmt.query_map([], Self::map_approval)?;
                for r in rows {
                    out.push(r?);
                }
            }
        }
        Ok(out)
    }

    /// Transition a pending approval to a terminal status. Returns false if
    /// the request was not pending (already decided or expired).
    pub fn decide_approval(
        &self,
        id: Uuid,
        status: ApprovalStatus,
        decided_by: &str,
    ) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE approvals SET status = ?2, decided_by = ?3, decided_at = ?4
             WHERE id = ?1 AND status = 'pending'",
            params![id.to_string(), status, decided_by, now_ms()],
        )?;
        Ok(affected > 0)
    }

    // ---- schedules ---------------------------------------------------------

    pub fn insert_schedule(&self, schedule: &Schedule) -> Result<()> {
        self.conn().execute(
            "INSERT INTO schedules
             (id, name, operation_id, params, scope, trigger, interval_secs, webhook_secret_ref,
              enabled, timezone, monthly_ceiling, last_run_at, next_run_at,
              running_execution_id, running_since)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                schedule.id.to_string(),
                schedule.name,
                schedule.operation_id,
                schedule.params.to_string(),
                schedule.scope,
                schedule.trigger,
                schedule.interval_secs,
                schedule.webhook_secret_ref,
                schedule.enabled,
                schedule.timezone,
                schedule.monthly_ceiling_cents,
                schedule.last_run_at.map(|d| d.timestamp_millis()),
                schedule.next_run_at.map(|d| d.timestamp_millis()),
                schedule.running_execution_id.map(|u| u.to_string()),
                schedule.running_since.map(|d| d.timestamp_millis()),
            ],
        )?;
        Ok(())
    }

    fn map_schedule(row: &rusqlite::Row<'_>) -> rusqlite::Result<Schedule> {
        let id: String = row.get(0)?;
        let params_json: String = row.get(3)?;
        let running_id: Option<String> = row.get(13)?;
        Ok(Schedule {
            id: parse_uuid(0, &id)?,
            name: row.get(1)?,
            operation_id: row.get(2)?,
            params: parse_json(3, &params_json)?,
            scope: row.get(4)?,
            trigger: row.get(5)?,
            interval_secs: row.get(6)?,
            webhook_secret_ref: row.get(7)?,
            enabled: row.get(8)?,
            timezone: row.get(9)?,
            monthly_ceiling_cents: row.get(10)?,
            last_run_at: row.get::<_, Option<i64>>(11)?.map(ms_to_dt),
            next_run_at: row.get::<_, Option<i64>>(12)?.map(ms_to_dt),
            running_execution_id: match running_id {
                Some(s) => Some(parse_uuid(13, &s)?),
                None => None,
            },
            running_since: row.get::<_, Option<i64>>(14)?.map(ms_to_dt),
        })
    }

    const SCHEDULE_COLUMNS: &'static str =
        "id, name, operation_id, params, scope, trigger, interval_secs, webhook_secret_ref,
         enabled, timezone, monthly_ceiling, last_run_at, next_run_at,
         running_execution_id, running_since";

    pub fn get_schedule(&self, id: Uuid) -> Result<Option<Schedule>> {
        let conn = self.conn();
        let sql = format!("SELECT {} FROM schedules WHERE id = ?1", Self::SCHEDULE_COLUMNS);
        let row = conn
            .query_row(&sql, params![id.to_string()], Self::map_schedule)
            .optional()?;
        Ok(row)
    }

    pub fn get_schedule_by_name(&self, name: &str) -> Result<Option<Schedule>> {
        let conn = self.conn();
        let sql = format!("SELECT {} FROM schedules WHERE name = ?1", Self::SCHEDULE_COLUMNS);
        let row = conn
            .query_row(&sql, params![name], Self::map_schedule)
            .optional()?;
        Ok(row)
    }

    pub fn list_schedules(&self) -> Result<Vec<Schedule>> {
        let conn = self.conn();
        let sql = format!("SELECT {} FROM schedules ORDER BY name", Self::SCHEDULE_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], Self::map_schedule)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Enabled interval schedules whose next run is due at `now_ms`.
    pub fn due_schedules(&self, now_ms: i64) -> Result<Vec<Schedule>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {} FROM schedules
             WHERE enabled = 1 AND trigger = 'interval'
               AND next_run_at IS NOT NULL AND next_run_at <= ?1
             ORDER BY next_run_at",
            Self::SCHEDULE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![now_ms], Self::map_schedule)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn set_schedule_enabled(&self, id: Uuid, enabled: bool) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE schedules SET enabled = ?2 WHERE id = ?1",
            params![id.to_string(), enabled],
        )?;
        Ok(affected > 0)
    }

    pub fn set_schedule_next_run(&self, id: Uuid, next_run_ms: Option<i64>) -> Result<()> {
        self.conn().execute(
            "UPDATE schedules SET next_run_at = ?2 WHERE id = ?1",
            params![id.to_string(), next_run_ms],
        )?;
        Ok(())
    }

    pub fn record_schedule_run(&self, id: Uuid, last_run_ms: i64, next_run_ms: Option<i64>) -> Result<()> {
        self.conn().execute(
            "UPDATE schedules SET last_run_at = ?2, next_run_at = ?3 WHERE id = ?1",
            params![id.to_string(), last_run_ms, next_run_ms],
        )?;
        Ok(())
    }

    /// Acquire the dedup lock: set `running_execution_id` only when no
    /// non-stale execution holds it. `create-if-not-running` semantics — a
    /// losing writer observes `false`, never overwrites.
    pub fn try_acquire_schedule_lock(
        &self,
        schedule_id: Uuid,
        execution_id: Uuid,
        stale_before_ms: i64,
    ) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE schedules
             SET running_execution_id = ?2, running_since = ?3
             WHERE id = ?1
               AND (running_execution_id IS NULL OR running_since IS NULL OR running_since < ?4)",
            params![
                schedule_id.to_string(),
                execution_id.to_string(),
                now_ms(),
                stale_before_ms
            ],
        )?;
        Ok(affected > 0)
    }

    /// Release the lock, but only if we still hold it.
    pub fn release_schedule_lock(&self, schedule_id: Uuid, execution_id: Uuid) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE schedules SET running_execution_id = NULL, running_since = NULL
             WHERE id = ?1 AND running_execution_id = ?2",
            params![schedule_id.to_string(), execution_id.to_string()],
        )?;
        Ok(affected > 0)
    }

    // ---- schedule executions -----------------------------------------------

    pub fn insert_schedule_execution(&self, exec: &ScheduleExecution) -> Result<()> {
        self.conn().execute(
            "INSERT INTO schedule_executions
             (id, schedule_id, status, estimate_low, estimate_mid, estimate_high, actual_cost,
              trigger_source, error, started_at, finished_at, duration_ms, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                exec.id.to_string(),
                exec.schedule_id.to_string(),
                exec.status,
                exec.estimate.map(|e| e.low_cents),
                exec.estimate.map(|e| e.mid_cents),
                exec.estimate.map(|e| e.high_cents),
                exec.actual_cost_cents,
                exec.trigger_source,
                exec.error,
                exec.started_at.map(|d| d.timestamp_millis()),
                exec.finished_at.map(|d| d.timestamp_millis()),
                exec.duration_ms,
                exec.created_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    pub fn mark_execution_running(&self, id: Uuid) -> Result<()> {
        self.conn().execute(
            "UPDATE schedule_executions SET status = 'running', started_at = ?2 WHERE id = ?1",
            params![id.to_string(), now_ms()],
        )?;
        Ok(())
    }

    pub fn update_schedule_execution(
        &self,
        id: Uuid,
        status: ScheduleExecStatus,
        estimate: Option<CostRange>,
        actual_cost_cents: Option<f64>,
        error: Option<&str>,
        duration_ms: Option<i64>,
    ) -> Result<()> {
        self.conn().execute(
            "UPDATE schedule_executions
             SET status = ?2,
                 estimate_low = COALESCE(?3, estimate_low),
                 estimate_mid = COALESCE(?4, estimate_mid),
                 estimate_high = COALESCE(?5, estimate_high),
                 actual_cost = COALESCE(?6, actual_cost),
                 error = COALESCE(?7, error),
                 finished_at = ?8,
                 duration_ms = COALESCE(?9, duration_ms)
             WHERE id = ?1",
            params![
                id.to_string(),
                status,
                estimate.map(|e| e.low_cents),
                estimate.map(|e| e.mid_cents),
                estimate.map(|e| e.high_cents),
                actual_cost_cents,
                error,
                now_ms(),
                duration_ms,
            ],
        )?;
        Ok(())
    }

    fn map_schedule_execution(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScheduleExecution> {
        let id: String = row.get(0)?;
        let schedule_id: String = row.get(1)?;
        let low: Option<f64> = row.get(3)?;
        let mid: Option<f64> = row.get(4)?;
        let high: Option<f64> = row.get(5)?;
        let estimate = match (low, mid, high) {
            (Some(low_cents), Some(mid_cents), Some(high_cents)) => Some(CostRange {
                low_cents,
                mid_cents,
                high_cents,
            }),
            _ => None,
        };
        Ok(ScheduleExecution {
            id: parse_uuid(0, &id)?,
            schedule_id: parse_uuid(1, &schedule_id)?,
            status: row.get(2)?,
            estimate,
            actual_cost_cents: row.get(6)?,
            trigger_source: row.get(7)?,
            error: row.get(8)?,
            started_at: row.get::<_, Option<i64>>(9)?.map(ms_to_dt),
            finished_at: row.get::<_, Option<i64>>(10)?.map(ms_to_dt),
            duration_ms: row.get(11)?,
            created_at: ms_to_dt(row.get(12)?),
        })
    }

    pub fn get_schedule_execution(&self, id: Uuid) -> Result<Option<ScheduleExecution>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT id, schedule_id, status, estimate_low, estimate_mid, estimate_high,
                        actual_cost, trigger_source, error, started_at, finished_at, duration_ms,
                        created_at
                 FROM schedule_executions WHERE id = ?1",
                params![id.to_string()],
                Self::map_schedule_execution,
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_schedule_executions(&self, schedule_id: Uuid, limit: i64) -> Result<Vec<ScheduleExecution>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, schedule_id, status, estimate_low, estimate_mid, estimate_high,
                    actual_cost, trigger_source, error, started_at, finished_at, duration_ms,
                    created_at
             FROM schedule_executions WHERE schedule_id = ?1
             ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![schedule_id.to_string(), limit], Self::map_schedule_execution)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Non-stale running execution count for a schedule.
    pub fn running_execution_count(&self, schedule_id: Uuid, stale_before_ms: i64) -> Result<i64> {
        let conn = self.conn();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM schedule_executions
             WHERE schedule_id = ?1 AND status = 'running' AND created_at >= ?2",
            params![schedule_id.to_string(), stale_before_ms],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Actual spend attributed to a schedule since `since_ms` (monthly
    /// ceiling accounting).
    pub fn schedule_spend_since(&self, schedule_id: Uuid, since_ms: i64) -> Result<f64> {
        let conn = self.conn();
        let spend = conn.query_row(
            "SELECT COALESCE(SUM(actual_cost), 0) FROM schedule_executions
             WHERE schedule_id = ?1 AND status = 'success' AND created_at >= ?2",
            params![schedule_id.to_string(), since_ms],
            |row| row.get(0),
        )?;
        Ok(spend)
    }

    /// Execution counts by status (scheduler health summary).
    pub fn schedule_execution_counts(&self) -> Result<Vec<(ScheduleExecStatus, i64)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*) FROM schedule_executions GROUP BY status",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    // ---- batches -----------------------------------------------------------

    /// Insert a batch and its steps in one transaction.
    pub fn insert_batch(&self, batch: &Batch, ops: &[BatchOperation]) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO batches
             (id, mode, scope, status, cancel_reason, estimate_low, estimate_mid, estimate_high,
              actual_cost, created_at, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                batch.id.to_string(),
                batch.mode,
                batch.scope,
                batch.status,
                batch.cancel_reason,
                batch.estimate.low_cents,
                batch.estimate.mid_cents,
                batch.estimate.high_cents,
                batch.actual_cost_cents,
                batch.created_at.timestamp_millis(),
                batch.finished_at.map(|d| d.timestamp_millis()),
            ],
        )?;
        for op in ops {
            tx.execute(
                "INSERT INTO batch_operations
                 (id, batch_id, operation_id, params, seq, depends_on, status, result, error, cost_cents)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    op.id.to_string(),
                    op.batch_id.to_string(),
                    op.operation_id,
                    op.params.to_string(),
                    op.seq,
                    op.depends_on.map(|u| u.to_string()),
                    op.status,
                    op.result.as_ref().map(|r| r.to_string()),
                    op.error,
                    op.cost_cents,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_batch(&self, id: Uuid) -> Result<Option<Batch>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT id, mode, scope, status, cancel_reason, estimate_low, estimate_mid,
                        estimate_high, actual_cost, created_at, finished_at
                 FROM batches WHERE id = ?1",
                params![id.to_string()],
                |row| {
                    let id: String = row.get(0)?;
                    Ok(Batch {
                        id: parse_uuid(0, &id)?,
                        mode: row.get(1)?,
                        scope: row.get(2)?,
                        status: row.get(3)?,
                        cancel_reason: row.get(4)?,
                        estimate: CostRange {
                            low_cents: row.get(5)?,
                            mid_cents: row.get(6)?,
                            high_cents: row.get(7)?,
                        },
                        actual_cost_cents: row.get(8)?,
                        created_at: ms_to_dt(row.get(9)?),
                        finished_at: row.get::<_, Option<i64>>(10)?.map(ms_to_dt),
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    fn map_batch_op(row: &rusqlite::Row<'_>) -> rusqlite::Result<BatchOperation> {
        let id: String = row.get(0)?;
        let batch_id: String = row.get(1)?;
        let params_json: String = row.get(3)?;
        let depends_on: Option<String> = row.get(5)?;
        let result_json: Option<String> = row.get(7)?;
        Ok(BatchOperation {
            id: parse_uuid(0, &id)?,
            batch_id: parse_uuid(1, &batch_id)?,
            operation_id: row.get(2)?,
            params: parse_json(3, &params_json)?,
            seq: row.get(4)?,
            depends_on: match depends_on {
                Some(s) => Some(parse_uuid(5, &s)?),
                None => None,
            },
            status: row.get(6)?,
            result: match result_json {
                Some(s) => Some(parse_json(7, &s)?),
                None => None,
            },
            error: row.get(8)?,
            cost_cents: row.get(9)?,
        })
    }

    pub fn batch_operations(&self, batch_id: Uuid) -> Result<Vec<BatchOperation>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, batch_id, operation_id, params, seq, depends_on, status, result, error, cost_cents
             FROM batch_operations WHERE batch_id = ?1 ORDER BY seq",
        )?;
        let rows = stmt.query_map(params![batch_id.to_string()], Self::map_batch_op)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Guarded batch status transition: succeeds only from one of the
    /// expected prior states.
    pub fn transition_batch(
        &self,
        id: Uuid,
        from: &[BatchStatus],
        to: BatchStatus,
        cancel_reason: Option<&str>,
    ) -> Result<bool> {
        // Guards are enumerable (at most three prior states), so build the
        // OR chain instead of dynamic SQL params.
        let conn = self.conn();
        let placeholders: Vec<String> = from.iter().map(|s| format!("'{}'", s.as_str())).collect();
        let sql = format!(
            "UPDATE batches SET status = ?2, cancel_reason = COALESCE(?3, cancel_reason)
             WHERE id = ?1 AND status IN ({})",
            placeholders.join(", ")
        );
        let affected = conn.execute(&sql, params![id.to_string(), to, cancel_reason])?;
        Ok(affected > 0)
    }

    pub fn finish_batch(&self, id: Uuid, status: BatchStatus, actual_cost_cents: f64) -> Result<()> {
        self.conn().execute(
            "UPDATE batches SET status = ?2, actual_cost = ?3, finished_at = ?4 WHERE id = ?1",
            params![id.to_string(), status, actual_cost_cents, now_ms()],
        )?;
        Ok(())
    }

    /// Claim a pending step for execution (pending -> running). Returns
    /// false when the step was already claimed, skipped or cancelled away.
    pub fn claim_step(&self, step_id: Uuid) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE batch_operations SET status = 'running' WHERE id = ?1 AND status = 'pending'",
            params![step_id.to_string()],
        )?;
        Ok(affected > 0)
    }

    pub fn finish_step(
        &self,
        step_id: Uuid,
        status: StepStatus,
        result: Option<&serde_json::Value>,
        error: Option<&str>,
        cost_cents: Option<f64>,
    ) -> Result<()> {
        self.conn().execute(
            "UPDATE batch_operations SET status = ?2, result = ?3, error = ?4, cost_cents = ?5
             WHERE id = ?1",
            params![
                step_id.to_string(),
                status,
                result.map(|r| r.to_string()),
                error,
                cost_cents,
            ],
        )?;
        Ok(())
    }

    /// Mark every not-yet-started step of a batch as skipped. Returns the
    /// number of steps affected.
    pub fn skip_pending_steps(&self, batch_id: Uuid) -> Result<usize> {
        let affected = self.conn().execute(
            "UPDATE batch_operations SET status = 'skipped'
             WHERE batch_id = ?1 AND status = 'pending'",
            params![batch_id.to_string()],
        )?;
        Ok(affected)
    }

    pub fn batch_counts(&self, batch_id: Uuid) -> Result<BatchCounts> {
        let conn = self.conn();
        let counts = conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(status = 'completed'), 0),
                    COALESCE(SUM(status = 'failed'), 0),
                    COALESCE(SUM(status = 'skipped'), 0)
             FROM batch_operations WHERE batch_id = ?1",
            params![batch_id.to_string()],
            |row| {
                Ok(BatchCounts {
                    total: row.get(0)?,
                    completed: row.get(1)?,
                    failed: row.get(2)?,
                    skipped: row.get(3)?,
                })
            },
        )?;
        Ok(counts)
    }

    pub fn batch_actual_cost(&self, batch_id: Uuid) -> Result<f64> {
        let conn = self.conn();
        let cost = conn.query_row(
            "SELECT COALESCE(SUM(cost_cents), 0) FROM batch_operations WHERE batch_id = ?1",
            params![batch_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(cost)
    }

    // ---- toggles -----------------------------------------------------------

    /// Seed a toggle if absent; existing rows win.
    pub fn seed_toggle(&self, name: &str, enabled: bool, locked: bool, controller: Option<&str>) -> Result<()> {
        self.conn().execute(
            "INSERT OR IGNORE INTO toggles (name, enabled, locked, controller, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![name, enabled, locked, controller, now_ms()],
        )?;
        Ok(())
    }

    pub fn get_toggle(&self, name: &str) -> Result<Option<FeatureToggle>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT name, enabled, locked, controller, updated_at FROM toggles WHERE name = ?1",
                params![name],
                |row| {
                    Ok(FeatureToggle {
                        name: row.get(0)?,
                        enabled: row.get(1)?,
                        locked: row.get(2)?,
                        controller: row.get(3)?,
                        updated_at: ms_to_dt(row.get(4)?),
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_toggles(&self) -> Result<Vec<FeatureToggle>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT name, enabled, locked, controller, updated_at FROM toggles ORDER BY name",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(FeatureToggle {
                name: row.get(0)?,
                enabled: row.get(1)?,
                locked: row.get(2)?,
                controller: row.get(3)?,
                updated_at: ms_to_dt(row.get(4)?),
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Write a toggle's enabled state. When `unlocked_only` is set the
    /// update refuses locked rows (the non-privileged path).
    pub fn set_toggle(&self, name: &str, enabled: bool, unlocked_only: bool) -> Result<bool> {
        let affected = if unlocked_only {
            self.conn().execute(
                "UPDATE toggles SET enabled = ?2, updated_at = ?3 WHERE name = ?1 AND locked = 0",
                params![name, enabled, now_ms()],
            )?
        } else {
            self.conn().execute(
                "UPDATE toggles SET enabled = ?2, updated_at = ?3 WHERE name = ?1",
                params![name, enabled, now_ms()],
            )?
        };
        Ok(affected > 0)
    }

    // ---- audit -------------------------------------------------------------

    pub fn insert_audit(&self, kind: &str, subject: &str, detail: &str) -> Result<()> {
        self.conn().execute(
            "INSERT INTO audit_events (kind, subject, detail, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![kind, subject, detail, now_ms()],
        )?;
        Ok(())
    }

    pub fn list_audit(&self, limit: i64) -> Result<Vec<AuditEvent>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, kind, subject, detail, created_at FROM audit_events
             ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |row| {
            Ok(AuditEvent {
                id: row.get(0)?,
                kind: row.get(1)?,
                subject: row.get(2)?,
                detail: row.get(3)?,
                created_at: ms_to_dt(row.get(4)?),
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_schedule(name: &str) -> Schedule {
        Schedule {
            id: Uuid::new_v4(),
            name: name.to_string(),
            operation_id: "summarize".to_string(),
            params: serde_json::json!({}),
            scope: "global".to_string(),
            trigger: TriggerKind::Interval,
            interval_secs: Some(60),
            webhook_secret_ref: None,
            enabled: true,
            timezone: "UTC".to_string(),
            monthly_ceiling_cents: None,
            last_run_at: None,
            next_run_at: Some(Utc::now()),
            running_execution_id: None,
            running_since: None,
        }
    }

    #[test]
    fn test_schedule_lock_create_if_not_running() {
        let store = Store::open_in_memory().unwrap();
        let schedule = test_schedule("daily");
        store.insert_schedule(&schedule).unwrap();

        let stale_before = now_ms() - 3_600_000;
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        assert!(store.try_acquire_schedule_lock(schedule.id, first, stale_before).unwrap());
        // Second acquisition loses while the first holds a fresh lock.
        assert!(!store.try_acquire_schedule_lock(schedule.id, second, stale_before).unwrap());

        assert!(store.release_schedule_lock(schedule.id, first).unwrap());
        assert!(store.try_acquire_schedule_lock(schedule.id, second, stale_before).unwrap());
    }

    #[test]
    fn test_schedule_lock_stale_takeover() {
        let store = Store::open_in_memory().unwrap();
        let schedule = test_schedule("nightly");
        store.insert_schedule(&schedule).unwrap();

        let holder = Uuid::new_v4();
        assert!(store
            .try_acquire_schedule_lock(schedule.id, holder, now_ms() - 3_600_000)
            .unwrap());

        // A lock acquired "now" is stale from the perspective of a future
        // cutoff, so a new writer may take over.
        let taker = Uuid::new_v4();
        assert!(store
            .try_acquire_schedule_lock(schedule.id, taker, now_ms() + 1)
            .unwrap());

        // The original holder can no longer release a lock it lost.
        assert!(!store.release_schedule_lock(schedule.id, holder).unwrap());
    }

    #[test]
    fn test_budget_reset_idempotent() {
        let store = Store::open_in_memory().unwrap();
        store
            .ensure_budget_scope("global", BudgetPeriod::Monthly, 500.0, 0.8)
            .unwrap();
        store.add_budget_spend("global", 480.0).unwrap();

        let boundary = now_ms() + 1;
        assert!(store.reset_budget_scope_before("global", boundary).unwrap());
        // Second call for the same boundary is a no-op.
        assert!(!store.reset_budget_scope_before("global", boundary).unwrap());

        let scope = store.get_budget_scope("global").unwrap().unwrap();
        assert_eq!(scope.spent_cents, 0.0);
        assert_eq!(scope.op_count, 0);
    }

    #[test]
    fn test_approval_decided_exactly_once() {
        let store = Store::open_in_memory().unwrap();
        let req = ApprovalRequest {
            id: Uuid::new_v4(),
            operation_id: "summarize".to_string(),
            scope: "user:1".to_string(),
            context: "{}".to_string(),
            estimate: CostRange::around(150.0, 0.2),
            status: ApprovalStatus::Pending,
            requester: "router".to_string(),
            decided_by: None,
            created_at: Utc::now(),
            decided_at: None,
        };
        store.insert_approval(&req).unwrap();

        assert!(store.decide_approval(req.id, ApprovalStatus::Approved, "admin").unwrap());
        assert!(!store.decide_approval(req.id, ApprovalStatus::Rejected, "admin").unwrap());

        let stored = store.get_approval(req.id).unwrap().unwrap();
        assert_eq!(stored.status, ApprovalStatus::Approved);
        assert_eq!(stored.decided_by.as_deref(), Some("admin"));
    }

    #[test]
    fn test_batch_round_trip_and_counts() {
        let store = Store::open_in_memory().unwrap();
        let batch = Batch {
            id: Uuid::new_v4(),
            mode: BatchMode::Parallel,
            scope: "global".to_string(),
            status: BatchStatus::Queued,
            cancel_reason: None,
            estimate: CostRange::zero(),
            actual_cost_cents: None,
            created_at: Utc::now(),
            finished_at: None,
        };
        let ops: Vec<BatchOperation> = (0..3)
            .map(|i| BatchOperation {
                id: Uuid::new_v4(),
                batch_id: batch.id,
                operation_id: "summarize".to_string(),
                params: serde_json::json!({ "n": i }),
                seq: i,
                depends_on: None,
                status: StepStatus::Pending,
                result: None,
                error: None,
                cost_cents: None,
            })
            .collect();
        store.insert_batch(&batch, &ops).unwrap();

        let read_ops = store.batch_operations(batch.id).unwrap();
        assert_eq!(read_ops.len(), 3);
        assert!(read_ops.iter().all(|o| o.status == StepStatus::Pending));

        let counts = store.batch_counts(batch.id).unwrap();
        assert_eq!(counts.total, 3);
        assert_eq!(counts.completed + counts.failed + counts.skipped, 0);
    }

    #[test]
    fn test_step_claim_is_exclusive() {
        let store = Store::open_in_memory().unwrap();
        let batch = Batch {
            id: Uuid::new_v4(),
            mode: BatchMode::Sequential,
            scope: "global".to_string(),
            status: BatchStatus::Queued,
            cancel_reason: None,
            estimate: CostRange::zero(),
            actual_cost_cents: None,
            created_at: Utc::now(),
            finished_at: None,
        };
        let op = BatchOperation {
            id: Uuid::new_v4(),
            batch_id: batch.id,
            operation_id: "summarize".to_string(),
            params: serde_json::json!({}),
            seq: 0,
            depends_on: None,
            status: StepStatus::Pending,
            result: None,
            error: None,
            cost_cents: None,
        };
        store.insert_batch(&batch, std::slice::from_ref(&op)).unwrap();

        assert!(store.claim_step(op.id).unwrap());
        assert!(!store.claim_step(op.id).unwrap());
    }

    #[test]
    fn test_toggle_locked_write_path() {
        let store = Store::open_in_memory().unwrap();
        store.seed_toggle("expensive_ops", true, true, Some("platform-team")).unwrap();

        // Non-privileged writes to a locked toggle are rejected.
        assert!(!store.set_toggle("expensive_ops", false, true).unwrap());
        let toggle = store.get_toggle("expensive_ops").unwrap().unwrap();
        assert!(toggle.enabled);

        // Privileged path may write.
        assert!(store.set_toggle("expensive_ops", false, false).unwrap());
        let toggle = store.get_toggle("expensive_ops").unwrap().unwrap();
        assert!(!toggle.enabled);
    }

    #[test]
    fn test_spend_window() {
        let store = Store::open_in_memory().unwrap();
        let rec = ExecutionRecord::success(
            "summarize",
            "fast",
            "user:1",
            CostRange::around(10.0, 0.2),
            9.5,
            120,
        );
        store.insert_execution_record(&rec).unwrap();
        let failed = ExecutionRecord::failure(
            "summarize",
            None,
            "user:1",
            CostRange::around(10.0, 0.2),
            "budget exceeded",
        );
        store.insert_execution_record(&failed).unwrap();

        let (spend, count) = store
            .spend_between("user:1", now_ms() - 1000, now_ms() + 1000)
            .unwrap();
        assert!((spend - 9.5).abs() < 1e-9);
        assert_eq!(count, 1);
    }
}
