//! Request/response DTOs for the HTTP API.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::batch::BatchStepSpec;
use crate::store::{BatchMode, BudgetPeriod};

#[derive(Debug, Deserialize)]
pub struct InvokeRequest {
    pub operation_id: String,
    pub scope: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct EstimateRequest {
    pub operation_id: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct BudgetUpsertRequest {
    pub scope: String,
    pub period: BudgetPeriod,
    pub limit_cents: f64,
    #[serde(default = "default_warn_ratio")]
    pub warn_ratio: f64,
}

fn default_warn_ratio() -> f64 {
    0.8
}

#[derive(Debug, Deserialize)]
pub struct ToggleWriteRequest {
    pub enabled: bool,
    /// Privileged writes may flip locked toggles.
    #[serde(default)]
    pub privileged: bool,
}

#[derive(Debug, Deserialize)]
pub struct DecideRequest {
    pub approve: bool,
    pub decided_by: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateBatchRequest {
    pub mode: BatchMode,
    pub scope: String,
    pub steps: Vec<BatchStepSpec>,
}

#[derive(Debug, Deserialize)]
pub struct CancelBatchRequest {
    #[serde(default = "default_cancel_reason")]
    pub reason: String,
}

fn default_cancel_reason() -> String {
    "cancelled via api".to_string()
}

/// 202 body for asynchronously enqueued webhook executions.
#[derive(Debug, Serialize)]
pub struct EnqueuedResponse {
    pub execution_id: Uuid,
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}
