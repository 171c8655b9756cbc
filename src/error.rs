//! Control-plane error taxonomy.
//!
//! Every rejection carries the specific reason (budget, approval, toggle,
//! lock) rather than a generic failure. Provider errors are the only
//! transient class; the router recovers from them locally via candidate
//! fallback. Everything else is surfaced to the caller as-is.

use thiserror::Error;

/// Errors produced by the control plane.
#[derive(Debug, Error)]
pub enum ControlError {
    /// Transient provider failure; triggers fallback to the next candidate.
    #[error("provider '{provider}' failed: {message}")]
    Provider { provider: String, message: String },

    /// No candidate provider produced a successful result.
    #[error("all candidate providers exhausted for operation '{operation}'")]
    CandidatesExhausted { operation: String },

    /// Fatal for this invocation; never retried automatically.
    #[error(
        "budget exceeded for scope '{scope}': spent {spent_cents:.2}c + estimated {attempted_cents:.2}c over limit {limit_cents:.2}c"
    )]
    BudgetExceeded {
        scope: String,
        spent_cents: f64,
        attempted_cents: f64,
        limit_cents: f64,
    },

    /// Locked-and-disabled toggle; requires privileged intervention.
    #[error("feature toggle '{name}' is locked and disabled")]
    ToggleLocked { name: String },

    /// Approval request was rejected by a decision maker.
    #[error("approval request {request_id} was rejected")]
    ApprovalRejected { request_id: String },

    /// Approval request timed out waiting for a decision. Treated
    /// identically to rejection: the invocation does not proceed.
    #[error("approval request {request_id} timed out")]
    ApprovalTimeout { request_id: String },

    /// A decision was attempted on an already-terminal approval request.
    #[error("approval request {request_id} is already decided ({status})")]
    AlreadyDecided { request_id: String, status: String },

    /// Webhook payload signature did not verify; rejected pre-execution.
    #[error("signature verification failed for schedule {schedule_id}")]
    SignatureVerificationFailed { schedule_id: String },

    /// Monthly cost ceiling configured on the schedule would be exceeded.
    #[error(
        "schedule {schedule_id} monthly ceiling {ceiling_cents:.2}c would be exceeded (spent {spent_cents:.2}c)"
    )]
    ScheduleCeilingExceeded {
        schedule_id: String,
        ceiling_cents: f64,
        spent_cents: f64,
    },

    #[error("operation '{0}' not found")]
    UnknownOperation(String),

    #[error("operation '{0}' is disabled")]
    OperationDisabled(String),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    /// Batch is in a state that does not permit the requested transition.
    #[error("batch {batch_id} is {status}, expected {expected}")]
    BatchState {
        batch_id: String,
        status: String,
        expected: &'static str,
    },

    #[error("secret reference '{reference}' could not be resolved: {message}")]
    Secret { reference: String, message: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),
}

impl ControlError {
    /// Whether the router may recover from this error by advancing to the
    /// next candidate provider.
    pub fn is_transient(&self) -> bool {
        matches!(self, ControlError::Provider { .. })
    }
}

pub type Result<T> = std::result::Result<T, ControlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let provider = ControlError::Provider {
            provider: "openrouter".into(),
            message: "503".into(),
        };
        assert!(provider.is_transient());

        let budget = ControlError::BudgetExceeded {
            scope: "global".into(),
            spent_cents: 480.0,
            attempted_cents: 25.0,
            limit_cents: 500.0,
        };
        assert!(!budget.is_transient());
    }

    #[test]
    fn test_rejections_carry_reason() {
        let err = ControlError::ToggleLocked {
            name: "high_cost_ops".into(),
        };
        assert!(err.to_string().contains("high_cost_ops"));

        let err = ControlError::BudgetExceeded {
            scope: "user:42".into(),
            spent_cents: 480.0,
            attempted_cents: 25.0,
            limit_cents: 500.0,
        };
        assert!(err.to_string().contains("user:42"));
        assert!(err.to_string().contains("500.00"));
    }
}
