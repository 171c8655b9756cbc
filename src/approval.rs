//! Human-in-the-loop approval gate.
//!
//! Requests start `pending` and move exactly once to `approved`,
//! `rejected` or `expired`. Expiry is lazy: no background sweeper exists,
//! a pending request older than the TTL is transitioned at read time.
//! The single-writer guarantee comes from the store's guarded update, so
//! two racing decision makers cannot both win.

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use crate::cost::CostRange;
use crate::error::{ControlError, Result};
use crate::notify::Notifier;
use crate::store::{ApprovalRequest, ApprovalStatus, Store};

pub struct ApprovalGate {
    store: Arc<Store>,
    notifier: Notifier,
    ttl: ChronoDuration,
    wait: Duration,
    poll: Duration,
}

impl ApprovalGate {
    pub fn new(
        store: Arc<Store>,
        notifier: Notifier,
        ttl_secs: i64,
        wait: Duration,
        poll: Duration,
    ) -> Self {
        Self {
            store,
            notifier,
            ttl: ChronoDuration::seconds(ttl_secs),
            wait,
            poll,
        }
    }

    /// Open a pending request and announce it.
    pub fn request(
        &self,
        operation_id: &str,
        scope: &str,
        context: serde_json::Value,
        estimate: CostRange,
        requester: &str,
    ) -> Result<ApprovalRequest> {
        let req = ApprovalRequest {
            id: Uuid::new_v4(),
            operation_id: operation_id.to_string(),
            scope: scope.to_string(),
            context: context.to_string(),
            estimate,
            status: ApprovalStatus::Pending,
            requester: requester.to_string(),
            decided_by: None,
            created_at: Utc::now(),
            decided_at: None,
        };
        self.store.insert_approval(&req)?;
        info!(
            request_id = %req.id,
            operation = operation_id,
            scope,
            estimate_mid = estimate.mid_cents,
            "approval requested"
        );
        self.notifier.send(
            "approval.requested",
            json!({
                "request_id": req.id,
                "operation_id": operation_id,
                "scope": scope,
                "estimate_mid_cents": estimate.mid_cents,
            }),
        );
        Ok(req)
    }

    /// Apply lazy expiry: a pending request past its TTL is moved to
    /// `expired` before being returned. The transition goes through the
    /// guarded update, so it cannot clobber a concurrent decision.
    fn expire_if_due(&self, req: ApprovalRequest) -> Result<ApprovalRequest> {
        if req.status == ApprovalStatus::Pending && req.created_at + self.ttl <= Utc::now() {
            if self.store.decide_approval(req.id, ApprovalStatus::Expired, "system")? {
                info!(request_id = %req.id, "approval request expired");
            }
            return self.store.get_approval(req.id)?.ok_or(ControlError::NotFound {
                kind: "approval",
                id: req.id.to_string(),
            });
        }
        Ok(req)
    }

    pub fn get(&self, id: Uuid) -> Result<ApprovalRequest> {
        let req = self.store.get_approval(id)?.ok_or(ControlError::NotFound {
            kind: "approval",
            id: id.to_string(),
        })?;
        self.expire_if_due(req)
    }

    pub fn list(&self, status: Option<ApprovalStatus>) -> Result<Vec<ApprovalRequest>> {
        let reqs = self.store.list_approvals(status)?;
        reqs.into_iter().map(|r| self.expire_if_due(r)).collect()
    }

    /// Record a decision. Exactly-once: a request that is no longer
    /// pending (including one that just lazily expired) rejects the
    /// second decision with its current status.
    pub fn decide(&self, id: Uuid, approve: bool, decided_by: &str) -> Result<ApprovalRequest> {
        // Expire first so a decision on a stale request loses to the TTL.
        let current = self.get(id)?;
        let target = if approve {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Rejected
        };
        if !self.store.decide_approval(id, target, decided_by)? {
            return Err(ControlError::AlreadyDecided {
                request_id: id.to_string(),
                status: current.status.as_str().to_string(),
            });
        }
        let decided = self.get(id)?;
        info!(request_id = %id, status = %decided.status, decided_by, "approval decided");
        self.store.insert_audit(
            "approval.decided",
            &id.to_string(),
            &format!("status={} decided_by={decided_by}", decided.status),
        )?;
        self.notifier.send(
            "approval.decided",
            json!({
                "request_id": id,
                "status": decided.status,
                "decided_by": decided_by,
            }),
        );
        Ok(decided)
    }

    /// Block (poll) until the request reaches a terminal status or the
    /// configured wait elapses. A timeout counts as a rejection: the
    /// gated invocation must not proceed.
    pub async fn wait_for_decision(&self, id: Uuid) -> Result<ApprovalRequest> {
        let deadline = tokio::time::Instant::now() + self.wait;
        loop {
            let req = self.get(id)?;
            match req.status {
                ApprovalStatus::Approved => return Ok(req),
                ApprovalStatus::Rejected => {
                    return Err(ControlError::ApprovalRejected {
                        request_id: id.to_string(),
                    });
                }
                ApprovalStatus::Expired => {
                    return Err(ControlError::ApprovalTimeout {
                        request_id: id.to_string(),
                    });
                }
                ApprovalStatus::Pending => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ControlError::ApprovalTimeout {
                    request_id: id.to_string(),
                });
            }
            tokio::time::sleep(self.poll).await;
        }
    }
}
