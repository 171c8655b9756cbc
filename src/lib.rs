//! # Opsgate
//!
//! A control plane for AI operations backed by paid provider APIs.
//!
//! This library provides:
//! - An HTTP API for routed invocations, budgets, approvals and batches
//! - Cost-aware routing with candidate fallback and budget degradation
//! - Durable scheduling with dedup locks and webhook triggers
//!
//! ## Invocation Flow
//! 1. Resolve the operation from the catalog
//! 2. Enforce its feature toggle
//! 3. Estimate cost as a low/mid/high range
//! 4. Pass the approval gate (high-tier, expensive invocations)
//! 5. Pass the budget enforcer, degrading to the cheapest candidate if allowed
//! 6. Invoke candidate providers in preference order
//! 7. Persist an execution record per attempt and record actual spend
//!
//! ## Modules
//! - `router`: the invocation pipeline
//! - `budget`: per-scope budget enforcement and anomaly detection
//! - `scheduler`: durable schedules, recovery, webhook triggers
//! - `batch`: parallel/sequential/conditional batch execution
//! - `store`: the SQLite source of truth

pub mod api;
pub mod approval;
pub mod batch;
pub mod budget;
pub mod config;
pub mod cost;
pub mod error;
pub mod notify;
pub mod provider;
pub mod router;
pub mod scheduler;
pub mod secrets;
pub mod store;
pub mod toggles;

pub use config::Config;
pub use error::{ControlError, Result};
