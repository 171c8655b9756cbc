//! Runtime configuration and the operation catalog.
//!
//! Two layers, following the usual split:
//! - `Config`: process-level settings read once from environment variables
//!   (listen address, store path, thresholds, concurrency limits).
//! - `Catalog`: the control-plane catalog of operations, providers and
//!   toggle seeds, loaded from a JSON file and reloadable at runtime with
//!   explicit cache invalidation.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::{ControlError, Result};

/// Cost-criticality tier of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CostTier {
    Low,
    Medium,
    High,
}

/// A routable operation: candidate ordering, tier, gating flags.
///
/// Immutable during a run; changed only through catalog reload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationDef {
    pub id: String,
    pub tier: CostTier,
    /// Candidate provider ids, in preference order.
    pub candidates: Vec<String>,
    /// Minimum acceptable quality score for candidate providers.
    #[serde(default)]
    pub quality_threshold: f64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Force the approval gate regardless of tier/estimate.
    #[serde(default)]
    pub requires_approval: bool,
    /// On budget rejection, fall back to the cheapest candidate instead of
    /// failing outright.
    #[serde(default)]
    pub degrade_on_budget: bool,
    /// Feature toggle guarding this operation class, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub toggle: Option<String>,
}

fn default_true() -> bool {
    true
}

/// How a catalog provider entry is backed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// OpenAI-compatible HTTP completion endpoint.
    Http,
    /// Deterministic in-process provider (tests, offline runs).
    Static,
}

/// Catalog entry describing a paid-API provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderDef {
    pub id: String,
    pub kind: ProviderKind,
    /// Price per unit of work, in cents.
    pub unit_cost_cents: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Secret reference (`env:NAME` or `file:name`) for the API key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default = "default_true")]
    pub available: bool,
}

/// Initial state for a feature toggle. Applied on startup only if the
/// toggle does not already exist in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToggleSeed {
    pub name: String,
    pub enabled: bool,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub controller: Option<String>,
}

/// Seed definition for a schedule, applied on startup if absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleSeed {
    pub name: String,
    pub operation_id: String,
    #[serde(default)]
    pub params: serde_json::Value,
    pub scope: String,
    pub trigger: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_secs: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_secret_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monthly_ceiling_cents: Option<f64>,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

/// The full control-plane catalog.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub operations: Vec<OperationDef>,
    #[serde(default)]
    pub providers: Vec<ProviderDef>,
    #[serde(default)]
    pub toggles: Vec<ToggleSeed>,
    #[serde(default)]
    pub schedules: Vec<ScheduleSeed>,
}

impl Catalog {
    pub fn operation(&self, id: &str) -> Option<&OperationDef> {
        self.operations.iter().find(|o| o.id == id)
    }
}

/// Catalog holder with reload support.
///
/// `version` is bumped on every reload; readers that cache operation
/// definitions compare versions to invalidate.
pub struct CatalogStore {
    path: Option<PathBuf>,
    catalog: RwLock<Arc<Catalog>>,
    version: AtomicU64,
}

impl CatalogStore {
    /// Load the catalog from a JSON file. A missing file yields an empty
    /// catalog so the process can come up before it is configured.
    pub fn load(path: PathBuf) -> Result<Self> {
        let catalog = if path.exists() {
            Self::read_file(&path)?
        } else {
            tracing::warn!("catalog file {} not found, starting empty", path.display());
            Catalog::default()
        };
        Ok(Self {
            path: Some(path),
            catalog: RwLock::new(Arc::new(catalog)),
            version: AtomicU64::new(1),
        })
    }

    /// Build a store around an in-memory catalog (tests).
    pub fn from_catalog(catalog: Catalog) -> Self {
        Self {
            path: None,
            catalog: RwLock::new(Arc::new(catalog)),
            version: AtomicU64::new(1),
        }
    }

    fn read_file(path: &PathBuf) -> Result<Catalog> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ControlError::Config(format!("read {}: {}", path.display(), e)))?;
        serde_json::from_str(&contents)
            .map_err(|e| ControlError::Config(format!("parse {}: {}", path.display(), e)))
    }

    /// Current catalog snapshot.
    pub async fn get(&self) -> Arc<Catalog> {
        self.catalog.read().await.clone()
    }

    /// Monotonic version counter; bumped on every reload.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Re-read the catalog file and bump the version so cached operation
    /// resolutions are invalidated.
    pub async fn reload(&self) -> Result<()> {
        let path = match &self.path {
            Some(p) => p.clone(),
            None => return Ok(()),
        };
        let fresh = Self::read_file(&path)?;
        *self.catalog.write().await = Arc::new(fresh);
        self.version.fetch_add(1, Ordering::AcqRel);
        tracing::info!("catalog reloaded from {}", path.display());
        Ok(())
    }

    /// Replace the catalog in place (admin API, tests).
    pub async fn replace(&self, catalog: Catalog) {
        *self.catalog.write().await = Arc::new(catalog);
        self.version.fetch_add(1, Ordering::AcqRel);
    }
}

/// Process-level configuration, read from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Path of the SQLite store.
    pub db_path: PathBuf,
    /// Path of the catalog JSON file.
    pub catalog_path: PathBuf,
    /// Token required for the admin (privileged) API surface.
    pub admin_token: Option<String>,
    /// Notification sink URL; unset disables notifications.
    pub notify_url: Option<String>,
    /// Directory for `file:` secret references.
    pub secrets_dir: PathBuf,
    /// High-tier operations with an estimate.mid above this require approval.
    pub approval_threshold_cents: f64,
    /// Pending approvals older than this are treated as expired.
    pub approval_ttl_secs: i64,
    /// How long the router waits for an approval decision before treating
    /// the request as rejected.
    pub approval_wait_secs: u64,
    /// Poll interval while waiting on an approval.
    pub approval_poll_ms: u64,
    /// Confidence margin applied around cost point estimates (0.2 = ±20%).
    pub cost_margin: f64,
    /// TTL of the router's per-operation resolution cache.
    pub operation_cache_ttl_secs: u64,
    /// TTL of the toggle read cache.
    pub toggle_cache_ttl_secs: u64,
    /// Scheduler tick interval.
    pub scheduler_tick_secs: u64,
    /// Running schedule executions older than this are treated as abandoned.
    pub running_stale_secs: i64,
    /// Maximum provider attempts per routed invocation.
    pub max_provider_attempts: u32,
    /// Parallel batch worker pool size.
    pub batch_concurrency: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8790,
            db_path: PathBuf::from("opsgate.db"),
            catalog_path: PathBuf::from("opsgate.json"),
            admin_token: None,
            notify_url: None,
            secrets_dir: PathBuf::from(".opsgate/secrets"),
            approval_threshold_cents: 100.0,
            approval_ttl_secs: 24 * 3600,
            approval_wait_secs: 300,
            approval_poll_ms: 500,
            cost_margin: 0.2,
            operation_cache_ttl_secs: 30,
            toggle_cache_ttl_secs: 10,
            scheduler_tick_secs: 15,
            running_stale_secs: 3600,
            max_provider_attempts: 3,
            batch_concurrency: 5,
        }
    }
}

impl Config {
    /// Build configuration from environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: env_or("OPSGATE_HOST", defaults.host),
            port: env_parse("OPSGATE_PORT", defaults.port),
            db_path: PathBuf::from(env_or(
                "OPSGATE_DB",
                defaults.db_path.to_string_lossy().into_owned(),
            )),
            catalog_path: PathBuf::from(env_or(
                "OPSGATE_CATALOG",
                defaults.catalog_path.to_string_lossy().into_owned(),
            )),
            admin_token: std::env::var("OPSGATE_ADMIN_TOKEN").ok().filter(|t| !t.is_empty()),
            notify_url: std::env::var("OPSGATE_NOTIFY_URL").ok().filter(|u| !u.is_empty()),
            secrets_dir: PathBuf::from(env_or(
                "OPSGATE_SECRETS_DIR",
                defaults.secrets_dir.to_string_lossy().into_owned(),
            )),
            approval_threshold_cents: env_parse(
                "OPSGATE_APPROVAL_THRESHOLD_CENTS",
                defaults.approval_threshold_cents,
            ),
            approval_ttl_secs: env_parse("OPSGATE_APPROVAL_TTL_SECS", defaults.approval_ttl_secs),
            approval_wait_secs: env_parse(
                "OPSGATE_APPROVAL_WAIT_SECS",
                defaults.approval_wait_secs,
            ),
            approval_poll_ms: env_parse("OPSGATE_APPROVAL_POLL_MS", defaults.approval_poll_ms),
            cost_margin: env_parse("OPSGATE_COST_MARGIN", defaults.cost_margin),
            operation_cache_ttl_secs: env_parse(
                "OPSGATE_OP_CACHE_TTL_SECS",
                defaults.operation_cache_ttl_secs,
            ),
            toggle_cache_ttl_secs: env_parse(
                "OPSGATE_TOGGLE_CACHE_TTL_SECS",
                defaults.toggle_cache_ttl_secs,
            ),
            scheduler_tick_secs: env_parse(
                "OPSGATE_SCHEDULER_TICK_SECS",
                defaults.scheduler_tick_secs,
            ),
            running_stale_secs: env_parse(
                "OPSGATE_RUNNING_STALE_SECS",
                defaults.running_stale_secs,
            ),
            max_provider_attempts: env_parse(
                "OPSGATE_MAX_PROVIDER_ATTEMPTS",
                defaults.max_provider_attempts,
            ),
            batch_concurrency: env_parse("OPSGATE_BATCH_CONCURRENCY", defaults.batch_concurrency),
        }
    }
}

fn env_or(key: &str, default: String) -> String {
    std::env::var(key).ok().filter(|v| !v.is_empty()).unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
