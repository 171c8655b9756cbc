//! Provider abstraction and registry.
//!
//! Every paid-API backend is exposed through one capability-set trait
//! regardless of vendor: invoke, unit pricing, health. The router and cost
//! estimator depend only on this trait, never on a concrete provider type.

mod http;
mod statik;

pub use http::HttpProvider;
pub use statik::StaticProvider;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{ProviderDef, ProviderKind};
use crate::error::{ControlError, Result};
use crate::secrets::SecretStore;

/// Result of a provider invocation.
#[derive(Debug, Clone)]
pub struct ProviderOutput {
    pub output: serde_json::Value,
    /// Units of work consumed (same unit the pricing function is per).
    pub units_consumed: f64,
    pub latency_ms: i64,
}

impl ProviderOutput {
    /// Actual cost of this invocation at the given unit price.
    pub fn cost_cents(&self, unit_cost_cents: f64) -> f64 {
        self.units_consumed * unit_cost_cents
    }
}

/// The single capability-set interface all providers implement.
#[async_trait]
pub trait Provider: Send + Sync {
    fn id(&self) -> &str;

    /// Price per unit of work, in cents.
    fn unit_cost_cents(&self) -> f64;

    /// Availability flag. Unhealthy providers are skipped by the router.
    fn healthy(&self) -> bool {
        true
    }

    /// Execute the operation. Failures are transient from the router's
    /// perspective and trigger fallback to the next candidate.
    async fn invoke(&self, params: &serde_json::Value) -> Result<ProviderOutput>;
}

/// Catalog-driven registry of providers. Read-only to every component but
/// the catalog reload path that rebuilds it.
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    /// Build a registry from catalog provider definitions. API keys are
    /// resolved through the secret store at construction time and held only
    /// in memory.
    pub fn from_defs(defs: &[ProviderDef], secrets: &SecretStore) -> Result<Self> {
        let mut registry = Self::new();
        for def in defs {
            if !def.available {
                tracing::info!("provider {} marked unavailable, skipping", def.id);
                continue;
            }
            let provider: Arc<dyn Provider> = match def.kind {
                ProviderKind::Http => {
                    let endpoint = def.endpoint.clone().ok_or_else(|| {
                        ControlError::Config(format!("provider {} missing endpoint", def.id))
                    })?;
                    let api_key = match &def.api_key_ref {
                        Some(reference) => Some(secrets.load(reference)?),
                        None => None,
                    };
                    Arc::new(HttpProvider::new(
                        def.id.clone(),
                        endpoint,
                        def.model.clone(),
                        api_key,
                        def.unit_cost_cents,
                    ))
                }
                ProviderKind::Static => {
                    Arc::new(StaticProvider::new(def.id.clone(), def.unit_cost_cents))
                }
            };
            registry.register(provider);
        }
        Ok(registry)
    }

    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        self.providers.insert(provider.id().to_string(), provider);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(id).cloned()
    }

    /// Candidates from `ids` that are registered and healthy, preserving
    /// the caller's preference order.
    pub fn healthy_candidates(&self, ids: &[String]) -> Vec<Arc<dyn Provider>> {
        ids.iter()
            .filter_map(|id| self.get(id))
            .filter(|p| p.healthy())
            .collect()
    }

    /// The cheapest healthy candidate, by unit price.
    pub fn cheapest_candidate(&self, ids: &[String]) -> Option<Arc<dyn Provider>> {
        self.healthy_candidates(ids)
            .into_iter()
            .min_by(|a, b| {
                a.unit_cost_cents()
                    .partial_cmp(&b.unit_cost_cents())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cheapest_candidate() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(StaticProvider::new("fast".to_string(), 0.5)));
        registry.register(Arc::new(StaticProvider::new("cheap".to_string(), 0.1)));

        let ids = vec!["fast".to_string(), "cheap".to_string()];
        let cheapest = registry.cheapest_candidate(&ids).unwrap();
        assert_eq!(cheapest.id(), "cheap");
    }

    #[test]
    fn test_candidate_order_preserved() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(StaticProvider::new("a".to_string(), 1.0)));
        registry.register(Arc::new(StaticProvider::new("b".to_string(), 2.0)));

        let ids = vec!["b".to_string(), "missing".to_string(), "a".to_string()];
        let candidates = registry.healthy_candidates(&ids);
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].id(), "b");
        assert_eq!(candidates[1].id(), "a");
    }
}
