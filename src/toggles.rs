//! Feature toggle registry.
//!
//! Toggle state lives in the store; reads go through a short TTL cache so
//! the router's hot path does not hit SQLite on every invocation. A stale
//! read within the TTL window is acceptable. Writes invalidate the cached
//! entry immediately, so the writer's next read observes its own write.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tracing::info;

use crate::config::ToggleSeed;
use crate::error::{ControlError, Result};
use crate::store::{FeatureToggle, Store};

struct CachedToggle {
    toggle: FeatureToggle,
    fetched_at: Instant,
}

pub struct ToggleRegistry {
    store: Arc<Store>,
    ttl: Duration,
    cache: RwLock<HashMap<String, CachedToggle>>,
}

impl ToggleRegistry {
    pub fn new(store: Arc<Store>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Insert catalog-declared toggles that do not exist yet. Existing
    /// rows keep their current state across restarts.
    pub fn seed(&self, seeds: &[ToggleSeed]) -> Result<()> {
        for seed in seeds {
            self.store
                .seed_toggle(&seed.name, seed.enabled, seed.locked, seed.controller.as_deref())?;
        }
        Ok(())
    }

    fn cached(&self, name: &str) -> Option<FeatureToggle> {
        let cache = self.cache.read().unwrap_or_else(|p| p.into_inner());
        cache.get(name).and_then(|entry| {
            (entry.fetched_at.elapsed() < self.ttl).then(|| entry.toggle.clone())
        })
    }

    /// Fetch a toggle, serving from cache inside the TTL window.
    pub fn get(&self, name: &str) -> Result<FeatureToggle> {
        if let Some(toggle) = self.cached(name) {
            return Ok(toggle);
        }
        let toggle = self.store.get_toggle(name)?.ok_or(ControlError::NotFound {
            kind: "toggle",
            id: name.to_string(),
        })?;
        let mut cache = self.cache.write().unwrap_or_else(|p| p.into_inner());
        cache.insert(
            name.to_string(),
            CachedToggle {
                toggle: toggle.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(toggle)
    }

    /// Reject when the toggle gating an operation is disabled. A locked
    /// disabled toggle reports the lock so callers know no self-service
    /// remedy exists.
    pub fn enforce(&self, name: &str) -> Result<()> {
        let toggle = self.get(name)?;
        if toggle.enabled {
            return Ok(());
        }
        if toggle.locked {
            Err(ControlError::ToggleLocked {
                name: name.to_string(),
            })
        } else {
            Err(ControlError::OperationDisabled(name.to_string()))
        }
    }

    /// Write a toggle. Locked toggles only accept privileged writes.
    pub fn set(&self, name: &str, enabled: bool, privileged: bool) -> Result<FeatureToggle> {
        let updated = self.store.set_toggle(name, enabled, !privileged)?;
        if !updated {
            // Distinguish a missing row from a lock rejection.
            match self.store.get_toggle(name)? {
                Some(toggle) if toggle.locked => {
                    return Err(ControlError::ToggleLocked {
                        name: name.to_string(),
                    });
                }
                Some(_) => {}
                None => {
                    return Err(ControlError::NotFound {
                        kind: "toggle",
                        id: name.to_string(),
                    });
                }
            }
        }
        {
            let mut cache = self.cache.write().unwrap_or_else(|p| p.into_inner());
            cache.remove(name);
        }
        info!(toggle = name, enabled, privileged, "toggle updated");
        self.store
            .insert_audit("toggle.set", name, &format!("enabled={enabled} privileged={privileged}"))?;
        self.get(name)
    }

    pub fn list(&self) -> Result<Vec<FeatureToggle>> {
        self.store.list_toggles()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ToggleRegistry {
        let store = Arc::new(Store::open_in_memory().unwrap());
        ToggleRegistry::new(store, Duration::from_secs(10))
    }

    #[test]
    fn test_enforce_disabled_toggle() {
        let reg = registry();
        reg.store.seed_toggle("beta_ops", false, false, None).unwrap();
        let err = reg.enforce("beta_ops").unwrap_err();
        assert!(matches!(err, ControlError::OperationDisabled(_)));
    }

    #[test]
    fn test_enforce_locked_disabled_toggle() {
        let reg = registry();
        reg.store
            .seed_toggle("expensive_ops", false, true, Some("platform"))
            .unwrap();
        let err = reg.enforce("expensive_ops").unwrap_err();
        assert!(matches!(err, ControlError::ToggleLocked { .. }));
    }

    #[test]
    fn test_unprivileged_write_to_locked_rejected() {
        let reg = registry();
        reg.store
            .seed_toggle("expensive_ops", true, true, Some("platform"))
            .unwrap();
        let err = reg.set("expensive_ops", false, false).unwrap_err();
        assert!(matches!(err, ControlError::ToggleLocked { .. }));
        // State unchanged.
        assert!(reg.get("expensive_ops").unwrap().enabled);
    }

    #[test]
    fn test_privileged_write_and_cache_invalidation() {
        let reg = registry();
        reg.store
            .seed_toggle("expensive_ops", true, true, Some("platform"))
            .unwrap();
        // Prime the cache.
        assert!(reg.get("expensive_ops").unwrap().enabled);
        let toggle = reg.set("expensive_ops", false, true).unwrap();
        assert!(!toggle.enabled);
        // Cache was invalidated, not serving the stale value.
        assert!(!reg.get("expensive_ops").unwrap().enabled);
    }

    #[test]
    fn test_unknown_toggle_not_found() {
        let reg = registry();
        let err = reg.get("ghost").unwrap_err();
        assert!(matches!(err, ControlError::NotFound { .. }));
    }
}
