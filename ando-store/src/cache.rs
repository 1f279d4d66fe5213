use ando_core::canary::CanaryGroup;
use ando_core::consumer::Consumer;
use ando_core::plugin_config::PluginConfig;
use ando_core::route::Route;
use ando_core::service::Service;
use ando_core::ssl::SslCert;
use ando_core::upstream::Upstream;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// In-memory configuration cache for zero-latency lookups.
///
/// The cache is populated from etcd on startup and kept in sync
/// via the ConfigWatcher. All proxy decisions read from this cache
/// rather than hitting etcd on every request.
#[derive(Clone)]
pub struct ConfigCache {
    pub routes: Arc<DashMap<String, Route>>,
    pub services: Arc<DashMap<String, Service>>,
    pub upstreams: Arc<DashMap<String, Upstream>>,
    pub consumers: Arc<DashMap<String, Consumer>>,
    pub ssl_certs: Arc<DashMap<String, SslCert>>,
    pub plugin_configs: Arc<DashMap<String, PluginConfig>>,
    pub canary_groups: Arc<DashMap<String, CanaryGroup>>,
    /// key-auth credential -> username, rebuilt whenever consumers change.
    /// Kept separate from `consumers` so the proxy hot path never has to
    /// scan every consumer's plugin config to validate an API key.
    pub consumer_key_index: Arc<DashMap<String, String>>,
}

impl ConfigCache {
    pub fn new() -> Self {
        Self {
            routes: Arc::new(DashMap::new()),
            services: Arc::new(DashMap::new()),
            upstreams: Arc::new(DashMap::new()),
            consumers: Arc::new(DashMap::new()),
            ssl_certs: Arc::new(DashMap::new()),
            plugin_configs: Arc::new(DashMap::new()),
            canary_groups: Arc::new(DashMap::new()),
            consumer_key_index: Arc::new(DashMap::new()),
        }
    }

    /// Snapshot all active routes as owned values, for router rebuilds.
    pub fn all_routes(&self) -> Vec<Route> {
        self.routes.iter().map(|r| r.value().clone()).collect()
    }

    /// Look up the consumer owning a key-auth credential.
    pub fn find_consumer_by_key(&self, key: &str) -> Option<Consumer> {
        let username = self.consumer_key_index.get(key)?;
        self.consumers.get(username.as_str()).map(|c| c.value().clone())
    }

    /// Rebuild the key-auth credential index from the current consumer set.
    /// Called after any consumer add/remove/update.
    pub fn rebuild_consumer_key_index(&self) {
        self.consumer_key_index.clear();
        for entry in self.consumers.iter() {
            let consumer = entry.value();
            if let Some(key_auth) = consumer.plugins.get("key-auth")
                && let Some(key) = key_auth.get("key").and_then(|v| v.as_str())
            {
                self.consumer_key_index.insert(key.to_string(), consumer.username.clone());
            }
        }
    }

    /// Apply a change event from etcd.
    pub fn apply_change(&self, resource_type: &str, id: &str, value: Option<&str>) {
        match resource_type {
            "routes" => {
                if let Some(val) = value {
                    match serde_json::from_str::<Route>(val) {
                        Ok(route) => {
                            self.routes.insert(id.to_string(), route);
                            debug!(resource = "route", id = id, "Cache updated");
                        }
                        Err(e) => tracing::error!(error = %e, "Failed to deserialize route"),
                    }
                } else {
                    self.routes.remove(id);
                    debug!(resource = "route", id = id, "Cache removed");
                }
            }
            "services" => {
                if let Some(val) = value {
                    if let Ok(service) = serde_json::from_str::<Service>(val) {
                        self.services.insert(id.to_string(), service);
                    }
                } else {
                    self.services.remove(id);
                }
            }
            "upstreams" => {
                if let Some(val) = value {
                    if let Ok(upstream) = serde_json::from_str::<Upstream>(val) {
                        self.upstreams.insert(id.to_string(), upstream);
                    }
                } else {
                    self.upstreams.remove(id);
                }
            }
            "consumers" => {
                if let Some(val) = value {
                    if let Ok(consumer) = serde_json::from_str::<Consumer>(val) {
                        self.consumers.insert(id.to_string(), consumer);
                    }
                } else {
                    self.consumers.remove(id);
                }
                self.rebuild_consumer_key_index();
            }
            "canary" => {
                if let Some(val) = value {
                    match serde_json::from_str::<CanaryGroup>(val) {
                        Ok(group) => {
                            self.canary_groups.insert(id.to_string(), group);
                            debug!(resource = "canary", id = id, "Cache updated");
                        }
                        Err(e) => tracing::error!(error = %e, "Failed to deserialize canary group"),
                    }
                } else {
                    self.canary_groups.remove(id);
                }
            }
            "ssl" => {
                if let Some(val) = value {
                    if let Ok(cert) = serde_json::from_str::<SslCert>(val) {
                        self.ssl_certs.insert(id.to_string(), cert);
                    }
                } else {
                    self.ssl_certs.remove(id);
                }
            }
            "plugin_configs" => {
                if let Some(val) = value {
                    if let Ok(config) = serde_json::from_str::<PluginConfig>(val) {
                        self.plugin_configs.insert(id.to_string(), config);
                    }
                } else {
                    self.plugin_configs.remove(id);
                }
            }
            _ => {
                tracing::warn!(resource_type = resource_type, "Unknown resource type in cache");
            }
        }
    }

    /// Get cache statistics.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            routes: self.routes.len(),
            services: self.services.len(),
            upstreams: self.upstreams.len(),
            consumers: self.consumers.len(),
            ssl_certs: self.ssl_certs.len(),
            plugin_configs: self.plugin_configs.len(),
            canary_groups: self.canary_groups.len(),
        }
    }
}

impl Default for ConfigCache {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct CacheStats {
    pub routes: usize,
    pub services: usize,
    pub upstreams: usize,
    pub consumers: usize,
    pub ssl_certs: usize,
    pub plugin_configs: usize,
    pub canary_groups: usize,
}

impl std::fmt::Display for CacheStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "routes={}, services={}, upstreams={}, consumers={}, ssl={}, plugin_configs={}, canary_groups={}",
            self.routes,
            self.services,
            self.upstreams,
            self.consumers,
            self.ssl_certs,
            self.plugin_configs,
            self.canary_groups
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consumer_key_index_rebuilds_on_apply_change() {
        let cache = ConfigCache::new();
        cache.apply_change(
            "consumers",
            "alice",
            Some(r#"{"username":"alice","plugins":{"key-auth":{"key":"secret"}}}"#),
        );
        assert_eq!(
            cache.consumer_key_index.get("secret").map(|v| v.clone()),
            Some("alice".to_string())
        );

        cache.apply_change("consumers", "alice", None);
        assert!(cache.consumer_key_index.get("secret").is_none());
    }

    #[test]
    fn canary_apply_change_inserts_and_removes() {
        let cache = ConfigCache::new();
        cache.apply_change(
            "canary",
            "g1",
            Some(r#"{"group_id":"g1","strategy":{"type":"weighted"},"versions":[{"version":"v1","upstream_id":"u1","weight":100}]}"#),
        );
        assert!(cache.canary_groups.contains_key("g1"));
        cache.apply_change("canary", "g1", None);
        assert!(!cache.canary_groups.contains_key("g1"));
    }
}
