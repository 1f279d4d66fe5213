use async_trait::async_trait;
use std::time::Duration;

/// Minimal liveness signal for a KV backend, surfaced by the admin API's
/// readiness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unavailable,
}

/// Atomic key-value store abstraction shared by the rate-limit engine (C3)
/// and anything else that needs a linearizable counter or a small blob with
/// a TTL, backed either by a single process's memory or a distributed store.
///
/// `ttl` mirrors the redis convention: -2 means the key is absent, -1 means
/// the key exists with no expiry.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn incr_by(&self, key: &str, delta: i64) -> anyhow::Result<i64>;
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> anyhow::Result<()>;
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>>;
    async fn delete(&self, key: &str) -> anyhow::Result<()>;
    async fn exists(&self, key: &str) -> anyhow::Result<bool>;
    async fn ttl(&self, key: &str) -> anyhow::Result<i64>;
    async fn health(&self) -> HealthStatus;
    async fn close(&self);
}

struct Entry {
    value: Vec<u8>,
    expires_at: Option<std::time::Instant>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        matches!(self.expires_at, Some(t) if t <= std::time::Instant::now())
    }
}

/// In-process KV store for standalone deployments and tests. Uses
/// DashMap's sharded per-key locking — the same concurrency primitive the
/// rest of the workspace reaches for instead of a single `Mutex<HashMap>`.
pub struct MemoryKvStore {
    entries: std::sync::Arc<dashmap::DashMap<String, Entry>>,
    sweeper: Option<tokio::task::JoinHandle<()>>,
}

impl MemoryKvStore {
    /// Construct a store with a background sweeper that evicts expired
    /// entries every 60s (matches `health_check.rs`'s `tokio::spawn` +
    /// `interval` idiom for periodic background work).
    pub fn new() -> Self {
        let entries: std::sync::Arc<dashmap::DashMap<String, Entry>> =
            std::sync::Arc::new(dashmap::DashMap::new());
        let sweep_entries = std::sync::Arc::clone(&entries);
        let sweeper = tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(60));
            loop {
                tick.tick().await;
                sweep_entries.retain(|_, e| !e.is_expired());
            }
        });
        Self { entries, sweeper: Some(sweeper) }
    }

    /// Construct a store with no background sweeper — useful in unit tests
    /// that don't run inside a tokio runtime with time enabled.
    pub fn without_sweeper() -> Self {
        Self { entries: std::sync::Arc::new(dashmap::DashMap::new()), sweeper: None }
    }
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryKvStore {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn incr_by(&self, key: &str, delta: i64) -> anyhow::Result<i64> {
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: b"0".to_vec(),
            expires_at: None,
        });
        if entry.is_expired() {
            entry.value = b"0".to_vec();
            entry.expires_at = None;
        }
        let current: i64 = std::str::from_utf8(&entry.value)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        let next = current + delta;
        entry.value = next.to_string().into_bytes();
        Ok(next)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> anyhow::Result<()> {
        let expires_at = if ttl.is_zero() { None } else { Some(std::time::Instant::now() + ttl) };
        self.entries.insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        match self.entries.get(key) {
            Some(e) if !e.is_expired() => Ok(Some(e.value.clone())),
            Some(_) => {
                self.entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> anyhow::Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn ttl(&self, key: &str) -> anyhow::Result<i64> {
        match self.entries.get(key) {
            Some(e) if e.is_expired() => Ok(-2),
            Some(e) => match e.expires_at {
                None => Ok(-1),
                Some(t) => Ok(t.saturating_duration_since(std::time::Instant::now()).as_secs() as i64),
            },
            None => Ok(-2),
        }
    }

    async fn health(&self) -> HealthStatus {
        HealthStatus::Healthy
    }

    async fn close(&self) {}
}

/// Distributed KV store backed by etcd. `incr_by` uses etcd's transactional
/// `Txn` (compare-and-swap on the prior value) for linearizability,
/// matching `EtcdStore`'s existing `client.put`/`client.get` usage pattern.
#[cfg(feature = "etcd")]
pub struct EtcdKvStore {
    client: std::sync::Arc<tokio::sync::Mutex<etcd_client::Client>>,
}

#[cfg(feature = "etcd")]
impl EtcdKvStore {
    pub async fn connect(endpoints: &[String]) -> anyhow::Result<Self> {
        let client = etcd_client::Client::connect(endpoints, None).await?;
        Ok(Self { client: std::sync::Arc::new(tokio::sync::Mutex::new(client)) })
    }
}

#[cfg(feature = "etcd")]
#[async_trait]
impl KvStore for EtcdKvStore {
    async fn incr_by(&self, key: &str, delta: i64) -> anyhow::Result<i64> {
        use etcd_client::{Compare, CompareOp, Txn, TxnOp};

        loop {
            let mut client = self.client.lock().await;
            let get_resp = client.get(key, None).await?;
            let (current, mod_revision) = match get_resp.kvs().first() {
                Some(kv) => {
                    let v: i64 = std::str::from_utf8(kv.value())
                        .ok()
                        .and_then(|s| s.parse().ok())
                        .unwrap_or(0);
                    (v, kv.mod_revision())
                }
                None => (0, 0),
            };
            let next = current + delta;

            let txn = Txn::new()
                .when(vec![Compare::mod_revision(key, CompareOp::Equal, mod_revision)])
                .and_then(vec![TxnOp::put(key, next.to_string(), None)]);
            let txn_resp = client.txn(txn).await?;
            if txn_resp.succeeded() {
                return Ok(next);
            }
            // Lost the race to a concurrent writer — retry.
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> anyhow::Result<()> {
        let mut client = self.client.lock().await;
        if ttl.is_zero() {
            client.put(key, value, None).await?;
        } else {
            let lease = client.lease_grant(ttl.as_secs().max(1) as i64, None).await?;
            let opts = etcd_client::PutOptions::new().with_lease(lease.id());
            client.put(key, value, Some(opts)).await?;
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let mut client = self.client.lock().await;
        let resp = client.get(key, None).await?;
        Ok(resp.kvs().first().map(|kv| kv.value().to_vec()))
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        let mut client = self.client.lock().await;
        client.delete(key, None).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> anyhow::Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn ttl(&self, key: &str) -> anyhow::Result<i64> {
        let mut client = self.client.lock().await;
        let resp = client.get(key, None).await?;
        match resp.kvs().first() {
            None => Ok(-2),
            Some(kv) if kv.lease() == 0 => Ok(-1),
            Some(kv) => {
                let ttl_resp = client.lease_time_to_live(kv.lease(), None).await?;
                Ok(ttl_resp.ttl().max(-1))
            }
        }
    }

    async fn health(&self) -> HealthStatus {
        let mut client = self.client.lock().await;
        match client.status().await {
            Ok(_) => HealthStatus::Healthy,
            Err(_) => HealthStatus::Unavailable,
        }
    }

    async fn close(&self) {}
}
