//! Rate-limit engine (fixed window + token bucket), shared by the
//! `rate-limiting` plugin. Built against a sync-facing backend so it can be
//! called directly from `Plugin::access()` on the monoio hot path without an
//! async rewrite of the plugin pipeline. `DistributedRateLimitBackend`
//! bridges to `ando_store::kv::KvStore` (async) via a cloned
//! `tokio::runtime::Handle`, since the admin/control-plane side of this
//! gateway already runs its own tokio runtime alongside the monoio workers.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const DEFAULT_PREFIX: &str = "ratelimit:";

/// A single rate-limit decision, mirroring §6's wire shape exactly.
#[derive(Debug, Clone, Copy)]
pub struct Quota {
    pub limit: u64,
    pub remaining: u64,
    /// Unix seconds at which the current window/bucket resets.
    pub reset_time: i64,
    pub retry_after: i64,
}

impl Quota {
    pub fn reset_time_rfc3339(&self) -> String {
        let dt = chrono::DateTime::<chrono::Utc>::from(
            UNIX_EPOCH + Duration::from_secs(self.reset_time.max(0) as u64),
        );
        dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
    }
}

/// Backend used by the limiters to store counters/bucket state. Sync,
/// fail-open is the caller's responsibility (limiters treat `Err` as
/// "allow" per §4.3 — not a backend concern).
pub trait RateLimitBackend: Send + Sync {
    /// Atomically add `delta` to the integer stored at `key`, initializing
    /// it to 0 (with the given TTL) if absent, and return the new value.
    fn incr_by(&self, key: &str, delta: i64, ttl: Duration) -> anyhow::Result<i64>;
    /// Read the raw integer stored at `key`, or `None` if absent/expired.
    fn get_i64(&self, key: &str) -> anyhow::Result<Option<i64>>;
    fn set_i64(&self, key: &str, value: i64, ttl: Duration) -> anyhow::Result<()>;
}

fn now_unix() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

// ── Local (in-process) backend ──────────────────────────────────────

struct LocalEntry {
    value: AtomicI64,
    expires_at: std::sync::atomic::AtomicI64, // unix seconds, 0 = no expiry
}

/// `map[identifier -> bucket]` guarded by DashMap's sharded locking — the
/// teacher's established concurrency primitive for in-memory maps,
/// generalized from `rate_limiting.rs`'s plain `Mutex<HashMap<..>>` counter.
pub struct LocalRateLimitBackend {
    entries: dashmap::DashMap<String, LocalEntry>,
}

impl LocalRateLimitBackend {
    pub fn new() -> Self {
        Self { entries: dashmap::DashMap::new() }
    }

    /// Evict identifiers whose state is older than `max_idle` — mirrors the
    /// local-memory variant's "cleanup goroutine evicts identifiers whose
    /// last_refill is older than 10 minutes" behavior. Call periodically
    /// from a background sweeper (the same one driving C1's sweeper and
    /// C5's cooldown checks).
    pub fn sweep(&self, max_idle: Duration) {
        let now = now_unix();
        let cutoff = max_idle.as_secs() as i64;
        self.entries.retain(|_, e| {
            let exp = e.expires_at.load(Ordering::Relaxed);
            exp == 0 || now - exp < cutoff
        });
    }
}

impl Default for LocalRateLimitBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimitBackend for LocalRateLimitBackend {
    fn incr_by(&self, key: &str, delta: i64, ttl: Duration) -> anyhow::Result<i64> {
        let now = now_unix();
        let expires_at = now + ttl.as_secs() as i64;
        let entry = self.entries.entry(key.to_string()).or_insert_with(|| LocalEntry {
            value: AtomicI64::new(0),
            expires_at: std::sync::atomic::AtomicI64::new(expires_at),
        });
        let stored_exp = entry.expires_at.load(Ordering::Relaxed);
        if stored_exp != 0 && stored_exp <= now {
            entry.value.store(0, Ordering::Relaxed);
            entry.expires_at.store(expires_at, Ordering::Relaxed);
        }
        Ok(entry.value.fetch_add(delta, Ordering::Relaxed) + delta)
    }

    fn get_i64(&self, key: &str) -> anyhow::Result<Option<i64>> {
        let now = now_unix();
        match self.entries.get(key) {
            Some(e) => {
                let exp = e.expires_at.load(Ordering::Relaxed);
                if exp != 0 && exp <= now {
                    Ok(None)
                } else {
                    Ok(Some(e.value.load(Ordering::Relaxed)))
                }
            }
            None => Ok(None),
        }
    }

    fn set_i64(&self, key: &str, value: i64, ttl: Duration) -> anyhow::Result<()> {
        let expires_at = if ttl.is_zero() { 0 } else { now_unix() + ttl.as_secs() as i64 };
        self.entries.insert(
            key.to_string(),
            LocalEntry { value: AtomicI64::new(value), expires_at: std::sync::atomic::AtomicI64::new(expires_at) },
        );
        Ok(())
    }
}

// ── Distributed backend, bridging to the async C1 KvStore ──────────

/// Bridges the sync `RateLimitBackend` contract to the async
/// `ando_store::kv::KvStore` trait via `Handle::block_on`. Legitimate
/// cross-runtime bridging: the monoio worker thread blocks briefly on a
/// tokio future, the same pattern used nowhere else on the hot path today
/// but explainable since the admin/watcher side of this gateway already
/// owns a tokio runtime whose `Handle` can be cloned into worker threads.
pub struct DistributedRateLimitBackend {
    store: std::sync::Arc<dyn ando_store::kv::KvStore>,
    handle: tokio::runtime::Handle,
}

impl DistributedRateLimitBackend {
    pub fn new(store: std::sync::Arc<dyn ando_store::kv::KvStore>, handle: tokio::runtime::Handle) -> Self {
        Self { store, handle }
    }
}

impl RateLimitBackend for DistributedRateLimitBackend {
    fn incr_by(&self, key: &str, delta: i64, ttl: Duration) -> anyhow::Result<i64> {
        let store = std::sync::Arc::clone(&self.store);
        let key = key.to_string();
        self.handle.block_on(async move {
            if !store.exists(&key).await? {
                store.set(&key, b"0".to_vec(), ttl).await?;
            }
            store.incr_by(&key, delta).await
        })
    }

    fn get_i64(&self, key: &str) -> anyhow::Result<Option<i64>> {
        let store = std::sync::Arc::clone(&self.store);
        let key = key.to_string();
        self.handle.block_on(async move {
            Ok(store
                .get(&key)
                .await?
                .and_then(|bytes| std::str::from_utf8(&bytes).ok().and_then(|s| s.parse().ok())))
        })
    }

    fn set_i64(&self, key: &str, value: i64, ttl: Duration) -> anyhow::Result<()> {
        let store = std::sync::Arc::clone(&self.store);
        let key = key.to_string();
        let bytes = value.to_string().into_bytes();
        self.handle.block_on(async move { store.set(&key, bytes, ttl).await })
    }
}

// ── Fixed window ─────────────────────────────────────────────────────

pub struct FixedWindowLimiter<'a> {
    backend: &'a dyn RateLimitBackend,
    prefix: &'a str,
    max_requests: u64,
    window: Duration,
}

impl<'a> FixedWindowLimiter<'a> {
    pub fn new(backend: &'a dyn RateLimitBackend, prefix: &'a str, max_requests: u64, window: Duration) -> Self {
        Self { backend, prefix, max_requests, window }
    }

    fn window_start(&self, now_ns: u128) -> i64 {
        let window_ns = self.window.as_nanos().max(1);
        ((now_ns / window_ns) * window_ns / 1_000_000_000) as i64
    }

    fn key(&self, identifier: &str, window_start: i64) -> String {
        format!("{}{}:fw:{}", self.prefix, identifier, window_start)
    }

    /// Returns `(allowed, quota)`. Fails open on any backend error.
    pub fn check(&self, identifier: &str) -> (bool, Quota) {
        let now_ns = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos();
        let window_start = self.window_start(now_ns);
        let key = self.key(identifier, window_start);
        let reset_time = window_start + self.window.as_secs() as i64;

        match self.backend.incr_by(&key, 1, self.window) {
            Ok(count) => {
                let allowed = count as u64 <= self.max_requests;
                let remaining = self.max_requests.saturating_sub(count.max(0) as u64);
                (
                    allowed,
                    Quota {
                        limit: self.max_requests,
                        remaining,
                        reset_time,
                        retry_after: (reset_time - now_unix()).max(0),
                    },
                )
            }
            Err(e) => {
                tracing::warn!(error = %e, "rate-limit backend error, failing open");
                (true, Quota { limit: self.max_requests, remaining: self.max_requests, reset_time, retry_after: 0 })
            }
        }
    }
}

// ── Token bucket ─────────────────────────────────────────────────────

pub struct TokenBucketLimiter<'a> {
    backend: &'a dyn RateLimitBackend,
    prefix: &'a str,
    rate_per_sec: f64,
    burst: u64,
}

impl<'a> TokenBucketLimiter<'a> {
    pub fn new(backend: &'a dyn RateLimitBackend, prefix: &'a str, rate_per_sec: f64, burst: u64) -> Self {
        Self { backend, prefix, rate_per_sec, burst }
    }

    fn tokens_key(&self, identifier: &str) -> String {
        format!("{}{}:tb:tokens", self.prefix, identifier)
    }
    fn last_key(&self, identifier: &str) -> String {
        format!("{}{}:tb:last", self.prefix, identifier)
    }

    fn ttl(&self) -> Duration {
        let horizon = if self.rate_per_sec > 0.0 { self.burst as f64 / self.rate_per_sec } else { 60.0 };
        Duration::from_secs_f64(horizon.max(60.0))
    }

    /// Returns `(allowed, quota)`. Fails open on any backend error.
    pub fn check(&self, identifier: &str) -> (bool, Quota) {
        let now = now_unix();
        let tokens_key = self.tokens_key(identifier);
        let last_key = self.last_key(identifier);

        let result: anyhow::Result<(bool, i64)> = (|| {
            let last = self.backend.get_i64(&last_key)?.unwrap_or(now);
            let tokens = self.backend.get_i64(&tokens_key)?.unwrap_or(self.burst as i64);

            let elapsed = (now - last).max(0) as f64;
            let refilled = (tokens as f64 + elapsed * self.rate_per_sec).min(self.burst as f64);

            let (allowed, remaining) =
                if refilled >= 1.0 { (true, refilled - 1.0) } else { (false, refilled) };

            let ttl = self.ttl();
            self.backend.set_i64(&tokens_key, remaining.trunc() as i64, ttl)?;
            self.backend.set_i64(&last_key, now, ttl)?;
            Ok((allowed, remaining.trunc() as i64))
        })();

        match result {
            Ok((allowed, remaining)) => {
                let retry_after = if allowed || self.rate_per_sec <= 0.0 {
                    0
                } else {
                    ((1.0 - remaining as f64) / self.rate_per_sec).ceil().max(0.0) as i64
                };
                (
                    allowed,
                    Quota {
                        limit: self.burst,
                        remaining: remaining.max(0) as u64,
                        reset_time: now + retry_after.max(1),
                        retry_after,
                    },
                )
            }
            Err(e) => {
                tracing::warn!(error = %e, "rate-limit backend error, failing open");
                (true, Quota { limit: self.burst, remaining: self.burst, reset_time: now, retry_after: 0 })
            }
        }
    }
}

/// How to derive the rate-limit identifier from a request, per §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifierStrategy {
    Ip,
    User,
    ApiKey,
    Combined,
}

impl IdentifierStrategy {
    pub fn parse(s: &str) -> Self {
        match s {
            "user" => Self::User,
            "api_key" | "apikey" => Self::ApiKey,
            "combined" => Self::Combined,
            _ => Self::Ip,
        }
    }

    pub fn identifier(&self, client_ip: &str, consumer: Option<&str>, api_key: Option<&str>) -> String {
        match self {
            Self::Ip => client_ip.to_string(),
            Self::User => consumer.unwrap_or(client_ip).to_string(),
            Self::ApiKey => api_key.unwrap_or(client_ip).to_string(),
            Self::Combined => format!("{}:{}", client_ip, consumer.or(api_key).unwrap_or("anonymous")),
        }
    }
}

pub fn default_prefix() -> &'static str {
    DEFAULT_PREFIX
}
