use ando_plugin::plugin::{Phase, Plugin, PluginContext, PluginInstance, PluginResult};
use ando_proxy::ratelimit::{
    FixedWindowLimiter, IdentifierStrategy, LocalRateLimitBackend, Quota, TokenBucketLimiter,
};
use serde::Deserialize;
use std::collections::HashMap;

/// Rate-limiting plugin, backed by the gateway's shared fixed-window /
/// token-bucket engine (`ando_proxy::ratelimit`). Local-memory only here;
/// a distributed backend requires wiring a `KvStore` handle through the
/// plugin registry, which the admin/control plane does not yet expose.
pub struct RateLimitingPlugin;

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
enum Algorithm {
    FixedWindow,
    TokenBucket,
}

fn default_algorithm() -> Algorithm {
    Algorithm::FixedWindow
}

fn default_limit_by() -> String {
    "ip".to_string()
}

#[derive(Debug, Deserialize, Clone)]
struct RateLimitingConfig {
    #[serde(default = "default_algorithm")]
    algorithm: Algorithm,
    /// Fixed window: max requests per `window_seconds`.
    #[serde(default = "default_max_requests")]
    max_requests: u64,
    #[serde(default = "default_window_seconds")]
    window_seconds: u64,
    /// Token bucket: sustained rate and burst capacity.
    #[serde(default = "default_rate_per_sec")]
    rate: f64,
    #[serde(default = "default_max_requests")]
    burst: u64,
    /// Identifier strategy: "ip" | "user" | "api_key" | "combined".
    #[serde(default = "default_limit_by")]
    limit_by: String,
    #[serde(default)]
    custom_headers: HashMap<String, String>,
}

fn default_max_requests() -> u64 {
    60
}
fn default_window_seconds() -> u64 {
    60
}
fn default_rate_per_sec() -> f64 {
    1.0
}

struct RateLimitingInstance {
    backend: LocalRateLimitBackend,
    algorithm: Algorithm,
    max_requests: u64,
    window: std::time::Duration,
    rate: f64,
    burst: u64,
    identifier_strategy: IdentifierStrategy,
    custom_headers: HashMap<String, String>,
}

impl RateLimitingInstance {
    fn check(&self, identifier: &str) -> (bool, Quota) {
        match self.algorithm {
            Algorithm::FixedWindow => {
                let limiter = FixedWindowLimiter::new(
                    &self.backend,
                    ando_proxy::ratelimit::default_prefix(),
                    self.max_requests,
                    self.window,
                );
                limiter.check(identifier)
            }
            Algorithm::TokenBucket => {
                let limiter = TokenBucketLimiter::new(
                    &self.backend,
                    ando_proxy::ratelimit::default_prefix(),
                    self.rate,
                    self.burst,
                );
                limiter.check(identifier)
            }
        }
    }
}

impl Plugin for RateLimitingPlugin {
    fn name(&self) -> &str {
        "rate-limiting"
    }

    fn priority(&self) -> i32 {
        1001 // APISIX default priority for limit-req
    }

    fn phases(&self) -> &[Phase] {
        &[Phase::Access]
    }

    fn configure(&self, config: &serde_json::Value) -> anyhow::Result<Box<dyn PluginInstance>> {
        let cfg: RateLimitingConfig = serde_json::from_value(config.clone())?;

        Ok(Box::new(RateLimitingInstance {
            backend: LocalRateLimitBackend::new(),
            algorithm: cfg.algorithm,
            max_requests: cfg.max_requests,
            window: std::time::Duration::from_secs(cfg.window_seconds),
            rate: cfg.rate,
            burst: cfg.burst,
            identifier_strategy: IdentifierStrategy::parse(&cfg.limit_by),
            custom_headers: cfg.custom_headers,
        }))
    }
}

impl PluginInstance for RateLimitingInstance {
    fn name(&self) -> &str {
        "rate-limiting"
    }

    fn priority(&self) -> i32 {
        1001
    }

    fn access(&self, ctx: &mut PluginContext) -> PluginResult {
        let api_key = ctx.get_var("_key_auth_key").and_then(|v| v.as_str()).map(str::to_string);
        let identifier = self.identifier_strategy.identifier(
            &ctx.client_ip,
            ctx.consumer.as_deref(),
            api_key.as_deref(),
        );

        let (allowed, quota) = self.check(&identifier);

        ctx.set_response_header("X-RateLimit-Limit".to_string(), quota.limit.to_string());
        ctx.set_response_header("X-RateLimit-Remaining".to_string(), quota.remaining.to_string());
        ctx.set_response_header("X-RateLimit-Reset".to_string(), quota.reset_time.to_string());

        if allowed {
            return PluginResult::Continue;
        }

        let mut headers = vec![
            ("content-type".to_string(), "application/json".to_string()),
            ("X-RateLimit-Limit".to_string(), quota.limit.to_string()),
            ("X-RateLimit-Remaining".to_string(), quota.remaining.to_string()),
            ("X-RateLimit-Reset".to_string(), quota.reset_time.to_string()),
            ("Retry-After".to_string(), quota.retry_after.to_string()),
        ];
        for (name, value) in &self.custom_headers {
            headers.push((name.clone(), value.clone()));
        }

        let body = serde_json::json!({
            "error": "Too Many Requests",
            "code": 429,
            "message": "rate limit exceeded",
            "limit": quota.limit,
            "remaining": quota.remaining,
            "reset_time": quota.reset_time_rfc3339(),
            "retry_after": quota.retry_after,
        });

        PluginResult::Response {
            status: 429,
            headers,
            body: Some(body.to_string().into_bytes()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    fn ctx(ip: &str) -> PluginContext {
        PluginContext::new("r1".into(), ip.into(), "GET".into(), "/".into(), Map::new())
    }

    #[test]
    fn fixed_window_denies_after_limit() {
        let plugin = RateLimitingPlugin;
        let inst = plugin
            .configure(&serde_json::json!({"algorithm": "fixed_window", "max_requests": 2, "window_seconds": 60}))
            .unwrap();

        assert!(matches!(inst.access(&mut ctx("1.1.1.1")), PluginResult::Continue));
        assert!(matches!(inst.access(&mut ctx("1.1.1.1")), PluginResult::Continue));
        match inst.access(&mut ctx("1.1.1.1")) {
            PluginResult::Response { status, .. } => assert_eq!(status, 429),
            PluginResult::Continue => panic!("third request must be denied"),
        }
    }

    #[test]
    fn token_bucket_allows_burst() {
        let plugin = RateLimitingPlugin;
        let inst = plugin
            .configure(&serde_json::json!({"algorithm": "token_bucket", "rate": 1.0, "burst": 2}))
            .unwrap();

        assert!(matches!(inst.access(&mut ctx("x")), PluginResult::Continue));
        assert!(matches!(inst.access(&mut ctx("x")), PluginResult::Continue));
        match inst.access(&mut ctx("x")) {
            PluginResult::Response { status, .. } => assert_eq!(status, 429),
            PluginResult::Continue => panic!("bucket must be exhausted"),
        }
    }

    #[test]
    fn distinct_identifiers_have_isolated_quota() {
        let plugin = RateLimitingPlugin;
        let inst = plugin
            .configure(&serde_json::json!({"algorithm": "fixed_window", "max_requests": 1, "window_seconds": 60}))
            .unwrap();

        assert!(matches!(inst.access(&mut ctx("a")), PluginResult::Continue));
        assert!(matches!(inst.access(&mut ctx("b")), PluginResult::Continue));
    }
}
