use serde_json::Value;
use std::collections::HashMap;

/// Plugin execution phases, matching APISIX's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Phase {
    /// Modify request before routing takes place
    Rewrite = 0,
    /// Authentication, authorization, rate limiting
    Access = 1,
    /// Just before proxying to upstream
    BeforeProxy = 2,
    /// Modify response headers from upstream
    HeaderFilter = 3,
    /// Modify response body from upstream
    BodyFilter = 4,
    /// Post-response logging (non-blocking)
    Log = 5,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Rewrite => "rewrite",
            Phase::Access => "access",
            Phase::BeforeProxy => "before_proxy",
            Phase::HeaderFilter => "header_filter",
            Phase::BodyFilter => "body_filter",
            Phase::Log => "log",
        }
    }

    pub fn all() -> &'static [Phase] {
        &[
            Phase::Rewrite,
            Phase::Access,
            Phase::BeforeProxy,
            Phase::HeaderFilter,
            Phase::BodyFilter,
            Phase::Log,
        ]
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of plugin execution.
///
/// There is deliberately no `Error` variant: a plugin that cannot do its
/// job degrades to `Continue` or an explicit `Response` (401/429/...).
/// Errors are never flow control on the hot path.
#[derive(Debug)]
pub enum PluginResult {
    /// Continue to the next plugin / phase
    Continue,

    /// Short-circuit with a response (e.g., 401, 403, 429)
    Response {
        status: u16,
        headers: Vec<(String, String)>,
        body: Option<Vec<u8>>,
    },
}

/// Mutable context passed through the plugin pipeline for a single request.
///
/// Built once per request on the slow (has-plugins) path and threaded
/// through every phase. Header maps use lowercase keys throughout so
/// plugins never need to re-normalize casing.
pub struct PluginContext {
    pub route_id: String,
    pub client_ip: String,
    pub method: String,
    pub path: String,

    pub request_headers: HashMap<String, String>,
    pub response_headers: HashMap<String, String>,

    /// Shared scratch space between plugins within one request.
    pub vars: HashMap<String, Value>,

    /// Consumer/subject identified by an auth plugin (username, JWT `sub`, …).
    pub consumer: Option<String>,

    pub request_start: std::time::Instant,
}

impl PluginContext {
    pub fn new(
        route_id: String,
        client_ip: String,
        method: String,
        path: String,
        request_headers: HashMap<String, String>,
    ) -> Self {
        Self {
            route_id,
            client_ip,
            method,
            path,
            request_headers,
            response_headers: HashMap::new(),
            vars: HashMap::new(),
            consumer: None,
            request_start: std::time::Instant::now(),
        }
    }

    /// Get a request header. Keys are stored lowercase; the lookup
    /// lowercases `name` defensively so callers can pass either case.
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.request_headers.get(&name.to_lowercase()).map(|v| v.as_str())
    }

    /// Set a response header.
    pub fn set_response_header(&mut self, name: String, value: String) {
        self.response_headers.insert(name, value);
    }

    /// Get elapsed time since request start.
    pub fn elapsed_ms(&self) -> f64 {
        self.request_start.elapsed().as_secs_f64() * 1000.0
    }

    /// Get a context variable.
    pub fn get_var(&self, key: &str) -> Option<&Value> {
        self.vars.get(key)
    }

    /// Set a context variable (shared between plugins).
    pub fn set_var(&mut self, key: String, value: Value) {
        self.vars.insert(key, value);
    }
}

/// A plugin factory: validates and compiles a JSON config into a
/// [`PluginInstance`] once per route (cached by the proxy worker).
pub trait Plugin: Send + Sync {
    /// Plugin name (must be unique).
    fn name(&self) -> &str;

    /// Plugin priority (higher = executed first within a phase).
    fn priority(&self) -> i32 {
        0
    }

    /// Which phases this plugin participates in. Informational only —
    /// `PluginInstance`'s default per-phase methods already no-op, so the
    /// pipeline doesn't need this to dispatch correctly; it's used by
    /// tooling (admin API validation, tests) to describe a plugin.
    fn phases(&self) -> &[Phase] {
        &[Phase::Access]
    }

    /// Compile a JSON config into a live instance.
    fn configure(&self, config: &Value) -> anyhow::Result<Box<dyn PluginInstance>>;
}

/// A configured plugin instance bound into a route's pipeline.
///
/// Implement only the phase methods a plugin actually participates in;
/// the rest inherit the `Continue` no-op default. The pipeline calls
/// every method on every phase — skipping work is the instance's job,
/// not the pipeline's.
pub trait PluginInstance: Send + Sync {
    fn name(&self) -> &str;

    fn priority(&self) -> i32 {
        0
    }

    fn rewrite(&self, ctx: &mut PluginContext) -> PluginResult {
        let _ = ctx;
        PluginResult::Continue
    }

    fn access(&self, ctx: &mut PluginContext) -> PluginResult {
        let _ = ctx;
        PluginResult::Continue
    }

    fn before_proxy(&self, ctx: &mut PluginContext) -> PluginResult {
        let _ = ctx;
        PluginResult::Continue
    }

    fn header_filter(&self, ctx: &mut PluginContext) -> PluginResult {
        let _ = ctx;
        PluginResult::Continue
    }

    fn body_filter(&self, ctx: &mut PluginContext) -> PluginResult {
        let _ = ctx;
        PluginResult::Continue
    }

    fn log(&self, ctx: &mut PluginContext) -> PluginResult {
        let _ = ctx;
        PluginResult::Continue
    }
}
