use ando_core::config::VictoriaMetricsConfig;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use regex::Regex;
use std::sync::{Arc, LazyLock};
use tokio::time::{interval, Duration};
use tracing::{debug, error, info};

static METRIC_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z_:][a-zA-Z0-9_:]*$").unwrap());
static LABEL_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").unwrap());

/// Validate a metric or label name before registration. The teacher
/// registers its own hardcoded names and never checked this; external
/// names (plugin-declared label sets) need it.
fn validate_name(name: &str, re: &Regex, kind: &str) -> anyhow::Result<()> {
    if re.is_match(name) {
        Ok(())
    } else {
        anyhow::bail!("invalid {kind} name: {name:?}")
    }
}

fn validate_metric(name: &str, labels: &[&str]) -> anyhow::Result<()> {
    validate_name(name, &METRIC_NAME_RE, "metric")?;
    for label in labels {
        validate_name(label, &LABEL_NAME_RE, "label")?;
    }
    Ok(())
}

/// Metrics collector for the gateway.
///
/// Collects request metrics, latency histograms, and gateway-level gauges
/// under the canonical names consumed by dashboards and alerts. Supports
/// both Prometheus pull (text exposition) and VictoriaMetrics remote-write
/// push.
pub struct MetricsCollector {
    registry: Registry,

    pub http_requests_total: IntCounterVec,
    pub http_request_duration_seconds: HistogramVec,
    pub http_request_size_bytes: HistogramVec,
    pub http_response_size_bytes: HistogramVec,
    pub http_active_connections: IntGauge,

    pub ratelimit_allowed_total: IntCounterVec,
    pub ratelimit_denied_total: IntCounterVec,
    pub ratelimit_backend_errors_total: IntCounterVec,

    pub upstream_health: IntGaugeVec,
    pub config_errors_total: IntCounterVec,

    /// Plugin execution time — not named by §6 but kept since the teacher
    /// tracks per-plugin cost and nothing in the spec asks to drop it.
    pub plugin_execution_time: HistogramVec,
}

impl MetricsCollector {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        validate_metric("http_requests_total", &["method", "route", "status_code"])?;
        let http_requests_total = IntCounterVec::new(
            Opts::new("http_requests_total", "Total HTTP requests handled"),
            &["method", "route", "status_code"],
        )?;

        validate_metric(
            "http_request_duration_seconds",
            &["method", "route", "status_code"],
        )?;
        let http_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "http_request_duration_seconds",
                "End-to-end request latency",
            )
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ]),
            &["method", "route", "status_code"],
        )?;

        validate_metric("http_request_size_bytes", &["method", "route"])?;
        let http_request_size_bytes = HistogramVec::new(
            HistogramOpts::new("http_request_size_bytes", "Request body size")
                .buckets(vec![64.0, 256.0, 1024.0, 4096.0, 16384.0, 65536.0, 262144.0]),
            &["method", "route"],
        )?;

        validate_metric(
            "http_response_size_bytes",
            &["method", "route", "status_code"],
        )?;
        let http_response_size_bytes = HistogramVec::new(
            HistogramOpts::new("http_response_size_bytes", "Response body size")
                .buckets(vec![64.0, 256.0, 1024.0, 4096.0, 16384.0, 65536.0, 262144.0]),
            &["method", "route", "status_code"],
        )?;

        validate_metric("http_active_connections", &[])?;
        let http_active_connections =
            IntGauge::new("http_active_connections", "Currently open client connections")?;

        validate_metric("ratelimit_allowed_total", &[])?;
        let ratelimit_allowed_total = IntCounterVec::new(
            Opts::new("ratelimit_allowed_total", "Requests allowed by a rate-limit check"),
            &["route"],
        )?;

        validate_metric("ratelimit_denied_total", &["reason"])?;
        let ratelimit_denied_total = IntCounterVec::new(
            Opts::new("ratelimit_denied_total", "Requests denied by a rate-limit check"),
            &["route", "reason"],
        )?;

        validate_metric("ratelimit_backend_errors_total", &[])?;
        let ratelimit_backend_errors_total = IntCounterVec::new(
            Opts::new(
                "ratelimit_backend_errors_total",
                "Rate-limit backend errors (counted even though the request fails open)",
            ),
            &["backend"],
        )?;

        validate_metric("upstream_health", &["upstream", "target"])?;
        let upstream_health = IntGaugeVec::new(
            Opts::new("upstream_health", "1 if target is healthy, 0 if isolated/down"),
            &["upstream", "target"],
        )?;

        validate_metric("config_errors_total", &[])?;
        let config_errors_total = IntCounterVec::new(
            Opts::new("config_errors_total", "Configuration apply/validation failures"),
            &["resource_type"],
        )?;

        validate_metric("plugin_execution_seconds", &["plugin", "phase"])?;
        let plugin_execution_time = HistogramVec::new(
            HistogramOpts::new("plugin_execution_seconds", "Plugin execution time")
                .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1]),
            &["plugin", "phase"],
        )?;

        registry.register(Box::new(http_requests_total.clone()))?;
        registry.register(Box::new(http_request_duration_seconds.clone()))?;
        registry.register(Box::new(http_request_size_bytes.clone()))?;
        registry.register(Box::new(http_response_size_bytes.clone()))?;
        registry.register(Box::new(http_active_connections.clone()))?;
        registry.register(Box::new(ratelimit_allowed_total.clone()))?;
        registry.register(Box::new(ratelimit_denied_total.clone()))?;
        registry.register(Box::new(ratelimit_backend_errors_total.clone()))?;
        registry.register(Box::new(upstream_health.clone()))?;
        registry.register(Box::new(config_errors_total.clone()))?;
        registry.register(Box::new(plugin_execution_time.clone()))?;

        Ok(Self {
            registry,
            http_requests_total,
            http_request_duration_seconds,
            http_request_size_bytes,
            http_response_size_bytes,
            http_active_connections,
            ratelimit_allowed_total,
            ratelimit_denied_total,
            ratelimit_backend_errors_total,
            upstream_health,
            config_errors_total,
            plugin_execution_time,
        })
    }

    /// Record a completed HTTP request.
    pub fn record_request(&self, route: &str, method: &str, status: u16, duration_secs: f64) {
        let status_code = status.to_string();
        self.http_requests_total
            .with_label_values(&[method, route, &status_code])
            .inc();
        self.http_request_duration_seconds
            .with_label_values(&[method, route, &status_code])
            .observe(duration_secs);
    }

    pub fn record_ratelimit_allowed(&self, route: &str) {
        self.ratelimit_allowed_total.with_label_values(&[route]).inc();
    }

    pub fn record_ratelimit_denied(&self, route: &str, reason: &str) {
        self.ratelimit_denied_total.with_label_values(&[route, reason]).inc();
    }

    pub fn set_upstream_health(&self, upstream: &str, target: &str, healthy: bool) {
        self.upstream_health
            .with_label_values(&[upstream, target])
            .set(if healthy { 1 } else { 0 });
    }

    /// Get Prometheus text exposition.
    pub fn gather_text(&self) -> String {
        let encoder = TextEncoder::new();
        let metrics = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metrics, &mut buffer).unwrap_or_default();
        String::from_utf8(buffer).unwrap_or_default()
    }

    /// Start the VictoriaMetrics push loop.
    pub fn start_push_loop(
        self: Arc<Self>,
        config: VictoriaMetricsConfig,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            if !config.enabled {
                return;
            }

            info!(
                endpoint = %config.endpoint,
                interval = config.push_interval_secs,
                "Starting VictoriaMetrics push loop"
            );

            let client = reqwest::Client::new();
            let mut tick = interval(Duration::from_secs(config.push_interval_secs));

            loop {
                tick.tick().await;

                let metrics_text = self.gather_text();

                match client
                    .post(&config.endpoint)
                    .header("Content-Type", "text/plain")
                    .body(metrics_text)
                    .send()
                    .await
                {
                    Ok(resp) => {
                        if !resp.status().is_success() {
                            error!(status = %resp.status(), "VictoriaMetrics push failed");
                        } else {
                            debug!("VictoriaMetrics push successful");
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "VictoriaMetrics push error");
                    }
                }
            }
        })
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new().expect("Failed to create metrics collector")
    }
}
