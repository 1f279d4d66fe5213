use crate::handlers;
use ando_core::config::AdminConfig;
use ando_core::router::Router;
use ando_observability::metrics::MetricsCollector;
use ando_plugin::registry::PluginRegistry;
use ando_store::cache::ConfigCache;
use arc_swap::ArcSwap;
use axum::{Router as AxumRouter, extract::State, routing::get};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::info;

/// Shared state for the Admin API.
///
/// `router_swap` is the same `ArcSwap<Router>` the data-plane workers read
/// from — a PUT against `/apisix/admin/routes/{id}` rebuilds the router and
/// swaps it in directly, no separate propagation step.
pub struct AdminState {
    pub cache: ConfigCache,
    pub router_swap: Arc<ArcSwap<Router>>,
    pub plugin_registry: Arc<PluginRegistry>,
    pub metrics: Arc<MetricsCollector>,
    pub config_changed: Arc<Notify>,
    pub state_file: Option<PathBuf>,
}

/// Build the Axum router with all admin routes.
pub fn build_admin_router(state: Arc<AdminState>) -> AxumRouter {
    let admin_api = AxumRouter::new()
        // Health
        .route("/health", get(handlers::health::health_check))
        // Routes
        .route("/routes", get(handlers::routes::list_routes))
        .route(
            "/routes/{id}",
            get(handlers::routes::get_route)
                .put(handlers::routes::put_route)
                .delete(handlers::routes::delete_route),
        )
        // Services
        .route("/services", get(handlers::services::list_services))
        .route(
            "/services/{id}",
            get(handlers::services::get_service)
                .put(handlers::services::put_service)
                .delete(handlers::services::delete_service),
        )
        // Upstreams
        .route("/upstreams", get(handlers::upstreams::list_upstreams))
        .route(
            "/upstreams/{id}",
            get(handlers::upstreams::get_upstream)
                .put(handlers::upstreams::put_upstream)
                .delete(handlers::upstreams::delete_upstream),
        )
        // Consumers
        .route("/consumers", get(handlers::consumers::list_consumers))
        .route(
            "/consumers/{id}",
            get(handlers::consumers::get_consumer)
                .put(handlers::consumers::put_consumer)
                .delete(handlers::consumers::delete_consumer),
        )
        // SSL certificates
        .route("/ssls", get(handlers::ssl::list_ssl))
        .route(
            "/ssls/{id}",
            get(handlers::ssl::get_ssl)
                .put(handlers::ssl::put_ssl)
                .delete(handlers::ssl::delete_ssl),
        )
        // Canary groups
        .route("/canary", get(handlers::canary::list_canary))
        .route(
            "/canary/{id}",
            get(handlers::canary::get_canary)
                .put(handlers::canary::put_canary)
                .delete(handlers::canary::delete_canary),
        )
        // Plugins
        .route("/plugins/list", get(handlers::plugins::list_plugins));

    AxumRouter::new()
        .nest("/apisix/admin", admin_api)
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Prometheus metrics endpoint handler.
async fn metrics_handler(State(state): State<Arc<AdminState>>) -> String {
    state.metrics.gather_text()
}

/// Start the admin API server. Binds and serves until the process exits.
pub async fn start_admin(config: AdminConfig, state: Arc<AdminState>) -> anyhow::Result<()> {
    if !config.enabled {
        info!("Admin API disabled");
        return Ok(());
    }

    let app = build_admin_router(state);

    info!(addr = %config.addr, "Starting Admin API server");

    let listener = tokio::net::TcpListener::bind(config.addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
