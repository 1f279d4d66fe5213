use crate::persist;
use crate::server::AdminState;
use ando_core::ssl::SslCert;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use serde_json::{Value, json};
use std::sync::Arc;

pub async fn put_ssl(
    State(state): State<Arc<AdminState>>,
    Path(id): Path<String>,
    Json(mut body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    body["id"] = json!(id);

    let cert: SslCert = match serde_json::from_value(body) {
        Ok(c) => c,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": e.to_string()})),
            );
        }
    };

    state.cache.ssl_certs.insert(cert.id.clone(), cert.clone());
    persist::save_state(&state);

    (StatusCode::OK, Json(json!({"id": cert.id, "status": "created"})))
}

pub async fn get_ssl(
    State(state): State<Arc<AdminState>>,
    Path(id): Path<String>,
) -> (StatusCode, Json<Value>) {
    match state.cache.ssl_certs.get(&id) {
        Some(c) => (StatusCode::OK, Json(json!(c.value().clone()))),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "SSL certificate not found"})),
        ),
    }
}

pub async fn delete_ssl(
    State(state): State<Arc<AdminState>>,
    Path(id): Path<String>,
) -> (StatusCode, Json<Value>) {
    state.cache.ssl_certs.remove(&id);
    persist::save_state(&state);
    (StatusCode::OK, Json(json!({"deleted": true})))
}

pub async fn list_ssl(State(state): State<Arc<AdminState>>) -> Json<Value> {
    let certs: Vec<SslCert> = state
        .cache
        .ssl_certs
        .iter()
        .map(|c| c.value().clone())
        .collect();
    Json(json!({"list": certs, "total": certs.len()}))
}
