use crate::persist;
use crate::server::AdminState;
use ando_core::canary::CanaryGroup;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use serde_json::{Value, json};
use std::sync::Arc;

pub async fn put_canary(
    State(state): State<Arc<AdminState>>,
    Path(id): Path<String>,
    Json(mut body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    body["group_id"] = json!(id);

    let group: CanaryGroup = match serde_json::from_value(body) {
        Ok(g) => g,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": e.to_string()})),
            );
        }
    };

    if let Err(e) = group.validate() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": e.to_string()})),
        );
    }

    state
        .cache
        .canary_groups
        .insert(group.group_id.clone(), group.clone());
    persist::save_state(&state);

    (
        StatusCode::OK,
        Json(json!({"id": group.group_id, "status": "created"})),
    )
}

pub async fn get_canary(
    State(state): State<Arc<AdminState>>,
    Path(id): Path<String>,
) -> (StatusCode, Json<Value>) {
    match state.cache.canary_groups.get(&id) {
        Some(g) => (StatusCode::OK, Json(json!(g.value().clone()))),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "Canary group not found"})),
        ),
    }
}

pub async fn delete_canary(
    State(state): State<Arc<AdminState>>,
    Path(id): Path<String>,
) -> (StatusCode, Json<Value>) {
    state.cache.canary_groups.remove(&id);
    persist::save_state(&state);
    (StatusCode::OK, Json(json!({"deleted": true})))
}

pub async fn list_canary(State(state): State<Arc<AdminState>>) -> Json<Value> {
    let groups: Vec<CanaryGroup> = state
        .cache
        .canary_groups
        .iter()
        .map(|g| g.value().clone())
        .collect();
    Json(json!({"list": groups, "total": groups.len()}))
}
