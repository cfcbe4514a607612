use axum::{
    extract::{ConnectInfo, Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use log::debug;
use serde_json::{json, Value};
use std::net::SocketAddr;

use super::error::ApiError;
use super::server::AppState;
use crate::directory::DirectoryDump;
use crate::lifecycle::IsolateEntry;
use crate::transport::{SendMode, MODE_HEADER};
use crate::error::WardenError;
use crate::types::{SignalData, SignalResponse};

fn reply(status: StatusCode, message: &str, results: Vec<Value>) -> (StatusCode, Json<SignalResponse>) {
    (
        status,
        Json(SignalResponse {
            code: status.as_u16(),
            message: message.to_string(),
            results,
        }),
    )
}

/// Entry point of every signal sent to this isolate.
pub async fn receive_signal(
    State(state): State<AppState>,
    Path(name): Path<String>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(mut data): Json<SignalData>,
) -> (StatusCode, Json<SignalResponse>) {
    let name = format!("/{}", name.trim_start_matches('/'));
    if let Some(ConnectInfo(address)) = connect_info {
        data.sender_address = Some(address.ip().to_string());
    }

    if !state.router.has_listener(&name) {
        debug!("Signal {} from {} has no listener", name, data.sender_uid);
        return reply(StatusCode::NOT_FOUND, "no listener", Vec::new());
    }

    let mode = headers
        .get(MODE_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(SendMode::parse)
        .unwrap_or(SendMode::Send);

    match mode {
        SendMode::Forget => {
            let router = state.router.clone();
            tokio::spawn(async move {
                router.dispatch(&name, &data).await;
            });
            reply(StatusCode::OK, "accepted", Vec::new())
        }
        SendMode::Send => match state.router.dispatch(&name, &data).await {
            Some(results) => reply(StatusCode::OK, "ok", results),
            None => reply(StatusCode::NOT_FOUND, "no listener", Vec::new()),
        },
    }
}

pub async fn health_check(State(state): State<AppState>) -> Json<Value> {
    let local = state.directory.local();
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "uid": local.uid,
        "node": local.node,
    }))
}

pub async fn get_directory(State(state): State<AppState>) -> Json<DirectoryDump> {
    Json(state.directory.dump())
}

pub async fn list_isolates(State(state): State<AppState>) -> Json<Vec<IsolateEntry>> {
    let entries = state
        .orchestrator
        .as_ref()
        .map(|orchestrator| orchestrator.status().entries())
        .unwrap_or_default();
    Json(entries)
}

pub async fn get_isolate(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<IsolateEntry>, ApiError> {
    let orchestrator = state
        .orchestrator
        .as_ref()
        .ok_or_else(|| ApiError::NotFound("no managed isolates".to_string()))?;
    let status = orchestrator.status();

    match (status.description(&id), status.state(&id)) {
        (Some(description), Some(state)) => Ok(Json(IsolateEntry { description, state })),
        _ => Err(WardenError::InvalidId(id).into()),
    }
}
