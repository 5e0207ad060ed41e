//! HTTP control API.
//!
//! Every endpoint takes a JSON body and always answers `200` with a
//! `{code, msg}` body; the code carries the outcome. Clients send ids both
//! as strings and as numbers, so fields are read leniently.

use axum::Router;
use axum::extract::State;
use axum::routing::post;
use axum::Json;
use herald_core::{ControlError, ControlResponse, SubscribeRequest};
use serde_json::Value;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/init", post(init))
        .route("/add", post(add))
        .route("/remove", post(remove))
        .with_state(state)
}

async fn init(State(state): State<AppState>, body: String) -> Json<ControlResponse> {
    let result = async {
        let body = parse_body(&body)?;
        let name = required(&body, "client_name")?;
        let url = required(&body, "url")?;
        state.control.register_subscriber(&name, &url).await
    }
    .await;
    Json(ControlResponse::from_result(&result))
}

async fn add(State(state): State<AppState>, body: String) -> Json<ControlResponse> {
    let result = async {
        let request = subscribe_request(&body)?;
        state.control.subscribe(&request).await
    }
    .await;
    Json(ControlResponse::from_result(&result))
}

async fn remove(State(state): State<AppState>, body: String) -> Json<ControlResponse> {
    let result = async {
        let request = subscribe_request(&body)?;
        state.control.unsubscribe(&request).await
    }
    .await;
    Json(ControlResponse::from_result(&result))
}

pub(crate) fn parse_body(body: &str) -> Result<Value, ControlError> {
    match serde_json::from_str(body) {
        Ok(value @ Value::Object(_)) => Ok(value),
        _ => Err(ControlError::InvalidJson),
    }
}

/// A string or number field; empty strings count as absent.
pub(crate) fn field(body: &Value, name: &str) -> Option<String> {
    match body.get(name)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub(crate) fn required(body: &Value, name: &str) -> Result<String, ControlError> {
    field(body, name).ok_or_else(|| ControlError::MissingParameter(name.to_string()))
}

pub(crate) fn subscribe_request(body: &str) -> Result<SubscribeRequest, ControlError> {
    let body = parse_body(body)?;
    let include_pinned = match body.get("is_top") {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0) != 0,
        Some(Value::String(s)) => matches!(s.as_str(), "1" | "true"),
        _ => false,
    };
    Ok(SubscribeRequest {
        source_type: required(&body, "type")?,
        subtype: field(&body, "subtype"),
        entity_id: required(&body, "uid")?,
        subscriber: required(&body, "client_name")?,
        include_pinned,
    })
}
