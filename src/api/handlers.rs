//! Request handlers for the worker API.

use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use log::info;
use serde_json::{Value, json};
use sha1::{Digest, Sha1};
use tokio::time::timeout;

use crate::orchestrator::IncidentInput;
use crate::prompt;
use crate::sanitize::clean_text;

use super::error::{ApiError, ApiResult};
use super::state::AppState;

/// Hard ceiling on one incident request end to end.
const REQUEST_BUDGET: Duration = Duration::from_secs(300);

/// POST /incident
///
/// Accepts either a full alert body (run through the prompt builder) or a
/// plain `{incident_key, prompt, sop_id?}` object.
pub async fn process_incident(
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let value: Value = serde_json::from_slice(&body)
        .map_err(|_| ApiError::bad_request("invalid json"))?;

    // Raw fields first; the builder then supplies the assembled prompt and
    // the canonical incident key for alert bodies.
    let mut input: IncidentInput = serde_json::from_value(value.clone()).unwrap_or(IncidentInput {
        incident_key: String::new(),
        sop_id: None,
        prompt: String::new(),
    });

    if let Some(built) = state.prompt_builder.build(&body) {
        input.prompt = built.prompt;
        if !built.incident_key.is_empty() {
            input.incident_key = built.incident_key;
        }
        if built.sop_id.is_some() {
            input.sop_id = built.sop_id;
        }
    }

    if input.incident_key.is_empty() {
        input.incident_key = prompt::extract_incident_key(&value).unwrap_or_default();
    }
    // A known SOP with no key still names a durable conversation.
    if input.incident_key.is_empty() {
        if let Some(sop_id) = &input.sop_id {
            input.incident_key = sop_id.clone();
        }
    }

    if input.incident_key.trim().is_empty() || input.prompt.trim().is_empty() {
        return Err(ApiError::bad_request("incident_key and prompt required"));
    }

    info!(
        "incident: received incident_key={} sop_id={} prompt_len={} prompt_sha1={}",
        input.incident_key,
        input.sop_id.as_deref().unwrap_or("-"),
        input.prompt.len(),
        fingerprint(&input.prompt)
    );

    let incident_key = input.incident_key.clone();
    let answer = timeout(REQUEST_BUDGET, state.orchestrator.process(input))
        .await
        .map_err(|_| ApiError::BadGateway("request deadline exceeded".to_string()))??;

    let cleaned = clean_text(&answer);
    info!(
        "incident: completed incident_key={incident_key} raw_len={} cleaned_len={} response_sha1={}",
        answer.len(),
        cleaned.len(),
        fingerprint(&cleaned)
    );

    Ok(Json(json!({ "answer": cleaned })))
}

/// GET /healthz
pub async fn healthz(State(state): State<AppState>) -> Json<Value> {
    let (ready, size) = state.pool.stats();
    Json(json!({ "ready": ready, "size": size }))
}

/// GET /readyz — healthy once at least one session is warmed.
pub async fn readyz(State(state): State<AppState>) -> (StatusCode, &'static str) {
    let (ready, _) = state.pool.stats();
    if ready > 0 {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "warming")
    }
}

fn fingerprint(s: &str) -> String {
    let digest = Sha1::digest(s.as_bytes());
    digest.iter().take(6).map(|b| format!("{b:02x}")).collect()
}
