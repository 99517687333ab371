//! API handlers.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{ApiError, ApiState, Capability};
use crate::health::HealthLevel;
use crate::modem::ModemError;
use crate::pool::PoolError;
use crate::store::MessageId;
use crate::telemetry::counters;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendSmsRequest {
    /// Destination in E.123 international form
    pub recipient: String,
    pub message: String,
    /// Phone number or slot id to send from; routed when absent
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(default)]
    pub flash: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendSmsResponse {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendUssdRequest {
    /// Phone number or slot id of the modem to use
    pub sender: String,
    pub code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UssdResponse {
    /// "OK" or "ERROR"
    pub status: String,
    pub response: String,
}

#[derive(Debug, Deserialize)]
pub struct InboundQuery {
    #[serde(default)]
    pub cursor: u64,
}

/// Ping handler, unauthenticated.
pub async fn ping_handler() -> &'static str {
    "OK"
}

/// Queue an SMS.
pub async fn send_sms_handler(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(request): Json<SendSmsRequest>,
) -> Response {
    respond("send_sms", send_sms(&state, &headers, request).await)
}

/// Status of a previously queued SMS.
pub async fn sms_status_handler(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    respond("sms_status", sms_status(&state, &headers, &id).await)
}

/// Received SMS of one slot, newer than `cursor`.
pub async fn inbound_handler(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(slot): Path<String>,
    Query(query): Query<InboundQuery>,
) -> Response {
    respond("fetch_sms", fetch_inbound(&state, &headers, slot, query.cursor).await)
}

/// Run a USSD code. Network rejections are answered with status "ERROR".
pub async fn send_ussd_handler(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(request): Json<SendUssdRequest>,
) -> Response {
    respond("send_ussd", send_ussd(&state, &headers, request).await)
}

/// Aggregate health of the pool, mail delivery and API configuration.
pub async fn health_handler(State(state): State<Arc<ApiState>>, headers: HeaderMap) -> Response {
    respond("get_health_state", health(&state, &headers).await)
}

/// Traffic statistics per slot.
pub async fn stats_handler(State(state): State<Arc<ApiState>>, headers: HeaderMap) -> Response {
    let result = authorize(&state, &headers, Capability::GetStats)
        .await
        .map(|()| Json(state.pool.stats()));
    respond("get_stats", result)
}

async fn send_sms(
    state: &ApiState,
    headers: &HeaderMap,
    request: SendSmsRequest,
) -> Result<impl IntoResponse, ApiError> {
    if !state.config.enable_send_sms {
        return Err(ApiError::Disabled);
    }
    authorize(state, headers, Capability::SendSms).await?;

    let pinned = match request.sender.as_deref().filter(|s| !s.is_empty()) {
        Some(sender) => Some(
            state
                .pool
                .resolve_slot(sender)
                .ok_or_else(|| ApiError::NotFound("unknown sender".into()))?,
        ),
        None => None,
    };

    let id = state
        .pool
        .send_sms(&request.recipient, &request.message, pinned, request.flash)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(SendSmsResponse { id: id.to_string() })))
}

async fn sms_status(state: &ApiState, headers: &HeaderMap, id: &str) -> Result<impl IntoResponse, ApiError> {
    authorize(state, headers, Capability::SendSms).await?;

    let message = MessageId::parse(id)
        .and_then(|id| state.pool.sms_status(id))
        .ok_or_else(|| ApiError::NotFound("unknown message".into()))?;
    Ok(Json(message))
}

async fn fetch_inbound(
    state: &ApiState,
    headers: &HeaderMap,
    slot: String,
    cursor: u64,
) -> Result<impl IntoResponse, ApiError> {
    if state.pool.slot(&slot).is_none() {
        return Err(ApiError::NotFound("unknown slot".into()));
    }
    authorize(state, headers, Capability::FetchSms(slot.clone())).await?;

    Ok(Json(state.pool.fetch_inbound(Some(&slot), cursor)?))
}

async fn send_ussd(
    state: &ApiState,
    headers: &HeaderMap,
    request: SendUssdRequest,
) -> Result<impl IntoResponse, ApiError> {
    if !state.config.enable_send_ussd {
        return Err(ApiError::Disabled);
    }
    authorize(state, headers, Capability::SendUssd).await?;

    let slot = state
        .pool
        .resolve_slot(&request.sender)
        .ok_or_else(|| ApiError::NotFound("unknown sender".into()))?;
    info!(slot, code = %request.code, "USSD requested");

    let answer = match state.pool.send_ussd(slot, &request.code).await {
        Ok(response) => UssdResponse {
            status: "OK".into(),
            response,
        },
        Err(PoolError::Modem {
            source: ModemError::Rejected(_),
            ..
        }) => UssdResponse {
            status: "ERROR".into(),
            response: "USSD code rejected by the network".into(),
        },
        Err(e) => return Err(e.into()),
    };
    Ok(Json(answer))
}

async fn health(state: &ApiState, headers: &HeaderMap) -> Result<impl IntoResponse, ApiError> {
    authorize(state, headers, Capability::GetHealthState).await?;

    let mut health = state.pool.health_state();
    if let Some((level, message)) = state.mail_health() {
        if level != HealthLevel::Ok {
            let message = message.unwrap_or_default();
            health.include(level, &format!("{level}: {message}"));
        }
    }
    for warning in state.config_warnings() {
        health.include(HealthLevel::Warning, &warning);
    }
    Ok(Json(health))
}

/// Verify the bearer token for `capability`. Argon2 runs off the runtime threads.
async fn authorize(state: &ApiState, headers: &HeaderMap, capability: Capability) -> Result<(), ApiError> {
    let Some(token) = bearer(headers) else {
        warn!(capability = %capability.name(), "request without API token");
        counters::auth_failure(capability.name());
        return Err(ApiError::Unauthorized);
    };

    let access = Arc::clone(&state.access);
    let requested = capability.clone();
    let allowed = tokio::task::spawn_blocking(move || access.allows(&requested, &token))
        .await
        .map_err(|_| ApiError::Internal)?;

    if !allowed {
        warn!(capability = %capability.name(), "invalid API token");
        counters::auth_failure(capability.name());
        return Err(ApiError::Unauthorized);
    }
    Ok(())
}

fn bearer(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then(|| token.to_string())
}

fn respond<T: IntoResponse>(operation: &str, result: Result<T, ApiError>) -> Response {
    let response = match result {
        Ok(body) => body.into_response(),
        Err(e) => e.into_response(),
    };
    counters::api_request(operation, response.status().as_u16());
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_bearer() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc123"));
        assert_eq!(bearer(&headers).as_deref(), Some("abc123"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc123"));
        assert_eq!(bearer(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(bearer(&headers), None);
    }

    #[test]
    fn test_send_sms_request_defaults() {
        let request: SendSmsRequest =
            serde_json::from_str(r#"{"recipient": "+4930000000", "message": "hi"}"#).unwrap();
        assert_eq!(request.sender, None);
        assert!(!request.flash);
    }
}
