//! HTTP API using Axum.
//!
//! Provides token-gated endpoints for:
//! - Sending SMS and polling their status (/api/v1/sms)
//! - Fetching received SMS per slot (/api/v1/inbound/{slot})
//! - Running USSD codes (/api/v1/ussd)
//! - Health and statistics for monitoring (/api/v1/health, /api/v1/stats)

mod auth;
mod handlers;
mod server;
mod tls;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

pub use auth::{generate_token, hash_token, AccessControl, Capability, TokenSet};
pub use handlers::{SendSmsRequest, SendSmsResponse, SendUssdRequest, UssdResponse};
pub use server::{router, ApiServer};
pub use tls::build_tls_acceptor;

use crate::config::ApiConfig;
use crate::forwarder::MailHealth;
use crate::health::HealthLevel;
use crate::modem::ModemError;
use crate::pool::{ModemPool, PoolError};
use crate::router::RouteError;

/// Shared state of the API handlers.
pub struct ApiState {
    pub pool: Arc<ModemPool>,
    pub access: Arc<AccessControl>,
    pub config: ApiConfig,
    /// Present when mail forwarding is enabled
    pub mail: Option<Arc<MailHealth>>,
}

impl ApiState {
    pub fn new(pool: Arc<ModemPool>, config: ApiConfig, mail: Option<Arc<MailHealth>>) -> Self {
        Self {
            pool,
            access: Arc::new(AccessControl::new(&config.tokens)),
            config,
            mail,
        }
    }

    /// Problems in the API configuration, reported through the health state.
    pub fn config_warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.config.enable_send_sms && self.config.tokens.send_sms.is_empty() {
            warnings.push("send_sms enabled without tokens".to_string());
        }
        if self.config.enable_send_ussd && self.config.tokens.send_ussd.is_empty() {
            warnings.push("send_ussd enabled without tokens".to_string());
        }
        for status in self.pool.registry().snapshot().values() {
            if status.enabled && !self.config.tokens.fetch_sms.contains_key(&status.slot) {
                warnings.push(format!("no fetch tokens for slot {}", status.slot));
            }
        }
        warnings
    }

    /// Mail health, if mail forwarding is enabled.
    pub fn mail_health(&self) -> Option<(HealthLevel, Option<String>)> {
        self.mail.as_ref().map(|mail| mail.get())
    }
}

/// Request failures as seen by API clients.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("this API function is not enabled")]
    Disabled,

    #[error("invalid API token")]
    Unauthorized,

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("no route to destination")]
    NoRoute,

    #[error("{0}")]
    Unavailable(String),

    #[error("modem failure")]
    ModemFault,

    #[error("internal error")]
    Internal,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Disabled => StatusCode::METHOD_NOT_ALLOWED,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::NoRoute => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::ModemFault => StatusCode::BAD_GATEWAY,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<PoolError> for ApiError {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::Route(RouteError::NoRoute) => Self::NoRoute,
            PoolError::Route(RouteError::Unavailable) => {
                Self::Unavailable("no modem available for destination".into())
            }
            PoolError::UnknownSlot(_) => Self::NotFound("unknown sender".into()),
            PoolError::NotReady(_) => Self::Unavailable("modem not ready".into()),
            PoolError::InvalidNumber => Self::BadRequest("invalid phone number".into()),
            e @ (PoolError::InvalidCode | PoolError::TooLong { .. } | PoolError::Unencodable) => {
                Self::BadRequest(e.to_string())
            }
            PoolError::Modem { source, .. } => match source {
                ModemError::Busy => Self::Unavailable("modem busy".into()),
                ModemError::NotReady | ModemError::Closed => Self::Unavailable("modem not ready".into()),
                _ => Self::ModemFault,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_error_mapping() {
        let cases = [
            (PoolError::Route(RouteError::NoRoute), StatusCode::UNPROCESSABLE_ENTITY),
            (PoolError::Route(RouteError::Unavailable), StatusCode::SERVICE_UNAVAILABLE),
            (PoolError::UnknownSlot("07".into()), StatusCode::NOT_FOUND),
            (PoolError::NotReady("00".into()), StatusCode::SERVICE_UNAVAILABLE),
            (PoolError::InvalidNumber, StatusCode::BAD_REQUEST),
            (PoolError::TooLong { length: 200, max: 160 }, StatusCode::BAD_REQUEST),
            (PoolError::Unencodable, StatusCode::BAD_REQUEST),
            (
                PoolError::Modem {
                    slot: "00".into(),
                    source: ModemError::Busy,
                },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                PoolError::Modem {
                    slot: "00".into(),
                    source: ModemError::Timeout("AT+CMGS".into()),
                },
                StatusCode::BAD_GATEWAY,
            ),
        ];

        for (error, status) in cases {
            assert_eq!(ApiError::from(error).status(), status);
        }
    }

    #[test]
    fn test_fault_message_hides_details() {
        let error = ApiError::from(PoolError::Modem {
            slot: "00".into(),
            source: ModemError::Io("/dev/ttyUSB0: broken pipe".into()),
        });
        assert!(!error.to_string().contains("/dev/"));
    }
}
