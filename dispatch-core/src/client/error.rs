//! The single error taxonomy surfaced to callers, whichever transport ran.

use std::fmt;
use std::time::Duration;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::{Map, Value, json};
use thiserror::Error;

/// Error code used when the upstream body does not carry one.
pub const UNKNOWN_ERROR_CODE: &str = "unknown_error";

/// Why a target could not be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unavailability {
    ConnectionRefused,
    /// The connection dropped before a complete response arrived.
    Disconnected,
    /// Service discovery or DNS could not produce an address.
    Resolution,
    /// The client was closed by `ServiceRegistry::reset` or shutdown.
    Closed,
}

impl fmt::Display for Unavailability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Unavailability::ConnectionRefused => "connection refused",
            Unavailability::Disconnected => "disconnected",
            Unavailability::Resolution => "resolution failed",
            Unavailability::Closed => "client closed",
        };
        f.write_str(reason)
    }
}

/// Decoded error body of a well-formed upstream failure.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamBody {
    pub message: Option<String>,
    pub description: Option<String>,
    pub error_code: String,
    pub raw: Value,
}

impl UpstreamBody {
    pub fn from_json(raw: Value) -> Self {
        let field = |key: &str| {
            raw.get(key).and_then(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Null => None,
                other => Some(other.to_string()),
            })
        };

        let message = field("message");
        let description = field("description");
        let error_code = field("error_code").unwrap_or_else(|| UNKNOWN_ERROR_CODE.to_string());

        Self {
            message,
            description,
            error_code,
            raw,
        }
    }

    /// Human readable summary: the description, else the message.
    pub fn description(&self) -> &str {
        self.description
            .as_deref()
            .or(self.message.as_deref())
            .unwrap_or("")
    }
}

#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    #[error("{service} is unavailable ({reason}): {detail}")]
    Unavailable {
        service: String,
        reason: Unavailability,
        detail: String,
    },

    #[error("{service} did not answer within {timeout:?}")]
    Timeout { service: String, timeout: Duration },

    #[error("protocol error talking to {service}: {detail}")]
    Protocol { service: String, detail: String },

    #[error("{service} responded {status}: {}", .body.description())]
    Upstream {
        service: String,
        status: u16,
        body: UpstreamBody,
    },

    #[error("unexpected failure calling {service}: {detail}")]
    Unknown { service: String, detail: String },
}

impl DispatchError {
    pub fn service(&self) -> &str {
        match self {
            DispatchError::Unavailable { service, .. }
            | DispatchError::Timeout { service, .. }
            | DispatchError::Protocol { service, .. }
            | DispatchError::Upstream { service, .. }
            | DispatchError::Unknown { service, .. } => service,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            DispatchError::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            DispatchError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            DispatchError::Protocol { .. } => StatusCode::BAD_GATEWAY,
            DispatchError::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            DispatchError::Unknown { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &str {
        match self {
            DispatchError::Unavailable { .. } => "service_unavailable",
            DispatchError::Timeout { .. } => "dispatch_timeout",
            DispatchError::Protocol { .. } => "protocol_error",
            DispatchError::Upstream { body, .. } => &body.error_code,
            DispatchError::Unknown { .. } => UNKNOWN_ERROR_CODE,
        }
    }

    /// The tunneled transport failed in a way that says nothing about the
    /// target itself, so the same call may go over HTTP instead.
    pub fn allows_fallback(&self) -> bool {
        matches!(
            self,
            DispatchError::Unavailable {
                reason: Unavailability::ConnectionRefused,
                ..
            } | DispatchError::Protocol { .. }
        )
    }

    /// Worth another attempt on an idempotent HTTP call.
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            DispatchError::Unavailable {
                reason: Unavailability::ConnectionRefused | Unavailability::Disconnected,
                ..
            } | DispatchError::Protocol { .. }
        )
    }

    /// JSON body used when the error is handed back as data.
    pub fn body(&self) -> Value {
        if let DispatchError::Upstream { body, .. } = self
            && body.raw.is_object()
        {
            return body.raw.clone();
        }

        let mut map = Map::new();
        map.insert("message".into(), Value::String(self.to_string()));
        map.insert(
            "description".into(),
            Value::String(match self {
                DispatchError::Upstream { body, .. } => body.description().to_string(),
                other => other.to_string(),
            }),
        );
        map.insert("error_code".into(), Value::String(self.error_code().to_string()));
        map.insert("service".into(), Value::String(self.service().to_string()));
        Value::Object(map)
    }
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Downstream dispatch failed");
        }
        (status, Json(self.body())).into_response()
    }
}

/// Failures of the registry itself, before any dispatch happens.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unknown service `{0}`: not a declared or required connection")]
    UnknownService(String),

    #[error("service registry is immutable; declare `{0}` in configuration instead")]
    ImmutableRegistry(String),
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "message": self.to_string(),
                "error_code": "unknown_service",
            })),
        )
            .into_response()
    }
}
