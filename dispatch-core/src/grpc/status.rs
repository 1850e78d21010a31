//! Translation of tunneled-protocol status codes into HTTP status codes and
//! into the uniform `DispatchError`.
//!
//! | gRPC code | HTTP |
//! |-----------|------|
//! | `OK` | 200 |
//! | `CANCELLED` | 499 |
//! | `UNKNOWN` | 500 |
//! | `INVALID_ARGUMENT` | 400 |
//! | `DEADLINE_EXCEEDED` | 504 |
//! | `NOT_FOUND` | 404 |
//! | `ALREADY_EXISTS` | 409 |
//! | `PERMISSION_DENIED` | 403 |
//! | `UNAUTHENTICATED` | 401 |
//! | `RESOURCE_EXHAUSTED` | 429 |
//! | `FAILED_PRECONDITION` | 400 |
//! | `ABORTED` | 409 |
//! | `OUT_OF_RANGE` | 400 |
//! | `UNIMPLEMENTED` | 501 |
//! | `INTERNAL` | 500 |
//! | `UNAVAILABLE` | 503 |
//! | `DATA_LOSS` | 500 |

use std::error::Error as StdError;
use std::io;
use std::time::Duration;

use serde_json::json;
use tonic::{Code, Status};

use crate::client::{DispatchError, Unavailability, UpstreamBody};

/// Message prefix the server adapter uses when an endpoint has no route.
pub const UNREGISTERED_ENDPOINT: &str = "unregistered endpoint";

/// Message prefix the server adapter uses for rejected framing.
pub const FRAMING_REJECTED: &str = "framing rejected";

/// Non-standard "client closed request" status.
pub const CLIENT_CLOSED_REQUEST: u16 = 499;

/// Forward translation of a raw tunneled status code.
///
/// Returns `None` for codes outside the table.
pub fn to_http_status(code: i32) -> Option<u16> {
    let status = match code {
        0 => 200,
        1 => CLIENT_CLOSED_REQUEST,
        2 => 500,
        3 => 400,
        4 => 504,
        5 => 404,
        6 => 409,
        7 => 403,
        8 => 429,
        9 => 400,
        10 => 409,
        11 => 400,
        12 => 501,
        13 => 500,
        14 => 503,
        15 => 500,
        16 => 401,
        _ => return None,
    };
    Some(status)
}

/// Lower-case name used in logs and error bodies.
pub fn code_name(code: Code) -> &'static str {
    match code {
        Code::Ok => "ok",
        Code::Cancelled => "cancelled",
        Code::Unknown => "unknown",
        Code::InvalidArgument => "invalid_argument",
        Code::DeadlineExceeded => "deadline_exceeded",
        Code::NotFound => "not_found",
        Code::AlreadyExists => "already_exists",
        Code::PermissionDenied => "permission_denied",
        Code::ResourceExhausted => "resource_exhausted",
        Code::FailedPrecondition => "failed_precondition",
        Code::Aborted => "aborted",
        Code::OutOfRange => "out_of_range",
        Code::Unimplemented => "unimplemented",
        Code::Internal => "internal",
        Code::Unavailable => "unavailable",
        Code::DataLoss => "data_loss",
        Code::Unauthenticated => "unauthenticated",
    }
}

/// Turn a failed tunneled call into the uniform taxonomy.
///
/// `deadline` is the deadline the call was sent with and `elapsed` the time
/// spent waiting; a cancellation that arrives at or after the deadline is
/// the server enforcing that deadline.
pub fn translate_status(
    service: &str,
    status: &Status,
    deadline: Option<Duration>,
    elapsed: Duration,
) -> DispatchError {
    let service = service.to_string();
    let detail = status.message().to_string();

    if is_connection_refused(status) {
        return DispatchError::Unavailable {
            service,
            reason: Unavailability::ConnectionRefused,
            detail,
        };
    }

    match status.code() {
        Code::DeadlineExceeded => {
            return DispatchError::Timeout {
                service,
                timeout: deadline.unwrap_or(elapsed),
            };
        }
        Code::Cancelled if deadline.is_some_and(|d| elapsed >= d) => {
            return DispatchError::Timeout {
                service,
                timeout: deadline.unwrap_or(elapsed),
            };
        }
        Code::Unavailable => {
            return DispatchError::Unavailable {
                service,
                reason: Unavailability::Disconnected,
                detail,
            };
        }
        _ => {}
    }

    if is_protocol_failure(status) {
        return DispatchError::Protocol { service, detail };
    }

    match to_http_status(status.code() as i32) {
        Some(http_status) if status.code() != Code::Ok => DispatchError::Upstream {
            service,
            status: http_status,
            body: UpstreamBody::from_json(json!({
                "message": detail,
                "description": detail,
                "error_code": code_name(status.code()),
            })),
        },
        _ => DispatchError::Unknown {
            service,
            detail: format!("unexpected status {:?}: {}", status.code(), detail),
        },
    }
}

/// Walk the error chain looking for a refused TCP connect.
pub fn is_connection_refused(status: &Status) -> bool {
    let mut source: Option<&(dyn StdError + 'static)> = status.source();
    while let Some(err) = source {
        if let Some(io_err) = err.downcast_ref::<io::Error>()
            && io_err.kind() == io::ErrorKind::ConnectionRefused
        {
            return true;
        }
        source = err.source();
    }
    status.code() == Code::Unavailable
        && status.message().to_ascii_lowercase().contains("connection refused")
}

/// Framing or handshake violations: the peer does not speak the tunnel,
/// or a codec on either side refused the message before any handler ran.
fn is_protocol_failure(status: &Status) -> bool {
    let message = status.message().to_ascii_lowercase();

    match status.code() {
        Code::OutOfRange | Code::ResourceExhausted => {
            message.contains("message length too large")
        }
        // tonic answers unknown services with an empty UNIMPLEMENTED.
        Code::Unimplemented => !message.starts_with(UNREGISTERED_ENDPOINT),
        Code::InvalidArgument => message.starts_with(FRAMING_REJECTED),
        Code::Internal | Code::Unknown => [
            "protocol error",
            "h2",
            "http2",
            "compression flag",
            "content-type",
        ]
        .iter()
        .any(|needle| message.contains(needle)),
        _ => false,
    }
}
