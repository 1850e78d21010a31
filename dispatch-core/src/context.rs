//! Request-scoped context carried into every outbound call.
//!
//! An `OutboundContext` is built once per inbound request (see
//! `middleware::context`) and passed explicitly to every dispatch. Children
//! spawned through a `RequestScope` each receive their own copy and are
//! cancelled when the scope is dropped.

use std::convert::Infallible;
use std::future::Future;

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::client::headers::{CALLER_USER_HEADER, decode_claims};
use crate::observability::REQUEST_ID_HEADER;

/// Correlation id used when no inbound request set one.
pub const UNKNOWN_CORRELATION_ID: &str = "unknown";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutboundContext {
    pub correlation_id: String,
    pub caller_user: Map<String, Value>,
    pub caller_service: Map<String, Value>,
}

impl OutboundContext {
    pub fn new(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            ..Default::default()
        }
    }

    pub fn with_caller_user(mut self, claims: Map<String, Value>) -> Self {
        self.caller_user = claims;
        self
    }

    pub fn with_caller_service(mut self, claims: Map<String, Value>) -> Self {
        self.caller_service = claims;
        self
    }

    pub fn correlation_id(&self) -> &str {
        if self.correlation_id.is_empty() {
            UNKNOWN_CORRELATION_ID
        } else {
            &self.correlation_id
        }
    }

    /// Best-effort context from plain request headers. Caller service claims
    /// are left empty; only a verified token may fill them.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let correlation_id = headers
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(UNKNOWN_CORRELATION_ID)
            .to_string();

        let caller_user = headers
            .get(CALLER_USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(decode_claims)
            .unwrap_or_default();

        Self {
            correlation_id,
            caller_user,
            caller_service: Map::new(),
        }
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for OutboundContext
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts
            .extensions
            .get::<OutboundContext>()
            .cloned()
            .unwrap_or_else(|| OutboundContext::from_headers(&parts.headers)))
    }
}

/// Owns the context of one inbound request and the tasks spawned for it.
///
/// Dropping the scope cancels every child that is still running.
pub struct RequestScope {
    context: OutboundContext,
    token: CancellationToken,
    _guard: DropGuard,
}

impl RequestScope {
    pub fn new(context: OutboundContext) -> Self {
        let token = CancellationToken::new();
        let guard = token.clone().drop_guard();
        Self {
            context,
            token,
            _guard: guard,
        }
    }

    pub fn context(&self) -> &OutboundContext {
        &self.context
    }

    /// A copy of the context for the caller to use or modify locally.
    pub fn fork(&self) -> OutboundContext {
        self.context.clone()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Run `f` on its own task with a private copy of the context.
    ///
    /// Resolves to `None` if the scope was cancelled first.
    pub fn spawn<F, Fut, T>(&self, f: F) -> JoinHandle<Option<T>>
    where
        F: FnOnce(OutboundContext) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let token = self.token.child_token();
        let task = f(self.fork());

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => None,
                out = task => Some(out),
            }
        })
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}
