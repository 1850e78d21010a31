use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::{middleware::Next, response::Response};

use crate::client::ServiceIdentity;
use crate::context::OutboundContext;

/// Attach an `OutboundContext` to the request.
///
/// A context already present (set by the tunnel adapter) keeps its
/// correlation id and caller user; otherwise both are read from headers.
/// On either transport the caller service claims come only from a bearer
/// token that verifies against `identity`.
pub async fn inbound_context_middleware(
    State(identity): State<Arc<ServiceIdentity>>,
    mut req: Request,
    next: Next,
) -> Response {
    let existing = req.extensions_mut().remove::<OutboundContext>();
    let mut context = existing.unwrap_or_else(|| OutboundContext::from_headers(req.headers()));
    context.caller_service.clear();

    let bearer = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    if let Some(token) = bearer {
        match identity.verify(token) {
            Ok(claims) => context.caller_service = claims.to_map(),
            Err(e) => tracing::debug!(error = %e, "Ignoring unverifiable service token"),
        }
    }

    req.extensions_mut().insert(context);
    next.run(req).await
}
