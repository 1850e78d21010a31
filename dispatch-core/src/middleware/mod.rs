pub mod access_log;
pub mod context;
pub mod tracing;

use std::sync::Arc;

use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router, middleware};
use serde_json::json;
use tower_http::catch_panic::CatchPanicLayer;

use crate::client::ServiceIdentity;

pub use access_log::access_log_middleware;
pub use context::inbound_context_middleware;
pub use self::tracing::request_id_middleware;

/// Wrap `router` in the layers every dispatch-capable service runs.
///
/// Outermost first: request id, access log, inbound context, panic guard.
/// The same router serves plain HTTP and tunneled calls.
pub fn apply_standard_layers(router: Router, identity: Arc<ServiceIdentity>) -> Router {
    router
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(middleware::from_fn_with_state(
            identity,
            inbound_context_middleware,
        ))
        .layer(middleware::from_fn(access_log_middleware))
        .layer(middleware::from_fn(request_id_middleware))
}

fn handle_panic(err: Box<dyn std::any::Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.as_str()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s
    } else {
        "unknown panic"
    };
    ::tracing::error!(panic = %detail, "Handler panicked");

    (
        StatusCode::INTERNAL_SERVER_ERROR,
        [(header::CACHE_CONTROL, "no-store")],
        Json(json!({ "error": "Internal server error" })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use axum::routing::get;
    use http_body_util::BodyExt;
    use secrecy::Secret;
    use tower::ServiceExt;

    use crate::context::OutboundContext;
    use crate::observability::REQUEST_ID_HEADER;

    fn identity(name: &str) -> Arc<ServiceIdentity> {
        Arc::new(ServiceIdentity::new(name, &Secret::new("s3cret".to_string())))
    }

    async fn whoami(ctx: OutboundContext) -> Json<OutboundContext> {
        Json(ctx)
    }

    async fn boom() -> &'static str {
        panic!("kaboom")
    }

    fn app() -> Router {
        let router = Router::new()
            .route("/whoami", get(whoami))
            .route("/boom", get(boom));
        apply_standard_layers(router, identity("billing"))
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_request_id_is_generated_and_echoed() {
        let response = app()
            .oneshot(Request::get("/whoami").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let echoed = response
            .headers()
            .get(REQUEST_ID_HEADER)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(!echoed.is_empty());

        let ctx = body_json(response).await;
        assert_eq!(ctx["correlation_id"], echoed.as_str());
    }

    #[tokio::test]
    async fn test_verified_token_fills_caller_service() {
        let token = identity("ledger").issue("billing").unwrap().token;
        let response = app()
            .oneshot(
                Request::get("/whoami")
                    .header("authorization", format!("Bearer {token}"))
                    .header(REQUEST_ID_HEADER, "req-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let ctx = body_json(response).await;
        assert_eq!(ctx["correlation_id"], "req-1");
        assert_eq!(ctx["caller_service"]["iss"], "ledger");
    }

    #[tokio::test]
    async fn test_token_for_other_audience_is_ignored() {
        let token = identity("ledger").issue("payments").unwrap().token;
        let response = app()
            .oneshot(
                Request::get("/whoami")
                    .header("authorization", format!("Bearer {token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let ctx = body_json(response).await;
        assert!(ctx["caller_service"].as_object().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_panic_becomes_500() {
        let response = app()
            .oneshot(Request::get("/boom").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(response.headers().contains_key(REQUEST_ID_HEADER));
        assert_eq!(body_json(response).await["error"], "Internal server error");
    }
}
