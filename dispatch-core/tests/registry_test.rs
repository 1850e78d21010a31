//! Registry lifecycle against a live upstream.

mod common;

use std::sync::Arc;

use axum::routing::get;
use axum::{Json, Router};
use common::{Upstream, registry};
use dispatch_core::client::{DispatchError, DispatchRequest, RegistryError, Unavailability};
use dispatch_core::context::OutboundContext;
use serde_json::json;

fn router() -> Router {
    Router::new().route("/api/v1/ping", get(|| async { Json(json!({ "pong": true })) }))
}

#[tokio::test]
async fn reset_replaces_clients_and_keeps_working() {
    let ledger = Upstream::spawn("ledger", router()).await;
    let registry = registry(&[&ledger]);
    let ctx = OutboundContext::new("req-1");

    let before = registry.get("ledger").unwrap();
    let response = before.dispatch(&ctx, DispatchRequest::get("ping")).await.unwrap();
    assert_eq!(response.body["pong"], true);

    registry.reset().await;
    assert!(before.is_closed());

    let stale = before
        .dispatch(&ctx, DispatchRequest::get("ping").propagate_error(true))
        .await
        .unwrap_err();
    assert!(matches!(
        stale,
        DispatchError::Unavailable {
            reason: Unavailability::Closed,
            ..
        }
    ));

    let after = registry.get("ledger").unwrap();
    assert!(!Arc::ptr_eq(&before, &after));
    let response = after.dispatch(&ctx, DispatchRequest::get("ping")).await.unwrap();
    assert_eq!(response.body["pong"], true);
}

#[tokio::test]
async fn unknown_service_is_rejected() {
    let ledger = Upstream::spawn("ledger", router()).await;
    let registry = registry(&[&ledger]);

    assert_eq!(
        registry.get("payments").unwrap_err(),
        RegistryError::UnknownService("payments".into())
    );
}

#[tokio::test]
async fn shutdown_closes_every_client() {
    let ledger = Upstream::spawn("ledger", router()).await;
    let billing = Upstream::spawn("billing", router()).await;
    let registry = registry(&[&ledger, &billing]);

    let clients = [registry.get("ledger").unwrap(), registry.get("billing").unwrap()];
    registry.shutdown().await;

    assert!(clients.iter().all(|c| c.is_closed()));
    assert!(registry.is_empty());
}
