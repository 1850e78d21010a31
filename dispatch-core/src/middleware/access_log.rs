use std::net::SocketAddr;

use axum::extract::ConnectInfo;
use axum::{extract::Request, middleware::Next, response::Response};
use tokio::time::Instant;

use crate::client::TransportKind;
use crate::grpc::TunneledCall;
use crate::observability::{AccessRecord, REQUEST_ID_HEADER};

/// Access log for plain HTTP requests. Tunneled calls are logged by the
/// adapter, which knows their deadline and peer.
pub async fn access_log_middleware(req: Request, next: Next) -> Response {
    if req.extensions().get::<TunneledCall>().is_some() {
        return next.run(req).await;
    }

    let start = Instant::now();
    let method = req.method().to_string();
    let endpoint = req.uri().path().to_string();
    let request_id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_string();
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string());

    let response = next.run(req).await;

    AccessRecord {
        transport: TransportKind::Http,
        method,
        endpoint,
        status: response.status().as_u16(),
        elapsed: start.elapsed(),
        request_id,
        peer,
    }
    .emit();

    response
}
