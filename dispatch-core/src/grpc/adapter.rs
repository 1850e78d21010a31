//! Server side of the tunnel: runs each tunneled request through the same
//! axum router that serves plain HTTP.

use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{HeaderName, HeaderValue, Method, Request, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use http_body_util::BodyExt;
use tokio::time::Instant;
use tonic::metadata::MetadataMap;
use tonic::{Code, Status};
use tower::ServiceExt;
use uuid::Uuid;

use super::codec::{decode_body_fields, encode_multipart, struct_to_json};
use super::proto::dispatch_service_server::DispatchService;
use super::proto::{TunneledRequest, TunneledResponse};
use super::status::{
    CLIENT_CLOSED_REQUEST, FRAMING_REJECTED, UNREGISTERED_ENDPOINT, to_http_status,
};
use super::tracker::ConnectionTracker;
use crate::client::TransportKind;
use crate::context::{OutboundContext, UNKNOWN_CORRELATION_ID};
use crate::observability::{AccessRecord, REQUEST_ID_HEADER};

/// Marks a request that arrived through the tunnel.
#[derive(Debug, Clone, Copy)]
pub struct TunneledCall;

/// Set on the fallback response so the adapter can tell "no such route"
/// from a handler that returned 404.
#[derive(Debug, Clone, Copy)]
struct UnregisteredEndpoint;

async fn unregistered_endpoint() -> Response {
    let mut response = (
        StatusCode::NOT_FOUND,
        axum::Json(serde_json::json!({ "error": "Not found" })),
    )
        .into_response();
    response.extensions_mut().insert(UnregisteredEndpoint);
    response
}

/// Parse a `grpc-timeout` value: 1 to 8 digits and a unit.
pub fn parse_grpc_timeout(raw: &str) -> Option<Duration> {
    if raw.len() < 2 || raw.len() > 9 {
        return None;
    }
    let (digits, unit) = raw.split_at(raw.len() - 1);
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let value: u64 = digits.parse().ok()?;

    let duration = match unit {
        "H" => Duration::from_secs(value.checked_mul(3600)?),
        "M" => Duration::from_secs(value.checked_mul(60)?),
        "S" => Duration::from_secs(value),
        "m" => Duration::from_millis(value),
        "u" => Duration::from_micros(value),
        "n" => Duration::from_nanos(value),
        _ => return None,
    };
    Some(duration)
}

fn metadata_str<'a>(metadata: &'a MetadataMap, key: &str) -> Option<&'a str> {
    metadata.get(key).and_then(|v| v.to_str().ok())
}

#[allow(clippy::result_large_err)]
fn validate_framing(metadata: &MetadataMap) -> Result<(), Status> {
    let content_type = metadata_str(metadata, "content-type").unwrap_or_default();
    if !(content_type == "application/grpc" || content_type.starts_with("application/grpc+")) {
        return Err(Status::invalid_argument(format!(
            "{FRAMING_REJECTED}: unsupported content-type `{content_type}`"
        )));
    }

    if metadata_str(metadata, "te") != Some("trailers") {
        return Err(Status::invalid_argument(format!(
            "{FRAMING_REJECTED}: missing `te: trailers`"
        )));
    }
    Ok(())
}

#[allow(clippy::result_large_err)]
fn deadline(metadata: &MetadataMap) -> Result<Option<Duration>, Status> {
    match metadata_str(metadata, "grpc-timeout") {
        None => Ok(None),
        Some(raw) => parse_grpc_timeout(raw)
            .map(Some)
            .ok_or_else(|| Status::out_of_range("invalid deadline")),
    }
}

/// Headers the adapter sets itself from the tunneled body.
const SKIPPED_HEADERS: [&str; 4] = ["content-type", "content-length", "transfer-encoding", "host"];

#[allow(clippy::result_large_err)]
fn synthetic_request(
    message: TunneledRequest,
    endpoint: &str,
    peer: Option<SocketAddr>,
) -> Result<Request<Body>, Status> {
    let method = Method::from_bytes(message.method.to_ascii_uppercase().as_bytes())
        .map_err(|_| Status::invalid_argument(format!("invalid method `{}`", message.method)))?;
    let uri: Uri = endpoint
        .parse()
        .ok()
        .filter(|uri: &Uri| uri.path().starts_with('/'))
        .ok_or_else(|| Status::invalid_argument(format!("invalid endpoint `{endpoint}`")))?;

    let correlation_id = if message.request_id.is_empty() {
        UNKNOWN_CORRELATION_ID.to_string()
    } else {
        message.request_id.clone()
    };
    // Caller service claims are only taken from a verified bearer token,
    // never from the unsigned `service` field.
    let context = OutboundContext {
        correlation_id: correlation_id.clone(),
        caller_user: message.user.as_ref().map(struct_to_json).unwrap_or_default(),
        caller_service: Default::default(),
    };

    let (content_type, body) = if message.files.is_empty() {
        let body = if message.body.is_empty() {
            Vec::new()
        } else {
            serde_json::to_vec(&decode_body_fields(&message.body))
                .map_err(|e| Status::invalid_argument(format!("invalid body: {e}")))?
        };
        ("application/json".to_string(), body)
    } else {
        let boundary = format!("dispatch-{}", Uuid::new_v4().simple());
        (
            format!("multipart/form-data; boundary={boundary}"),
            encode_multipart(&boundary, &message.body, &message.files),
        )
    };

    let mut request = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::from(body))
        .map_err(|e| Status::invalid_argument(e.to_string()))?;

    let headers = request.headers_mut();
    for (name, value) in &message.headers {
        if SKIPPED_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.insert(name, value);
        }
    }
    if let Ok(value) = HeaderValue::from_str(&content_type) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    if let Ok(value) = HeaderValue::from_str(&correlation_id) {
        headers.insert(REQUEST_ID_HEADER, value);
    }

    let extensions = request.extensions_mut();
    extensions.insert(context);
    extensions.insert(ConnectInfo(
        peer.unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0))),
    ));
    extensions.insert(TunneledCall);

    Ok(request)
}

/// Emits exactly one access record per call, including calls dropped by
/// the peer before they finished.
struct CallLog {
    method: String,
    endpoint: String,
    request_id: String,
    peer: Option<SocketAddr>,
    started: Instant,
    deadline: Option<Duration>,
    done: bool,
}

impl CallLog {
    fn new(message: &TunneledRequest, endpoint: &str, peer: Option<SocketAddr>) -> Self {
        Self {
            method: message.method.clone(),
            endpoint: endpoint.to_string(),
            request_id: message.request_id.clone(),
            peer,
            started: Instant::now(),
            deadline: None,
            done: false,
        }
    }

    fn finish(&mut self, status: u16) {
        if self.done {
            return;
        }
        self.done = true;

        AccessRecord {
            transport: TransportKind::Grpc,
            method: self.method.clone(),
            endpoint: self.endpoint.clone(),
            status,
            elapsed: self.started.elapsed(),
            request_id: if self.request_id.is_empty() {
                UNKNOWN_CORRELATION_ID.to_string()
            } else {
                self.request_id.clone()
            },
            peer: self.peer.map(|addr| addr.to_string()),
        }
        .emit();
    }

    fn fail(&mut self, status: &Status) {
        self.finish(to_http_status(status.code() as i32).unwrap_or(500));
    }
}

impl Drop for CallLog {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let expired = self
            .deadline
            .is_some_and(|deadline| self.started.elapsed() >= deadline);
        if expired {
            self.finish(StatusCode::GATEWAY_TIMEOUT.as_u16());
        } else {
            self.finish(CLIENT_CLOSED_REQUEST);
        }
    }
}

/// `dispatch.v1.DispatchService` backed by an axum router.
#[derive(Clone)]
pub struct DispatchGrpcService {
    router: Router,
    tracker: ConnectionTracker,
}

impl DispatchGrpcService {
    /// Installs a fallback on `router` so unregistered endpoints are
    /// answered without running a handler.
    pub fn new(router: Router, tracker: ConnectionTracker) -> Self {
        Self {
            router: router.fallback(unregistered_endpoint),
            tracker,
        }
    }

    pub fn tracker(&self) -> &ConnectionTracker {
        &self.tracker
    }

    /// Execute one tunneled request.
    pub async fn execute(
        &self,
        metadata: &MetadataMap,
        peer: Option<SocketAddr>,
        message: TunneledRequest,
    ) -> Result<TunneledResponse, Status> {
        let endpoint = String::from_utf8_lossy(&message.endpoint).into_owned();
        let mut log = CallLog::new(&message, &endpoint, peer);

        let outcome = self.run(metadata, peer, message, &endpoint, &mut log).await;
        match &outcome {
            Ok(response) => log.finish(u16::try_from(response.status_code).unwrap_or(500)),
            Err(status) => log.fail(status),
        }
        outcome
    }

    async fn run(
        &self,
        metadata: &MetadataMap,
        peer: Option<SocketAddr>,
        message: TunneledRequest,
        endpoint: &str,
        log: &mut CallLog,
    ) -> Result<TunneledResponse, Status> {
        validate_framing(metadata)?;
        let deadline = deadline(metadata)?;
        log.deadline = deadline;

        let _task = self.tracker.enter(peer);
        let request = synthetic_request(message, endpoint, peer)?;
        let call = self.router.clone().oneshot(request);

        let response = match deadline {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| Status::deadline_exceeded(format!("deadline of {limit:?} exceeded")))?,
            None => call.await,
        };
        let response = match response {
            Ok(response) => response,
            Err(never) => match never {},
        };

        if response.extensions().get::<UnregisteredEndpoint>().is_some() {
            return Err(Status::new(
                Code::Unimplemented,
                format!("{UNREGISTERED_ENDPOINT}: {endpoint}"),
            ));
        }

        let status_code = i32::from(response.status().as_u16());
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| Status::internal(format!("failed to read handler body: {e}")))?
            .to_bytes();

        Ok(TunneledResponse {
            body: body.to_vec(),
            status_code,
        })
    }
}

#[tonic::async_trait]
impl DispatchService for DispatchGrpcService {
    async fn dispatch(
        &self,
        request: tonic::Request<TunneledRequest>,
    ) -> Result<tonic::Response<TunneledResponse>, Status> {
        let peer = request.remote_addr();
        let (metadata, _, message) = request.into_parts();
        self.execute(&metadata, peer, message)
            .await
            .map(tonic::Response::new)
    }
}
