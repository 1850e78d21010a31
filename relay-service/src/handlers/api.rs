//! Demo endpoints. Every route works the same over HTTP and the tunnel.

use axum::extract::{Multipart, Path, RawQuery, State};
use axum::http::{Method, StatusCode};
use axum::{Extension, Json};
use dispatch_core::client::DispatchRequest;
use dispatch_core::context::OutboundContext;
use dispatch_core::error::AppError;
use dispatch_core::grpc::TunneledCall;
use serde_json::{json, Map, Value};

use super::AppState;

pub async fn ping(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "pong": true, "service": state.service_name }))
}

/// Report what arrived: body, context and the transport that carried it.
pub async fn echo(
    ctx: OutboundContext,
    tunneled: Option<Extension<TunneledCall>>,
    body: Option<Json<Value>>,
) -> (StatusCode, Json<Value>) {
    let transport = if tunneled.is_some() { "grpc" } else { "http" };
    (
        StatusCode::OK,
        Json(json!({
            "body": body.map(|Json(b)| b).unwrap_or(Value::Null),
            "request_id": ctx.correlation_id(),
            "caller_user": ctx.caller_user,
            "caller_service": ctx.caller_service,
            "transport": transport,
        })),
    )
}

/// Summarize a multipart upload: text fields verbatim, files by size.
pub async fn upload(mut multipart: Multipart) -> Result<Json<Value>, AppError> {
    let mut fields = Map::new();
    let mut files = Map::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(e.into()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match field.file_name().map(str::to_string) {
            Some(file_name) => {
                let content_type = field.content_type().unwrap_or_default().to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::BadRequest(e.into()))?;
                files.insert(
                    name,
                    json!({
                        "file_name": file_name,
                        "content_type": content_type,
                        "size": bytes.len(),
                    }),
                );
            }
            None => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| AppError::BadRequest(e.into()))?;
                fields.insert(name, json!(text));
            }
        }
    }

    Ok(Json(json!({ "fields": fields, "files": files })))
}

/// Respond with the requested error status.
pub async fn fail(Path(code): Path<u16>) -> Result<(StatusCode, Json<Value>), AppError> {
    let status = StatusCode::from_u16(code)
        .ok()
        .filter(|s| s.is_client_error() || s.is_server_error())
        .ok_or_else(|| AppError::BadRequest(anyhow::anyhow!("{code} is not an error status")))?;

    Ok((
        status,
        Json(json!({
            "message": format!("forced failure {code}"),
            "description": "requested through /fail",
            "error_code": "forced_failure",
        })),
    ))
}

/// Forward the call to `service` and hand back its `(body, status)`.
pub async fn relay(
    State(state): State<AppState>,
    ctx: OutboundContext,
    method: Method,
    Path((service, path)): Path<(String, String)>,
    RawQuery(query): RawQuery,
    body: Option<Json<Map<String, Value>>>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let client = state
        .registry
        .get(&service)
        .map_err(|e| AppError::BadRequest(e.into()))?;

    let pairs: Vec<(String, String)> = match query.as_deref() {
        Some(raw) => serde_urlencoded::from_str(raw).map_err(|e| AppError::BadRequest(e.into()))?,
        None => Vec::new(),
    };

    let mut request = DispatchRequest::new(method, path);
    for (key, value) in pairs {
        request = request.query(key, value);
    }
    if let Some(Json(payload)) = body {
        request = request.json(Value::Object(payload));
    }

    tracing::debug!(target_service = %service, endpoint = %request.endpoint, "Relaying request");
    let response = client.dispatch(&ctx, request).await?;
    Ok((response.status, Json(response.body)))
}
