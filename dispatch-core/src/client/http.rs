//! Pooled HTTP transport.

use std::error::Error as StdError;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use tokio::sync::{RwLock, Semaphore};

use super::error::{DispatchError, Unavailability};
use super::request::{DispatchRequest, DispatchResponse, decode_body};
use super::transport::{OutboundCall, Transport, TransportKind};

/// Pool settings of one target's HTTP client.
#[derive(Clone, Debug)]
pub struct HttpPoolConfig {
    pub connect_timeout: Duration,
    pub max_idle_per_host: usize,
    /// In-flight requests allowed at once.
    pub permits: usize,
}

/// One keep-alive pool per target, created on first use. A semaphore bounds
/// in-flight requests.
pub struct HttpTransport {
    target: String,
    config: HttpPoolConfig,
    client: RwLock<Option<reqwest::Client>>,
    permits: Semaphore,
}

impl HttpTransport {
    pub fn new(target: impl Into<String>, config: HttpPoolConfig) -> Self {
        let permits = Semaphore::new(config.permits.max(1));
        Self {
            target: target.into(),
            config,
            client: RwLock::new(None),
            permits,
        }
    }

    async fn client(&self) -> Result<reqwest::Client, DispatchError> {
        {
            let client = self.client.read().await;
            if let Some(client) = client.as_ref() {
                return Ok(client.clone());
            }
        }

        let mut client = self.client.write().await;
        // Double-check after acquiring write lock
        if let Some(existing) = client.as_ref() {
            return Ok(existing.clone());
        }

        let created = reqwest::Client::builder()
            .connect_timeout(self.config.connect_timeout)
            .pool_max_idle_per_host(self.config.max_idle_per_host)
            .build()
            .map_err(|e| DispatchError::Unknown {
                service: self.target.clone(),
                detail: format!("failed to build HTTP client: {e}"),
            })?;

        tracing::debug!(service = %self.target, "Created HTTP connection pool");
        *client = Some(created.clone());
        Ok(created)
    }

    fn multipart(&self, request: &DispatchRequest) -> Result<Form, DispatchError> {
        let mut form = Form::new();

        for (name, value) in &request.payload {
            form = form.text(name.clone(), value.to_string());
        }

        for (field, blobs) in &request.files {
            for blob in blobs {
                let part = Part::bytes(blob.content.clone())
                    .file_name(blob.name.clone())
                    .mime_str(&blob.content_type)
                    .map_err(|e| DispatchError::Unknown {
                        service: self.target.clone(),
                        detail: format!("invalid content type for {}: {e}", blob.name),
                    })?;
                form = form.part(field.clone(), part);
            }
        }

        Ok(form)
    }

    fn translate(&self, err: reqwest::Error, timeout: Duration) -> DispatchError {
        let service = self.target.clone();

        if err.is_timeout() {
            return DispatchError::Timeout { service, timeout };
        }

        if err.is_connect() {
            let reason = if has_io_error(&err, io::ErrorKind::ConnectionRefused) {
                Unavailability::ConnectionRefused
            } else if is_resolution_failure(&err) {
                Unavailability::Resolution
            } else {
                Unavailability::Disconnected
            };
            return DispatchError::Unavailable {
                service,
                reason,
                detail: error_chain(&err),
            };
        }

        if err.is_request() || err.is_body() || err.is_decode() {
            return DispatchError::Unavailable {
                service,
                reason: Unavailability::Disconnected,
                detail: error_chain(&err),
            };
        }

        DispatchError::Unknown {
            service,
            detail: error_chain(&err),
        }
    }
}

fn has_io_error(err: &(dyn StdError + 'static), kind: io::ErrorKind) -> bool {
    let mut source: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(err) = source {
        if let Some(io_err) = err.downcast_ref::<io::Error>()
            && io_err.kind() == kind
        {
            return true;
        }
        source = err.source();
    }
    false
}

fn is_resolution_failure(err: &reqwest::Error) -> bool {
    let chain = error_chain(err).to_ascii_lowercase();
    chain.contains("dns error") || chain.contains("failed to lookup address")
}

fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(err) = source {
        message.push_str(": ");
        message.push_str(&err.to_string());
        source = err.source();
    }
    message
}

#[async_trait]
impl Transport for HttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    async fn send(&self, call: &OutboundCall<'_>) -> Result<DispatchResponse, DispatchError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| DispatchError::Unavailable {
                service: self.target.clone(),
                reason: Unavailability::Closed,
                detail: "HTTP transport closed".to_string(),
            })?;

        let client = self.client().await?;
        let url = format!("{}{}", call.endpoint.http_base(), call.path());

        let mut builder = client
            .request(call.request.method.clone(), url)
            .headers(call.headers.clone())
            .timeout(call.timeout);

        if !call.request.query.is_empty() {
            builder = builder.query(&call.request.query);
        }

        if call.request.has_files() {
            builder = builder.multipart(self.multipart(call.request)?);
        } else if !call.request.payload.is_empty() {
            builder = builder.json(&call.request.payload);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| self.translate(e, call.timeout))?;
        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| self.translate(e, call.timeout))?;

        Ok(DispatchResponse::new(
            status,
            decode_body(&bytes),
            TransportKind::Http,
        ))
    }

    async fn close(&self) {
        if self.client.write().await.take().is_some() {
            tracing::debug!(service = %self.target, "Closed HTTP connection pool");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_has_io_error_walks_chain() {
        #[derive(Debug)]
        struct Wrapper(io::Error);
        impl std::fmt::Display for Wrapper {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("connect failed")
            }
        }
        impl StdError for Wrapper {
            fn source(&self) -> Option<&(dyn StdError + 'static)> {
                Some(&self.0)
            }
        }

        let err = Wrapper(io::Error::from(io::ErrorKind::ConnectionRefused));
        assert!(has_io_error(&err, io::ErrorKind::ConnectionRefused));
        assert!(!has_io_error(&err, io::ErrorKind::TimedOut));
        assert!(error_chain(&err).starts_with("connect failed: "));
    }

    #[tokio::test]
    async fn test_refused_connection() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let transport = HttpTransport::new(
            "ghost",
            HttpPoolConfig {
                connect_timeout: Duration::from_secs(1),
                max_idle_per_host: 1,
                permits: 1,
            },
        );
        let client = transport.client().await.unwrap();
        let err = client
            .get(format!("http://127.0.0.1:{port}/"))
            .send()
            .await
            .unwrap_err();

        let translated = transport.translate(err, Duration::from_secs(1));
        assert!(translated.allows_fallback(), "got {translated:?}");
    }

    fn transport() -> HttpTransport {
        HttpTransport::new(
            "ghost",
            HttpPoolConfig {
                connect_timeout: Duration::from_secs(1),
                max_idle_per_host: 1,
                permits: 1,
            },
        )
    }

    /// Accepts one connection, reads the request, then runs `respond`.
    async fn raw_server<F, Fut>(respond: F) -> u16
    where
        F: FnOnce(tokio::net::TcpStream) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        use tokio::io::AsyncReadExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = stream.read(&mut buf).await;
            respond(stream).await;
        });
        port
    }

    #[tokio::test]
    async fn test_unresolvable_host() {
        let transport = transport();
        let client = transport.client().await.unwrap();
        let err = client
            .get("http://ledger.invalid/")
            .send()
            .await
            .unwrap_err();

        match transport.translate(err, Duration::from_secs(1)) {
            DispatchError::Unavailable { reason, .. } => {
                assert_eq!(reason, Unavailability::Resolution)
            }
            other => panic!("expected unavailable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_disconnect_mid_response() {
        use tokio::io::AsyncWriteExt;

        let port = raw_server(|mut stream| async move {
            stream
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 100\r\n\r\npartial")
                .await
                .unwrap();
            stream.shutdown().await.unwrap();
        })
        .await;

        let transport = transport();
        let client = transport.client().await.unwrap();
        let response = client
            .get(format!("http://127.0.0.1:{port}/"))
            .send()
            .await
            .unwrap();
        let err = response.bytes().await.unwrap_err();

        match transport.translate(err, Duration::from_secs(1)) {
            DispatchError::Unavailable { reason, .. } => {
                assert_eq!(reason, Unavailability::Disconnected)
            }
            other => panic!("expected unavailable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_read_timeout() {
        let port = raw_server(|stream| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        })
        .await;

        let transport = transport();
        let client = transport.client().await.unwrap();
        let err = client
            .get(format!("http://127.0.0.1:{port}/"))
            .timeout(Duration::from_millis(200))
            .send()
            .await
            .unwrap_err();

        let translated = transport.translate(err, Duration::from_millis(200));
        assert!(matches!(translated, DispatchError::Timeout { .. }), "got {translated:?}");
        assert!(!translated.allows_fallback());
    }
}
