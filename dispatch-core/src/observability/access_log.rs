//! One access-log schema for HTTP and tunneled requests.

use std::time::Duration;

use metrics::{counter, histogram};

use crate::client::TransportKind;

/// One served request, whichever transport carried it.
#[derive(Debug, Clone)]
pub struct AccessRecord {
    pub transport: TransportKind,
    pub method: String,
    pub endpoint: String,
    pub status: u16,
    pub elapsed: Duration,
    pub request_id: String,
    pub peer: Option<String>,
}

impl AccessRecord {
    /// Log under target `access` and update the request metrics.
    pub fn emit(&self) {
        let elapsed_ms = self.elapsed.as_secs_f64() * 1000.0;

        macro_rules! access {
            ($level:ident) => {
                tracing::$level!(
                    target: "access",
                    transport = self.transport.as_str(),
                    method = %self.method,
                    endpoint = %self.endpoint,
                    status = self.status,
                    elapsed_ms,
                    request_id = %self.request_id,
                    peer = self.peer.as_deref().unwrap_or("-"),
                    "request completed"
                )
            };
        }

        match self.status {
            500.. => access!(error),
            400..=499 => access!(warn),
            _ => access!(info),
        }

        let labels = [
            ("transport", self.transport.as_str().to_string()),
            ("method", self.method.clone()),
            ("status", self.status.to_string()),
        ];
        counter!("http_requests_total", &labels).increment(1);
        histogram!("http_request_duration_seconds", &labels).record(self.elapsed.as_secs_f64());
    }
}
