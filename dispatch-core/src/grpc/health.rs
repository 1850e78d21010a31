//! Health status shared by the probing client and the tunnel server.
//!
//! Wraps `tonic-health` so the tunnel server can publish the serving status of
//! the dispatch service, and gives the client one enum to cache probe results in.

use std::sync::Arc;
use tokio::sync::RwLock;
use tonic_health::pb::health_check_response::ServingStatus as ProtoServingStatus;
use tonic_health::server::HealthReporter as TonicHealthReporter;

/// Serving status of a target's tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HealthStatus {
    /// Never probed, or the probe failed for a reason other than a refusal.
    #[default]
    Unknown,
    /// The target accepts tunneled requests.
    Serving,
    /// The target is up but not accepting tunneled requests.
    NotServing,
    /// The target does not know the service, or nothing listens on the port.
    ServiceUnknown,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Unknown => "unknown",
            HealthStatus::Serving => "serving",
            HealthStatus::NotServing => "not_serving",
            HealthStatus::ServiceUnknown => "service_unknown",
        }
    }

    /// Decode the raw status carried in a `HealthCheckResponse`.
    pub fn from_proto(raw: i32) -> Self {
        match ProtoServingStatus::try_from(raw) {
            Ok(ProtoServingStatus::Serving) => HealthStatus::Serving,
            Ok(ProtoServingStatus::NotServing) => HealthStatus::NotServing,
            Ok(ProtoServingStatus::ServiceUnknown) => HealthStatus::ServiceUnknown,
            Ok(ProtoServingStatus::Unknown) | Err(_) => HealthStatus::Unknown,
        }
    }
}

impl From<HealthStatus> for tonic_health::ServingStatus {
    fn from(status: HealthStatus) -> Self {
        match status {
            HealthStatus::Serving => tonic_health::ServingStatus::Serving,
            HealthStatus::NotServing => tonic_health::ServingStatus::NotServing,
            // The reporter cannot publish SERVICE_UNKNOWN; the server answers
            // that on its own for unregistered names.
            HealthStatus::Unknown | HealthStatus::ServiceUnknown => {
                tonic_health::ServingStatus::Unknown
            }
        }
    }
}

/// Reporter for updating service health status.
///
/// This wraps `tonic-health`'s `HealthReporter` to provide a simpler interface.
#[derive(Clone)]
pub struct HealthReporter {
    inner: Arc<RwLock<TonicHealthReporter>>,
    service_name: String,
}

impl HealthReporter {
    pub fn new(reporter: TonicHealthReporter, service_name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(reporter)),
            service_name: service_name.into(),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Set the health status for this service. `Watch` streams see the change.
    pub async fn set_status(&self, status: HealthStatus) {
        let mut reporter = self.inner.write().await;
        reporter
            .set_service_status(&self.service_name, status.into())
            .await;
    }

    pub async fn set_serving(&self) {
        self.set_status(HealthStatus::Serving).await;
    }

    pub async fn set_not_serving(&self) {
        self.set_status(HealthStatus::NotServing).await;
    }
}

/// Health service components returned by `create_health_service`.
pub struct HealthComponents<S> {
    /// The health server to add to the gRPC router.
    pub server: tonic_health::pb::health_server::HealthServer<S>,
    /// The reporter for updating health status.
    pub reporter: HealthReporter,
}

/// Create a health service whose `service_name` starts out serving.
///
/// ```ignore
/// let health = create_health_service(DISPATCH_SERVICE_NAME).await;
/// health.reporter.set_not_serving().await;
/// ```
pub async fn create_health_service(
    service_name: impl Into<String>,
) -> HealthComponents<impl tonic_health::pb::health_server::Health> {
    let service_name = service_name.into();
    let (mut reporter, health_server) = tonic_health::server::health_reporter();

    reporter
        .set_service_status(&service_name, tonic_health::ServingStatus::Serving)
        .await;

    let health_reporter = HealthReporter::new(reporter, service_name);
    HealthComponents {
        server: health_server,
        reporter: health_reporter,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_status_conversion() {
        assert_eq!(
            tonic_health::ServingStatus::from(HealthStatus::Serving),
            tonic_health::ServingStatus::Serving
        );
        assert_eq!(
            tonic_health::ServingStatus::from(HealthStatus::NotServing),
            tonic_health::ServingStatus::NotServing
        );
        assert_eq!(
            tonic_health::ServingStatus::from(HealthStatus::ServiceUnknown),
            tonic_health::ServingStatus::Unknown
        );
    }

    #[test]
    fn test_from_proto() {
        assert_eq!(HealthStatus::from_proto(1), HealthStatus::Serving);
        assert_eq!(HealthStatus::from_proto(2), HealthStatus::NotServing);
        assert_eq!(HealthStatus::from_proto(3), HealthStatus::ServiceUnknown);
        assert_eq!(HealthStatus::from_proto(0), HealthStatus::Unknown);
        assert_eq!(HealthStatus::from_proto(42), HealthStatus::Unknown);
    }
}
