//! TTL-cached serving status of one target's tunnel.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::descriptor::{ServiceDescriptor, ServiceResolver};
use super::tunnel::TunneledTransport;
use crate::grpc::HealthStatus;

/// Asks a target whether its tunnel is serving. Never fails: every outcome
/// is a status.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self) -> HealthStatus;
}

#[derive(Debug, Clone, Copy)]
struct Observation {
    status: HealthStatus,
    checked_at: Instant,
}

/// Advisory health gate in front of the tunneled transport.
///
/// A status younger than the TTL is answered from memory. Older (or absent)
/// statuses are refreshed by one probe while other callers wait on the lock,
/// and failed probes are cached like successful ones.
pub struct HealthStatusCache {
    target: String,
    probe: Arc<dyn HealthProbe>,
    ttl: Duration,
    state: Mutex<Option<Observation>>,
}

impl HealthStatusCache {
    pub fn new(target: impl Into<String>, probe: Arc<dyn HealthProbe>, ttl: Duration) -> Self {
        Self {
            target: target.into(),
            probe,
            ttl,
            state: Mutex::new(None),
        }
    }

    pub async fn is_serving(&self) -> bool {
        self.status().await == HealthStatus::Serving
    }

    pub async fn status(&self) -> HealthStatus {
        let mut state = self.state.lock().await;

        if let Some(observation) = *state
            && observation.checked_at.elapsed() < self.ttl
        {
            return observation.status;
        }

        let status = self.probe.probe().await;
        counter!(
            "health_probes_total",
            "target" => self.target.clone(),
            "status" => status.as_str()
        )
        .increment(1);
        tracing::debug!(target_service = %self.target, status = status.as_str(), "Health probe finished");

        *state = Some(Observation {
            status,
            checked_at: Instant::now(),
        });
        status
    }

    /// Last cached status without probing.
    pub async fn peek(&self) -> Option<HealthStatus> {
        self.state.lock().await.map(|observation| observation.status)
    }

    /// Forget the cached status so the next read probes.
    pub async fn invalidate(&self) {
        *self.state.lock().await = None;
    }
}

/// Standard `grpc.health.v1.Health/Check` against the target's tunnel port.
pub struct GrpcHealthProbe {
    descriptor: ServiceDescriptor,
    resolver: Arc<dyn ServiceResolver>,
    tunnel: Arc<TunneledTransport>,
    timeout: Duration,
}

impl GrpcHealthProbe {
    pub fn new(
        descriptor: ServiceDescriptor,
        resolver: Arc<dyn ServiceResolver>,
        tunnel: Arc<TunneledTransport>,
        timeout: Duration,
    ) -> Self {
        Self {
            descriptor,
            resolver,
            tunnel,
            timeout,
        }
    }
}

#[async_trait]
impl HealthProbe for GrpcHealthProbe {
    async fn probe(&self) -> HealthStatus {
        match self.resolver.resolve(&self.descriptor).await {
            Ok(endpoint) => self.tunnel.probe(&endpoint, self.timeout).await,
            Err(e) => {
                tracing::warn!(service = %self.descriptor.name, error = %e, "Health probe could not resolve target");
                HealthStatus::Unknown
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProbe {
        calls: AtomicUsize,
        status: HealthStatus,
    }

    impl CountingProbe {
        fn new(status: HealthStatus) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                status,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl HealthProbe for CountingProbe {
        async fn probe(&self) -> HealthStatus {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.status
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_probe_within_ttl() {
        let probe = CountingProbe::new(HealthStatus::Serving);
        let cache = HealthStatusCache::new("ledger", probe.clone(), Duration::from_secs(60));

        assert_eq!(cache.peek().await, None);
        assert!(cache.is_serving().await);
        assert!(cache.is_serving().await);
        assert_eq!(probe.calls(), 1);

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(cache.is_serving().await);
        assert_eq!(probe.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reprobe_after_ttl() {
        let probe = CountingProbe::new(HealthStatus::NotServing);
        let cache = HealthStatusCache::new("ledger", probe.clone(), Duration::from_secs(60));

        assert!(!cache.is_serving().await);
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!cache.is_serving().await);
        assert_eq!(probe.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_is_cached() {
        let probe = CountingProbe::new(HealthStatus::ServiceUnknown);
        let cache = HealthStatusCache::new("ledger", probe.clone(), Duration::from_secs(60));

        for _ in 0..5 {
            assert!(!cache.is_serving().await);
        }
        assert_eq!(probe.calls(), 1);
        assert_eq!(cache.peek().await, Some(HealthStatus::ServiceUnknown));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_readers_share_one_probe() {
        let probe = CountingProbe::new(HealthStatus::Serving);
        let cache = Arc::new(HealthStatusCache::new(
            "ledger",
            probe.clone(),
            Duration::from_secs(60),
        ));

        let readers: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.is_serving().await })
            })
            .collect();
        for reader in readers {
            assert!(reader.await.unwrap());
        }
        assert_eq!(probe.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_forces_probe() {
        let probe = CountingProbe::new(HealthStatus::Serving);
        let cache = HealthStatusCache::new("ledger", probe.clone(), Duration::from_secs(60));

        cache.is_serving().await;
        cache.invalidate().await;
        cache.is_serving().await;
        assert_eq!(probe.calls(), 2);
    }
}
