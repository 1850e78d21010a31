//! Bookkeeping of tunneled calls per peer connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use metrics::gauge;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy)]
struct PeerStats {
    in_flight: usize,
    served: u64,
    last_seen: Instant,
}

#[derive(Default)]
struct TrackerInner {
    live: AtomicUsize,
    peers: DashMap<SocketAddr, PeerStats>,
}

/// Counts live tunneled tasks overall and per peer connection.
#[derive(Clone, Default)]
pub struct ConnectionTracker {
    inner: Arc<TrackerInner>,
}

/// Held for the lifetime of one tunneled call.
pub struct TaskGuard {
    tracker: ConnectionTracker,
    peer: Option<SocketAddr>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&self, peer: Option<SocketAddr>) -> TaskGuard {
        let live = self.inner.live.fetch_add(1, Ordering::SeqCst) + 1;
        gauge!("tunnel_live_tasks").set(live as f64);

        if let Some(addr) = peer {
            let mut stats = self.inner.peers.entry(addr).or_insert(PeerStats {
                in_flight: 0,
                served: 0,
                last_seen: Instant::now(),
            });
            stats.in_flight += 1;
            stats.last_seen = Instant::now();
        }

        TaskGuard {
            tracker: self.clone(),
            peer,
        }
    }

    fn leave(&self, peer: Option<SocketAddr>) {
        let live = self.inner.live.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        gauge!("tunnel_live_tasks").set(live as f64);

        if let Some(addr) = peer
            && let Some(mut stats) = self.inner.peers.get_mut(&addr)
        {
            stats.in_flight = stats.in_flight.saturating_sub(1);
            stats.served += 1;
            stats.last_seen = Instant::now();
        }
    }

    pub fn live_tasks(&self) -> usize {
        self.inner.live.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self, peer: &SocketAddr) -> usize {
        self.inner
            .peers
            .get(peer)
            .map(|stats| stats.in_flight)
            .unwrap_or(0)
    }

    /// Peer connections currently tracked.
    pub fn connections(&self) -> usize {
        self.inner.peers.len()
    }

    /// Drop peers with nothing in flight that were last seen more than
    /// `idle` ago. Returns how many were pruned.
    pub fn sweep(&self, idle: Duration) -> usize {
        let before = self.inner.peers.len();
        self.inner
            .peers
            .retain(|_, stats| stats.in_flight > 0 || stats.last_seen.elapsed() < idle);
        let pruned = before.saturating_sub(self.inner.peers.len());
        if pruned > 0 {
            tracing::debug!(pruned, remaining = self.inner.peers.len(), "Swept idle tunnel peers");
        }
        pruned
    }

    /// Sweep every `every` until `shutdown` fires.
    pub fn spawn_sweeper(
        &self,
        every: Duration,
        idle: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let tracker = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        tracker.sweep(idle);
                    }
                }
            }
        })
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.tracker.leave(self.peer);
    }
}
