use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;

use lariat_client::SharedClientFactory;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

const PROBE_INTERVAL: Duration = Duration::from_secs(15);
const HEALTHY_INTERVAL: Duration = Duration::from_secs(60);

const STATE_UNKNOWN: u8 = 0;
const STATE_HEALTHY: u8 = 1;
const STATE_UNHEALTHY: u8 = 2;

pub type HealthCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// Periodic API-server health probe gating informer starts.
///
/// While the cluster is unhealthy the probe loop holds the write side of the
/// gate, so [`HealthCheck::ensure_healthy`] blocks new starts until the
/// first successful probe.
pub struct HealthCheck {
    callback: Option<HealthCallback>,
    gate: RwLock<()>,
    state: AtomicU8,
    started: AtomicBool,
}

impl HealthCheck {
    pub fn new(callback: Option<HealthCallback>) -> Self {
        Self {
            callback,
            gate: RwLock::new(()),
            state: AtomicU8::new(STATE_UNKNOWN),
            started: AtomicBool::new(false),
        }
    }

    pub fn healthy(&self) -> bool {
        self.state.load(Ordering::SeqCst) != STATE_UNHEALTHY
    }

    /// Starts the probe loop. Repeated calls are no-ops.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken, factory: SharedClientFactory) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let health = self.clone();
        tokio::spawn(async move { health.run(cancel, factory).await });
    }

    /// Blocks while the probe loop is mid-recovery; a no-op before `start`.
    pub async fn ensure_healthy(&self, cancel: &CancellationToken) {
        if !self.started.load(Ordering::SeqCst) {
            return;
        }
        tokio::select! {
            _ = self.gate.read() => {}
            _ = cancel.cancelled() => {}
        }
    }

    async fn run(&self, cancel: CancellationToken, factory: SharedClientFactory) {
        loop {
            {
                let _guard = self.gate.write().await;
                if self.ping_until_good(&cancel, &factory).await {
                    return;
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(HEALTHY_INTERVAL) => {}
            }
        }
    }

    /// Probes until one success, reporting transitions. Returns true when
    /// cancelled.
    async fn ping_until_good(
        &self,
        cancel: &CancellationToken,
        factory: &SharedClientFactory,
    ) -> bool {
        loop {
            if cancel.is_cancelled() {
                return true;
            }
            if factory.is_healthy().await {
                self.report(true);
                return false;
            }
            self.report(false);
            tokio::select! {
                _ = cancel.cancelled() => return true,
                _ = tokio::time::sleep(PROBE_INTERVAL) => {}
            }
        }
    }

    fn report(&self, good: bool) {
        let next = if good { STATE_HEALTHY } else { STATE_UNHEALTHY };
        let previous = self.state.swap(next, Ordering::SeqCst);
        if previous == next {
            return;
        }
        if previous != STATE_UNKNOWN || !good {
            tracing::info!(healthy = good, "cluster health changed");
        }
        if let Some(callback) = &self.callback {
            callback(good);
        }
    }
}
