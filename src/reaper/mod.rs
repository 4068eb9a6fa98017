//! Expiry sweeper for abandoned containers.
//!
//! Test suites that crash or lose connectivity leave containers behind; the
//! reaper periodically deletes every container whose last activity is older
//! than the configured maximum. It goes through the exact same delete path
//! callers use, so workloads, tunnels and port allocations are all cleaned
//! up together. Like every long-lived task in this crate it is owned by a
//! stop signal.

use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::backend::{Backend, BackendResult};
use crate::config::ReaperConfig;
use crate::container::{Container, ContainerRegistry};

/// The delete contract the sweeper needs from the engine.
///
/// Deleting a container with no live workload must succeed; the sweeper
/// retries nothing and relies on idempotence instead.
pub trait ContainerDeleter: Send + Sync {
    /// Remove the container's workload, tunnels and port allocations.
    fn delete_container(
        &self,
        tainr: &Container,
    ) -> impl std::future::Future<Output = BackendResult<()>> + Send;
}

impl ContainerDeleter for Backend {
    fn delete_container(
        &self,
        tainr: &Container,
    ) -> impl std::future::Future<Output = BackendResult<()>> + Send {
        Backend::delete_container(self, tainr)
    }
}

/// Periodic sweeper over the container registry.
pub struct Reaper<B = Backend> {
    backend: B,
    registry: Arc<ContainerRegistry>,
    config: ReaperConfig,
}

impl<B: ContainerDeleter + 'static> Reaper<B> {
    /// Create a sweeper over the given registry and delete path.
    pub fn new(backend: B, registry: Arc<ContainerRegistry>, config: ReaperConfig) -> Self {
        Reaper {
            backend,
            registry,
            config,
        }
    }

    /// Delete every container idle longer than the configured maximum.
    ///
    /// A failed delete leaves the container registered so the next sweep
    /// retries it.
    pub async fn sweep(&self) {
        for tainr in self.registry.list() {
            let idle = tainr.idle();
            let expired = idle
                .to_std()
                .map(|d| d >= self.config.keep_max())
                .unwrap_or(false);
            if !expired {
                continue;
            }

            info!("Reaping container {} (idle {})", tainr.short_id(), idle);
            match self.backend.delete_container(&tainr).await {
                Ok(()) => self.registry.remove(&tainr.id),
                Err(e) => {
                    warn!("Failed to reap container {}: {}", tainr.short_id(), e);
                }
            }
        }
    }

    /// Sweep at the configured interval until the stop signal fires.
    pub async fn run(self, mut stop: watch::Receiver<bool>) {
        // tokio panics on a zero interval; clamp misconfigured values.
        let period = self.config.interval().max(std::time::Duration::from_millis(100));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of an interval fires immediately; skip it so a
        // freshly started engine does not sweep before anyone could act.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep().await,
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Reaper stopped");
    }

    /// Run the sweeper as a background task.
    pub fn spawn(self, stop: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run(stop))
    }
}
