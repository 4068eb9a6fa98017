//! Local port allocation and forwarding tunnels.
//!
//! The allocator hands out collision-free local ports from an explicitly
//! owned, lock-guarded table; two engine instances in one process never
//! share port state. Tunnels bind the allocated local port and relay each
//! accepted connection to the matching port on the container's first pod
//! over the cluster's port-forward subresource. Every tunnel subscribes to
//! its container's stop signal and is failure-isolated from its siblings.

use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use rand::Rng;
use std::collections::HashSet;
use std::io;
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info};

use super::{Backend, BackendResult, StateTable};
use crate::container::Container;

/// Lowest local port the allocator will issue.
const MIN_PORT: u16 = 1024;

/// Allocation table for local forwarding ports.
///
/// Cheap to clone; clones share the same table.
#[derive(Debug, Clone, Default)]
pub struct PortAllocator {
    live: Arc<Mutex<HashSet<u16>>>,
}

impl PortAllocator {
    /// Create an empty allocator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Draw a fresh local port in `[1024, 65535]`.
    ///
    /// The port is marked live before this returns, so concurrent callers
    /// never receive the same port. Redraws on collision.
    pub fn random_port(&self) -> u16 {
        let mut table = self.lock();
        let mut rng = rand::thread_rng();
        loop {
            let port: u16 = rng.gen_range(MIN_PORT..=u16::MAX);
            if table.insert(port) {
                return port;
            }
        }
    }

    /// Return ports to the table so they can be issued again.
    ///
    /// Releasing a port that was never issued is a no-op.
    pub fn release(&self, ports: impl IntoIterator<Item = u16>) {
        let mut table = self.lock();
        for port in ports {
            table.remove(&port);
        }
    }

    /// Whether a port is currently marked live.
    pub fn is_live(&self, port: u16) -> bool {
        self.lock().contains(&port)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<u16>> {
        self.live.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Backend {
    /// Open one forwarding tunnel per mapped port of the container.
    ///
    /// Tunnels target the first located pod. Each tunnel runs as its own
    /// task with its own lifetime: one tunnel failing never tears down
    /// another. Pod lookup failure is the only error returned here; tunnel
    /// failures after that are logged and recorded for status queries.
    pub async fn port_forward(&self, tainr: &Arc<Container>) -> BackendResult<()> {
        let pod_name = self.first_pod_name(tainr).await?;
        let stop_rx = self.runtime_state().stop_signal(&tainr.id);

        for (pod_port, local_port) in tainr.mapped_ports() {
            let tunnel = Tunnel {
                pods: self.pods(),
                state: self.runtime_state().clone(),
                container_id: tainr.id.clone(),
                pod_name: pod_name.clone(),
                pod_port,
                local_port,
            };
            let task = tokio::spawn(tunnel.run(stop_rx.clone()));
            self.runtime_state().track_task(&tainr.id, task);
        }
        Ok(())
    }
}

/// One forwarding tunnel: local port on one side, a pod port on the other.
struct Tunnel {
    pods: Api<Pod>,
    state: StateTable,
    container_id: String,
    pod_name: String,
    pod_port: u16,
    local_port: u16,
}

impl Tunnel {
    /// Accept local connections and relay them until the stop signal fires.
    async fn run(self, mut stop_rx: watch::Receiver<bool>) {
        let listener = match TcpListener::bind(("127.0.0.1", self.local_port)).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(
                    "Tunnel cannot bind 127.0.0.1:{} for pod {}: {}",
                    self.local_port, self.pod_name, e
                );
                self.state.record_event(
                    &self.container_id,
                    format!("tunnel bind failed on port {}: {}", self.local_port, e),
                );
                return;
            }
        };

        info!(
            "Forwarding 127.0.0.1:{} -> {}:{}",
            self.local_port, self.pod_name, self.pod_port
        );

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((client, peer)) => {
                            debug!(
                                "Tunnel connection from {} to {}:{}",
                                peer, self.pod_name, self.pod_port
                            );
                            let pods = self.pods.clone();
                            let pod_name = self.pod_name.clone();
                            let pod_port = self.pod_port;
                            tokio::spawn(async move {
                                relay_connection(pods, pod_name, pod_port, client).await;
                            });
                        }
                        Err(e) => {
                            debug!("Tunnel accept error on port {}: {}", self.local_port, e);
                        }
                    }
                }
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        info!(
                            "Tunnel 127.0.0.1:{} -> {}:{} shutting down",
                            self.local_port, self.pod_name, self.pod_port
                        );
                        break;
                    }
                }
            }
        }
    }
}

/// Relay a single local connection through the pod's port-forward stream.
async fn relay_connection(pods: Api<Pod>, pod_name: String, pod_port: u16, mut client: TcpStream) {
    let mut forwarder = match pods.portforward(&pod_name, &[pod_port]).await {
        Ok(forwarder) => forwarder,
        Err(e) => {
            debug!("Port-forward to {}:{} failed: {}", pod_name, pod_port, e);
            return;
        }
    };
    let Some(mut upstream) = forwarder.take_stream(pod_port) else {
        debug!("Port-forward to {} did not open port {}", pod_name, pod_port);
        return;
    };

    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
        Ok(_) => {}
        Err(e)
            if matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ) => {}
        Err(e) => {
            debug!("Tunnel relay to {}:{} ended: {}", pod_name, pod_port, e);
        }
    }

    drop(upstream);
    if let Err(e) = forwarder.join().await {
        debug!("Port-forward session to {} closed with error: {}", pod_name, e);
    }
}
