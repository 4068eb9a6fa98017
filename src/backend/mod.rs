//! Orchestration backend: containers as Kubernetes deployments.
//!
//! The [`Backend`] is the engine instance shared by every request handler.
//! It owns the only pieces of mutable state the engine needs:
//!
//! - the local port allocation table (collision-free `random_port`)
//! - a per-container runtime record holding the stop signal shared by the
//!   readiness watch and the forwarding tunnels, plus the last asynchronous
//!   failure so a status query can surface what a start call never reports
//!
//! Everything else (workload handles, labels, selectors) is recomputed
//! deterministically from the container on every call.

mod error;
mod ioproxy;
mod logs;
mod naming;

pub mod deploy;
pub mod portforward;

pub use error::{BackendError, BackendResult};
pub use ioproxy::{FrameWriter, StreamType};
pub use naming::{to_kubernetes_key, to_kubernetes_name, to_kubernetes_value};
pub use portforward::PortAllocator;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use kube::api::DeleteParams;
use kube::{Api, Client};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::container::Container;

/// Status snapshot of a container, derived from live pod state.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerState {
    /// Whether a matching pod is running and ready.
    pub running: bool,
    /// Coarse lifecycle phase: `created`, `starting` or `running`.
    pub status: String,
    /// Health indicator: `none`, `starting` or `healthy`.
    pub health: String,
    /// Most recent asynchronous failure (readiness watch, tunnels), if any.
    ///
    /// Start calls return before networking comes up; this field is how a
    /// caller eventually learns that it never did.
    pub last_event: Option<String>,
}

/// The orchestration engine.
///
/// Cheap to clone; clones share the same allocation table and runtime state.
#[derive(Clone)]
pub struct Backend {
    client: Client,
    namespace: String,
    init_image: Option<String>,
    ready_poll_interval: Duration,
    ready_deadline: Duration,
    ports: PortAllocator,
    state: StateTable,
}

impl Backend {
    /// Create an engine instance from an existing cluster client.
    pub fn new(client: Client, config: &EngineConfig) -> Self {
        Backend {
            client,
            namespace: config.namespace.clone(),
            init_image: config.init_image.clone(),
            ready_poll_interval: config.ready_poll_interval(),
            ready_deadline: config.ready_deadline(),
            ports: PortAllocator::new(),
            state: StateTable::default(),
        }
    }

    /// Create an engine instance by inferring cluster connectivity from the
    /// environment (in-cluster service account or local kubeconfig), applying
    /// the configured per-call request budget.
    pub async fn connect(config: &EngineConfig) -> BackendResult<Self> {
        let mut cluster = kube::Config::infer()
            .await
            .map_err(kube::Error::InferConfig)?;
        cluster.connect_timeout = Some(config.request_timeout());
        cluster.read_timeout = Some(config.request_timeout());
        let client = Client::try_from(cluster)?;
        Ok(Backend::new(client, config))
    }

    /// Namespace all workloads live in.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Configured init-container image, if any.
    ///
    /// Reserved configuration surface; no engine code path exercises it yet.
    pub fn init_image(&self) -> Option<&str> {
        self.init_image.as_deref()
    }

    /// Query the container's live status from the cluster.
    pub async fn container_status(&self, tainr: &Container) -> BackendResult<ContainerState> {
        let pods = self.list_pods(tainr).await?;
        let last_event = self.state.last_event(&tainr.id);

        let state = if pods.is_empty() {
            ContainerState {
                running: false,
                status: "created".to_string(),
                health: "none".to_string(),
                last_event,
            }
        } else if pods.iter().any(deploy::pod_is_ready) {
            ContainerState {
                running: true,
                status: "running".to_string(),
                health: "healthy".to_string(),
                last_event,
            }
        } else {
            ContainerState {
                running: false,
                status: "starting".to_string(),
                health: "starting".to_string(),
                last_event,
            }
        };
        Ok(state)
    }

    /// Delete the container's workload and release every engine resource it
    /// holds: the background watch, open tunnels and allocated local ports.
    ///
    /// Idempotent: deleting a container with no live workload is a success.
    pub async fn delete_container(&self, tainr: &Container) -> BackendResult<()> {
        // Fire the stop signal first so the readiness watch and every tunnel
        // unblock before the workload disappears under them, then wait for
        // the tasks to wind down: a tunnel's listener must be closed before
        // its local port goes back to the allocator.
        if let Some((stop, tasks)) = self.state.remove(&tainr.id) {
            let _ = stop.send(true);
            for task in tasks {
                let _ = task.await;
            }
            debug!("Stopped background tasks for container {}", tainr.short_id());
        }

        let result = match self
            .deployments()
            .delete(&deploy::kubernetes_name(tainr), &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                let err = BackendError::from(e);
                if err.is_gone() {
                    Ok(())
                } else {
                    Err(err)
                }
            }
        };

        // Local resources are reclaimed even when the cluster call failed.
        let released = tainr.clear_mapped_ports();
        if !released.is_empty() {
            debug!(
                "Released {} local ports for container {}",
                released.len(),
                tainr.short_id()
            );
        }
        self.ports.release(released);

        if result.is_ok() {
            info!("Deleted container {}", tainr.short_id());
        }
        result
    }

    pub(crate) fn deployments(&self) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    pub(crate) fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    pub(crate) fn allocator(&self) -> &PortAllocator {
        &self.ports
    }

    pub(crate) fn runtime_state(&self) -> &StateTable {
        &self.state
    }
}

/// Per-container runtime record: stop signal, the background tasks owned by
/// that signal, and the last asynchronous failure.
#[derive(Debug)]
struct RuntimeState {
    stop: watch::Sender<bool>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
    last_event: Option<String>,
}

impl Default for RuntimeState {
    fn default() -> Self {
        let (stop, _) = watch::channel(false);
        RuntimeState {
            stop,
            tasks: Vec::new(),
            last_event: None,
        }
    }
}

/// Table of per-container runtime records, keyed by container ID.
///
/// This is the coupling point between delete and the long-lived tasks a
/// start spawns: the readiness watch and every tunnel subscribe to the
/// container's stop signal, and delete fires it exactly once.
#[derive(Debug, Clone, Default)]
pub(crate) struct StateTable {
    inner: Arc<Mutex<HashMap<String, RuntimeState>>>,
}

impl StateTable {
    /// Subscribe to the container's stop signal, creating the record if this
    /// is the first subscriber.
    pub(crate) fn stop_signal(&self, id: &str) -> watch::Receiver<bool> {
        let mut table = self.lock();
        table.entry(id.to_string()).or_default().stop.subscribe()
    }

    /// Register a background task under the container's record so delete can
    /// wait for it.
    ///
    /// If the record is already gone the container was deleted while the
    /// task was being spawned; it is aborted rather than left to run
    /// unowned.
    pub(crate) fn track_task(&self, id: &str, task: tokio::task::JoinHandle<()>) {
        let mut table = self.lock();
        match table.get_mut(id) {
            Some(state) => state.tasks.push(task),
            None => task.abort(),
        }
    }

    /// Record an asynchronous failure for later status queries.
    ///
    /// Recording against a removed record is dropped: delete is final, and a
    /// straggling task must not repopulate the table.
    pub(crate) fn record_event(&self, id: &str, event: impl Into<String>) {
        let mut table = self.lock();
        if let Some(state) = table.get_mut(id) {
            state.last_event = Some(event.into());
        }
    }

    /// Most recent recorded failure for the container.
    pub(crate) fn last_event(&self, id: &str) -> Option<String> {
        self.lock().get(id).and_then(|s| s.last_event.clone())
    }

    /// Drop the container's record, returning its stop sender and tracked
    /// tasks so the caller can fire the signal and wait them out.
    pub(crate) fn remove(&self, id: &str) -> Option<(watch::Sender<bool>, Vec<tokio::task::JoinHandle<()>>)> {
        self.lock().remove(id).map(|s| (s.stop, s.tasks))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, RuntimeState>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
