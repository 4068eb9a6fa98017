//! Deployment translation and pod location.
//!
//! Translates an abstract container into a single-replica Deployment and
//! resolves the pods backing it. The identity scheme is deliberately
//! redundant: the same match-label set is written to the deployment
//! selector, the pod template and the pod query, all produced by one
//! constructor so consistency holds by construction.

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container as PodContainer, ContainerPort, EnvVar, Pod, PodSpec, PodTemplateSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::api::{ListParams, PostParams};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::naming::{to_kubernetes_key, to_kubernetes_name, to_kubernetes_value};
use super::{Backend, BackendError, BackendResult};
use crate::container::Container;

/// Fixed name of the workload container inside the pod template.
///
/// Contractual: log retrieval always targets this container, regardless of
/// any sidecar that may be added to the template later.
pub const MAIN_CONTAINER: &str = "main";

/// Label carrying the container ID; the pod query selects on it.
const ID_LABEL: &str = "kubedock";

/// Marker label applied to every workload this engine creates.
const TIER_LABEL: (&str, &str) = ("tier", "kubedock");

/// Deterministic cluster resource name for a container.
///
/// Pure and idempotent: derived from the container name, falling back to
/// the ID when the name is empty. Always cluster-legal and at most 63
/// characters.
pub fn kubernetes_name(tainr: &Container) -> String {
    if tainr.name.is_empty() {
        to_kubernetes_name(&tainr.id)
    } else {
        to_kubernetes_name(&tainr.name)
    }
}

/// The match-label set identifying every object belonging to a container.
pub fn match_labels(tainr: &Container) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), kubernetes_name(tainr)),
        (ID_LABEL.to_string(), tainr.id.clone()),
        (TIER_LABEL.0.to_string(), TIER_LABEL.1.to_string()),
    ])
}

/// Label selector string used to query the pods backing a container.
///
/// Pure; no cluster access.
pub fn pods_label_selector(tainr: &Container) -> String {
    format!("{}={}", ID_LABEL, tainr.id)
}

/// Whether a pod is running with all its containers ready.
pub(crate) fn pod_is_ready(pod: &Pod) -> bool {
    let Some(status) = pod.status.as_ref() else {
        return false;
    };
    if status.phase.as_deref() != Some("Running") {
        return false;
    }
    status
        .container_statuses
        .as_ref()
        .map(|statuses| !statuses.is_empty() && statuses.iter().all(|c| c.ready))
        .unwrap_or(false)
}

/// Build the Deployment object for a container.
pub(crate) fn build_deployment(namespace: &str, tainr: &Container) -> Deployment {
    let labels = match_labels(tainr);
    Deployment {
        metadata: ObjectMeta {
            namespace: Some(namespace.to_string()),
            name: Some(kubernetes_name(tainr)),
            labels: Some(deployment_labels(tainr)),
            ..ObjectMeta::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..LabelSelector::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..ObjectMeta::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![PodContainer {
                        name: MAIN_CONTAINER.to_string(),
                        image: Some(tainr.image.clone()),
                        args: Some(tainr.cmd.clone()),
                        env: Some(env_vars(tainr)),
                        ports: Some(container_ports(tainr)),
                        ..PodContainer::default()
                    }],
                    ..PodSpec::default()
                }),
            },
            ..DeploymentSpec::default()
        }),
        ..Deployment::default()
    }
}

/// Workload metadata labels: the user's labels sanitized to cluster-legal
/// form, with the identity labels layered on top so they always win.
fn deployment_labels(tainr: &Container) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    for (key, value) in &tainr.labels {
        let key = to_kubernetes_key(key);
        if key.is_empty() {
            continue;
        }
        labels.insert(key, to_kubernetes_value(value));
    }
    labels.extend(match_labels(tainr));
    labels
}

/// One named, typed port entry per exposed container port.
fn container_ports(tainr: &Container) -> Vec<ContainerPort> {
    tainr
        .exposed_ports
        .iter()
        .map(|&port| ContainerPort {
            container_port: i32::from(port),
            name: Some(format!("kd-tcp-{}", port)),
            protocol: Some("TCP".to_string()),
            ..ContainerPort::default()
        })
        .collect()
}

fn env_vars(tainr: &Container) -> Vec<EnvVar> {
    tainr
        .env
        .iter()
        .map(|(name, value)| EnvVar {
            name: name.clone(),
            value: Some(value.clone()),
            ..EnvVar::default()
        })
        .collect()
}

impl Backend {
    /// Start a container: submit its workload, then asynchronously wire up
    /// networking once the first pod is ready.
    ///
    /// Only submission failures are returned; a success means the cluster
    /// accepted the workload, not that it is reachable yet. The spawned
    /// watch polls readiness at the configured interval up to the configured
    /// deadline, then allocates a local port per exposed container port and
    /// opens forwarding tunnels. Watch failures are logged and recorded for
    /// `container_status`, never surfaced to this caller. Deleting the
    /// container cancels the watch through its stop signal.
    pub async fn start_container(&self, tainr: &Arc<Container>) -> BackendResult<()> {
        let dep = build_deployment(&self.namespace, tainr);
        self.deployments()
            .create(&PostParams::default(), &dep)
            .await
            .map_err(BackendError::from_submission)?;
        info!(
            "Submitted deployment {} for container {}",
            kubernetes_name(tainr),
            tainr.short_id()
        );

        let stop_rx = self.runtime_state().stop_signal(&tainr.id);
        let engine = self.clone();
        let watched = Arc::clone(tainr);
        let watch_task = tokio::spawn(async move {
            engine.await_ready_and_forward(watched, stop_rx).await;
        });
        self.runtime_state().track_task(&tainr.id, watch_task);

        Ok(())
    }

    /// All pods backing the container.
    ///
    /// Zero matches is an explicit [`BackendError::NotFound`] naming the
    /// container's short ID, not an empty success.
    pub async fn get_pods(&self, tainr: &Container) -> BackendResult<Vec<Pod>> {
        let pods = self.list_pods(tainr).await?;
        if pods.is_empty() {
            return Err(BackendError::NotFound {
                short_id: tainr.short_id().to_string(),
            });
        }
        Ok(pods)
    }

    /// List matching pods without the zero-match error.
    pub(crate) async fn list_pods(&self, tainr: &Container) -> BackendResult<Vec<Pod>> {
        let params = ListParams::default().labels(&pods_label_selector(tainr));
        Ok(self.pods().list(&params).await?.items)
    }

    /// Name of the first pod backing the container.
    ///
    /// Pod ordering is whatever the cluster API returns; with the workload
    /// pinned to one replica a second match only appears transiently during
    /// pod replacement, so it is logged rather than treated as an error.
    pub(crate) async fn first_pod_name(&self, tainr: &Container) -> BackendResult<String> {
        let pods = self.get_pods(tainr).await?;
        if pods.len() > 1 {
            warn!(
                "Container {} has {} matching pods; targeting the first",
                tainr.short_id(),
                pods.len()
            );
        }
        pods.into_iter()
            .next()
            .and_then(|pod| pod.metadata.name)
            .ok_or_else(|| BackendError::NotFound {
                short_id: tainr.short_id().to_string(),
            })
    }

    async fn is_container_ready(&self, tainr: &Container) -> BackendResult<bool> {
        let pods = self.list_pods(tainr).await?;
        Ok(pods.iter().any(pod_is_ready))
    }

    /// Background watch spawned by a successful start.
    ///
    /// Terminates on readiness (after opening tunnels), on the deadline, on
    /// an unrecoverable error, or when the container is deleted out from
    /// under it. A cluster 404 is a normal termination signal here.
    async fn await_ready_and_forward(
        &self,
        tainr: Arc<Container>,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        let deadline = tokio::time::Instant::now() + self.ready_deadline;
        loop {
            match self.is_container_ready(&tainr).await {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) if e.is_gone() => {
                    debug!(
                        "Container {} deleted while waiting for readiness",
                        tainr.short_id()
                    );
                    return;
                }
                Err(e) => {
                    warn!(
                        "Readiness check for container {} failed: {}",
                        tainr.short_id(),
                        e
                    );
                    self.runtime_state()
                        .record_event(&tainr.id, format!("readiness check failed: {}", e));
                    return;
                }
            }

            if tokio::time::Instant::now() >= deadline {
                warn!(
                    "Container {} not ready within deadline",
                    tainr.short_id()
                );
                self.runtime_state()
                    .record_event(&tainr.id, "readiness deadline exceeded");
                return;
            }

            debug!("Waiting for container {} to be ready", tainr.short_id());
            tokio::select! {
                _ = tokio::time::sleep(self.ready_poll_interval) => {}
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        debug!("Readiness watch for {} cancelled", tainr.short_id());
                        return;
                    }
                }
            }
        }

        for &port in &tainr.exposed_ports {
            tainr.map_port(port, self.allocator().random_port());
        }

        if let Err(e) = self.port_forward(&tainr).await {
            warn!(
                "Port forwarding for container {} failed: {}",
                tainr.short_id(),
                e
            );
            self.runtime_state()
                .record_event(&tainr.id, format!("port forwarding failed: {}", e));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{ContainerRegistry, ContainerSpec};
    use std::collections::HashMap;

    fn container() -> Arc<Container> {
        let registry = ContainerRegistry::new();
        registry.create(ContainerSpec {
            name: "My Service!".to_string(),
            image: "registry.example.com/svc:1.2".to_string(),
            cmd: vec!["serve".to_string(), "--port=8080".to_string()],
            env: vec![("MODE".to_string(), "test".to_string())],
            labels: HashMap::from([
                ("app.kubernetes.io/name".to_string(), "/svc".to_string()),
                ("__".to_string(), "dropped".to_string()),
            ]),
            exposed_ports: vec![8080, 9090],
        })
    }

    #[test]
    fn test_kubernetes_name_is_pure_and_bounded() {
        let tainr = container();
        let name = kubernetes_name(&tainr);
        assert_eq!(name, "MyService");
        assert_eq!(kubernetes_name(&tainr), name);
        assert!(name.len() <= 63);
    }

    #[test]
    fn test_kubernetes_name_falls_back_to_id() {
        let registry = ContainerRegistry::new();
        let tainr = registry.create(ContainerSpec {
            image: "x".to_string(),
            ..ContainerSpec::default()
        });
        assert_eq!(kubernetes_name(&tainr), to_kubernetes_name(&tainr.id));
    }

    #[test]
    fn test_selector_and_template_labels_agree() {
        let tainr = container();
        let dep = build_deployment("unit", &tainr);
        let spec = dep.spec.expect("deployment has a spec");

        let selector = spec.selector.match_labels.expect("selector labels");
        let template = spec
            .template
            .metadata
            .expect("template metadata")
            .labels
            .expect("template labels");

        assert_eq!(selector, template);
        assert_eq!(selector, match_labels(&tainr));
        assert_eq!(selector.get("app").map(String::as_str), Some("MyService"));
        assert_eq!(selector.get("kubedock"), Some(&tainr.id));
        assert_eq!(selector.get("tier").map(String::as_str), Some("kubedock"));

        // The pod query uses the same identity label.
        assert_eq!(
            pods_label_selector(&tainr),
            format!("kubedock={}", tainr.id)
        );
    }

    #[test]
    fn test_single_replica_main_container() {
        let tainr = container();
        let dep = build_deployment("unit", &tainr);
        let spec = dep.spec.expect("spec");
        assert_eq!(spec.replicas, Some(1));

        let pod_spec = spec.template.spec.expect("pod spec");
        assert_eq!(pod_spec.containers.len(), 1);

        let main = &pod_spec.containers[0];
        assert_eq!(main.name, MAIN_CONTAINER);
        assert_eq!(main.image.as_deref(), Some("registry.example.com/svc:1.2"));
        assert_eq!(
            main.args.as_deref(),
            Some(&["serve".to_string(), "--port=8080".to_string()][..])
        );

        let env = main.env.as_ref().expect("env");
        assert_eq!(env[0].name, "MODE");
        assert_eq!(env[0].value.as_deref(), Some("test"));
    }

    #[test]
    fn test_port_entries_named_and_typed() {
        let tainr = container();
        let dep = build_deployment("unit", &tainr);
        let ports = dep
            .spec
            .and_then(|s| s.template.spec)
            .and_then(|s| s.containers[0].ports.clone())
            .expect("ports");

        assert_eq!(ports.len(), 2);
        assert_eq!(ports[0].container_port, 8080);
        assert_eq!(ports[0].name.as_deref(), Some("kd-tcp-8080"));
        assert_eq!(ports[0].protocol.as_deref(), Some("TCP"));
        assert_eq!(ports[1].name.as_deref(), Some("kd-tcp-9090"));
    }

    #[test]
    fn test_metadata_labels_sanitized_identity_wins() {
        let tainr = container();
        let dep = build_deployment("unit", &tainr);
        let labels = dep.metadata.labels.expect("metadata labels");

        // User label survives with key intact and value cleaned of slashes.
        assert_eq!(
            labels.get("app.kubernetes.io/name").map(String::as_str),
            Some("svc")
        );
        // Labels whose keys sanitize to nothing are dropped.
        assert!(!labels.contains_key(""));
        // Identity labels are present even if a user label collides.
        assert_eq!(labels.get("tier").map(String::as_str), Some("kubedock"));
        assert_eq!(labels.get("kubedock"), Some(&tainr.id));
    }

    #[test]
    fn test_pod_readiness_requires_running_and_ready() {
        use k8s_openapi::api::core::v1::{ContainerStatus, PodStatus};

        let mut pod = Pod::default();
        assert!(!pod_is_ready(&pod));

        pod.status = Some(PodStatus {
            phase: Some("Pending".to_string()),
            ..PodStatus::default()
        });
        assert!(!pod_is_ready(&pod));

        let ready_status = |ready| ContainerStatus {
            ready,
            ..ContainerStatus::default()
        };

        pod.status = Some(PodStatus {
            phase: Some("Running".to_string()),
            container_statuses: Some(vec![ready_status(false)]),
            ..PodStatus::default()
        });
        assert!(!pod_is_ready(&pod));

        pod.status = Some(PodStatus {
            phase: Some("Running".to_string()),
            container_statuses: Some(vec![ready_status(true)]),
            ..PodStatus::default()
        });
        assert!(pod_is_ready(&pod));
    }
}
