//! Cluster-free contract tests over the public API.

use kubedock_engine::backend::deploy::{
    self, kubernetes_name, match_labels, pods_label_selector,
};
use kubedock_engine::backend::{
    to_kubernetes_key, to_kubernetes_name, to_kubernetes_value, FrameWriter, PortAllocator,
    StreamType,
};
use kubedock_engine::{ContainerRegistry, ContainerSpec, EngineConfig};
use std::collections::HashSet;

#[test]
fn sanitizers_agree_with_contract_vectors() {
    assert_eq!(to_kubernetes_key("__-abc"), "abc");
    assert_eq!(to_kubernetes_value("__-abc"), "abc");
    assert_eq!(to_kubernetes_name("__-abc"), "abc");

    assert_eq!(
        to_kubernetes_key("app.kubernetes.io/name"),
        "app.kubernetes.io/name"
    );
    assert_eq!(
        to_kubernetes_value("app.kubernetes.io/name"),
        "app.kubernetes.ioname"
    );
    assert_eq!(to_kubernetes_name("app.kubernetes.io/name"), "appkubernetesioname");

    assert_eq!(to_kubernetes_key(""), "");
    assert_eq!(to_kubernetes_value(""), "");
    assert_eq!(to_kubernetes_name(""), "undef");
}

#[test]
fn identity_labels_are_consistent_everywhere() {
    let registry = ContainerRegistry::new();
    let tainr = registry.create(ContainerSpec {
        name: "it-db-1".to_string(),
        image: "postgres:16".to_string(),
        exposed_ports: vec![5432],
        ..ContainerSpec::default()
    });

    let labels = match_labels(&tainr);
    assert_eq!(labels.get("app").map(String::as_str), Some("itdb1"));
    assert_eq!(labels.get("kubedock"), Some(&tainr.id));
    assert_eq!(labels.get("tier").map(String::as_str), Some("kubedock"));

    // The selector string queries the same identity label the workload and
    // pod template carry.
    let selector = pods_label_selector(&tainr);
    assert_eq!(selector, format!("kubedock={}", tainr.id));
    assert_eq!(kubernetes_name(&tainr), "itdb1");
    assert_eq!(deploy::MAIN_CONTAINER, "main");
}

#[test]
fn fresh_engine_issues_one_hundred_distinct_ports() {
    let allocator = PortAllocator::new();
    let mut seen = HashSet::new();
    for _ in 0..100 {
        let port = allocator.random_port();
        assert!(port >= 1024);
        assert!(seen.insert(port));
    }
}

#[test]
fn registry_lifecycle() {
    let registry = ContainerRegistry::new();
    let tainr = registry.create(ContainerSpec {
        name: "web".to_string(),
        image: "nginx".to_string(),
        ..ContainerSpec::default()
    });

    let loaded = registry.load(tainr.short_id()).expect("short-id lookup");
    assert_eq!(loaded.id, tainr.id);

    registry.remove(&tainr.id);
    assert!(registry.load(&tainr.id).is_none());
}

#[tokio::test]
async fn framing_preserves_payload_bytes() {
    let mut writer = FrameWriter::new(Vec::new(), StreamType::Stdout);
    let payload = b"2024-05-01 server listening on :8080\n";
    writer.write_frame(payload).await.expect("frame written");
    writer.flush().await.expect("flush");

    let bytes = writer.into_inner();
    assert_eq!(&bytes[8..], payload);
    assert_eq!(&bytes[4..8], &(payload.len() as u32).to_be_bytes());
}

#[test]
fn default_config_is_usable() {
    let config = EngineConfig::default();
    assert_eq!(config.namespace, "default");
    assert!(config.ready_deadline() > config.ready_poll_interval());
    assert!(config.reaper.keep_max().as_secs() > 0);
}
