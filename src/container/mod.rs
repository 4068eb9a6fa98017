//! Container entity and in-memory registry.
//!
//! A [`Container`] is the abstract description the engine translates into a
//! cluster workload: identity, image, command, environment, labels and
//! exposed ports. The engine treats every field as read-only except the
//! mapped-ports table, which it fills in once networking comes up.
//!
//! The [`ContainerRegistry`] is the minimal storage the engine contract
//! needs: create/load/remove plus the `list` the expiry reaper sweeps over.
//! Durable persistence belongs to the embedding API layer, not this crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use uuid::Uuid;

/// Number of leading ID characters forming the short ID.
const SHORT_ID_LEN: usize = 12;

/// Caller-supplied description of a container to create.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ContainerSpec {
    /// Human-readable container name (may be empty).
    #[serde(default)]
    pub name: String,
    /// Image reference to run.
    pub image: String,
    /// Command arguments, in order.
    #[serde(default)]
    pub cmd: Vec<String>,
    /// Environment as ordered name/value pairs.
    #[serde(default)]
    pub env: Vec<(String, String)>,
    /// User labels; keys are unique.
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Container-side TCP ports to expose.
    #[serde(default)]
    pub exposed_ports: Vec<u16>,
}

/// A container known to the engine.
///
/// Shared as `Arc<Container>` between request handlers, background watches
/// and the reaper. Interior mutability is limited to the mapped-ports table
/// and the last-activity marker.
#[derive(Debug)]
pub struct Container {
    /// Full 64-character hex identity.
    pub id: String,
    /// Human-readable name (may be empty).
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Command arguments, in order.
    pub cmd: Vec<String>,
    /// Environment as ordered name/value pairs.
    pub env: Vec<(String, String)>,
    /// User labels.
    pub labels: HashMap<String, String>,
    /// Exposed container-side TCP ports.
    pub exposed_ports: Vec<u16>,
    /// Container port -> allocated local port, filled by the engine.
    mapped_ports: RwLock<HashMap<u16, u16>>,
    /// Creation time.
    created: DateTime<Utc>,
    /// Last time a caller touched this container; the reaper's age marker.
    last_activity: RwLock<DateTime<Utc>>,
}

impl Container {
    fn new(spec: ContainerSpec) -> Self {
        let now = Utc::now();
        Container {
            id: generate_id(),
            name: spec.name,
            image: spec.image,
            cmd: spec.cmd,
            env: spec.env,
            labels: spec.labels,
            exposed_ports: spec.exposed_ports,
            mapped_ports: RwLock::new(HashMap::new()),
            created: now,
            last_activity: RwLock::new(now),
        }
    }

    /// First 12 characters of the ID, used in user-facing messages.
    pub fn short_id(&self) -> &str {
        &self.id[..SHORT_ID_LEN.min(self.id.len())]
    }

    /// Record a local port allocated for a container port.
    pub fn map_port(&self, container_port: u16, local_port: u16) {
        let mut ports = lock_write(&self.mapped_ports);
        ports.insert(container_port, local_port);
    }

    /// Snapshot of the container-port -> local-port table.
    pub fn mapped_ports(&self) -> HashMap<u16, u16> {
        lock_read(&self.mapped_ports).clone()
    }

    /// Clear the mapping table, returning the local ports that were held.
    ///
    /// Called on delete so the allocator can take the ports back.
    pub fn clear_mapped_ports(&self) -> Vec<u16> {
        let mut ports = lock_write(&self.mapped_ports);
        ports.drain().map(|(_, local)| local).collect()
    }

    /// When the container record was created.
    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    /// Mark the container as active now.
    pub fn touch(&self) {
        *lock_write(&self.last_activity) = Utc::now();
    }

    /// How long ago the container was last touched.
    pub fn idle(&self) -> chrono::Duration {
        Utc::now() - *lock_read(&self.last_activity)
    }
}

/// In-memory container store.
#[derive(Debug, Default)]
pub struct ContainerRegistry {
    containers: Mutex<HashMap<String, Arc<Container>>>,
}

impl ContainerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a container from a spec and register it.
    pub fn create(&self, spec: ContainerSpec) -> Arc<Container> {
        let tainr = Arc::new(Container::new(spec));
        let mut containers = lock_map(&self.containers);
        containers.insert(tainr.id.clone(), tainr.clone());
        tainr
    }

    /// Look up a container by full or short ID.
    pub fn load(&self, id: &str) -> Option<Arc<Container>> {
        let containers = lock_map(&self.containers);
        if let Some(tainr) = containers.get(id) {
            return Some(tainr.clone());
        }
        // Docker-style prefix match for short IDs.
        containers
            .values()
            .find(|t| t.id.starts_with(id) && !id.is_empty())
            .cloned()
    }

    /// Remove a container record. Removing an unknown ID is a no-op.
    pub fn remove(&self, id: &str) {
        let mut containers = lock_map(&self.containers);
        containers.remove(id);
    }

    /// All registered containers, in no particular order.
    pub fn list(&self) -> Vec<Arc<Container>> {
        lock_map(&self.containers).values().cloned().collect()
    }
}

/// Generate a 64-character hex container ID.
fn generate_id() -> String {
    format!(
        "{}{}",
        Uuid::new_v4().simple(),
        Uuid::new_v4().simple()
    )
}

// Lock helpers that recover from poisoning: the guarded data is a plain map,
// so a panicked writer cannot leave it logically inconsistent.
fn lock_read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn lock_write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

fn lock_map<T>(lock: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> ContainerSpec {
        ContainerSpec {
            name: name.to_string(),
            image: "nginx:latest".to_string(),
            ..ContainerSpec::default()
        }
    }

    #[test]
    fn test_generated_ids_are_hex_and_unique() {
        let registry = ContainerRegistry::new();
        let a = registry.create(spec("a"));
        let b = registry.create(spec("b"));
        assert_eq!(a.id.len(), 64);
        assert!(a.id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a.id, b.id);
        assert_eq!(a.short_id().len(), 12);
        assert!(a.id.starts_with(a.short_id()));
    }

    #[test]
    fn test_load_by_full_and_short_id() {
        let registry = ContainerRegistry::new();
        let tainr = registry.create(spec("web"));

        assert!(registry.load(&tainr.id).is_some());
        assert!(registry.load(tainr.short_id()).is_some());
        assert!(registry.load("ffffffffffff").is_none());
        assert!(registry.load("").is_none());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let registry = ContainerRegistry::new();
        let tainr = registry.create(spec("web"));
        registry.remove(&tainr.id);
        registry.remove(&tainr.id);
        assert!(registry.load(&tainr.id).is_none());
        assert!(registry.list().is_empty());
    }

    #[test]
    fn test_mapped_ports_roundtrip() {
        let registry = ContainerRegistry::new();
        let tainr = registry.create(spec("web"));

        tainr.map_port(80, 32001);
        tainr.map_port(443, 32002);
        assert_eq!(tainr.mapped_ports().get(&80), Some(&32001));

        let mut released = tainr.clear_mapped_ports();
        released.sort_unstable();
        assert_eq!(released, vec![32001, 32002]);
        assert!(tainr.mapped_ports().is_empty());
    }

    #[test]
    fn test_touch_resets_idle() {
        let registry = ContainerRegistry::new();
        let tainr = registry.create(spec("web"));
        tainr.touch();
        assert!(tainr.idle() < chrono::Duration::seconds(5));
    }
}
