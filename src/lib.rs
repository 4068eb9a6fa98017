//! kubedock-engine: container lifecycle on top of a Kubernetes cluster
//!
//! This crate implements the orchestration backend of a docker-style container
//! API: callers describe an abstract container (image, command, environment,
//! exposed ports) and the engine runs it as a single-replica Deployment on a
//! remote cluster. The engine owns everything that makes the illusion work:
//!
//! - **Identity**: a deterministic label scheme (`app`, `kubedock`, `tier`)
//!   that lets the pods backing a container be found again on every call
//! - **Networking**: collision-free local port allocation and per-port
//!   forwarding tunnels, so callers reach container ports as if local
//! - **Logs**: streaming pod output to a caller-supplied sink with
//!   follow/cancel semantics that never block the cluster connection forever
//! - **Teardown**: an idempotent delete path that stops background watches,
//!   closes tunnels and releases ports, shared with the expiry [`reaper`]
//!
//! The HTTP wire layer that speaks the container API, and the persistence of
//! container records, are deliberately out of scope; this crate exposes the
//! engine contract they consume.

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod backend;
pub mod config;
pub mod container;
pub mod reaper;

pub use backend::{Backend, BackendError, BackendResult, ContainerState};
pub use config::EngineConfig;
pub use container::{Container, ContainerRegistry, ContainerSpec};
