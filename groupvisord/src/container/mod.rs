//! Worker sandboxing and supervision.

pub mod command;
pub mod mounts;
pub mod runner;
pub mod security;
pub mod snapshots;

/// Every worker container name starts with this; orphan cleanup relies on it.
pub const CONTAINER_NAME_PREFIX: &str = "groupvisor-";

pub use runner::{ContainerSupervisor, OutputCallback, PreparedRun, SupervisorConfig};
pub use security::MountValidator;
