pub mod api;
pub mod channel;
pub mod container;
pub mod ipc;
pub mod lifecycle;
pub mod message_loop;
pub mod orchestrator;
pub mod process_group;
pub mod queue;
pub mod scheduler;
pub mod scheduler_wiring;

pub use orchestrator::{Orchestrator, OrchestratorContext};
pub use queue::GroupQueue;
