pub mod config;
pub mod container;
pub mod ipc;
pub mod persistence;
pub mod schedule;

pub use config::{GroupvisorConfig, load_config};
pub use container::{
    BlockEvent, OUTPUT_END_MARKER, OUTPUT_START_MARKER, OutputBlockParser, VolumeMount,
    WorkerInput, WorkerOutput, WorkerStatus,
};
pub use ipc::{IpcGroupContext, IpcRequest};
pub use persistence::{
    AdditionalMount, ChatInfo, ContextMode, Group, GroupRegistry, JobRunLog, JobStatus, JobStore,
    JobUpdate, MessageStore, SandboxConfig, ScheduledJob, SessionStore, SqliteStore, Store,
    StoreError, StoredMessage,
};
pub use schedule::{Schedule, ScheduleError, ScheduleKind};
