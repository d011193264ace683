//! Mailbox protocol shared between workers and the orchestrator.
//!
//! Each group owns `{data}/ipc/{folder}/` with three drop directories:
//! - **messages**: outbound chat sends requested by the worker
//! - **tasks**: every other control request
//! - **input**: follow-up prompts and the `_close` sentinel flowing to the worker
//!
//! Files are written to a `.tmp` path and renamed into place so a poller
//! never sees a partial document.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Sentinel file a worker watches for in `input/` to wind down.
pub const CLOSE_SENTINEL: &str = "_close";

/// A control request read from a group's mailbox.
///
/// Every field a worker may omit is optional so that a request with missing
/// fields is dropped by the handler (logged) rather than quarantined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcRequest {
    #[serde(rename = "message", alias = "send_message")]
    SendMessage {
        #[serde(rename = "chatId", alias = "chatJid", alias = "targetChatId")]
        chat_id: Option<String>,
        text: Option<String>,
    },
    ScheduleTask {
        prompt: Option<String>,
        schedule_type: Option<String>,
        schedule_value: Option<String>,
        context_mode: Option<String>,
        #[serde(rename = "targetChatId", alias = "targetJid")]
        target_chat_id: Option<String>,
    },
    PauseTask {
        #[serde(rename = "taskId")]
        task_id: Option<String>,
    },
    ResumeTask {
        #[serde(rename = "taskId")]
        task_id: Option<String>,
    },
    CancelTask {
        #[serde(rename = "taskId")]
        task_id: Option<String>,
    },
    RegisterGroup {
        #[serde(rename = "chatId")]
        chat_id: Option<String>,
        name: Option<String>,
        folder: Option<String>,
        trigger: Option<String>,
        #[serde(rename = "requiresTrigger")]
        requires_trigger: Option<bool>,
        #[serde(rename = "containerConfig")]
        container_config: Option<serde_json::Value>,
    },
    RefreshGroups,
    #[serde(other)]
    Unknown,
}

impl IpcRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            IpcRequest::SendMessage { .. } => "message",
            IpcRequest::ScheduleTask { .. } => "schedule_task",
            IpcRequest::PauseTask { .. } => "pause_task",
            IpcRequest::ResumeTask { .. } => "resume_task",
            IpcRequest::CancelTask { .. } => "cancel_task",
            IpcRequest::RegisterGroup { .. } => "register_group",
            IpcRequest::RefreshGroups => "refresh_groups",
            IpcRequest::Unknown => "unknown",
        }
    }
}

/// Context for authorization decisions, derived from the mailbox directory name.
#[derive(Debug, Clone)]
pub struct IpcGroupContext {
    /// Group folder name (e.g., "main", "team-eng").
    pub group_folder: String,
    /// Whether this is the main group (has elevated privileges).
    pub is_main: bool,
}

impl IpcGroupContext {
    pub fn new(group_folder: impl Into<String>, main_group_name: &str) -> Self {
        let group_folder = group_folder.into();
        let is_main = group_folder == main_group_name;
        Self {
            group_folder,
            is_main,
        }
    }

    /// Main may act on any folder; everyone else only on their own.
    pub fn may_act_on(&self, target_folder: &str) -> bool {
        self.is_main || self.group_folder == target_folder
    }
}

/// Follow-up prompt delivered to a running worker through `input/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowupMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}

impl FollowupMessage {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            kind: "message".to_string(),
            text: text.into(),
        }
    }
}

pub fn group_ipc_dir(ipc_base: &Path, group_folder: &str) -> PathBuf {
    ipc_base.join(group_folder)
}

/// `{millis}-{8 hex}.json`: sorts by creation time, unique across writers.
pub fn mailbox_file_name() -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{millis}-{}.json", &suffix[..8])
}

/// Write bytes to `dir/name` through a temp file and rename.
pub fn write_atomic(dir: &Path, name: &str, contents: &[u8]) -> anyhow::Result<PathBuf> {
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create mailbox dir {}", dir.display()))?;
    let final_path = dir.join(name);
    let temp_path = dir.join(format!("{name}.tmp"));
    fs::write(&temp_path, contents)
        .with_context(|| format!("failed to write {}", temp_path.display()))?;
    fs::rename(&temp_path, &final_path)
        .with_context(|| format!("failed to rename into {}", final_path.display()))?;
    Ok(final_path)
}

/// Serialize `value` into a freshly named mailbox file under `dir`.
pub fn write_mailbox_file<T: Serialize>(dir: &Path, value: &T) -> anyhow::Result<PathBuf> {
    let body = serde_json::to_vec(value).context("failed to serialize mailbox file")?;
    write_atomic(dir, &mailbox_file_name(), &body)
}

/// Drop a follow-up prompt into a running worker's `input/` directory.
pub fn write_followup(group_ipc_dir: &Path, text: &str) -> anyhow::Result<PathBuf> {
    write_mailbox_file(&group_ipc_dir.join("input"), &FollowupMessage::new(text))
}

/// Ask the worker to finish its current turn and exit.
pub fn write_close_sentinel(group_ipc_dir: &Path) -> anyhow::Result<()> {
    let input_dir = group_ipc_dir.join("input");
    fs::create_dir_all(&input_dir)
        .with_context(|| format!("failed to create {}", input_dir.display()))?;
    fs::write(input_dir.join(CLOSE_SENTINEL), b"")
        .with_context(|| format!("failed to write close sentinel in {}", input_dir.display()))?;
    Ok(())
}
