//! Read-only views written into a group's mailbox before each run.
//!
//! `current_tasks.json` lists the jobs the worker may inspect and
//! `available_groups.json` lists chats the main group could register.
//! Non-main groups only ever see their own jobs and no chats.

use std::collections::HashSet;
use std::path::Path;

use groupvisor_core::ipc::{group_ipc_dir, write_atomic};
use groupvisor_core::persistence::now_timestamp;
use groupvisor_core::{ChatInfo, ScheduledJob};
use serde::Serialize;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshotEntry<'a> {
    pub id: &'a str,
    pub group_folder: &'a str,
    pub prompt: &'a str,
    pub schedule_type: &'a str,
    pub schedule_value: &'a str,
    pub status: &'a str,
    pub next_run: Option<&'a str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailableGroup<'a> {
    pub chat_id: &'a str,
    pub name: &'a str,
    pub last_activity: &'a str,
    pub is_registered: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GroupsSnapshot<'a> {
    groups: Vec<AvailableGroup<'a>>,
    last_sync: String,
}

pub fn write_tasks_snapshot(
    ipc_base: &Path,
    group_folder: &str,
    is_main: bool,
    jobs: &[ScheduledJob],
) -> anyhow::Result<()> {
    let visible: Vec<TaskSnapshotEntry<'_>> = jobs
        .iter()
        .filter(|job| is_main || job.group_folder == group_folder)
        .map(|job| TaskSnapshotEntry {
            id: &job.id,
            group_folder: &job.group_folder,
            prompt: &job.prompt,
            schedule_type: job.schedule_type.as_str(),
            schedule_value: &job.schedule_value,
            status: job.status.as_str(),
            next_run: job.next_run.as_deref(),
        })
        .collect();
    let body = serde_json::to_vec_pretty(&visible)?;
    write_atomic(
        &group_ipc_dir(ipc_base, group_folder),
        "current_tasks.json",
        &body,
    )?;
    Ok(())
}

/// Group chats known to the store, flagged by registration. Empty for
/// anyone but main.
pub fn write_groups_snapshot(
    ipc_base: &Path,
    group_folder: &str,
    is_main: bool,
    chats: &[ChatInfo],
    registered_chat_ids: &HashSet<String>,
) -> anyhow::Result<()> {
    let groups = if is_main {
        chats
            .iter()
            .filter(|chat| chat.is_group)
            .map(|chat| AvailableGroup {
                chat_id: &chat.chat_id,
                name: &chat.name,
                last_activity: &chat.last_message_time,
                is_registered: registered_chat_ids.contains(&chat.chat_id),
            })
            .collect()
    } else {
        Vec::new()
    };
    let body = serde_json::to_vec_pretty(&GroupsSnapshot {
        groups,
        last_sync: now_timestamp(),
    })?;
    write_atomic(
        &group_ipc_dir(ipc_base, group_folder),
        "available_groups.json",
        &body,
    )?;
    Ok(())
}
