//! Mailbox watcher: the control plane workers use to reach the orchestrator.
//!
//! Polls `{ipc_base}/{folder}/messages/` and `{ipc_base}/{folder}/tasks/`,
//! handles every file oldest first, then deletes it. A file that does not
//! parse or whose handling fails is moved to `{ipc_base}/errors/` and never
//! retried.
//!
//! Authorization comes from the mailbox directory name, never from the file:
//! - main may act on any chat, job or group
//! - any other group may only touch its own folder's chat and jobs
//! - only main may register groups or refresh group metadata

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use chrono_tz::Tz;
use futures::future::BoxFuture;
use groupvisor_core::persistence::{format_timestamp, new_job_id, now_timestamp};
use groupvisor_core::{
    ContextMode, Group, IpcGroupContext, IpcRequest, JobStatus, JobUpdate, SandboxConfig, Schedule,
    ScheduledJob, Store,
};
use tracing::{debug, error, info, warn};

use crate::lifecycle::LoopRun;

/// What the watcher needs from the rest of the orchestrator.
pub trait IpcDeps: Send + Sync {
    fn send_message<'a>(&'a self, chat_id: &'a str, text: &'a str)
    -> BoxFuture<'a, anyhow::Result<()>>;

    /// Registered groups keyed by chat id.
    fn registered_groups(&self) -> BoxFuture<'_, HashMap<String, Group>>;

    fn register_group(&self, group: Group) -> BoxFuture<'_, anyhow::Result<()>>;

    /// Re-sync chat metadata and rewrite the requester's groups snapshot.
    fn refresh_groups<'a>(&'a self, ctx: &'a IpcGroupContext)
    -> BoxFuture<'a, anyhow::Result<()>>;
}

#[derive(Debug, Clone)]
pub struct IpcWatcherConfig {
    pub ipc_base_dir: PathBuf,
    pub poll_interval: Duration,
    pub main_group_folder: String,
    /// Timezone for cron and naive `once` values in `schedule_task`.
    pub timezone: Tz,
}

pub struct IpcWatcher {
    config: IpcWatcherConfig,
    store: Arc<dyn Store>,
    deps: Arc<dyn IpcDeps>,
}

impl IpcWatcher {
    pub fn new(config: IpcWatcherConfig, store: Arc<dyn Store>, deps: Arc<dyn IpcDeps>) -> Self {
        Self {
            config,
            store,
            deps,
        }
    }

    pub async fn run(&self, mut run: LoopRun) {
        if let Err(e) = fs::create_dir_all(&self.config.ipc_base_dir) {
            error!(dir = %self.config.ipc_base_dir.display(), err = %e, "failed to create mailbox root");
        }
        run.mark_running();
        info!(dir = %self.config.ipc_base_dir.display(), "mailbox watcher started");

        loop {
            self.poll_once().await;
            if !run.sleep(self.config.poll_interval).await {
                break;
            }
        }
        info!("mailbox watcher stopped");
    }

    /// One pass over every group's mailbox.
    pub async fn poll_once(&self) {
        let folders = match fs::read_dir(&self.config.ipc_base_dir) {
            Ok(entries) => {
                let mut folders: Vec<String> = entries
                    .flatten()
                    .filter(|entry| {
                        entry.file_type().is_ok_and(|ft| ft.is_dir()) && entry.file_name() != "errors"
                    })
                    .map(|entry| entry.file_name().to_string_lossy().into_owned())
                    .collect();
                folders.sort();
                folders
            }
            Err(err) => {
                debug!(err = %err, "mailbox root not readable");
                return;
            }
        };

        for folder in folders {
            let ctx = IpcGroupContext::new(&folder, &self.config.main_group_folder);
            let group_dir = self.config.ipc_base_dir.join(&folder);
            for sub in ["messages", "tasks"] {
                for file in read_json_files(&group_dir.join(sub)) {
                    self.process_file(&file, &ctx).await;
                }
            }
        }
    }

    async fn process_file(&self, path: &Path, ctx: &IpcGroupContext) {
        let request = match read_request(path) {
            Ok(request) => request,
            Err(err) => {
                error!(path = %path.display(), group = %ctx.group_folder, err = %err, "unreadable mailbox file");
                quarantine(&self.config.ipc_base_dir, path, &ctx.group_folder);
                return;
            }
        };

        match self.handle(request, ctx).await {
            Ok(()) => remove_file(path),
            Err(err) => {
                error!(path = %path.display(), group = %ctx.group_folder, err = %err, "mailbox request failed");
                quarantine(&self.config.ipc_base_dir, path, &ctx.group_folder);
            }
        }
    }

    /// Authorization denials and incomplete requests are logged and return
    /// `Ok`: the file is consumed without side effects.
    pub async fn handle(&self, request: IpcRequest, ctx: &IpcGroupContext) -> anyhow::Result<()> {
        let kind = request.kind();
        match request {
            IpcRequest::SendMessage {
                chat_id: Some(chat_id),
                text: Some(text),
            } => {
                let groups = self.deps.registered_groups().await;
                let target_folder = groups.get(&chat_id).map(|g| g.folder.as_str());
                if ctx.is_main || target_folder == Some(ctx.group_folder.as_str()) {
                    self.deps.send_message(&chat_id, &text).await?;
                    info!(chat_id = %chat_id, group = %ctx.group_folder, "mailbox message sent");
                } else {
                    warn!(chat_id = %chat_id, group = %ctx.group_folder, "unauthorized mailbox message blocked");
                }
            }

            IpcRequest::ScheduleTask {
                prompt: Some(prompt),
                schedule_type: Some(schedule_type),
                schedule_value: Some(schedule_value),
                context_mode,
                target_chat_id: Some(target_chat_id),
            } => {
                let groups = self.deps.registered_groups().await;
                let Some(target) = groups.get(&target_chat_id) else {
                    warn!(target_chat_id = %target_chat_id, group = %ctx.group_folder, "cannot schedule task: target group not registered");
                    return Ok(());
                };
                if !ctx.may_act_on(&target.folder) {
                    warn!(
                        target_folder = %target.folder,
                        group = %ctx.group_folder,
                        "unauthorized schedule_task attempt blocked"
                    );
                    return Ok(());
                }

                let schedule = match Schedule::parse_str(&schedule_type, &schedule_value, self.config.timezone) {
                    Ok(schedule) => schedule,
                    Err(err) => {
                        warn!(group = %ctx.group_folder, err = %err, "rejecting task with invalid schedule");
                        return Ok(());
                    }
                };
                let Some(next_run) = schedule.first_run(Utc::now()) else {
                    warn!(group = %ctx.group_folder, schedule_value = %schedule_value, "schedule never fires, task not created");
                    return Ok(());
                };

                let job = ScheduledJob {
                    id: new_job_id(),
                    group_folder: target.folder.clone(),
                    chat_id: target_chat_id,
                    prompt,
                    schedule_type: schedule_type.parse()?,
                    schedule_value,
                    context_mode: ContextMode::from_wire(context_mode.as_deref()),
                    next_run: Some(format_timestamp(next_run)),
                    last_run: None,
                    last_result: None,
                    status: JobStatus::Active,
                    created_at: now_timestamp(),
                };
                self.store.create_job(&job)?;
                info!(
                    task_id = %job.id,
                    group = %ctx.group_folder,
                    target_folder = %job.group_folder,
                    context_mode = job.context_mode.as_str(),
                    next_run = ?job.next_run,
                    "task created via mailbox"
                );
            }

            IpcRequest::PauseTask { task_id: Some(id) } => {
                self.change_job(&id, ctx, kind, |store, job| {
                    store
                        .update_job(&job.id, &JobUpdate::status(JobStatus::Paused))
                        .map(|()| true)
                })?;
            }
            IpcRequest::ResumeTask { task_id: Some(id) } => {
                self.change_job(&id, ctx, kind, |store, job| {
                    // Only a paused job with a pending run can become due again.
                    if job.status != JobStatus::Paused || job.next_run.is_none() {
                        warn!(task_id = %job.id, status = %job.status, "only paused tasks can be resumed");
                        return Ok(false);
                    }
                    store
                        .update_job(&job.id, &JobUpdate::status(JobStatus::Active))
                        .map(|()| true)
                })?;
            }
            IpcRequest::CancelTask { task_id: Some(id) } => {
                self.change_job(&id, ctx, kind, |store, job| {
                    store.delete_job(&job.id).map(|()| true)
                })?;
            }

            IpcRequest::RegisterGroup {
                chat_id,
                name,
                folder,
                trigger,
                requires_trigger,
                container_config,
            } => {
                if !ctx.is_main {
                    warn!(group = %ctx.group_folder, "unauthorized register_group attempt blocked");
                    return Ok(());
                }
                let (Some(chat_id), Some(name), Some(folder), Some(trigger)) =
                    (chat_id, name, folder, trigger)
                else {
                    warn!("register_group missing required fields, dropped");
                    return Ok(());
                };
                if !is_valid_group_folder(&folder) {
                    warn!(folder = %folder, "register_group with unsafe folder name, dropped");
                    return Ok(());
                }
                let container_config = container_config.and_then(|value| {
                    serde_json::from_value::<SandboxConfig>(value)
                        .map_err(|err| warn!(folder = %folder, err = %err, "ignoring malformed containerConfig"))
                        .ok()
                });

                self.deps
                    .register_group(Group {
                        chat_id,
                        name,
                        folder,
                        trigger,
                        added_at: now_timestamp(),
                        container_config,
                        requires_trigger,
                    })
                    .await?;
            }

            IpcRequest::RefreshGroups => {
                if !ctx.is_main {
                    warn!(group = %ctx.group_folder, "unauthorized refresh_groups attempt blocked");
                    return Ok(());
                }
                info!(group = %ctx.group_folder, "group metadata refresh requested");
                self.deps.refresh_groups(ctx).await?;
            }

            IpcRequest::Unknown => {
                warn!(group = %ctx.group_folder, "unknown mailbox request type, ignored");
            }

            _ => {
                warn!(group = %ctx.group_folder, kind, "mailbox request missing required fields, dropped");
            }
        }
        Ok(())
    }

    fn change_job<F>(&self, id: &str, ctx: &IpcGroupContext, kind: &str, apply: F) -> anyhow::Result<()>
    where
        F: FnOnce(&dyn Store, &ScheduledJob) -> groupvisor_core::persistence::StoreResult<bool>,
    {
        let Some(job) = self.store.get_job(id)? else {
            warn!(task_id = id, group = %ctx.group_folder, kind, "task not found");
            return Ok(());
        };
        if !ctx.may_act_on(&job.group_folder) {
            warn!(task_id = id, group = %ctx.group_folder, kind, "unauthorized task change blocked");
            return Ok(());
        }
        if apply(self.store.as_ref(), &job)? {
            info!(task_id = id, group = %ctx.group_folder, kind, "task updated via mailbox");
        }
        Ok(())
    }
}

/// Folder names become path components on the host.
pub fn is_valid_group_folder(folder: &str) -> bool {
    !folder.is_empty()
        && folder.len() <= 64
        && folder != "errors"
        && folder
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn read_request(path: &Path) -> anyhow::Result<IpcRequest> {
    let raw = fs::read(path)?;
    let value: serde_json::Value = serde_json::from_slice(&raw)?;
    Ok(serde_json::from_value(value)?)
}

/// `*.json` files in `dir`, oldest first by name.
fn read_json_files(dir: &Path) -> Vec<PathBuf> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };
    let mut files: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort();
    files
}

fn quarantine(ipc_base: &Path, file_path: &Path, group_folder: &str) {
    let error_dir = ipc_base.join("errors");
    if let Err(err) = fs::create_dir_all(&error_dir) {
        error!(dir = %error_dir.display(), err = %err, "failed to create quarantine dir");
    }
    let Some(filename) = file_path.file_name() else {
        return;
    };
    let dest = error_dir.join(format!("{group_folder}-{}", filename.to_string_lossy()));
    if let Err(err) = fs::rename(file_path, &dest) {
        error!(path = %file_path.display(), err = %err, "failed to quarantine mailbox file");
        remove_file(file_path);
    }
}

fn remove_file(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        debug!(path = %path.display(), err = %err, "failed to remove processed mailbox file");
    }
}
