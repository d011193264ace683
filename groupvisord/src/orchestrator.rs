//! The orchestrator context and the three loops it owns.
//!
//! [`OrchestratorContext`] holds everything a unit of work touches: config,
//! store, queue, channel, supervisor, the registered-group map, the session
//! cache and the message cursors. [`Orchestrator`] wraps it with the
//! message, mailbox and scheduler loop guards and their start/stop.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::FutureExt;
use futures::future::BoxFuture;
use groupvisor_core::{Group, GroupvisorConfig, IpcGroupContext, Store};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::channel::Channel;
use crate::container::snapshots::{write_groups_snapshot, write_tasks_snapshot};
use crate::container::{ContainerSupervisor, MountValidator, SupervisorConfig};
use crate::ipc::{IpcDeps, IpcWatcher, IpcWatcherConfig, is_valid_group_folder};
use crate::lifecycle::{LoopGuard, LoopState};
use crate::message_loop::{Cursors, MessageLoop, recover_pending_messages};
use crate::process_group::build_process_messages_fn;
use crate::queue::{GroupQueue, RetryPolicy};
use crate::scheduler::TaskScheduler;
use crate::scheduler_wiring::build_dispatch_fn;

pub struct OrchestratorContext {
    pub config: GroupvisorConfig,
    pub store: Arc<dyn Store>,
    pub queue: GroupQueue,
    pub channel: Arc<dyn Channel>,
    pub supervisor: ContainerSupervisor,
    /// Registered groups keyed by chat id.
    pub groups: RwLock<HashMap<String, Group>>,
    /// Worker session ids keyed by group folder.
    pub sessions: RwLock<HashMap<String, String>>,
    pub cursors: Mutex<Cursors>,
}

impl OrchestratorContext {
    pub fn new(
        config: GroupvisorConfig,
        store: Arc<dyn Store>,
        channel: Arc<dyn Channel>,
        validator: Arc<MountValidator>,
    ) -> Arc<Self> {
        let queue = GroupQueue::new(
            config.orchestrator.max_concurrent_workers,
            config.ipc_dir(),
            RetryPolicy {
                max_retries: config.orchestrator.max_retries,
                base_delay: Duration::from_millis(config.orchestrator.retry_base_delay_ms),
            },
        );
        let supervisor = ContainerSupervisor::new(SupervisorConfig::from_config(&config), validator);
        Arc::new(Self {
            config,
            store,
            queue,
            channel,
            supervisor,
            groups: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            cursors: Mutex::new(Cursors::default()),
        })
    }

    /// Load groups, sessions and cursors from the store.
    pub async fn load_state(&self) -> anyhow::Result<()> {
        let groups = self
            .store
            .get_all_groups()
            .context("failed to load registered groups")?;
        let sessions = self
            .store
            .get_all_sessions()
            .context("failed to load sessions")?;
        let cursors = Cursors::load(self.store.as_ref());
        info!(
            groups = groups.len(),
            sessions = sessions.len(),
            "orchestrator state loaded"
        );
        *self.groups.write().await = groups;
        *self.sessions.write().await = sessions;
        *self.cursors.lock().await = cursors;
        Ok(())
    }

    pub fn is_main(&self, group: &Group) -> bool {
        group.folder == self.config.orchestrator.main_group_folder
    }

    pub async fn group_by_folder(&self, folder: &str) -> Option<Group> {
        self.groups
            .read()
            .await
            .values()
            .find(|g| g.folder == folder)
            .cloned()
    }

    pub async fn record_session(&self, group_folder: &str, session_id: &str) {
        self.sessions
            .write()
            .await
            .insert(group_folder.to_string(), session_id.to_string());
        if let Err(e) = self.store.set_session(group_folder, session_id) {
            warn!(group = group_folder, err = %e, "failed to persist session");
        }
    }

    /// Persist, add to the live map and create the group's logs folder.
    pub async fn register_group(&self, group: Group) -> anyhow::Result<()> {
        if !is_valid_group_folder(&group.folder) {
            anyhow::bail!("invalid group folder {:?}", group.folder);
        }
        self.store
            .set_group(&group)
            .with_context(|| format!("failed to store group {}", group.chat_id))?;
        let logs_dir = self.config.groups_dir().join(&group.folder).join("logs");
        fs::create_dir_all(&logs_dir)
            .with_context(|| format!("failed to create {}", logs_dir.display()))?;
        info!(chat_id = %group.chat_id, folder = %group.folder, name = %group.name, "group registered");
        self.groups.write().await.insert(group.chat_id.clone(), group);
        Ok(())
    }

    /// Rewrite `current_tasks.json` and `available_groups.json` for a group.
    pub async fn write_snapshots(&self, group_folder: &str, is_main: bool) {
        let ipc_dir = self.config.ipc_dir();
        match self.store.get_all_jobs() {
            Ok(jobs) => {
                if let Err(e) = write_tasks_snapshot(&ipc_dir, group_folder, is_main, &jobs) {
                    warn!(group = group_folder, err = %e, "failed to write tasks snapshot");
                }
            }
            Err(e) => warn!(group = group_folder, err = %e, "failed to load jobs for snapshot"),
        }
        self.write_groups_snapshot(group_folder, is_main).await;
    }

    async fn write_groups_snapshot(&self, group_folder: &str, is_main: bool) {
        let chats = match self.store.get_all_chats() {
            Ok(chats) => chats,
            Err(e) => {
                warn!(group = group_folder, err = %e, "failed to load chats for snapshot");
                return;
            }
        };
        let registered: HashSet<String> = self.groups.read().await.keys().cloned().collect();
        if let Err(e) =
            write_groups_snapshot(&self.config.ipc_dir(), group_folder, is_main, &chats, &registered)
        {
            warn!(group = group_folder, err = %e, "failed to write groups snapshot");
        }
    }

    /// Tell a chat its messages went unanswered.
    async fn notify_dropped(&self, chat_id: &str) {
        let text = "Sorry, I couldn't process your last messages. Please try again.";
        if let Err(e) = self.channel.send_message(chat_id, text).await {
            warn!(chat_id, err = %e, "failed to send dropped-messages notice");
        }
    }
}

impl IpcDeps for OrchestratorContext {
    fn send_message<'a>(
        &'a self,
        chat_id: &'a str,
        text: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        self.channel.send_message(chat_id, text)
    }

    fn registered_groups(&self) -> BoxFuture<'_, HashMap<String, Group>> {
        async move { self.groups.read().await.clone() }.boxed()
    }

    fn register_group(&self, group: Group) -> BoxFuture<'_, anyhow::Result<()>> {
        OrchestratorContext::register_group(self, group).boxed()
    }

    fn refresh_groups<'a>(
        &'a self,
        ctx: &'a IpcGroupContext,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        async move {
            // Chat metadata arrives with ingress; re-read the live registry
            // so newly registered groups are flagged.
            let groups = self
                .store
                .get_all_groups()
                .context("failed to reload registered groups")?;
            *self.groups.write().await = groups;
            self.write_groups_snapshot(&ctx.group_folder, ctx.is_main).await;
            Ok(())
        }
        .boxed()
    }
}

/// Loop states, as reported over HTTP.
#[derive(Debug, Clone, serde::Serialize)]
pub struct LoopStates {
    pub message_loop: LoopState,
    pub ipc_watcher: LoopState,
    pub scheduler: LoopState,
}

pub struct Orchestrator {
    ctx: Arc<OrchestratorContext>,
    message_guard: Arc<LoopGuard>,
    ipc_guard: Arc<LoopGuard>,
    scheduler_guard: Arc<LoopGuard>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(ctx: Arc<OrchestratorContext>) -> Self {
        Self {
            ctx,
            message_guard: LoopGuard::new("message_loop"),
            ipc_guard: LoopGuard::new("ipc_watcher"),
            scheduler_guard: LoopGuard::new("scheduler"),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn context(&self) -> &Arc<OrchestratorContext> {
        &self.ctx
    }

    pub fn loop_states(&self) -> LoopStates {
        LoopStates {
            message_loop: self.message_guard.state(),
            ipc_watcher: self.ipc_guard.state(),
            scheduler: self.scheduler_guard.state(),
        }
    }

    /// Load state, wire the queue and spawn the loops. A second call while
    /// running does nothing; a call after [`stop`](Self::stop) restarts.
    pub async fn start(&self) -> anyhow::Result<()> {
        let Some(message_run) = self.message_guard.try_start() else {
            debug!("orchestrator already started");
            return Ok(());
        };
        let ctx = &self.ctx;
        ctx.queue.reopen().await;
        ctx.load_state().await?;

        ctx.queue
            .set_process_messages_fn(build_process_messages_fn(ctx.clone()))
            .await;
        if ctx.config.orchestrator.notify_on_dropped_messages {
            let notify_ctx = ctx.clone();
            ctx.queue
                .set_on_dropped(Arc::new(move |chat_id: String| {
                    let ctx = notify_ctx.clone();
                    tokio::spawn(async move { ctx.notify_dropped(&chat_id).await });
                }))
                .await;
        }

        let recovered = recover_pending_messages(ctx).await;
        if !recovered.is_empty() {
            info!(groups = ?recovered, "recovered pending message checks");
        }

        let mut handles = self.handles.lock().await;

        let message_loop = MessageLoop::new(ctx.clone());
        handles.push(tokio::spawn(async move { message_loop.run(message_run).await }));

        if let Some(ipc_run) = self.ipc_guard.try_start() {
            let watcher = IpcWatcher::new(
                IpcWatcherConfig {
                    ipc_base_dir: ctx.config.ipc_dir(),
                    poll_interval: Duration::from_millis(ctx.config.ipc.poll_interval_ms),
                    main_group_folder: ctx.config.orchestrator.main_group_folder.clone(),
                    timezone: ctx.config.scheduler.tz(),
                },
                ctx.store.clone(),
                ctx.clone(),
            );
            handles.push(tokio::spawn(async move { watcher.run(ipc_run).await }));
        }

        if ctx.config.scheduler.enabled {
            if let Some(scheduler_run) = self.scheduler_guard.try_start() {
                let scheduler = TaskScheduler::new(
                    ctx.store.clone(),
                    Duration::from_millis(ctx.config.scheduler.poll_interval_ms),
                    build_dispatch_fn(ctx.clone()),
                );
                handles.push(tokio::spawn(async move { scheduler.run(scheduler_run).await }));
            }
        } else {
            info!("scheduler disabled, skipping loop");
        }

        info!(
            assistant = %ctx.config.orchestrator.assistant_name,
            max_concurrent = ctx.config.orchestrator.max_concurrent_workers,
            channel = ctx.channel.name(),
            "orchestrator started"
        );
        Ok(())
    }

    /// Stop every loop, then let the queue detach what is still running.
    pub async fn stop(&self) {
        self.message_guard.stop();
        self.ipc_guard.stop();
        self.scheduler_guard.stop();

        let handles: Vec<JoinHandle<()>> = self.handles.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!(err = %e, "loop task ended abnormally");
            }
        }

        let grace = Duration::from_millis(self.ctx.config.orchestrator.shutdown_grace_ms);
        self.ctx.queue.shutdown(grace).await;
        info!("orchestrator stopped");
    }
}
