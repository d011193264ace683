//! The message-check callback GroupQueue invokes when it is a group's turn.
//!
//! Flow:
//! 1. Look up the group by chat id
//! 2. Fetch messages since the group's agent cursor
//! 3. Check the trigger for non-main groups
//! 4. Advance the cursor, remembering the old one
//! 5. Run the worker, streaming each result to the chat
//! 6. Roll the cursor back on failure, unless the user already got output

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use groupvisor_core::persistence::now_timestamp;
use groupvisor_core::{StoredMessage, WorkerInput, WorkerOutput, WorkerStatus};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::container::OutputCallback;
use crate::message_loop::{format_messages, has_trigger, needs_trigger, strip_internal_blocks};
use crate::orchestrator::OrchestratorContext;
use crate::queue::{GroupQueue, ProcessHandle, ProcessMessagesFn};

/// Asks the group's worker to close after a stretch of silence. Every
/// [`reset`](IdleTimer::reset) restarts the countdown.
pub struct IdleTimer {
    queue: GroupQueue,
    group: String,
    after: Duration,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl IdleTimer {
    pub fn new(queue: GroupQueue, group: &str, after: Duration) -> Arc<Self> {
        Arc::new(Self {
            queue,
            group: group.to_string(),
            after,
            pending: Mutex::new(None),
        })
    }

    pub fn reset(&self) {
        let queue = self.queue.clone();
        let group = self.group.clone();
        let after = self.after;
        let next = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            debug!(group = %group, "idle timeout, closing worker");
            queue.request_idle_close(&group).await;
        });
        let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(previous) = pending.replace(next) {
            previous.abort();
        }
    }

    pub fn cancel(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(handle) = pending.take() {
            handle.abort();
        }
    }
}

impl Drop for IdleTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

pub fn build_process_messages_fn(ctx: Arc<OrchestratorContext>) -> ProcessMessagesFn {
    Arc::new(move |chat_id: String| {
        let ctx = ctx.clone();
        async move {
            match process_group_messages(&ctx, &chat_id).await {
                Ok(success) => success,
                Err(e) => {
                    error!(chat_id = %chat_id, err = %e, "processing group messages failed");
                    false
                }
            }
        }
        .boxed()
    })
}

/// Core logic for one message check. `Ok(false)` asks the queue to retry.
pub async fn process_group_messages(
    ctx: &Arc<OrchestratorContext>,
    chat_id: &str,
) -> anyhow::Result<bool> {
    let Some(group) = ctx.groups.read().await.get(chat_id).cloned() else {
        debug!(chat_id, "message check for unregistered chat, skipping");
        return Ok(true);
    };
    let is_main = ctx.is_main(&group);
    let assistant = ctx.config.orchestrator.assistant_name.clone();

    let previous_cursor = ctx.cursors.lock().await.agent_since(chat_id);
    let pending = ctx
        .store
        .get_messages_since(chat_id, &previous_cursor, &assistant)?;
    let Some(newest) = pending.last().map(|m| m.timestamp.clone()) else {
        return Ok(true);
    };

    if needs_trigger(&group, is_main) && !has_trigger(&group, &assistant, &pending) {
        return Ok(true);
    }

    let prompt = format_messages(&pending);
    ctx.cursors
        .lock()
        .await
        .set_agent(ctx.store.as_ref(), chat_id, &newest);

    info!(group = %group.name, message_count = pending.len(), "processing messages");

    ctx.write_snapshots(&group.folder, is_main).await;
    let session_id = ctx.sessions.read().await.get(&group.folder).cloned();
    let input = WorkerInput {
        prompt,
        session_id,
        group_folder: group.folder.clone(),
        chat_id: chat_id.to_string(),
        is_main,
        is_scheduled_task: false,
    };

    let prepared = ctx.supervisor.prepare(&group, is_main);
    ctx.queue
        .register_process(
            chat_id,
            ProcessHandle {
                container_name: prepared.container_name.clone(),
                group_folder: group.folder.clone(),
            },
        )
        .await;

    let idle = IdleTimer::new(
        ctx.queue.clone(),
        chat_id,
        Duration::from_millis(ctx.config.orchestrator.idle_timeout_ms),
    );
    let output_sent = Arc::new(AtomicBool::new(false));
    let on_output = stream_to_chat(ctx, chat_id, &group.folder, idle.clone(), output_sent.clone());

    if let Err(e) = ctx.channel.set_typing(chat_id, true).await {
        debug!(chat_id, err = %e, "typing indicator failed");
    }
    let output = ctx.supervisor.execute(&prepared, &input, Some(on_output)).await;
    idle.cancel();
    if let Err(e) = ctx.channel.set_typing(chat_id, false).await {
        debug!(chat_id, err = %e, "typing indicator failed");
    }

    if let Some(sid) = &output.new_session_id {
        ctx.record_session(&group.folder, sid).await;
    }

    if output.is_error() {
        if output_sent.load(Ordering::SeqCst) {
            warn!(group = %group.name, "worker error after output was sent, keeping cursor");
            return Ok(true);
        }
        ctx.cursors
            .lock()
            .await
            .set_agent(ctx.store.as_ref(), chat_id, &previous_cursor);
        warn!(
            group = %group.name,
            err = output.error.as_deref().unwrap_or("unknown"),
            "worker error, rolled back cursor for retry"
        );
        return Ok(false);
    }
    Ok(true)
}

/// Per-envelope handling: session tracking, delivery, idle bookkeeping.
fn stream_to_chat(
    ctx: &Arc<OrchestratorContext>,
    chat_id: &str,
    group_folder: &str,
    idle: Arc<IdleTimer>,
    output_sent: Arc<AtomicBool>,
) -> OutputCallback {
    let ctx = ctx.clone();
    let chat_id = chat_id.to_string();
    let group_folder = group_folder.to_string();
    Arc::new(move |output: WorkerOutput| {
        let ctx = ctx.clone();
        let chat_id = chat_id.clone();
        let group_folder = group_folder.clone();
        let idle = idle.clone();
        let output_sent = output_sent.clone();
        async move {
            if let Some(sid) = &output.new_session_id {
                ctx.record_session(&group_folder, sid).await;
            }

            if let Some(raw) = &output.result {
                let text = strip_internal_blocks(raw);
                if !text.is_empty() {
                    match ctx.channel.send_message(&chat_id, &text).await {
                        Ok(()) => output_sent.store(true, Ordering::SeqCst),
                        Err(e) => error!(chat_id = %chat_id, err = %e, "failed to deliver worker output"),
                    }
                    store_reply(&ctx, &chat_id, &text);
                }
                idle.reset();
            }

            if output.status == WorkerStatus::Success {
                ctx.queue.notify_idle(&chat_id).await;
            }
        }
        .boxed()
    })
}

/// Keep the assistant's reply in the transcript. Flagged as bot output so
/// it never comes back as input.
fn store_reply(ctx: &OrchestratorContext, chat_id: &str, text: &str) {
    let timestamp = now_timestamp();
    let reply = StoredMessage {
        id: format!("bot-{}-{}", chat_id, timestamp),
        chat_id: chat_id.to_string(),
        sender: "bot".to_string(),
        sender_name: ctx.config.orchestrator.assistant_name.clone(),
        content: text.to_string(),
        timestamp,
        is_from_me: true,
        is_bot_message: true,
    };
    if let Err(e) = ctx.store.store_message(&reply) {
        warn!(chat_id, err = %e, "failed to store assistant reply");
    }
}
