//! Message poll loop: picks up stored chat messages and routes them to workers.
//!
//! Dual-cursor design:
//! - `last_timestamp` (global): advances when any new messages are fetched,
//!   so the same rows are never fetched twice.
//! - `last_agent_timestamp` (per group): advances when messages are handed to
//!   a worker. Messages that arrive between triggers stay behind this cursor
//!   and are included as context once a trigger arrives.
//!
//! On startup, [`recover_pending_messages`] re-enqueues groups with messages
//! past their agent cursor (a crash between the two cursor writes).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use groupvisor_core::{Group, StoredMessage, Store};
use regex::Regex;
use tracing::{debug, error, info, warn};

use crate::lifecycle::LoopRun;
use crate::orchestrator::OrchestratorContext;

pub const LAST_TIMESTAMP_KEY: &str = "last_timestamp";
pub const AGENT_TIMESTAMPS_KEY: &str = "last_agent_timestamp";

/// Both cursors, mirrored in `router_state`.
#[derive(Debug, Clone, Default)]
pub struct Cursors {
    pub last_timestamp: String,
    pub agent: HashMap<String, String>,
}

impl Cursors {
    pub fn load(store: &dyn Store) -> Self {
        let last_timestamp = match store.get_router_state(LAST_TIMESTAMP_KEY) {
            Ok(value) => value.unwrap_or_default(),
            Err(e) => {
                warn!(err = %e, "failed to load message cursor");
                String::new()
            }
        };
        let agent = match store.get_router_state(AGENT_TIMESTAMPS_KEY) {
            Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!(err = %e, "corrupt agent cursors, starting fresh");
                HashMap::new()
            }),
            Ok(None) => HashMap::new(),
            Err(e) => {
                warn!(err = %e, "failed to load agent cursors");
                HashMap::new()
            }
        };
        Self {
            last_timestamp,
            agent,
        }
    }

    pub fn agent_since(&self, chat_id: &str) -> String {
        self.agent.get(chat_id).cloned().unwrap_or_default()
    }

    pub fn set_global(&mut self, store: &dyn Store, timestamp: &str) {
        self.last_timestamp = timestamp.to_string();
        if let Err(e) = store.set_router_state(LAST_TIMESTAMP_KEY, timestamp) {
            error!(err = %e, "failed to persist message cursor");
        }
    }

    pub fn set_agent(&mut self, store: &dyn Store, chat_id: &str, timestamp: &str) {
        self.agent.insert(chat_id.to_string(), timestamp.to_string());
        let encoded = match serde_json::to_string(&self.agent) {
            Ok(encoded) => encoded,
            Err(e) => {
                error!(err = %e, "failed to encode agent cursors");
                return;
            }
        };
        if let Err(e) = store.set_router_state(AGENT_TIMESTAMPS_KEY, &encoded) {
            error!(err = %e, "failed to persist agent cursors");
        }
    }
}

/// `^@{assistant}\b`, or the group's own trigger when it has one. Case-insensitive.
pub fn build_trigger_regex(assistant_name: &str, custom: Option<&str>) -> Option<Regex> {
    let trigger = match custom.map(str::trim).filter(|t| !t.is_empty()) {
        Some(t) => t.to_string(),
        None => format!("@{assistant_name}"),
    };
    let boundary = if trigger.ends_with(|c: char| c.is_alphanumeric() || c == '_') {
        r"\b"
    } else {
        ""
    };
    let pattern = format!("(?i)^{}{boundary}", regex::escape(&trigger));
    match Regex::new(&pattern) {
        Ok(re) => Some(re),
        Err(e) => {
            error!(trigger = %trigger, err = %e, "invalid trigger pattern");
            None
        }
    }
}

/// Main never needs a trigger; other groups do unless they opted out.
pub fn needs_trigger(group: &Group, is_main: bool) -> bool {
    !is_main && group.requires_trigger.unwrap_or(true)
}

pub fn has_trigger(group: &Group, assistant_name: &str, messages: &[StoredMessage]) -> bool {
    let Some(re) = build_trigger_regex(assistant_name, Some(group.trigger.as_str())) else {
        return false;
    };
    messages.iter().any(|m| re.is_match(m.content.trim()))
}

fn escape_xml(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

/// The prompt a worker receives for a backlog of chat messages.
pub fn format_messages(messages: &[StoredMessage]) -> String {
    let lines: Vec<String> = messages
        .iter()
        .map(|m| {
            format!(
                "<message sender=\"{}\" timestamp=\"{}\">{}</message>",
                escape_xml(&m.sender_name),
                escape_xml(&m.timestamp),
                escape_xml(&m.content)
            )
        })
        .collect();
    format!("<messages>\n{}\n</messages>", lines.join("\n"))
}

/// Drop `<internal>...</internal>` spans. An unclosed tag hides the rest.
pub fn strip_internal_blocks(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("<internal>") {
        result.push_str(&rest[..start]);
        match rest[start..].find("</internal>") {
            Some(end) => rest = &rest[start + end + "</internal>".len()..],
            None => {
                rest = "";
                break;
            }
        }
    }
    result.push_str(rest);
    result.trim().to_string()
}

pub struct MessageLoop {
    ctx: Arc<OrchestratorContext>,
}

impl MessageLoop {
    pub fn new(ctx: Arc<OrchestratorContext>) -> Self {
        Self { ctx }
    }

    pub async fn run(&self, mut run: LoopRun) {
        let interval = Duration::from_millis(self.ctx.config.orchestrator.poll_interval_ms);
        run.mark_running();
        {
            let cursors = self.ctx.cursors.lock().await;
            info!(
                poll_interval_ms = interval.as_millis() as u64,
                last_timestamp = %cursors.last_timestamp,
                agent_cursors = cursors.agent.len(),
                "message loop started"
            );
        }

        loop {
            if let Err(e) = self.poll_once().await {
                error!(err = %e, "error in message poll");
            }
            if !run.sleep(interval).await {
                break;
            }
        }
        info!("message loop shutting down");
    }

    /// Single poll iteration.
    pub async fn poll_once(&self) -> anyhow::Result<()> {
        let ctx = &self.ctx;
        let assistant = ctx.config.orchestrator.assistant_name.as_str();
        let groups = ctx.groups.read().await.clone();
        if groups.is_empty() {
            return Ok(());
        }
        let chat_ids: Vec<String> = groups.keys().cloned().collect();

        let since = ctx.cursors.lock().await.last_timestamp.clone();
        let (messages, newest) = ctx.store.get_new_messages(&chat_ids, &since, assistant)?;
        if messages.is_empty() {
            return Ok(());
        }
        info!(count = messages.len(), "new messages");

        ctx.cursors
            .lock()
            .await
            .set_global(ctx.store.as_ref(), &newest);

        let mut by_chat: HashMap<String, Vec<StoredMessage>> = HashMap::new();
        for msg in messages {
            by_chat.entry(msg.chat_id.clone()).or_default().push(msg);
        }

        for (chat_id, chat_messages) in by_chat {
            let Some(group) = groups.get(&chat_id) else {
                continue;
            };
            let is_main = ctx.is_main(group);

            // Non-trigger messages stay in the store as context for later.
            if needs_trigger(group, is_main) && !has_trigger(group, assistant, &chat_messages) {
                continue;
            }

            let agent_since = ctx.cursors.lock().await.agent_since(&chat_id);
            let backlog = match ctx.store.get_messages_since(&chat_id, &agent_since, assistant) {
                Ok(backlog) if !backlog.is_empty() => backlog,
                Ok(_) => chat_messages,
                Err(e) => {
                    warn!(chat_id = %chat_id, err = %e, "failed to load backlog");
                    chat_messages
                }
            };

            let formatted = format_messages(&backlog);
            if ctx.queue.send_followup(&chat_id, &formatted).await {
                debug!(chat_id = %chat_id, count = backlog.len(), "piped messages to active worker");
                if let Some(last) = backlog.last() {
                    ctx.cursors
                        .lock()
                        .await
                        .set_agent(ctx.store.as_ref(), &chat_id, &last.timestamp);
                }
                if let Err(e) = ctx.channel.set_typing(&chat_id, true).await {
                    debug!(chat_id = %chat_id, err = %e, "typing indicator failed");
                }
            } else {
                ctx.queue.enqueue_message_check(&chat_id).await;
            }
        }
        Ok(())
    }
}

/// Enqueue every registered group that has messages past its agent cursor.
/// Returns the chat ids that were enqueued.
pub async fn recover_pending_messages(ctx: &OrchestratorContext) -> Vec<String> {
    let assistant = ctx.config.orchestrator.assistant_name.as_str();
    let groups = ctx.groups.read().await.clone();
    let mut recovered = Vec::new();

    for (chat_id, group) in groups {
        let since = ctx.cursors.lock().await.agent_since(&chat_id);
        match ctx.store.get_messages_since(&chat_id, &since, assistant) {
            Ok(pending) if !pending.is_empty() => {
                info!(group = %group.name, pending = pending.len(), "recovery: found unprocessed messages");
                ctx.queue.enqueue_message_check(&chat_id).await;
                recovered.push(chat_id);
            }
            Ok(_) => {}
            Err(e) => warn!(chat_id = %chat_id, err = %e, "recovery: failed to check messages"),
        }
    }
    recovered.sort();
    recovered
}
