//! Outbound chat delivery.
//!
//! The chat adapter itself runs elsewhere; groupvisord only asks it to send
//! text and toggle the typing indicator.

use anyhow::{Context, anyhow};
use futures::FutureExt;
use futures::future::BoxFuture;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, info};

pub trait Channel: Send + Sync {
    fn name(&self) -> &'static str;

    fn send_message<'a>(&'a self, chat_id: &'a str, text: &'a str)
    -> BoxFuture<'a, anyhow::Result<()>>;

    fn set_typing<'a>(&'a self, chat_id: &'a str, typing: bool)
    -> BoxFuture<'a, anyhow::Result<()>>;
}

#[derive(Debug, Serialize)]
struct SendBody<'a> {
    chat_id: &'a str,
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct TypingBody<'a> {
    chat_id: &'a str,
    typing: bool,
}

/// Posts to `{base}/send` and `{base}/typing` on the chat adapter.
#[derive(Clone)]
pub struct HttpCallbackChannel {
    client: Client,
    base_url: String,
}

impl HttpCallbackChannel {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn post<T: Serialize>(&self, path: &str, body: &T) -> anyhow::Result<()> {
        let endpoint = format!("{}/{path}", self.base_url);
        let response = self
            .client
            .post(&endpoint)
            .json(body)
            .send()
            .await
            .with_context(|| format!("failed to call chat adapter {endpoint}"))?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(anyhow!("chat adapter {endpoint} returned {status}: {detail}"));
        }
        Ok(())
    }
}

impl Channel for HttpCallbackChannel {
    fn name(&self) -> &'static str {
        "http-callback"
    }

    fn send_message<'a>(
        &'a self,
        chat_id: &'a str,
        text: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        async move {
            if text.trim().is_empty() {
                return Err(anyhow!("refusing to send an empty message"));
            }
            self.post("send", &SendBody { chat_id, text }).await?;
            debug!(chat_id, chars = text.chars().count(), "message delivered");
            Ok(())
        }
        .boxed()
    }

    fn set_typing<'a>(
        &'a self,
        chat_id: &'a str,
        typing: bool,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        async move { self.post("typing", &TypingBody { chat_id, typing }).await }.boxed()
    }
}

/// Used when no adapter URL is configured.
#[derive(Debug, Default, Clone)]
pub struct LogOnlyChannel;

impl Channel for LogOnlyChannel {
    fn name(&self) -> &'static str {
        "log-only"
    }

    fn send_message<'a>(
        &'a self,
        chat_id: &'a str,
        text: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        info!(chat_id, text, "outbound message (no chat adapter configured)");
        async { Ok(()) }.boxed()
    }

    fn set_typing<'a>(
        &'a self,
        _chat_id: &'a str,
        _typing: bool,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        async { Ok(()) }.boxed()
    }
}

/// HTTP callback when a URL is configured, log-only otherwise.
pub fn channel_from_url(url: &str) -> Box<dyn Channel> {
    if url.trim().is_empty() {
        Box::new(LogOnlyChannel)
    } else {
        Box::new(HttpCallbackChannel::new(url))
    }
}

/// Records everything sent through it.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct MemoryChannel {
    pub sent: std::sync::Mutex<Vec<(String, String)>>,
    pub typing: std::sync::Mutex<Vec<(String, bool)>>,
}

#[cfg(test)]
impl MemoryChannel {
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[cfg(test)]
impl Channel for MemoryChannel {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn send_message<'a>(
        &'a self,
        chat_id: &'a str,
        text: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        self.sent
            .lock()
            .unwrap()
            .push((chat_id.to_string(), text.to_string()));
        async { Ok(()) }.boxed()
    }

    fn set_typing<'a>(
        &'a self,
        chat_id: &'a str,
        typing: bool,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        self.typing
            .lock()
            .unwrap()
            .push((chat_id.to_string(), typing));
        async { Ok(()) }.boxed()
    }
}
