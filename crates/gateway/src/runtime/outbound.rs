//! Outbound channel adapters.
//!
//! The runtime only needs one capability from a chat platform:
//! [`ChannelSender::send_text`].  Two reference adapters ship here: a
//! webhook relay and a log-only sink used for channels without a binding.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use la_domain::config::OutboundConfig;
use la_domain::error::{Error, Result};

/// Per-send routing hints.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SendOptions {
    pub thread_id: Option<String>,
    /// Inbound message id the reply answers.
    pub reply_to: Option<String>,
}

/// Result of one send attempt as reported by the adapter.
#[derive(Debug, Clone, PartialEq)]
pub struct SendResult {
    pub success: bool,
    pub error: Option<String>,
}

impl SendResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

#[async_trait::async_trait]
pub trait ChannelSender: Send + Sync {
    async fn send_text(&self, chat_id: &str, text: &str, opts: &SendOptions) -> SendResult;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Webhook adapter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WebhookPayload<'a> {
    channel: &'a str,
    chat_id: &'a str,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    thread_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_to: Option<&'a str>,
}

/// POSTs every reply as JSON to a connector-owned relay.
pub struct WebhookSender {
    channel: String,
    url: String,
    client: reqwest::Client,
}

impl WebhookSender {
    pub fn from_config(cfg: &OutboundConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(Self {
            channel: cfg.channel.clone(),
            url: cfg.webhook_url.clone(),
            client,
        })
    }
}

#[async_trait::async_trait]
impl ChannelSender for WebhookSender {
    async fn send_text(&self, chat_id: &str, text: &str, opts: &SendOptions) -> SendResult {
        let payload = WebhookPayload {
            channel: &self.channel,
            chat_id,
            text,
            thread_id: opts.thread_id.as_deref(),
            reply_to: opts.reply_to.as_deref(),
        };
        match self.client.post(&self.url).json(&payload).send().await {
            Ok(resp) if resp.status().is_success() => SendResult::ok(),
            Ok(resp) => SendResult::failed(format!("webhook returned HTTP {}", resp.status().as_u16())),
            Err(e) => SendResult::failed(e.to_string()),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Log-only adapter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Writes replies to the log and reports success.
pub struct LogSender {
    channel: String,
}

impl LogSender {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
        }
    }
}

#[async_trait::async_trait]
impl ChannelSender for LogSender {
    async fn send_text(&self, chat_id: &str, text: &str, opts: &SendOptions) -> SendResult {
        tracing::info!(
            channel = %self.channel,
            chat_id,
            thread_id = opts.thread_id.as_deref().unwrap_or(""),
            reply_to = opts.reply_to.as_deref().unwrap_or(""),
            chars = text.chars().count(),
            "outbound reply (log sink)"
        );
        SendResult::ok()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Routing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Channel name → adapter.  Unbound channels fall back to a [`LogSender`].
pub struct OutboundRouter {
    senders: HashMap<String, Arc<dyn ChannelSender>>,
}

impl OutboundRouter {
    pub fn new() -> Self {
        Self {
            senders: HashMap::new(),
        }
    }

    pub fn from_config(bindings: &[OutboundConfig]) -> Result<Self> {
        let mut router = Self::new();
        for cfg in bindings {
            let sender = WebhookSender::from_config(cfg)?;
            tracing::info!(channel = %cfg.channel, url = %cfg.webhook_url, "webhook sender ready");
            router.bind(&cfg.channel, Arc::new(sender));
        }
        Ok(router)
    }

    pub fn bind(&mut self, channel: &str, sender: Arc<dyn ChannelSender>) {
        self.senders.insert(channel.to_owned(), sender);
    }

    pub fn for_channel(&self, channel: &str) -> Arc<dyn ChannelSender> {
        match self.senders.get(channel) {
            Some(s) => s.clone(),
            None => Arc::new(LogSender::new(channel)),
        }
    }
}

impl Default for OutboundRouter {
    fn default() -> Self {
        Self::new()
    }
}
