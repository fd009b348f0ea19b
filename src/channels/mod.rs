use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;

pub const DEFAULT_TEXT_CHUNK_LIMIT: usize = 4_000;
pub const DISCORD_TEXT_CHUNK_LIMIT: usize = 2_000;
pub const DEFAULT_READ_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkMode {
    Length,
    Newline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelCapabilities {
    pub name: &'static str,
    pub supports_threads: bool,
    pub supports_media: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundMessage {
    pub target: String,
    pub text: String,
    pub media_url: Option<String>,
    pub reply_to_id: Option<String>,
    pub thread_id: Option<String>,
}

impl OutboundMessage {
    /// Reply linkage wins over thread linkage when both are present.
    pub fn thread_linkage(&self) -> Option<&str> {
        resolve_thread_linkage(self.reply_to_id.as_deref(), self.thread_id.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundReceipt {
    pub channel_tag: String,
    pub message_id: String,
}

/// Chat-platform action normalized for internal dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelAction {
    Send(OutboundMessage),
    ThreadReply(OutboundMessage),
    Read {
        target: String,
        thread_id: Option<String>,
        limit: usize,
    },
}

#[async_trait]
pub trait ChannelOutbound: Send + Sync {
    fn capabilities(&self) -> ChannelCapabilities;
    async fn send_text(&self, message: &OutboundMessage) -> Result<OutboundReceipt>;
    async fn send_media(&self, message: &OutboundMessage) -> Result<OutboundReceipt>;
}

pub fn resolve_thread_linkage<'a>(
    reply_to_id: Option<&'a str>,
    thread_id: Option<&'a str>,
) -> Option<&'a str> {
    let reply_to_id = reply_to_id.map(str::trim).filter(|value| !value.is_empty());
    let thread_id = thread_id.map(str::trim).filter(|value| !value.is_empty());
    reply_to_id.or(thread_id)
}

pub fn normalize_channel_id(raw: Option<&str>) -> Option<String> {
    let tag = raw.map(str::trim).filter(|value| !value.is_empty())?;
    let tag = tag.to_ascii_lowercase();
    let canonical = match tag.as_str() {
        "tg" => "telegram",
        "wa" => "whatsapp",
        "web-chat" | "web_chat" => "webchat",
        other => other,
    };
    Some(canonical.to_owned())
}

/// Text limit and chunk mode for a normalized channel tag.
pub fn chunk_policy(channel_tag: &str) -> (usize, ChunkMode) {
    match channel_tag {
        "discord" => (DISCORD_TEXT_CHUNK_LIMIT, ChunkMode::Length),
        "webchat" => (DEFAULT_TEXT_CHUNK_LIMIT, ChunkMode::Newline),
        _ => (DEFAULT_TEXT_CHUNK_LIMIT, ChunkMode::Length),
    }
}

pub fn chunk_text(text: &str, limit: usize, mode: ChunkMode) -> Vec<String> {
    match mode {
        ChunkMode::Length => split_at_limit(text, limit),
        ChunkMode::Newline => split_paragraphs(text, limit),
    }
}

/// Maps `{"action": ..., ...}` payloads from channel tools onto a
/// [`ChannelAction`]. Unknown actions or missing targets yield `None`.
pub fn normalize_channel_action(raw: &Value) -> Option<ChannelAction> {
    let action = first_string(raw, &["action"])?
        .to_ascii_lowercase()
        .replace('_', "-");
    let target = first_string(raw, &["to", "target", "channelId", "channel_id"])?;
    let thread_id = first_string(raw, &["threadId", "thread_id"]);

    match action.as_str() {
        "send" | "sendmessage" | "message" => Some(ChannelAction::Send(OutboundMessage {
            target,
            text: first_string(raw, &["message", "text"]).unwrap_or_default(),
            media_url: first_string(raw, &["mediaUrl", "media_url", "media"]),
            reply_to_id: first_string(raw, &["replyTo", "replyToId", "reply_to"]),
            thread_id,
        })),
        "thread-reply" | "threadreply" | "reply" => {
            let reply_to_id = first_string(raw, &["replyTo", "replyToId", "reply_to"]);
            if thread_id.is_none() && reply_to_id.is_none() {
                return None;
            }
            Some(ChannelAction::ThreadReply(OutboundMessage {
                target,
                text: first_string(raw, &["message", "text"]).unwrap_or_default(),
                media_url: first_string(raw, &["mediaUrl", "media_url", "media"]),
                reply_to_id,
                thread_id,
            }))
        }
        "read" | "read-thread" | "readthread" | "history" => {
            let limit = raw
                .get("limit")
                .and_then(Value::as_u64)
                .map(|value| value.clamp(1, 500) as usize)
                .unwrap_or(DEFAULT_READ_LIMIT);
            Some(ChannelAction::Read {
                target,
                thread_id,
                limit,
            })
        }
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveredMessage {
    pub message_id: String,
    pub target: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_link: Option<String>,
}

#[derive(Debug, Default)]
struct LoopbackState {
    next_id: u64,
    delivered: Vec<DeliveredMessage>,
}

/// In-memory channel that records deliveries instead of calling a platform.
#[derive(Debug)]
pub struct LoopbackChannel {
    channel_tag: String,
    chunk_limit: usize,
    chunk_mode: ChunkMode,
    state: Mutex<LoopbackState>,
}

impl LoopbackChannel {
    pub fn new(channel: Option<&str>) -> Self {
        let channel_tag = normalize_channel_id(channel).unwrap_or_else(|| "webchat".to_owned());
        let (chunk_limit, chunk_mode) = chunk_policy(&channel_tag);
        Self {
            chunk_limit,
            chunk_mode,
            channel_tag,
            state: Mutex::new(LoopbackState::default()),
        }
    }

    pub fn channel_tag(&self) -> &str {
        &self.channel_tag
    }

    pub async fn delivered(&self) -> Vec<DeliveredMessage> {
        self.state.lock().await.delivered.clone()
    }

    pub async fn history(
        &self,
        target: &str,
        thread_id: Option<&str>,
        limit: usize,
    ) -> Vec<DeliveredMessage> {
        let state = self.state.lock().await;
        let matching = state
            .delivered
            .iter()
            .filter(|entry| entry.target == target)
            .filter(|entry| thread_id.is_none() || entry.thread_link.as_deref() == thread_id)
            .cloned()
            .collect::<Vec<_>>();
        let skip = matching.len().saturating_sub(limit);
        matching.into_iter().skip(skip).collect()
    }

    pub async fn dispatch(&self, action: ChannelAction) -> Result<Value> {
        match action {
            ChannelAction::Send(message) | ChannelAction::ThreadReply(message) => {
                let receipt = if message.media_url.is_some() {
                    self.send_media(&message).await?
                } else {
                    self.send_text(&message).await?
                };
                Ok(json!(receipt))
            }
            ChannelAction::Read {
                target,
                thread_id,
                limit,
            } => {
                let messages = self.history(&target, thread_id.as_deref(), limit).await;
                Ok(json!({
                    "channelTag": self.channel_tag,
                    "count": messages.len(),
                    "messages": messages,
                }))
            }
        }
    }

    async fn deliver(
        &self,
        message: &OutboundMessage,
        chunks: Vec<String>,
        media_url: Option<String>,
    ) -> OutboundReceipt {
        let thread_link = message.thread_linkage().map(ToOwned::to_owned);
        let mut state = self.state.lock().await;
        let mut last_id = String::new();
        let total = chunks.len().max(1);
        let mut chunks = chunks.into_iter();
        for index in 0..total {
            state.next_id += 1;
            last_id = format!("{}-{}", self.channel_tag, state.next_id);
            state.delivered.push(DeliveredMessage {
                message_id: last_id.clone(),
                target: message.target.clone(),
                text: chunks.next().unwrap_or_default(),
                // media rides on the first chunk only
                media_url: if index == 0 { media_url.clone() } else { None },
                thread_link: thread_link.clone(),
            });
        }
        OutboundReceipt {
            channel_tag: self.channel_tag.clone(),
            message_id: last_id,
        }
    }
}

#[async_trait]
impl ChannelOutbound for LoopbackChannel {
    fn capabilities(&self) -> ChannelCapabilities {
        ChannelCapabilities {
            name: "loopback",
            supports_threads: true,
            supports_media: true,
        }
    }

    async fn send_text(&self, message: &OutboundMessage) -> Result<OutboundReceipt> {
        if message.target.trim().is_empty() {
            bail!("outbound target must be a non-empty string");
        }
        let chunks = chunk_text(&message.text, self.chunk_limit, self.chunk_mode);
        if chunks.is_empty() {
            bail!("outbound text must not be empty");
        }
        Ok(self.deliver(message, chunks, None).await)
    }

    async fn send_media(&self, message: &OutboundMessage) -> Result<OutboundReceipt> {
        if message.target.trim().is_empty() {
            bail!("outbound target must be a non-empty string");
        }
        let Some(media_url) = message
            .media_url
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
        else {
            bail!("media send requires a media url");
        };
        let chunks = chunk_text(&message.text, self.chunk_limit, self.chunk_mode);
        Ok(self.deliver(message, chunks, Some(media_url.to_owned())).await)
    }
}

fn first_string(root: &Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(value) = root.get(*key).and_then(Value::as_str) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_owned());
            }
        }
    }
    None
}

fn split_at_limit(text: &str, limit: usize) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }
    if limit == 0 {
        return vec![text.to_owned()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;
    while !remaining.is_empty() {
        if remaining.chars().count() <= limit {
            chunks.push(remaining.to_owned());
            break;
        }

        let hard_boundary = nth_char_boundary(remaining, limit);
        let window = &remaining[..hard_boundary];
        let break_at = window
            .rfind('\n')
            .or_else(|| window.rfind(char::is_whitespace))
            .filter(|idx| *idx > 0)
            .unwrap_or(hard_boundary);

        let chunk = remaining[..break_at].trim_end();
        if !chunk.is_empty() {
            chunks.push(chunk.to_owned());
        }
        remaining = remaining[break_at..].trim_start();
    }
    chunks
}

fn split_paragraphs(text: &str, limit: usize) -> Vec<String> {
    let normalized = text.replace("\r\n", "\n");
    let mut chunks = Vec::new();
    for paragraph in normalized.split("\n\n") {
        let paragraph = paragraph.trim();
        if paragraph.is_empty() {
            continue;
        }
        if limit == 0 || paragraph.chars().count() <= limit {
            chunks.push(paragraph.to_owned());
        } else {
            chunks.extend(split_at_limit(paragraph, limit));
        }
    }
    chunks
}

fn nth_char_boundary(value: &str, nth: usize) -> usize {
    match value.char_indices().nth(nth) {
        Some((idx, _)) => idx,
        None => value.len(),
    }
}
