//! Event normalizer
//!
//! Turns a transport-specific payload into a canonical [`Event`]. Pure apart
//! from the injected [`Clock`].

use crate::state_machine::{Event, EventKind};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),
    #[error("Unsupported source type: {0}")]
    UnsupportedSourceType(String),
}

/// Time source handed to the normalizer
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock frozen at one instant
#[allow(dead_code)] // Used in tests
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Supported inbound transports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceType {
    /// Telegram Bot API update
    Telegram,
    /// Generic JSON webhook
    Webhook,
    /// Signals raised inside the deployment (schedulers, operators)
    Internal,
}

impl SourceType {
    pub fn parse(s: &str) -> Result<Self, NormalizeError> {
        match s {
            "telegram" => Ok(SourceType::Telegram),
            "webhook" => Ok(SourceType::Webhook),
            "internal" => Ok(SourceType::Internal),
            other => Err(NormalizeError::UnsupportedSourceType(other.to_string())),
        }
    }
}

/// Metadata the transport layer attaches to a raw payload
#[derive(Debug, Clone)]
pub struct SourceMeta {
    /// Transport name, e.g. `telegram`
    pub source: String,
    /// When the transport handed the payload over, if it says
    pub delivered_at: Option<DateTime<Utc>>,
}

impl SourceMeta {
    #[allow(dead_code)] // Used in tests
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            delivered_at: None,
        }
    }
}

/// Normalize one raw payload
pub fn normalize(raw: &[u8], meta: &SourceMeta, clock: &dyn Clock) -> Result<Event, NormalizeError> {
    let source = SourceType::parse(&meta.source)?;
    let parsed = match source {
        SourceType::Telegram => parse_telegram(raw)?,
        SourceType::Webhook => parse_webhook(raw)?,
        SourceType::Internal => parse_internal(raw)?,
    };

    if parsed.conversation_id.trim().is_empty() {
        return Err(NormalizeError::MalformedPayload(
            "empty conversation id".to_string(),
        ));
    }
    if parsed.seq < 1 {
        return Err(NormalizeError::MalformedPayload(format!(
            "sequence number must be positive, got {}",
            parsed.seq
        )));
    }

    Ok(Event::new(
        parsed.conversation_id,
        parsed.kind,
        parsed.payload,
        clock.now(),
        parsed.seq,
    ))
}

struct Parsed {
    conversation_id: String,
    kind: EventKind,
    payload: String,
    seq: i64,
}

fn decode<'a, T: Deserialize<'a>>(raw: &'a [u8]) -> Result<T, NormalizeError> {
    serde_json::from_slice(raw).map_err(|e| NormalizeError::MalformedPayload(e.to_string()))
}

fn missing(field: &str) -> NormalizeError {
    NormalizeError::MalformedPayload(format!("missing field `{field}`"))
}

fn text_kind(text: &str) -> EventKind {
    if text.trim_start().starts_with('/') {
        EventKind::Command
    } else {
        EventKind::Message
    }
}

// ============================================================================
// Telegram
// ============================================================================

#[derive(Deserialize)]
struct TelegramUpdate {
    update_id: Option<i64>,
    message: Option<TelegramMessage>,
    edited_message: Option<TelegramMessage>,
}

#[derive(Deserialize)]
struct TelegramMessage {
    chat: Option<TelegramChat>,
    text: Option<String>,
    caption: Option<String>,
}

#[derive(Deserialize)]
struct TelegramChat {
    id: i64,
}

fn parse_telegram(raw: &[u8]) -> Result<Parsed, NormalizeError> {
    let update: TelegramUpdate = decode(raw)?;
    let seq = update.update_id.ok_or_else(|| missing("update_id"))?;
    let message = update
        .message
        .or(update.edited_message)
        .ok_or_else(|| missing("message"))?;
    let chat = message.chat.ok_or_else(|| missing("message.chat"))?;
    let text = message
        .text
        .or(message.caption)
        .ok_or_else(|| missing("message.text"))?;

    Ok(Parsed {
        conversation_id: format!("telegram:{}", chat.id),
        kind: text_kind(&text),
        payload: text,
        seq,
    })
}

// ============================================================================
// Generic webhook
// ============================================================================

#[derive(Deserialize)]
struct WebhookPayload {
    conversation_id: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    text: Option<String>,
    seq: Option<i64>,
}

fn parse_webhook(raw: &[u8]) -> Result<Parsed, NormalizeError> {
    let body: WebhookPayload = decode(raw)?;
    let conversation_id = body.conversation_id.ok_or_else(|| missing("conversation_id"))?;
    let seq = body.seq.ok_or_else(|| missing("seq"))?;
    let text = body.text.unwrap_or_default();

    let kind = match body.kind.as_deref() {
        None => text_kind(&text),
        Some(k) => EventKind::parse(k)
            .ok_or_else(|| NormalizeError::MalformedPayload(format!("unknown event type `{k}`")))?,
    };
    if matches!(kind, EventKind::Message | EventKind::Command) && text.is_empty() {
        return Err(missing("text"));
    }

    Ok(Parsed {
        conversation_id,
        kind,
        payload: text,
        seq,
    })
}

// ============================================================================
// Internal signals
// ============================================================================

#[derive(Deserialize)]
struct InternalSignal {
    conversation_id: Option<String>,
    signal: Option<String>,
    seq: Option<i64>,
}

fn parse_internal(raw: &[u8]) -> Result<Parsed, NormalizeError> {
    let body: InternalSignal = decode(raw)?;
    let conversation_id = body.conversation_id.ok_or_else(|| missing("conversation_id"))?;
    let signal = body.signal.ok_or_else(|| missing("signal"))?;
    let seq = body.seq.ok_or_else(|| missing("seq"))?;

    let kind = if signal == "reopen" {
        EventKind::Reopen
    } else {
        EventKind::System
    };
    Ok(Parsed {
        conversation_id,
        kind,
        payload: signal,
        seq,
    })
}
