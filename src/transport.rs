//! Seams to the channel transport and the outbound sender, plus the wire
//! shapes the reconciler consumes.
//!
//! The live implementation is [`crate::telegram::TelegramSource`] /
//! [`crate::bot::BotOutbox`]; tests plug in fakes.

use std::fmt;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

/// Server hint used when a difference response carries none (or zero).
pub const DEFAULT_DIFF_INTERVAL_SECS: u64 = 5;

/// Numeric timestamps above this are milliseconds, below it seconds.
const MILLIS_THRESHOLD: i64 = 1_000_000_000_000;

/// One channel post as handed over by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub id: i64,
    pub text: String,
    pub date: DateTime<Utc>,
}

/// Which delivery path surfaced a bulletin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryPath {
    Push,
    Pull,
    History,
    /// Recorded messages fed back in replay mode.
    Replay,
}

impl fmt::Display for DeliveryPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Push => "live",
            Self::Pull => "diff",
            Self::History => "history",
            Self::Replay => "replay",
        })
    }
}

/// One inbound message on its way to the pipeline.  Identity is `id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulletinEvent {
    pub id: i64,
    pub text: String,
    pub observed_at: DateTime<Utc>,
    pub path: DeliveryPath,
}

impl BulletinEvent {
    pub fn from_raw(msg: RawMessage, path: DeliveryPath) -> Self {
        Self {
            id: msg.id,
            text: msg.text,
            observed_at: msg.date,
            path,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DifferenceKind {
    /// Nothing new since the cursor.
    Empty,
    /// Gap too large to diff; carries a fresh base cursor only.
    TooLong,
    /// Zero or more new messages.
    Normal,
}

impl fmt::Display for DifferenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Empty => "Empty",
            Self::TooLong => "TooLong",
            Self::Normal => "Difference",
        })
    }
}

/// Response to a differential pull.
///
/// `messages` is only meaningful for [`DifferenceKind::Normal`]; a
/// `TooLong` response's own message list is "recent", not "new", and
/// transports leave it empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Difference {
    pub kind: DifferenceKind,
    pub cursor: Option<i64>,
    pub timeout: Duration,
    pub messages: Vec<RawMessage>,
}

impl Difference {
    pub fn empty(cursor: i64) -> Self {
        Self {
            kind: DifferenceKind::Empty,
            cursor: Some(cursor),
            timeout: Duration::from_secs(DEFAULT_DIFF_INTERVAL_SECS),
            messages: Vec::new(),
        }
    }

    pub fn too_long(cursor: Option<i64>) -> Self {
        Self {
            kind: DifferenceKind::TooLong,
            cursor,
            timeout: Duration::from_secs(DEFAULT_DIFF_INTERVAL_SECS),
            messages: Vec::new(),
        }
    }

    pub fn normal(cursor: i64, messages: Vec<RawMessage>) -> Self {
        Self {
            kind: DifferenceKind::Normal,
            cursor: Some(cursor),
            timeout: Duration::from_secs(DEFAULT_DIFF_INTERVAL_SECS),
            messages,
        }
    }
}

/// Pull side of the channel transport.  The push side is a plain stream
/// of [`RawMessage`]s owned by the transport's own task.
#[async_trait]
pub trait ChannelSource: Send + Sync {
    /// Delta since `cursor`.  `force` asks the server for a fresh base point
    /// even when it could diff.
    async fn pull_difference(&self, cursor: i64, force: bool) -> Result<Difference>;

    /// Text messages posted within `window`, oldest first.
    async fn fetch_recent(&self, window: Duration) -> Result<Vec<RawMessage>>;
}

/// Outbound sender.  Best-effort: callers log failures and move on.
#[async_trait]
pub trait Outbox: Send + Sync {
    async fn send(&self, text: &str, destination: &str) -> Result<()>;
}

/// Server timeout hint, falling back to the default for absent or zero.
pub fn timeout_hint(raw: Option<i64>) -> Duration {
    match raw {
        Some(secs) if secs > 0 => Duration::from_secs(secs as u64),
        _ => Duration::from_secs(DEFAULT_DIFF_INTERVAL_SECS),
    }
}

/// Coerce a loosely-typed numeric JSON field into `i64`.
///
/// Accepts plain numbers, float-encoded integers, decimal strings (how
/// big integers usually survive JSON) and `{"value": ..}` wrappers.
/// Anything else is 0.
pub fn coerce_int(value: &Value) -> i64 {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_u64().map(|u| i64::try_from(u).unwrap_or(i64::MAX)))
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or(0),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| f as i64))
                .unwrap_or(0)
        }
        Value::Object(map) => map.get("value").map(coerce_int).unwrap_or(0),
        _ => 0,
    }
}

/// Unix timestamp in seconds or milliseconds to UTC.
pub fn message_date(raw: i64) -> DateTime<Utc> {
    let millis = if raw > MILLIS_THRESHOLD {
        raw
    } else {
        raw.saturating_mul(1000)
    };
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_default()
}

/// Single-line preview for logs.
pub fn format_preview(text: &str, max: usize) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .take(max)
        .collect()
}
