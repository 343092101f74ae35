//! Environment configuration.
//!
//! Everything is read through a lookup closure so tests can feed a plain map
//! instead of mutating the process environment.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};

const DEFAULT_TIMER_MINUTES: u64 = 10;
const DEFAULT_DIFF_INTERVAL_SECS: u64 = crate::transport::DEFAULT_DIFF_INTERVAL_SECS;
const DEFAULT_DIFF_TIMEOUT_SECS: u64 = 20;
const DEFAULT_STATUS_INTERVAL_SECS: u64 = 15;

/// Pipeline settings shared by every run mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchCfg {
    pub monitored_localities: Vec<String>,
    pub quiet_window: Duration,
    pub destinations: Vec<String>,
    /// Replay recent channel history before live delivery starts.
    pub replay_on_start: bool,
    pub replay_window: Duration,
    pub diff_interval: Duration,
    pub diff_timeout: Duration,
    pub status_interval: Duration,
}

impl Default for WatchCfg {
    fn default() -> Self {
        Self {
            monitored_localities: Vec::new(),
            quiet_window: minutes(DEFAULT_TIMER_MINUTES),
            destinations: Vec::new(),
            replay_on_start: false,
            replay_window: minutes(DEFAULT_TIMER_MINUTES),
            diff_interval: Duration::from_secs(DEFAULT_DIFF_INTERVAL_SECS),
            diff_timeout: Duration::from_secs(DEFAULT_DIFF_TIMEOUT_SECS),
            status_interval: Duration::from_secs(DEFAULT_STATUS_INTERVAL_SECS),
        }
    }
}

impl WatchCfg {
    pub fn from_env(require_destinations: bool) -> Result<Self> {
        Self::from_lookup(&env_lookup, require_destinations)
    }

    /// Build from an arbitrary key lookup.  When `require_destinations` is
    /// false a missing target list yields an empty `destinations`.
    pub fn from_lookup(
        lookup: &dyn Fn(&str) -> Option<String>,
        require_destinations: bool,
    ) -> Result<Self> {
        let monitored_localities = parse_csv(&must(lookup, "MONITORED_TOWNS")?);
        if monitored_localities.is_empty() {
            return Err(anyhow!("MONITORED_TOWNS must contain at least one town name"));
        }

        let timer_minutes = positive_int(lookup, "TIMER_MINUTES", DEFAULT_TIMER_MINUTES)?;
        let destinations = match target_chat_ids(lookup) {
            Ok(ids) => ids,
            Err(e) if require_destinations => return Err(e),
            Err(_) => Vec::new(),
        };

        Ok(Self {
            monitored_localities,
            quiet_window: minutes(timer_minutes),
            destinations,
            replay_on_start: bool_var(lookup, "FETCH_PAST_ALERTS_ON_START", false)?,
            replay_window: minutes(positive_int(lookup, "PAST_ALERTS_MINUTES", timer_minutes)?),
            diff_interval: Duration::from_secs(positive_int(
                lookup,
                "DIFF_INTERVAL_SECS",
                DEFAULT_DIFF_INTERVAL_SECS,
            )?),
            diff_timeout: Duration::from_secs(positive_int(
                lookup,
                "DIFF_TIMEOUT_SECS",
                DEFAULT_DIFF_TIMEOUT_SECS,
            )?),
            status_interval: Duration::from_secs(positive_int(
                lookup,
                "STATUS_INTERVAL_SECS",
                DEFAULT_STATUS_INTERVAL_SECS,
            )?),
        })
    }

    pub fn quiet_minutes(&self) -> u64 {
        self.quiet_window.as_secs() / 60
    }
}

fn minutes(n: u64) -> Duration {
    Duration::from_secs(n.saturating_mul(60))
}

// ───────────────────────────── Env helpers ───────────────────────────────

pub fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// Trimmed value, `None` when unset or blank.
pub fn optional(lookup: &dyn Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn must(lookup: &dyn Fn(&str) -> Option<String>, key: &str) -> Result<String> {
    optional(lookup, key).ok_or_else(|| anyhow!("Missing env var {key}"))
}

pub fn must_env(key: &str) -> Result<String> {
    must(&env_lookup, key)
}

pub fn positive_int(
    lookup: &dyn Fn(&str) -> Option<String>,
    key: &str,
    default: u64,
) -> Result<u64> {
    let Some(raw) = optional(lookup, key) else {
        return Ok(default);
    };
    raw.parse::<u64>()
        .ok()
        .filter(|v| *v > 0)
        .ok_or_else(|| anyhow!("{key} must be a positive integer (got {raw:?})"))
}

/// Strict boolean: unknown spellings are an error rather than `false`.
pub fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(anyhow!("{key} must be a boolean (got {raw:?})")),
    }
}

pub fn bool_var(lookup: &dyn Fn(&str) -> Option<String>, key: &str, default: bool) -> Result<bool> {
    match optional(lookup, key) {
        Some(raw) => parse_bool(key, &raw),
        None => Ok(default),
    }
}

pub fn parse_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|x| !x.is_empty())
        .map(str::to_string)
        .collect()
}

/// `TARGET_CHAT_IDS` (comma list) wins over the single `TARGET_CHAT_ID`.
pub fn target_chat_ids(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Vec<String>> {
    if let Some(plural) = optional(lookup, "TARGET_CHAT_IDS") {
        let ids = parse_csv(&plural);
        if ids.is_empty() {
            return Err(anyhow!("TARGET_CHAT_IDS must contain at least one chat id"));
        }
        return Ok(ids);
    }
    if let Some(single) = optional(lookup, "TARGET_CHAT_ID") {
        return Ok(vec![single]);
    }
    Err(anyhow!(
        "Missing target chat configuration: set TARGET_CHAT_IDS (preferred) or TARGET_CHAT_ID"
    ))
}

/// `@name`, bare `name` or `https://t.me/name?..` → `@name`.
pub fn normalize_source_channel(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    let lower = trimmed.to_ascii_lowercase();
    let name = ["https://t.me/", "http://t.me/"]
        .iter()
        .find(|prefix| lower.starts_with(*prefix))
        .map(|prefix| {
            let rest = &trimmed[prefix.len()..];
            rest.split(['/', '?', '#']).next().unwrap_or_default()
        })
        .unwrap_or(trimmed)
        .trim_start_matches('@');

    if name.is_empty() {
        return Err(anyhow!("SOURCE_CHANNEL is empty"));
    }
    Ok(format!("@{name}"))
}

pub fn parse_api_id(raw: &str) -> Result<i32> {
    let id: i32 = raw.trim().parse().context("TG_API_ID must be i32")?;
    if id <= 0 {
        return Err(anyhow!("TG_API_ID must be a positive integer"));
    }
    Ok(id)
}
