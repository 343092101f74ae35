//! Alert pipeline: dedup → classify → extract → match → timers → notify.
//!
//! The pipeline is the single consumer of every delivery path, so the
//! seen-id set needs no locking.  Outbound sends never block it: each
//! notification is fanned out on its own task, one independent send per
//! destination.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use futures_util::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::bulletin::{self, BulletinKind};
use crate::config::WatchCfg;
use crate::matcher;
use crate::telegram::SourceMeta;
use crate::timers::{AlertMeta, Clock, Expiry, ExpiryHandler, PendingStatus, TimerRegistry};
use crate::transport::{BulletinEvent, Outbox, format_preview};

// ───────────────────────────── Messages ──────────────────────────────────

/// "No new alerts for <town> in the last <N> minutes. You may leave the
/// protected space."
pub fn build_safe_message(town: &str, minutes: u64, link: Option<&str>) -> String {
    let base = format!(
        "אין התרעות חדשות עבור {town} ב-{minutes} הדקות האחרונות. אפשר לצאת מהמרחב המוגן."
    );
    match link {
        Some(link) => format!("{base}\n\nהתרעה אחרונה: {link}"),
        None => base,
    }
}

/// Relay of an official stand-down for `town`.
pub fn build_stand_down_message(town: &str, link: Option<&str>) -> String {
    let base = format!(
        "עדכון פיקוד העורף: באזור {town} ניתן לצאת מהמרחב המוגן, אך יש להישאר בקרבתו."
    );
    match link {
        Some(link) => format!("{base}\n\nעדכון רשמי: {link}"),
        None => base,
    }
}

// ───────────────────────────── Fan-out ───────────────────────────────────

/// Best-effort fan-out to every configured destination.
#[derive(Clone)]
pub struct Notifier {
    outbox: Arc<dyn Outbox>,
    destinations: Arc<[String]>,
}

impl Notifier {
    pub fn new(outbox: Arc<dyn Outbox>, destinations: Vec<String>) -> Self {
        Self {
            outbox,
            destinations: destinations.into(),
        }
    }

    /// Send `text` to every destination concurrently.  Errors only when no
    /// destination accepted it.
    pub async fn deliver(&self, tag: &str, town: &str, text: &str) -> Result<()> {
        let sends = self.destinations.iter().map(|dest| async move {
            info!("[{tag}] Sending for \"{town}\" to {dest}");
            match self.outbox.send(text, dest).await {
                Ok(()) => {
                    info!("[{tag}] Sent to {dest}");
                    true
                }
                Err(e) => {
                    error!("[{tag}] Failed sending for \"{town}\" to {dest}: {e:#}");
                    false
                }
            }
        });

        let results = join_all(sends).await;
        let delivered = results.iter().filter(|ok| **ok).count();
        if delivered == 0 && !results.is_empty() {
            return Err(anyhow!("no destination accepted the message"));
        }
        Ok(())
    }

    /// Fire-and-forget variant of [`deliver`](Self::deliver).
    pub fn dispatch(&self, tag: &'static str, town: String, text: String) -> JoinHandle<()> {
        let notifier = self.clone();
        tokio::spawn(async move {
            if let Err(e) = notifier.deliver(tag, &town, &text).await {
                warn!("[{tag}] {town}: {e:#}");
            }
        })
    }
}

/// Sends the quiet-window notification when a timer expires.
pub struct QuietWindowNotifier {
    notifier: Notifier,
    window_minutes: u64,
}

impl QuietWindowNotifier {
    pub fn new(notifier: Notifier, window: Duration) -> Self {
        Self {
            notifier,
            window_minutes: window.as_secs() / 60,
        }
    }
}

#[async_trait]
impl ExpiryHandler for QuietWindowNotifier {
    async fn on_expire(&self, locality: &str, expiry: &Expiry) -> Result<()> {
        info!(
            "[NOTIFY] {locality} quiet since {} (last alert #{} from: {})",
            expiry.alert_at.to_rfc3339(),
            expiry.meta.message_id,
            expiry.sub_areas.join(", ")
        );
        let text = build_safe_message(locality, self.window_minutes, expiry.meta.link.as_deref());
        self.notifier.deliver("NOTIFY", locality, &text).await
    }
}

// ───────────────────────────── Pipeline ──────────────────────────────────

/// What happened to one consumed bulletin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    /// Already processed via another delivery path.
    Duplicate,
    /// Advisory bulletin; no timer activity.
    Ignored,
    Unmatched,
    /// Number of monitored localities whose timers were armed or reset.
    Armed(usize),
    /// Number of monitored localities released by an official stand-down.
    StoodDown(usize),
}

pub struct Pipeline {
    monitored: Vec<String>,
    seen: HashSet<i64>,
    timers: TimerRegistry,
    notifier: Notifier,
    source: SourceMeta,
}

impl Pipeline {
    /// Wire notifier, timer registry and pipeline from config.
    pub fn build(
        cfg: &WatchCfg,
        outbox: Arc<dyn Outbox>,
        clock: Arc<dyn Clock>,
        source: SourceMeta,
    ) -> Result<Self> {
        let notifier = Notifier::new(outbox, cfg.destinations.clone());
        let on_expire = Arc::new(QuietWindowNotifier::new(notifier.clone(), cfg.quiet_window));
        let timers = TimerRegistry::new(cfg.quiet_window, clock, on_expire)?;
        Ok(Self {
            monitored: cfg
                .monitored_localities
                .iter()
                .map(|t| bulletin::normalize(t))
                .collect(),
            seen: HashSet::new(),
            timers,
            notifier,
            source,
        })
    }

    pub fn timers(&self) -> &TimerRegistry {
        &self.timers
    }

    pub fn handle(&mut self, event: BulletinEvent) -> Handled {
        if !self.seen.insert(event.id) {
            info!(
                "[RECEIVED] #{} from {} skipped (already processed)",
                event.id, event.path
            );
            return Handled::Duplicate;
        }

        info!(
            "[RECEIVED] #{} from {} at {} :: {}",
            event.id,
            event.path,
            event.observed_at.to_rfc3339(),
            format_preview(&event.text, 140)
        );

        let kind = bulletin::classify(&event.text);
        if kind == BulletinKind::UpcomingWarning {
            info!("[FILTER] #{} skipped (upcoming-warning bulletin)", event.id);
            return Handled::Ignored;
        }

        let localities = bulletin::extract_localities(&event.text, kind);
        let outcome = matcher::match_localities(kind, &localities, &self.monitored);
        info!(
            "[PARSE] #{} extracted {} town(s): {}",
            event.id,
            outcome.alerted.len(),
            if outcome.alerted.is_empty() {
                "none".to_string()
            } else {
                outcome.alerted.join(", ")
            }
        );
        info!("[TYPE] #{} classified as {kind}", event.id);

        if outcome.is_empty() {
            info!("[MATCH] #{} no monitored towns matched", event.id);
            return Handled::Unmatched;
        }

        let summary = outcome
            .matches
            .iter()
            .map(|m| format!("{} <= [{}]", m.monitored, m.sub_areas.join(", ")))
            .collect::<Vec<_>>()
            .join(" | ");
        info!("[MATCH] #{} monitored match(es): {summary}", event.id);

        let link = self.source.message_link(event.id);

        if kind == BulletinKind::StandDown {
            for m in &outcome.matches {
                self.timers.clear(&m.monitored, "official stand-down update");
                let text = build_stand_down_message(&m.monitored, link.as_deref());
                self.notifier
                    .dispatch("NOTIFY_IMMEDIATE", m.monitored.clone(), text);
            }
            return Handled::StoodDown(outcome.matches.len());
        }

        let count = outcome.matches.len();
        for m in outcome.matches {
            let meta = AlertMeta {
                message_id: event.id,
                link: link.clone(),
            };
            self.timers
                .upsert(&m.monitored, m.sub_areas, event.observed_at, meta);
        }
        Handled::Armed(count)
    }

    /// Consume events until every producer has hung up.
    pub async fn run(mut self, mut rx: mpsc::Receiver<BulletinEvent>) {
        while let Some(event) = rx.recv().await {
            self.handle(event);
        }
        warn!("All delivery paths closed; pipeline stopping.");
        self.timers.clear_all();
    }
}

// ───────────────────────────── Status ────────────────────────────────────

/// One-line summary of pending timers, `None` when nothing is pending.
pub fn status_line(pending: &[PendingStatus]) -> Option<String> {
    if pending.is_empty() {
        return None;
    }
    let summary = pending
        .iter()
        .map(|p| {
            format!(
                "{}: {}s left (until {}, alert at {} from: {})",
                p.locality,
                p.remaining.as_millis().div_ceil(1000),
                p.expires_at.to_rfc3339(),
                p.alert_at.to_rfc3339(),
                p.sub_areas.join(", ")
            )
        })
        .collect::<Vec<_>>()
        .join(" | ");
    Some(format!(
        "Pending notifications ({}) -> {summary}",
        pending.len()
    ))
}

/// Periodically log pending timers.
pub fn spawn_status_reporter(timers: TimerRegistry, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Some(line) = status_line(&timers.pending_statuses(timers.now())) {
                info!("[STATUS] {line}");
            }
        }
    })
}
