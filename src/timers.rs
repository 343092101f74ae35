//! Quiet-window timers: one debounce timer per monitored locality.
//!
//! A timer's deadline is `alert_at + window`, where `alert_at` is the
//! timestamp of the real-world alert, not the moment we processed it.  An
//! alert older than the one a timer already tracks is discarded, so a late
//! delivery can never stretch a window that is already counting down.
//!
//! All records live behind one mutex (alert traffic is one event per siren,
//! so a single serialization point is plenty).  Each record owns the tokio
//! task that sleeps until its deadline; superseding or clearing a record
//! aborts that task, and a task that wakes anyway only fires if its
//! generation is still the live one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Wall-clock source, swappable so tests can run on tokio's paused time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Context carried from the triggering bulletin to the notification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlertMeta {
    pub message_id: i64,
    pub link: Option<String>,
}

/// Immutable snapshot handed to the expiry handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expiry {
    pub alert_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub sub_areas: Vec<String>,
    pub meta: AlertMeta,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingStatus {
    pub locality: String,
    pub remaining: Duration,
    pub alert_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub sub_areas: Vec<String>,
}

/// What an [`TimerRegistry::upsert`] call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Started,
    Reset,
    /// A strictly newer alert is already tracked; nothing changed.
    SkippedOlder,
}

#[async_trait]
pub trait ExpiryHandler: Send + Sync {
    async fn on_expire(&self, locality: &str, expiry: &Expiry) -> Result<()>;
}

struct TimerRecord {
    generation: u64,
    alert_at: DateTime<Utc>,
    started_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    sub_areas: Vec<String>,
    meta: AlertMeta,
    task: JoinHandle<()>,
}

impl TimerRecord {
    fn snapshot(&self) -> Expiry {
        Expiry {
            alert_at: self.alert_at,
            expires_at: self.expires_at,
            sub_areas: self.sub_areas.clone(),
            meta: self.meta.clone(),
        }
    }
}

#[derive(Default)]
struct State {
    timers: HashMap<String, TimerRecord>,
    next_generation: u64,
}

struct Shared {
    window: TimeDelta,
    clock: Arc<dyn Clock>,
    handler: Arc<dyn ExpiryHandler>,
    state: Mutex<State>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Owner of every pending quiet-window timer.  Cheap to clone; clones share
/// the same records.
#[derive(Clone)]
pub struct TimerRegistry {
    shared: Arc<Shared>,
}

impl TimerRegistry {
    pub fn new(
        window: Duration,
        clock: Arc<dyn Clock>,
        handler: Arc<dyn ExpiryHandler>,
    ) -> Result<Self> {
        let window = TimeDelta::from_std(window).context("quiet window out of range")?;
        Ok(Self {
            shared: Arc::new(Shared {
                window,
                clock,
                handler,
                state: Mutex::new(State::default()),
            }),
        })
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.shared.clock.now()
    }

    /// Arm (or re-arm) the timer for `locality` from an alert observed at
    /// `alert_at`.  Must be called inside a tokio runtime.
    pub fn upsert(
        &self,
        locality: &str,
        sub_areas: Vec<String>,
        alert_at: DateTime<Utc>,
        meta: AlertMeta,
    ) -> Upsert {
        let now = self.shared.clock.now();
        let expires_at = alert_at
            .checked_add_signed(self.shared.window)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        // Negative means the window already passed: fire right away.
        let delay = (expires_at - now).to_std().unwrap_or(Duration::ZERO);

        let mut state = self.shared.lock();

        let outcome = match state.timers.get(locality) {
            Some(existing) if existing.alert_at > alert_at => {
                info!(
                    "[SKIP_OLD] {locality} alertAt={} older than tracked={}",
                    alert_at.to_rfc3339(),
                    existing.alert_at.to_rfc3339()
                );
                return Upsert::SkippedOlder;
            }
            Some(_) => Upsert::Reset,
            None => Upsert::Started,
        };

        if let Some(old) = state.timers.remove(locality) {
            old.task.abort();
        }

        state.next_generation += 1;
        let generation = state.next_generation;
        let task = tokio::spawn(fire_after(
            Arc::clone(&self.shared),
            locality.to_string(),
            generation,
            delay,
        ));

        let tag = if outcome == Upsert::Reset { "RESET" } else { "START" };
        info!(
            "[{tag}] {locality} ({}m) now={} alertAt={} expiresAt={} in={}s from alerts: {}",
            self.shared.window.num_minutes(),
            now.to_rfc3339(),
            alert_at.to_rfc3339(),
            expires_at.to_rfc3339(),
            delay.as_millis().div_ceil(1000),
            sub_areas.join(", ")
        );

        state.timers.insert(
            locality.to_string(),
            TimerRecord {
                generation,
                alert_at,
                started_at: now,
                expires_at,
                sub_areas,
                meta,
                task,
            },
        );

        outcome
    }

    /// Cancel and forget the timer for `locality`.  Returns whether one
    /// existed.
    pub fn clear(&self, locality: &str, reason: &str) -> bool {
        let Some(record) = self.shared.lock().timers.remove(locality) else {
            return false;
        };
        record.task.abort();
        if reason.is_empty() {
            info!("[CLEAR] {locality}");
        } else {
            info!(
                "[CLEAR] {locality} ({reason}) armed at {}",
                record.started_at.to_rfc3339()
            );
        }
        true
    }

    pub fn clear_all(&self) {
        let drained: Vec<TimerRecord> = {
            let mut state = self.shared.lock();
            state.timers.drain().map(|(_, r)| r).collect()
        };
        for record in &drained {
            record.task.abort();
        }
        if !drained.is_empty() {
            info!("[CLEAR] all ({} pending timer(s) cancelled)", drained.len());
        }
    }

    /// Every live timer, soonest expiry first.  Read-only.
    pub fn pending_statuses(&self, now: DateTime<Utc>) -> Vec<PendingStatus> {
        let mut pending: Vec<PendingStatus> = self
            .shared
            .lock()
            .timers
            .iter()
            .map(|(locality, r)| PendingStatus {
                locality: locality.clone(),
                remaining: (r.expires_at - now).to_std().unwrap_or(Duration::ZERO),
                alert_at: r.alert_at,
                expires_at: r.expires_at,
                sub_areas: r.sub_areas.clone(),
            })
            .collect();
        pending.sort_by_key(|p| p.remaining);
        pending
    }

    pub fn len(&self) -> usize {
        self.shared.lock().timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

async fn fire_after(shared: Arc<Shared>, locality: String, generation: u64, delay: Duration) {
    tokio::time::sleep(delay).await;

    let record = {
        let mut state = shared.lock();
        match state.timers.get(&locality) {
            Some(r) if r.generation == generation => state.timers.remove(&locality),
            _ => None,
        }
    };
    let Some(record) = record else {
        return;
    };

    let expiry = record.snapshot();
    info!(
        "[EXPIRE_TRIGGER] {locality} now={} scheduledExpiresAt={}",
        shared.clock.now().to_rfc3339(),
        expiry.expires_at.to_rfc3339()
    );

    match shared.handler.on_expire(&locality, &expiry).await {
        Ok(()) => info!("[EXPIRE] {locality} -> stand-down notification sent"),
        Err(e) => error!("[EXPIRE] {locality} -> notification failed: {e:#}"),
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{Recorder, VirtualClock};
    use super::*;
    use tokio::time::sleep;

    fn registry(window_ms: u64, recorder: &Arc<Recorder>) -> (TimerRegistry, Arc<VirtualClock>) {
        let clock = Arc::new(VirtualClock::new());
        let reg = TimerRegistry::new(
            Duration::from_millis(window_ms),
            clock.clone(),
            recorder.clone(),
        )
        .unwrap();
        (reg, clock)
    }

    fn ms(n: i64) -> TimeDelta {
        TimeDelta::milliseconds(n)
    }

    #[tokio::test(start_paused = true)]
    async fn expires_and_fires_once() {
        let rec = Arc::new(Recorder::default());
        let (reg, clock) = registry(30, &rec);

        assert_eq!(
            reg.upsert("עומר", vec![], clock.now(), AlertMeta::default()),
            Upsert::Started
        );
        sleep(Duration::from_millis(70)).await;

        assert_eq!(rec.localities(), vec!["עומר".to_string()]);
        assert!(reg.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn upsert_resets_window() {
        let rec = Arc::new(Recorder::default());
        let (reg, clock) = registry(50, &rec);

        reg.upsert("באר שבע", vec![], clock.now(), AlertMeta::default());
        sleep(Duration::from_millis(30)).await;
        assert_eq!(
            reg.upsert("באר שבע", vec![], clock.now(), AlertMeta::default()),
            Upsert::Reset
        );
        sleep(Duration::from_millis(35)).await;

        // First deadline (50ms) has passed; the reset one (80ms) has not.
        assert!(rec.localities().is_empty());

        sleep(Duration::from_millis(30)).await;
        assert_eq!(rec.localities(), vec!["באר שבע".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn newer_alert_prevents_early_notification() {
        let rec = Arc::new(Recorder::default());
        let (reg, clock) = registry(200, &rec);

        // Almost expired already: would fire ~10ms from now.
        reg.upsert("עומר", vec!["עומר".into()], clock.now() - ms(190), AlertMeta::default());
        sleep(Duration::from_millis(5)).await;
        reg.upsert("עומר", vec!["עומר".into()], clock.now(), AlertMeta::default());

        sleep(Duration::from_millis(40)).await;
        assert!(rec.localities().is_empty());

        sleep(Duration::from_millis(190)).await;
        assert_eq!(rec.localities(), vec!["עומר".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_all_cancels_everything() {
        let rec = Arc::new(Recorder::default());
        let (reg, clock) = registry(40, &rec);

        reg.upsert("עומר", vec![], clock.now(), AlertMeta::default());
        reg.upsert("באר שבע", vec![], clock.now(), AlertMeta::default());
        reg.clear_all();
        sleep(Duration::from_millis(70)).await;

        assert!(rec.localities().is_empty());
        assert!(reg.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_tracks_alert_time_not_processing_time() {
        let rec = Arc::new(Recorder::default());
        let (reg, clock) = registry(120, &rec);

        let old = clock.now() - ms(1_000);
        reg.upsert("עומר", vec!["עומר".into()], old, AlertMeta::default());

        let statuses = reg.pending_statuses(clock.now());
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].alert_at, old);
        assert_eq!(statuses[0].expires_at, old + ms(120));
        assert_eq!(statuses[0].remaining, Duration::ZERO);

        reg.clear_all();
    }

    #[tokio::test(start_paused = true)]
    async fn older_out_of_order_alert_is_discarded() {
        let rec = Arc::new(Recorder::default());
        let (reg, clock) = registry(90, &rec);

        let newer = clock.now();
        reg.upsert("באר שבע", vec!["באר שבע - דרום".into()], newer, AlertMeta::default());

        sleep(Duration::from_millis(10)).await;
        let older = newer - TimeDelta::seconds(60);
        assert_eq!(
            reg.upsert("באר שבע", vec!["באר שבע - מערב".into()], older, AlertMeta::default()),
            Upsert::SkippedOlder
        );

        let statuses = reg.pending_statuses(clock.now());
        assert_eq!(statuses[0].alert_at, newer);
        assert_eq!(statuses[0].sub_areas, vec!["באר שבע - דרום".to_string()]);

        sleep(Duration::from_millis(110)).await;
        let fired = rec.fired.lock().unwrap().clone();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].1.sub_areas, vec!["באר שבע - דרום".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn equal_timestamp_replaces_record() {
        let rec = Arc::new(Recorder::default());
        let (reg, clock) = registry(1_000, &rec);

        let at = clock.now();
        reg.upsert("עומר", vec!["a".into()], at, AlertMeta::default());
        let meta = AlertMeta {
            message_id: 7,
            link: Some("https://t.me/x/7".into()),
        };
        assert_eq!(reg.upsert("עומר", vec!["b".into()], at, meta), Upsert::Reset);
        assert_eq!(reg.pending_statuses(at)[0].sub_areas, vec!["b".to_string()]);

        sleep(Duration::from_millis(1_100)).await;
        let fired = rec.fired.lock().unwrap().clone();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].1.meta.message_id, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn already_expired_alert_fires_promptly() {
        let rec = Arc::new(Recorder::default());
        let (reg, clock) = registry(120, &rec);

        reg.upsert("עומר", vec!["עומר".into()], clock.now() - ms(1_000), AlertMeta::default());
        sleep(Duration::from_millis(5)).await;

        assert_eq!(rec.localities(), vec!["עומר".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn pending_statuses_report_remaining_time() {
        let rec = Arc::new(Recorder::default());
        let (reg, clock) = registry(1_000, &rec);

        let base = clock.now();
        reg.upsert("עומר", vec!["עומר".into()], base, AlertMeta::default());
        reg.upsert("להב", vec!["להב".into()], base - ms(500), AlertMeta::default());

        let statuses = reg.pending_statuses(base + ms(400));
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].locality, "להב");
        assert_eq!(statuses[0].remaining, Duration::from_millis(100));
        assert_eq!(statuses[1].locality, "עומר");
        assert_eq!(statuses[1].remaining, Duration::from_millis(600));

        // Read-only.
        assert_eq!(reg.len(), 2);
        reg.clear_all();
    }

    #[tokio::test(start_paused = true)]
    async fn pending_statuses_empty_without_timers() {
        let rec = Arc::new(Recorder::default());
        let (reg, clock) = registry(1_000, &rec);
        assert!(reg.pending_statuses(clock.now()).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn clear_removes_only_requested_locality() {
        let rec = Arc::new(Recorder::default());
        let (reg, clock) = registry(1_000, &rec);

        reg.upsert("עומר", vec!["עומר".into()], clock.now(), AlertMeta::default());
        reg.upsert("באר שבע", vec!["באר שבע - דרום".into()], clock.now(), AlertMeta::default());

        assert!(reg.clear("עומר", "test"));
        assert!(!reg.clear("עומר", "test"));

        let pending = reg.pending_statuses(clock.now());
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].locality, "באר שבע");

        sleep(Duration::from_millis(1_100)).await;
        assert_eq!(rec.localities(), vec!["באר שבע".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn handler_failure_is_isolated() {
        let rec = Arc::new(Recorder {
            fail_for: Some("עומר".into()),
            ..Recorder::default()
        });
        let (reg, clock) = registry(50, &rec);

        reg.upsert("עומר", vec![], clock.now(), AlertMeta::default());
        reg.upsert("להב", vec![], clock.now() + ms(10), AlertMeta::default());
        sleep(Duration::from_millis(100)).await;

        assert_eq!(rec.localities(), vec!["עומר".to_string(), "להב".to_string()]);
        assert!(reg.is_empty());

        // Registry still usable afterwards.
        reg.upsert("עומר", vec![], clock.now(), AlertMeta::default());
        assert_eq!(reg.len(), 1);
        reg.clear_all();
    }
}
