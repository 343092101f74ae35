//! Cursor-based differential pull, reconciled with push delivery.
//!
//! Push delivery is best-effort and may miss posts; the pull loop asks the
//! server for everything since the last cursor every few seconds and
//! forwards what it finds into the same channel the push path feeds.  The
//! consumer de-duplicates by message id, so both paths may deliver the same
//! post.
//!
//! ```text
//!  Uninitialized ──forced pull──► Synced ──TooLong w/o cursor──► Resyncing
//!        ▲  │ (fails: retry next cycle)  ▲                          │
//!        └──┘                            └────────forced pull───────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{MissedTickBehavior, timeout};
use tracing::{debug, error, info, warn};

use crate::transport::{
    BulletinEvent, ChannelSource, DeliveryPath, Difference, DifferenceKind, RawMessage,
    format_preview,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// No base cursor yet.
    Uninitialized,
    Synced,
    /// Server could not diff and gave no usable cursor; next pull is forced.
    Resyncing,
}

pub struct Reconciler {
    source: Arc<dyn ChannelSource>,
    cursor: i64,
    state: SyncState,
    pull_timeout: Duration,
}

impl Reconciler {
    pub fn new(source: Arc<dyn ChannelSource>, pull_timeout: Duration) -> Self {
        Self {
            source,
            cursor: 0,
            state: SyncState::Uninitialized,
            pull_timeout,
        }
    }

    pub fn cursor(&self) -> i64 {
        self.cursor
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    /// Forced pull for a fresh base cursor.  Whatever messages come back are
    /// dropped: a forced response means "gap too long", not "new".
    pub async fn initialize(&mut self) -> bool {
        let base = self.cursor.max(1);
        let diff = match timeout(self.pull_timeout, self.source.pull_difference(base, true)).await {
            Ok(Ok(diff)) => diff,
            Ok(Err(e)) => {
                warn!("[DIFF] Forced getChannelDifference failed: {e:#}");
                return false;
            }
            Err(_) => {
                warn!(
                    "[DIFF] Forced getChannelDifference timed out after {}s",
                    self.pull_timeout.as_secs()
                );
                return false;
            }
        };

        match diff.cursor.filter(|c| *c > 0) {
            Some(cursor) => {
                self.advance(cursor);
                self.state = SyncState::Synced;
                info!(
                    "[DIFF] Forced getChannelDifference -> {}, pts={}, server timeout={}s",
                    diff.kind,
                    self.cursor,
                    diff.timeout.as_secs()
                );
                true
            }
            None => {
                warn!("[DIFF] Forced getChannelDifference -> {} without pts", diff.kind);
                false
            }
        }
    }

    fn advance(&mut self, cursor: i64) -> bool {
        if cursor > self.cursor {
            self.cursor = cursor;
            true
        } else {
            false
        }
    }

    /// Fold one pull response into the cursor and return the messages to
    /// deliver, oldest id first.
    pub fn apply(&mut self, diff: Difference) -> Vec<RawMessage> {
        match diff.kind {
            DifferenceKind::Empty => {
                if let Some(cursor) = diff.cursor {
                    self.advance(cursor);
                }
                Vec::new()
            }
            DifferenceKind::TooLong => {
                match diff.cursor.filter(|c| *c > 0) {
                    Some(cursor) => {
                        self.advance(cursor);
                        self.state = SyncState::Synced;
                        info!("[DIFF] Received TooLong, re-synced pts={}", self.cursor);
                    }
                    None => {
                        self.state = SyncState::Resyncing;
                        warn!("[DIFF] Received TooLong without pts, forcing resync");
                    }
                }
                Vec::new()
            }
            DifferenceKind::Normal => {
                if let Some(cursor) = diff.cursor {
                    self.advance(cursor);
                }
                let mut messages = diff.messages;
                messages.retain(|m| !m.text.trim().is_empty());
                messages.sort_by_key(|m| m.id);
                if !messages.is_empty() {
                    info!(
                        "[DIFF] {} new message(s), pts now={}",
                        messages.len(),
                        self.cursor
                    );
                }
                messages
            }
        }
    }

    /// One pull cycle.  Failures are logged and leave the cursor alone; the
    /// next cycle simply tries again.
    pub async fn pull_cycle(&mut self) -> Vec<RawMessage> {
        if self.state != SyncState::Synced {
            self.initialize().await;
            return Vec::new();
        }

        let pulled = timeout(
            self.pull_timeout,
            self.source.pull_difference(self.cursor, false),
        )
        .await;

        match pulled {
            Ok(Ok(diff)) => {
                debug!(
                    "[DIFF] {} pts={:?} timeout={}s",
                    diff.kind,
                    diff.cursor,
                    diff.timeout.as_secs()
                );
                self.apply(diff)
            }
            Ok(Err(e)) => {
                error!("[DIFF] getChannelDifference failed: {e:#}");
                Vec::new()
            }
            Err(_) => {
                error!(
                    "[DIFF] getChannelDifference timed out after {}s",
                    self.pull_timeout.as_secs()
                );
                Vec::new()
            }
        }
    }

    /// Pull every `every` until the consumer goes away.  Cycles never
    /// overlap: a tick that lands while a pull is in flight is skipped.
    pub async fn run(mut self, every: Duration, tx: mpsc::Sender<BulletinEvent>) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // First tick completes immediately; start one period from now.
        ticker.tick().await;

        info!(
            "[DIFF] Started diff loop every {}s, pts={}",
            every.as_secs(),
            self.cursor
        );

        loop {
            ticker.tick().await;
            for msg in self.pull_cycle().await {
                info!(
                    "[DIFF] Message #{} date={} chars={} preview=\"{}\"",
                    msg.id,
                    msg.date.to_rfc3339(),
                    msg.text.chars().count(),
                    format_preview(&msg.text, 140)
                );
                let event = BulletinEvent::from_raw(msg, DeliveryPath::Pull);
                if tx.send(event).await.is_err() {
                    warn!("[DIFF] Consumer closed, stopping diff loop");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Difference, RawMessage};
    use anyhow::{Result, anyhow};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    enum Scripted {
        Reply(Difference),
        Fail,
        Hang,
    }

    #[derive(Default)]
    struct FakeSource {
        script: Mutex<VecDeque<Scripted>>,
        calls: Mutex<Vec<(i64, bool)>>,
    }

    impl FakeSource {
        fn with(script: Vec<Scripted>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: Mutex::default(),
            })
        }

        fn calls(&self) -> Vec<(i64, bool)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChannelSource for FakeSource {
        async fn pull_difference(&self, cursor: i64, force: bool) -> Result<Difference> {
            self.calls.lock().unwrap().push((cursor, force));
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(Scripted::Reply(diff)) => Ok(diff),
                Some(Scripted::Fail) => Err(anyhow!("RPC_CALL_FAIL")),
                Some(Scripted::Hang) => std::future::pending().await,
                None => Ok(Difference::empty(0)),
            }
        }

        async fn fetch_recent(&self, _window: Duration) -> Result<Vec<RawMessage>> {
            Ok(Vec::new())
        }
    }

    fn msg(id: i64, text: &str) -> RawMessage {
        RawMessage {
            id,
            text: text.to_string(),
            date: Utc.timestamp_opt(1_709_000_000 + id, 0).unwrap(),
        }
    }

    fn reconciler(source: &Arc<FakeSource>) -> Reconciler {
        Reconciler::new(source.clone(), Duration::from_secs(20))
    }

    #[tokio::test]
    async fn initial_forced_pull_adopts_cursor_without_delivering() {
        let mut too_long = Difference::too_long(Some(21843));
        too_long.messages = vec![msg(100, "recent but not new")];
        let source = FakeSource::with(vec![Scripted::Reply(too_long)]);
        let mut rec = reconciler(&source);

        assert!(rec.initialize().await);
        assert_eq!(rec.cursor(), 21843);
        assert_eq!(rec.state(), SyncState::Synced);
        assert_eq!(source.calls(), vec![(1, true)]);
    }

    #[tokio::test]
    async fn empty_response_never_moves_cursor_backward() {
        let source = FakeSource::with(vec![
            Scripted::Reply(Difference::empty(500)),
            Scripted::Reply(Difference::empty(400)),
            Scripted::Reply(Difference::empty(500)),
        ]);
        let mut rec = reconciler(&source);
        rec.initialize().await;
        assert_eq!(rec.cursor(), 500);

        assert!(rec.pull_cycle().await.is_empty());
        assert_eq!(rec.cursor(), 500);
        assert!(rec.pull_cycle().await.is_empty());
        assert_eq!(rec.cursor(), 500);
    }

    #[tokio::test]
    async fn empty_response_advances_cursor() {
        let mut rec = reconciler(&FakeSource::with(vec![]));
        rec.apply(Difference::empty(42));
        assert_eq!(rec.cursor(), 42);
    }

    #[tokio::test]
    async fn normal_response_is_delivered_in_id_order() {
        let source = FakeSource::with(vec![
            Scripted::Reply(Difference::too_long(Some(21843))),
            Scripted::Reply(Difference::normal(
                21845,
                vec![msg(21731, "second"), msg(21730, "first")],
            )),
        ]);
        let mut rec = reconciler(&source);
        rec.initialize().await;

        let delivered = rec.pull_cycle().await;
        let ids: Vec<i64> = delivered.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![21730, 21731]);
        assert_eq!(rec.cursor(), 21845);
        assert_eq!(source.calls(), vec![(1, true), (21843, false)]);
    }

    #[tokio::test]
    async fn normal_response_drops_textless_messages() {
        let mut rec = reconciler(&FakeSource::with(vec![]));
        let delivered = rec.apply(Difference::normal(10, vec![msg(2, "  "), msg(1, "x")]));
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].id, 1);
    }

    #[tokio::test]
    async fn too_long_mid_stream_resyncs_without_messages() {
        let mut rec = reconciler(&FakeSource::with(vec![]));
        rec.apply(Difference::empty(100));

        let mut too_long = Difference::too_long(Some(50_000));
        too_long.messages = vec![msg(1, "already handled elsewhere")];
        assert!(rec.apply(too_long).is_empty());
        assert_eq!(rec.cursor(), 50_000);
    }

    #[tokio::test]
    async fn too_long_without_cursor_forces_next_pull() {
        let source = FakeSource::with(vec![
            Scripted::Reply(Difference::empty(300)),
            Scripted::Reply(Difference::too_long(None)),
            Scripted::Reply(Difference::too_long(Some(900))),
            Scripted::Reply(Difference::empty(900)),
        ]);
        let mut rec = reconciler(&source);
        rec.initialize().await;

        rec.pull_cycle().await;
        assert_eq!(rec.state(), SyncState::Resyncing);
        assert_eq!(rec.cursor(), 300);

        rec.pull_cycle().await;
        assert_eq!(rec.state(), SyncState::Synced);
        assert_eq!(rec.cursor(), 900);

        rec.pull_cycle().await;
        assert_eq!(
            source.calls(),
            vec![(1, true), (300, false), (300, true), (900, false)]
        );
    }

    #[tokio::test]
    async fn pull_failure_keeps_cursor_and_retries() {
        let source = FakeSource::with(vec![
            Scripted::Reply(Difference::empty(700)),
            Scripted::Fail,
            Scripted::Reply(Difference::normal(701, vec![msg(5, "alert")])),
        ]);
        let mut rec = reconciler(&source);
        rec.initialize().await;

        assert!(rec.pull_cycle().await.is_empty());
        assert_eq!(rec.cursor(), 700);

        assert_eq!(rec.pull_cycle().await.len(), 1);
        assert_eq!(rec.cursor(), 701);
        assert_eq!(
            source.calls(),
            vec![(1, true), (700, false), (700, false)]
        );
    }

    #[tokio::test]
    async fn failed_initial_pull_is_retried_by_next_cycle() {
        let source = FakeSource::with(vec![
            Scripted::Fail,
            Scripted::Reply(Difference::too_long(Some(12))),
        ]);
        let mut rec = reconciler(&source);

        assert!(!rec.initialize().await);
        assert_eq!(rec.state(), SyncState::Uninitialized);

        assert!(rec.pull_cycle().await.is_empty());
        assert_eq!(rec.state(), SyncState::Synced);
        assert_eq!(rec.cursor(), 12);
        assert_eq!(source.calls(), vec![(1, true), (1, true)]);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_pull_times_out() {
        let source = FakeSource::with(vec![
            Scripted::Reply(Difference::empty(10)),
            Scripted::Hang,
            Scripted::Reply(Difference::empty(11)),
        ]);
        let mut rec = reconciler(&source);
        rec.initialize().await;

        assert!(rec.pull_cycle().await.is_empty());
        assert_eq!(rec.cursor(), 10);

        rec.pull_cycle().await;
        assert_eq!(rec.cursor(), 11);
    }

    #[tokio::test(start_paused = true)]
    async fn run_loop_forwards_pulled_messages() {
        let source = FakeSource::with(vec![
            Scripted::Reply(Difference::empty(1)),
            Scripted::Reply(Difference::normal(3, vec![msg(9, "b"), msg(8, "a")])),
        ]);
        let mut rec = reconciler(&source);
        rec.initialize().await;

        let (tx, mut rx) = mpsc::channel(16);
        let handle = tokio::spawn(rec.run(Duration::from_secs(5), tx));

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!((first.id, second.id), (8, 9));
        assert_eq!(first.path, DeliveryPath::Pull);

        drop(rx);
        handle.abort();
    }
}
