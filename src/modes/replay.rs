use crate::bot::{BotOutbox, StdoutOutbox};
use crate::config::{self, WatchCfg};
use crate::pipeline::{Handled, Pipeline, spawn_status_reporter};
use crate::telegram::SourceMeta;
use crate::timers::SystemClock;
use crate::transport::{BulletinEvent, DeliveryPath, Outbox};
use anyhow::{Result, anyhow};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::shared::{load_records, load_replay_cfg, replay_delay};

/// Feed a recorded JSONL capture through the pipeline.
///
/// Quiet windows run on the wall clock, so every post counts as observed at
/// the moment it is replayed.  After the last post the run waits for the
/// pending windows to close so their notifications come out too.
pub(super) async fn run() -> Result<()> {
    let replay = load_replay_cfg()?;
    let records = load_records(&replay.input_path)?;
    if records.is_empty() {
        return Err(anyhow!("Replay input is empty: {}", replay.input_path));
    }

    let mut watch = WatchCfg::from_env(replay.broadcast)?;
    let outbox: Arc<dyn Outbox> = if replay.broadcast {
        info!("Replay broadcast enabled; notifications go to {:?}", watch.destinations);
        Arc::new(BotOutbox::from_env()?)
    } else {
        if watch.destinations.is_empty() {
            watch.destinations = vec!["stdout".into()];
        }
        Arc::new(StdoutOutbox)
    };

    let source = SourceMeta {
        username: std::env::var("SOURCE_CHANNEL")
            .ok()
            .and_then(|raw| config::normalize_source_channel(&raw).ok()),
        channel_id: 0,
    };

    let mut pipeline = Pipeline::build(&watch, outbox, Arc::new(SystemClock), source)?;
    let status = spawn_status_reporter(pipeline.timers().clone(), watch.status_interval);
    info!(
        "Replay started: {} messages from {} | towns: {}",
        records.len(),
        replay.input_path,
        watch.monitored_localities.join(", ")
    );

    let mut armed = 0usize;
    let mut stood_down = 0usize;
    let mut skipped = 0usize;

    for (idx, record) in records.iter().enumerate() {
        if idx > 0 {
            let delay = replay_delay(&replay, records[idx - 1].timestamp, record.timestamp);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }

        let mut event = BulletinEvent::from_raw(record.clone().into_raw(), DeliveryPath::Replay);
        event.observed_at = pipeline.timers().now();
        match pipeline.handle(event) {
            Handled::Armed(n) => armed += n,
            Handled::StoodDown(n) => stood_down += n,
            Handled::Duplicate | Handled::Ignored | Handled::Unmatched => skipped += 1,
        }
    }

    info!(
        "Replay fed: total={}, timers_armed={}, stand_downs={}, skipped={}",
        records.len(),
        armed,
        stood_down,
        skipped
    );

    while !pipeline.timers().is_empty() {
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    // Expired timers leave the registry before their notification is sent.
    tokio::time::sleep(Duration::from_secs(2)).await;
    status.abort();

    info!("Replay complete.");
    Ok(())
}
