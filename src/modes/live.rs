use crate::bot::BotOutbox;
use crate::config::WatchCfg;
use crate::pipeline::{Pipeline, spawn_status_reporter};
use crate::reconciler::Reconciler;
use crate::telegram::{self, TelegramSource};
use crate::timers::SystemClock;
use crate::transport::{BulletinEvent, ChannelSource, DeliveryPath};
use anyhow::{Context, Result};
use grammers_client::Update;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Bound on events queued between the delivery paths and the pipeline.
const EVENT_QUEUE: usize = 2048;

/// Messages read back at startup to prove channel access.
const PROBE_COUNT: usize = 3;

pub(super) async fn run() -> Result<()> {
    let tg = telegram::load_tg_cfg()?;
    let watch = WatchCfg::from_env(true)?;
    let outbox = Arc::new(BotOutbox::from_env()?);

    let (client, pool) = telegram::connect(&tg)?;

    let runner = pool.runner;
    tokio::spawn(async move {
        runner.run().await;
    });

    let updates_rx = pool.updates;

    telegram::ensure_user_login(&client, &tg).await?;

    let source = Arc::new(TelegramSource::resolve(&client, tg.username()).await?);
    let channel_id = source.channel_id();
    info!(
        "Watching {} for {} town(s): {} | window={}m | targets={} | history={}",
        tg.source_channel,
        watch.monitored_localities.len(),
        watch.monitored_localities.join(", "),
        watch.quiet_minutes(),
        watch.destinations.join(", "),
        if watch.replay_on_start {
            format!("{}m", watch.replay_window.as_secs() / 60)
        } else {
            "off".to_string()
        }
    );
    source.probe_access(PROBE_COUNT).await;

    let pipeline = Pipeline::build(
        &watch,
        outbox,
        Arc::new(SystemClock),
        source.meta().clone(),
    )?;
    let status = spawn_status_reporter(pipeline.timers().clone(), watch.status_interval);

    let (tx, rx) = mpsc::channel(EVENT_QUEUE);
    let consumer = tokio::spawn(pipeline.run(rx));

    let puller = start_pull_path(source.clone(), &watch, &tx).await?;

    let mut stream = client.stream_updates(
        updates_rx,
        grammers_client::UpdatesConfiguration {
            catch_up: true,
            update_queue_limit: Some(EVENT_QUEUE),
        },
    );

    info!("Running in live mode. Waiting for new messages...");
    loop {
        let Ok(update) = stream.next().await else {
            warn!("Update stream ended.");
            break;
        };

        let Update::NewMessage(msg) = update else {
            continue;
        };
        let Ok(peer) = msg.peer() else {
            continue;
        };
        if peer.id().bare_id() != channel_id {
            continue;
        }
        let text = msg.text().trim();
        if text.is_empty() {
            debug!("[LIVE] #{} has no text; skipped", msg.id());
            continue;
        }

        let event = BulletinEvent {
            id: i64::from(msg.id()),
            text: text.to_string(),
            observed_at: msg.date(),
            path: DeliveryPath::Push,
        };
        if tx.send(event).await.is_err() {
            warn!("Pipeline stopped; leaving live loop.");
            break;
        }
    }

    // The diff loop holds its own sender and keeps delivering without push.
    drop(tx);
    if !puller.is_finished() {
        warn!("[LIVE] Push path stopped; continuing on the diff loop only");
    }
    puller.await.ok();
    warn!("[LIVE] Diff loop stopped; both delivery paths are down");
    status.abort();
    consumer.await.ok();

    Ok(())
}

/// Forced pull for the base cursor, then history, then the periodic diff
/// task.  History is queued after the base cursor exists and before the
/// diff loop starts, so it is handled ahead of anything pulled later.
async fn start_pull_path(
    source: Arc<dyn ChannelSource>,
    watch: &WatchCfg,
    tx: &mpsc::Sender<BulletinEvent>,
) -> Result<JoinHandle<()>> {
    let mut reconciler = Reconciler::new(source.clone(), watch.diff_timeout);
    if reconciler.initialize().await {
        info!("[DIFF] Base pts={}", reconciler.cursor());
    } else {
        warn!(
            "[DIFF] No base pts yet ({:?}); the diff loop keeps retrying",
            reconciler.state()
        );
    }

    if watch.replay_on_start {
        match source.fetch_recent(watch.replay_window).await {
            Ok(history) => {
                info!(
                    "[HISTORY] Replaying {} message(s) from the last {}m",
                    history.len(),
                    watch.replay_window.as_secs() / 60
                );
                for msg in history {
                    tx.send(BulletinEvent::from_raw(msg, DeliveryPath::History))
                        .await
                        .context("pipeline stopped during history replay")?;
                }
            }
            Err(e) => warn!("[HISTORY] Failed to fetch recent messages: {e:#}"),
        }
    }

    Ok(tokio::spawn(reconciler.run(watch.diff_interval, tx.clone())))
}
