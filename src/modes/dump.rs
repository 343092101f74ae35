use crate::telegram::{self, TelegramSource};
use crate::transport::ChannelSource;
use anyhow::Result;
use std::time::Duration;
use tracing::info;

use super::shared::{DumpRecord, load_dump_cfg, write_records};

/// Write the source channel's recent posts as replayable JSONL.
pub(super) async fn run() -> Result<()> {
    let tg = telegram::load_tg_cfg()?;
    let dump = load_dump_cfg()?;

    let (client, pool) = telegram::connect(&tg)?;

    let runner = pool.runner;
    tokio::spawn(async move {
        runner.run().await;
    });

    telegram::ensure_user_login(&client, &tg).await?;

    let source = TelegramSource::resolve(&client, tg.username()).await?;
    info!(
        "Dumping {} messages from the last {} minute(s)",
        tg.source_channel, dump.minutes
    );

    let messages = source
        .fetch_recent(Duration::from_secs(dump.minutes.saturating_mul(60)))
        .await?;
    let records: Vec<DumpRecord> = messages.iter().map(DumpRecord::from).collect();
    write_records(&dump.output_path, &records)?;

    info!(
        "Dump complete: {} messages written to {}",
        records.len(),
        dump.output_path
    );

    Ok(())
}
