mod bot;
mod bulletin;
mod config;
mod matcher;
mod modes;
mod pipeline;
mod reconciler;
mod telegram;
mod timers;
mod transport;

use anyhow::Result;
use dotenvy::dotenv;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt().with_target(false).init();

    modes::run_from_env().await
}
