mod dump;
mod live;
mod replay;
mod shared;

use anyhow::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunMode {
    Live,
    Dump,
    Replay,
}

impl RunMode {
    fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "dump" | "dump_recent" => Self::Dump,
            "replay" => Self::Replay,
            _ => Self::Live,
        }
    }

    fn from_env() -> Self {
        Self::parse(&std::env::var("RUN_MODE").unwrap_or_else(|_| "live".into()))
    }
}

pub async fn run_from_env() -> Result<()> {
    match RunMode::from_env() {
        RunMode::Live => live::run().await,
        RunMode::Dump => dump::run().await,
        RunMode::Replay => replay::run().await,
    }
}
