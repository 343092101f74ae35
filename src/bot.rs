//! Outbound notifications through the Telegram Bot API.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::must_env;
use crate::transport::Outbox;

const API_BASE: &str = "https://api.telegram.org";
const SEND_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Serialize)]
struct SendMessagePayload<'a> {
    /// Numeric id (as text) or `@channelusername`; the Bot API takes both.
    chat_id: &'a str,
    text: &'a str,
    disable_web_page_preview: bool,
}

#[derive(Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

pub struct BotOutbox {
    http: HttpClient,
    token: String,
}

impl BotOutbox {
    pub fn new(token: String) -> Result<Self> {
        let http = HttpClient::builder()
            .timeout(SEND_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { http, token })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(must_env("BOT_TOKEN")?)
    }

    fn method_url(&self, method: &str) -> String {
        format!("{API_BASE}/bot{}/{method}", self.token)
    }
}

#[async_trait]
impl Outbox for BotOutbox {
    async fn send(&self, text: &str, destination: &str) -> Result<()> {
        let body = SendMessagePayload {
            chat_id: destination,
            text,
            disable_web_page_preview: true,
        };
        let resp = self
            .http
            .post(self.method_url("sendMessage"))
            .json(&body)
            .send()
            .await
            .context("sendMessage request failed")?;

        let status = resp.status();
        let raw = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(anyhow!("sendMessage failed: {status} body={raw}"));
        }
        match serde_json::from_str::<ApiResponse>(&raw) {
            Ok(api) if !api.ok => Err(anyhow!(
                "sendMessage rejected: {}",
                api.description.unwrap_or_default()
            )),
            _ => Ok(()),
        }
    }
}

/// Prints notifications instead of sending them (replay dry runs).
pub struct StdoutOutbox;

#[async_trait]
impl Outbox for StdoutOutbox {
    async fn send(&self, text: &str, destination: &str) -> Result<()> {
        println!("\n[NOTIFICATION -> {destination}]\n{text}\n");
        Ok(())
    }
}
