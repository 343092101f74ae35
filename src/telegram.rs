//! grammers user-client side: login, source channel resolution, the pull
//! path (`updates.getChannelDifference`) and history reads.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use grammers_client::{Client, SignInError};
use grammers_mtsender::SenderPool;
use grammers_session::storages::SqliteSession;
use grammers_tl_types as tl;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{self, AsyncBufReadExt};
use tracing::{info, warn};

use crate::config::{self, must_env};
use crate::transport::{
    ChannelSource, Difference, RawMessage, format_preview, message_date, timeout_hint,
};

/// Max messages per difference page.
const DIFF_LIMIT: i32 = 100;

#[derive(Clone)]
pub struct TgCfg {
    pub api_id: i32,
    pub api_hash: String,
    pub phone: String,
    pub two_fa_password: Option<String>,
    pub session_path: String,
    /// Normalized `@username` of the bulletin channel.
    pub source_channel: String,
}

impl TgCfg {
    pub fn username(&self) -> &str {
        self.source_channel.trim_start_matches('@')
    }
}

pub fn load_tg_cfg() -> Result<TgCfg> {
    Ok(TgCfg {
        api_id: config::parse_api_id(&must_env("TG_API_ID")?)?,
        api_hash: must_env("TG_API_HASH")?,
        phone: must_env("TG_PHONE")?,
        two_fa_password: std::env::var("TG_2FA_PASSWORD").ok(),
        session_path: std::env::var("TG_SESSION_PATH")
            .unwrap_or_else(|_| "./telegram.session.sqlite".into()),
        source_channel: config::normalize_source_channel(&must_env("SOURCE_CHANNEL")?)?,
    })
}

pub fn connect(cfg: &TgCfg) -> Result<(Client, SenderPool)> {
    let session = Arc::new(SqliteSession::open(&cfg.session_path)?);
    let pool = SenderPool::new(Arc::clone(&session), cfg.api_id);
    let client = Client::new(&pool);
    Ok((client, pool))
}

pub async fn ensure_user_login(client: &Client, cfg: &TgCfg) -> Result<()> {
    if client.is_authorized().await? {
        return Ok(());
    }

    info!("Not authorized. Requesting login code...");
    let token = client
        .request_login_code(&cfg.phone, &cfg.api_hash)
        .await
        .context("request_login_code failed")?;

    let code = read_line("Enter the login code you received: ").await?;

    match client.sign_in(&token, &code).await {
        Ok(user) => {
            info!(
                "Signed in as {:?}",
                user.first_name().unwrap_or("<unknown>")
            );
            Ok(())
        }
        Err(SignInError::PasswordRequired(password_token)) => {
            let pw = if let Some(pw) = &cfg.two_fa_password {
                pw.clone()
            } else {
                let hint = password_token.hint().unwrap_or("");
                read_line(&format!(
                    "2FA password required (hint: {hint}). Enter password: "
                ))
                .await?
            };

            client
                .check_password(password_token, pw.as_bytes())
                .await
                .context("check_password failed")?;

            info!("Signed in with 2FA.");
            Ok(())
        }
        Err(e) => Err(anyhow!("sign_in failed: {e}")),
    }
}

async fn read_line(prompt: &str) -> Result<String> {
    print!("{prompt}");
    std::io::stdout().flush().ok();
    let mut line = String::new();
    let mut stdin = io::BufReader::new(io::stdin());
    stdin.read_line(&mut line).await?;
    Ok(line.trim().to_string())
}

// ───────────────────────────── Permalinks ────────────────────────────────

/// Identity of the source channel, enough to build message permalinks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceMeta {
    pub username: Option<String>,
    pub channel_id: i64,
}

impl SourceMeta {
    /// `https://t.me/<username>/<id>`, or the private `t.me/c/..` form when
    /// the channel has no public username.  Ids below 1 (recorded posts
    /// without a channel id) have no permalink.
    pub fn message_link(&self, message_id: i64) -> Option<String> {
        if message_id <= 0 {
            return None;
        }
        if let Some(name) = self
            .username
            .as_deref()
            .map(|u| u.trim().trim_start_matches('@'))
            .filter(|u| !u.is_empty())
        {
            return Some(format!("https://t.me/{name}/{message_id}"));
        }
        if self.channel_id == 0 {
            return None;
        }
        let raw = self.channel_id.to_string();
        let bare = raw.strip_prefix("-100").unwrap_or(&raw);
        Some(format!("https://t.me/c/{bare}/{message_id}"))
    }
}

// ───────────────────────────── Channel source ────────────────────────────

/// Pull side of the source channel over the user session.
pub struct TelegramSource {
    client: Client,
    username: String,
    channel: tl::enums::InputChannel,
    meta: SourceMeta,
}

impl TelegramSource {
    /// Resolve `@username` to an input channel (id + access hash).
    pub async fn resolve(client: &Client, username: &str) -> Result<Self> {
        let username = username.trim_start_matches('@').to_string();
        let resolved = client
            .invoke(&tl::functions::contacts::ResolveUsername {
                username: username.clone(),
                referer: None,
            })
            .await
            .with_context(|| format!("Failed to resolve SOURCE_CHANNEL @{username}"))?;

        let tl::enums::contacts::ResolvedPeer::Peer(resolved) = resolved;
        let channel = resolved
            .chats
            .into_iter()
            .find_map(|chat| match chat {
                tl::enums::Chat::Channel(ch) => Some(ch),
                _ => None,
            })
            .ok_or_else(|| anyhow!("@{username} is not a channel"))?;

        let access_hash = channel
            .access_hash
            .ok_or_else(|| anyhow!("No access hash for @{username}; is the channel accessible?"))?;

        info!(
            "SOURCE_CHANNEL resolved -> id={} title=\"{}\" username=\"@{}\"",
            channel.id,
            channel.title,
            channel.username.as_deref().unwrap_or("n/a")
        );

        Ok(Self {
            client: client.clone(),
            meta: SourceMeta {
                username: channel.username.clone(),
                channel_id: channel.id,
            },
            channel: tl::enums::InputChannel::Channel(tl::types::InputChannel {
                channel_id: channel.id,
                access_hash,
            }),
            username,
        })
    }

    pub fn meta(&self) -> &SourceMeta {
        &self.meta
    }

    pub fn channel_id(&self) -> i64 {
        self.meta.channel_id
    }

    /// Newest-first history walk, stopping at `since` or after `max` texts.
    async fn history(
        &self,
        since: Option<DateTime<Utc>>,
        max: Option<usize>,
    ) -> Result<Vec<RawMessage>> {
        let peer = self
            .client
            .resolve_username(&self.username)
            .await
            .with_context(|| format!("resolve_username failed for @{}", self.username))?
            .ok_or_else(|| anyhow!("Username @{} was not resolved", self.username))?;

        let mut out = Vec::new();
        let mut iter = self.client.iter_messages(peer);
        while let Some(msg) = iter.next().await.context("iter_messages failed")? {
            let date = msg.date();
            if since.is_some_and(|since| date < since) {
                break;
            }
            let text = msg.text().trim();
            if text.is_empty() {
                continue;
            }
            out.push(RawMessage {
                id: i64::from(msg.id()),
                text: text.to_string(),
                date,
            });
            if max.is_some_and(|max| out.len() >= max) {
                break;
            }
        }
        Ok(out)
    }

    /// Log the latest few messages to prove the session can read the
    /// channel.  Failure is reported but not fatal.
    pub async fn probe_access(&self, count: usize) {
        match self.history(None, Some(count)).await {
            Ok(latest) if latest.is_empty() => {
                warn!("[PROBE] @{} returned no text messages", self.username)
            }
            Ok(latest) => {
                for msg in latest {
                    info!(
                        "[PROBE] id={} date={} text=\"{}\"",
                        msg.id,
                        msg.date.to_rfc3339(),
                        format_preview(&msg.text, 140)
                    );
                }
            }
            Err(e) => warn!("[PROBE] Could not read @{}: {e:#}", self.username),
        }
    }
}

#[async_trait]
impl ChannelSource for TelegramSource {
    async fn pull_difference(&self, cursor: i64, force: bool) -> Result<Difference> {
        let pts = i32::try_from(cursor).context("cursor out of range")?;
        let response = self
            .client
            .invoke(&tl::functions::updates::GetChannelDifference {
                force,
                channel: self.channel.clone(),
                filter: tl::enums::ChannelMessagesFilter::Empty,
                pts,
                limit: DIFF_LIMIT,
            })
            .await
            .context("updates.getChannelDifference failed")?;

        Ok(match response {
            tl::enums::updates::ChannelDifference::Empty(d) => Difference {
                timeout: timeout_hint(d.timeout.map(i64::from)),
                ..Difference::empty(i64::from(d.pts))
            },
            tl::enums::updates::ChannelDifference::TooLong(d) => {
                let cursor = match d.dialog {
                    tl::enums::Dialog::Dialog(dialog) => dialog.pts.map(i64::from),
                    _ => None,
                };
                Difference {
                    timeout: timeout_hint(d.timeout.map(i64::from)),
                    ..Difference::too_long(cursor)
                }
            }
            tl::enums::updates::ChannelDifference::Difference(d) => {
                let messages = d
                    .new_messages
                    .into_iter()
                    .filter_map(|m| match m {
                        tl::enums::Message::Message(m) => Some(RawMessage {
                            id: i64::from(m.id),
                            date: message_date(i64::from(m.date)),
                            text: m.message,
                        }),
                        _ => None,
                    })
                    .collect();
                Difference {
                    timeout: timeout_hint(d.timeout.map(i64::from)),
                    ..Difference::normal(i64::from(d.pts), messages)
                }
            }
        })
    }

    async fn fetch_recent(&self, window: Duration) -> Result<Vec<RawMessage>> {
        let window = chrono::TimeDelta::from_std(window).context("history window out of range")?;
        let mut recent = self.history(Some(Utc::now() - window), None).await?;
        recent.sort_by_key(|m| (m.date, m.id));
        Ok(recent)
    }
}
