use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use serde_json::Value;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::time::Duration;

use crate::config::{self, env_lookup, must_env};
use crate::transport::{RawMessage, coerce_int, message_date};

#[derive(Clone)]
pub(super) struct ReplayCfg {
    pub input_path: String,
    pub speed: f64,
    pub fixed_step_ms: Option<u64>,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub broadcast: bool,
}

#[derive(Clone)]
pub(super) struct DumpCfg {
    pub output_path: String,
    pub minutes: u64,
}

/// One recorded channel post.  `timestamp` is Unix seconds; ids and
/// timestamps are read leniently (see [`coerce_int`]) and millisecond
/// timestamps are brought down to seconds.  A record with no usable id
/// gets `-line`, which stays unique within the file and never collides
/// with a real (positive) message id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(super) struct DumpRecord {
    pub id: i64,
    pub timestamp: i64,
    pub text: String,
}

impl DumpRecord {
    fn from_value(value: &Value, line_no: usize) -> Result<Self> {
        let text = value
            .get("text")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("record has no text"))?;
        let id = value
            .get("id")
            .map(coerce_int)
            .filter(|id| *id > 0)
            .unwrap_or_else(|| -(line_no as i64));
        Ok(Self {
            id,
            timestamp: message_date(value.get("timestamp").map(coerce_int).unwrap_or(0))
                .timestamp(),
            text: text.to_string(),
        })
    }

    pub fn into_raw(self) -> RawMessage {
        RawMessage {
            id: self.id,
            date: message_date(self.timestamp),
            text: self.text,
        }
    }
}

impl From<&RawMessage> for DumpRecord {
    fn from(msg: &RawMessage) -> Self {
        Self {
            id: msg.id,
            timestamp: msg.date.timestamp(),
            text: msg.text.clone(),
        }
    }
}

pub(super) fn load_replay_cfg() -> Result<ReplayCfg> {
    let input_path = must_env("REPLAY_INPUT_PATH")?;
    let speed = std::env::var("REPLAY_SPEED")
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|v| *v > 0.0)
        .unwrap_or(1.0);
    let fixed_step_ms = std::env::var("REPLAY_STEP_MS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0);
    let min_delay_ms = std::env::var("REPLAY_MIN_DELAY_MS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);
    let max_delay_ms = std::env::var("REPLAY_MAX_DELAY_MS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(10_000);

    Ok(ReplayCfg {
        input_path,
        speed,
        fixed_step_ms,
        min_delay_ms,
        max_delay_ms: max_delay_ms.max(min_delay_ms),
        broadcast: config::bool_var(&env_lookup, "REPLAY_BROADCAST", false)?,
    })
}

pub(super) fn load_dump_cfg() -> Result<DumpCfg> {
    Ok(DumpCfg {
        output_path: std::env::var("DUMP_OUTPUT_PATH").unwrap_or_else(|_| "./dump.jsonl".into()),
        minutes: config::positive_int(&env_lookup, "DUMP_MINUTES", 60)?,
    })
}

/// Pause between two consecutive recorded posts.
pub(super) fn replay_delay(cfg: &ReplayCfg, prev_ts: i64, ts: i64) -> Duration {
    let delay_ms = if let Some(step_ms) = cfg.fixed_step_ms {
        step_ms
    } else {
        let delta_s = (ts - prev_ts).max(0) as f64;
        let scaled = (delta_s * 1000.0 / cfg.speed).round() as u64;
        scaled.clamp(cfg.min_delay_ms, cfg.max_delay_ms)
    };
    Duration::from_millis(delay_ms)
}

pub(super) fn parse_records(reader: impl BufRead) -> Result<Vec<DumpRecord>> {
    let mut records = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("failed to read line {}", idx + 1))?;
        if line.trim().is_empty() {
            continue;
        }
        let value: Value = serde_json::from_str(&line)
            .with_context(|| format!("invalid JSON at line {}", idx + 1))?;
        let record = DumpRecord::from_value(&value, idx + 1)
            .with_context(|| format!("invalid record at line {}", idx + 1))?;
        records.push(record);
    }

    records.sort_by_key(|r| (r.timestamp, r.id));
    Ok(records)
}

pub(super) fn load_records(path: &str) -> Result<Vec<DumpRecord>> {
    let file = File::open(path).with_context(|| format!("failed to open replay file {path}"))?;
    parse_records(BufReader::new(file))
}

pub(super) fn write_records(path: &str, records: &[DumpRecord]) -> Result<()> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for output dump file {path}")
            })?;
        }
    }

    let file =
        File::create(path).with_context(|| format!("failed to create output dump file {path}"))?;
    let mut writer = BufWriter::new(file);
    for record in records {
        let line = serde_json::to_string(record)?;
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::StdoutOutbox;
    use crate::config::WatchCfg;
    use crate::pipeline::{Handled, Pipeline};
    use crate::telegram::SourceMeta;
    use crate::timers::Clock;
    use crate::timers::test_support::VirtualClock;
    use crate::transport::{BulletinEvent, DeliveryPath};
    use std::sync::Arc;

    fn replay_cfg() -> ReplayCfg {
        ReplayCfg {
            input_path: String::new(),
            speed: 2.0,
            fixed_step_ms: None,
            min_delay_ms: 100,
            max_delay_ms: 10_000,
            broadcast: false,
        }
    }

    #[test]
    fn records_are_coerced_and_sorted() {
        let input = r#"
{"id": "21844", "timestamp": 1772276880, "text": "second"}

{"id": {"value": 21843}, "timestamp": 1772276400000, "text": "first"}
{"id": 21845.0, "timestamp": "1772277000", "text": "third", "extra": true}
"#;
        let records = parse_records(input.as_bytes()).unwrap();
        let ids: Vec<i64> = records.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![21843, 21844, 21845]);
        assert_eq!(records[0].timestamp, 1772276400);

        let first = records[0].clone().into_raw();
        assert_eq!(first.date.timestamp(), 1772276400);
        assert_eq!(first.text, "first");
    }

    #[test]
    fn bad_lines_name_their_position() {
        let err = parse_records("{\"id\":1,\"text\":\"a\"}\nnot json\n".as_bytes()).unwrap_err();
        assert!(err.to_string().contains("line 2"));

        let err = parse_records("{\"id\":1}\n".as_bytes()).unwrap_err();
        assert!(err.to_string().contains("line 1"));
    }

    #[tokio::test(start_paused = true)]
    async fn records_without_ids_are_not_deduplicated() {
        let input = concat!(
            r#"{"timestamp": 1772276400, "channel_id": 1441886157, "text": "עומר (דקה)"}"#,
            "\n",
            r#"{"timestamp": 1772276460, "id": 0, "text": "באר שבע (דקה)"}"#,
            "\n",
        );
        let records = parse_records(input.as_bytes()).unwrap();
        let ids: Vec<i64> = records.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![-1, -2]);

        let cfg = WatchCfg {
            monitored_localities: vec!["עומר".into(), "באר שבע".into()],
            destinations: vec!["stdout".into()],
            ..WatchCfg::default()
        };
        let clock = Arc::new(VirtualClock::new());
        let mut pipeline = Pipeline::build(
            &cfg,
            Arc::new(StdoutOutbox),
            clock.clone(),
            SourceMeta::default(),
        )
        .unwrap();

        let handled: Vec<Handled> = records
            .into_iter()
            .map(|record| {
                let mut event = BulletinEvent::from_raw(record.into_raw(), DeliveryPath::Replay);
                event.observed_at = clock.now();
                pipeline.handle(event)
            })
            .collect();
        assert_eq!(handled, vec![Handled::Armed(1), Handled::Armed(1)]);
        assert_eq!(pipeline.timers().len(), 2);
        pipeline.timers().clear_all();
    }

    #[test]
    fn delay_scales_and_clamps() {
        let cfg = replay_cfg();
        assert_eq!(replay_delay(&cfg, 0, 10), Duration::from_millis(5_000));
        assert_eq!(replay_delay(&cfg, 0, 0), Duration::from_millis(100));
        assert_eq!(replay_delay(&cfg, 10, 0), Duration::from_millis(100));
        assert_eq!(replay_delay(&cfg, 0, 3_600), Duration::from_millis(10_000));

        let stepped = ReplayCfg {
            fixed_step_ms: Some(250),
            ..cfg
        };
        assert_eq!(replay_delay(&stepped, 0, 3_600), Duration::from_millis(250));
    }

    #[test]
    fn record_from_message_round_trips_to_seconds() {
        let msg = RawMessage {
            id: 7,
            text: "עומר".into(),
            date: message_date(1772276400),
        };
        let record = DumpRecord::from(&msg);
        assert_eq!(record.timestamp, 1772276400);
        assert_eq!(
            serde_json::to_string(&record).unwrap(),
            r#"{"id":7,"timestamp":1772276400,"text":"עומר"}"#
        );
    }
}
