//! C6: fans each run's log/progress stream out to durable storage and to
//! live pub/sub subscribers, assigning the gap-free sequence number the
//! storage layer relies on (spec §4.6).

use chrono::Utc;
use engine_coordination::PubSub;
use engine_registry::{LogRecord, RunLogStore};
use engine_common::model::{RunId, SequenceNumber};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::warn;

/// One unit of work handed to the multiplexer. Carries everything a
/// `LogRecord` needs except the sequence number, which the mux assigns.
#[derive(Debug, Clone)]
pub enum MuxEvent {
    Log {
        severity: String,
        source: String,
        message: String,
        data: Option<Value>,
    },
    Progress {
        phase: String,
        fields: HashMap<String, Value>,
    },
    /// Signals the run has reached a terminal state: force-flushes any
    /// buffered records and ends the sink's run loop.
    Terminal,
}

/// Wire shape published to subscribers — carries the sequence number so a
/// late joiner can dedup against what it already fetched from storage
/// (spec §4.6 "Deduplication for subscribers").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishedEvent {
    pub run_id: RunId,
    pub sequence: SequenceNumber,
    pub severity: Option<String>,
    pub source: Option<String>,
    pub message: Option<String>,
    pub phase: Option<String>,
    pub fields: Option<HashMap<String, Value>>,
    pub data: Option<Value>,
    pub truncated: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MuxConfig {
    pub batch_size: usize,
    #[serde(with = "humantime_serde")]
    pub batch_interval: Duration,
    pub max_records_per_run: u64,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            batch_interval: Duration::from_millis(250),
            max_records_per_run: 100_000,
        }
    }
}

impl engine_common::SafeDisplay for MuxConfig {
    fn to_safe_string(&self) -> String {
        format!(
            "batch_size: {}, batch_interval: {:?}, max_records_per_run: {}",
            self.batch_size, self.batch_interval, self.max_records_per_run
        )
    }
}

pub fn channel_name(run_id: RunId) -> String {
    format!("run:{run_id}:events")
}

pub struct LogMultiplexer {
    log_store: Arc<RunLogStore>,
    pubsub: Arc<PubSub>,
    config: MuxConfig,
}

impl LogMultiplexer {
    pub fn new(log_store: Arc<RunLogStore>, pubsub: Arc<PubSub>, config: MuxConfig) -> Self {
        Self {
            log_store,
            pubsub,
            config,
        }
    }

    /// Starts a per-run sink: a dedicated task owning that run's sequence
    /// counter, so sequence assignment never races across events for the
    /// same run. Returns the sender side; dropping it (or sending
    /// `Terminal`) ends the task after a final flush.
    pub fn spawn_run_sink(&self, run_id: RunId) -> mpsc::Sender<MuxEvent> {
        let (tx, rx) = mpsc::channel(256);
        let log_store = Arc::clone(&self.log_store);
        let pubsub = Arc::clone(&self.pubsub);
        let config = self.config.clone();
        tokio::spawn(run_sink_loop(run_id, rx, log_store, pubsub, config));
        tx
    }
}

async fn run_sink_loop(
    run_id: RunId,
    mut rx: mpsc::Receiver<MuxEvent>,
    log_store: Arc<RunLogStore>,
    pubsub: Arc<PubSub>,
    config: MuxConfig,
) {
    // `Progress` events are published live but never persisted, so they must
    // not consume a slot in the persisted sequence — otherwise `run_logs`
    // would show gaps for every run that emits progress updates. Publish
    // order (what subscribers see on the wire) and log order (what lands in
    // `run_logs.sequence`) are tracked separately.
    let mut next_publish_sequence = SequenceNumber::FIRST;
    let mut next_log_sequence = SequenceNumber::FIRST;
    let mut buffer: Vec<LogRecord> = Vec::with_capacity(config.batch_size);
    let mut total_emitted: u64 = 0;
    let mut truncated = false;
    let channel = channel_name(run_id);

    let mut ticker = tokio::time::interval(config.batch_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Some(MuxEvent::Terminal) | None => {
                        flush(&log_store, &mut buffer, run_id).await;
                        return;
                    }
                    Some(event) => {
                        if truncated {
                            continue;
                        }
                        if total_emitted >= config.max_records_per_run {
                            truncated = true;
                            warn!(%run_id, total_emitted, "run log stream truncated: per-run record limit reached");
                            let publish_sequence = next_publish_sequence;
                            next_publish_sequence = next_publish_sequence.next();
                            let log_sequence = next_log_sequence;
                            next_log_sequence = next_log_sequence.next();

                            let marker = PublishedEvent {
                                run_id,
                                sequence: publish_sequence,
                                severity: Some("warn".to_string()),
                                source: Some("mux".to_string()),
                                message: Some(format!(
                                    "log stream truncated after {total_emitted} records"
                                )),
                                phase: None,
                                fields: None,
                                data: None,
                                truncated: true,
                            };
                            publish(&pubsub, &channel, &marker).await;
                            buffer.push(LogRecord {
                                run_id,
                                sequence: log_sequence,
                                severity: "warn".to_string(),
                                source: "mux".to_string(),
                                message: marker.message.clone().unwrap_or_default(),
                                data: None,
                                recorded_at: Utc::now(),
                            });
                            continue;
                        }

                        let publish_sequence = next_publish_sequence;
                        next_publish_sequence = next_publish_sequence.next();
                        total_emitted += 1;

                        let published = to_published(run_id, publish_sequence, &event);
                        publish(&pubsub, &channel, &published).await;

                        if let Some(record) = to_log_record(run_id, next_log_sequence, event) {
                            next_log_sequence = next_log_sequence.next();
                            buffer.push(record);
                            if buffer.len() >= config.batch_size {
                                flush(&log_store, &mut buffer, run_id).await;
                            }
                        }
                    }
                }
            }
            _ = ticker.tick() => {
                if !buffer.is_empty() {
                    flush(&log_store, &mut buffer, run_id).await;
                }
            }
        }
    }
}

fn to_published(run_id: RunId, sequence: SequenceNumber, event: &MuxEvent) -> PublishedEvent {
    match event {
        MuxEvent::Log { severity, source, message, data } => PublishedEvent {
            run_id,
            sequence,
            severity: Some(severity.clone()),
            source: Some(source.clone()),
            message: Some(message.clone()),
            phase: None,
            fields: None,
            data: data.clone(),
            truncated: false,
        },
        MuxEvent::Progress { phase, fields } => PublishedEvent {
            run_id,
            sequence,
            severity: None,
            source: None,
            message: None,
            phase: Some(phase.clone()),
            fields: Some(fields.clone()),
            data: None,
            truncated: false,
        },
        MuxEvent::Terminal => unreachable!("Terminal never reaches to_published"),
    }
}

/// Progress events are fanned out live but not persisted as log rows — only
/// `Log` events occupy the durable, sequence-keyed table (spec §4.6).
fn to_log_record(run_id: RunId, sequence: SequenceNumber, event: MuxEvent) -> Option<LogRecord> {
    match event {
        MuxEvent::Log { severity, source, message, data } => Some(LogRecord {
            run_id,
            sequence,
            severity,
            source,
            message,
            data,
            recorded_at: Utc::now(),
        }),
        MuxEvent::Progress { .. } | MuxEvent::Terminal => None,
    }
}

/// Best-effort: publish failures never block persistence (spec §4.6
/// "backpressure drops pub/sub before it drops persistence").
async fn publish(pubsub: &PubSub, channel: &str, event: &PublishedEvent) {
    if let Ok(bytes) = serde_json::to_vec(event) {
        if let Err(err) = pubsub.publish(channel, bytes).await {
            warn!(%err, channel, "pub/sub fanout dropped");
        }
    }
}

async fn flush(log_store: &RunLogStore, buffer: &mut Vec<LogRecord>, run_id: RunId) {
    if buffer.is_empty() {
        return;
    }
    if let Err(err) = log_store.append_batch(buffer).await {
        warn!(%run_id, %err, "log persistence degraded: batch dropped");
    }
    buffer.clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_name_is_namespaced_per_run() {
        let run_id = RunId::new();
        assert_eq!(channel_name(run_id), format!("run:{run_id}:events"));
    }

    #[test]
    fn log_event_converts_to_published_and_log_record_with_matching_sequence() {
        let run_id = RunId::new();
        let sequence = SequenceNumber::FIRST.next();
        let event = MuxEvent::Log {
            severity: "info".to_string(),
            source: "worker".to_string(),
            message: "hello".to_string(),
            data: None,
        };

        let published = to_published(run_id, sequence, &event);
        assert_eq!(published.run_id, run_id);
        assert_eq!(published.sequence, sequence);
        assert_eq!(published.message.as_deref(), Some("hello"));
        assert!(!published.truncated);

        let record = to_log_record(run_id, sequence, event).expect("log events persist");
        assert_eq!(record.sequence, sequence);
        assert_eq!(record.severity, "info");
    }

    #[test]
    fn progress_event_publishes_but_is_not_persisted() {
        let run_id = RunId::new();
        let sequence = SequenceNumber::FIRST;
        let mut fields = HashMap::new();
        fields.insert("step".to_string(), Value::from(1));
        let event = MuxEvent::Progress {
            phase: "loading".to_string(),
            fields: fields.clone(),
        };

        let published = to_published(run_id, sequence, &event);
        assert_eq!(published.phase.as_deref(), Some("loading"));
        assert!(published.message.is_none());

        assert!(to_log_record(run_id, sequence, event).is_none());
    }
}
