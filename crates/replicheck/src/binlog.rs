//! Replica log ingestion for continuous validation.
//!
//! The ingester reads row events from an `EventStream`, throttles itself so
//! the downstream has had a chance to apply each change before it is tested,
//! and routes row events to the accumulator over a rendezvous channel (the
//! accumulator paces the ingester). Connection establishment and wire details
//! live behind `StreamConnector`; the ingester only owns the retry policy:
//! on a fatal read error it closes the stream and redials from the last
//! observed position every second until that succeeds.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Minimum age of an event before it is validated, giving replication a
/// plausible window to catch up.
pub const DEFAULT_MIN_LAG: Duration = Duration::from_secs(5);

const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RowEventKind {
    Insert,
    Update,
    Delete,
}

/// Row images of one event. Update events interleave before/after images, so
/// consumers step with stride two starting at the after-image.
#[derive(Clone, Debug)]
pub struct RowsData {
    pub schema: String,
    pub table: String,
    pub kind: RowEventKind,
    pub rows: Vec<Vec<Option<String>>>,
    /// Set when the upstream elided columns from the row images; such events
    /// cannot be keyed or compared.
    pub incomplete: bool,
}

#[derive(Clone, Debug)]
pub enum EventData {
    Rotate { next_log: String },
    /// Statement events (DDL) are observed but not reconciled.
    Query,
    Rows(RowsData),
}

/// One decoded replica log event with its header fields.
#[derive(Clone, Debug)]
pub struct LogEvent {
    /// Commit timestamp in unix seconds.
    pub timestamp: i64,
    pub log_pos: u64,
    pub data: EventData,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LogPosition {
    pub name: String,
    pub pos: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// The server cannot continue serving this stream (e.g. the log was
    /// truncated under us); the only recovery is a fresh connection.
    #[error("fatal replica stream error: {0}")]
    Fatal(anyhow::Error),
    /// A single event failed to read or decode; the stream itself is fine.
    #[error("replica stream read error: {0}")]
    Recoverable(anyhow::Error),
}

#[async_trait]
pub trait EventStream: Send {
    async fn next_event(&mut self) -> Result<LogEvent, StreamError>;
}

/// Dials replica log streams. Implementations register under the given
/// server identity; `connect_from_start` begins at the empty GTID set.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn connect_from_start(&self, server_id: u32) -> anyhow::Result<Box<dyn EventStream>>;
    async fn connect_at(
        &self,
        server_id: u32,
        position: &LogPosition,
    ) -> anyhow::Result<Box<dyn EventStream>>;
}

pub struct Ingester {
    connector: std::sync::Arc<dyn StreamConnector>,
    rows_tx: mpsc::Sender<LogEvent>,
    min_lag: Duration,
    server_id: u32,
}

impl Ingester {
    pub fn new(
        connector: std::sync::Arc<dyn StreamConnector>,
        rows_tx: mpsc::Sender<LogEvent>,
        min_lag: Duration,
    ) -> Self {
        let server_id = rand::thread_rng().gen_range(1_000..=u32::MAX);
        Self {
            connector,
            rows_tx,
            min_lag,
            server_id,
        }
    }

    pub async fn run(&self, ct: &CancellationToken) -> anyhow::Result<()> {
        let mut stream = self.connector.connect_from_start(self.server_id).await?;
        tracing::info!(server_id = self.server_id, "start replica log stream");

        let mut latest = LogPosition::default();
        loop {
            let event = tokio::select! {
                _ = ct.cancelled() => return Ok(()),
                event = stream.next_event() => event,
            };
            let event = match event {
                Ok(event) => event,
                Err(StreamError::Fatal(err)) => {
                    tracing::error!(error = ?err, position = ?latest, "fatal log read error, reconnecting");
                    match self.reconnect(ct, &latest).await {
                        Some(reconnected) => stream = reconnected,
                        None => return Ok(()),
                    }
                    continue;
                }
                Err(StreamError::Recoverable(err)) => {
                    tracing::error!(error = ?err, "get event failed");
                    continue;
                }
            };

            self.throttle(event.timestamp).await;

            match event.data {
                EventData::Rotate { next_log } => latest.name = next_log,
                EventData::Query => {}
                EventData::Rows(_) => {
                    tokio::select! {
                        _ = ct.cancelled() => return Ok(()),
                        sent = self.rows_tx.send(event.clone()) => {
                            if sent.is_err() {
                                // The accumulator is gone; nothing left to feed.
                                return Ok(());
                            }
                        }
                    }
                }
            }
            latest.pos = event.log_pos;
        }
    }

    /// Sleeps until the event is at least `min_lag` old.
    async fn throttle(&self, timestamp: i64) {
        if timestamp <= 0 {
            return;
        }
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        let lag = Duration::from_secs((now - timestamp).max(0) as u64);
        if lag < self.min_lag {
            tokio::time::sleep(self.min_lag - lag).await;
        }
    }

    /// Redials from the last observed position every second until a stream
    /// comes up, or `None` when the run is cancelled first.
    async fn reconnect(
        &self,
        ct: &CancellationToken,
        position: &LogPosition,
    ) -> Option<Box<dyn EventStream>> {
        loop {
            match self.connector.connect_at(self.server_id, position).await {
                Ok(stream) => {
                    tracing::info!(position = ?position, "replica stream reconnected");
                    return Some(stream);
                }
                Err(err) => {
                    tracing::error!(error = ?err, "failed to restart replica stream");
                }
            }
            tokio::select! {
                _ = ct.cancelled() => return None,
                _ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
            }
        }
    }
}
