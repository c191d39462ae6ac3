//! Continuous (incremental) validation.
//!
//! Row events from the replica log are coalesced per primary key into
//! batches, each batch is verified against the downstream, and keys that
//! fail land in a retry map that is revalidated on a fixed cadence. A row
//! that failed only because replication had not caught up yet passes on a
//! later retry and leaves the map; eventual convergence is the steady state.
//!
//! Lock model: one writer lock over the failed-row map is held for the whole
//! of a revalidation pass (batch validator and retry loop alike); summary
//! readers take the read side.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinSet;
use tokio::time::Sleep;
use tokio_util::sync::CancellationToken;

use crate::binlog::{
    EventData, Ingester, LogEvent, RowEventKind, RowsData, StreamConnector, DEFAULT_MIN_LAG,
};
use crate::error::FatalError;
use crate::source::{
    select_unique_order_key, ColumnData, ColumnInfo, Cond, RowData, RowIterator,
    SimpleRowsIterator, Source, TableDiff,
};

/// Flush the accumulator once this many distinct rows are pending.
pub const BATCH_ROW_COUNT: usize = 200;
/// Timer-driven flush cadence when the batch never fills.
pub const VALIDATION_INTERVAL: Duration = Duration::from_secs(1);
/// How often the failed-row map is revalidated.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct ValidatorOptions {
    pub batch_row_count: usize,
    pub validation_interval: Duration,
    pub retry_interval: Duration,
    pub min_lag: Duration,
    /// Trust the replica log's after-image as the authoritative upstream row
    /// instead of querying the upstream again.
    pub use_binlog_for_compare: bool,
}

impl Default for ValidatorOptions {
    fn default() -> Self {
        Self {
            batch_row_count: BATCH_ROW_COUNT,
            validation_interval: VALIDATION_INTERVAL,
            retry_interval: RETRY_INTERVAL,
            min_lag: DEFAULT_MIN_LAG,
            use_binlog_for_compare: false,
        }
    }
}

/// Latest observed change for one primary key. Later events for the same key
/// overwrite `data`, `kind` and `last_seen_ts` in place.
#[derive(Clone, Debug)]
pub struct RowChange {
    pub pk: Vec<String>,
    pub data: Vec<Option<String>>,
    pub kind: RowEventKind,
    pub last_seen_ts: i64,
}

#[derive(Clone, Debug)]
pub struct TableChange {
    pub table: Arc<TableDiff>,
    pub rows: HashMap<String, RowChange>,
}

type Changes = HashMap<String, TableChange>;

pub struct ContinuousValidator {
    upstream: Arc<dyn Source>,
    downstream: Arc<dyn Source>,
    opts: ValidatorOptions,
    failed: RwLock<Changes>,
    pending_row_cnt: AtomicI64,
    failed_row_cnt: AtomicI64,
    /// Observed event counts, indexed insert/update/delete.
    event_counts: [AtomicU64; 3],
}

fn kind_index(kind: RowEventKind) -> usize {
    match kind {
        RowEventKind::Insert => 0,
        RowEventKind::Update => 1,
        RowEventKind::Delete => 2,
    }
}

fn row_count(changes: &Changes) -> usize {
    changes.values().map(|c| c.rows.len()).sum()
}

impl ContinuousValidator {
    pub fn new(
        upstream: Arc<dyn Source>,
        downstream: Arc<dyn Source>,
        opts: ValidatorOptions,
    ) -> Self {
        Self {
            upstream,
            downstream,
            opts,
            failed: RwLock::new(HashMap::new()),
            pending_row_cnt: AtomicI64::new(0),
            failed_row_cnt: AtomicI64::new(0),
            event_counts: [AtomicU64::new(0), AtomicU64::new(0), AtomicU64::new(0)],
        }
    }

    pub fn pending_row_count(&self) -> i64 {
        self.pending_row_cnt.load(Ordering::Relaxed)
    }

    pub fn failed_row_count(&self) -> i64 {
        self.failed_row_cnt.load(Ordering::Relaxed)
    }

    pub fn event_counts(&self) -> [u64; 3] {
        [
            self.event_counts[0].load(Ordering::Relaxed),
            self.event_counts[1].load(Ordering::Relaxed),
            self.event_counts[2].load(Ordering::Relaxed),
        ]
    }

    /// Failed primary-key strings currently held for `table` (as
    /// `schema.table`).
    pub async fn failed_keys(&self, table: &str) -> Vec<String> {
        let failed = self.failed.read().await;
        failed
            .get(table)
            .map(|c| c.rows.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Runs ingestion, accumulation, validation and retry until cancelled.
    /// A fatal error in any actor cancels the others and surfaces here.
    pub async fn run(
        self: Arc<Self>,
        ct: CancellationToken,
        connector: Arc<dyn StreamConnector>,
    ) -> anyhow::Result<()> {
        let (rows_tx, rows_rx) = mpsc::channel::<LogEvent>(1);
        let (pending_tx, pending_rx) = mpsc::channel::<Changes>(1);

        let mut tasks: JoinSet<anyhow::Result<()>> = JoinSet::new();
        {
            let validator = self.clone();
            let ct = ct.clone();
            tasks.spawn(async move {
                let result = validator.retry_failed_rows(&ct).await;
                if result.is_err() {
                    ct.cancel();
                }
                result
            });
        }
        {
            let validator = self.clone();
            let ct = ct.clone();
            tasks.spawn(async move {
                let result = validator.accumulate(rows_rx, pending_tx, &ct).await;
                if result.is_err() {
                    ct.cancel();
                }
                result
            });
        }
        {
            let validator = self.clone();
            let ct = ct.clone();
            tasks.spawn(async move {
                let result = validator.validate_batches(pending_rx, &ct).await;
                if result.is_err() {
                    ct.cancel();
                }
                result
            });
        }

        tracing::info!("start incremental validation");
        let ingester = Ingester::new(connector, rows_tx, self.opts.min_lag);
        let mut first_err = ingester.run(&ct).await.err();

        ct.cancel();
        while let Some(joined) = tasks.join_next().await {
            let err = match joined {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => err,
                Err(err) => anyhow::anyhow!("validator task panicked: {err}"),
            };
            if first_err.is_none() {
                first_err = Some(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Serially folds row events into the per-table per-key accumulator and
    /// flushes it by size or by timer.
    async fn accumulate(
        &self,
        mut rx: mpsc::Receiver<LogEvent>,
        tx: mpsc::Sender<Changes>,
        ct: &CancellationToken,
    ) -> anyhow::Result<()> {
        let mut acc: Changes = HashMap::new();
        let timer = tokio::time::sleep(self.opts.validation_interval);
        tokio::pin!(timer);
        loop {
            tokio::select! {
                _ = ct.cancelled() => return Ok(()),
                event = rx.recv() => {
                    let Some(event) = event else { return Ok(()) };
                    let EventData::Rows(rows) = event.data else { continue };
                    if let Err(err) = self
                        .process_event_rows(&mut acc, &tx, timer.as_mut(), event.timestamp, rows)
                        .await
                    {
                        match err.downcast_ref::<FatalError>() {
                            Some(FatalError::IncompleteRowEvent { .. }) => {
                                tracing::warn!(error = %err, "failed to process event");
                            }
                            Some(_) => return Err(err),
                            None => tracing::warn!(error = ?err, "failed to process event"),
                        }
                    }
                }
                _ = &mut timer => {
                    if row_count(&acc) > 0 {
                        let batch = std::mem::take(&mut acc);
                        if tx.send(batch).await.is_err() {
                            return Ok(());
                        }
                    }
                    timer.as_mut().reset(tokio::time::Instant::now() + self.opts.validation_interval);
                }
            }
        }
    }

    async fn process_event_rows(
        &self,
        acc: &mut Changes,
        tx: &mpsc::Sender<Changes>,
        mut timer: Pin<&mut Sleep>,
        timestamp: i64,
        rows: RowsData,
    ) -> anyhow::Result<()> {
        let Some(table) = self.upstream.table_by_name(&rows.schema, &rows.table) else {
            // Not a table under comparison.
            return Ok(());
        };
        let Some(pk) = table.primary_key.clone() else {
            return Err(FatalError::MissingPrimaryKey {
                schema: rows.schema.clone(),
                table: rows.table.clone(),
            }
            .into());
        };
        if rows.incomplete {
            return Err(FatalError::IncompleteRowEvent {
                schema: rows.schema.clone(),
                table: rows.table.clone(),
            }
            .into());
        }

        self.event_counts[kind_index(rows.kind)].fetch_add(1, Ordering::Relaxed);

        // Update events interleave before/after images; keep after-images.
        let (init, step) = match rows.kind {
            RowEventKind::Update => (1, 2),
            _ => (0, 1),
        };
        let pk_indices: Vec<usize> = pk
            .columns
            .iter()
            .map(|name| table.info.columns.iter().position(|c| &c.name == name))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| anyhow::anyhow!("primary key column missing from table info"))?;

        let mut total = row_count(acc);
        let full_name = table.full_name();
        let mut i = init;
        while i < rows.rows.len() {
            let row = &rows.rows[i];
            let pk_value: Vec<String> = pk_indices
                .iter()
                .map(|&idx| row.get(idx).cloned().flatten().unwrap_or_default())
                .collect();
            let change = acc.entry(full_name.clone()).or_insert_with(|| TableChange {
                table: table.clone(),
                rows: HashMap::new(),
            });
            let key = pk_value.join("-");
            if !change.rows.contains_key(&key) {
                total += 1;
                self.pending_row_cnt.fetch_add(1, Ordering::Relaxed);
            }
            change.rows.insert(
                key,
                RowChange {
                    pk: pk_value,
                    data: row.clone(),
                    kind: rows.kind,
                    last_seen_ts: timestamp,
                },
            );

            if total >= self.opts.batch_row_count {
                let batch = std::mem::take(acc);
                if tx.send(batch).await.is_err() {
                    return Ok(());
                }
                timer
                    .as_mut()
                    .reset(tokio::time::Instant::now() + self.opts.validation_interval);
                total = 0;
            }
            i += step;
        }
        Ok(())
    }

    /// Serially verifies flushed batches and folds the outcome into the
    /// failed-row map under the writer lock.
    async fn validate_batches(
        &self,
        mut rx: mpsc::Receiver<Changes>,
        ct: &CancellationToken,
    ) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = ct.cancelled() => return Ok(()),
                batch = rx.recv() => {
                    let Some(batch) = batch else { return Ok(()) };
                    let mut failed_guard = self.failed.write().await;
                    let failed = self.validate_table_change(&batch).await?;
                    Self::update_failed_changes(&mut failed_guard, &batch, failed);
                    self.failed_row_cnt.store(row_count(&failed_guard) as i64, Ordering::Relaxed);
                    self.pending_row_cnt.fetch_sub(row_count(&batch) as i64, Ordering::Relaxed);
                }
            }
        }
    }

    /// Every key in `all` was just re-evaluated, so its previous failure
    /// record is dropped; every key in `new_failed` gets a fresh one.
    fn update_failed_changes(failed: &mut Changes, all: &Changes, new_failed: Changes) {
        for (name, change) in all {
            if let Some(prev) = failed.get_mut(name) {
                for key in change.rows.keys() {
                    prev.rows.remove(key);
                }
            }
        }
        for (name, change) in new_failed {
            let prev = failed.entry(name).or_insert_with(|| TableChange {
                table: change.table.clone(),
                rows: HashMap::new(),
            });
            prev.rows.extend(change.rows);
        }
        failed.retain(|_, change| !change.rows.is_empty());
    }

    async fn validate_table_change(&self, changes: &Changes) -> anyhow::Result<Changes> {
        let mut failed_changes: Changes = HashMap::new();
        for (name, change) in changes {
            let mut insert_update_changes = Vec::new();
            let mut delete_changes = Vec::new();
            for row in change.rows.values() {
                match row.kind {
                    RowEventKind::Delete => delete_changes.push(row.clone()),
                    _ => insert_update_changes.push(row.clone()),
                }
            }
            let mut rows = HashMap::new();
            if !insert_update_changes.is_empty() {
                let failed_pks = self
                    .validate_changes(&change.table, &insert_update_changes, false)
                    .await?;
                for pk in failed_pks {
                    let key = pk.join("-");
                    if let Some(row) = change.rows.get(&key) {
                        rows.insert(key, row.clone());
                    }
                }
            }
            if !delete_changes.is_empty() {
                let failed_pks = self
                    .validate_changes(&change.table, &delete_changes, true)
                    .await?;
                for pk in failed_pks {
                    let key = pk.join("-");
                    if let Some(row) = change.rows.get(&key) {
                        rows.insert(key, row.clone());
                    }
                }
            }
            if !rows.is_empty() {
                failed_changes.insert(
                    name.clone(),
                    TableChange {
                        table: change.table.clone(),
                        rows,
                    },
                );
            }
        }
        Ok(failed_changes)
    }

    async fn validate_changes(
        &self,
        table: &Arc<TableDiff>,
        rows: &[RowChange],
        delete_change: bool,
    ) -> anyhow::Result<Vec<Vec<String>>> {
        let cond = Cond {
            table: table.clone(),
            pk_values: rows.iter().map(|r| r.pk.clone()).collect(),
        };
        if delete_change {
            self.validate_deleted_rows(&cond).await
        } else {
            self.validate_insert_update_rows(rows, &cond).await
        }
    }

    /// Deleted keys must be gone downstream; any key still present failed.
    async fn validate_deleted_rows(&self, cond: &Cond) -> anyhow::Result<Vec<Vec<String>>> {
        let mut downstream_rows = self.downstream.get_rows(cond).await?;
        let mut failed_rows = Vec::new();
        while let Some(row) = downstream_rows.next().await? {
            failed_rows.push(get_pk_values(&row, &cond.table));
        }
        Ok(failed_rows)
    }

    /// Keys-only merge of the authoritative upstream rows against the
    /// downstream: missing or differing keys fail; extra downstream rows may
    /// be unsynced deletes or another client's writes and are skipped.
    async fn validate_insert_update_rows(
        &self,
        rows: &[RowChange],
        cond: &Cond,
    ) -> anyhow::Result<Vec<Vec<String>>> {
        let mut upstream_rows: Box<dyn RowIterator> = if self.opts.use_binlog_for_compare {
            Box::new(self.row_change_iterator(&cond.table, rows))
        } else {
            self.upstream.get_rows(cond).await?
        };
        let mut downstream_rows = self.downstream.get_rows(cond).await?;

        let info = &cond.table.info;
        let order_names = select_unique_order_key(info);
        let order_cols: Vec<ColumnInfo> = order_names
            .iter()
            .filter_map(|name| info.column(name).cloned())
            .collect();

        let mut failed_rows = Vec::new();
        let mut last_upstream: Option<RowData> = None;
        let mut last_downstream: Option<RowData> = None;
        loop {
            if last_upstream.is_none() {
                last_upstream = upstream_rows.next().await?;
            }
            if last_downstream.is_none() {
                last_downstream = downstream_rows.next().await?;
            }

            if last_upstream.is_none() {
                if last_downstream.is_some() {
                    tracing::debug!("more data on downstream, may come from other clients, skip it");
                }
                break;
            }
            if last_downstream.is_none() {
                while let Some(up) = last_upstream.take() {
                    failed_rows.push(get_pk_values(&up, &cond.table));
                    last_upstream = upstream_rows.next().await?;
                }
                break;
            }

            let up = last_upstream.as_ref().expect("checked above");
            let down = last_downstream.as_ref().expect("checked above");
            let (eq, cmp) = crate::source::compare_data(up, down, &order_cols, &info.columns);
            if eq {
                last_upstream = None;
                last_downstream = None;
                continue;
            }
            match cmp {
                std::cmp::Ordering::Greater => {
                    tracing::debug!("more data on downstream, may come from other clients, skip it");
                    last_downstream = None;
                }
                std::cmp::Ordering::Less => {
                    failed_rows.push(get_pk_values(up, &cond.table));
                    last_upstream = None;
                }
                std::cmp::Ordering::Equal => {
                    failed_rows.push(get_pk_values(up, &cond.table));
                    last_upstream = None;
                    last_downstream = None;
                }
            }
        }
        Ok(failed_rows)
    }

    /// Rows reconstructed from replica-log after-images, sorted by primary
    /// key to satisfy the merge's ordering contract.
    fn row_change_iterator(&self, table: &TableDiff, rows: &[RowChange]) -> SimpleRowsIterator {
        let mut sorted: Vec<&RowChange> = rows.iter().collect();
        sorted.sort_by(|a, b| a.pk.cmp(&b.pk));
        let mut out = Vec::with_capacity(sorted.len());
        for change in sorted {
            let mut row = RowData::new();
            for (offset, col) in table.info.columns.iter().enumerate() {
                let value = change.data.get(offset).cloned().flatten();
                row.insert(
                    col.name.clone(),
                    ColumnData {
                        is_null: value.is_none(),
                        data: value.map(|v| Bytes::from(v.into_bytes())).unwrap_or_default(),
                    },
                );
            }
            out.push(row);
        }
        SimpleRowsIterator::new(out)
    }

    /// Revalidates the whole failed-row map on a fixed cadence and prints the
    /// one-line operator status.
    async fn retry_failed_rows(&self, ct: &CancellationToken) -> anyhow::Result<()> {
        loop {
            {
                let mut failed_guard = self.failed.write().await;
                let revalidated = self.validate_table_change(&failed_guard).await?;
                *failed_guard = revalidated;
                self.failed_row_cnt
                    .store(row_count(&failed_guard) as i64, Ordering::Relaxed);
                if self.failed_row_cnt.load(Ordering::Relaxed) < 5 {
                    for (table_name, change) in failed_guard.iter() {
                        for row in change.rows.values() {
                            tracing::info!(
                                table = %table_name,
                                key = ?row.pk,
                                kind = ?row.kind,
                                ts = row.last_seen_ts,
                                "failed row after retry"
                            );
                        }
                    }
                }
            }

            let (count, min_ts) = self.continue_validation_summary().await;
            let events = self.event_counts();
            if count > 0 {
                println!(
                    "events: {:3}/{:3}/{:3}, pending: {}, failed: {}, min ts: {}",
                    events[0],
                    events[1],
                    events[2],
                    self.pending_row_count(),
                    self.failed_row_count(),
                    format_ts(min_ts)
                );
            } else {
                println!(
                    "events: {:3}/{:3}/{:3}, pending: {}, failed: {}",
                    events[0],
                    events[1],
                    events[2],
                    self.pending_row_count(),
                    self.failed_row_count()
                );
            }

            tokio::select! {
                _ = ct.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.opts.retry_interval) => {}
            }
        }
    }

    async fn continue_validation_summary(&self) -> (usize, i64) {
        let failed = self.failed.read().await;
        let mut count = 0;
        let mut min_ts = i64::MAX;
        for change in failed.values() {
            count += change.rows.len();
            for row in change.rows.values() {
                min_ts = min_ts.min(row.last_seen_ts);
            }
        }
        (count, min_ts)
    }
}

fn get_pk_values(row: &RowData, table: &TableDiff) -> Vec<String> {
    let Some(pk) = table.primary_key.as_ref() else {
        return Vec::new();
    };
    pk.columns
        .iter()
        .map(|name| {
            row.get(name)
                .filter(|c| !c.is_null)
                .map(|c| String::from_utf8_lossy(&c.data).to_string())
                .unwrap_or_default()
        })
        .collect()
}

fn format_ts(ts: i64) -> String {
    chrono::DateTime::<chrono::Utc>::from_timestamp(ts, 0)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| ts.to_string())
}
