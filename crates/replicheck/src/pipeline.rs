//! Batch (snapshot) driver.
//!
//! Chunks flow from the range iterator into a bounded worker pool; each
//! worker checksums its chunk, narrows a mismatch, reconciles rows, and
//! pushes the resulting DML onto a bounded channel. Two background actors
//! consume from there: the fix-SQL writer (which inserts nodes into the
//! checkpoint store only after the file is on disk) and the checkpoint
//! flusher. The shutdown order is load-bearing: drain the pool, close the
//! DML channel, join the writer, stop the flusher, join the flusher — so the
//! final checkpoint flush sees the fully populated store and never names a
//! chunk whose fix file is missing.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::bisect::{bin_generate, SPLIT_THRESHOLD};
use crate::checkpoint::{Checkpoint, Node, NodeState, CHECKPOINT_FILE};
use crate::checksum::compare_checksum_and_get_count;
use crate::chunk::{ChunkId, RangeInfo};
use crate::config::Config;
use crate::error::FatalError;
use crate::fixsql::{remove_sql_files, write_sqls};
use crate::reconcile::{compare_rows, ChunkDml};
use crate::report::Report;
use crate::source::{self, Source};

/// Capacity of the DML channel; backpressure from the writer pauses workers.
pub const DEFAULT_CHANNEL_BUFFER: usize = 64;

const CHECKPOINT_FLUSH_INTERVAL: Duration = Duration::from_secs(10);

struct Core {
    upstream: Arc<dyn Source>,
    downstream: Arc<dyn Source>,
    work_source: Arc<dyn Source>,
    export_fix_sql: bool,
    fix_dir: PathBuf,
    cp: Arc<Checkpoint>,
    report: Mutex<Report>,
}

/// One full comparison of two databases.
pub struct Diff {
    core: Arc<Core>,
    start_range: Option<RangeInfo>,
    check_thread_count: usize,
    chunk_size: i64,
    checkpoint_path: PathBuf,
}

impl Diff {
    pub async fn new(
        cfg: &Config,
        upstream: Arc<dyn Source>,
        downstream: Arc<dyn Source>,
        ct: &CancellationToken,
    ) -> anyhow::Result<Self> {
        fs::create_dir_all(&cfg.fix_dir).context("create fix sql dir")?;
        fs::create_dir_all(&cfg.checkpoint_dir).context("create checkpoint dir")?;

        let work_source = pick_source(&upstream, &downstream, ct).await;

        let mut report = Report::default();
        report.init(downstream.tables());

        let cp = Arc::new(Checkpoint::new());
        cp.init();
        let checkpoint_path = cfg.checkpoint_dir.join(CHECKPOINT_FILE);
        let mut start_range = None;
        match Checkpoint::load_chunk(&checkpoint_path)
            .context("the checkpoint load process failed")?
        {
            Some((node, report_snapshot)) => {
                tracing::info!(chunk = ?node.id(), state = ?node.state, "load checkpoint");
                cp.init_current_saved_id(&node);
                // Fix files beyond the frontier will be generated again.
                remove_sql_files(&cfg.fix_dir, &node.id())?;
                report.load(report_snapshot);
                let progress_id = downstream
                    .tables()
                    .get(node.table_index())
                    .map(|t| t.full_name())
                    .unwrap_or_default();
                start_range = Some(node.to_range(progress_id));
            }
            None => {
                tracing::info!("checkpoint file not found, start from the beginning");
                remove_sql_files(&cfg.fix_dir, &ChunkId::floor())?;
            }
        }

        Ok(Self {
            core: Arc::new(Core {
                upstream,
                downstream,
                work_source,
                export_fix_sql: cfg.export_fix_sql,
                fix_dir: cfg.fix_dir.clone(),
                cp,
                report: Mutex::new(report),
            }),
            start_range,
            check_thread_count: cfg.check_thread_count.max(1),
            chunk_size: cfg.chunk_size,
            checkpoint_path,
        })
    }

    /// Compares the column structure of every table, resuming from the
    /// checkpointed table. Tables whose column sets cannot be compared are
    /// flagged so the data phase skips them.
    pub async fn struct_equal(&self) -> anyhow::Result<()> {
        let table_count = self.core.downstream.tables().len();
        let start = self
            .start_range
            .as_ref()
            .map(|r| r.table_index())
            .unwrap_or(0);
        for table_index in start..table_count {
            let (is_equal, is_skip) = self.compare_struct(table_index).await?;
            let table = self.core.downstream.tables()[table_index].clone();
            self.core
                .report
                .lock()
                .expect("report lock")
                .set_table_struct_check_result(&table.schema, &table.table, is_equal, is_skip);
        }
        Ok(())
    }

    async fn compare_struct(&self, table_index: usize) -> anyhow::Result<(bool, bool)> {
        let source_infos = self.core.upstream.get_source_struct_info(table_index).await?;
        let table = &self.core.downstream.tables()[table_index];
        let (is_equal, is_skip) = source::compare_struct(&source_infos, &table.info);
        table.ignore_data_check.store(is_skip, Ordering::Relaxed);
        Ok((is_equal, is_skip))
    }

    /// Verifies the data of every shared table chunk by chunk.
    pub async fn equal(&self, ct: &CancellationToken) -> anyhow::Result<()> {
        let mut chunks_iter = self
            .core
            .work_source
            .get_range_iterator(self.start_range.clone(), self.chunk_size)
            .await?;

        let (dml_tx, dml_rx) = mpsc::channel(DEFAULT_CHANNEL_BUFFER);
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let cp_task = tokio::spawn(handle_checkpoints(
            self.core.clone(),
            self.checkpoint_path.clone(),
            ct.clone(),
            stop_rx,
        ));
        let sql_task = tokio::spawn(write_sqls(
            dml_rx,
            self.core.downstream.tables().to_vec(),
            self.core.fix_dir.clone(),
            self.core.cp.clone(),
        ));

        let semaphore = Arc::new(Semaphore::new(self.check_thread_count));
        let mut workers = JoinSet::new();
        let mut iter_result: anyhow::Result<()> = Ok(());
        loop {
            if ct.is_cancelled() {
                break;
            }
            let chunk = match chunks_iter.next().await {
                Ok(chunk) => chunk,
                Err(err) => {
                    iter_result = Err(err);
                    break;
                }
            };
            let Some(chunk) = chunk else {
                // Every table has been enumerated.
                break;
            };
            tracing::info!(chunk = ?chunk.id(), table = %chunk.progress_id, "consume chunk");
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            let core = self.core.clone();
            let tx = dml_tx.clone();
            let worker_ct = ct.clone();
            workers.spawn(async move {
                let _permit = permit;
                consume(&core, chunk, &tx, &worker_ct).await
            });
        }

        let mut worker_err: Option<anyhow::Error> = None;
        while let Some(joined) = workers.join_next().await {
            let err = match joined {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => err,
                Err(err) => anyhow!("chunk worker panicked: {err}"),
            };
            if worker_err.is_none() {
                worker_err = Some(err);
            }
        }
        tracing::debug!("all consume tasks finished");

        drop(dml_tx);
        let writer_result = match sql_task.await {
            Ok(result) => result,
            Err(err) => Err(anyhow!("fix-sql writer panicked: {err}")),
        };
        let _ = stop_tx.send(());
        if let Err(err) = cp_task.await {
            tracing::warn!(error = %err, "checkpoint handler join failed");
        }

        writer_result?;
        if let Some(err) = worker_err {
            return Err(err);
        }
        iter_result
    }

    /// Prints the per-table summary to stdout and returns the verdict.
    pub fn print_summary(&self) -> bool {
        let report = self.core.report.lock().expect("report lock");
        let mut stdout = std::io::stdout();
        if let Err(err) = report.print(&mut stdout) {
            tracing::warn!(error = ?err, "failed to print the summary");
        }
        report.pass()
    }

    pub fn pass(&self) -> bool {
        self.core.report.lock().expect("report lock").pass()
    }

    /// Removes the checkpoint file after a clean run so the next one starts
    /// fresh.
    pub fn close(&self) -> anyhow::Result<()> {
        match fs::remove_file(&self.checkpoint_path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).context("remove the checkpoint file"),
        }
    }
}

/// Prefer a TiDB side as the work source for chunking and narrowing, and hold
/// its GC while the check runs; the downstream wins when both qualify.
async fn pick_source(
    upstream: &Arc<dyn Source>,
    downstream: &Arc<dyn Source>,
    ct: &CancellationToken,
) -> Arc<dyn Source> {
    let mut work_source = downstream.clone();
    if upstream.is_tidb().await {
        tracing::info!("the upstream is TiDB, pick it as work source candidate");
        upstream
            .start_gc_keeper(ct.clone(), upstream.snapshot().to_string())
            .await;
        work_source = upstream.clone();
    }
    if downstream.is_tidb().await {
        tracing::info!("the downstream is TiDB, pick it as work source first");
        downstream
            .start_gc_keeper(ct.clone(), downstream.snapshot().to_string())
            .await;
        work_source = downstream.clone();
    }
    work_source
}

async fn consume(
    core: &Core,
    range: RangeInfo,
    tx: &mpsc::Sender<ChunkDml>,
    ct: &CancellationToken,
) -> anyhow::Result<()> {
    let mut dml = ChunkDml::new(Node::from_range(&range, NodeState::Success));
    match check_chunk(core, &range, &mut dml).await {
        Ok(_is_equal) => {
            // The node must reach the writer even for clean chunks, or the
            // frontier would never advance past them.
            if tx.send(dml).await.is_err() {
                anyhow::bail!("fix-sql writer closed before the chunk was recorded");
            }
            Ok(())
        }
        Err(err) => {
            // An invariant violation poisons the whole run.
            ct.cancel();
            Err(err)
        }
    }
}

async fn check_chunk(
    core: &Core,
    range: &RangeInfo,
    dml: &mut ChunkDml,
) -> anyhow::Result<bool> {
    if range.chunk_range.is_empty() {
        dml.node.state = NodeState::Ignore;
        return Ok(true);
    }
    let table = core.downstream.tables()[range.table_index()].clone();
    let mut state = NodeState::Success;
    let mut is_equal = false;

    match compare_checksum_and_get_count(
        core.upstream.as_ref(),
        core.downstream.as_ref(),
        range,
    )
    .await
    {
        Err(err) => {
            // A checksum error fails the chunk and skips reconciliation.
            state = NodeState::Failed;
            core.report
                .lock()
                .expect("report lock")
                .set_table_meet_error(&table.schema, &table.table, &err);
        }
        Ok((true, _count)) => is_equal = true,
        Ok((false, count)) => {
            if core.export_fix_sql {
                tracing::debug!(chunk = ?range.id(), count, table = %table.full_name(), "chunk checksum mismatch");
                state = NodeState::Failed;
                let mut info = range.clone();
                if count > SPLIT_THRESHOLD {
                    match bin_generate(
                        core.work_source.as_ref(),
                        core.upstream.as_ref(),
                        core.downstream.as_ref(),
                        range,
                        count,
                    )
                    .await
                    {
                        Ok(refined) => {
                            tracing::debug!(chunk = ?refined.id(), "narrowing finished");
                            info = refined;
                        }
                        Err(err) if err.downcast_ref::<FatalError>().is_some() => {
                            return Err(err);
                        }
                        Err(err) => {
                            tracing::error!(error = ?err, "failed to narrow the mismatched chunk");
                            core.report
                                .lock()
                                .expect("report lock")
                                .set_table_meet_error(&table.schema, &table.table, &err);
                            // Reconcile the whole parent range instead.
                        }
                    }
                }
                if let Err(err) = compare_rows(
                    core.upstream.as_ref(),
                    core.downstream.as_ref(),
                    core.work_source.as_ref(),
                    &info,
                    dml,
                )
                .await
                {
                    core.report
                        .lock()
                        .expect("report lock")
                        .set_table_meet_error(&table.schema, &table.table, &err);
                }
            }
        }
    }

    dml.node.state = state;
    core.report
        .lock()
        .expect("report lock")
        .set_table_data_check_result(
            &table.schema,
            &table.table,
            is_equal,
            dml.row_add,
            dml.row_delete,
            range.id(),
        );
    Ok(is_equal)
}

async fn handle_checkpoints(
    core: Arc<Core>,
    path: PathBuf,
    ct: CancellationToken,
    mut stop_rx: oneshot::Receiver<()>,
) {
    tracing::info!("start checkpoint handler");
    loop {
        tokio::select! {
            _ = ct.cancelled() => {
                tracing::info!("stop checkpoint handler: cancelled");
                break;
            }
            _ = &mut stop_rx => {
                tracing::info!("stop checkpoint handler");
                break;
            }
            _ = tokio::time::sleep(CHECKPOINT_FLUSH_INTERVAL) => flush_checkpoint(&core, &path),
        }
    }
    // Final flush after the writer drained, so the frontier is complete.
    flush_checkpoint(&core, &path);
    tracing::info!("close checkpoint handler");
}

fn flush_checkpoint(core: &Core, path: &Path) {
    if let Some(node) = core.cp.get_chunk_snapshot() {
        let snapshot = core.report.lock().expect("report lock").snapshot();
        if let Err(err) = core.cp.save_chunk(path, &node, &snapshot) {
            tracing::warn!(error = ?err, "failed to save the checkpoint");
        }
    }
}
