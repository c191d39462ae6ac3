//! Fix-SQL sink: a single background consumer that writes one `.sql` file per
//! divergent chunk, then hands the chunk's node to the checkpoint store. The
//! write happens strictly before the insert, so the persisted frontier can
//! never name a chunk whose fix file is missing.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::{SecondsFormat, Utc};
use tokio::sync::mpsc;

use crate::checkpoint::Checkpoint;
use crate::chunk::ChunkId;
use crate::error::FatalError;
use crate::reconcile::ChunkDml;
use crate::source::{TableDiff, UNIFIED_TIME_ZONE};

/// Fix file name for one chunk: `schema:table:<id fragment>.sql`.
pub fn fix_file_name(table: &TableDiff, id: &ChunkId) -> String {
    format!(
        "{}:{}:{}.sql",
        table.schema,
        table.table,
        id.to_file_fragment()
    )
}

/// Drains the DML channel until it closes. Files are refused when they
/// already exist: the name encodes the chunk id, so a collision means two
/// chunks claimed the same identity and nothing about the run can be trusted.
pub async fn write_sqls(
    mut rx: mpsc::Receiver<ChunkDml>,
    tables: Vec<Arc<TableDiff>>,
    fix_dir: PathBuf,
    cp: Arc<Checkpoint>,
) -> anyhow::Result<()> {
    tracing::info!("start fix-sql writer");
    while let Some(dml) = rx.recv().await {
        if !dml.sqls.is_empty() {
            let table = &tables[dml.node.table_index()];
            let path = fix_dir.join(fix_file_name(table, &dml.node.id()));
            if path.exists() {
                return Err(FatalError::FixFileCollision {
                    path: path.display().to_string(),
                }
                .into());
            }
            let mut content = format!(
                "-- table: {}.{}\n-- {}\n",
                table.schema,
                table.table,
                dml.node.chunk_range.to_meta()
            );
            if table.need_unified_time_zone {
                content.push_str(&format!(
                    "set @@session.time_zone = \"{UNIFIED_TIME_ZONE}\";\n"
                ));
            }
            for sql in &dml.sqls {
                content.push_str(sql);
                content.push('\n');
            }
            fs::write(&path, content)
                .with_context(|| format!("write fix sql file {}", path.display()))?;
            tracing::debug!(path = %path.display(), statements = dml.sqls.len(), "wrote fix sql");
        }
        cp.insert(dml.node);
    }
    tracing::info!("close fix-sql writer");
    Ok(())
}

/// Startup hygiene: every fix file whose chunk id lies beyond the loaded
/// frontier will be regenerated, so it moves into a timestamped `.trash`
/// subdirectory instead of colliding with the rerun. Files that do not match
/// the three-field naming pattern are left alone, and the `.trash` subtree is
/// never scanned.
pub fn remove_sql_files(fix_dir: &Path, floor: &ChunkId) -> anyhow::Result<()> {
    let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    let trash_dir = fix_dir.join(format!(".trash-{stamp}"));
    fs::create_dir_all(&trash_dir).context("create trash dir")?;

    let mut moved = 0usize;
    visit(fix_dir, fix_dir, &trash_dir, floor, &mut moved)?;
    if moved > 0 {
        tracing::info!(moved, trash = %trash_dir.display(), "moved stale fix sql files");
    }
    Ok(())
}

fn visit(
    dir: &Path,
    root: &Path,
    trash_dir: &Path,
    floor: &ChunkId,
    moved: &mut usize,
) -> anyhow::Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err).context("scan fix sql dir"),
    };
    for entry in entries {
        let entry = entry.context("scan fix sql dir")?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        if path.is_dir() {
            if !name.starts_with(".trash") {
                visit(&path, root, trash_dir, floor, moved)?;
            }
            continue;
        }
        let Some(id) = parse_fix_file_name(&name) else {
            continue;
        };
        if id.compare(floor) == std::cmp::Ordering::Greater {
            let rel = path.strip_prefix(root).unwrap_or(&path);
            let target = trash_dir.join(rel);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).context("create trash subdir")?;
            }
            fs::rename(&path, &target)
                .with_context(|| format!("move stale fix sql {}", path.display()))?;
            *moved += 1;
        }
    }
    Ok(())
}

/// Parses `schema:table:<fragment>.sql` back into a chunk id; anything else
/// is not ours to touch.
fn parse_fix_file_name(name: &str) -> Option<ChunkId> {
    let stem = name.strip_suffix(".sql")?;
    let mut fields = stem.splitn(3, ':');
    let _schema = fields.next()?;
    let _table = fields.next()?;
    ChunkId::from_file_fragment(fields.next()?)
}
