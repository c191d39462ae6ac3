//! Shared fixtures: an in-memory `Source` implementation whose checksum and
//! ordering semantics mirror the SQL side, plus a scripted replica log stream
//! for driving the continuous validator.

#![allow(dead_code)]

use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use replicheck::binlog::{
    EventData, EventStream, LogEvent, LogPosition, RowEventKind, RowsData, StreamConnector,
    StreamError,
};
use replicheck::chunk::{Bound, ChunkId, ChunkRange, ChunkType, RangeInfo};
use replicheck::source::{
    compare_column_values, select_unique_order_key, ChecksumInfo, ColumnData, ColumnInfo, Cond,
    DmlKind, IndexInfo, RangeIterator, RowData, RowIterator, SimpleRowsIterator, Source,
    TableDiff, TableInfo,
};
use replicheck::Config;

pub type MemRow = Vec<Option<String>>;

pub fn table_diff(
    schema: &str,
    table: &str,
    columns: &[(&str, bool)],
    pk: Option<&[&str]>,
) -> Arc<TableDiff> {
    let info = TableInfo {
        columns: columns
            .iter()
            .map(|(name, numeric)| ColumnInfo {
                name: name.to_string(),
                numeric: *numeric,
            })
            .collect(),
        indices: pk
            .map(|cols| {
                vec![IndexInfo {
                    id: 0,
                    name: "PRIMARY".to_string(),
                    columns: cols.iter().map(|c| c.to_string()).collect(),
                    primary: true,
                    unique: true,
                }]
            })
            .unwrap_or_default(),
    };
    let primary_key = info.indices.first().cloned();
    Arc::new(TableDiff {
        schema: schema.to_string(),
        table: table.to_string(),
        info,
        primary_key,
        range: "TRUE".to_string(),
        collation: String::new(),
        ignore_data_check: AtomicBool::new(false),
        need_unified_time_zone: false,
    })
}

/// Rows of integers 1..=n with a payload column, the standard fixture shape
/// `(id, v)`.
pub fn int_rows(n: i64, payload: impl Fn(i64) -> String) -> Vec<MemRow> {
    (1..=n)
        .map(|i| vec![Some(i.to_string()), Some(payload(i))])
        .collect()
}

pub struct MemSource {
    tables: Vec<Arc<TableDiff>>,
    data: RwLock<HashMap<String, Vec<MemRow>>>,
    checksum_calls: AtomicUsize,
}

impl MemSource {
    pub fn new(tables: Vec<Arc<TableDiff>>) -> Arc<Self> {
        Arc::new(Self {
            tables,
            data: RwLock::new(HashMap::new()),
            checksum_calls: AtomicUsize::new(0),
        })
    }

    pub fn set_rows(&self, full_name: &str, rows: Vec<MemRow>) {
        self.data
            .write()
            .expect("data lock")
            .insert(full_name.to_string(), rows);
    }

    pub fn rows(&self, full_name: &str) -> Vec<MemRow> {
        self.data
            .read()
            .expect("data lock")
            .get(full_name)
            .cloned()
            .unwrap_or_default()
    }

    pub fn checksum_calls(&self) -> usize {
        self.checksum_calls.load(AtomicOrdering::Relaxed)
    }

    fn table(&self, table_index: usize) -> &Arc<TableDiff> {
        &self.tables[table_index]
    }

    fn rows_in_range(&self, table: &TableDiff, range: &ChunkRange) -> Vec<MemRow> {
        self.rows(&table.full_name())
            .into_iter()
            .filter(|row| in_range(table, range, row))
            .collect()
    }

    /// Applies one statement previously produced by `generate_fix_sql`.
    pub fn apply_fix_sql(&self, sql: &str) {
        let sql = sql.trim();
        if sql.is_empty() || sql.starts_with("--") || sql.starts_with("set ") {
            return;
        }
        if let Some(rest) = sql.strip_prefix("REPLACE INTO `") {
            let (schema, rest) = rest.split_once("`.`").expect("schema separator");
            let (table_name, rest) = rest.split_once("` (").expect("column list");
            let (cols_str, rest) = rest.split_once(") VALUES (").expect("values");
            let values_str = rest.strip_suffix(");").expect("statement terminator");
            let cols: Vec<String> = cols_str
                .split(',')
                .map(|c| c.trim().trim_matches('`').to_string())
                .collect();
            let values = split_values(values_str);
            let full_name = format!("{schema}.{table_name}");
            let table = self
                .tables
                .iter()
                .find(|t| t.full_name() == full_name)
                .expect("known table")
                .clone();

            let mut row: MemRow = vec![None; table.info.columns.len()];
            for (col, value) in cols.iter().zip(values) {
                let idx = table
                    .info
                    .columns
                    .iter()
                    .position(|c| &c.name == col)
                    .expect("known column");
                row[idx] = value;
            }
            let pk_indices = pk_indices(&table);
            let mut data = self.data.write().expect("data lock");
            let rows = data.entry(full_name).or_default();
            rows.retain(|existing| {
                pk_indices
                    .iter()
                    .any(|&i| existing[i] != row[i])
            });
            rows.push(row);
        } else if let Some(rest) = sql.strip_prefix("DELETE FROM `") {
            let (schema, rest) = rest.split_once("`.`").expect("schema separator");
            let (table_name, rest) = rest.split_once("` WHERE ").expect("where clause");
            let conds_str = rest.strip_suffix(" LIMIT 1;").expect("limit clause");
            let full_name = format!("{schema}.{table_name}");
            let table = self
                .tables
                .iter()
                .find(|t| t.full_name() == full_name)
                .expect("known table")
                .clone();

            let mut wanted: Vec<(usize, Option<String>)> = Vec::new();
            for cond in conds_str.split(" AND ") {
                let (col, value) = if let Some(col) = cond.strip_suffix("` IS NULL") {
                    (col.trim_start_matches('`').to_string(), None)
                } else {
                    let (col, value) = cond.split_once("` = ").expect("equality");
                    let parsed = split_values(value).pop().flatten();
                    (col.trim_start_matches('`').to_string(), parsed)
                };
                let idx = table
                    .info
                    .columns
                    .iter()
                    .position(|c| c.name == col)
                    .expect("known column");
                wanted.push((idx, value));
            }
            let mut data = self.data.write().expect("data lock");
            let rows = data.entry(full_name).or_default();
            if let Some(pos) = rows
                .iter()
                .position(|row| wanted.iter().all(|(i, v)| &row[*i] == v))
            {
                rows.remove(pos);
            }
        } else {
            panic!("unrecognized fix sql: {sql}");
        }
    }

    pub fn apply_fix_file(&self, path: &std::path::Path) {
        let content = std::fs::read_to_string(path).expect("read fix file");
        for line in content.lines() {
            self.apply_fix_sql(line);
        }
    }
}

fn pk_indices(table: &TableDiff) -> Vec<usize> {
    let Some(pk) = table.primary_key.as_ref() else {
        return (0..table.info.columns.len()).collect();
    };
    pk.columns
        .iter()
        .map(|name| {
            table
                .info
                .columns
                .iter()
                .position(|c| &c.name == name)
                .expect("pk column exists")
        })
        .collect()
}

fn cell(table: &TableDiff, row: &MemRow, column: &str) -> (ColumnData, bool) {
    let idx = table
        .info
        .columns
        .iter()
        .position(|c| c.name == column)
        .expect("known column");
    let numeric = table.info.columns[idx].numeric;
    let value = row.get(idx).cloned().flatten();
    (
        ColumnData {
            is_null: value.is_none(),
            data: value.map(|v| Bytes::from(v.into_bytes())).unwrap_or_default(),
        },
        numeric,
    )
}

fn bound_value(value: &str) -> ColumnData {
    ColumnData {
        is_null: false,
        data: Bytes::copy_from_slice(value.as_bytes()),
    }
}

/// Evaluates the chunk predicate the way its SQL rendering would:
/// lower-exclusive, upper-inclusive on the last bounded column, with prefix
/// equalities for composite keys.
fn in_range(table: &TableDiff, range: &ChunkRange, row: &MemRow) -> bool {
    if range.kind == ChunkType::Empty {
        return false;
    }
    let lowers: Vec<&Bound> = range.bounds.iter().filter(|b| b.has_lower).collect();
    if !lowers.is_empty() && !side_holds(table, row, &lowers, false) {
        return false;
    }
    let uppers: Vec<&Bound> = range.bounds.iter().filter(|b| b.has_upper).collect();
    if !uppers.is_empty() && !side_holds(table, row, &uppers, true) {
        return false;
    }
    true
}

fn side_holds(table: &TableDiff, row: &MemRow, bounds: &[&Bound], upper: bool) -> bool {
    'candidates: for i in 0..bounds.len() {
        for prefix in bounds.iter().take(i) {
            let (value, numeric) = cell(table, row, &prefix.column);
            let target = if upper { &prefix.upper } else { &prefix.lower };
            if compare_column_values(&value, &bound_value(target), numeric) != Ordering::Equal {
                continue 'candidates;
            }
        }
        let bound = bounds[i];
        let (value, numeric) = cell(table, row, &bound.column);
        let target = if upper { &bound.upper } else { &bound.lower };
        let cmp = compare_column_values(&value, &bound_value(target), numeric);
        let holds = if upper {
            cmp == Ordering::Less || (i == bounds.len() - 1 && cmp == Ordering::Equal)
        } else {
            cmp == Ordering::Greater
        };
        if holds {
            return true;
        }
    }
    false
}

fn cmp_rows(table: &TableDiff, a: &MemRow, b: &MemRow, columns: &[String]) -> Ordering {
    for column in columns {
        let (va, numeric) = cell(table, a, column);
        let (vb, _) = cell(table, b, column);
        let cmp = compare_column_values(&va, &vb, numeric);
        if cmp != Ordering::Equal {
            return cmp;
        }
    }
    Ordering::Equal
}

fn to_row_data(table: &TableDiff, row: &MemRow) -> RowData {
    let mut data = RowData::new();
    for col in &table.info.columns {
        let (value, _) = cell(table, row, &col.name);
        data.insert(col.name.clone(), value);
    }
    data
}

fn sql_literal(value: Option<&ColumnData>) -> String {
    match value {
        Some(v) if !v.is_null => {
            let text = String::from_utf8_lossy(&v.data);
            format!("'{}'", text.replace('\\', "\\\\").replace('\'', "\\'"))
        }
        _ => "NULL".to_string(),
    }
}

fn split_values(s: &str) -> Vec<Option<String>> {
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut in_quote = false;
    let mut escaped = false;
    let mut was_quoted = false;
    let finish = |cur: &mut String, was_quoted: &mut bool| {
        let value = if *was_quoted {
            Some(std::mem::take(cur))
        } else {
            let trimmed = cur.trim();
            let value = if trimmed == "NULL" {
                None
            } else {
                Some(trimmed.to_string())
            };
            cur.clear();
            value
        };
        *was_quoted = false;
        value
    };
    for ch in s.chars() {
        if in_quote {
            if escaped {
                cur.push(ch);
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '\'' {
                in_quote = false;
            } else {
                cur.push(ch);
            }
        } else {
            match ch {
                '\'' => {
                    in_quote = true;
                    was_quoted = true;
                }
                ',' => {
                    let value = finish(&mut cur, &mut was_quoted);
                    out.push(value);
                }
                _ => cur.push(ch),
            }
        }
    }
    let value = finish(&mut cur, &mut was_quoted);
    out.push(value);
    out
}

struct MemRangeIterator {
    items: std::vec::IntoIter<RangeInfo>,
}

#[async_trait]
impl RangeIterator for MemRangeIterator {
    async fn next(&mut self) -> anyhow::Result<Option<RangeInfo>> {
        Ok(self.items.next())
    }
}

#[async_trait]
impl Source for MemSource {
    fn tables(&self) -> &[Arc<TableDiff>] {
        &self.tables
    }

    fn snapshot(&self) -> &str {
        ""
    }

    async fn is_tidb(&self) -> bool {
        false
    }

    async fn get_range_iterator(
        &self,
        start: Option<RangeInfo>,
        chunk_size: i64,
    ) -> anyhow::Result<Box<dyn RangeIterator>> {
        let chunk_size = chunk_size.max(1) as usize;
        let mut all = Vec::new();
        for (table_index, table) in self.tables.iter().enumerate() {
            let empty = RangeInfo {
                chunk_range: ChunkRange::new(
                    ChunkId::new(table_index as i64, 0, 1),
                    ChunkType::Empty,
                ),
                index_id: -1,
                progress_id: table.full_name(),
            };
            if table.ignore_data_check.load(AtomicOrdering::Relaxed) {
                all.push(empty);
                continue;
            }
            let Some(pk) = table.primary_key.clone() else {
                all.push(RangeInfo {
                    chunk_range: ChunkRange::new(
                        ChunkId::new(table_index as i64, 0, 1),
                        ChunkType::Others,
                    ),
                    index_id: -1,
                    progress_id: table.full_name(),
                });
                continue;
            };
            let mut rows = self.rows(&table.full_name());
            if rows.is_empty() {
                all.push(empty);
                continue;
            }
            rows.sort_by(|a, b| cmp_rows(table, a, b, &pk.columns));
            let chunk_cnt = rows.len().div_ceil(chunk_size);
            for k in 0..chunk_cnt {
                let id = ChunkId::new(table_index as i64, k as i64, chunk_cnt as i64);
                let mut chunk_range = ChunkRange::new(id, ChunkType::Limit);
                let pk_idx = pk_indices(table);
                if k > 0 {
                    let prev_last = &rows[k * chunk_size - 1];
                    for (col, &idx) in pk.columns.iter().zip(&pk_idx) {
                        let value = prev_last[idx].clone().unwrap_or_default();
                        chunk_range.update(col, &value, "", true, false);
                    }
                }
                if k + 1 < chunk_cnt {
                    let last = &rows[(k + 1) * chunk_size - 1];
                    for (col, &idx) in pk.columns.iter().zip(&pk_idx) {
                        let value = last[idx].clone().unwrap_or_default();
                        chunk_range.update(col, "", &value, false, true);
                    }
                }
                all.push(RangeInfo {
                    chunk_range,
                    index_id: pk.id,
                    progress_id: table.full_name(),
                });
            }
        }
        if let Some(start) = start {
            let floor = start.id();
            all.retain(|r| r.id().compare(&floor) == Ordering::Greater);
        }
        Ok(Box::new(MemRangeIterator {
            items: all.into_iter(),
        }))
    }

    async fn get_count_and_crc32(&self, range: &RangeInfo) -> anyhow::Result<ChecksumInfo> {
        self.checksum_calls.fetch_add(1, AtomicOrdering::Relaxed);
        let table = self.table(range.table_index());
        let rows = self.rows_in_range(table, &range.chunk_range);
        let mut checksum: u64 = 0;
        for row in &rows {
            let mut parts: Vec<String> = Vec::new();
            for value in row {
                if let Some(value) = value {
                    parts.push(value.clone());
                }
            }
            for value in row {
                parts.push(if value.is_some() { "0" } else { "1" }.to_string());
            }
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(parts.join(",").as_bytes());
            checksum ^= u64::from(hasher.finalize());
        }
        Ok(ChecksumInfo {
            count: rows.len() as i64,
            checksum,
        })
    }

    async fn get_approximate_mid(
        &self,
        table: &TableDiff,
        columns: &[String],
        range: &RangeInfo,
        count: i64,
    ) -> anyhow::Result<Option<Vec<(String, String)>>> {
        let mut rows = self.rows_in_range(table, &range.chunk_range);
        rows.sort_by(|a, b| cmp_rows(table, a, b, columns));
        let idx = (count / 2).max(0) as usize;
        let Some(row) = rows.get(idx) else {
            return Ok(None);
        };
        let mut mid = Vec::with_capacity(columns.len());
        for column in columns {
            let (value, _) = cell(table, row, column);
            if value.is_null {
                return Ok(None);
            }
            mid.push((
                column.clone(),
                String::from_utf8_lossy(&value.data).to_string(),
            ));
        }
        Ok(Some(mid))
    }

    async fn get_rows_iterator(&self, range: &RangeInfo) -> anyhow::Result<Box<dyn RowIterator>> {
        let table = self.table(range.table_index());
        let mut rows = self.rows_in_range(table, &range.chunk_range);
        let order = select_unique_order_key(&table.info);
        rows.sort_by(|a, b| cmp_rows(table, a, b, &order));
        Ok(Box::new(SimpleRowsIterator::new(
            rows.iter().map(|row| to_row_data(table, row)).collect(),
        )))
    }

    async fn get_rows(&self, cond: &Cond) -> anyhow::Result<Box<dyn RowIterator>> {
        // Same single-column restriction the SQL rendering enforces.
        let _ = cond.where_clause()?;
        let table = &cond.table;
        let pk = table.primary_key.as_ref().expect("checked by where_clause");
        let pk_idx = pk_indices(table);
        let wanted: Vec<&String> = cond.pk_values.iter().map(|pk| &pk[0]).collect();
        let mut rows: Vec<MemRow> = self
            .rows(&table.full_name())
            .into_iter()
            .filter(|row| {
                let value = row[pk_idx[0]].clone().unwrap_or_default();
                wanted.iter().any(|w| **w == value)
            })
            .collect();
        rows.sort_by(|a, b| cmp_rows(table, a, b, &pk.columns));
        Ok(Box::new(SimpleRowsIterator::new(
            rows.iter().map(|row| to_row_data(table, row)).collect(),
        )))
    }

    fn generate_fix_sql(
        &self,
        kind: DmlKind,
        upstream: Option<&RowData>,
        downstream: Option<&RowData>,
        table_index: usize,
    ) -> String {
        let table = self.table(table_index);
        match kind {
            DmlKind::Insert | DmlKind::Replace => {
                let row = upstream.expect("insert/replace fix needs the upstream row");
                let names: Vec<String> = table
                    .info
                    .columns
                    .iter()
                    .map(|c| format!("`{}`", c.name))
                    .collect();
                let values: Vec<String> = table
                    .info
                    .columns
                    .iter()
                    .map(|c| sql_literal(row.get(&c.name)))
                    .collect();
                format!(
                    "REPLACE INTO `{}`.`{}` ({}) VALUES ({});",
                    table.schema,
                    table.table,
                    names.join(","),
                    values.join(",")
                )
            }
            DmlKind::Delete => {
                let row = downstream.expect("delete fix needs the downstream row");
                let conditions: Vec<String> = table
                    .info
                    .columns
                    .iter()
                    .map(|c| match row.get(&c.name) {
                        Some(value) if !value.is_null => {
                            format!("`{}` = {}", c.name, sql_literal(Some(value)))
                        }
                        _ => format!("`{}` IS NULL", c.name),
                    })
                    .collect();
                format!(
                    "DELETE FROM `{}`.`{}` WHERE {} LIMIT 1;",
                    table.schema,
                    table.table,
                    conditions.join(" AND ")
                )
            }
        }
    }

    async fn get_source_struct_info(&self, table_index: usize) -> anyhow::Result<Vec<TableInfo>> {
        Ok(vec![self.table(table_index).info.clone()])
    }
}

/// Scripted replica log: every connect pops the next script; an exhausted
/// script parks forever, like a quiet upstream.
pub enum ScriptItem {
    Event(LogEvent),
    Fatal(&'static str),
    Recoverable(&'static str),
}

pub fn rows_event(
    schema: &str,
    table: &str,
    kind: RowEventKind,
    rows: Vec<Vec<Option<&str>>>,
    timestamp: i64,
) -> ScriptItem {
    ScriptItem::Event(LogEvent {
        timestamp,
        log_pos: 0,
        data: EventData::Rows(RowsData {
            schema: schema.to_string(),
            table: table.to_string(),
            kind,
            rows: rows
                .into_iter()
                .map(|row| row.into_iter().map(|v| v.map(|v| v.to_string())).collect())
                .collect(),
            incomplete: false,
        }),
    })
}

/// A rows event whose column images were elided by the upstream.
pub fn incomplete_rows_event(
    schema: &str,
    table: &str,
    kind: RowEventKind,
    timestamp: i64,
) -> ScriptItem {
    ScriptItem::Event(LogEvent {
        timestamp,
        log_pos: 0,
        data: EventData::Rows(RowsData {
            schema: schema.to_string(),
            table: table.to_string(),
            kind,
            rows: Vec::new(),
            incomplete: true,
        }),
    })
}

pub struct ScriptedConnector {
    scripts: Mutex<VecDeque<Vec<ScriptItem>>>,
    reconnect_positions: Mutex<Vec<LogPosition>>,
}

impl ScriptedConnector {
    pub fn new(scripts: Vec<Vec<ScriptItem>>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            reconnect_positions: Mutex::new(Vec::new()),
        })
    }

    pub fn reconnects(&self) -> Vec<LogPosition> {
        self.reconnect_positions.lock().expect("positions lock").clone()
    }

    fn next_stream(&self) -> Box<dyn EventStream> {
        let items = self
            .scripts
            .lock()
            .expect("scripts lock")
            .pop_front()
            .unwrap_or_default();
        Box::new(ScriptedStream {
            items: items.into(),
        })
    }
}

#[async_trait]
impl StreamConnector for ScriptedConnector {
    async fn connect_from_start(&self, _server_id: u32) -> anyhow::Result<Box<dyn EventStream>> {
        Ok(self.next_stream())
    }

    async fn connect_at(
        &self,
        _server_id: u32,
        position: &LogPosition,
    ) -> anyhow::Result<Box<dyn EventStream>> {
        self.reconnect_positions
            .lock()
            .expect("positions lock")
            .push(position.clone());
        Ok(self.next_stream())
    }
}

struct ScriptedStream {
    items: VecDeque<ScriptItem>,
}

#[async_trait]
impl EventStream for ScriptedStream {
    async fn next_event(&mut self) -> Result<LogEvent, StreamError> {
        match self.items.pop_front() {
            Some(ScriptItem::Event(event)) => Ok(event),
            Some(ScriptItem::Fatal(msg)) => Err(StreamError::Fatal(anyhow::anyhow!(msg))),
            Some(ScriptItem::Recoverable(msg)) => {
                Err(StreamError::Recoverable(anyhow::anyhow!(msg)))
            }
            None => std::future::pending().await,
        }
    }
}

pub fn test_config(root: &std::path::Path, chunk_size: i64) -> Config {
    Config {
        fix_dir: root.join("fix"),
        checkpoint_dir: root.join("checkpoint"),
        chunk_size,
        check_thread_count: 2,
        ..Config::default()
    }
}

pub fn cancelled_token() -> CancellationToken {
    CancellationToken::new()
}

/// Fix-SQL files currently present under the fix dir, `.trash` excluded.
pub fn fix_files(fix_dir: &std::path::Path) -> Vec<std::path::PathBuf> {
    let mut out = Vec::new();
    let Ok(entries) = std::fs::read_dir(fix_dir) else {
        return out;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        if path.is_file() && name.ends_with(".sql") {
            out.push(path);
        }
    }
    out.sort();
    out
}
