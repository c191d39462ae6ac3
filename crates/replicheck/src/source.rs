//! The source contract: everything the pipeline needs from a database side.
//!
//! A `Source` is a capability set over one logical side of the comparison:
//! table metadata, range enumeration, chunk checksums, ordered row iteration,
//! keyed row lookup, and fix-DML composition. The pipeline only ever talks to
//! these traits; dialect quirks stay behind the implementations.

pub mod mysql;

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::chunk::RangeInfo;
use crate::error::FatalError;

/// Session time zone written into fix-SQL files for tables with
/// zone-sensitive columns, so replays are deterministic.
pub const UNIFIED_TIME_ZONE: &str = "+0:00";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    /// Whether comparisons and ordering are numeric rather than bytewise.
    pub numeric: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexInfo {
    pub id: i64,
    pub name: String,
    pub columns: Vec<String>,
    pub primary: bool,
    pub unique: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TableInfo {
    pub columns: Vec<ColumnInfo>,
    pub indices: Vec<IndexInfo>,
}

impl TableInfo {
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn index_by_id(&self, id: i64) -> Option<&IndexInfo> {
        self.indices.iter().find(|i| i.id == id)
    }
}

/// One table shared by both sides of the comparison.
#[derive(Debug)]
pub struct TableDiff {
    pub schema: String,
    pub table: String,
    pub info: TableInfo,
    pub primary_key: Option<IndexInfo>,
    /// Extra row filter ANDed into every chunk predicate, `TRUE` when unset.
    pub range: String,
    pub collation: String,
    /// Set by the structural phase when the column sets diverge in a way the
    /// data phase cannot compare; such tables are skipped.
    pub ignore_data_check: AtomicBool,
    pub need_unified_time_zone: bool,
}

impl TableDiff {
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnData {
    pub data: Bytes,
    pub is_null: bool,
}

const NULL_COLUMN: ColumnData = ColumnData {
    data: Bytes::new(),
    is_null: true,
};

/// One row keyed by column name.
pub type RowData = BTreeMap<String, ColumnData>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChecksumInfo {
    pub count: i64,
    pub checksum: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DmlKind {
    Insert,
    Delete,
    Replace,
}

/// Keyed row lookup predicate used by continuous validation: fetch the rows
/// whose primary keys are in `pk_values`, sorted by primary key.
pub struct Cond {
    pub table: Arc<TableDiff>,
    pub pk_values: Vec<Vec<String>>,
}

impl Cond {
    /// Renders `pk IN (?, ...)`. Composite primary keys cannot be expressed
    /// this way and abort continuous validation.
    pub fn where_clause(&self) -> anyhow::Result<String> {
        let pk = self
            .table
            .primary_key
            .as_ref()
            .ok_or_else(|| FatalError::MissingPrimaryKey {
                schema: self.table.schema.clone(),
                table: self.table.table.clone(),
            })?;
        if pk.columns.len() != 1 {
            return Err(FatalError::CompositePrimaryKey {
                schema: self.table.schema.clone(),
                table: self.table.table.clone(),
            }
            .into());
        }
        let placeholders = vec!["?"; self.pk_values.len()].join(", ");
        Ok(format!("`{}` IN ({})", pk.columns[0], placeholders))
    }

    pub fn args(&self) -> Vec<String> {
        self.pk_values.iter().flatten().cloned().collect()
    }
}

#[async_trait]
pub trait RowIterator: Send {
    /// Next row in order, or `None` on exhaustion.
    async fn next(&mut self) -> anyhow::Result<Option<RowData>>;
}

#[async_trait]
pub trait RangeIterator: Send {
    /// Next chunk to verify, or `None` when every table is enumerated.
    async fn next(&mut self) -> anyhow::Result<Option<RangeInfo>>;
}

#[async_trait]
pub trait Source: Send + Sync {
    fn tables(&self) -> &[Arc<TableDiff>];

    fn table_by_name(&self, schema: &str, table: &str) -> Option<Arc<TableDiff>> {
        self.tables()
            .iter()
            .find(|t| t.schema == schema && t.table == table)
            .cloned()
    }

    /// Snapshot identifier this side reads at, empty when unpinned.
    fn snapshot(&self) -> &str;

    async fn is_tidb(&self) -> bool;

    /// Enumerates chunks for every table, resuming immediately after
    /// `start` when a checkpoint was loaded.
    async fn get_range_iterator(
        &self,
        start: Option<RangeInfo>,
        chunk_size: i64,
    ) -> anyhow::Result<Box<dyn RangeIterator>>;

    async fn get_count_and_crc32(&self, range: &RangeInfo) -> anyhow::Result<ChecksumInfo>;

    /// Approximate median of `columns` over the chunk predicate, one value
    /// per column, or `None` when the range holds no usable midpoint.
    async fn get_approximate_mid(
        &self,
        table: &TableDiff,
        columns: &[String],
        range: &RangeInfo,
        count: i64,
    ) -> anyhow::Result<Option<Vec<(String, String)>>>;

    /// Rows of the chunk in unique-order-key order.
    async fn get_rows_iterator(&self, range: &RangeInfo) -> anyhow::Result<Box<dyn RowIterator>>;

    /// Rows whose primary keys are listed in `cond`, sorted by primary key.
    async fn get_rows(&self, cond: &Cond) -> anyhow::Result<Box<dyn RowIterator>>;

    fn generate_fix_sql(
        &self,
        kind: DmlKind,
        upstream: Option<&RowData>,
        downstream: Option<&RowData>,
        table_index: usize,
    ) -> String;

    async fn get_source_struct_info(&self, table_index: usize) -> anyhow::Result<Vec<TableInfo>>;

    /// Advisory GC holder for snapshot-bearing backends; default no-op.
    async fn start_gc_keeper(&self, _ct: CancellationToken, _snapshot: String) {}
}

/// Pre-materialized rows behind the iterator contract; used when upstream
/// values come from the replica log instead of a query.
pub struct SimpleRowsIterator {
    rows: std::vec::IntoIter<RowData>,
}

impl SimpleRowsIterator {
    pub fn new(rows: Vec<RowData>) -> Self {
        Self {
            rows: rows.into_iter(),
        }
    }
}

#[async_trait]
impl RowIterator for SimpleRowsIterator {
    async fn next(&mut self) -> anyhow::Result<Option<RowData>> {
        Ok(self.rows.next())
    }
}

/// Columns rows are merged on: the primary key when there is one, else the
/// first unique index, else every column.
pub fn select_unique_order_key(info: &TableInfo) -> Vec<String> {
    if let Some(primary) = info.indices.iter().find(|i| i.primary) {
        return primary.columns.clone();
    }
    if let Some(unique) = info.indices.iter().find(|i| i.unique) {
        return unique.columns.clone();
    }
    info.column_names()
}

/// Orders two column values. NULL sorts first; numeric columns compare as
/// integers when both sides parse, falling back to floats and then bytes.
pub fn compare_column_values(a: &ColumnData, b: &ColumnData, numeric: bool) -> Ordering {
    match (a.is_null, b.is_null) {
        (true, true) => return Ordering::Equal,
        (true, false) => return Ordering::Less,
        (false, true) => return Ordering::Greater,
        (false, false) => {}
    }
    if numeric {
        let (a_str, b_str) = (
            String::from_utf8_lossy(&a.data),
            String::from_utf8_lossy(&b.data),
        );
        if let (Ok(x), Ok(y)) = (a_str.trim().parse::<i128>(), b_str.trim().parse::<i128>()) {
            return x.cmp(&y);
        }
        if let (Ok(x), Ok(y)) = (a_str.trim().parse::<f64>(), b_str.trim().parse::<f64>()) {
            if let Some(ord) = x.partial_cmp(&y) {
                return ord;
            }
        }
    }
    a.data.cmp(&b.data)
}

/// Compares two rows: the ordering is taken over `order_cols` only, equality
/// over every column in `columns`.
pub fn compare_data(
    upstream: &RowData,
    downstream: &RowData,
    order_cols: &[ColumnInfo],
    columns: &[ColumnInfo],
) -> (bool, Ordering) {
    let mut cmp = Ordering::Equal;
    for col in order_cols {
        let a = upstream.get(&col.name).unwrap_or(&NULL_COLUMN).clone();
        let b = downstream.get(&col.name).unwrap_or(&NULL_COLUMN).clone();
        cmp = compare_column_values(&a, &b, col.numeric);
        if cmp != Ordering::Equal {
            return (false, cmp);
        }
    }
    for col in columns {
        let a = upstream.get(&col.name).unwrap_or(&NULL_COLUMN).clone();
        let b = downstream.get(&col.name).unwrap_or(&NULL_COLUMN).clone();
        if a != b {
            return (false, cmp);
        }
    }
    (true, cmp)
}

/// Structural comparison of every upstream variant against the downstream
/// table. Returns `(equal, skip)`: differing column sets cannot be
/// data-checked at all (`skip`), differing order or types are unequal but
/// still comparable.
pub fn compare_struct(source_infos: &[TableInfo], target: &TableInfo) -> (bool, bool) {
    let mut target_names: Vec<&str> = target.columns.iter().map(|c| c.name.as_str()).collect();
    target_names.sort_unstable();
    let mut equal = true;
    for info in source_infos {
        let mut names: Vec<&str> = info.columns.iter().map(|c| c.name.as_str()).collect();
        names.sort_unstable();
        if names != target_names {
            return (false, true);
        }
        if info.columns != target.columns {
            equal = false;
        }
    }
    (equal, false)
}
