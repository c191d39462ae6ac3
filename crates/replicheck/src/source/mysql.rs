//! MySQL/TiDB source implementation over a `sqlx` connection pool.
//!
//! Every value crosses the wire as bytes (`CAST(... AS BINARY)`) so the
//! comparison model never depends on driver-side type decoding; numeric
//! semantics come from `information_schema` metadata instead.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::Row;
use tokio_util::sync::CancellationToken;

use crate::chunk::{ChunkId, ChunkRange, ChunkType, RangeInfo};
use crate::source::{
    select_unique_order_key, ChecksumInfo, ColumnData, ColumnInfo, Cond, DmlKind, IndexInfo,
    RangeIterator, RowData, RowIterator, Source, TableDiff, TableInfo,
};

const GC_KEEPER_INTERVAL: Duration = Duration::from_secs(60);

const NUMERIC_TYPES: &[&str] = &[
    "tinyint", "smallint", "mediumint", "int", "bigint", "decimal", "numeric", "float", "double",
    "bit", "year",
];

pub struct MySqlSource {
    pool: MySqlPool,
    tables: Vec<Arc<TableDiff>>,
    snapshot: String,
}

impl MySqlSource {
    pub async fn connect(
        url: &str,
        snapshot: &str,
        table_filter: &[String],
        max_connections: u32,
    ) -> anyhow::Result<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(url)
            .await
            .context("connect to database")?;
        let tables = discover_tables(&pool, table_filter).await?;
        tracing::info!(tables = tables.len(), "discovered tables");
        Ok(Self {
            pool,
            tables,
            snapshot: snapshot.to_string(),
        })
    }

    fn table(&self, table_index: usize) -> &Arc<TableDiff> {
        &self.tables[table_index]
    }
}

#[async_trait]
impl Source for MySqlSource {
    fn tables(&self) -> &[Arc<TableDiff>] {
        &self.tables
    }

    fn snapshot(&self) -> &str {
        &self.snapshot
    }

    async fn is_tidb(&self) -> bool {
        match sqlx::query("SELECT VERSION()").fetch_one(&self.pool).await {
            Ok(row) => row
                .try_get::<String, _>(0)
                .map(|version| version.contains("TiDB"))
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn get_range_iterator(
        &self,
        start: Option<RangeInfo>,
        chunk_size: i64,
    ) -> anyhow::Result<Box<dyn RangeIterator>> {
        let table_index = start.as_ref().map(|r| r.table_index()).unwrap_or(0);
        Ok(Box::new(LimitRangeIterator {
            pool: self.pool.clone(),
            tables: self.tables.clone(),
            chunk_size: chunk_size.max(1),
            table_index,
            chunk_index: 0,
            chunk_cnt: -1,
            cursor: None,
            start,
        }))
    }

    async fn get_count_and_crc32(&self, range: &RangeInfo) -> anyhow::Result<ChecksumInfo> {
        let table = self.table(range.table_index());
        let columns = table.info.column_names();
        let mut concat_items: Vec<String> = columns.iter().map(|c| format!("`{c}`")).collect();
        concat_items.extend(columns.iter().map(|c| format!("ISNULL(`{c}`)")));
        let (cond, args) = range_condition(table, range);
        let sql = format!(
            "SELECT COUNT(*), CAST(IFNULL(BIT_XOR(CAST(CRC32(CONCAT_WS(',', {})) AS UNSIGNED)), 0) AS CHAR) \
             FROM `{}`.`{}` WHERE {}",
            concat_items.join(", "),
            table.schema,
            table.table,
            cond
        );
        let mut query = sqlx::query(&sql);
        for arg in &args {
            query = query.bind(arg.as_str());
        }
        let row = query
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("checksum query on {}", table.full_name()))?;
        let count: i64 = row.try_get(0)?;
        let crc: String = row.try_get(1)?;
        let checksum = crc.parse::<u64>().context("parse checksum value")?;
        Ok(ChecksumInfo { count, checksum })
    }

    async fn get_approximate_mid(
        &self,
        table: &TableDiff,
        columns: &[String],
        range: &RangeInfo,
        count: i64,
    ) -> anyhow::Result<Option<Vec<(String, String)>>> {
        let select_list: Vec<String> = columns
            .iter()
            .map(|c| format!("CAST(`{c}` AS CHAR)"))
            .collect();
        let order_by: Vec<String> = columns.iter().map(|c| format!("`{c}`")).collect();
        let (cond, args) = range_condition(table, range);
        let sql = format!(
            "SELECT {} FROM `{}`.`{}` WHERE {} ORDER BY {} LIMIT 1 OFFSET {}",
            select_list.join(", "),
            table.schema,
            table.table,
            cond,
            order_by.join(", "),
            (count / 2).max(0)
        );
        let mut query = sqlx::query(&sql);
        for arg in &args {
            query = query.bind(arg.as_str());
        }
        let Some(row) = query
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("midpoint query on {}", table.full_name()))?
        else {
            return Ok(None);
        };
        let mut mid = Vec::with_capacity(columns.len());
        for (i, column) in columns.iter().enumerate() {
            let value: Option<String> = row.try_get(i)?;
            let Some(value) = value else {
                return Ok(None);
            };
            mid.push((column.clone(), value));
        }
        Ok(Some(mid))
    }

    async fn get_rows_iterator(&self, range: &RangeInfo) -> anyhow::Result<Box<dyn RowIterator>> {
        let table = self.table(range.table_index());
        let order_names = select_unique_order_key(&table.info);
        let (cond, args) = range_condition(table, range);
        let sql = format!(
            "SELECT {} FROM `{}`.`{}` WHERE {} ORDER BY {}",
            binary_select_list(&table.info),
            table.schema,
            table.table,
            cond,
            quote_list(&order_names)
        );
        let mut query = sqlx::query(&sql);
        for arg in &args {
            query = query.bind(arg.as_str());
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("row query on {}", table.full_name()))?;
        Ok(Box::new(MySqlRowIterator {
            rows: decode_rows(&rows, &table.info)?.into_iter(),
        }))
    }

    async fn get_rows(&self, cond: &Cond) -> anyhow::Result<Box<dyn RowIterator>> {
        let table = &cond.table;
        let where_clause = cond.where_clause()?;
        let pk = table
            .primary_key
            .as_ref()
            .expect("where_clause already checked the key");
        let sql = format!(
            "SELECT {} FROM `{}`.`{}` WHERE {} ORDER BY {}",
            binary_select_list(&table.info),
            table.schema,
            table.table,
            where_clause,
            quote_list(&pk.columns)
        );
        let args = cond.args();
        let mut query = sqlx::query(&sql);
        for arg in &args {
            query = query.bind(arg.as_str());
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("keyed row query on {}", table.full_name()))?;
        Ok(Box::new(MySqlRowIterator {
            rows: decode_rows(&rows, &table.info)?.into_iter(),
        }))
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
                    .map(|c| sql_literal(row.get(&c.name), c.numeric))
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
                            format!("`{}` = {}", c.name, sql_literal(Some(value), c.numeric))
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
        let table = self.table(table_index);
        let (info, _tz) = load_table_info(&self.pool, &table.schema, &table.table).await?;
        Ok(vec![info])
    }

    /// Advisory GC holder for TiDB: re-assert a long GC life time so the
    /// snapshot the check reads at stays retained. Failure is a warning, not
    /// an abort.
    async fn start_gc_keeper(&self, ct: CancellationToken, snapshot: String) {
        let pool = self.pool.clone();
        tokio::spawn(async move {
            if !snapshot.is_empty() {
                tracing::info!(snapshot = %snapshot, "holding gc for the diff snapshot");
            }
            loop {
                let result = sqlx::query(
                    "UPDATE mysql.tidb SET VARIABLE_VALUE = '720h' WHERE VARIABLE_NAME = 'tikv_gc_life_time'",
                )
                .execute(&pool)
                .await;
                if let Err(err) = result {
                    tracing::warn!(
                        error = ?err,
                        "failed to keep gc stopped, ensure gc stays paused during the check"
                    );
                    return;
                }
                tokio::select! {
                    _ = ct.cancelled() => return,
                    _ = tokio::time::sleep(GC_KEEPER_INTERVAL) => {}
                }
            }
        });
    }
}

struct MySqlRowIterator {
    rows: std::vec::IntoIter<RowData>,
}

#[async_trait]
impl RowIterator for MySqlRowIterator {
    async fn next(&mut self) -> anyhow::Result<Option<RowData>> {
        Ok(self.rows.next())
    }
}

/// Enumerates chunks per table by walking the unique order key with
/// `LIMIT`-probed upper bounds. Tables without a usable key are verified as
/// one open chunk; empty and ignored tables yield a single `Empty` chunk so
/// the checkpoint frontier can cross them.
struct LimitRangeIterator {
    pool: MySqlPool,
    tables: Vec<Arc<TableDiff>>,
    chunk_size: i64,
    table_index: usize,
    chunk_index: i64,
    /// Estimated chunks in the current table; negative when not started.
    chunk_cnt: i64,
    cursor: Option<Vec<(String, String)>>,
    start: Option<RangeInfo>,
}

impl LimitRangeIterator {
    fn advance_table(&mut self) {
        self.table_index += 1;
        self.chunk_index = 0;
        self.chunk_cnt = -1;
        self.cursor = None;
    }

    fn empty_chunk(&self, table: &TableDiff) -> RangeInfo {
        RangeInfo {
            chunk_range: ChunkRange::new(
                ChunkId::new(self.table_index as i64, 0, 1),
                ChunkType::Empty,
            ),
            index_id: -1,
            progress_id: table.full_name(),
        }
    }

    fn open_chunk(&self, table: &TableDiff) -> RangeInfo {
        RangeInfo {
            chunk_range: ChunkRange::new(
                ChunkId::new(self.table_index as i64, 0, 1),
                ChunkType::Others,
            ),
            index_id: -1,
            progress_id: table.full_name(),
        }
    }

    fn split_key(table: &TableDiff) -> Option<IndexInfo> {
        table
            .primary_key
            .clone()
            .filter(|pk| pk.primary || pk.unique)
    }

    /// Last row of the chunk that starts at the cursor, or `None` when fewer
    /// than `chunk_size` rows remain (the final chunk stays unbounded above).
    async fn probe_upper(
        &self,
        table: &TableDiff,
        columns: &[String],
    ) -> anyhow::Result<Option<Vec<(String, String)>>> {
        let select_list: Vec<String> = columns
            .iter()
            .map(|c| format!("CAST(`{c}` AS CHAR)"))
            .collect();
        let mut probe_range = ChunkRange::new(ChunkId::floor(), ChunkType::Limit);
        if let Some(cursor) = &self.cursor {
            for (column, value) in cursor {
                probe_range.update(column, value, "", true, false);
            }
        }
        let (cond, args) = probe_range.to_condition(&table.collation);
        let sql = format!(
            "SELECT {} FROM `{}`.`{}` WHERE ({}) AND ({}) ORDER BY {} LIMIT 1 OFFSET {}",
            select_list.join(", "),
            table.schema,
            table.table,
            cond,
            table.range,
            quote_list(columns),
            self.chunk_size - 1
        );
        let mut query = sqlx::query(&sql);
        for arg in &args {
            query = query.bind(arg.as_str());
        }
        let Some(row) = query
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("chunk bound probe on {}", table.full_name()))?
        else {
            return Ok(None);
        };
        let mut upper = Vec::with_capacity(columns.len());
        for (i, column) in columns.iter().enumerate() {
            let value: Option<String> = row.try_get(i)?;
            let Some(value) = value else {
                return Ok(None);
            };
            upper.push((column.clone(), value));
        }
        Ok(Some(upper))
    }

    async fn table_row_count(&self, table: &TableDiff) -> anyhow::Result<i64> {
        let sql = format!(
            "SELECT COUNT(*) FROM `{}`.`{}` WHERE {}",
            table.schema, table.table, table.range
        );
        let row = sqlx::query(&sql)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("count rows of {}", table.full_name()))?;
        Ok(row.try_get(0)?)
    }
}

#[async_trait]
impl RangeIterator for LimitRangeIterator {
    async fn next(&mut self) -> anyhow::Result<Option<RangeInfo>> {
        loop {
            if self.table_index >= self.tables.len() {
                return Ok(None);
            }
            let table = self.tables[self.table_index].clone();

            if self.chunk_cnt < 0 {
                // Resume bookkeeping comes first: a final or empty start
                // chunk means the whole table is already checkpointed.
                if let Some(start) = self.start.take() {
                    let uppers: Vec<(String, String)> = start
                        .chunk_range
                        .bounds
                        .iter()
                        .filter(|b| b.has_upper)
                        .map(|b| (b.column.clone(), b.upper.clone()))
                        .collect();
                    let key_len = Self::split_key(&table).map(|k| k.columns.len()).unwrap_or(0);
                    if start.chunk_range.is_empty() || key_len == 0 || uppers.len() < key_len {
                        self.advance_table();
                        continue;
                    }
                    let count = self.table_row_count(&table).await?;
                    self.chunk_cnt = (count + self.chunk_size - 1) / self.chunk_size;
                    self.chunk_index = start.id().chunk_index + 1;
                    self.cursor = Some(uppers);
                } else {
                    if table.ignore_data_check.load(Ordering::Relaxed) {
                        let info = self.empty_chunk(&table);
                        self.advance_table();
                        return Ok(Some(info));
                    }
                    if Self::split_key(&table).is_none() {
                        let info = self.open_chunk(&table);
                        self.advance_table();
                        return Ok(Some(info));
                    }
                    let count = self.table_row_count(&table).await?;
                    if count == 0 {
                        let info = self.empty_chunk(&table);
                        self.advance_table();
                        return Ok(Some(info));
                    }
                    self.chunk_cnt = (count + self.chunk_size - 1) / self.chunk_size;
                    self.chunk_index = 0;
                    self.cursor = None;
                }
            }

            let key = Self::split_key(&table).expect("started tables have a split key");
            let upper = self.probe_upper(&table, &key.columns).await?;
            let is_final = upper.is_none();
            // The final chunk pins the count so the frontier's cross-table
            // successor check holds even when the estimate drifted.
            let chunk_cnt = if is_final {
                self.chunk_index + 1
            } else {
                self.chunk_cnt.max(self.chunk_index + 2)
            };
            let id = ChunkId::new(self.table_index as i64, self.chunk_index, chunk_cnt);
            let mut chunk_range = ChunkRange::new(id, ChunkType::Limit);
            for (i, column) in key.columns.iter().enumerate() {
                if let Some(cursor) = &self.cursor {
                    chunk_range.update(column, &cursor[i].1, "", true, false);
                }
                if let Some(upper) = &upper {
                    chunk_range.update(column, "", &upper[i].1, false, true);
                }
            }
            let info = RangeInfo {
                chunk_range,
                index_id: key.id,
                progress_id: table.full_name(),
            };
            self.chunk_index += 1;
            if is_final {
                self.advance_table();
            } else {
                self.cursor = upper;
            }
            return Ok(Some(info));
        }
    }
}

fn range_condition(table: &TableDiff, range: &RangeInfo) -> (String, Vec<String>) {
    let (cond, args) = range.chunk_range.to_condition(&table.collation);
    (format!("({}) AND ({})", cond, table.range), args)
}

fn quote_list(names: &[String]) -> String {
    let quoted: Vec<String> = names.iter().map(|n| format!("`{n}`")).collect();
    quoted.join(", ")
}

fn binary_select_list(info: &TableInfo) -> String {
    let items: Vec<String> = info
        .columns
        .iter()
        .map(|c| format!("CAST(`{0}` AS BINARY) AS `{0}`", c.name))
        .collect();
    items.join(", ")
}

fn decode_rows(rows: &[MySqlRow], info: &TableInfo) -> anyhow::Result<Vec<RowData>> {
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let mut data = RowData::new();
        for (i, col) in info.columns.iter().enumerate() {
            let value: Option<Vec<u8>> = row.try_get(i)?;
            data.insert(
                col.name.clone(),
                ColumnData {
                    is_null: value.is_none(),
                    data: value.map(Bytes::from).unwrap_or_default(),
                },
            );
        }
        out.push(data);
    }
    Ok(out)
}

fn sql_literal(value: Option<&ColumnData>, numeric: bool) -> String {
    let Some(value) = value else {
        return "NULL".to_string();
    };
    if value.is_null {
        return "NULL".to_string();
    }
    let text = String::from_utf8_lossy(&value.data);
    if numeric && (text.parse::<i128>().is_ok() || text.parse::<f64>().is_ok()) {
        return text.into_owned();
    }
    format!("'{}'", text.replace('\\', "\\\\").replace('\'', "\\'"))
}

async fn discover_tables(
    pool: &MySqlPool,
    table_filter: &[String],
) -> anyhow::Result<Vec<Arc<TableDiff>>> {
    let rows = sqlx::query(
        "SELECT table_schema, table_name FROM information_schema.tables \
         WHERE table_type = 'BASE TABLE' \
         AND table_schema NOT IN ('mysql', 'sys', 'information_schema', 'performance_schema', 'METRICS_SCHEMA', 'INSPECTION_SCHEMA') \
         ORDER BY table_schema, table_name",
    )
    .fetch_all(pool)
    .await
    .context("list tables")?;

    let mut tables = Vec::new();
    for row in rows {
        let schema: String = row.try_get(0)?;
        let name: String = row.try_get(1)?;
        if !table_filter.is_empty() && !table_filter.contains(&format!("{schema}.{name}")) {
            continue;
        }
        let (info, need_unified_time_zone) = load_table_info(pool, &schema, &name).await?;
        let primary_key = info.indices.iter().find(|i| i.primary).cloned();
        tables.push(Arc::new(TableDiff {
            schema,
            table: name,
            info,
            primary_key,
            range: "TRUE".to_string(),
            collation: String::new(),
            ignore_data_check: AtomicBool::new(false),
            need_unified_time_zone,
        }));
    }
    Ok(tables)
}

async fn load_table_info(
    pool: &MySqlPool,
    schema: &str,
    table: &str,
) -> anyhow::Result<(TableInfo, bool)> {
    let column_rows = sqlx::query(
        "SELECT column_name, data_type FROM information_schema.columns \
         WHERE table_schema = ? AND table_name = ? ORDER BY ordinal_position",
    )
    .bind(schema)
    .bind(table)
    .fetch_all(pool)
    .await
    .with_context(|| format!("load columns of {schema}.{table}"))?;

    let mut columns = Vec::with_capacity(column_rows.len());
    let mut need_unified_time_zone = false;
    for row in &column_rows {
        let name: String = row.try_get(0)?;
        let data_type: String = row.try_get(1)?;
        let data_type = data_type.to_ascii_lowercase();
        if data_type == "timestamp" {
            need_unified_time_zone = true;
        }
        columns.push(ColumnInfo {
            name,
            numeric: NUMERIC_TYPES.contains(&data_type.as_str()),
        });
    }

    let index_rows = sqlx::query(
        "SELECT index_name, CAST(non_unique AS CHAR), column_name \
         FROM information_schema.statistics \
         WHERE table_schema = ? AND table_name = ? ORDER BY index_name, seq_in_index",
    )
    .bind(schema)
    .bind(table)
    .fetch_all(pool)
    .await
    .with_context(|| format!("load indexes of {schema}.{table}"))?;

    let mut indices: Vec<IndexInfo> = Vec::new();
    for row in &index_rows {
        let name: String = row.try_get(0)?;
        let non_unique: String = row.try_get(1)?;
        let column: String = row.try_get(2)?;
        match indices.iter_mut().find(|i| i.name == name) {
            Some(index) => index.columns.push(column),
            None => indices.push(IndexInfo {
                id: 0,
                name: name.clone(),
                columns: vec![column],
                primary: name == "PRIMARY",
                unique: non_unique == "0",
            }),
        }
    }
    // PRIMARY first, then unique, so key selection favors the strongest key.
    indices.sort_by_key(|i| (!i.primary, !i.unique));
    for (i, index) in indices.iter_mut().enumerate() {
        index.id = i as i64;
    }

    Ok((TableInfo { columns, indices }, need_unified_time_zone))
}
