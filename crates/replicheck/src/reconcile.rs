//! Row-level reconciliation: a streaming merge-join of the ordered row sets
//! of both sides, emitting the fix DML that would make downstream agree with
//! upstream over the range.

use crate::checkpoint::Node;
use crate::chunk::RangeInfo;
use crate::source::{
    compare_data, select_unique_order_key, ColumnInfo, DmlKind, Source,
};

/// Fix statements for one chunk plus the node that must reach the checkpoint
/// only after the statements are durably written.
#[derive(Debug)]
pub struct ChunkDml {
    pub node: Node,
    pub sqls: Vec<String>,
    pub row_add: usize,
    pub row_delete: usize,
}

impl ChunkDml {
    pub fn new(node: Node) -> Self {
        Self {
            node,
            sqls: Vec::new(),
            row_add: 0,
            row_delete: 0,
        }
    }
}

/// Merge-joins both sides over `range` by the table's unique order key.
/// Emits INSERT for upstream-only rows, DELETE for downstream-only rows and
/// REPLACE when the key matches but the payload differs. Returns whether the
/// range was equal (no fix emitted).
pub async fn compare_rows(
    upstream: &dyn Source,
    downstream: &dyn Source,
    work_source: &dyn Source,
    range: &RangeInfo,
    dml: &mut ChunkDml,
) -> anyhow::Result<bool> {
    let table_index = range.table_index();
    let info = &work_source.tables()[table_index].info;
    let order_names = select_unique_order_key(info);
    let order_cols: Vec<ColumnInfo> = order_names
        .iter()
        .filter_map(|name| info.column(name).cloned())
        .collect();

    let mut upstream_rows = upstream.get_rows_iterator(range).await?;
    let mut downstream_rows = downstream.get_rows_iterator(range).await?;

    let mut last_upstream = None;
    let mut last_downstream = None;
    let mut rows_add = 0usize;
    let mut rows_delete = 0usize;
    let mut equal = true;

    loop {
        if last_upstream.is_none() {
            last_upstream = upstream_rows.next().await?;
        }
        if last_downstream.is_none() {
            last_downstream = downstream_rows.next().await?;
        }

        if last_upstream.is_none() {
            // Upstream is drained; every remaining downstream row is surplus.
            while let Some(down) = last_downstream.take() {
                let sql = downstream.generate_fix_sql(DmlKind::Delete, None, Some(&down), table_index);
                rows_delete += 1;
                tracing::debug!(sql = %sql, "[delete]");
                dml.sqls.push(sql);
                equal = false;
                last_downstream = downstream_rows.next().await?;
            }
            break;
        }

        if last_downstream.is_none() {
            // Downstream is drained; every remaining upstream row is missing.
            while let Some(up) = last_upstream.take() {
                let sql = downstream.generate_fix_sql(DmlKind::Insert, Some(&up), None, table_index);
                rows_add += 1;
                tracing::debug!(sql = %sql, "[insert]");
                dml.sqls.push(sql);
                equal = false;
                last_upstream = upstream_rows.next().await?;
            }
            break;
        }

        let up = last_upstream.as_ref().expect("checked above");
        let down = last_downstream.as_ref().expect("checked above");
        let (eq, cmp) = compare_data(up, down, &order_cols, &info.columns);
        if eq {
            last_upstream = None;
            last_downstream = None;
            continue;
        }

        equal = false;
        let sql = match cmp {
            std::cmp::Ordering::Greater => {
                let sql =
                    downstream.generate_fix_sql(DmlKind::Delete, Some(up), Some(down), table_index);
                rows_delete += 1;
                tracing::debug!(sql = %sql, "[delete]");
                last_downstream = None;
                sql
            }
            std::cmp::Ordering::Less => {
                let sql =
                    downstream.generate_fix_sql(DmlKind::Insert, Some(up), Some(down), table_index);
                rows_add += 1;
                tracing::debug!(sql = %sql, "[insert]");
                last_upstream = None;
                sql
            }
            std::cmp::Ordering::Equal => {
                let sql =
                    downstream.generate_fix_sql(DmlKind::Replace, Some(up), Some(down), table_index);
                rows_add += 1;
                rows_delete += 1;
                tracing::debug!(sql = %sql, "[replace]");
                last_upstream = None;
                last_downstream = None;
                sql
            }
        };
        dml.sqls.push(sql);
    }

    dml.row_add = rows_add;
    dml.row_delete = rows_delete;
    Ok(equal)
}
