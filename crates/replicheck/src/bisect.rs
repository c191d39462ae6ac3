//! Narrowing of a mismatched chunk by repeated halving at the approximate
//! median of a usable unique index, until the divergent range is small enough
//! for row-level reconciliation.

use crate::checksum::compare_checksum_and_get_count;
use crate::chunk::RangeInfo;
use crate::error::FatalError;
use crate::source::Source;

/// Chunks at or below this row count go straight to row reconciliation.
pub const SPLIT_THRESHOLD: i64 = 1000;

/// Returns a sub-range of `range` that still mismatches but holds at most
/// [`SPLIT_THRESHOLD`] rows, or the original range when the preconditions for
/// splitting are not met. Splitting requires the range's index to exist and
/// be PRIMARY or UNIQUE; anything else falls back to whole-chunk
/// reconciliation.
pub async fn bin_generate(
    work_source: &dyn Source,
    upstream: &dyn Source,
    downstream: &dyn Source,
    range: &RangeInfo,
    count: i64,
) -> anyhow::Result<RangeInfo> {
    if count <= SPLIT_THRESHOLD {
        return Ok(range.clone());
    }
    let table = &work_source.tables()[range.table_index()];
    if table.info.indices.is_empty() {
        tracing::warn!(
            table = %table.full_name(),
            "no index to split on, narrowing disabled"
        );
        return Ok(range.clone());
    }
    let index = match table.info.index_by_id(range.index_id) {
        Some(index) => index,
        None => {
            tracing::warn!(
                table = %table.full_name(),
                index_id = range.index_id,
                "chunk index is not an index of the table, narrowing disabled"
            );
            return Ok(range.clone());
        }
    };
    if !(index.primary || index.unique) {
        tracing::warn!(
            table = %table.full_name(),
            index = %index.name,
            "narrowing only supports PRIMARY or UNIQUE indexes"
        );
        return Ok(range.clone());
    }
    let index_columns = index.columns.clone();
    if index_columns.is_empty() {
        tracing::warn!(
            table = %table.full_name(),
            "selected index has no columns, returning the original chunk"
        );
        return Ok(range.clone());
    }

    bin_search(
        work_source,
        upstream,
        downstream,
        range.clone(),
        count,
        &index_columns,
    )
    .await
}

async fn bin_search(
    work_source: &dyn Source,
    upstream: &dyn Source,
    downstream: &dyn Source,
    mut range: RangeInfo,
    mut count: i64,
    index_columns: &[String],
) -> anyhow::Result<RangeInfo> {
    let table = &work_source.tables()[range.table_index()];
    loop {
        if count <= SPLIT_THRESHOLD {
            return Ok(range);
        }
        let mid = match work_source
            .get_approximate_mid(table, index_columns, &range, count)
            .await?
        {
            Some(mid) => mid,
            None => {
                tracing::warn!(chunk = ?range.id(), "no midpoint found, stop narrowing");
                return Ok(range);
            }
        };

        let mut range1 = range.clone();
        let mut range2 = range.clone();
        for (column, value) in &mid {
            range1.chunk_range.update(column, "", value, false, true);
            range2.chunk_range.update(column, value, "", true, false);
        }
        tracing::debug!(chunk = ?range.id(), mid = ?mid, "split chunk at midpoint");

        let (equal1, count1) =
            compare_checksum_and_get_count(upstream, downstream, &range1).await?;
        let (equal2, count2) =
            compare_checksum_and_get_count(upstream, downstream, &range2).await?;
        if count1 + count2 != count {
            return Err(FatalError::SplitCountMismatch {
                left: count1,
                right: count2,
                parent: count,
            }
            .into());
        }
        tracing::info!(
            chunk = ?range.id(),
            count1,
            count2,
            "chunk split successfully"
        );

        match (equal1, equal2) {
            // Divergence on both sides of the midpoint; splitting further
            // would not localize anything.
            (false, false) => return Ok(range),
            (false, true) => {
                range = range1;
                count = count1;
            }
            (true, false) => {
                range = range2;
                count = count2;
            }
            // The parent mismatched, so its halves cannot both verify equal.
            (true, true) => return Err(FatalError::SplitBothHalvesEqual.into()),
        }
    }
}
