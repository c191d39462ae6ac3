use crate::chunk::RangeInfo;
use crate::source::Source;

/// Runs the count+CRC32 query on both sides in parallel. Equal means both
/// counts and both checksums agree; either side's error fails the chunk.
/// Counts could in principle diverge while checksums agree, so a count
/// mismatch alone already counts as unequal.
pub async fn compare_checksum_and_get_count(
    upstream: &dyn Source,
    downstream: &dyn Source,
    range: &RangeInfo,
) -> anyhow::Result<(bool, i64)> {
    let (upstream_info, downstream_info) = tokio::join!(
        upstream.get_count_and_crc32(range),
        downstream.get_count_and_crc32(range),
    );
    let upstream_info = match upstream_info {
        Ok(info) => info,
        Err(err) => {
            tracing::warn!(chunk = ?range.id(), "failed to compute upstream checksum");
            return Err(err);
        }
    };
    let downstream_info = match downstream_info {
        Ok(info) => info,
        Err(err) => {
            tracing::warn!(chunk = ?range.id(), "failed to compute downstream checksum");
            return Err(err);
        }
    };
    let equal = upstream_info.count == downstream_info.count
        && upstream_info.checksum == downstream_info.checksum;
    Ok((equal, upstream_info.count))
}
