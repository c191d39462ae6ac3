//! Chunk identity and key-space slices.
//!
//! A chunk is a bounded, index-aligned slice of one table's key space. The
//! identity (`ChunkId`) is totally ordered so the checkpoint frontier can
//! advance across a contiguous prefix, and so stale fix-SQL files can be
//! compared against a floor id on restart.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// Identity of one chunk. Ordered lexicographically on
/// `(table_index, bucket_index_left, bucket_index_right, chunk_index)`;
/// `chunk_cnt` is metadata (chunks in the table) and never participates in
/// the order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkId {
    pub table_index: i64,
    pub bucket_index_left: i64,
    pub bucket_index_right: i64,
    pub chunk_index: i64,
    pub chunk_cnt: i64,
}

impl ChunkId {
    pub fn new(table_index: i64, chunk_index: i64, chunk_cnt: i64) -> Self {
        Self {
            table_index,
            bucket_index_left: 0,
            bucket_index_right: 0,
            chunk_index,
            chunk_cnt,
        }
    }

    /// Sorts before every real chunk id. Used as the purge floor when no
    /// checkpoint exists.
    pub fn floor() -> Self {
        Self {
            table_index: -1,
            bucket_index_left: -1,
            bucket_index_right: -1,
            chunk_index: -1,
            chunk_cnt: 0,
        }
    }

    fn order_key(&self) -> (i64, i64, i64, i64) {
        (
            self.table_index,
            self.bucket_index_left,
            self.bucket_index_right,
            self.chunk_index,
        )
    }

    pub fn compare(&self, other: &ChunkId) -> Ordering {
        self.order_key().cmp(&other.order_key())
    }

    /// Whether `self` directly extends a frontier ending at `prev`: the next
    /// chunk of the same table, or the first chunk of the next table once the
    /// predecessor's table is complete. With no predecessor only the very
    /// first chunk qualifies.
    pub fn is_successor_of(&self, prev: Option<&ChunkId>) -> bool {
        match prev {
            None => self.table_index == 0 && self.chunk_index == 0,
            Some(p) => {
                if self.table_index == p.table_index {
                    self.chunk_index == p.chunk_index + 1
                } else {
                    self.table_index == p.table_index + 1
                        && self.chunk_index == 0
                        && p.chunk_index == p.chunk_cnt - 1
                }
            }
        }
    }

    /// Fix-SQL file name fragment: `table:bucketLeft-bucketRight:chunk`.
    pub fn to_file_fragment(&self) -> String {
        format!(
            "{}:{}-{}:{}",
            self.table_index, self.bucket_index_left, self.bucket_index_right, self.chunk_index
        )
    }

    /// Parses the fragment produced by [`ChunkId::to_file_fragment`].
    pub fn from_file_fragment(fragment: &str) -> Option<Self> {
        let mut fields = fragment.split(':');
        let table_index = fields.next()?.parse().ok()?;
        let buckets = fields.next()?;
        let chunk_index = fields.next()?.parse().ok()?;
        if fields.next().is_some() {
            return None;
        }
        let (left, right) = buckets.split_once('-')?;
        Some(Self {
            table_index,
            bucket_index_left: left.parse().ok()?,
            bucket_index_right: right.parse().ok()?,
            chunk_index,
            chunk_cnt: 0,
        })
    }
}

/// How a chunk's bounds were produced.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkType {
    Buckets,
    Random,
    Limit,
    Empty,
    Others,
}

/// One column of a chunk predicate. Bounds are lower-exclusive and
/// upper-inclusive; absent sides are open.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Bound {
    pub column: String,
    pub lower: String,
    pub upper: String,
    pub has_lower: bool,
    pub has_upper: bool,
}

/// A contiguous slice of one index's key space. All bounds reference columns
/// of a single index of a single table.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChunkRange {
    pub index: ChunkId,
    pub kind: ChunkType,
    pub bounds: Vec<Bound>,
}

impl ChunkRange {
    pub fn new(index: ChunkId, kind: ChunkType) -> Self {
        Self {
            index,
            kind,
            bounds: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.kind == ChunkType::Empty
    }

    /// Replaces one side of the bound on `column`, creating the bound if the
    /// column is not present yet. Used by bisection to move the split point.
    pub fn update(
        &mut self,
        column: &str,
        lower: &str,
        upper: &str,
        update_lower: bool,
        update_upper: bool,
    ) {
        let bound = match self.bounds.iter_mut().find(|b| b.column == column) {
            Some(b) => b,
            None => {
                self.bounds.push(Bound {
                    column: column.to_string(),
                    ..Bound::default()
                });
                self.bounds.last_mut().expect("just pushed")
            }
        };
        if update_lower {
            bound.lower = lower.to_string();
            bound.has_lower = true;
        }
        if update_upper {
            bound.upper = upper.to_string();
            bound.has_upper = true;
        }
    }

    /// Renders the predicate as a parameterized SQL condition plus its bind
    /// arguments. Composite bounds expand in index order:
    /// `(a > ?) OR (a = ? AND b > ?)` for the lower side, with `<` for every
    /// upper component except the last, which is `<=`.
    pub fn to_condition(&self, collation: &str) -> (String, Vec<String>) {
        let collate = if collation.is_empty() {
            String::new()
        } else {
            format!(" COLLATE '{collation}'")
        };

        let mut lower_conditions = Vec::new();
        let mut upper_conditions = Vec::new();
        let mut lower_args = Vec::new();
        let mut upper_args = Vec::new();
        let mut prefix_lower = Vec::new();
        let mut prefix_upper = Vec::new();
        let mut prefix_lower_args: Vec<String> = Vec::new();
        let mut prefix_upper_args: Vec<String> = Vec::new();

        let last_upper = self.bounds.iter().rposition(|b| b.has_upper);
        for (i, bound) in self.bounds.iter().enumerate() {
            if bound.has_lower {
                let mut parts = prefix_lower.clone();
                parts.push(format!("`{}`{} > ?", bound.column, collate));
                lower_args.extend(prefix_lower_args.iter().cloned());
                lower_args.push(bound.lower.clone());
                lower_conditions.push(format!("({})", parts.join(" AND ")));
                prefix_lower.push(format!("`{}`{} = ?", bound.column, collate));
                prefix_lower_args.push(bound.lower.clone());
            }
            if bound.has_upper {
                let symbol = if Some(i) == last_upper { "<=" } else { "<" };
                let mut parts = prefix_upper.clone();
                parts.push(format!("`{}`{} {} ?", bound.column, collate, symbol));
                upper_args.extend(prefix_upper_args.iter().cloned());
                upper_args.push(bound.upper.clone());
                upper_conditions.push(format!("({})", parts.join(" AND ")));
                prefix_upper.push(format!("`{}`{} = ?", bound.column, collate));
                prefix_upper_args.push(bound.upper.clone());
            }
        }

        let mut conditions = Vec::new();
        let mut args = Vec::new();
        if !lower_conditions.is_empty() {
            conditions.push(format!("({})", lower_conditions.join(" OR ")));
            args.extend(lower_args);
        }
        if !upper_conditions.is_empty() {
            conditions.push(format!("({})", upper_conditions.join(" OR ")));
            args.extend(upper_args);
        }
        if conditions.is_empty() {
            return ("TRUE".to_string(), Vec::new());
        }
        (conditions.join(" AND "), args)
    }

    /// Human-readable provenance line written into fix-SQL headers.
    pub fn to_meta(&self) -> String {
        let columns: Vec<&str> = self.bounds.iter().map(|b| b.column.as_str()).collect();
        let lowers: Vec<&str> = self
            .bounds
            .iter()
            .map(|b| if b.has_lower { b.lower.as_str() } else { "-inf" })
            .collect();
        let uppers: Vec<&str> = self
            .bounds
            .iter()
            .map(|b| if b.has_upper { b.upper.as_str() } else { "+inf" })
            .collect();
        format!(
            "range in sequence: ({}) < ({}) <= ({})",
            lowers.join(","),
            columns.join(","),
            uppers.join(",")
        )
    }
}

/// A chunk plus the context the pipeline needs to verify it: which index its
/// bounds refer to, and a display id for logs. Copied (not shared) during
/// bisection so each narrowing step owns its bounds.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RangeInfo {
    pub chunk_range: ChunkRange,
    pub index_id: i64,
    pub progress_id: String,
}

impl RangeInfo {
    pub fn table_index(&self) -> usize {
        self.chunk_range.index.table_index.max(0) as usize
    }

    pub fn id(&self) -> ChunkId {
        self.chunk_range.index
    }
}
