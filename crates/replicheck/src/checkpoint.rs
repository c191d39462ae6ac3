//! Verified-chunk frontier.
//!
//! Workers finish chunks in arbitrary order; the store holds completed nodes
//! in a min-heap and only lets the persisted frontier advance across a
//! contiguous prefix of the chunk-id order. The on-disk record is a
//! `len | crc32 | payload` frame written to a temp file and renamed into
//! place, so a torn write is detected on load rather than silently resumed.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Mutex;

use anyhow::Context;
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};

use crate::chunk::{ChunkId, ChunkRange, RangeInfo};
use crate::report::Report;

/// File the frontier and report snapshot are persisted to, under the
/// configured checkpoint directory.
pub const CHECKPOINT_FILE: &str = "sync_diff_checkpoints.pb";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    /// Both sides agree on the chunk, directly or through bisection.
    Success,
    /// The chunk diverged or its verification errored.
    Failed,
    /// The chunk was empty and skipped, but still occupies frontier order.
    Ignore,
}

/// One completed chunk in checkpoint order.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Node {
    pub chunk_range: ChunkRange,
    pub index_id: i64,
    pub state: NodeState,
}

impl Node {
    pub fn from_range(range: &RangeInfo, state: NodeState) -> Self {
        Self {
            chunk_range: range.chunk_range.clone(),
            index_id: range.index_id,
            state,
        }
    }

    pub fn id(&self) -> ChunkId {
        self.chunk_range.index
    }

    pub fn table_index(&self) -> usize {
        self.chunk_range.index.table_index.max(0) as usize
    }

    /// Rebuilds the resume point the range iterator continues after.
    pub fn to_range(&self, progress_id: String) -> RangeInfo {
        RangeInfo {
            chunk_range: self.chunk_range.clone(),
            index_id: self.index_id,
            progress_id,
        }
    }
}

struct Pending(Node);

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.0.id().compare(&other.0.id()) == Ordering::Equal
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so the BinaryHeap pops the smallest chunk id first.
        other.0.id().compare(&self.0.id())
    }
}

#[derive(Default)]
struct Inner {
    heap: BinaryHeap<Pending>,
    current: Option<ChunkId>,
}

/// Thread-safe store of completed nodes and the last-flushed frontier id.
#[derive(Default)]
pub struct Checkpoint {
    inner: Mutex<Inner>,
}

#[derive(Serialize, Deserialize)]
struct SavedState {
    node: Node,
    report: Report,
}

impl Checkpoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resets all in-memory state.
    pub fn init(&self) {
        let mut inner = self.inner.lock().expect("checkpoint lock");
        inner.heap.clear();
        inner.current = None;
    }

    /// Primes the frontier from a loaded checkpoint so only chunks after it
    /// are expected.
    pub fn init_current_saved_id(&self, node: &Node) {
        let mut inner = self.inner.lock().expect("checkpoint lock");
        inner.current = Some(node.id());
    }

    /// Records a completed chunk. Nodes may arrive in any order.
    pub fn insert(&self, node: Node) {
        let mut inner = self.inner.lock().expect("checkpoint lock");
        inner.heap.push(Pending(node));
    }

    /// Pops every node that extends the contiguous prefix and returns the
    /// newest one, or `None` if the frontier did not move since the last
    /// call.
    pub fn get_chunk_snapshot(&self) -> Option<Node> {
        let mut inner = self.inner.lock().expect("checkpoint lock");
        let mut newest = None;
        loop {
            let advances = match inner.heap.peek() {
                Some(pending) => pending.0.id().is_successor_of(inner.current.as_ref()),
                None => false,
            };
            if !advances {
                break;
            }
            let node = inner.heap.pop().expect("peeked above").0;
            inner.current = Some(node.id());
            newest = Some(node);
        }
        newest
    }

    /// Atomically persists the frontier node and the report snapshot.
    /// Safe to call concurrently with `insert`.
    pub fn save_chunk(&self, path: &Path, node: &Node, report: &Report) -> anyhow::Result<()> {
        let payload = serde_json::to_vec(&SavedState {
            node: node.clone(),
            report: report.clone(),
        })
        .context("encode checkpoint")?;

        let tmp_path = path.with_extension("pb.tmp");
        let mut out = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp_path)
            .context("open checkpoint temp")?;
        write_record(&mut out, &payload).context("write checkpoint record")?;
        out.flush()?;
        out.sync_all()?;
        fs::rename(&tmp_path, path).context("replace checkpoint file")?;
        tracing::debug!(chunk = ?node.id(), state = ?node.state, "saved checkpoint");
        Ok(())
    }

    /// Loads the persisted frontier, or `None` when no checkpoint exists.
    /// A corrupt or truncated file is an error, never a silent restart.
    pub fn load_chunk(path: &Path) -> anyhow::Result<Option<(Node, Report)>> {
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).context("open checkpoint file"),
        };
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).context("read checkpoint file")?;
        let payload = read_record(&buf)?;
        let saved: SavedState =
            serde_json::from_slice(payload).context("decode checkpoint payload")?;
        Ok(Some((saved.node, saved.report)))
    }
}

fn write_record(file: &mut File, payload: &[u8]) -> std::io::Result<()> {
    let len = payload.len() as u32;
    let mut hasher = Hasher::new();
    hasher.update(payload);
    let checksum = hasher.finalize();
    file.write_all(&len.to_be_bytes())?;
    file.write_all(&checksum.to_be_bytes())?;
    file.write_all(payload)?;
    Ok(())
}

fn read_record(buf: &[u8]) -> anyhow::Result<&[u8]> {
    anyhow::ensure!(buf.len() >= 8, "checkpoint file too short");
    let len = u32::from_be_bytes(buf[0..4].try_into().expect("fixed slice")) as usize;
    let expected_crc = u32::from_be_bytes(buf[4..8].try_into().expect("fixed slice"));
    anyhow::ensure!(buf.len() == 8 + len, "checkpoint record length mismatch");
    let payload = &buf[8..];
    let mut hasher = Hasher::new();
    hasher.update(payload);
    anyhow::ensure!(hasher.finalize() == expected_crc, "checkpoint checksum mismatch");
    Ok(payload)
}
