use std::path::PathBuf;

/// Runtime options the core observes. Built from the CLI by the binary;
/// library embedders fill it directly.
#[derive(Clone, Debug)]
pub struct Config {
    pub upstream_url: String,
    pub downstream_url: String,
    /// Snapshot identifiers each side reads at; empty when unpinned.
    pub upstream_snapshot: String,
    pub downstream_snapshot: String,
    /// Worker pool parallelism for chunk verification.
    pub check_thread_count: usize,
    /// When false, mismatched chunks are reported but never reconciled.
    pub export_fix_sql: bool,
    /// Stop after the structural phase.
    pub check_struct_only: bool,
    /// Continuous validation instead of the batch snapshot check.
    pub incremental: bool,
    /// In continuous mode, trust the replica log after-image instead of
    /// re-querying the upstream.
    pub use_binlog_for_compare: bool,
    pub fix_dir: PathBuf,
    pub checkpoint_dir: PathBuf,
    /// Target rows per chunk in the batch phase.
    pub chunk_size: i64,
    /// Optional `schema.table` allowlist; empty checks every shared table.
    pub tables: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            upstream_url: String::new(),
            downstream_url: String::new(),
            upstream_snapshot: String::new(),
            downstream_snapshot: String::new(),
            check_thread_count: 4,
            export_fix_sql: true,
            check_struct_only: false,
            incremental: false,
            use_binlog_for_compare: false,
            fix_dir: PathBuf::from("output/fix-on-downstream"),
            checkpoint_dir: PathBuf::from("output/checkpoint"),
            chunk_size: 50_000,
            tables: Vec::new(),
        }
    }
}
