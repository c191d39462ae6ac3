//! Crash/resume protocol: a run killed after a fix file was written but
//! before its node was persisted must quarantine that file on restart,
//! resume right after the persisted frontier, and regenerate the file.

mod common;

use std::fs;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use common::{fix_files, int_rows, table_diff, test_config, MemSource};
use replicheck::checkpoint::{Checkpoint, Node, NodeState, CHECKPOINT_FILE};
use replicheck::chunk::RangeInfo;
use replicheck::fixsql::fix_file_name;
use replicheck::report::Report;
use replicheck::source::Source;
use replicheck::Diff;

async fn enumerate_chunks(source: &Arc<MemSource>, chunk_size: i64) -> Vec<RangeInfo> {
    let dyn_source: Arc<dyn Source> = source.clone();
    let mut iter = dyn_source.get_range_iterator(None, chunk_size).await.unwrap();
    let mut chunks = Vec::new();
    while let Some(chunk) = iter.next().await.unwrap() {
        chunks.push(chunk);
    }
    chunks
}

#[tokio::test]
async fn resume_purges_stale_fix_files_and_reverifies_the_tail() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = test_config(tmp.path(), 2);

    let table = table_diff("s", "t", &[("id", true), ("v", false)], Some(&["id"]));
    let upstream = MemSource::new(vec![table.clone()]);
    let downstream = MemSource::new(vec![table.clone()]);
    upstream.set_rows("s.t", int_rows(10, |i| format!("v{i}")));
    let mut rows = int_rows(10, |i| format!("v{i}"));
    rows[8][1] = Some("stale-value".to_string());
    downstream.set_rows("s.t", rows);

    let chunks = enumerate_chunks(&downstream, 2).await;
    assert_eq!(chunks.len(), 5);

    // Simulate the dying run: chunk 2 made it into the checkpoint; chunk 4's
    // fix file hit disk but its node never did.
    fs::create_dir_all(&cfg.fix_dir).unwrap();
    fs::create_dir_all(&cfg.checkpoint_dir).unwrap();
    let checkpoint_path = cfg.checkpoint_dir.join(CHECKPOINT_FILE);
    let frontier = Node::from_range(&chunks[2], NodeState::Success);
    Checkpoint::new()
        .save_chunk(&checkpoint_path, &frontier, &Report::default())
        .unwrap();

    let stale = cfg.fix_dir.join(fix_file_name(&table, &chunks[4].id()));
    fs::write(&stale, "-- interrupted write\n").unwrap();
    let kept = cfg.fix_dir.join(fix_file_name(&table, &chunks[1].id()));
    fs::write(&kept, "-- behind the frontier\n").unwrap();

    let ct = CancellationToken::new();
    let up_dyn: Arc<dyn Source> = upstream.clone();
    let down_dyn: Arc<dyn Source> = downstream.clone();
    let diff = Diff::new(&cfg, up_dyn, down_dyn, &ct).await.unwrap();

    // Startup purge: only the file beyond the frontier was quarantined.
    assert!(!stale.exists());
    assert!(kept.exists());

    diff.equal(&ct).await.unwrap();

    // Only chunks 3 and 4 were re-verified.
    assert_eq!(upstream.checksum_calls(), 2);

    // Chunk 4 was re-written with the real fix.
    assert!(stale.exists());
    let content = fs::read_to_string(&stale).unwrap();
    assert!(content.contains("REPLACE INTO `s`.`t`"));
    assert!(content.contains("'9'"));

    let (node, _report) = Checkpoint::load_chunk(&checkpoint_path).unwrap().unwrap();
    assert_eq!(node.id().chunk_index, 4);
    assert_eq!(node.state, NodeState::Failed);
    assert!(!diff.pass());
}

#[tokio::test]
async fn resume_past_a_completed_table_starts_the_next_one() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = test_config(tmp.path(), 10);

    let t1 = table_diff("s", "t1", &[("id", true), ("v", false)], Some(&["id"]));
    let t2 = table_diff("s", "t2", &[("id", true), ("v", false)], Some(&["id"]));
    let upstream = MemSource::new(vec![t1.clone(), t2.clone()]);
    let downstream = MemSource::new(vec![t1, t2]);
    for source in [&upstream, &downstream] {
        source.set_rows("s.t1", int_rows(3, |i| format!("a{i}")));
        source.set_rows("s.t2", int_rows(3, |i| format!("b{i}")));
    }

    // Frontier at t1's only (final) chunk: resumption must not touch t1.
    let chunks = enumerate_chunks(&downstream, 10).await;
    assert_eq!(chunks.len(), 2);
    fs::create_dir_all(&cfg.checkpoint_dir).unwrap();
    let checkpoint_path = cfg.checkpoint_dir.join(CHECKPOINT_FILE);
    Checkpoint::new()
        .save_chunk(
            &checkpoint_path,
            &Node::from_range(&chunks[0], NodeState::Success),
            &Report::default(),
        )
        .unwrap();

    let ct = CancellationToken::new();
    let up_dyn: Arc<dyn Source> = upstream.clone();
    let down_dyn: Arc<dyn Source> = downstream.clone();
    let diff = Diff::new(&cfg, up_dyn, down_dyn, &ct).await.unwrap();
    diff.equal(&ct).await.unwrap();

    assert_eq!(upstream.checksum_calls(), 1, "only t2's chunk is verified");
    let (node, _report) = Checkpoint::load_chunk(&checkpoint_path).unwrap().unwrap();
    assert_eq!(node.id().table_index, 1);
    assert_eq!(node.state, NodeState::Success);
    assert!(fix_files(&cfg.fix_dir).is_empty());
}
