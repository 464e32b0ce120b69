//! Full generate and rebuild runs over an in-process cluster.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;
use xorstor_common::config::Config;
use xorstor_common::{ChangeKind, PlacementRecord, Result, TargetMask, TargetSlot};
use xorstor_meta_store::PlacementStore;
use xorstor_parity::{RunPaths, RunSummary, run_generate, run_rebuild};
use xorstor_placement::weights::FREE_SPACE_OVERRIDE_FILE;
use xorstor_placement::{PlacementResolver, PlacementWeights, RawEvent};
use xorstor_transport::{ChannelFabric, Transport};

const NODES: usize = 4;
// Far enough ahead that no test file looks modified after its parity
const TIMESTAMP: i64 = 4_102_444_800;

struct Node {
    root: TempDir,
}

impl Node {
    fn new(target_id: u32) -> Self {
        let root = tempfile::tempdir().unwrap();
        fs::write(root.path().join("targetNumID"), format!("{target_id}\n")).unwrap();
        fs::create_dir(root.path().join("chunks")).unwrap();
        Self { root }
    }

    fn paths(&self, run_state: &Path) -> RunPaths {
        RunPaths {
            storage_root: self.root.path().to_path_buf(),
            run_state: run_state.to_path_buf(),
            meta_dir: self.root.path().join("meta"),
        }
    }

    fn artifact(&self, dir: &str, rel: &str) -> PathBuf {
        self.root.path().join(dir).join(rel)
    }

    fn put_chunk(&self, rel: &str, contents: &[u8]) {
        let path = self.artifact("chunks", rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    /// Report no free space so every node draws with the same weight.
    fn pin_free_space(&self) {
        fs::write(self.root.path().join(FREE_SPACE_OVERRIDE_FILE), "0\n").unwrap();
    }

    fn wipe(&self) {
        fs::remove_dir_all(self.root.path().join("chunks")).unwrap();
        fs::remove_dir_all(self.root.path().join("parity")).ok();
        fs::remove_dir_all(self.root.path().join("meta")).unwrap();
    }

    fn record(&self, rel: &str) -> Option<PlacementRecord> {
        PlacementStore::open(self.root.path().join("meta"))
            .unwrap()
            .get(rel.as_bytes())
            .unwrap()
    }
}

fn config() -> Config {
    let mut config = Config::default();
    config.node.lanes = 2;
    config.transfer.buffer_size = 4;
    config.transfer.forward_threshold = 16;
    config.report.progress_interval_ms = 60_000;
    config
}

fn modify_events(paths: &[&str]) -> Vec<u8> {
    modify_events_at(TIMESTAMP, paths)
}

fn modify_events_at(timestamp: i64, paths: &[&str]) -> Vec<u8> {
    let mut out = Vec::new();
    for path in paths {
        RawEvent {
            timestamp,
            size: 0,
            kind: ChangeKind::Modify,
            path: path.as_bytes().to_vec(),
        }
        .write_to(&mut out)
        .unwrap();
    }
    out
}

fn transports() -> Vec<Arc<dyn Transport>> {
    ChannelFabric::build(NODES)
        .into_iter()
        .map(|t| Arc::new(t) as Arc<dyn Transport>)
        .collect()
}

fn generate(nodes: &[Node], run_state: &Path, events: &[Vec<u8>]) -> Vec<RunSummary> {
    let config = config();
    thread::scope(|scope| {
        let handles: Vec<_> = transports()
            .into_iter()
            .zip(nodes)
            .zip(events)
            .map(|((transport, node), events)| {
                let config = &config;
                scope.spawn(move || {
                    run_generate(transport, config, &node.paths(run_state), &events[..]).unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

fn rebuild(nodes: &[Node], run_state: &Path, failed: usize) -> Vec<Result<RunSummary>> {
    let config = config();
    thread::scope(|scope| {
        let handles: Vec<_> = transports()
            .into_iter()
            .zip(nodes)
            .map(|(transport, node)| {
                let config = &config;
                scope.spawn(move || run_rebuild(transport, config, &node.paths(run_state), failed))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

fn slot(i: usize) -> TargetSlot {
    TargetSlot::new(i).unwrap()
}

#[test]
fn test_generate_then_rebuild_lost_target() {
    let state_dir = tempfile::tempdir().unwrap();
    let run_state = state_dir.path().join("run-state.json");
    let nodes: Vec<Node> = (0..NODES).map(|i| Node::new(100 + i as u32)).collect();

    nodes[0].put_chunk("a/f", &[0xAA; 10]);
    nodes[1].put_chunk("a/f", &[0x55; 6]);
    nodes[2].put_chunk("b/g", &[0x11; 9]);
    let events = vec![
        modify_events(&["a/f"]),
        modify_events(&["a/f"]),
        modify_events(&["b/g"]),
        Vec::new(),
    ];

    let summaries = generate(&nodes, &run_state, &events);
    assert_eq!(summaries.iter().map(|s| s.events).sum::<u64>(), 3);
    assert_eq!(summaries.iter().map(|s| s.paths).sum::<u64>(), 2);
    assert!(summaries.iter().all(|s| s.sticky_error.is_none()));
    assert!(run_state.exists());

    // Every node persisted the same records
    let record = nodes[0].record("a/f").unwrap();
    for node in &nodes[1..] {
        assert_eq!(node.record("a/f"), Some(record));
    }
    assert_eq!(record.timestamp, TIMESTAMP);
    let data = record.locations.data();
    assert!(data.contains(slot(0)) && data.contains(slot(1)));
    assert_eq!(data.len(), 2);
    let parity = record.locations.parity().unwrap();
    assert!(parity.index() >= 2);

    let mut expected = Vec::new();
    expected.extend_from_slice(&10u64.to_le_bytes());
    expected.extend_from_slice(&6u64.to_le_bytes());
    expected.extend_from_slice(&[0xFF; 6]);
    expected.extend_from_slice(&[0xAA; 4]);
    assert_eq!(
        fs::read(nodes[parity.index()].artifact("parity", "a/f")).unwrap(),
        expected
    );

    let lone = nodes[2].record("b/g").unwrap();
    let lone_parity = lone.locations.parity().unwrap();
    let mut expected_lone = 9u64.to_le_bytes().to_vec();
    expected_lone.extend_from_slice(&[0x11; 9]);
    assert_eq!(
        fs::read(nodes[lone_parity.index()].artifact("parity", "b/g")).unwrap(),
        expected_lone
    );

    // Target 0 is replaced by an empty disk carrying the same id
    nodes[0].wipe();

    let results = rebuild(&nodes, &run_state, 0);
    for result in &results {
        let summary = result.as_ref().unwrap();
        assert!(summary.sticky_error.is_none());
        assert_eq!(summary.corrupt_files, 0);
    }

    assert_eq!(
        fs::read(nodes[0].artifact("chunks", "a/f")).unwrap(),
        vec![0xAA; 10]
    );
    assert_eq!(nodes[0].record("a/f"), Some(record));
    assert_eq!(nodes[0].record("b/g"), Some(lone));
    if lone_parity == slot(0) {
        assert_eq!(
            fs::read(nodes[0].artifact("parity", "b/g")).unwrap(),
            expected_lone
        );
    }
    // Survivors keep their artifacts untouched
    assert_eq!(
        fs::read(nodes[parity.index()].artifact("parity", "a/f")).unwrap(),
        expected
    );
}

#[test]
fn test_rebuild_lost_parity_holder() {
    let state_dir = tempfile::tempdir().unwrap();
    let run_state = state_dir.path().join("run-state.json");
    let nodes: Vec<Node> = (0..NODES).map(|i| Node::new(400 + i as u32)).collect();
    for node in &nodes {
        node.pin_free_space();
    }

    // Pick a path whose parity lands on slot 0 under equal weights
    let data: TargetMask = [slot(1), slot(2)].into_iter().collect();
    let resolver = PlacementResolver::new(PlacementWeights::from_free_fractions(&[0.0; NODES]));
    let path = (0..)
        .map(|i| format!("p/{i}"))
        .find(|p| resolver.select_parity(p.as_bytes(), data) == Some(slot(0)))
        .unwrap();

    nodes[1].put_chunk(&path, &[0x3C; 7]);
    nodes[2].put_chunk(&path, &[0x0F; 5]);
    let mut events = vec![Vec::new(); NODES];
    events[1] = modify_events(&[path.as_str()]);
    events[2] = modify_events(&[path.as_str()]);
    generate(&nodes, &run_state, &events);

    let record = nodes[1].record(&path).unwrap();
    assert_eq!(record.locations.parity(), Some(slot(0)));
    assert_eq!(record.locations.data(), data);

    let mut expected = Vec::new();
    expected.extend_from_slice(&7u64.to_le_bytes());
    expected.extend_from_slice(&5u64.to_le_bytes());
    expected.extend_from_slice(&[0x33; 5]);
    expected.extend_from_slice(&[0x3C; 2]);
    assert_eq!(fs::read(nodes[0].artifact("parity", &path)).unwrap(), expected);

    nodes[0].wipe();
    let results = rebuild(&nodes, &run_state, 0);
    for result in &results {
        let summary = result.as_ref().unwrap();
        assert!(summary.sticky_error.is_none());
    }

    assert_eq!(fs::read(nodes[0].artifact("parity", &path)).unwrap(), expected);
    assert!(!nodes[0].artifact("chunks", &path).exists());
    assert_eq!(nodes[0].record(&path), Some(record));
    assert_eq!(fs::read(nodes[1].artifact("chunks", &path)).unwrap(), vec![0x3C; 7]);
}

#[test]
fn test_rebuild_reports_chunks_newer_than_parity() {
    let state_dir = tempfile::tempdir().unwrap();
    let run_state = state_dir.path().join("run-state.json");
    let nodes: Vec<Node> = (0..NODES).map(|i| Node::new(500 + i as u32)).collect();

    // Recorded at t=1, so every chunk on disk is newer than its parity
    nodes[0].put_chunk("c/f", &[0xAA; 10]);
    nodes[1].put_chunk("c/f", &[0x55; 6]);
    let mut events = vec![Vec::new(); NODES];
    events[0] = modify_events_at(1, &["c/f"]);
    events[1] = modify_events_at(1, &["c/f"]);
    generate(&nodes, &run_state, &events);
    let record = nodes[1].record("c/f").unwrap();
    assert_eq!(record.timestamp, 1);

    nodes[0].wipe();
    let results = rebuild(&nodes, &run_state, 0);
    let summaries: Vec<&RunSummary> = results.iter().map(|r| r.as_ref().unwrap()).collect();
    assert!(summaries.iter().all(|s| s.sticky_error.is_none()));

    // Only the surviving data holder reads a chunk
    assert_eq!(summaries[1].corrupt_files, 1);
    assert_eq!(summaries.iter().map(|s| s.corrupt_files).sum::<u64>(), 1);
    let report = config().report.corrupt_file_report;
    assert_eq!(
        fs::read_to_string(nodes[1].root.path().join(report)).unwrap(),
        "c/f\n"
    );

    // The stale chunk is still used
    assert_eq!(
        fs::read(nodes[0].artifact("chunks", "c/f")).unwrap(),
        vec![0xAA; 10]
    );
}

#[test]
fn test_rebuild_rejects_unknown_slot() {
    let state_dir = tempfile::tempdir().unwrap();
    let run_state = state_dir.path().join("run-state.json");
    let nodes: Vec<Node> = (0..NODES).map(|i| Node::new(200 + i as u32)).collect();
    nodes[1].put_chunk("x", b"payload");
    let mut events = vec![Vec::new(); NODES];
    events[1] = modify_events(&["x"]);
    generate(&nodes, &run_state, &events);

    let results = rebuild(&nodes, &run_state, NODES);
    assert!(results.iter().all(Result::is_err));
}

#[test]
fn test_rebuild_needs_previous_run() {
    let state_dir = tempfile::tempdir().unwrap();
    let run_state = state_dir.path().join("run-state.json");
    let nodes: Vec<Node> = (0..NODES).map(|i| Node::new(300 + i as u32)).collect();

    // No earlier run knows these targets
    let results = rebuild(&nodes, &run_state, 0);
    assert!(results.iter().all(Result::is_err));
}
