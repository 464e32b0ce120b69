//! Batch execution over worker lanes.

use crossbeam_channel::unbounded;
use serde::{Deserialize, Serialize};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;
use xorstor_common::{Error, Locations, PlacementRecord, Result};
use xorstor_transport::collective;

use crate::channels;
use crate::context::{ExecutionContext, StickyError, TaskContext};
use crate::executor::{TaskOutcome, process_task};
use crate::lanes::assign_lanes;
use crate::progress::{self, ProgressReporter};

/// Worklist entry as broadcast between nodes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkEntry {
    pub path: Vec<u8>,
    pub record: PlacementRecord,
}

/// Worklist broadcast by the node that built it.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) enum WorklistMessage {
    Entries(Vec<WorkEntry>),
    /// The sender failed; every node stops
    Abort(String),
}

/// One task ready to execute on this node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkItem {
    pub path: Vec<u8>,
    pub record: PlacementRecord,
    pub task: TaskContext,
}

/// Totals for the tasks of one batch on this node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub items: u64,
    pub involved: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

impl BatchStats {
    fn add(&mut self, outcome: &TaskOutcome) {
        self.involved += u64::from(outcome.involved);
        self.bytes_read += outcome.bytes_read;
        self.bytes_written += outcome.bytes_written;
    }

    pub const fn merge(&mut self, other: &Self) {
        self.items += other.items;
        self.involved += other.involved;
        self.bytes_read += other.bytes_read;
        self.bytes_written += other.bytes_written;
    }
}

/// What one node did over a whole run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub events: u64,
    pub paths: u64,
    pub skipped: u64,
    pub saturated: u64,
    pub tasks: BatchStats,
    pub corrupt_files: u64,
    pub sticky_error: Option<StickyError>,
}

/// Execute `items` across `lanes` lanes, then hand each finished item to
/// `on_done`.
///
/// Every node must call this with the same ordered items and lane count.
/// Tasks within a lane run in worklist order.
pub fn run_lanes<F>(
    ctx: &ExecutionContext,
    items: &[WorkItem],
    lanes: usize,
    max_items: usize,
    reporter: &mut ProgressReporter<'_>,
    on_done: F,
) -> Result<BatchStats>
where
    F: Fn(&WorkItem) -> Result<()> + Sync,
{
    if items.len() > max_items {
        return Err(Error::CapacityExceeded {
            count: items.len(),
            limit: max_items,
        });
    }
    let lanes = lanes.max(1);
    let masks: Vec<Locations> = items.iter().map(|item| item.record.locations).collect();
    let mut per_lane: Vec<Vec<usize>> = vec![Vec::new(); lanes];
    for (index, lane) in assign_lanes(lanes, &masks).into_iter().enumerate() {
        per_lane[lane].push(index);
    }

    let mut stats = BatchStats {
        items: items.len() as u64,
        ..BatchStats::default()
    };
    thread::scope(|scope| -> Result<()> {
        let (tx, rx) = unbounded::<(Duration, TaskOutcome)>();
        let on_done = &on_done;
        let mut handles = Vec::with_capacity(lanes);
        for (lane, indices) in per_lane.iter().enumerate() {
            if indices.is_empty() {
                continue;
            }
            let tx = tx.clone();
            let handle = thread::Builder::new()
                .name(format!("xorstor-lane-{lane}"))
                .spawn_scoped(scope, move || -> Result<()> {
                    for &index in indices {
                        let item = &items[index];
                        let task = item.task.on_lane(lane);
                        let started = Instant::now();
                        let outcome = process_task(ctx, &item.path, &item.record, &task)?;
                        on_done(item)?;
                        // The receiver outlives every lane
                        let _ = tx.send((started.elapsed(), outcome));
                    }
                    debug!("Lane {} finished {} tasks", lane, indices.len());
                    Ok(())
                })
                .map_err(|e| Error::thread(format!("spawn lane {lane}: {e}")))?;
            handles.push(handle);
        }
        drop(tx);

        let mut result = Ok(());
        for (elapsed, outcome) in &rx {
            stats.add(&outcome);
            if result.is_ok() {
                result = reporter.record(elapsed, &outcome);
            }
        }
        for handle in handles {
            let joined = handle
                .join()
                .unwrap_or_else(|_| Err(Error::thread("lane panicked")));
            if result.is_ok() {
                result = joined;
            }
        }
        result
    })?;
    Ok(stats)
}

/// Run one batch on every node: lanes, progress monitoring on rank 0 and
/// a closing barrier so batches never overlap.
pub fn run_batch<F>(
    ctx: &ExecutionContext,
    items: &[WorkItem],
    lanes: usize,
    max_items: usize,
    reporter: &mut ProgressReporter<'_>,
    on_done: F,
) -> Result<BatchStats>
where
    F: Fn(&WorkItem) -> Result<()> + Sync,
{
    let transport = ctx.transport();
    let stats = thread::scope(|scope| -> Result<BatchStats> {
        let monitor = if transport.rank() == 0 {
            let handle = thread::Builder::new()
                .name("xorstor-progress".to_string())
                .spawn_scoped(scope, move || progress::receive_loop(transport))
                .map_err(|e| Error::thread(format!("spawn progress monitor: {e}")))?;
            Some(handle)
        } else {
            None
        };

        let result = run_lanes(ctx, items, lanes, max_items, reporter, on_done);
        // Always report completion so rank 0 stops waiting
        let finished = reporter.finish_batch();
        if let Some(monitor) = monitor {
            monitor
                .join()
                .map_err(|_| Error::thread("progress monitor panicked"))??;
        }
        let stats = result?;
        finished?;
        Ok(stats)
    })?;
    collective::barrier(transport, channels::CONTROL)?;
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::StorageRoot;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tempfile::tempdir;
    use xorstor_common::{TargetMask, TargetSlot};
    use xorstor_transport::ChannelFabric;

    fn single_node(dir: &std::path::Path) -> ExecutionContext {
        let transport = ChannelFabric::build(1).pop().unwrap();
        ExecutionContext::new(
            Arc::new(transport),
            TargetSlot::new(0).unwrap(),
            vec![0],
            StorageRoot::new(dir),
            64,
            dir.join("corrupt.txt"),
        )
    }

    fn uninvolved(path: &str) -> WorkItem {
        WorkItem {
            path: path.as_bytes().to_vec(),
            record: PlacementRecord::new(1, Locations::new(TargetMask::from_bits(0b110), None)),
            task: TaskContext::generate(),
        }
    }

    #[test]
    fn test_every_item_reaches_on_done() {
        let dir = tempdir().unwrap();
        let ctx = single_node(dir.path());
        let items: Vec<WorkItem> = (0..25).map(|i| uninvolved(&format!("f{i}"))).collect();
        let seen = Mutex::new(Vec::new());
        let mut reporter = ProgressReporter::new(ctx.transport(), Duration::from_secs(60));

        let stats = run_lanes(&ctx, &items, 4, 100, &mut reporter, |item| {
            seen.lock().push(item.path.clone());
            Ok(())
        })
        .unwrap();

        assert_eq!(stats.items, 25);
        assert_eq!(stats.involved, 0);
        let mut seen = seen.into_inner();
        seen.sort();
        let mut expected: Vec<Vec<u8>> = items.iter().map(|i| i.path.clone()).collect();
        expected.sort();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_capacity_exceeded() {
        let dir = tempdir().unwrap();
        let ctx = single_node(dir.path());
        let items: Vec<WorkItem> = (0..3).map(|i| uninvolved(&format!("f{i}"))).collect();
        let mut reporter = ProgressReporter::new(ctx.transport(), Duration::from_secs(60));
        assert!(matches!(
            run_lanes(&ctx, &items, 2, 2, &mut reporter, |_| Ok(())),
            Err(Error::CapacityExceeded { count: 3, limit: 2 })
        ));
    }

    #[test]
    fn test_on_done_error_propagates() {
        let dir = tempdir().unwrap();
        let ctx = single_node(dir.path());
        let items = vec![uninvolved("a")];
        let mut reporter = ProgressReporter::new(ctx.transport(), Duration::from_secs(60));
        let result = run_lanes(&ctx, &items, 1, 10, &mut reporter, |_| {
            Err(Error::store("disk full"))
        });
        assert!(matches!(result, Err(Error::Store(_))));
    }
}
