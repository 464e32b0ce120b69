//! Rebuild of a failed target onto its replacement.
//!
//! The replacement takes the failed target's slot. Every record the failed
//! slot took part in is remapped so the replacement becomes the generator:
//!
//! * it held the parity: the record is unchanged and the replacement
//!   regenerates the parity from the surviving chunks;
//! * it held a chunk: the former parity holder joins the sources with its
//!   parity artifact and the replacement regenerates the lost chunk, cut
//!   back to its recorded size.
//!
//! The stores are left as they were; the placement itself does not change.

use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use xorstor_common::config::Config;
use xorstor_common::{Error, Locations, PlacementRecord, Result, TargetSlot};
use xorstor_meta_store::PlacementStore;
use xorstor_transport::{Transport, collective};

use crate::channels;
use crate::cluster::{self, NodeReport, RunSettings};
use crate::context::{ArtifactDir, ExecutionContext, StorageRoot, TaskContext};
use crate::generate::RunPaths;
use crate::progress::ProgressReporter;
use crate::worker::{self, RunSummary, WorkEntry, WorkItem, WorklistMessage};

/// A record rewritten for the rebuild of one slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RebuildTask {
    pub record: PlacementRecord,
    /// Parity holder of the original record when the failed slot held a
    /// chunk
    pub prior_parity: Option<TargetSlot>,
}

impl RebuildTask {
    /// Remap `record` for the rebuild of `failed`.
    ///
    /// `None` when the failed slot did not take part, or when the record
    /// has no parity to rebuild from.
    #[must_use]
    pub fn remap(record: &PlacementRecord, failed: TargetSlot) -> Option<Self> {
        let locations = record.locations;
        let parity = locations.parity()?;
        if parity == failed {
            return Some(Self {
                record: *record,
                prior_parity: None,
            });
        }
        if !locations.data().contains(failed) {
            return None;
        }
        let data = locations.data().without(failed).with(parity);
        Some(Self {
            record: PlacementRecord::new(record.timestamp, Locations::new(data, Some(failed))),
            prior_parity: Some(parity),
        })
    }

    #[must_use]
    pub const fn is_rebuild(&self) -> bool {
        self.prior_parity.is_some()
    }

    /// Task directions for the node in slot `me`.
    #[must_use]
    pub fn task_for(&self, me: TargetSlot, failed: TargetSlot) -> TaskContext {
        let Some(prior) = self.prior_parity else {
            return TaskContext::generate();
        };
        TaskContext {
            read_dir: if me == prior {
                ArtifactDir::Parity
            } else {
                ArtifactDir::Chunks
            },
            write_dir: if me == failed {
                ArtifactDir::Chunks
            } else {
                ArtifactDir::Parity
            },
            is_rebuild: true,
            prior_parity: Some(prior),
            lane: 0,
        }
    }
}

/// Lowest surviving slot; it scans its store for the worklist.
#[must_use]
pub fn helper_for(failed: TargetSlot, ntargets: usize) -> Option<TargetSlot> {
    (0..ntargets)
        .filter(|&index| index != failed.index())
        .find_map(|index| TargetSlot::new(index).ok())
}

struct StoreScan {
    all: Vec<WorkEntry>,
    affected: Vec<WorkEntry>,
    unrecoverable: u64,
}

fn scan_store(store: &PlacementStore, failed: TargetSlot) -> Result<StoreScan> {
    let mut scan = StoreScan {
        all: Vec::new(),
        affected: Vec::new(),
        unrecoverable: 0,
    };
    store.for_each(|path, record| {
        let entry = WorkEntry {
            path: path.to_vec(),
            record,
        };
        if record.locations.participants().contains(failed) {
            if RebuildTask::remap(&record, failed).is_some() {
                scan.affected.push(entry.clone());
            } else {
                warn!(
                    "'{}' has no parity; its chunk on {:?} cannot be rebuilt",
                    String::from_utf8_lossy(path),
                    failed
                );
                scan.unrecoverable += 1;
            }
        }
        scan.all.push(entry);
        Ok(())
    })?;
    Ok(scan)
}

fn encode(message: &WorklistMessage) -> Result<Bytes> {
    Ok(Bytes::from(bincode::serialize(message)?))
}

/// Regenerate everything slot `failed` held onto the process now driving
/// that slot.
pub fn run_rebuild(
    transport: Arc<dyn Transport>,
    config: &Config,
    paths: &RunPaths,
    failed: usize,
) -> Result<RunSummary> {
    let started = Instant::now();
    let root = StorageRoot::new(&paths.storage_root);
    let report = NodeReport::probe(&root, config.node.target_id)?;
    let view = cluster::establish(
        &*transport,
        &report,
        &paths.run_state,
        RunSettings::from_config(config),
        false,
    )?;
    if failed >= view.ntargets() {
        return Err(Error::config(format!(
            "failed slot {failed} is outside the {} targets of this run",
            view.ntargets()
        )));
    }
    let failed = TargetSlot::new(failed)?;
    let helper = helper_for(failed, view.ntargets())
        .ok_or_else(|| Error::config("rebuild needs at least one surviving target"))?;
    let me = view.slot_of_rank(transport.rank())?;
    let helper_rank = view.rank_of(helper)?;
    let store = PlacementStore::open(&paths.meta_dir)?;

    let mut summary = RunSummary::default();
    let mut local_failure = None;
    let mut worklist = None;
    if me == helper {
        let (restore, affected) = match scan_store(&store, failed) {
            Ok(scan) => {
                info!(
                    "{} of {} records involve {:?}",
                    scan.affected.len(),
                    scan.all.len(),
                    failed
                );
                summary.saturated = scan.unrecoverable;
                (
                    WorklistMessage::Entries(scan.all),
                    WorklistMessage::Entries(scan.affected),
                )
            }
            Err(e) => {
                let reason = e.to_string();
                local_failure = Some(e);
                (
                    WorklistMessage::Abort(reason.clone()),
                    WorklistMessage::Abort(reason),
                )
            }
        };
        transport.send(view.rank_of(failed)?, channels::WORKLIST, encode(&restore)?)?;
        worklist = Some(affected);
    }

    if me == failed {
        let restore: WorklistMessage =
            bincode::deserialize(&transport.recv(helper_rank, channels::WORKLIST)?)?;
        if let WorklistMessage::Entries(all) = restore {
            let records: Vec<(Vec<u8>, PlacementRecord)> =
                all.into_iter().map(|e| (e.path, e.record)).collect();
            store.set_many(&records)?;
            info!("Restored {} placement records from {:?}", records.len(), helper);
        }
    }

    let entries = match collective::broadcast_value(
        &*transport,
        helper_rank,
        channels::WORKLIST,
        worklist.as_ref(),
    )? {
        WorklistMessage::Entries(entries) => entries,
        WorklistMessage::Abort(reason) => {
            return Err(local_failure.unwrap_or_else(|| {
                Error::store(format!("{helper:?} could not scan its store: {reason}"))
            }));
        }
    };
    summary.paths = entries.len() as u64;

    let items: Vec<WorkItem> = entries
        .into_iter()
        .filter_map(|entry| {
            let remapped = RebuildTask::remap(&entry.record, failed)?;
            Some(WorkItem {
                path: entry.path,
                record: remapped.record,
                task: remapped.task_for(me, failed),
            })
        })
        .collect();

    let ctx = ExecutionContext::new(
        Arc::clone(&transport),
        me,
        view.slot_ranks(),
        root.clone(),
        view.settings.buffer_size,
        root.path().join(&config.report.corrupt_file_report),
    );
    let mut reporter = ProgressReporter::new(
        &*transport,
        Duration::from_millis(config.report.progress_interval_ms),
    );
    // Split so a large target never trips the work-item limit
    let max_items = config.transfer.max_work_items.max(1);
    for batch in items.chunks(max_items) {
        let stats = worker::run_batch(
            &ctx,
            batch,
            view.settings.lanes,
            max_items,
            &mut reporter,
            |_| Ok(()),
        )?;
        summary.tasks.merge(&stats);
    }

    summary.corrupt_files = ctx.corrupt_count();
    summary.sticky_error = ctx.sticky_error();
    if transport.rank() == 0 {
        info!(
            "Rebuild of {:?} finished: {} files in {:.2?}",
            failed,
            summary.paths,
            started.elapsed()
        );
    }
    if summary.corrupt_files > 0 {
        warn!(
            "{} files changed after their parity was generated; see {}",
            summary.corrupt_files,
            config.report.corrupt_file_report.display()
        );
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use xorstor_common::TargetMask;

    fn slot(i: usize) -> TargetSlot {
        TargetSlot::new(i).unwrap()
    }

    fn record(data: &[usize], parity: Option<usize>) -> PlacementRecord {
        let mask: TargetMask = data.iter().map(|&i| slot(i)).collect();
        PlacementRecord::new(42, Locations::new(mask, parity.map(slot)))
    }

    #[test]
    fn test_failed_parity_holder_keeps_record() {
        let original = record(&[0, 1], Some(2));
        let task = RebuildTask::remap(&original, slot(2)).unwrap();
        assert_eq!(task.record, original);
        assert!(!task.is_rebuild());
        assert_eq!(task.task_for(slot(2), slot(2)), TaskContext::generate());
    }

    #[test]
    fn test_failed_data_holder_swaps_with_parity() {
        let task = RebuildTask::remap(&record(&[0, 1], Some(2)), slot(0)).unwrap();
        assert_eq!(task.record, record(&[1, 2], Some(0)));
        assert_eq!(task.record.timestamp, 42);
        assert_eq!(task.prior_parity, Some(slot(2)));

        let on_parity_holder = task.task_for(slot(2), slot(0));
        assert_eq!(on_parity_holder.read_dir, ArtifactDir::Parity);
        assert!(on_parity_holder.is_rebuild);
        let on_replacement = task.task_for(slot(0), slot(0));
        assert_eq!(on_replacement.write_dir, ArtifactDir::Chunks);
        let on_survivor = task.task_for(slot(1), slot(0));
        assert_eq!(on_survivor.read_dir, ArtifactDir::Chunks);
    }

    #[test]
    fn test_unaffected_and_unrecoverable() {
        assert!(RebuildTask::remap(&record(&[0, 1], Some(2)), slot(3)).is_none());
        assert!(RebuildTask::remap(&record(&[0, 1], None), slot(0)).is_none());
    }

    #[test]
    fn test_helper_is_lowest_survivor() {
        assert_eq!(helper_for(slot(0), 3), Some(slot(1)));
        assert_eq!(helper_for(slot(2), 3), Some(slot(0)));
        assert_eq!(helper_for(slot(0), 1), None);
    }

    #[test]
    fn test_scan_store_splits_affected() {
        let dir = tempfile::tempdir().unwrap();
        let store = PlacementStore::open(dir.path()).unwrap();
        store.set(b"a", &record(&[0, 1], Some(2))).unwrap();
        store.set(b"b", &record(&[1, 2], Some(3))).unwrap();
        store.set(b"c", &record(&[0], None)).unwrap();

        let scan = scan_store(&store, slot(0)).unwrap();
        assert_eq!(scan.all.len(), 3);
        assert_eq!(scan.affected.len(), 1);
        assert_eq!(scan.affected[0].path, b"a".to_vec());
        assert_eq!(scan.unrecoverable, 1);
    }
}
