//! Parity generation run.
//!
//! 1. Agree on the cluster view.
//! 2. Route every local change event to the slot owning its path.
//! 3. Each owner in turn resolves its paths and broadcasts the worklist.
//! 4. Every node executes the worklist and persists the new records.

use bytes::{Bytes, BytesMut};
use std::io::{BufReader, Read};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use xorstor_common::config::Config;
use xorstor_common::{Error, Result, TargetSlot};
use xorstor_meta_store::PlacementStore;
use xorstor_placement::{
    EventAggregator, ForwardedEvent, PendingPath, PlacementResolver, PlacementWeights,
    RawEventReader, Resolution, owner_of,
};
use xorstor_transport::{Transport, collective};

use crate::channels;
use crate::cluster::{self, ClusterView, NodeReport, RunSettings};
use crate::context::{ExecutionContext, StorageRoot, TaskContext};
use crate::progress::ProgressReporter;
use crate::worker::{self, RunSummary, WorkEntry, WorkItem, WorklistMessage};

/// Filesystem inputs of a run.
#[derive(Clone, Debug)]
pub struct RunPaths {
    pub storage_root: PathBuf,
    pub run_state: PathBuf,
    pub meta_dir: PathBuf,
}

/// Generate parity for the changes described by `events`.
///
/// Every process of the run calls this with its own event stream. Targets
/// not seen by earlier runs join the slot table.
pub fn run_generate<R: Read + Send>(
    transport: Arc<dyn Transport>,
    config: &Config,
    paths: &RunPaths,
    events: R,
) -> Result<RunSummary> {
    let started = Instant::now();
    let root = StorageRoot::new(&paths.storage_root);
    let report = NodeReport::probe(&root, config.node.target_id)?;
    let view = cluster::establish(
        &*transport,
        &report,
        &paths.run_state,
        RunSettings::from_config(config),
        true,
    )?;
    let me = view.slot_of_rank(transport.rank())?;
    let init_time = started.elapsed();

    let phase = Instant::now();
    let (aggregator, events) = distribute_events(
        &*transport,
        &view,
        events,
        config.transfer.forward_threshold,
    )?;
    let distribute_time = phase.elapsed();
    debug!(
        "Read {} events, own {} paths as {:?}",
        events,
        aggregator.len(),
        me
    );

    let phase = Instant::now();
    let store = PlacementStore::open(&paths.meta_dir)?;
    let store_time = phase.elapsed();

    let phase = Instant::now();
    let resolver = PlacementResolver::new(PlacementWeights::from_free_fractions(
        &view.free_fractions,
    ));
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
    let mut summary = RunSummary {
        events,
        ..RunSummary::default()
    };
    let mut owned = Some(aggregator.into_batch());

    for owner in 0..view.ntargets() {
        let owner = TargetSlot::new(owner)?;
        let mut local_failure = None;
        let message = (owner == me).then(|| {
            let batch = owned.take().unwrap_or_default();
            match resolve_owned(&resolver, &store, batch, &mut summary) {
                Ok(entries) => WorklistMessage::Entries(entries),
                Err(e) => {
                    let reason = e.to_string();
                    local_failure = Some(e);
                    WorklistMessage::Abort(reason)
                }
            }
        });
        let batch = collective::broadcast_value(
            &*transport,
            view.rank_of(owner)?,
            channels::WORKLIST,
            message.as_ref(),
        )?;
        let entries = match batch {
            WorklistMessage::Entries(entries) => entries,
            WorklistMessage::Abort(reason) => {
                return Err(local_failure.unwrap_or_else(|| {
                    Error::store(format!("{owner:?} could not resolve its paths: {reason}"))
                }));
            }
        };
        if entries.is_empty() {
            continue;
        }

        let items: Vec<WorkItem> = entries
            .into_iter()
            .map(|entry| WorkItem {
                path: entry.path,
                record: entry.record,
                task: TaskContext::generate(),
            })
            .collect();
        let stats = worker::run_batch(
            &ctx,
            &items,
            view.settings.lanes,
            config.transfer.max_work_items,
            &mut reporter,
            |item| persist(&store, item),
        )?;
        debug!("Batch of {:?}: {:?}", owner, stats);
        summary.tasks.merge(&stats);
    }
    let placement_time = phase.elapsed();

    summary.corrupt_files = ctx.corrupt_count();
    summary.sticky_error = ctx.sticky_error();
    if transport.rank() == 0 {
        info!(
            "Timings: init {:.2?}, distribution {:.2?}, store {:.2?}, placement {:.2?}, total {:.2?}",
            init_time,
            distribute_time,
            store_time,
            placement_time,
            started.elapsed()
        );
    }
    if let Some(sticky) = &summary.sticky_error {
        warn!(
            "Run finished with a local error on '{}': {}",
            sticky.path, sticky.message
        );
    }
    Ok(summary)
}

fn resolve_owned(
    resolver: &PlacementResolver,
    store: &PlacementStore,
    batch: Vec<PendingPath>,
    summary: &mut RunSummary,
) -> Result<Vec<WorkEntry>> {
    let mut entries = Vec::with_capacity(batch.len());
    summary.paths += batch.len() as u64;
    for pending in batch {
        let prior = store.get(&pending.path)?;
        let resolved = resolver.resolve(&pending.path, &pending.delta, prior.as_ref());
        match resolved.resolution {
            Resolution::Skip => {
                summary.skipped += 1;
                continue;
            }
            Resolution::Saturated => summary.saturated += 1,
            Resolution::Update => {}
        }
        entries.push(WorkEntry {
            path: pending.path,
            record: resolved.record,
        });
    }
    Ok(entries)
}

fn persist(store: &PlacementStore, item: &WorkItem) -> Result<()> {
    if item.record.locations.data().is_empty() {
        store.delete(&item.path)?;
    } else {
        store.set(&item.path, &item.record)?;
    }
    Ok(())
}

/// Send every local event to its owner and collect the events this node
/// owns. Returns the aggregate and the number of local events read.
fn distribute_events<R: Read + Send>(
    transport: &dyn Transport,
    view: &ClusterView,
    events: R,
    threshold: usize,
) -> Result<(EventAggregator, u64)> {
    thread::scope(|scope| {
        let collector = thread::Builder::new()
            .name("xorstor-events".to_string())
            .spawn_scoped(scope, || collect_events(transport, view))
            .map_err(|e| Error::thread(format!("spawn event collector: {e}")))?;

        let forwarded = forward_events(transport, view, events, threshold);
        // An empty message ends this node's stream, even after a failure
        let ended = (0..transport.world_size())
            .try_for_each(|rank| transport.send(rank, channels::EVENTS, Bytes::new()));

        let aggregator = collector
            .join()
            .map_err(|_| Error::thread("event collector panicked"))??;
        let count = forwarded?;
        ended?;
        Ok((aggregator, count))
    })
}

fn forward_events<R: Read>(
    transport: &dyn Transport,
    view: &ClusterView,
    events: R,
    threshold: usize,
) -> Result<u64> {
    let ntargets = view.ntargets();
    let mut pending: Vec<BytesMut> = vec![BytesMut::new(); ntargets];
    let mut reader = RawEventReader::new(BufReader::new(events));

    loop {
        let event = match reader.next_event() {
            Ok(Some(event)) => event,
            Ok(None) => break,
            Err(Error::InvalidPath(path)) => {
                warn!("Skipping event for '{}': not inside the chunk tree", path);
                continue;
            }
            Err(e) => return Err(e),
        };
        let owner = owner_of(&event.path, ntargets);
        ForwardedEvent::from(event).encode(&mut pending[owner]);
        if pending[owner].len() >= threshold {
            let rank = view.rank_of(TargetSlot::new(owner)?)?;
            transport.send(rank, channels::EVENTS, pending[owner].split().freeze())?;
        }
    }
    for (owner, buf) in pending.iter_mut().enumerate() {
        if !buf.is_empty() {
            let rank = view.rank_of(TargetSlot::new(owner)?)?;
            transport.send(rank, channels::EVENTS, buf.split().freeze())?;
        }
    }
    Ok(reader.records())
}

fn collect_events(transport: &dyn Transport, view: &ClusterView) -> Result<EventAggregator> {
    let mut aggregator = EventAggregator::new();
    let mut open = transport.world_size();
    while open > 0 {
        let (rank, payload) = transport.recv_any(channels::EVENTS)?;
        if payload.is_empty() {
            open -= 1;
            continue;
        }
        let source = view.slot_of_rank(rank)?;
        for event in ForwardedEvent::decode_all(&payload)? {
            aggregator.observe(source, &event);
        }
    }
    Ok(aggregator)
}
