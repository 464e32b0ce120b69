//! Run bootstrap: agree on the slot table and run-wide settings.
//!
//! Rank 0 gathers every process's identity, reconciles it against the
//! persisted run state and broadcasts the resulting [`ClusterView`] (or the
//! reason to abort) so every node starts with identical inputs.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{error, info};
use xorstor_common::config::Config;
use xorstor_common::{Error, Result, TargetId, TargetIdentity, TargetSlot};
use xorstor_meta_store::{ReportedTarget, RunState};
use xorstor_placement::probe_free_fraction;
use xorstor_transport::{Rank, Transport, collective};

use crate::context::StorageRoot;
use crate::{BUILD_VERSION, channels};

/// What a process reports about its target at startup.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeReport {
    pub target_id: TargetId,
    pub build_version: String,
    pub free_fraction: f64,
}

impl NodeReport {
    /// Identify the target at `root`. `target_id` overrides the id file.
    pub fn probe(root: &StorageRoot, target_id: Option<u32>) -> Result<Self> {
        let target_id = match target_id {
            Some(id) => TargetId::new(id),
            None => root.read_target_id()?,
        };
        Ok(Self {
            target_id,
            build_version: BUILD_VERSION.to_string(),
            free_fraction: probe_free_fraction(root.path())?,
        })
    }
}

/// Settings rank 0 imposes on the run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSettings {
    pub lanes: usize,
    pub buffer_size: usize,
}

impl RunSettings {
    #[must_use]
    pub const fn from_config(config: &Config) -> Self {
        Self {
            lanes: config.node.lanes,
            buffer_size: config.transfer.buffer_size,
        }
    }
}

/// The agreed slot table and settings of this run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClusterView {
    /// Indexed by slot
    pub targets: Vec<TargetIdentity>,
    /// Free-space fraction per slot
    pub free_fractions: Vec<f64>,
    pub settings: RunSettings,
}

impl ClusterView {
    #[must_use]
    pub fn ntargets(&self) -> usize {
        self.targets.len()
    }

    /// Rank driving each slot, indexed by slot.
    #[must_use]
    pub fn slot_ranks(&self) -> Vec<Rank> {
        self.targets.iter().map(|t| t.rank).collect()
    }

    pub fn rank_of(&self, slot: TargetSlot) -> Result<Rank> {
        self.targets
            .get(slot.index())
            .map(|t| t.rank)
            .ok_or_else(|| Error::topology(format!("no target in {slot:?}")))
    }

    pub fn slot_of_rank(&self, rank: Rank) -> Result<TargetSlot> {
        let index = self
            .targets
            .iter()
            .position(|t| t.rank == rank)
            .ok_or_else(|| Error::topology(format!("rank {rank} drives no target")))?;
        TargetSlot::new(index)
    }
}

#[derive(Serialize, Deserialize)]
enum Bootstrap {
    Ready(ClusterView),
    Abort(String),
}

/// Agree on the cluster view.
///
/// `run_state` and `settings` are only used on rank 0. New targets may
/// join only when `allow_new` is set; a rebuild requires the exact
/// previous membership.
pub fn establish(
    transport: &dyn Transport,
    report: &NodeReport,
    run_state: &Path,
    settings: RunSettings,
    allow_new: bool,
) -> Result<ClusterView> {
    let reports = collective::gather_values(transport, 0, channels::CONTROL, report)?;

    let mut local_failure = None;
    let decision = reports.map(|reports| {
        match build_view(&reports, run_state, settings, allow_new) {
            Ok(view) => Bootstrap::Ready(view),
            Err(e) => {
                error!("Cannot start run: {}", e);
                let reason = e.to_string();
                local_failure = Some(e);
                Bootstrap::Abort(reason)
            }
        }
    });

    match collective::broadcast_value(transport, 0, channels::CONTROL, decision.as_ref())? {
        Bootstrap::Ready(view) => Ok(view),
        Bootstrap::Abort(reason) => Err(local_failure.unwrap_or_else(|| Error::topology(reason))),
    }
}

fn build_view(
    reports: &[NodeReport],
    run_state: &Path,
    settings: RunSettings,
    allow_new: bool,
) -> Result<ClusterView> {
    let previous = RunState::load(run_state)?;
    let reported: Vec<ReportedTarget> = reports
        .iter()
        .map(|r| ReportedTarget {
            target_id: r.target_id,
            build_version: r.build_version.clone(),
        })
        .collect();
    let state = RunState::reconcile(previous.as_ref(), &reported, allow_new)?;
    state.save(run_state)?;

    let free_fractions = state
        .targets
        .iter()
        .map(|t| reports[t.rank].free_fraction)
        .collect();
    info!(
        "Run of {} targets: {} lanes, {} byte blocks",
        state.targets.len(),
        settings.lanes,
        settings.buffer_size
    );
    Ok(ClusterView {
        targets: state.targets,
        free_fractions,
        settings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use tempfile::tempdir;
    use xorstor_transport::ChannelFabric;

    const SETTINGS: RunSettings = RunSettings {
        lanes: 3,
        buffer_size: 4096,
    };

    fn report(id: u32, version: &str) -> NodeReport {
        NodeReport {
            target_id: TargetId::new(id),
            build_version: version.to_string(),
            free_fraction: 0.5,
        }
    }

    fn run(
        ids: &[u32],
        version_of: impl Fn(usize) -> &'static str,
        state: &Path,
        allow_new: bool,
    ) -> Vec<Result<ClusterView>> {
        let nodes = ChannelFabric::build(ids.len());
        thread::scope(|scope| {
            let handles: Vec<_> = nodes
                .iter()
                .enumerate()
                .map(|(rank, node)| {
                    let report = report(ids[rank], version_of(rank));
                    scope.spawn(move || establish(node, &report, state, SETTINGS, allow_new))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        })
    }

    #[test]
    fn test_report_reads_id_file() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("targetNumID"), "12").unwrap();
        let root = StorageRoot::new(dir.path());

        let probed = NodeReport::probe(&root, None).unwrap();
        assert_eq!(probed.target_id, TargetId::new(12));
        assert_eq!(probed.build_version, BUILD_VERSION);
        assert!((0.0..=1.0).contains(&probed.free_fraction));

        let overridden = NodeReport::probe(&root, Some(99)).unwrap();
        assert_eq!(overridden.target_id, TargetId::new(99));
    }

    #[test]
    fn test_first_run_then_reordered_ranks() {
        let dir = tempdir().unwrap();
        let state = dir.path().join("run.json");

        let views = run(&[7, 9, 4], |_| "1.0", &state, true);
        let first = views[0].as_ref().unwrap();
        assert!(views.iter().all(|v| v.as_ref().unwrap() == first));
        assert_eq!(first.ntargets(), 3);
        assert_eq!(first.settings, SETTINGS);

        // Same targets, different ranks: slots follow the target ids
        let views = run(&[4, 7, 9], |_| "1.0", &state, false);
        let view = views[2].as_ref().unwrap();
        assert_eq!(view.targets[0].target_id, TargetId::new(7));
        assert_eq!(view.targets[0].rank, 1);
        assert_eq!(view.slot_of_rank(0).unwrap(), TargetSlot::new(2).unwrap());
        assert_eq!(view.slot_ranks(), vec![1, 2, 0]);
    }

    #[test]
    fn test_version_mismatch_aborts_everyone() {
        let dir = tempdir().unwrap();
        let state = dir.path().join("run.json");
        let views = run(&[1, 2], |rank| if rank == 0 { "1.0" } else { "1.1" }, &state, true);
        assert!(views.iter().all(Result::is_err));
        assert!(!state.exists());
    }

    #[test]
    fn test_unknown_target_rejected_without_allow_new() {
        let dir = tempdir().unwrap();
        let state = dir.path().join("run.json");
        run(&[1, 2], |_| "1.0", &state, true);
        let views = run(&[1, 3], |_| "1.0", &state, false);
        assert!(views.iter().all(|v| matches!(v, Err(Error::TopologyChanged(_)))));
    }
}
