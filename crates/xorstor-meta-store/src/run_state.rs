//! Run state: the persisted slot table.
//!
//! Process ranks may change between invocations while the physical
//! targets must keep their slot, since placement masks are expressed in
//! slots. Each run gathers every process's self-reported identity and
//! reconciles it against the table written by the previous run.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::{info, warn};
use xorstor_common::{Error, Result, TargetId, TargetIdentity, MAX_TARGETS};

/// Slot table persisted between runs. Index in `targets` is the slot.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    pub targets: Vec<TargetIdentity>,
}

/// Identity a process reports about the target it drives.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportedTarget {
    pub target_id: TargetId,
    pub build_version: String,
}

impl RunState {
    /// Read the run-state file. A missing or empty file means first run.
    pub fn load(path: impl AsRef<Path>) -> Result<Option<Self>> {
        let path = path.as_ref();
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if text.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&text)?))
    }

    /// Write the run-state file via a temporary sibling and rename.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_vec_pretty(self)?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Build this run's slot table from identities reported by rank.
    ///
    /// `reported[rank]` is the identity of the process with that rank.
    /// Known targets keep their slot with an updated rank; unknown targets
    /// are appended when `allow_new` is set. Duplicate ids, missing known
    /// targets, mixed build versions and more than [`MAX_TARGETS`] slots
    /// are topology errors.
    pub fn reconcile(
        previous: Option<&Self>,
        reported: &[ReportedTarget],
        allow_new: bool,
    ) -> Result<Self> {
        if reported.len() > MAX_TARGETS {
            return Err(Error::TooManyTargets {
                count: reported.len(),
                max: MAX_TARGETS,
            });
        }

        let mut seen = HashSet::new();
        for target in reported {
            if !seen.insert(target.target_id) {
                return Err(Error::topology(format!(
                    "target {} reported by more than one process",
                    target.target_id
                )));
            }
        }

        if let Some(first) = reported.first()
            && let Some(odd) = reported
                .iter()
                .find(|t| t.build_version != first.build_version)
        {
            return Err(Error::topology(format!(
                "build version mismatch: target {} runs {}, target {} runs {}",
                first.target_id, first.build_version, odd.target_id, odd.build_version
            )));
        }

        let rank_of = |id: TargetId| reported.iter().position(|t| t.target_id == id);

        let mut targets = Vec::with_capacity(reported.len());
        if let Some(previous) = previous {
            for known in &previous.targets {
                let rank = rank_of(known.target_id).ok_or_else(|| {
                    Error::topology(format!("target {} is missing from this run", known.target_id))
                })?;
                if known.rank != rank {
                    info!(
                        "Target {} moved from rank {} to rank {}",
                        known.target_id, known.rank, rank
                    );
                }
                targets.push(TargetIdentity {
                    target_id: known.target_id,
                    rank,
                    build_version: reported[rank].build_version.clone(),
                });
            }
        }

        for (rank, target) in reported.iter().enumerate() {
            if targets.iter().any(|t| t.target_id == target.target_id) {
                continue;
            }
            if !allow_new {
                return Err(Error::topology(format!(
                    "target {} was not part of the previous run",
                    target.target_id
                )));
            }
            if previous.is_some() {
                warn!("New target {} joins at slot {}", target.target_id, targets.len());
            }
            targets.push(TargetIdentity {
                target_id: target.target_id,
                rank,
                build_version: target.build_version.clone(),
            });
        }

        Ok(Self { targets })
    }
}
