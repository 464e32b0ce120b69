//! Per-node execution state shared by every task of a run.

use parking_lot::Mutex;
use std::ffi::OsStr;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, warn};
use xorstor_common::{Error, Result, TargetId, TargetSlot};
use xorstor_transport::{Channel, Rank, Transport};

use crate::channels;

/// File naming this target's numeric id inside the storage root.
pub const TARGET_ID_FILE: &str = "targetNumID";

/// Which artifact tree a task reads from or writes to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArtifactDir {
    Chunks,
    Parity,
}

impl ArtifactDir {
    #[must_use]
    pub const fn dir_name(self) -> &'static str {
        match self {
            Self::Chunks => "chunks",
            Self::Parity => "parity",
        }
    }
}

/// Storage root of one target: `chunks/` and `parity/` mirror each other's
/// relative paths.
#[derive(Clone, Debug)]
pub struct StorageRoot {
    root: PathBuf,
}

impl StorageRoot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn dir(&self, which: ArtifactDir) -> PathBuf {
        self.root.join(which.dir_name())
    }

    /// Absolute location of the artifact for chunk path `rel`.
    ///
    /// Only plain relative paths are accepted so an event stream can never
    /// address a file outside the artifact tree.
    pub fn artifact(&self, which: ArtifactDir, rel: &[u8]) -> io::Result<PathBuf> {
        let rel = Path::new(OsStr::from_bytes(rel));
        let plain = rel.components().all(|c| matches!(c, Component::Normal(_)));
        if rel.as_os_str().is_empty() || !plain {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("refusing artifact path '{}'", rel.display()),
            ));
        }
        Ok(self.dir(which).join(rel))
    }

    /// Read the numeric target id stored in the root.
    pub fn read_target_id(&self) -> Result<TargetId> {
        let path = self.root.join(TARGET_ID_FILE);
        let text = std::fs::read_to_string(&path)?;
        text.trim()
            .parse::<u32>()
            .map(TargetId::new)
            .map_err(|e| Error::config(format!("{}: {e}", path.display())))
    }
}

/// First I/O failure seen on this node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StickyError {
    pub path: String,
    pub kind: io::ErrorKind,
    pub message: String,
}

struct CorruptReport {
    path: PathBuf,
    file: Option<File>,
    count: u64,
}

/// State shared by every task this node executes in a run.
///
/// After the first local I/O failure the node keeps taking part in every
/// exchange so peers never stall, but reads yield zeros and writes are
/// discarded.
pub struct ExecutionContext {
    transport: Arc<dyn Transport>,
    slot: TargetSlot,
    slot_ranks: Vec<Rank>,
    root: StorageRoot,
    buffer_size: usize,
    sticky: Mutex<Option<StickyError>>,
    corrupt: Mutex<CorruptReport>,
}

impl ExecutionContext {
    pub fn new(
        transport: Arc<dyn Transport>,
        slot: TargetSlot,
        slot_ranks: Vec<Rank>,
        root: StorageRoot,
        buffer_size: usize,
        corrupt_report: impl Into<PathBuf>,
    ) -> Self {
        Self {
            transport,
            slot,
            slot_ranks,
            root,
            buffer_size: buffer_size.max(1),
            sticky: Mutex::new(None),
            corrupt: Mutex::new(CorruptReport {
                path: corrupt_report.into(),
                file: None,
                count: 0,
            }),
        }
    }

    pub fn transport(&self) -> &dyn Transport {
        &*self.transport
    }

    #[must_use]
    pub const fn slot(&self) -> TargetSlot {
        self.slot
    }

    #[must_use]
    pub const fn root(&self) -> &StorageRoot {
        &self.root
    }

    #[must_use]
    pub const fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Process rank driving `slot` in this run.
    pub fn rank_of(&self, slot: TargetSlot) -> Result<Rank> {
        self.slot_ranks.get(slot.index()).copied().ok_or_else(|| {
            Error::topology(format!(
                "{slot:?} is outside the {} targets of this run",
                self.slot_ranks.len()
            ))
        })
    }

    /// Whether a local error has switched this node to degraded I/O.
    pub fn has_failed(&self) -> bool {
        self.sticky.lock().is_some()
    }

    pub fn sticky_error(&self) -> Option<StickyError> {
        self.sticky.lock().clone()
    }

    /// Record a local I/O failure on `path`. Only the first one sticks.
    pub fn record_error(&self, path: &[u8], err: &io::Error) {
        let path = String::from_utf8_lossy(path).into_owned();
        let mut sticky = self.sticky.lock();
        if sticky.is_some() {
            debug!("Further local error on '{}': {}", path, err);
            return;
        }
        error!(
            "Local error on '{}' ({:?}): {}; continuing with degraded I/O",
            path,
            err.kind(),
            err
        );
        *sticky = Some(StickyError {
            path,
            kind: err.kind(),
            message: err.to_string(),
        });
    }

    /// Append `path` to the corrupt-file report.
    pub fn report_corrupt(&self, path: &[u8]) {
        let mut report = self.corrupt.lock();
        report.count += 1;
        warn!(
            "'{}' changed after its parity was generated",
            String::from_utf8_lossy(path)
        );
        if report.file.is_none() {
            match OpenOptions::new()
                .create(true)
                .append(true)
                .open(&report.path)
            {
                Ok(file) => report.file = Some(file),
                Err(e) => {
                    warn!("Cannot open {}: {}", report.path.display(), e);
                    return;
                }
            }
        }
        if let Some(file) = report.file.as_mut()
            && let Err(e) = file.write_all(&[path, b"\n"].concat())
        {
            warn!("Cannot append to {}: {}", report.path.display(), e);
        }
    }

    pub fn corrupt_count(&self) -> u64 {
        self.corrupt.lock().count
    }
}

/// Directions and mode of one task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TaskContext {
    pub read_dir: ArtifactDir,
    pub write_dir: ArtifactDir,
    pub is_rebuild: bool,
    /// Parity holder before a rebuild remapped the record
    pub prior_parity: Option<TargetSlot>,
    pub lane: usize,
}

impl TaskContext {
    /// Read chunks, write parity.
    #[must_use]
    pub const fn generate() -> Self {
        Self {
            read_dir: ArtifactDir::Chunks,
            write_dir: ArtifactDir::Parity,
            is_rebuild: false,
            prior_parity: None,
            lane: 0,
        }
    }

    #[must_use]
    pub const fn on_lane(mut self, lane: usize) -> Self {
        self.lane = lane;
        self
    }

    #[must_use]
    pub fn channel(&self) -> Channel {
        channels::lane(self.lane)
    }
}
