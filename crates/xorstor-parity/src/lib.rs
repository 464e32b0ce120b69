//! Xorstor Parity - distributed single-parity protection for chunk files
//!
//! Every storage target runs one process. For each chunk path the targets
//! holding a chunk stream it block by block to the target chosen as parity
//! holder, which XORs the blocks into a parity artifact:
//!
//! ```text
//! u64 size[0] | ... | u64 size[n-1] | chunk[0] ^ ... ^ chunk[n-1]
//! ```
//!
//! Shorter chunks are zero padded to the longest. The size header lets a
//! rebuild cut a regenerated chunk back to its original length.
//!
//! A generation run ([`generate::run_generate`]) aggregates change events,
//! resolves placements and refreshes the affected parity artifacts. A
//! rebuild run ([`rebuild::run_rebuild`]) regenerates everything a failed
//! target held onto its replacement.

pub mod cluster;
pub mod context;
pub mod executor;
pub mod generate;
pub mod lanes;
pub mod progress;
pub mod rebuild;
pub mod scanner;
pub mod worker;
pub mod xor;

pub use cluster::{ClusterView, NodeReport, RunSettings};
pub use context::{ArtifactDir, ExecutionContext, StickyError, StorageRoot, TaskContext};
pub use executor::{Role, TaskOutcome, process_task};
pub use generate::{RunPaths, run_generate};
pub use lanes::assign_lanes;
pub use progress::{ProgressMessage, ProgressReporter, ProgressSample};
pub use rebuild::run_rebuild;
pub use scanner::{ScanMode, Scanner};
pub use worker::{BatchStats, RunSummary, WorkEntry, WorkItem};

/// Version every process in a run must share.
pub const BUILD_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Transport channel assignments.
pub mod channels {
    use xorstor_transport::Channel;

    /// Bootstrap exchange and barriers
    pub const CONTROL: Channel = 0;
    /// Progress samples sent to rank 0
    pub const PROGRESS: Channel = 1;
    /// Forwarded change events
    pub const EVENTS: Channel = 2;
    /// Worklist broadcasts
    pub const WORKLIST: Channel = 3;
    /// First channel used by worker lanes
    pub const LANE_BASE: Channel = 16;

    /// Channel carrying the tasks of `lane`.
    #[must_use]
    pub fn lane(lane: usize) -> Channel {
        // Lane counts are validated far below u16::MAX
        #[allow(clippy::cast_possible_truncation)]
        let lane = lane as Channel;
        LANE_BASE.saturating_add(lane)
    }
}
