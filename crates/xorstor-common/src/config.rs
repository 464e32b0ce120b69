//! Configuration types for Xorstor
//!
//! Configuration is read from a TOML file. Every section and field has a
//! default so a missing file or a partial file is valid.

use crate::error::{Error, Result};
use crate::types::MAX_TARGETS;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Upper bound on worker lanes; each lane takes one transport channel.
pub const MAX_LANES: usize = 1024;

/// Root configuration for Xorstor
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Local node configuration
    pub node: NodeConfig,
    /// Peer addresses and connection settings
    pub cluster: ClusterConfig,
    /// Data movement settings
    pub transfer: TransferConfig,
    /// Change-event scanner commands
    pub scanner: ScannerConfig,
    /// Progress and findings reporting
    pub report: ReportConfig,
}

impl Config {
    /// Default configuration file location
    pub const DEFAULT_PATH: &'static str = "/etc/xorstor/xorstor.toml";

    /// Parse a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Load configuration from `path`, falling back to defaults when the
    /// file does not exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.node.lanes == 0 || self.node.lanes > MAX_LANES {
            return Err(Error::config(format!(
                "node.lanes must be between 1 and {MAX_LANES}"
            )));
        }
        if self.transfer.buffer_size == 0 {
            return Err(Error::config("transfer.buffer_size must be nonzero"));
        }
        if self.transfer.forward_threshold == 0 {
            return Err(Error::config("transfer.forward_threshold must be nonzero"));
        }
        if self.transfer.max_work_items == 0 {
            return Err(Error::config("transfer.max_work_items must be nonzero"));
        }
        if self.cluster.peers.len() > MAX_TARGETS {
            return Err(Error::TooManyTargets {
                count: self.cluster.peers.len(),
                max: MAX_TARGETS,
            });
        }
        if !self.cluster.peers.is_empty() && self.node.rank >= self.cluster.peers.len() {
            return Err(Error::config(format!(
                "node.rank {} is outside the {} configured peers",
                self.node.rank,
                self.cluster.peers.len()
            )));
        }
        Ok(())
    }
}

/// Local node configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Rank of this process in `cluster.peers`
    pub rank: usize,
    /// Number of worker lanes per batch
    pub lanes: usize,
    /// Overrides the `targetNumID` file of the storage root
    pub target_id: Option<u32>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            rank: 0,
            lanes: 12,
            target_id: None,
        }
    }
}

/// Cluster membership
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// `host:port` of every process, indexed by rank
    pub peers: Vec<String>,
    /// How long to keep retrying connections to lower ranks
    pub connect_timeout_secs: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            peers: Vec::new(),
            connect_timeout_secs: 30,
        }
    }
}

/// Data movement settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Block size streamed per round (default: 10 MiB)
    pub buffer_size: usize,
    /// Forwarded-event batch size before a flush (default: 1 MiB)
    pub forward_threshold: usize,
    /// Largest worklist a single batch may carry
    pub max_work_items: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            buffer_size: 10 * 1024 * 1024,
            forward_threshold: 1024 * 1024,
            max_work_items: 1_000_000,
        }
    }
}

/// Commands producing the raw change-event stream
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Full scan of a chunk directory
    pub complete_command: String,
    /// Scan of changes inside a time range
    pub partial_command: String,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            complete_command: "bp-find-all-chunks".to_string(),
            partial_command: "audit-find-between".to_string(),
        }
    }
}

/// Progress and findings reporting
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    /// Accumulated task time between progress samples
    pub progress_interval_ms: u64,
    /// Corrupt-file report, relative to the storage root unless absolute
    pub corrupt_file_report: PathBuf,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            progress_interval_ms: 1000,
            corrupt_file_report: PathBuf::from("corrupt-files.txt"),
        }
    }
}
