//! Free-space weights for parity placement.

use std::path::Path;
use tracing::{debug, warn};
use xorstor_common::Result;

/// File under a storage root overriding the free bytes reported by the
/// filesystem.
pub const FREE_SPACE_OVERRIDE_FILE: &str = "free_space_override";

const WEIGHT_SCALE: f64 = 1000.0;

/// Integer weight per slot, growing with the target's free-space fraction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlacementWeights {
    weights: Vec<u64>,
}

impl PlacementWeights {
    /// Weights for targets whose free-space fractions are given by slot.
    #[must_use]
    pub fn from_free_fractions(fractions: &[f64]) -> Self {
        Self {
            weights: fractions.iter().copied().map(Self::weight_of).collect(),
        }
    }

    /// `round(log2(free + 1.1) * 1000)`, never below 1 so every target
    /// remains selectable.
    #[must_use]
    pub fn weight_of(free_fraction: f64) -> u64 {
        let free = if free_fraction.is_finite() {
            free_fraction.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let scaled = ((free + 1.1).log2() * WEIGHT_SCALE).round();
        // log2(2.1) * 1000 bounds the value well inside u64
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let weight = scaled as u64;
        weight.max(1)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.weights.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u64] {
        &self.weights
    }
}

/// Fraction of the filesystem holding `root` that is free, in `[0, 1]`.
///
/// Capacity always comes from `statvfs`; free bytes come from the override
/// file when present.
pub fn probe_free_fraction(root: &Path) -> Result<f64> {
    let stat = nix::sys::statvfs::statvfs(root).map_err(std::io::Error::from)?;
    #[allow(clippy::unnecessary_cast)]
    let fragment = stat.fragment_size() as u64;
    #[allow(clippy::unnecessary_cast)]
    let total = (stat.blocks() as u64).saturating_mul(fragment);
    #[allow(clippy::unnecessary_cast)]
    let mut free = (stat.blocks_available() as u64).saturating_mul(fragment);

    let override_path = root.join(FREE_SPACE_OVERRIDE_FILE);
    match std::fs::read_to_string(&override_path) {
        Ok(text) => match text.trim().parse::<u64>() {
            Ok(bytes) => {
                debug!("Free space override for {}: {} bytes", root.display(), bytes);
                free = bytes;
            }
            Err(e) => warn!(
                "Ignoring unparsable {}: {}",
                override_path.display(),
                e
            ),
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    Ok(free_fraction(free, total))
}

fn free_fraction(free: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    #[allow(clippy::cast_precision_loss)]
    let fraction = free as f64 / total as f64;
    fraction.clamp(0.0, 1.0)
}
