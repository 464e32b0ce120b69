//! Placement resolution: merge a pending delta into the prior record.
//!
//! The data holders are the targets that reported a write this run plus
//! the prior data holders, minus targets that reported an unlink. The prior
//! parity holder is kept while it stays valid; otherwise a new one is drawn
//! from the targets that do not hold data, weighted by free space and
//! seeded by the path hash so the choice is reproducible.

use crate::event::path_hash;
use crate::weights::PlacementWeights;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{trace, warn};
use xorstor_common::{Locations, PendingDelta, PlacementRecord, TargetMask, TargetSlot};

/// What a resolved path needs this run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
    /// Record changed; parity must be regenerated and the record stored.
    Update,
    /// Record identical to the persisted one; nothing to do.
    Skip,
    /// Every target holds data, so no parity holder exists. The record is
    /// stored without parity and no data is moved.
    Saturated,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Resolved {
    pub record: PlacementRecord,
    pub resolution: Resolution,
}

/// Resolves placements against a fixed set of slot weights.
pub struct PlacementResolver {
    weights: PlacementWeights,
}

impl PlacementResolver {
    #[must_use]
    pub const fn new(weights: PlacementWeights) -> Self {
        Self { weights }
    }

    /// Number of slots placements may use.
    #[must_use]
    pub fn ntargets(&self) -> usize {
        self.weights.len()
    }

    #[must_use]
    pub fn resolve(
        &self,
        path: &[u8],
        delta: &PendingDelta,
        prior: Option<&PlacementRecord>,
    ) -> Resolved {
        let prior_locations = prior.map_or(Locations::EMPTY, |r| r.locations);
        let prior_parity = prior_locations.parity();

        let mut carried = prior_locations.data();
        if let Some(p) = prior_parity {
            carried.remove(p);
        }
        let data = delta.modified.union(carried).difference(delta.deleted);

        let mut locations = Locations::new(data, prior_parity);
        if locations.is_invalid() {
            locations = locations.with_parity(self.select_parity(path, data));
        }
        let record = PlacementRecord::new(delta.timestamp, locations);

        let resolution = if locations.parity().is_none() {
            warn!(
                "No parity holder available for '{}': all {} targets hold data",
                String::from_utf8_lossy(path),
                self.ntargets()
            );
            Resolution::Saturated
        } else if prior == Some(&record) {
            Resolution::Skip
        } else {
            Resolution::Update
        };

        Resolved { record, resolution }
    }

    /// Draw a parity holder outside `data`, or `None` when every slot holds
    /// data.
    ///
    /// Each draw that lands on a data holder removes that slot from the
    /// table before redrawing. Every slot can be excluded at most once, so
    /// the loop ends after at most `ntargets` draws.
    #[must_use]
    pub fn select_parity(&self, path: &[u8], data: TargetMask) -> Option<TargetSlot> {
        let ntargets = self.ntargets();
        let mut weights = self.weights.as_slice().to_vec();
        let mut rng = StdRng::seed_from_u64(path_hash(path));

        for _ in 0..ntargets {
            let total: u64 = weights.iter().sum();
            if total == 0 {
                break;
            }
            let draw = rng.gen_range(0..total);
            let index = pick(&weights, draw);
            let Ok(slot) = TargetSlot::new(index) else {
                break;
            };
            if !data.contains(slot) {
                trace!(
                    "Parity for '{}' -> {:?}",
                    String::from_utf8_lossy(path),
                    slot
                );
                return Some(slot);
            }
            weights[index] = 0;
        }
        None
    }
}

/// Map `draw` in `[0, sum(weights))` to a slot through the prefix sums.
fn pick(weights: &[u64], draw: u64) -> usize {
    let mut cumulative = 0u64;
    for (index, &w) in weights.iter().enumerate() {
        cumulative += w;
        if draw < cumulative {
            return index;
        }
    }
    weights.len().saturating_sub(1)
}
