//! Lane assignment.
//!
//! Tasks run on a fixed number of lanes, each a serial worker with its own
//! transport channel. Two tasks sharing a target contend for its disk and
//! link, so a task goes to the lane whose recent tasks overlap least with
//! its participants. Assignment only depends on the ordered worklist and
//! the lane count, so every node computes the same lanes.

use xorstor_common::{Locations, TargetMask};

/// Recent participant masks remembered per lane.
pub const LANE_HISTORY: usize = 16;

struct Lane {
    ring: [TargetMask; LANE_HISTORY],
    next: usize,
}

impl Lane {
    const fn new() -> Self {
        Self {
            ring: [TargetMask::EMPTY; LANE_HISTORY],
            next: 0,
        }
    }

    fn overlap(&self, mask: TargetMask) -> usize {
        self.ring.iter().map(|m| m.intersection(mask).len()).sum()
    }

    fn push(&mut self, mask: TargetMask) {
        self.ring[self.next] = mask;
        self.next = (self.next + 1) % LANE_HISTORY;
    }
}

/// Lane index for each entry of `worklist`.
///
/// Candidates are scanned starting at `i % lanes`; ties go to the first
/// candidate scanned.
#[must_use]
pub fn assign_lanes(lanes: usize, worklist: &[Locations]) -> Vec<usize> {
    let count = lanes.max(1);
    let mut state: Vec<Lane> = (0..count).map(|_| Lane::new()).collect();

    worklist
        .iter()
        .enumerate()
        .map(|(i, locations)| {
            let mask = locations.participants();
            let mut best = i % count;
            let mut best_overlap = usize::MAX;
            for step in 0..count {
                let lane = (i + step) % count;
                let overlap = state[lane].overlap(mask);
                if overlap < best_overlap {
                    best = lane;
                    best_overlap = overlap;
                    if overlap == 0 {
                        break;
                    }
                }
            }
            state[best].push(mask);
            best
        })
        .collect()
}
