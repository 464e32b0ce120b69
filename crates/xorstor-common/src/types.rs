//! Core type definitions for Xorstor
//!
//! This module defines the placement data model: target slots, the packed
//! `Locations` word, persisted placement records and per-run pending deltas.

use crate::error::{Error, Result};
use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum number of storage targets a placement can address.
///
/// Membership uses the low 56 bits of [`Locations`]; the top byte is the
/// parity index.
pub const MAX_TARGETS: usize = 56;

/// Parity index value meaning "no parity holder assigned".
pub const NO_PARITY: u8 = 0xFF;

const DATA_BITS: u64 = (1 << MAX_TARGETS) - 1;
const PARITY_SHIFT: u32 = 56;

/// Physical storage target identity (the `targetNumID` of a storage root).
///
/// Stable across runs, unlike process ranks.
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize, Display, From, Into,
)]
#[display("{_0}")]
pub struct TargetId(u32);

impl TargetId {
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

/// Index of a target in the cluster's slot table, `0..MAX_TARGETS`.
///
/// Placement masks and parity indices are expressed in slots.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct TargetSlot(u8);

impl TargetSlot {
    /// Create a slot, rejecting indices that do not fit a placement mask.
    pub fn new(index: usize) -> Result<Self> {
        if index >= MAX_TARGETS {
            return Err(Error::TooManyTargets {
                count: index + 1,
                max: MAX_TARGETS,
            });
        }
        // Bounded by MAX_TARGETS above
        #[allow(clippy::cast_possible_truncation)]
        let index = index as u8;
        Ok(Self(index))
    }

    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    #[must_use]
    const fn bit(self) -> u64 {
        1 << self.0
    }
}

impl fmt::Debug for TargetSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot#{}", self.0)
    }
}

/// Set of target slots, stored in the low 56 bits of a word.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TargetMask(u64);

impl TargetMask {
    pub const EMPTY: Self = Self(0);

    /// Build a mask from raw bits. Bits above the slot range are dropped.
    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits & DATA_BITS)
    }

    #[must_use]
    pub const fn bits(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn single(slot: TargetSlot) -> Self {
        Self(slot.bit())
    }

    /// Mask of every slot strictly below `slot`.
    #[must_use]
    pub const fn below(slot: TargetSlot) -> Self {
        Self(slot.bit() - 1)
    }

    #[must_use]
    pub const fn contains(self, slot: TargetSlot) -> bool {
        self.0 & slot.bit() != 0
    }

    pub fn insert(&mut self, slot: TargetSlot) {
        self.0 |= slot.bit();
    }

    pub fn remove(&mut self, slot: TargetSlot) {
        self.0 &= !slot.bit();
    }

    #[must_use]
    pub const fn with(self, slot: TargetSlot) -> Self {
        Self(self.0 | slot.bit())
    }

    #[must_use]
    pub const fn without(self, slot: TargetSlot) -> Self {
        Self(self.0 & !slot.bit())
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub const fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    #[must_use]
    pub const fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    #[must_use]
    pub const fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Slots in ascending order.
    pub fn iter(self) -> impl Iterator<Item = TargetSlot> {
        let mut rest = self.0;
        std::iter::from_fn(move || {
            if rest == 0 {
                return None;
            }
            #[allow(clippy::cast_possible_truncation)]
            let index = rest.trailing_zeros() as u8;
            rest &= rest - 1;
            Some(TargetSlot(index))
        })
    }
}

impl fmt::Debug for TargetMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter().map(TargetSlot::index)).finish()
    }
}

impl FromIterator<TargetSlot> for TargetMask {
    fn from_iter<I: IntoIterator<Item = TargetSlot>>(iter: I) -> Self {
        iter.into_iter().fold(Self::EMPTY, Self::with)
    }
}

/// Packed placement of one file: data-holder mask plus parity index.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Locations(u64);

impl Locations {
    /// No data holders and no parity holder.
    pub const EMPTY: Self = Self((NO_PARITY as u64) << PARITY_SHIFT);

    #[must_use]
    pub const fn new(data: TargetMask, parity: Option<TargetSlot>) -> Self {
        let index = match parity {
            Some(slot) => slot.0,
            None => NO_PARITY,
        };
        Self(data.0 | ((index as u64) << PARITY_SHIFT))
    }

    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn data(self) -> TargetMask {
        TargetMask(self.0 & DATA_BITS)
    }

    /// Parity holder, if one is assigned.
    ///
    /// An out-of-range index in a raw word is treated as unassigned.
    #[must_use]
    pub const fn parity(self) -> Option<TargetSlot> {
        #[allow(clippy::cast_possible_truncation)]
        let index = (self.0 >> PARITY_SHIFT) as u8;
        if (index as usize) < MAX_TARGETS {
            Some(TargetSlot(index))
        } else {
            None
        }
    }

    #[must_use]
    pub const fn with_parity(self, parity: Option<TargetSlot>) -> Self {
        Self::new(self.data(), parity)
    }

    #[must_use]
    pub const fn is_parity(self, slot: TargetSlot) -> bool {
        matches!(self.parity(), Some(p) if p.0 == slot.0)
    }

    /// True when no parity holder is assigned or it also holds data.
    #[must_use]
    pub const fn is_invalid(self) -> bool {
        match self.parity() {
            Some(p) => self.data().contains(p),
            None => true,
        }
    }

    /// Every slot taking part in this file: data holders plus parity holder.
    #[must_use]
    pub const fn participants(self) -> TargetMask {
        match self.parity() {
            Some(p) => self.data().with(p),
            None => self.data(),
        }
    }
}

impl Default for Locations {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl fmt::Debug for Locations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Locations")
            .field("data", &self.data())
            .field("parity", &self.parity())
            .finish()
    }
}

/// Persisted placement of one path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PlacementRecord {
    pub timestamp: i64,
    pub locations: Locations,
}

impl PlacementRecord {
    /// Size of the fixed binary encoding.
    pub const ENCODED_LEN: usize = 16;

    #[must_use]
    pub const fn new(timestamp: i64, locations: Locations) -> Self {
        Self {
            timestamp,
            locations,
        }
    }

    /// Little-endian `{timestamp: i64, locations: u64}`.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[..8].copy_from_slice(&self.timestamp.to_le_bytes());
        out[8..].copy_from_slice(&self.locations.raw().to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let bytes: &[u8; Self::ENCODED_LEN] = bytes.try_into().map_err(|_| {
            Error::Deserialization(format!(
                "placement record must be {} bytes, got {}",
                Self::ENCODED_LEN,
                bytes.len()
            ))
        })?;
        let (ts, loc) = bytes.split_at(8);
        let mut ts_buf = [0u8; 8];
        ts_buf.copy_from_slice(ts);
        let mut loc_buf = [0u8; 8];
        loc_buf.copy_from_slice(loc);
        Ok(Self {
            timestamp: i64::from_le_bytes(ts_buf),
            locations: Locations::from_raw(u64::from_le_bytes(loc_buf)),
        })
    }
}

/// Kind of change a target reported for a path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    Modify,
    Unlink,
}

impl ChangeKind {
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Modify => 0,
            Self::Unlink => 1,
        }
    }

    pub fn from_code(code: u64) -> Result<Self> {
        match code {
            0 => Ok(Self::Modify),
            1 => Ok(Self::Unlink),
            other => Err(Error::InvalidEvent(format!("unknown event type {other}"))),
        }
    }
}

/// Changes accumulated for one path during a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct PendingDelta {
    pub timestamp: i64,
    pub modified: TargetMask,
    pub deleted: TargetMask,
}

impl PendingDelta {
    /// Fold one reported change into the delta.
    pub fn observe(&mut self, source: TargetSlot, timestamp: i64, kind: ChangeKind) {
        self.timestamp = self.timestamp.max(timestamp);
        match kind {
            ChangeKind::Modify => self.modified.insert(source),
            ChangeKind::Unlink => self.deleted.insert(source),
        }
    }
}

/// One row of the persisted slot table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetIdentity {
    pub target_id: TargetId,
    pub rank: usize,
    pub build_version: String,
}
