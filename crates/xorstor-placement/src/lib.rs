//! Xorstor Placement - change aggregation and parity holder selection
//!
//! This crate turns the raw change-event streams reported by each storage
//! target into one pending delta per path, and merges those deltas with
//! the previously persisted placement.
//!
//! # Flow
//!
//! 1. Each node decodes its scanner's [`RawEvent`] stream and forwards every
//!    event to the slot owning the path ([`owner_of`]).
//! 2. The owner folds the [`ForwardedEvent`]s it receives into an
//!    [`EventAggregator`].
//! 3. The [`PlacementResolver`] combines each delta with the prior record
//!    and picks a parity holder weighted by free space when needed.

pub mod aggregate;
pub mod event;
pub mod resolver;
pub mod weights;

pub use aggregate::{EventAggregator, PendingPath};
pub use event::{ForwardedEvent, RawEvent, RawEventReader, owner_of, path_hash};
pub use resolver::{PlacementResolver, Resolution, Resolved};
pub use weights::{PlacementWeights, probe_free_fraction};
