//! Xorstor Transport - reliable point-to-point messages between ranks
//!
//! Every storage target is driven by one process, addressed by its rank.
//! Messages carry a channel tag; a receiver asks for the next message from
//! a given peer on a given channel, so independent conversations with the
//! same peer never interleave.
//!
//! Two implementations are provided: [`ChannelFabric`] connects ranks
//! inside one process, [`TcpTransport`] connects processes over a full TCP
//! mesh. Broadcast, gather and barrier are built on top in [`collective`].

pub mod channel;
pub mod collective;
pub mod frame;
pub mod mailbox;
pub mod tcp;

pub use channel::{ChannelFabric, ChannelTransport};
pub use tcp::TcpTransport;

use bytes::Bytes;
use xorstor_common::Result;

/// Process rank within the run.
pub type Rank = usize;

/// Conversation tag carried by every message.
pub type Channel = u16;

/// Reliable, ordered, rank-addressed messaging.
///
/// Messages between one pair of ranks on one channel arrive in send order.
/// `send` never waits for the receiver to post a matching receive.
pub trait Transport: Send + Sync {
    fn rank(&self) -> Rank;

    fn world_size(&self) -> usize;

    fn send(&self, to: Rank, channel: Channel, payload: Bytes) -> Result<()>;

    /// Next message from `from` on `channel`.
    fn recv(&self, from: Rank, channel: Channel) -> Result<Bytes>;

    /// Next message from any rank on `channel`.
    fn recv_any(&self, channel: Channel) -> Result<(Rank, Bytes)>;
}
