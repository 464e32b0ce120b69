//! In-process transport: every rank lives in the same process.
//!
//! Used to run a whole cluster inside one test binary, one thread per rank.

use crate::mailbox::Mailboxes;
use crate::{Channel, Rank, Transport};
use bytes::Bytes;
use std::sync::Arc;
use xorstor_common::{Error, Result};

/// Builder for a fully connected set of in-process ranks.
pub struct ChannelFabric;

impl ChannelFabric {
    /// Create `world_size` connected transports, indexed by rank.
    #[must_use]
    pub fn build(world_size: usize) -> Vec<ChannelTransport> {
        let mailboxes: Arc<Vec<Mailboxes>> =
            Arc::new((0..world_size).map(|_| Mailboxes::new(world_size)).collect());
        (0..world_size)
            .map(|rank| ChannelTransport {
                rank,
                mailboxes: Arc::clone(&mailboxes),
            })
            .collect()
    }
}

/// One rank's endpoint in a [`ChannelFabric`].
///
/// Dropping the endpoint disconnects it from every other rank.
pub struct ChannelTransport {
    rank: Rank,
    mailboxes: Arc<Vec<Mailboxes>>,
}

impl Transport for ChannelTransport {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.mailboxes.len()
    }

    fn send(&self, to: Rank, channel: Channel, payload: Bytes) -> Result<()> {
        let inbox = self.mailboxes.get(to).ok_or_else(|| {
            Error::protocol(format!("send to rank {to} outside world of {}", self.world_size()))
        })?;
        if inbox.deliver(self.rank, channel, payload) {
            Ok(())
        } else {
            Err(Error::Disconnected { rank: to })
        }
    }

    fn recv(&self, from: Rank, channel: Channel) -> Result<Bytes> {
        self.mailboxes[self.rank].recv(from, channel)
    }

    fn recv_any(&self, channel: Channel) -> Result<(Rank, Bytes)> {
        self.mailboxes[self.rank].recv_any(channel)
    }
}

impl Drop for ChannelTransport {
    fn drop(&mut self) {
        for (rank, inbox) in self.mailboxes.iter().enumerate() {
            inbox.close_peer(self.rank);
            // Nothing will read our own inbox again
            self.mailboxes[self.rank].close_peer(rank);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_ping_pong() {
        let mut nodes = ChannelFabric::build(2);
        let b = nodes.pop().unwrap();
        let a = nodes.pop().unwrap();

        let handle = thread::spawn(move || {
            let msg = b.recv(0, 1).unwrap();
            b.send(0, 1, Bytes::from([&msg[..], b"-pong"].concat()))
                .unwrap();
        });
        a.send(1, 1, Bytes::from_static(b"ping")).unwrap();
        assert_eq!(a.recv(1, 1).unwrap(), Bytes::from_static(b"ping-pong"));
        handle.join().unwrap();
    }

    #[test]
    fn test_send_to_self() {
        let nodes = ChannelFabric::build(1);
        nodes[0].send(0, 2, Bytes::from_static(b"me")).unwrap();
        assert_eq!(nodes[0].recv_any(2).unwrap(), (0, Bytes::from_static(b"me")));
    }

    #[test]
    fn test_dropped_peer_disconnects() {
        let mut nodes = ChannelFabric::build(2);
        let b = nodes.pop().unwrap();
        drop(b);
        assert!(matches!(
            nodes[0].recv(1, 0),
            Err(Error::Disconnected { rank: 1 })
        ));
        assert!(nodes[0].send(1, 0, Bytes::new()).is_err());
    }
}
