//! Per-(peer, channel) inbound message queues.
//!
//! Incoming messages are demultiplexed into one unbounded queue per sender
//! rank and channel. Closing a peer drops its senders, so receivers drain
//! what was already delivered and then observe a disconnect instead of
//! blocking forever.
//!
//! Queues are unbounded so one slow channel never stalls the reader of a
//! shared connection; senders bound how far they run ahead themselves.

use crate::{Channel, Rank};
use bytes::Bytes;
use crossbeam_channel::{Receiver, Select, Sender, unbounded};
use parking_lot::Mutex;
use std::collections::HashMap;
use xorstor_common::{Error, Result};

struct Slot {
    tx: Option<Sender<Bytes>>,
    rx: Receiver<Bytes>,
}

struct Inner {
    slots: HashMap<(Rank, Channel), Slot>,
    closed: Vec<bool>,
}

impl Inner {
    fn slot(&mut self, from: Rank, channel: Channel) -> &mut Slot {
        let closed = self.closed.get(from).copied().unwrap_or(true);
        self.slots.entry((from, channel)).or_insert_with(|| {
            let (tx, rx) = unbounded();
            Slot {
                tx: (!closed).then_some(tx),
                rx,
            }
        })
    }
}

/// Inbound queues of one rank.
pub struct Mailboxes {
    world_size: usize,
    inner: Mutex<Inner>,
}

impl Mailboxes {
    #[must_use]
    pub fn new(world_size: usize) -> Self {
        Self {
            world_size,
            inner: Mutex::new(Inner {
                slots: HashMap::new(),
                closed: vec![false; world_size],
            }),
        }
    }

    /// Queue a message from `from`. Returns false if the peer is closed.
    pub fn deliver(&self, from: Rank, channel: Channel, payload: Bytes) -> bool {
        let mut inner = self.inner.lock();
        match &inner.slot(from, channel).tx {
            Some(tx) => tx.send(payload).is_ok(),
            None => false,
        }
    }

    pub fn receiver(&self, from: Rank, channel: Channel) -> Receiver<Bytes> {
        self.inner.lock().slot(from, channel).rx.clone()
    }

    /// Stop accepting messages from `from`; pending ones stay readable.
    pub fn close_peer(&self, from: Rank) {
        let mut inner = self.inner.lock();
        if let Some(closed) = inner.closed.get_mut(from) {
            *closed = true;
        }
        for ((rank, _), slot) in &mut inner.slots {
            if *rank == from {
                slot.tx = None;
            }
        }
    }

    pub fn recv(&self, from: Rank, channel: Channel) -> Result<Bytes> {
        if from >= self.world_size {
            return Err(Error::protocol(format!(
                "receive from rank {from} outside world of {}",
                self.world_size
            )));
        }
        self.receiver(from, channel)
            .recv()
            .map_err(|_| Error::Disconnected { rank: from })
    }

    /// Next message on `channel` from whichever rank delivers first.
    ///
    /// Fails only once every rank has disconnected with nothing pending.
    pub fn recv_any(&self, channel: Channel) -> Result<(Rank, Bytes)> {
        let receivers: Vec<Receiver<Bytes>> = (0..self.world_size)
            .map(|rank| self.receiver(rank, channel))
            .collect();
        let mut gone = vec![false; receivers.len()];

        loop {
            let live: Vec<Rank> = (0..receivers.len()).filter(|&r| !gone[r]).collect();
            let Some(&last) = live.last() else {
                return Err(Error::Disconnected {
                    rank: self.world_size.saturating_sub(1),
                });
            };
            let mut select = Select::new();
            for &rank in &live {
                select.recv(&receivers[rank]);
            }
            let oper = select.select();
            let rank = live.get(oper.index()).copied().unwrap_or(last);
            match oper.recv(&receivers[rank]) {
                Ok(payload) => return Ok((rank, payload)),
                Err(_) => gone[rank] = true,
            }
        }
    }
}
