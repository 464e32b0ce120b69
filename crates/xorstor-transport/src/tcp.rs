//! TCP mesh transport.
//!
//! Every pair of ranks shares one TCP connection: each rank dials every
//! lower rank and accepts every higher one, and the dialing side opens
//! with a handshake frame naming its rank. The sockets live on a small
//! tokio runtime owned by the transport. One reader task per peer
//! demultiplexes inbound frames into the mailboxes; writes to a peer are
//! serialized by a per-peer lock so frames never interleave on the wire.
//! Callers stay synchronous and enter the runtime through `block_on`.

use crate::frame::{HANDSHAKE_CHANNEL, decode_handshake, encode_handshake, read_frame, write_frame};
use crate::mailbox::Mailboxes;
use crate::{Channel, Rank, Transport};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::{Builder, Runtime};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use xorstor_common::{Error, Result};

const RETRY_INTERVAL: Duration = Duration::from_millis(100);
const READ_BUFFER: usize = 256 * 1024;
const IO_THREADS: usize = 2;

pub struct TcpTransport {
    rank: Rank,
    world_size: usize,
    writers: Vec<Option<Mutex<OwnedWriteHalf>>>,
    mailboxes: Arc<Mailboxes>,
    readers: Vec<JoinHandle<()>>,
    // Dropped last: the sockets above deregister from it
    runtime: Runtime,
}

impl TcpTransport {
    /// Join the mesh described by `peers` (indexed by rank) as `rank`.
    ///
    /// Blocks until a connection to every other rank exists or `timeout`
    /// elapses.
    pub fn connect(rank: Rank, peers: &[SocketAddr], timeout: Duration) -> Result<Self> {
        let world_size = peers.len();
        let Some(&local) = peers.get(rank) else {
            return Err(Error::config(format!(
                "rank {rank} has no address among {world_size} peers"
            )));
        };
        let runtime = Builder::new_multi_thread()
            .worker_threads(IO_THREADS)
            .thread_name("xorstor-net")
            .enable_all()
            .build()?;

        let streams = runtime.block_on(async {
            tokio::time::timeout(timeout, build_mesh(rank, local, peers))
                .await
                .map_err(|_| {
                    Error::ConnectionFailed(format!(
                        "rank {rank} could not reach every peer within {timeout:?}"
                    ))
                })?
        })?;

        let mailboxes = Arc::new(Mailboxes::new(world_size));
        let mut writers = Vec::with_capacity(world_size);
        let mut readers = Vec::with_capacity(world_size.saturating_sub(1));
        for (peer, stream) in streams.into_iter().enumerate() {
            let Some(stream) = stream else {
                writers.push(None);
                continue;
            };
            let (read_half, write_half) = stream.into_split();
            readers.push(runtime.spawn(read_loop(peer, read_half, Arc::clone(&mailboxes))));
            writers.push(Some(Mutex::new(write_half)));
        }

        info!("Rank {} connected to all {} peers", rank, world_size - 1);
        Ok(Self {
            rank,
            world_size,
            writers,
            mailboxes,
            readers,
            runtime,
        })
    }
}

async fn build_mesh(
    rank: Rank,
    local: SocketAddr,
    peers: &[SocketAddr],
) -> Result<Vec<Option<TcpStream>>> {
    let world_size = peers.len();
    let listener = TcpListener::bind(local).await?;
    info!("Rank {} listening on {} ({} ranks)", rank, local, world_size);

    let mut streams: Vec<Option<TcpStream>> = (0..world_size).map(|_| None).collect();

    for (peer, &addr) in peers.iter().enumerate().take(rank) {
        let mut stream = dial(addr).await;
        stream.set_nodelay(true)?;
        write_frame(
            &mut stream,
            HANDSHAKE_CHANNEL,
            &encode_handshake(rank, world_size),
        )
        .await?;
        debug!("Connected to rank {} at {}", peer, addr);
        streams[peer] = Some(stream);
    }

    for _ in rank + 1..world_size {
        let (mut stream, remote) = listener.accept().await?;
        stream.set_nodelay(true)?;
        let (channel, payload) = read_frame(&mut stream)
            .await?
            .ok_or_else(|| Error::protocol("connection closed before handshake"))?;
        if channel != HANDSHAKE_CHANNEL {
            return Err(Error::protocol(format!(
                "expected handshake, got channel {channel}"
            )));
        }
        let (peer, peer_world) = decode_handshake(payload)?;
        if peer_world != world_size || peer <= rank || peer >= world_size {
            return Err(Error::protocol(format!(
                "unexpected handshake from rank {peer} of {peer_world}"
            )));
        }
        if streams[peer].is_some() {
            return Err(Error::protocol(format!("rank {peer} connected twice")));
        }
        debug!("Accepted rank {} from {}", peer, remote);
        streams[peer] = Some(stream);
    }
    Ok(streams)
}

/// Dial until the peer listens; the caller bounds the wait.
async fn dial(addr: SocketAddr) -> TcpStream {
    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => return stream,
            Err(e) => {
                debug!("Dial {} failed: {}; retrying", addr, e);
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
        }
    }
}

async fn read_loop(peer: Rank, stream: OwnedReadHalf, inbox: Arc<Mailboxes>) {
    let mut reader = BufReader::with_capacity(READ_BUFFER, stream);
    loop {
        match read_frame(&mut reader).await {
            Ok(Some((channel, payload))) => {
                if !inbox.deliver(peer, channel, payload) {
                    break;
                }
            }
            Ok(None) => {
                debug!("Rank {} closed its connection", peer);
                break;
            }
            Err(e) => {
                warn!("Connection to rank {} failed: {}", peer, e);
                break;
            }
        }
    }
    inbox.close_peer(peer);
}

impl Transport for TcpTransport {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn send(&self, to: Rank, channel: Channel, payload: Bytes) -> Result<()> {
        if to == self.rank {
            return if self.mailboxes.deliver(to, channel, payload) {
                Ok(())
            } else {
                Err(Error::Disconnected { rank: to })
            };
        }
        let writer = self
            .writers
            .get(to)
            .and_then(Option::as_ref)
            .ok_or_else(|| Error::protocol(format!("no connection to rank {to}")))?;
        self.runtime
            .block_on(async {
                let mut stream = writer.lock().await;
                write_frame(&mut *stream, channel, &payload).await
            })
            .map_err(|e| match e {
                Error::Io(_) => Error::Disconnected { rank: to },
                other => other,
            })
    }

    fn recv(&self, from: Rank, channel: Channel) -> Result<Bytes> {
        self.mailboxes.recv(from, channel)
    }

    fn recv_any(&self, channel: Channel) -> Result<(Rank, Bytes)> {
        self.mailboxes.recv_any(channel)
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        for reader in &self.readers {
            reader.abort();
        }
        for peer in 0..self.world_size {
            self.mailboxes.close_peer(peer);
        }
    }
}
