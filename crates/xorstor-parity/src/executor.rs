//! Per-path parity task execution.
//!
//! For one placement record every data holder streams its chunk to the
//! parity holder, which XORs the blocks and writes the artifact. The
//! exchange on the task's lane channel is:
//!
//! 1. Each sender reports its chunk size (8 bytes LE). During a rebuild
//!    the former parity holder instead forwards the size header of its
//!    parity artifact.
//! 2. The generator replies with the largest size.
//! 3. Every sender streams `ceil(max / block)` zero-padded blocks. Past
//!    the first [`CREDIT_WINDOW`] rounds a sender waits for an empty
//!    credit message, which the generator sends once it has folded the
//!    round that many places back.
//!
//! Local I/O failures never abort the exchange: the node substitutes zeros
//! and discards writes so its peers finish the task, and the failure is
//! recorded in the [`ExecutionContext`].

use bytes::{Bytes, BytesMut};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::thread;
use tracing::{debug, trace};
use xorstor_common::{Error, Locations, PlacementRecord, Result, TargetMask, TargetSlot};
use xorstor_transport::{Channel, Rank, Transport};

use crate::context::{ArtifactDir, ExecutionContext, TaskContext};
use crate::xor::xor_blocks;

/// Width of one entry of the parity size header.
pub const SIZE_FIELD: usize = 8;

/// Rounds a sender may run ahead of the generator's fold.
pub(crate) const CREDIT_WINDOW: u64 = 2;

/// What this node does for a given record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    ParityGenerator,
    ChunkSender,
    Uninvolved,
}

impl Role {
    #[must_use]
    pub const fn of(slot: TargetSlot, locations: Locations) -> Self {
        if locations.parity().is_none() {
            Self::Uninvolved
        } else if locations.is_parity(slot) {
            Self::ParityGenerator
        } else if locations.data().contains(slot) {
            Self::ChunkSender
        } else {
            Self::Uninvolved
        }
    }
}

/// Work this node did for one task.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TaskOutcome {
    pub involved: bool,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

/// Run this node's part of the task for `path`.
///
/// Errors are transport or protocol failures; local I/O failures are
/// recorded in `ctx` instead.
pub fn process_task(
    ctx: &ExecutionContext,
    path: &[u8],
    record: &PlacementRecord,
    task: &TaskContext,
) -> Result<TaskOutcome> {
    match Role::of(ctx.slot(), record.locations) {
        Role::ParityGenerator => generate_parity(ctx, path, record, task),
        Role::ChunkSender => send_chunk(ctx, path, record, task),
        Role::Uninvolved => Ok(TaskOutcome::default()),
    }
}

/// Streaming block length: the buffer size, capped by the largest chunk.
fn block_len(buffer_size: usize, max_size: u64) -> usize {
    usize::try_from(max_size).map_or(buffer_size, |max| buffer_size.min(max))
}

fn rounds(max_size: u64, block: usize) -> u64 {
    if block == 0 {
        0
    } else {
        max_size.div_ceil(block as u64)
    }
}

fn decode_u64(payload: &[u8]) -> Result<u64> {
    let raw: [u8; 8] = payload
        .try_into()
        .map_err(|_| Error::protocol(format!("expected 8-byte size, got {} bytes", payload.len())))?;
    Ok(u64::from_le_bytes(raw))
}

fn encode_sizes(sizes: &[u64]) -> Vec<u8> {
    sizes.iter().flat_map(|s| s.to_le_bytes()).collect()
}

fn decode_sizes(payload: &[u8], count: usize) -> Result<Vec<u64>> {
    if payload.len() != count * SIZE_FIELD {
        return Err(Error::protocol(format!(
            "size header of {} bytes for {count} chunks",
            payload.len()
        )));
    }
    payload.chunks_exact(SIZE_FIELD).map(decode_u64).collect()
}

enum ArtifactSink {
    File(File),
    Null,
}

impl ArtifactSink {
    const fn null() -> Self {
        Self::Null
    }

    /// Write `buf`, switching to the null sink on the first failure.
    fn write_block(&mut self, buf: &[u8], local_err: &mut Option<io::Error>) {
        if let Self::File(file) = self
            && let Err(e) = file.write_all(buf)
        {
            local_err.get_or_insert(e);
            *self = Self::null();
        }
    }
}

enum ChunkSource {
    File(File),
    Zero,
}

impl ChunkSource {
    const fn zero() -> Self {
        Self::Zero
    }

    const fn is_file(&self) -> bool {
        matches!(self, Self::File(_))
    }

    /// Fill `buf` from the file. The part past end of file stays zero; a
    /// read failure zeroes the whole block and switches to zeros.
    fn fill(&mut self, buf: &mut [u8], local_err: &mut Option<io::Error>) {
        let Self::File(file) = self else {
            return;
        };
        let mut filled = 0;
        while filled < buf.len() {
            match file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    buf.fill(0);
                    local_err.get_or_insert(e);
                    *self = Self::zero();
                    return;
                }
            }
        }
    }
}

fn generate_parity(
    ctx: &ExecutionContext,
    path: &[u8],
    record: &PlacementRecord,
    task: &TaskContext,
) -> Result<TaskOutcome> {
    let transport = ctx.transport();
    let channel = task.channel();
    let data = record.locations.data();
    let sources = data
        .iter()
        .map(|slot| ctx.rank_of(slot))
        .collect::<Result<Vec<Rank>>>()?;

    if sources.is_empty() {
        remove_artifact(ctx, path, task.write_dir);
        return Ok(TaskOutcome {
            involved: true,
            ..TaskOutcome::default()
        });
    }

    let sizes = if task.is_rebuild {
        let holder = task
            .prior_parity
            .ok_or_else(|| Error::protocol("rebuild task without a prior parity holder"))?;
        let header = transport.recv(ctx.rank_of(holder)?, channel)?;
        decode_sizes(&header, sources.len())?
    } else {
        sources
            .iter()
            .map(|&rank| decode_u64(&transport.recv(rank, channel)?))
            .collect::<Result<Vec<u64>>>()?
    };
    let max_size = sizes.iter().copied().max().unwrap_or(0);
    let reply = Bytes::copy_from_slice(&max_size.to_le_bytes());
    for &rank in &sources {
        transport.send(rank, channel, reply.clone())?;
    }

    let header_len = if task.is_rebuild {
        0
    } else {
        (sizes.len() * SIZE_FIELD) as u64
    };
    let final_len = if task.is_rebuild {
        rebuilt_len(ctx.slot(), record.locations, task, &sizes)?
    } else {
        max_size + header_len
    };

    let mut local_err = None;
    let mut sink = if ctx.has_failed() {
        ArtifactSink::null()
    } else {
        match open_for_write(ctx, path, task.write_dir, max_size + header_len) {
            Ok(file) => ArtifactSink::File(file),
            Err(e) => {
                local_err = Some(e);
                ArtifactSink::null()
            }
        }
    };
    if !task.is_rebuild {
        sink.write_block(&encode_sizes(&sizes), &mut local_err);
    }

    let block = block_len(ctx.buffer_size(), max_size);
    stream_parity(
        transport,
        &sources,
        channel,
        block,
        max_size,
        &mut sink,
        &mut local_err,
    )?;

    if task.is_rebuild
        && let ArtifactSink::File(file) = &sink
        && let Err(e) = file.set_len(final_len)
    {
        local_err.get_or_insert(e);
    }
    if let Some(e) = local_err {
        ctx.record_error(path, &e);
    }
    trace!(
        "Wrote {} bytes for '{}' from {} sources",
        final_len,
        String::from_utf8_lossy(path),
        sources.len()
    );
    Ok(TaskOutcome {
        involved: true,
        bytes_read: 0,
        bytes_written: final_len,
    })
}

/// Length of the chunk being regenerated on `me`.
///
/// The size header lists the original data holders in ascending slot
/// order; before the remap `me` was a data holder and the former parity
/// holder was not.
fn rebuilt_len(
    me: TargetSlot,
    locations: Locations,
    task: &TaskContext,
    sizes: &[u64],
) -> Result<u64> {
    let mut survivors = locations.data();
    if let Some(prior) = task.prior_parity {
        survivors.remove(prior);
    }
    let index = survivors.intersection(TargetMask::below(me)).len();
    sizes.get(index).copied().ok_or_else(|| {
        Error::protocol(format!(
            "size header has {} entries, need index {index}",
            sizes.len()
        ))
    })
}

/// Receive and fold every round. Receiving and XOR+write overlap through
/// a one-slot handoff when more than one round is needed.
fn stream_parity(
    transport: &dyn Transport,
    sources: &[Rank],
    channel: Channel,
    block: usize,
    max_size: u64,
    sink: &mut ArtifactSink,
    local_err: &mut Option<io::Error>,
) -> Result<()> {
    let rounds = rounds(max_size, block);
    if rounds == 0 {
        return Ok(());
    }

    let mut acc = vec![0u8; block];
    let mut remaining = max_size;
    let mut folded = 0u64;
    let mut fold = |blocks: Vec<Bytes>| -> Result<()> {
        xor_blocks(&mut acc, &blocks);
        let n = usize::try_from(remaining).map_or(block, |r| r.min(block));
        sink.write_block(&acc[..n], local_err);
        remaining -= n as u64;
        if folded + CREDIT_WINDOW < rounds {
            for &rank in sources {
                transport.send(rank, channel, Bytes::new())?;
            }
        }
        folded += 1;
        Ok(())
    };

    if rounds == 1 {
        return fold(receive_round(transport, sources, channel, block)?);
    }

    thread::scope(|scope| {
        let (tx, rx) = crossbeam_channel::bounded::<Vec<Bytes>>(1);
        let receiver = thread::Builder::new()
            .name("xorstor-recv".to_string())
            .spawn_scoped(scope, move || -> Result<()> {
                for _ in 0..rounds {
                    let blocks = receive_round(transport, sources, channel, block)?;
                    if tx.send(blocks).is_err() {
                        break;
                    }
                }
                Ok(())
            })
            .map_err(|e| Error::thread(format!("spawn receive stage: {e}")))?;
        let folding = rx.iter().try_for_each(&mut fold);
        drop(rx);
        let received = receiver
            .join()
            .map_err(|_| Error::thread("receive stage panicked"))?;
        folding.and(received)
    })
}

fn receive_round(
    transport: &dyn Transport,
    sources: &[Rank],
    channel: Channel,
    block: usize,
) -> Result<Vec<Bytes>> {
    sources
        .iter()
        .map(|&rank| {
            let payload = transport.recv(rank, channel)?;
            if payload.len() == block {
                Ok(payload)
            } else {
                Err(Error::protocol(format!(
                    "rank {rank} sent a {}-byte block, expected {block}",
                    payload.len()
                )))
            }
        })
        .collect()
}

fn send_chunk(
    ctx: &ExecutionContext,
    path: &[u8],
    record: &PlacementRecord,
    task: &TaskContext,
) -> Result<TaskOutcome> {
    let transport = ctx.transport();
    let channel = task.channel();
    let parity = record
        .locations
        .parity()
        .ok_or_else(|| Error::protocol("chunk sender without a parity holder"))?;
    let generator = ctx.rank_of(parity)?;
    let nsources = record.locations.data().len();
    let reading_parity = task.is_rebuild && task.prior_parity == Some(ctx.slot());

    let mut local_err = None;
    let mut size = 0u64;
    let mut source = ChunkSource::zero();
    if !ctx.has_failed() {
        match open_for_read(ctx, path, task.read_dir) {
            Ok((file, meta)) => {
                size = meta.len();
                if reading_parity {
                    size = size.saturating_sub((nsources * SIZE_FIELD) as u64);
                } else if task.is_rebuild && meta.mtime() > record.timestamp {
                    ctx.report_corrupt(path);
                }
                source = ChunkSource::File(file);
            }
            Err(e) => local_err = Some(e),
        }
    }

    if reading_parity {
        let mut header = vec![0u8; nsources * SIZE_FIELD];
        if let ChunkSource::File(file) = &mut source
            && let Err(e) = file.read_exact(&mut header)
        {
            header.fill(0);
            local_err.get_or_insert(e);
            source = ChunkSource::zero();
        }
        transport.send(generator, channel, Bytes::from(header))?;
    } else if !task.is_rebuild {
        transport.send(generator, channel, Bytes::copy_from_slice(&size.to_le_bytes()))?;
    }

    let max_size = decode_u64(&transport.recv(generator, channel)?)?;
    let block = block_len(ctx.buffer_size(), max_size);
    let mut sent = 0u64;
    let mut round = 0u64;
    while sent < max_size {
        if round >= CREDIT_WINDOW {
            transport.recv(generator, channel)?;
        }
        let want = usize::try_from(max_size - sent).map_or(block, |left| left.min(block));
        let mut buf = BytesMut::zeroed(block);
        if source.is_file() {
            source.fill(&mut buf[..want], &mut local_err);
        }
        transport.send(generator, channel, buf.freeze())?;
        sent += block as u64;
        round += 1;
    }

    if let Some(e) = local_err {
        if e.kind() == io::ErrorKind::NotFound && !task.is_rebuild {
            debug!(
                "'{}' is gone; sent zeros pending its unlink event",
                String::from_utf8_lossy(path)
            );
        } else {
            ctx.record_error(path, &e);
        }
    }
    Ok(TaskOutcome {
        involved: true,
        bytes_read: size,
        bytes_written: 0,
    })
}

fn open_for_read(
    ctx: &ExecutionContext,
    path: &[u8],
    dir: ArtifactDir,
) -> io::Result<(File, fs::Metadata)> {
    let file = File::open(ctx.root().artifact(dir, path)?)?;
    advise_sequential(&file);
    let meta = file.metadata()?;
    Ok((file, meta))
}

fn open_for_write(
    ctx: &ExecutionContext,
    path: &[u8],
    dir: ArtifactDir,
    len: u64,
) -> io::Result<File> {
    let target = ctx.root().artifact(dir, path)?;
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(&target)?;
    preallocate(&file, len);
    Ok(file)
}

fn remove_artifact(ctx: &ExecutionContext, path: &[u8], dir: ArtifactDir) {
    if ctx.has_failed() {
        return;
    }
    let result = ctx
        .root()
        .artifact(dir, path)
        .and_then(fs::remove_file);
    match result {
        Ok(()) => debug!("Removed artifact '{}'", String::from_utf8_lossy(path)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => ctx.record_error(path, &e),
    }
}

#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
fn preallocate(file: &File, len: u64) {
    use std::os::unix::io::AsRawFd;

    let Ok(len) = libc::off_t::try_from(len) else {
        return;
    };
    if len == 0 {
        return;
    }
    let ret = unsafe { libc::posix_fallocate(file.as_raw_fd(), 0, len) };
    if ret != 0 {
        debug!(
            "posix_fallocate failed: {}",
            io::Error::from_raw_os_error(ret)
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn preallocate(_file: &File, _len: u64) {}

#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
fn advise_sequential(file: &File) {
    use std::os::unix::io::AsRawFd;

    let fd = file.as_raw_fd();
    for advice in [libc::POSIX_FADV_SEQUENTIAL, libc::POSIX_FADV_WILLNEED] {
        let ret = unsafe { libc::posix_fadvise(fd, 0, 0, advice) };
        if ret != 0 {
            trace!("posix_fadvise failed: {}", io::Error::from_raw_os_error(ret));
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn advise_sequential(_file: &File) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::StorageRoot;
    use std::sync::Arc;
    use tempfile::{TempDir, tempdir};
    use xorstor_transport::ChannelFabric;

    fn slot(i: usize) -> TargetSlot {
        TargetSlot::new(i).unwrap()
    }

    fn locations(data: &[usize], parity: usize) -> Locations {
        Locations::new(data.iter().map(|&i| slot(i)).collect(), Some(slot(parity)))
    }

    struct Node {
        _dir: TempDir,
        ctx: ExecutionContext,
    }

    fn cluster(n: usize, buffer_size: usize) -> Vec<Node> {
        ChannelFabric::build(n)
            .into_iter()
            .enumerate()
            .map(|(rank, transport)| {
                let dir = tempdir().unwrap();
                let ctx = ExecutionContext::new(
                    Arc::new(transport),
                    slot(rank),
                    (0..n).collect(),
                    StorageRoot::new(dir.path()),
                    buffer_size,
                    dir.path().join("corrupt.txt"),
                );
                Node { _dir: dir, ctx }
            })
            .collect()
    }

    fn put(node: &Node, dir: ArtifactDir, rel: &str, contents: &[u8]) {
        let path = node.ctx.root().artifact(dir, rel.as_bytes()).unwrap();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    fn get(node: &Node, dir: ArtifactDir, rel: &str) -> Option<Vec<u8>> {
        fs::read(node.ctx.root().artifact(dir, rel.as_bytes()).unwrap()).ok()
    }

    fn run_all(
        nodes: &[Node],
        rel: &str,
        record: PlacementRecord,
        task_for: impl Fn(usize) -> TaskContext,
    ) -> Vec<TaskOutcome> {
        thread::scope(|scope| {
            let handles: Vec<_> = nodes
                .iter()
                .enumerate()
                .map(|(i, node)| {
                    let task = task_for(i);
                    scope.spawn(move || {
                        process_task(&node.ctx, rel.as_bytes(), &record, &task).unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        })
    }

    #[test]
    fn test_roles() {
        let loc = locations(&[0, 2], 1);
        assert_eq!(Role::of(slot(1), loc), Role::ParityGenerator);
        assert_eq!(Role::of(slot(0), loc), Role::ChunkSender);
        assert_eq!(Role::of(slot(3), loc), Role::Uninvolved);
        let saturated = Locations::new(TargetMask::from_bits(0b11), None);
        assert_eq!(Role::of(slot(0), saturated), Role::Uninvolved);
    }

    #[test]
    fn test_block_and_rounds() {
        assert_eq!(block_len(10, 4), 4);
        assert_eq!(block_len(10, 25), 10);
        assert_eq!(rounds(25, 10), 3);
        assert_eq!(rounds(0, 0), 0);
    }

    #[test]
    fn test_parity_of_unequal_chunks() {
        let nodes = cluster(3, 4);
        put(&nodes[0], ArtifactDir::Chunks, "d/f", &[0xAA; 10]);
        put(&nodes[2], ArtifactDir::Chunks, "d/f", &[0x55; 6]);
        let record = PlacementRecord::new(100, locations(&[0, 2], 1));

        let outcomes = run_all(&nodes, "d/f", record, |_| TaskContext::generate().on_lane(3));

        let parity = get(&nodes[1], ArtifactDir::Parity, "d/f").unwrap();
        let mut expected = Vec::new();
        expected.extend_from_slice(&10u64.to_le_bytes());
        expected.extend_from_slice(&6u64.to_le_bytes());
        expected.extend_from_slice(&[0xFF; 6]);
        expected.extend_from_slice(&[0xAA; 4]);
        assert_eq!(parity, expected);

        assert_eq!(outcomes[0].bytes_read, 10);
        assert_eq!(outcomes[2].bytes_read, 6);
        assert_eq!(outcomes[1].bytes_written, 26);
        assert!(nodes.iter().all(|n| !n.ctx.has_failed()));
    }

    #[test]
    fn test_missing_chunk_sends_zeros() {
        let nodes = cluster(2, 1024);
        let record = PlacementRecord::new(1, locations(&[0], 1));

        run_all(&nodes, "gone", record, |_| TaskContext::generate());

        assert_eq!(
            get(&nodes[1], ArtifactDir::Parity, "gone").unwrap(),
            0u64.to_le_bytes().to_vec()
        );
        assert!(!nodes[0].ctx.has_failed());
    }

    #[test]
    fn test_empty_data_removes_parity() {
        let nodes = cluster(2, 1024);
        put(&nodes[1], ArtifactDir::Parity, "old", b"stale");
        let record = PlacementRecord::new(1, Locations::new(TargetMask::EMPTY, Some(slot(1))));

        let outcomes = run_all(&nodes, "old", record, |_| TaskContext::generate());

        assert!(get(&nodes[1], ArtifactDir::Parity, "old").is_none());
        assert!(outcomes[1].involved);
        assert!(!outcomes[0].involved);
    }

    #[test]
    fn test_rebuild_restores_lost_chunk() {
        let nodes = cluster(3, 4);
        let a: Vec<u8> = (0u8..11).collect();
        let b: Vec<u8> = (100u8..107).collect();
        put(&nodes[0], ArtifactDir::Chunks, "x", &a);
        put(&nodes[1], ArtifactDir::Chunks, "x", &b);
        let record = PlacementRecord::new(i64::MAX, locations(&[0, 1], 2));
        run_all(&nodes, "x", record, |_| TaskContext::generate());

        // Slot 0 is lost and regenerated from slot 1 and the parity on slot 2
        fs::remove_dir_all(nodes[0].ctx.root().dir(ArtifactDir::Chunks)).unwrap();
        let remapped = PlacementRecord::new(i64::MAX, locations(&[1, 2], 0));
        run_all(&nodes, "x", remapped, |i| TaskContext {
            read_dir: if i == 2 { ArtifactDir::Parity } else { ArtifactDir::Chunks },
            write_dir: if i == 0 { ArtifactDir::Chunks } else { ArtifactDir::Parity },
            is_rebuild: true,
            prior_parity: Some(slot(2)),
            lane: 0,
        });

        assert_eq!(get(&nodes[0], ArtifactDir::Chunks, "x").unwrap(), a);
        assert_eq!(nodes[1].ctx.corrupt_count(), 0);
    }

    #[test]
    fn test_sender_waits_for_credit() {
        let nodes = cluster(2, 4);
        let chunk: Vec<u8> = (0u8..40).collect();
        put(&nodes[0], ArtifactDir::Chunks, "big", &chunk);
        let record = PlacementRecord::new(1, locations(&[0], 1));
        let task = TaskContext::generate();
        let channel = task.channel();

        thread::scope(|scope| {
            let sender = scope.spawn(|| {
                process_task(&nodes[0].ctx, b"big", &record, &task).unwrap()
            });

            // Drive the generator side by hand
            let transport = nodes[1].ctx.transport();
            assert_eq!(decode_u64(&transport.recv(0, channel).unwrap()).unwrap(), 40);
            transport
                .send(0, channel, Bytes::copy_from_slice(&40u64.to_le_bytes()))
                .unwrap();

            thread::sleep(std::time::Duration::from_millis(200));
            assert!(!sender.is_finished());

            let rounds = 10;
            let mut received = Vec::new();
            for r in 0..rounds {
                received.extend_from_slice(&transport.recv(0, channel).unwrap());
                if r + CREDIT_WINDOW < rounds {
                    transport.send(0, channel, Bytes::new()).unwrap();
                }
            }
            assert_eq!(received, chunk);
            assert_eq!(sender.join().unwrap().bytes_read, 40);
        });
    }

    #[test]
    fn test_local_failure_is_sticky_but_exchange_completes() {
        let nodes = cluster(3, 1024);
        let record = PlacementRecord::new(1, locations(&[0, 1], 2));

        let outcomes = run_all(&nodes, "../bad", record, |_| TaskContext::generate());

        assert!(nodes.iter().all(|n| n.ctx.has_failed()));
        assert!(outcomes.iter().all(|o| o.involved));
        let sticky = nodes[0].ctx.sticky_error().unwrap();
        assert_eq!(sticky.kind, io::ErrorKind::InvalidInput);
    }
}
