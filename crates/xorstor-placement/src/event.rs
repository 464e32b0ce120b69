//! Change-event wire formats.
//!
//! Raw events come from the scanner as a byte stream of records with no
//! padding or delimiter:
//!
//! ```text
//! i64 timestamp | u64 byte_size | u8 event_type | u64 path_len | path
//! ```
//!
//! Forwarded events travel between nodes once the owning slot is known:
//!
//! ```text
//! i64 timestamp | u64 chunk_size | u64 path_len | u64 event_type | path
//! ```
//!
//! All integers are little-endian. Paths are relative to the chunk tree;
//! a record whose path is absolute or walks through `.` or `..` decodes to
//! [`Error::InvalidPath`] and the stream stays positioned on the next
//! record.

use bytes::{Buf, BufMut, BytesMut};
use std::io::{self, Read, Write};
use tracing::warn;
use xorstor_common::{ChangeKind, Error, Result};

/// Longest path accepted from an event stream.
pub const MAX_PATH_LEN: usize = 4096;

const RAW_HEADER_LEN: usize = 8 + 8 + 1 + 8;
const FORWARDED_HEADER_LEN: usize = 8 + 8 + 8 + 8;

/// Hash used to map a path to its owning slot and to seed placement.
#[must_use]
pub fn path_hash(path: &[u8]) -> u64 {
    xxhash_rust::xxh64::xxh64(path, 0)
}

/// Slot index that aggregates and resolves events for `path`.
#[must_use]
pub fn owner_of(path: &[u8], ntargets: usize) -> usize {
    // ntargets <= MAX_TARGETS, so the remainder fits in usize
    #[allow(clippy::cast_possible_truncation)]
    let owner = (path_hash(path) % ntargets.max(1) as u64) as usize;
    owner
}

/// One record of the scanner's change stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawEvent {
    pub timestamp: i64,
    pub size: u64,
    pub kind: ChangeKind,
    pub path: Vec<u8>,
}

impl RawEvent {
    /// Append this event in stream encoding.
    pub fn write_to(&self, w: &mut impl Write) -> io::Result<()> {
        w.write_all(&self.timestamp.to_le_bytes())?;
        w.write_all(&self.size.to_le_bytes())?;
        w.write_all(&[self.kind.code()])?;
        w.write_all(&(self.path.len() as u64).to_le_bytes())?;
        w.write_all(&self.path)
    }
}

/// Check that `path` names a file inside the chunk tree.
pub fn check_path(path: &[u8]) -> Result<()> {
    let bad = path.first() == Some(&b'/')
        || path.contains(&0)
        || path
            .split(|&b| b == b'/')
            .any(|part| part == b"." || part == b"..");
    if bad {
        return Err(Error::InvalidPath(String::from_utf8_lossy(path).into_owned()));
    }
    Ok(())
}

/// Decodes raw events from a byte stream.
pub struct RawEventReader<R> {
    inner: R,
    records: u64,
}

impl<R: Read> RawEventReader<R> {
    pub const fn new(inner: R) -> Self {
        Self { inner, records: 0 }
    }

    /// Number of events decoded so far.
    pub const fn records(&self) -> u64 {
        self.records
    }

    /// Next event, or `None` when the stream ends on a record boundary.
    ///
    /// [`Error::InvalidPath`] consumes the offending record; reading on
    /// yields the one after it.
    pub fn next_event(&mut self) -> Result<Option<RawEvent>> {
        let mut header = [0u8; RAW_HEADER_LEN];
        if !read_full_or_eof(&mut self.inner, &mut header)? {
            return Ok(None);
        }
        let mut buf = &header[..];
        let timestamp = buf.get_i64_le();
        let size = buf.get_u64_le();
        let kind = ChangeKind::from_code(u64::from(buf.get_u8()))?;
        let path_len = checked_path_len(buf.get_u64_le())?;

        let mut path = vec![0u8; path_len];
        self.inner.read_exact(&mut path).map_err(|e| {
            Error::InvalidEvent(format!(
                "stream ended inside record {}: {}",
                self.records, e
            ))
        })?;
        self.records += 1;
        check_path(&path)?;
        Ok(Some(RawEvent {
            timestamp,
            size,
            kind,
            path,
        }))
    }
}

impl<R: Read> Iterator for RawEventReader<R> {
    type Item = Result<RawEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_event().transpose()
    }
}

/// Fill `buf` completely. Returns false on EOF before the first byte.
fn read_full_or_eof(r: &mut impl Read, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(Error::InvalidEvent(format!(
                    "stream ended after {filled} header bytes"
                )));
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(true)
}

fn checked_path_len(len: u64) -> Result<usize> {
    match usize::try_from(len) {
        Ok(len) if len > 0 && len <= MAX_PATH_LEN => Ok(len),
        _ => Err(Error::InvalidEvent(format!("path length {len} out of range"))),
    }
}

/// Event as sent to the owning slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ForwardedEvent {
    pub timestamp: i64,
    pub chunk_size: u64,
    pub kind: ChangeKind,
    pub path: Vec<u8>,
}

impl From<RawEvent> for ForwardedEvent {
    fn from(ev: RawEvent) -> Self {
        Self {
            timestamp: ev.timestamp,
            chunk_size: ev.size,
            kind: ev.kind,
            path: ev.path,
        }
    }
}

impl ForwardedEvent {
    /// Size of this event once encoded.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        FORWARDED_HEADER_LEN + self.path.len()
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());
        buf.put_i64_le(self.timestamp);
        buf.put_u64_le(self.chunk_size);
        buf.put_u64_le(self.path.len() as u64);
        buf.put_u64_le(u64::from(self.kind.code()));
        buf.put_slice(&self.path);
    }

    /// Decode every event packed in one message.
    pub fn decode_all(mut buf: &[u8]) -> Result<Vec<Self>> {
        let mut events = Vec::new();
        while buf.has_remaining() {
            if buf.remaining() < FORWARDED_HEADER_LEN {
                return Err(Error::InvalidEvent(format!(
                    "truncated forwarded event header ({} bytes)",
                    buf.remaining()
                )));
            }
            let timestamp = buf.get_i64_le();
            let chunk_size = buf.get_u64_le();
            let path_len = checked_path_len(buf.get_u64_le())?;
            let kind = ChangeKind::from_code(buf.get_u64_le())?;
            if buf.remaining() < path_len {
                return Err(Error::InvalidEvent(format!(
                    "forwarded path needs {path_len} bytes, {} left",
                    buf.remaining()
                )));
            }
            let path = buf[..path_len].to_vec();
            buf.advance(path_len);
            if let Err(e) = check_path(&path) {
                warn!("Dropping forwarded event: {}", e);
                continue;
            }
            events.push(Self {
                timestamp,
                chunk_size,
                kind,
                path,
            });
        }
        Ok(events)
    }
}
