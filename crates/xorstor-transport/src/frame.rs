//! Wire framing for the TCP transport.
//!
//! ```text
//! u16 magic | u16 channel | u32 payload length | payload
//! ```
//!
//! Integers are little-endian. Frames are read and written on the tokio
//! runtime owned by the TCP transport.

use crate::Channel;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use xorstor_common::{Error, Result};

/// Marks the start of every frame.
pub const MAGIC: u16 = 0x5852;

/// Largest payload a single frame may carry.
pub const MAX_PAYLOAD: usize = 256 * 1024 * 1024;

/// Channel reserved for the connection handshake.
pub const HANDSHAKE_CHANNEL: Channel = Channel::MAX;

/// Frame header (8 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Conversation tag
    pub channel: Channel,
    /// Payload length
    pub length: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Encode header to bytes
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16_le(MAGIC);
        buf.put_u16_le(self.channel);
        buf.put_u32_le(self.length);
    }

    /// Decode header from bytes
    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < Self::SIZE {
            return Err(Error::protocol("incomplete frame header"));
        }
        let magic = buf.get_u16_le();
        if magic != MAGIC {
            return Err(Error::protocol(format!("bad frame magic {magic:#06x}")));
        }
        let header = Self {
            channel: buf.get_u16_le(),
            length: buf.get_u32_le(),
        };
        if header.length as usize > MAX_PAYLOAD {
            return Err(Error::protocol(format!(
                "frame of {} bytes exceeds limit",
                header.length
            )));
        }
        Ok(header)
    }
}

/// Write one frame.
pub async fn write_frame<W>(w: &mut W, channel: Channel, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let length = u32::try_from(payload.len())
        .ok()
        .filter(|&len| len as usize <= MAX_PAYLOAD)
        .ok_or_else(|| Error::protocol(format!("payload of {} bytes too large", payload.len())))?;
    let mut header = BytesMut::with_capacity(FrameHeader::SIZE);
    FrameHeader { channel, length }.encode(&mut header);
    w.write_all(&header).await?;
    w.write_all(payload).await?;
    Ok(())
}

/// Read one frame; `None` on a clean end of stream between frames.
pub async fn read_frame<R>(r: &mut R) -> Result<Option<(Channel, Bytes)>>
where
    R: AsyncRead + Unpin,
{
    let mut raw = [0u8; FrameHeader::SIZE];
    let mut filled = 0;
    while filled < raw.len() {
        match r.read(&mut raw[filled..]).await? {
            0 if filled == 0 => return Ok(None),
            0 => return Err(Error::protocol("connection closed inside frame header")),
            n => filled += n,
        }
    }
    let header = FrameHeader::decode(&mut &raw[..])?;
    let mut payload = BytesMut::zeroed(header.length as usize);
    r.read_exact(&mut payload).await?;
    Ok(Some((header.channel, payload.freeze())))
}

/// Payload of the handshake frame: sender rank and world size.
#[must_use]
pub fn encode_handshake(rank: usize, world_size: usize) -> Bytes {
    let mut buf = BytesMut::with_capacity(16);
    buf.put_u64_le(rank as u64);
    buf.put_u64_le(world_size as u64);
    buf.freeze()
}

pub fn decode_handshake(mut payload: Bytes) -> Result<(usize, usize)> {
    if payload.len() != 16 {
        return Err(Error::protocol(format!(
            "handshake of {} bytes",
            payload.len()
        )));
    }
    let rank = usize::try_from(payload.get_u64_le())
        .map_err(|_| Error::protocol("handshake rank out of range"))?;
    let world = usize::try_from(payload.get_u64_le())
        .map_err(|_| Error::protocol("handshake world size out of range"))?;
    Ok((rank, world))
}
