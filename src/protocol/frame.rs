//! Frame layer and primitive field codecs.
//!
//! Wire format: all multi-byte integers are big-endian.
//! Strings are length-prefixed (u16 len + UTF-8), blobs are u32 length-prefixed.
//! Frame format: len:u32 | tag:u8 | payload, where `len` counts payload bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{AppResult, DaqError};

/// Largest payload accepted from the network.
pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// Size of the `len | tag` frame header.
pub const HEADER_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageTag {
    Acknowledge = 0,
    StreamData = 1,
    ServiceData = 2,
    Error = 3,
}

impl MessageTag {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Acknowledge),
            1 => Some(Self::StreamData),
            2 => Some(Self::ServiceData),
            3 => Some(Self::Error),
            _ => None,
        }
    }
}

/// One undecoded message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Raw discriminant; unknown values are reported when decoding.
    pub tag: u8,
    pub payload: Bytes,
}

impl Frame {
    pub fn message_tag(&self) -> AppResult<MessageTag> {
        MessageTag::from_u8(self.tag)
            .ok_or_else(|| DaqError::Protocol(format!("unknown message tag {}", self.tag)))
    }
}

/// Start a frame; finish it with [`finish_frame`].
pub(crate) fn begin_frame(tag: MessageTag, capacity: usize) -> BytesMut {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + capacity);
    buf.put_u32(0);
    buf.put_u8(tag as u8);
    buf
}

/// Patch the payload length into the header.
pub(crate) fn finish_frame(mut buf: BytesMut) -> AppResult<Bytes> {
    let payload_len = buf.len() - HEADER_LEN;
    let len = u32::try_from(payload_len)
        .ok()
        .filter(|len| *len <= MAX_FRAME_SIZE)
        .ok_or_else(|| {
            DaqError::Protocol(format!(
                "frame of {} bytes exceeds maximum {}",
                payload_len, MAX_FRAME_SIZE
            ))
        })?;
    buf[..4].copy_from_slice(&len.to_be_bytes());
    Ok(buf.freeze())
}

/// Read one frame. Returns `None` if the peer closed the connection cleanly
/// between frames.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> AppResult<Option<Frame>> {
    let len = match r.read_u32().await {
        Ok(len) => len,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    // Validate frame size before allocation
    if len > MAX_FRAME_SIZE {
        return Err(DaqError::Protocol(format!(
            "Frame size {} exceeds maximum allowed size {}",
            len, MAX_FRAME_SIZE
        )));
    }

    let tag = r.read_u8().await?;
    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload).await?;

    Ok(Some(Frame {
        tag,
        payload: Bytes::from(payload),
    }))
}

/// Write a pre-encoded frame to the stream.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &Bytes) -> AppResult<()> {
    w.write_all(frame).await?;
    w.flush().await?;
    Ok(())
}

// =============================================================================
// Field codecs
// =============================================================================

fn ensure(buf: &Bytes, needed: usize, what: &str) -> AppResult<()> {
    if buf.remaining() < needed {
        return Err(DaqError::Protocol(format!(
            "{} truncated: need {} bytes, {} left",
            what,
            needed,
            buf.remaining()
        )));
    }
    Ok(())
}

pub(crate) fn put_string(buf: &mut BytesMut, value: &str) -> AppResult<()> {
    let len = u16::try_from(value.len())
        .map_err(|_| DaqError::Protocol(format!("string of {} bytes is too long", value.len())))?;
    buf.put_u16(len);
    buf.put_slice(value.as_bytes());
    Ok(())
}

pub(crate) fn put_blob(buf: &mut BytesMut, value: &[u8]) -> AppResult<()> {
    let len = u32::try_from(value.len())
        .map_err(|_| DaqError::Protocol(format!("blob of {} bytes is too long", value.len())))?;
    buf.put_u32(len);
    buf.put_slice(value);
    Ok(())
}

pub(crate) fn put_count(buf: &mut BytesMut, count: usize) -> AppResult<()> {
    let count = u16::try_from(count)
        .map_err(|_| DaqError::Protocol(format!("list of {} entries is too long", count)))?;
    buf.put_u16(count);
    Ok(())
}

pub(crate) fn get_u16(buf: &mut Bytes, what: &str) -> AppResult<u16> {
    ensure(buf, 2, what)?;
    Ok(buf.get_u16())
}

pub(crate) fn get_u64(buf: &mut Bytes, what: &str) -> AppResult<u64> {
    ensure(buf, 8, what)?;
    Ok(buf.get_u64())
}

pub(crate) fn get_string(buf: &mut Bytes, what: &str) -> AppResult<String> {
    let len = usize::from(get_u16(buf, what)?);
    ensure(buf, len, what)?;
    let bytes = buf.split_to(len);
    String::from_utf8(bytes.to_vec())
        .map_err(|_| DaqError::Protocol(format!("{} is not valid UTF-8", what)))
}

/// Zero-copy slice of the frame payload.
pub(crate) fn get_blob(buf: &mut Bytes, what: &str) -> AppResult<Bytes> {
    ensure(buf, 4, what)?;
    let len = buf.get_u32() as usize;
    ensure(buf, len, what)?;
    Ok(buf.split_to(len))
}

pub(crate) fn expect_end(buf: &Bytes, what: &str) -> AppResult<()> {
    if buf.has_remaining() {
        return Err(DaqError::Protocol(format!(
            "{} has {} trailing bytes",
            what,
            buf.remaining()
        )));
    }
    Ok(())
}
