//! Packet framing.
//!
//! Every packet is `[length: u24 LE][seq_id: u8][payload: length bytes]`.
//! Payloads of 2^24-1 bytes or more span multiple frames: senders emit
//! max-length frames until a frame shorter than the maximum (possibly
//! empty) terminates the payload; readers reassemble accordingly.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtocolResult;

/// Maximum payload bytes in a single frame.
pub const MAX_PAYLOAD: usize = 0xFF_FFFF;

/// A reassembled wire packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Sequence id of the last frame of the payload.
    pub seq_id: u8,
    pub payload: Bytes,
}

async fn read_frame<R>(stream: &mut R) -> ProtocolResult<(u8, usize)>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let length =
        usize::from(header[0]) | usize::from(header[1]) << 8 | usize::from(header[2]) << 16;
    Ok((header[3], length))
}

/// Read one packet, reassembling continuation frames.
pub async fn read_packet<R>(stream: &mut R) -> ProtocolResult<Packet>
where
    R: AsyncRead + Unpin,
{
    let (mut seq_id, mut length) = read_frame(stream).await?;
    let mut payload = BytesMut::with_capacity(length);
    loop {
        let start = payload.len();
        payload.resize(start + length, 0);
        stream.read_exact(&mut payload[start..]).await?;
        if length < MAX_PAYLOAD {
            break;
        }
        let (next_seq, next_length) = read_frame(stream).await?;
        seq_id = next_seq;
        length = next_length;
    }
    Ok(Packet {
        seq_id,
        payload: payload.freeze(),
    })
}

/// Write one payload, splitting into continuation frames as needed.
/// Returns the sequence id following the last frame written.
pub async fn write_packet<W>(stream: &mut W, seq_id: u8, payload: &[u8]) -> ProtocolResult<u8>
where
    W: AsyncWrite + Unpin,
{
    let mut seq = seq_id;
    let mut rest = payload;
    loop {
        let chunk = rest.len().min(MAX_PAYLOAD);
        let header = [
            (chunk & 0xFF) as u8,
            ((chunk >> 8) & 0xFF) as u8,
            ((chunk >> 16) & 0xFF) as u8,
            seq,
        ];
        stream.write_all(&header).await?;
        stream.write_all(&rest[..chunk]).await?;
        seq = seq.wrapping_add(1);
        rest = &rest[chunk..];
        // A max-length frame demands a follow-up frame, even an empty one.
        if chunk < MAX_PAYLOAD {
            break;
        }
    }
    stream.flush().await?;
    Ok(seq)
}
