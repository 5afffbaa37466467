pub mod acl;
pub mod huffman;
pub mod throttle;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::protocol::{classify_length, PacketLength};

/// Bytes every client sends before its first packet; discarded.
pub const PREAMBLE_LEN: usize = 4;

/// Largest total length a dynamic packet may declare.
pub const MAX_PACKET_LEN: usize = 0x8000;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("Unknown packet id {0:#04X}")]
    UnknownPacket(u8),

    #[error("Implausible length {length} for packet {id:#04X}")]
    ImplausibleLength { id: u8, length: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Splits an inbound byte stream into whole packets.
///
/// Bytes are appended as they arrive; `next_packet` yields a packet only
/// once all of it is buffered, so arbitrary read boundaries are fine.
#[derive(Debug, Default)]
pub struct Framer {
    buf: BytesMut,
    preamble_left: usize,
}

impl Framer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_preamble(len: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
            preamble_left: len,
        }
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Direct access for `read_buf`.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn next_packet(&mut self) -> Result<Option<Bytes>, FrameError> {
        if self.preamble_left > 0 {
            let n = self.preamble_left.min(self.buf.len());
            self.buf.advance(n);
            self.preamble_left -= n;
            if self.preamble_left > 0 {
                return Ok(None);
            }
        }

        let Some(&id) = self.buf.first() else {
            return Ok(None);
        };

        let length = match classify_length(id) {
            PacketLength::Fixed(n) => n,
            PacketLength::Dynamic => {
                if self.buf.len() < 3 {
                    return Ok(None);
                }
                let length = u16::from_be_bytes([self.buf[1], self.buf[2]]) as usize;
                if !(3..=MAX_PACKET_LEN).contains(&length) {
                    return Err(FrameError::ImplausibleLength { id, length });
                }
                length
            }
            PacketLength::Invalid => return Err(FrameError::UnknownPacket(id)),
        };

        if self.buf.len() < length {
            return Ok(None);
        }
        Ok(Some(self.buf.split_to(length).freeze()))
    }
}

/// Reads until one whole packet is framed.
///
/// Returns `Ok(None)` when the peer closes the connection. Only
/// `read_buf` is awaited, so the future can be dropped between packets
/// without losing buffered bytes.
pub async fn read_packet<R>(reader: &mut R, framer: &mut Framer) -> Result<Option<Bytes>, ReadError>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(packet) = framer.next_packet()? {
            return Ok(Some(packet));
        }
        let n = reader.read_buf(framer.buffer_mut()).await?;
        if n == 0 {
            if framer.buffered() > 0 {
                tracing::debug!(
                    "[network] [read] connection closed with {} unframed bytes",
                    framer.buffered()
                );
            }
            return Ok(None);
        }
    }
}
