//! Packet length table, byte cursor and writer helpers shared by the typed
//! client and server packets.

pub mod client;
pub mod server;

use bytes::{BufMut, BytesMut};

pub use client::{ClientPacket, GumpResponse, TargetPacket};
pub use server::{CharacterEntry, ServerEntry, ServerPacket};

/// How many bytes a packet occupies, decided by its first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketLength {
    /// Total length including the id byte
    Fixed(usize),
    /// Bytes 1..3 hold the big-endian total length
    Dynamic,
    /// Not a packet; the stream can no longer be trusted
    Invalid,
}

const DYN: u16 = 0x8000;

/// Total packet lengths by id. `DYN` marks a length-prefixed packet and 0
/// an id no client may send.
static PACKET_LENGTHS: [u16; 256] = [
    // 0x00
    0x0068, 0x0005, 0x0007, DYN, 0x0002, 0x0005, 0x0005, 0x0007, 0x000F, 0x0005, 0x000B, 0x010A, DYN, 0x0003, DYN, 0x003D,
    // 0x10
    0x00D7, DYN, DYN, 0x000A, 0x0006, 0x0009, DYN, DYN, DYN, DYN, DYN, 0x0025, DYN, 0x0005, 0x0004, 0x0008,
    // 0x20
    0x0013, 0x0008, 0x0003, 0x001A, 0x0007, 0x0015, 0x0005, 0x0002, 0x0005, 0x0001, 0x0005, 0x0002, 0x0002, 0x0011, 0x000F, 0x000A,
    // 0x30
    0x0005, DYN, 0x0002, 0x0002, 0x000A, 0x028D, DYN, 0x0008, 0x0007, 0x0009, DYN, DYN, DYN, 0x0002, 0x0025, DYN,
    // 0x40
    0x00C9, DYN, DYN, 0x0229, 0x02C9, 0x0005, DYN, 0x000B, 0x0049, 0x005D, 0x0005, 0x0009, DYN, DYN, 0x0006, 0x0002,
    // 0x50
    DYN, DYN, DYN, 0x0002, 0x000C, 0x0001, 0x000B, 0x006E, 0x006A, DYN, DYN, 0x0004, 0x0002, 0x0049, DYN, 0x0031,
    // 0x60
    0x0005, 0x0009, 0x000F, 0x000D, 0x0001, 0x0004, DYN, 0x0015, DYN, DYN, 0x0003, 0x0009, 0x0013, 0x0003, 0x000E, DYN,
    // 0x70
    0x001C, DYN, 0x0005, 0x0002, DYN, 0x0023, 0x0010, 0x0011, DYN, 0x0009, DYN, 0x0002, DYN, 0x000D, 0x0002, DYN,
    // 0x80
    0x003E, DYN, 0x0002, 0x0027, 0x0045, 0x0002, DYN, DYN, 0x0042, DYN, DYN, DYN, 0x000B, DYN, DYN, DYN,
    // 0x90
    0x0013, 0x0041, DYN, 0x0063, DYN, 0x0009, DYN, 0x0002, DYN, 0x001E, DYN, 0x0102, 0x0135, 0x0033, DYN, DYN,
    // 0xA0
    0x0003, 0x0009, 0x0009, 0x0009, 0x0095, DYN, DYN, 0x0004, DYN, DYN, 0x0005, DYN, DYN, DYN, DYN, 0x000D,
    // 0xB0
    DYN, DYN, DYN, DYN, DYN, 0x0040, 0x0009, DYN, DYN, 0x0003, 0x0006, 0x0009, 0x0003, DYN, DYN, DYN,
    // 0xC0
    0x0024, DYN, DYN, DYN, 0x0006, 0x00CB, 0x0001, 0x0031, 0x0002, 0x0006, 0x0006, 0x0007, DYN, 0x0001, DYN, 0x004E,
    // 0xD0
    DYN, 0x0002, 0x0019, DYN, DYN, DYN, DYN, DYN, DYN, 0x010C, DYN, DYN, 0x0009, DYN, DYN, DYN,
    // 0xE0
    DYN, DYN, 0x000A, DYN, DYN, DYN, 0x0005, 0x000C, 0x000D, 0x004B, 0x0003, DYN, DYN, DYN, 0x000A, 0x0015,
    // 0xF0
    DYN, 0x0009, 0x0019, 0x001A, DYN, 0x0015, DYN, DYN, 0x006A, DYN, DYN, DYN, DYN, DYN, DYN, 0,
];

pub fn classify_length(id: u8) -> PacketLength {
    match PACKET_LENGTHS[id as usize] {
        0 => PacketLength::Invalid,
        DYN => PacketLength::Dynamic,
        n => PacketLength::Fixed(n as usize),
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    /// Framed correctly but not handled; the packet is skipped.
    #[error("Unsupported packet {0:#04X}")]
    Unsupported(u8),

    /// Shorter than its fields require; fatal for the connection.
    #[error("Malformed packet {id:#04X}: need {needed} bytes at offset {offset}, have {len}")]
    Malformed {
        id: u8,
        offset: usize,
        needed: usize,
        len: usize,
    },
}

impl DecodeError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, DecodeError::Malformed { .. })
    }
}

/// Bounds-checked big-endian cursor over one framed packet.
pub struct PacketReader<'a> {
    data: &'a [u8],
    pos: usize,
    id: u8,
}

impl<'a> PacketReader<'a> {
    /// Positions the cursor after the id byte, and after the length word
    /// for dynamic packets.
    pub fn new(data: &'a [u8]) -> Result<Self, DecodeError> {
        let id = *data.first().ok_or(DecodeError::Malformed {
            id: 0,
            offset: 0,
            needed: 1,
            len: 0,
        })?;
        let mut reader = Self { data, pos: 1, id };
        if classify_length(id) == PacketLength::Dynamic {
            reader.skip(2)?;
        }
        Ok(reader)
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::Malformed {
                id: self.id,
                offset: self.pos,
                needed: n,
                len: self.data.len(),
            });
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn skip(&mut self, n: usize) -> Result<(), DecodeError> {
        self.bytes(n).map(|_| ())
    }

    pub fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.bytes(1)?[0])
    }

    pub fn i8(&mut self) -> Result<i8, DecodeError> {
        Ok(self.u8()? as i8)
    }

    pub fn u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn i16(&mut self) -> Result<i16, DecodeError> {
        Ok(self.u16()? as i16)
    }

    pub fn u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Fixed-width ASCII field, cut at the first NUL.
    pub fn fixed_ascii(&mut self, n: usize) -> Result<String, DecodeError> {
        Ok(ascii_until_nul(self.bytes(n)?))
    }

    /// NUL-terminated ASCII running to the end of the packet at most.
    pub fn ascii_cstring(&mut self) -> String {
        let rest = &self.data[self.pos..];
        let end = rest.iter().position(|b| *b == 0).map(|i| i + 1).unwrap_or(rest.len());
        self.pos += end;
        ascii_until_nul(&rest[..end])
    }

    /// NUL-terminated UTF-16BE running to the end of the packet at most.
    pub fn unicode_cstring(&mut self) -> String {
        let mut units = Vec::new();
        while self.remaining() >= 2 {
            let unit = u16::from_be_bytes([self.data[self.pos], self.data[self.pos + 1]]);
            self.pos += 2;
            if unit == 0 {
                break;
            }
            units.push(unit);
        }
        String::from_utf16_lossy(&units)
    }
}

fn ascii_until_nul(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    bytes[..end].iter().map(|b| *b as char).collect()
}

/// Writes `s` into exactly `len` bytes, truncated or NUL-padded.
pub fn put_fixed_ascii(buf: &mut BytesMut, s: &str, len: usize) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(len);
    buf.put_slice(&bytes[..n]);
    buf.put_bytes(0, len - n);
}

pub fn put_ascii_cstring(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

pub fn put_unicode_cstring(buf: &mut BytesMut, s: &str) {
    for unit in s.encode_utf16() {
        buf.put_u16(unit);
    }
    buf.put_u16(0);
}

/// Starts a length-prefixed packet. Returns the offset to pass to
/// [`end_dynamic`].
pub fn begin_dynamic(buf: &mut BytesMut, id: u8) -> usize {
    let start = buf.len();
    buf.put_u8(id);
    buf.put_u16(0);
    start
}

/// Patches the length word of the packet started at `start`.
///
/// A packet too long for the length word is cut back out of `buf` and
/// nothing is sent for it.
pub fn end_dynamic(buf: &mut BytesMut, start: usize) {
    let Ok(len) = u16::try_from(buf.len() - start) else {
        tracing::error!(
            "[protocol] [encode] packet={:#04X} len={} too long, dropped",
            buf[start],
            buf.len() - start
        );
        buf.truncate(start);
        return;
    };
    buf[start + 1..start + 3].copy_from_slice(&len.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_length_is_stable() {
        for id in 0..=255u8 {
            assert_eq!(classify_length(id), classify_length(id));
        }
        assert_eq!(classify_length(0x80), PacketLength::Fixed(62));
        assert_eq!(classify_length(0x91), PacketLength::Fixed(65));
        assert_eq!(classify_length(0xAD), PacketLength::Dynamic);
        assert_eq!(classify_length(0xFF), PacketLength::Invalid);
    }

    #[test]
    fn test_reader_reports_malformed_offset() {
        let data = [0x06, 0x00, 0x00];
        let mut r = PacketReader::new(&data).unwrap();
        assert_eq!(
            r.u32(),
            Err(DecodeError::Malformed { id: 0x06, offset: 1, needed: 4, len: 3 })
        );
    }

    #[test]
    fn test_reader_skips_dynamic_header() {
        let data = [0xBD, 0x00, 0x07, b'7', b'.', b'0', 0x00];
        let mut r = PacketReader::new(&data).unwrap();
        assert_eq!(r.position(), 3);
        assert_eq!(r.ascii_cstring(), "7.0");
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn test_fixed_ascii_roundtrip() {
        let mut buf = BytesMut::new();
        put_fixed_ascii(&mut buf, "alice", 30);
        assert_eq!(buf.len(), 30);
        let mut framed = vec![0x09];
        framed.extend_from_slice(&buf);
        let mut r = PacketReader::new(&framed).unwrap();
        assert_eq!(r.fixed_ascii(30).unwrap(), "alice");
    }

    #[test]
    fn test_dynamic_length_patch() {
        let mut buf = BytesMut::new();
        buf.put_u8(0xAA);
        let start = begin_dynamic(&mut buf, 0xBD);
        put_ascii_cstring(&mut buf, "1.2");
        end_dynamic(&mut buf, start);
        assert_eq!(&buf[1..4], &[0xBD, 0x00, 0x07]);
    }
}
