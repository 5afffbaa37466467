//! Save archive container.
//!
//! Layout, all integers big-endian:
//!
//! ```text
//! "UODS" | u16 version | u32 section count
//! per section: u16 name len | name | u32 crc32(payload) | u32 payload len | payload
//! ```
//!
//! Each payload is a zlib-compressed YAML document.

use std::io::{Read, Write};

use bytes::{Buf, BufMut};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::{Compression, Crc};

use super::SaveError;

pub const MAGIC: &[u8; 4] = b"UODS";
pub const VERSION: u16 = 1;

/// Upper bound on a single decompressed section.
const MAX_SECTION_LEN: usize = 1 << 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    /// Compressed bytes, exactly as stored
    pub payload: Vec<u8>,
}

fn compute_crc32(data: &[u8]) -> u32 {
    let mut crc = Crc::new();
    crc.update(data);
    crc.sum()
}

impl Section {
    /// Compresses `document` under `name`.
    pub fn compress(name: impl Into<String>, document: &[u8]) -> Result<Self, SaveError> {
        let mut encoder = ZlibEncoder::new(Vec::with_capacity(document.len() / 4), Compression::default());
        encoder.write_all(document)?;
        Ok(Self {
            name: name.into(),
            payload: encoder.finish()?,
        })
    }

    pub fn decompress(&self) -> Result<Vec<u8>, SaveError> {
        let mut out = Vec::new();
        ZlibDecoder::new(self.payload.as_slice())
            .take(MAX_SECTION_LEN as u64 + 1)
            .read_to_end(&mut out)
            .map_err(|e| SaveError::Corrupt(format!("section {}: {}", self.name, e)))?;
        if out.len() > MAX_SECTION_LEN {
            return Err(SaveError::Corrupt(format!("section {} is too large", self.name)));
        }
        Ok(out)
    }
}

/// Serializes the whole archive into one buffer.
pub fn encode_archive(sections: &[Section]) -> Vec<u8> {
    let body: usize = sections.iter().map(|s| 10 + s.name.len() + s.payload.len()).sum();
    let mut buf = Vec::with_capacity(10 + body);
    buf.put_slice(MAGIC);
    buf.put_u16(VERSION);
    buf.put_u32(sections.len() as u32);
    for section in sections {
        buf.put_u16(section.name.len() as u16);
        buf.put_slice(section.name.as_bytes());
        buf.put_u32(compute_crc32(&section.payload));
        buf.put_u32(section.payload.len() as u32);
        buf.put_slice(&section.payload);
    }
    buf
}

fn need(buf: &&[u8], n: usize, what: &str) -> Result<(), SaveError> {
    if buf.remaining() < n {
        return Err(SaveError::Corrupt(format!("truncated {}", what)));
    }
    Ok(())
}

/// Parses and checksums every section. Nothing is decompressed yet.
pub fn decode_archive(bytes: &[u8]) -> Result<Vec<Section>, SaveError> {
    let mut buf = bytes;
    need(&buf, 10, "header")?;
    if &buf[..4] != MAGIC {
        return Err(SaveError::Corrupt("bad magic".into()));
    }
    buf.advance(4);
    let version = buf.get_u16();
    if version != VERSION {
        return Err(SaveError::Corrupt(format!("unsupported version {}", version)));
    }
    let count = buf.get_u32() as usize;

    let mut sections = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        need(&buf, 2, "section name")?;
        let name_len = buf.get_u16() as usize;
        need(&buf, name_len, "section name")?;
        let name = std::str::from_utf8(&buf[..name_len])
            .map_err(|_| SaveError::Corrupt("section name is not UTF-8".into()))?
            .to_string();
        buf.advance(name_len);

        need(&buf, 8, "section header")?;
        let crc = buf.get_u32();
        let len = buf.get_u32() as usize;
        need(&buf, len, "section payload")?;
        let payload = buf[..len].to_vec();
        buf.advance(len);

        if compute_crc32(&payload) != crc {
            return Err(SaveError::Corrupt(format!("checksum mismatch in section {}", name)));
        }
        sections.push(Section { name, payload });
    }

    if buf.has_remaining() {
        return Err(SaveError::Corrupt(format!("{} trailing bytes", buf.remaining())));
    }
    Ok(sections)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<Section> {
        vec![
            Section::compress("global", b"now: 12\n").unwrap(),
            Section::compress("objects-000", b"[]\n").unwrap(),
        ]
    }

    #[test]
    fn test_archive_roundtrip() {
        let sections = sample();
        let bytes = encode_archive(&sections);
        assert_eq!(&bytes[..4], MAGIC);

        let decoded = decode_archive(&bytes).unwrap();
        assert_eq!(decoded, sections);
        assert_eq!(decoded[0].decompress().unwrap(), b"now: 12\n");
    }

    #[test]
    fn test_flipped_byte_fails_checksum() {
        let mut bytes = encode_archive(&sample());
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(matches!(decode_archive(&bytes), Err(SaveError::Corrupt(_))));
    }

    #[test]
    fn test_truncated_archive_is_corrupt() {
        let bytes = encode_archive(&sample());
        for cut in [0, 3, 9, bytes.len() / 2, bytes.len() - 1] {
            assert!(
                matches!(decode_archive(&bytes[..cut]), Err(SaveError::Corrupt(_))),
                "cut at {}",
                cut
            );
        }
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = encode_archive(&sample());
        bytes[0] = b'X';
        assert!(matches!(decode_archive(&bytes), Err(SaveError::Corrupt(_))));
    }
}
