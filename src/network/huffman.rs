//! Server-to-client Huffman compression.
//!
//! Once a game session turns compression on, every outbound packet is
//! compressed on its own: each byte is replaced by its code from a fixed
//! table, a terminator code follows, and the output is zero-padded to a
//! byte boundary. Clients never compress, so the decompressor exists for
//! tests and tooling.

use std::sync::OnceLock;

/// Symbol emitted after every packet.
pub const TERMINATOR: usize = 256;

/// `(bit count, code)` for bytes 0..=255 and the terminator.
pub static TABLE: [(u8, u16); 257] = [
    (2, 0x000), (5, 0x01F), (6, 0x022), (7, 0x034), (7, 0x075), (6, 0x028),
    (6, 0x03B), (7, 0x032), (8, 0x0E0), (8, 0x062), (7, 0x056), (8, 0x079),
    (9, 0x19D), (8, 0x097), (6, 0x02A), (7, 0x057), (8, 0x071), (8, 0x05B),
    (9, 0x1CC), (8, 0x0A7), (7, 0x025), (7, 0x04F), (8, 0x066), (8, 0x07D),
    (9, 0x191), (9, 0x1CE), (7, 0x03F), (9, 0x090), (8, 0x059), (8, 0x07B),
    (8, 0x091), (8, 0x0C6), (6, 0x02D), (9, 0x186), (8, 0x06F), (9, 0x093),
    (10, 0x1CC), (8, 0x05A), (10, 0x1AE), (10, 0x1C0), (9, 0x148), (9, 0x14A),
    (9, 0x082), (10, 0x19F), (9, 0x171), (9, 0x120), (9, 0x0E7), (10, 0x1F3),
    (9, 0x14B), (9, 0x100), (9, 0x190), (6, 0x013), (9, 0x161), (9, 0x125),
    (9, 0x133), (9, 0x195), (9, 0x173), (9, 0x1CA), (9, 0x086), (9, 0x1E9),
    (9, 0x0DB), (9, 0x1EC), (9, 0x08B), (9, 0x085), (5, 0x00A), (8, 0x096),
    (8, 0x09C), (9, 0x1C3), (9, 0x19C), (9, 0x08F), (9, 0x18F), (9, 0x091),
    (9, 0x087), (9, 0x0C6), (9, 0x177), (9, 0x089), (9, 0x0D6), (9, 0x08C),
    (9, 0x1EE), (9, 0x1EB), (9, 0x084), (9, 0x164), (9, 0x175), (9, 0x1CD),
    (8, 0x05E), (9, 0x088), (9, 0x12B), (9, 0x172), (9, 0x10A), (9, 0x08D),
    (9, 0x13A), (9, 0x11C), (10, 0x1E1), (10, 0x1E0), (9, 0x187), (10, 0x1DC),
    (10, 0x1DF), (7, 0x074), (9, 0x19F), (8, 0x08D), (8, 0x0E4), (7, 0x079),
    (9, 0x0EA), (9, 0x0E1), (8, 0x040), (7, 0x041), (9, 0x10B), (9, 0x0B0),
    (8, 0x06A), (8, 0x0C1), (7, 0x071), (7, 0x078), (8, 0x0B1), (9, 0x14C),
    (7, 0x043), (8, 0x076), (7, 0x066), (7, 0x04D), (9, 0x08A), (6, 0x02F),
    (8, 0x0C9), (9, 0x0CE), (9, 0x149), (9, 0x160), (10, 0x1BA), (10, 0x19E),
    (10, 0x39F), (9, 0x0E5), (9, 0x194), (9, 0x184), (9, 0x126), (7, 0x030),
    (8, 0x06C), (9, 0x121), (9, 0x1E8), (10, 0x1C1), (10, 0x11D), (10, 0x163),
    (10, 0x385), (10, 0x3DB), (10, 0x17D), (10, 0x106), (10, 0x397), (10, 0x24E),
    (7, 0x02E), (8, 0x098), (10, 0x33C), (10, 0x32E), (10, 0x1E9), (9, 0x0BF),
    (10, 0x3DF), (10, 0x1DD), (10, 0x32D), (10, 0x2ED), (10, 0x30B), (10, 0x107),
    (10, 0x2E8), (10, 0x3DE), (10, 0x125), (10, 0x1E8), (9, 0x0E9), (10, 0x1CD),
    (10, 0x1B5), (9, 0x165), (10, 0x232), (10, 0x2E1), (11, 0x3AE), (11, 0x3C6),
    (11, 0x3E2), (10, 0x205), (10, 0x29A), (10, 0x248), (10, 0x2CD), (10, 0x23B),
    (11, 0x3C5), (10, 0x251), (10, 0x2E9), (10, 0x252), (9, 0x1EA), (11, 0x3A0),
    (11, 0x391), (10, 0x23C), (11, 0x392), (11, 0x3D5), (10, 0x233), (10, 0x2CC),
    (11, 0x390), (10, 0x1BB), (11, 0x3A1), (11, 0x3C4), (10, 0x211), (10, 0x203),
    (9, 0x12A), (10, 0x231), (11, 0x3E0), (10, 0x29B), (11, 0x3D7), (10, 0x202),
    (11, 0x3AD), (10, 0x213), (10, 0x253), (10, 0x32C), (10, 0x23D), (10, 0x23F),
    (10, 0x32F), (10, 0x11C), (10, 0x384), (10, 0x31C), (10, 0x17C), (10, 0x30A),
    (10, 0x2E0), (10, 0x276), (10, 0x250), (11, 0x3E3), (10, 0x396), (10, 0x18F),
    (10, 0x204), (10, 0x206), (10, 0x230), (10, 0x265), (10, 0x212), (10, 0x23E),
    (11, 0x3AC), (11, 0x393), (11, 0x3E1), (10, 0x1DE), (11, 0x3D6), (10, 0x31D),
    (11, 0x3E5), (11, 0x3E4), (10, 0x207), (11, 0x3C7), (10, 0x277), (11, 0x3D4),
    (8, 0x0C0), (10, 0x162), (10, 0x3DA), (10, 0x124), (10, 0x1B4), (10, 0x264),
    (10, 0x33D), (10, 0x1D1), (10, 0x1AF), (10, 0x39E), (10, 0x24F), (11, 0x373),
    (10, 0x249), (11, 0x372), (9, 0x167), (10, 0x210), (10, 0x23A), (10, 0x1B8),
    (11, 0x3AF), (10, 0x18E), (10, 0x2EC), (7, 0x062), (4, 0x00D),
];

/// Worst-case compressed size of `len` input bytes.
pub fn max_compressed_len(len: usize) -> usize {
    (len * 11 + 4 + 7) / 8
}

/// Appends the compressed form of `src` to `dst`.
pub fn compress_into(src: &[u8], dst: &mut Vec<u8>) {
    dst.reserve(max_compressed_len(src.len()));

    let mut acc: u32 = 0;
    let mut acc_bits: u32 = 0;
    let mut push = |bits: u8, code: u16, dst: &mut Vec<u8>| {
        acc = (acc << bits) | code as u32;
        acc_bits += bits as u32;
        while acc_bits >= 8 {
            acc_bits -= 8;
            dst.push((acc >> acc_bits) as u8);
        }
        acc &= (1 << acc_bits) - 1;
    };

    for b in src {
        let (bits, code) = TABLE[*b as usize];
        push(bits, code, dst);
    }
    let (bits, code) = TABLE[TERMINATOR];
    push(bits, code, dst);

    if acc_bits > 0 {
        dst.push((acc << (8 - acc_bits)) as u8);
    }
}

pub fn compress(src: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    compress_into(src, &mut out);
    out
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HuffmanError {
    #[error("Compressed data ended before the terminator")]
    Incomplete,
}

/// Decoding tree: internal nodes hold child indices, leaves are stored as
/// `-(symbol + 1)`.
fn tree() -> &'static [[i32; 2]] {
    static TREE: OnceLock<Vec<[i32; 2]>> = OnceLock::new();
    TREE.get_or_init(|| {
        let mut nodes: Vec<[i32; 2]> = vec![[0, 0]];
        for (symbol, (bits, code)) in TABLE.iter().enumerate() {
            let mut node = 0usize;
            for i in (0..*bits).rev() {
                let bit = ((code >> i) & 1) as usize;
                if i == 0 {
                    nodes[node][bit] = -(symbol as i32 + 1);
                } else {
                    if nodes[node][bit] <= 0 {
                        nodes.push([0, 0]);
                        nodes[node][bit] = (nodes.len() - 1) as i32;
                    }
                    node = nodes[node][bit] as usize;
                }
            }
        }
        nodes
    })
}

/// Decompresses one packet from the front of `src` into `out`.
///
/// Returns the number of input bytes consumed, including the padded tail
/// byte that holds the terminator.
pub fn decompress(src: &[u8], out: &mut Vec<u8>) -> Result<usize, HuffmanError> {
    let tree = tree();
    let mut node = 0usize;
    for (index, byte) in src.iter().enumerate() {
        for shift in (0..8).rev() {
            let bit = ((byte >> shift) & 1) as usize;
            let next = tree[node][bit];
            if next < 0 {
                let symbol = (-next - 1) as usize;
                if symbol == TERMINATOR {
                    return Ok(index + 1);
                }
                out.push(symbol as u8);
                node = 0;
            } else {
                node = next as usize;
            }
        }
    }
    Err(HuffmanError::Incomplete)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_outputs() {
        assert_eq!(compress(&[]), vec![0xD0]);
        assert_eq!(compress(&[0x00]), vec![0x34]);
        assert_eq!(compress(&[0xA9, 0x00, 0x05]), vec![0x81, 0x4A, 0x34]);
    }

    #[test]
    fn test_roundtrip_all_bytes() {
        let src: Vec<u8> = (0..=255u8).chain((0..=255u8).rev()).collect();
        let packed = compress(&src);
        let mut out = Vec::new();
        let used = decompress(&packed, &mut out).unwrap();
        assert_eq!(out, src);
        assert_eq!(used, packed.len());
        assert!(packed.len() <= max_compressed_len(src.len()));
    }

    #[test]
    fn test_consecutive_packets_decode_separately() {
        let mut stream = Vec::new();
        compress_into(b"first", &mut stream);
        compress_into(b"second", &mut stream);

        let mut a = Vec::new();
        let used = decompress(&stream, &mut a).unwrap();
        let mut b = Vec::new();
        decompress(&stream[used..], &mut b).unwrap();
        assert_eq!(a, b"first");
        assert_eq!(b, b"second");
    }

    #[test]
    fn test_truncated_input() {
        let packed = compress(b"truncated packet");
        let mut out = Vec::new();
        assert_eq!(
            decompress(&packed[..packed.len() - 2], &mut out),
            Err(HuffmanError::Incomplete)
        );
    }
}
