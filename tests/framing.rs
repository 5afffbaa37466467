//! Property tests for the inbound framer and the outbound compressor.

use bytes::BytesMut;
use proptest::prelude::*;

use uod::game::{Location, Serial};
use uod::network::{huffman, Framer, PREAMBLE_LEN};
use uod::protocol::ClientPacket;

fn stream() -> (Vec<u8>, Vec<ClientPacket>) {
    let packets = vec![
        ClientPacket::Walk { direction: 2, sequence: 1, key: 0 },
        ClientPacket::AsciiSpeech { mode: 0, hue: 0x34, font: 3, text: "hail".into() },
        ClientPacket::DoubleClick { serial: Serial(0x4000_0001), paperdoll: false },
        ClientPacket::Lift { serial: Serial(0x4000_0002), amount: 5 },
        ClientPacket::Drop {
            serial: Serial(0x4000_0002),
            location: Location::new(10, 20, 0),
            grid: 0,
            container: Serial(0xFFFF_FFFF),
        },
        ClientPacket::PropertyRequest { serials: vec![Serial(1), Serial(0x4000_0003)] },
        ClientPacket::Ping { sequence: 9 },
    ];
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&[0xC0, 0xA8, 0x00, 0x01]);
    for p in &packets {
        p.encode(&mut buf);
    }
    (buf.to_vec(), packets)
}

proptest! {
    /// Property: read boundaries never change what gets framed
    #[test]
    fn any_chunking_yields_the_same_packets(
        cuts in prop::collection::vec(1usize..64, 1..40),
    ) {
        let (bytes, expected) = stream();
        let mut framer = Framer::with_preamble(PREAMBLE_LEN);
        let mut decoded = Vec::new();
        let mut offset = 0;
        let mut cut = cuts.iter().cycle();
        while offset < bytes.len() {
            let n = (*cut.next().unwrap()).min(bytes.len() - offset);
            framer.extend(&bytes[offset..offset + n]);
            offset += n;
            while let Some(raw) = framer.next_packet().unwrap() {
                decoded.push(ClientPacket::decode(&raw).unwrap());
            }
        }
        prop_assert_eq!(decoded, expected);
        prop_assert_eq!(framer.buffered(), 0);
    }

    /// Property: arbitrary input never panics the framer or decoder
    #[test]
    fn arbitrary_bytes_dont_crash_framer(
        random_bytes in prop::collection::vec(any::<u8>(), 0..2000),
    ) {
        let mut framer = Framer::new();
        framer.extend(&random_bytes);
        while let Ok(Some(raw)) = framer.next_packet() {
            let _ = ClientPacket::decode(&raw);
        }
    }

    /// Property: compressed packets decompress back one at a time
    #[test]
    fn huffman_stream_roundtrips(
        packets in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..300), 1..8),
    ) {
        let mut wire = Vec::new();
        for p in &packets {
            huffman::compress_into(p, &mut wire);
        }
        let mut offset = 0;
        for p in &packets {
            let mut out = Vec::new();
            offset += huffman::decompress(&wire[offset..], &mut out).unwrap();
            prop_assert_eq!(&out, p);
        }
        prop_assert_eq!(offset, wire.len());
    }
}
