//! Client -> server packets.

use bytes::{BufMut, BytesMut};

use super::{
    begin_dynamic, end_dynamic, put_ascii_cstring, put_fixed_ascii, put_unicode_cstring,
    DecodeError, PacketReader,
};
use crate::game::{Location, Serial};

/// Double-click flag asking for the paperdoll instead of "use".
pub const PAPERDOLL_FLAG: u32 = 0x8000_0000;

/// Targeting cursor packet (0x6C), shared by both directions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetPacket {
    /// 0 = object, 1 = ground
    pub kind: u8,
    pub cursor_id: u32,
    /// 3 asks the client to cancel the cursor
    pub flags: u8,
    pub serial: Serial,
    pub location: Location,
    pub graphic: u16,
}

impl TargetPacket {
    pub const CANCEL_FLAG: u8 = 3;

    pub fn cursor(kind: u8, cursor_id: u32) -> Self {
        Self {
            kind,
            cursor_id,
            flags: 0,
            serial: Serial::NONE,
            location: Location::default(),
            graphic: 0,
        }
    }

    pub fn cancel(cursor_id: u32) -> Self {
        Self {
            flags: Self::CANCEL_FLAG,
            ..Self::cursor(0, cursor_id)
        }
    }

    /// The location a client reports when the player pressed escape.
    pub fn is_cancel(&self) -> bool {
        self.location.x == -1 && self.location.y == -1
    }

    fn decode(r: &mut PacketReader<'_>) -> Result<Self, DecodeError> {
        let kind = r.u8()?;
        let cursor_id = r.u32()?;
        let flags = r.u8()?;
        let serial = Serial(r.u32()?);
        let x = r.i16()?;
        let y = r.i16()?;
        r.skip(1)?;
        let z = r.i8()?;
        let graphic = r.u16()?;
        Ok(Self {
            kind,
            cursor_id,
            flags,
            serial,
            location: Location::new(x, y, z),
            graphic,
        })
    }

    pub(crate) fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(0x6C);
        buf.put_u8(self.kind);
        buf.put_u32(self.cursor_id);
        buf.put_u8(self.flags);
        buf.put_u32(self.serial.0);
        buf.put_i16(self.location.x);
        buf.put_i16(self.location.y);
        buf.put_u8(0);
        buf.put_i8(self.location.z);
        buf.put_u16(self.graphic);
    }
}

/// Reply to a gump (0xB1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GumpResponse {
    pub serial: Serial,
    pub type_id: u32,
    pub button: u32,
    pub switches: Vec<u32>,
    pub texts: Vec<(u16, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientPacket {
    Disconnect,
    Walk { direction: u8, sequence: u8, key: u32 },
    AsciiSpeech { mode: u8, hue: u16, font: u16, text: String },
    DoubleClick { serial: Serial, paperdoll: bool },
    Lift { serial: Serial, amount: u16 },
    Drop { serial: Serial, location: Location, grid: u8, container: Serial },
    SingleClick { serial: Serial },
    Wear { serial: Serial, layer: u8, mobile: Serial },
    StatusRequest { kind: u8, serial: Serial },
    PlayCharacter { name: String, slot: u32, client_ip: u32 },
    Target(TargetPacket),
    WarMode { war: bool },
    Ping { sequence: u8 },
    AccountLogin { username: String, password: String, key: u8 },
    GameLogin { key: u32, username: String, password: String },
    SelectServer { index: u16 },
    UnicodeSpeech {
        mode: u8,
        hue: u16,
        font: u16,
        language: String,
        keywords: Vec<u16>,
        text: String,
    },
    GumpResponse(GumpResponse),
    ClientVersion { version: String },
    GeneralInfo { subcommand: u16, data: Vec<u8> },
    PropertyRequest { serials: Vec<Serial> },
}

/// Speech-mode bits marking an encoded keyword list.
const KEYWORD_FLAG: u8 = 0xC0;

impl ClientPacket {
    pub fn id(&self) -> u8 {
        match self {
            ClientPacket::Disconnect => 0x01,
            ClientPacket::Walk { .. } => 0x02,
            ClientPacket::AsciiSpeech { .. } => 0x03,
            ClientPacket::DoubleClick { .. } => 0x06,
            ClientPacket::Lift { .. } => 0x07,
            ClientPacket::Drop { .. } => 0x08,
            ClientPacket::SingleClick { .. } => 0x09,
            ClientPacket::Wear { .. } => 0x13,
            ClientPacket::StatusRequest { .. } => 0x34,
            ClientPacket::PlayCharacter { .. } => 0x5D,
            ClientPacket::Target(_) => 0x6C,
            ClientPacket::WarMode { .. } => 0x72,
            ClientPacket::Ping { .. } => 0x73,
            ClientPacket::AccountLogin { .. } => 0x80,
            ClientPacket::GameLogin { .. } => 0x91,
            ClientPacket::SelectServer { .. } => 0xA0,
            ClientPacket::UnicodeSpeech { .. } => 0xAD,
            ClientPacket::GumpResponse(_) => 0xB1,
            ClientPacket::ClientVersion { .. } => 0xBD,
            ClientPacket::GeneralInfo { .. } => 0xBF,
            ClientPacket::PropertyRequest { .. } => 0xD6,
        }
    }

    /// Decodes one framed packet.
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let mut r = PacketReader::new(data)?;
        let packet = match r.id() {
            0x01 => {
                r.skip(4)?;
                ClientPacket::Disconnect
            }
            0x02 => ClientPacket::Walk {
                direction: r.u8()?,
                sequence: r.u8()?,
                key: r.u32()?,
            },
            0x03 => ClientPacket::AsciiSpeech {
                mode: r.u8()?,
                hue: r.u16()?,
                font: r.u16()?,
                text: r.ascii_cstring(),
            },
            0x06 => {
                let raw = r.u32()?;
                ClientPacket::DoubleClick {
                    serial: Serial(raw & !PAPERDOLL_FLAG),
                    paperdoll: raw & PAPERDOLL_FLAG != 0,
                }
            }
            0x07 => ClientPacket::Lift {
                serial: Serial(r.u32()?),
                amount: r.u16()?,
            },
            0x08 => {
                let serial = Serial(r.u32()?);
                let x = r.i16()?;
                let y = r.i16()?;
                let z = r.i8()?;
                ClientPacket::Drop {
                    serial,
                    location: Location::new(x, y, z),
                    grid: r.u8()?,
                    container: Serial(r.u32()?),
                }
            }
            0x09 => ClientPacket::SingleClick { serial: Serial(r.u32()?) },
            0x13 => ClientPacket::Wear {
                serial: Serial(r.u32()?),
                layer: r.u8()?,
                mobile: Serial(r.u32()?),
            },
            0x34 => {
                r.skip(4)?;
                ClientPacket::StatusRequest {
                    kind: r.u8()?,
                    serial: Serial(r.u32()?),
                }
            }
            0x5D => {
                r.skip(4)?;
                let name = r.fixed_ascii(30)?;
                r.skip(2 + 4 + 24)?;
                ClientPacket::PlayCharacter {
                    name,
                    slot: r.u32()?,
                    client_ip: r.u32()?,
                }
            }
            0x6C => ClientPacket::Target(TargetPacket::decode(&mut r)?),
            0x72 => {
                let war = r.u8()? != 0;
                r.skip(3)?;
                ClientPacket::WarMode { war }
            }
            0x73 => ClientPacket::Ping { sequence: r.u8()? },
            0x80 => ClientPacket::AccountLogin {
                username: r.fixed_ascii(30)?,
                password: r.fixed_ascii(30)?,
                key: r.u8()?,
            },
            0x91 => ClientPacket::GameLogin {
                key: r.u32()?,
                username: r.fixed_ascii(30)?,
                password: r.fixed_ascii(30)?,
            },
            0xA0 => ClientPacket::SelectServer { index: r.u16()? },
            0xAD => decode_unicode_speech(&mut r)?,
            0xB1 => decode_gump_response(&mut r)?,
            0xBD => ClientPacket::ClientVersion { version: r.ascii_cstring() },
            0xBF => {
                let subcommand = r.u16()?;
                let data = r.bytes(r.remaining())?.to_vec();
                ClientPacket::GeneralInfo { subcommand, data }
            }
            0xD6 => {
                let mut serials = Vec::with_capacity(r.remaining() / 4);
                while r.remaining() >= 4 {
                    serials.push(Serial(r.u32()?));
                }
                ClientPacket::PropertyRequest { serials }
            }
            id => return Err(DecodeError::Unsupported(id)),
        };
        Ok(packet)
    }

    /// Appends the wire form; what a client would send.
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            ClientPacket::Disconnect => {
                buf.put_u8(0x01);
                buf.put_u32(0xFFFF_FFFF);
            }
            ClientPacket::Walk { direction, sequence, key } => {
                buf.put_u8(0x02);
                buf.put_u8(*direction);
                buf.put_u8(*sequence);
                buf.put_u32(*key);
            }
            ClientPacket::AsciiSpeech { mode, hue, font, text } => {
                let start = begin_dynamic(buf, 0x03);
                buf.put_u8(*mode);
                buf.put_u16(*hue);
                buf.put_u16(*font);
                put_ascii_cstring(buf, text);
                end_dynamic(buf, start);
            }
            ClientPacket::DoubleClick { serial, paperdoll } => {
                buf.put_u8(0x06);
                buf.put_u32(serial.0 | if *paperdoll { PAPERDOLL_FLAG } else { 0 });
            }
            ClientPacket::Lift { serial, amount } => {
                buf.put_u8(0x07);
                buf.put_u32(serial.0);
                buf.put_u16(*amount);
            }
            ClientPacket::Drop { serial, location, grid, container } => {
                buf.put_u8(0x08);
                buf.put_u32(serial.0);
                buf.put_i16(location.x);
                buf.put_i16(location.y);
                buf.put_i8(location.z);
                buf.put_u8(*grid);
                buf.put_u32(container.0);
            }
            ClientPacket::SingleClick { serial } => {
                buf.put_u8(0x09);
                buf.put_u32(serial.0);
            }
            ClientPacket::Wear { serial, layer, mobile } => {
                buf.put_u8(0x13);
                buf.put_u32(serial.0);
                buf.put_u8(*layer);
                buf.put_u32(mobile.0);
            }
            ClientPacket::StatusRequest { kind, serial } => {
                buf.put_u8(0x34);
                buf.put_u32(0xEDED_EDED);
                buf.put_u8(*kind);
                buf.put_u32(serial.0);
            }
            ClientPacket::PlayCharacter { name, slot, client_ip } => {
                buf.put_u8(0x5D);
                buf.put_u32(0xEDED_EDED);
                put_fixed_ascii(buf, name, 30);
                buf.put_bytes(0, 2 + 4 + 24);
                buf.put_u32(*slot);
                buf.put_u32(*client_ip);
            }
            ClientPacket::Target(t) => t.encode(buf),
            ClientPacket::WarMode { war } => {
                buf.put_u8(0x72);
                buf.put_u8(*war as u8);
                buf.put_slice(&[0x00, 0x32, 0x00]);
            }
            ClientPacket::Ping { sequence } => {
                buf.put_u8(0x73);
                buf.put_u8(*sequence);
            }
            ClientPacket::AccountLogin { username, password, key } => {
                buf.put_u8(0x80);
                put_fixed_ascii(buf, username, 30);
                put_fixed_ascii(buf, password, 30);
                buf.put_u8(*key);
            }
            ClientPacket::GameLogin { key, username, password } => {
                buf.put_u8(0x91);
                buf.put_u32(*key);
                put_fixed_ascii(buf, username, 30);
                put_fixed_ascii(buf, password, 30);
            }
            ClientPacket::SelectServer { index } => {
                buf.put_u8(0xA0);
                buf.put_u16(*index);
            }
            ClientPacket::UnicodeSpeech { mode, hue, font, language, keywords, text } => {
                let start = begin_dynamic(buf, 0xAD);
                let encoded = !keywords.is_empty();
                buf.put_u8(if encoded { *mode | KEYWORD_FLAG } else { *mode });
                buf.put_u16(*hue);
                buf.put_u16(*font);
                put_fixed_ascii(buf, language, 4);
                if encoded {
                    put_keywords(buf, keywords);
                    put_ascii_cstring(buf, text);
                } else {
                    put_unicode_cstring(buf, text);
                }
                end_dynamic(buf, start);
            }
            ClientPacket::GumpResponse(g) => {
                let start = begin_dynamic(buf, 0xB1);
                buf.put_u32(g.serial.0);
                buf.put_u32(g.type_id);
                buf.put_u32(g.button);
                buf.put_u32(g.switches.len() as u32);
                for s in &g.switches {
                    buf.put_u32(*s);
                }
                buf.put_u32(g.texts.len() as u32);
                for (id, text) in &g.texts {
                    let units: Vec<u16> = text.encode_utf16().collect();
                    buf.put_u16(*id);
                    buf.put_u16(units.len() as u16);
                    for u in units {
                        buf.put_u16(u);
                    }
                }
                end_dynamic(buf, start);
            }
            ClientPacket::ClientVersion { version } => {
                let start = begin_dynamic(buf, 0xBD);
                put_ascii_cstring(buf, version);
                end_dynamic(buf, start);
            }
            ClientPacket::GeneralInfo { subcommand, data } => {
                let start = begin_dynamic(buf, 0xBF);
                buf.put_u16(*subcommand);
                buf.put_slice(data);
                end_dynamic(buf, start);
            }
            ClientPacket::PropertyRequest { serials } => {
                let start = begin_dynamic(buf, 0xD6);
                for s in serials {
                    buf.put_u32(s.0);
                }
                end_dynamic(buf, start);
            }
        }
    }
}

fn decode_unicode_speech(r: &mut PacketReader<'_>) -> Result<ClientPacket, DecodeError> {
    let raw_mode = r.u8()?;
    let hue = r.u16()?;
    let font = r.u16()?;
    let language = r.fixed_ascii(4)?;

    if raw_mode & KEYWORD_FLAG == 0 {
        return Ok(ClientPacket::UnicodeSpeech {
            mode: raw_mode,
            hue,
            font,
            language,
            keywords: Vec::new(),
            text: r.unicode_cstring(),
        });
    }

    // 12-bit count followed by 12-bit keyword ids, packed big-endian
    let head = r.bytes(2)?;
    let count = ((head[0] as usize) << 4) | (head[1] as usize >> 4);
    let total_bytes = (12 * (count + 1)).div_ceil(8);
    let rest = r.bytes(total_bytes.saturating_sub(2))?;

    let mut bits: Vec<u8> = Vec::with_capacity(total_bytes);
    bits.extend_from_slice(head);
    bits.extend_from_slice(rest);
    let keywords = (0..count).map(|i| read_u12(&bits, 12 * (i + 1))).collect();

    Ok(ClientPacket::UnicodeSpeech {
        mode: raw_mode & !KEYWORD_FLAG,
        hue,
        font,
        language,
        keywords,
        text: r.ascii_cstring(),
    })
}

fn read_u12(bytes: &[u8], bit_offset: usize) -> u16 {
    let mut value = 0u16;
    for i in 0..12 {
        let bit = bit_offset + i;
        let b = bytes.get(bit / 8).copied().unwrap_or(0);
        value = (value << 1) | ((b >> (7 - bit % 8)) & 1) as u16;
    }
    value
}

fn put_keywords(buf: &mut BytesMut, keywords: &[u16]) {
    let values: Vec<u16> = std::iter::once(keywords.len() as u16)
        .chain(keywords.iter().copied())
        .collect();
    let mut acc: u32 = 0;
    let mut acc_bits = 0;
    for v in values {
        acc = (acc << 12) | (v & 0x0FFF) as u32;
        acc_bits += 12;
        while acc_bits >= 8 {
            acc_bits -= 8;
            buf.put_u8((acc >> acc_bits) as u8);
        }
        acc &= (1 << acc_bits) - 1;
    }
    if acc_bits > 0 {
        buf.put_u8((acc << (8 - acc_bits)) as u8);
    }
}

fn decode_gump_response(r: &mut PacketReader<'_>) -> Result<ClientPacket, DecodeError> {
    let serial = Serial(r.u32()?);
    let type_id = r.u32()?;
    let button = r.u32()?;

    let switch_count = r.u32()? as usize;
    if switch_count > r.remaining() / 4 {
        return Err(DecodeError::Malformed {
            id: 0xB1,
            offset: r.position(),
            needed: switch_count * 4,
            len: r.position() + r.remaining(),
        });
    }
    let mut switches = Vec::with_capacity(switch_count);
    for _ in 0..switch_count {
        switches.push(r.u32()?);
    }

    let mut texts = Vec::new();
    if r.remaining() >= 4 {
        let text_count = r.u32()? as usize;
        for _ in 0..text_count {
            let id = r.u16()?;
            let len = r.u16()? as usize;
            let raw = r.bytes(len * 2)?;
            let units: Vec<u16> = raw
                .chunks_exact(2)
                .map(|c| u16::from_be_bytes([c[0], c[1]]))
                .collect();
            texts.push((id, String::from_utf16_lossy(&units)));
        }
    }

    Ok(ClientPacket::GumpResponse(GumpResponse {
        serial,
        type_id,
        button,
        switches,
        texts,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{classify_length, PacketLength};

    fn roundtrip(p: ClientPacket) {
        let mut buf = BytesMut::new();
        p.encode(&mut buf);
        match classify_length(p.id()) {
            PacketLength::Fixed(n) => assert_eq!(buf.len(), n, "length of {:#04X}", p.id()),
            PacketLength::Dynamic => {
                assert_eq!(u16::from_be_bytes([buf[1], buf[2]]) as usize, buf.len())
            }
            PacketLength::Invalid => panic!("invalid id {:#04X}", p.id()),
        }
        assert_eq!(ClientPacket::decode(&buf).unwrap(), p);
    }

    #[test]
    fn test_login_packets() {
        roundtrip(ClientPacket::AccountLogin {
            username: "alice".into(),
            password: "pw1".into(),
            key: 0x5D,
        });
        roundtrip(ClientPacket::GameLogin {
            key: 0xDEAD_BEEF,
            username: "alice".into(),
            password: "pw1".into(),
        });
        roundtrip(ClientPacket::SelectServer { index: 0 });
        roundtrip(ClientPacket::PlayCharacter {
            name: "alice".into(),
            slot: 0,
            client_ip: 0x7F00_0001,
        });
    }

    #[test]
    fn test_game_packets() {
        roundtrip(ClientPacket::Walk { direction: 0x82, sequence: 7, key: 0 });
        roundtrip(ClientPacket::DoubleClick { serial: Serial(1), paperdoll: true });
        roundtrip(ClientPacket::Lift { serial: Serial(0x4000_0002), amount: 10 });
        roundtrip(ClientPacket::Drop {
            serial: Serial(0x4000_0002),
            location: Location::new(-1, -1, 0),
            grid: 0,
            container: Serial(0x4000_0001),
        });
        roundtrip(ClientPacket::Wear {
            serial: Serial(0x4000_0003),
            layer: 0x05,
            mobile: Serial(1),
        });
        roundtrip(ClientPacket::StatusRequest { kind: 4, serial: Serial(1) });
        roundtrip(ClientPacket::WarMode { war: true });
        roundtrip(ClientPacket::Ping { sequence: 9 });
        roundtrip(ClientPacket::Target(TargetPacket {
            kind: 1,
            cursor_id: 3,
            flags: 0,
            serial: Serial::NONE,
            location: Location::new(100, 200, -5),
            graphic: 0x0190,
        }));
        roundtrip(ClientPacket::PropertyRequest {
            serials: vec![Serial(1), Serial(0x4000_0001)],
        });
    }

    #[test]
    fn test_speech_packets() {
        roundtrip(ClientPacket::AsciiSpeech {
            mode: 0,
            hue: 0x34,
            font: 3,
            text: "hello".into(),
        });
        roundtrip(ClientPacket::UnicodeSpeech {
            mode: 0,
            hue: 0x34,
            font: 3,
            language: "ENU".into(),
            keywords: Vec::new(),
            text: "héllo".into(),
        });
        roundtrip(ClientPacket::UnicodeSpeech {
            mode: 0,
            hue: 0x34,
            font: 3,
            language: "ENU".into(),
            keywords: vec![0x10, 0x2A],
            text: "vendor buy".into(),
        });
    }

    #[test]
    fn test_gump_and_info_packets() {
        roundtrip(ClientPacket::GumpResponse(GumpResponse {
            serial: Serial(1),
            type_id: 0x1234,
            button: 2,
            switches: vec![5, 6],
            texts: vec![(1, "name".into())],
        }));
        roundtrip(ClientPacket::ClientVersion { version: "7.0.15.1".into() });
        roundtrip(ClientPacket::GeneralInfo { subcommand: 0x05, data: vec![0, 1, 2] });
    }

    #[test]
    fn test_truncated_packet_is_malformed() {
        let mut buf = BytesMut::new();
        ClientPacket::Lift { serial: Serial(5), amount: 1 }.encode(&mut buf);
        let err = ClientPacket::decode(&buf[..4]).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_unhandled_id_is_unsupported() {
        let data = [0x05, 0, 0, 0, 1];
        assert_eq!(ClientPacket::decode(&data), Err(DecodeError::Unsupported(0x05)));
    }

    #[test]
    fn test_gump_switch_count_overflow_is_malformed() {
        let mut buf = BytesMut::new();
        let start = begin_dynamic(&mut buf, 0xB1);
        buf.put_u32(1);
        buf.put_u32(2);
        buf.put_u32(3);
        buf.put_u32(0xFFFF_FFFF);
        end_dynamic(&mut buf, start);
        assert!(ClientPacket::decode(&buf).unwrap_err().is_fatal());
    }
}
