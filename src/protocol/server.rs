//! Server -> client packets.
//!
//! Only `encode` is needed on the live path. `decode` covers the packets a
//! test client has to inspect.

use std::net::Ipv4Addr;

use bytes::{BufMut, BytesMut};

use super::{
    begin_dynamic, end_dynamic, put_ascii_cstring, put_fixed_ascii, DecodeError, PacketReader,
    TargetPacket,
};
use crate::game::{Direction, Location, Serial};

/// Most entries one 0x3C packet can carry under the u16 length word.
pub const MAX_CONTAINER_ENTRIES: usize = (u16::MAX as usize - 5) / ContainerEntry::ENCODED_LEN;

/// Cliloc used for free-form property lines.
pub const CLILOC_PLAIN: u32 = 1_042_971;

/// 0x82 reasons.
pub mod deny {
    pub const BAD_CREDENTIALS: u8 = 0x00;
    pub const IN_USE: u8 = 0x01;
    pub const BLOCKED: u8 = 0x02;
    pub const BAD_PASSWORD: u8 = 0x03;
    pub const COMMUNICATION: u8 = 0x04;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEntry {
    pub index: u16,
    pub name: String,
    pub percent_full: u8,
    pub timezone: u8,
    pub address: Ipv4Addr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacterEntry {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartingCity {
    pub name: String,
    pub building: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EquipmentEntry {
    pub serial: Serial,
    pub graphic: u16,
    pub layer: u8,
    pub hue: u16,
}

/// One item as shown inside an open container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerEntry {
    pub serial: Serial,
    pub graphic: u16,
    pub amount: u16,
    pub x: i16,
    pub y: i16,
    pub grid: u8,
    pub container: Serial,
    pub hue: u16,
}

impl ContainerEntry {
    pub const ENCODED_LEN: usize = 20;

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.serial.0);
        buf.put_u16(self.graphic);
        buf.put_u8(0);
        buf.put_u16(self.amount);
        buf.put_i16(self.x);
        buf.put_i16(self.y);
        buf.put_u8(self.grid);
        buf.put_u32(self.container.0);
        buf.put_u16(self.hue);
    }

    fn decode(r: &mut PacketReader<'_>) -> Result<Self, DecodeError> {
        let serial = Serial(r.u32()?);
        let graphic = r.u16()?;
        r.skip(1)?;
        Ok(Self {
            serial,
            graphic,
            amount: r.u16()?,
            x: r.i16()?,
            y: r.i16()?,
            grid: r.u8()?,
            container: Serial(r.u32()?),
            hue: r.u16()?,
        })
    }
}

/// Extended block of the 0x11 status bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusStats {
    pub female: bool,
    pub strength: u16,
    pub dexterity: u16,
    pub intelligence: u16,
    pub stamina: u16,
    pub max_stamina: u16,
    pub mana: u16,
    pub max_mana: u16,
    pub gold: u32,
    pub armor: u16,
    pub weight: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerPacket {
    LoginDenied { reason: u8 },
    ServerList { servers: Vec<ServerEntry> },
    Connect { address: Ipv4Addr, port: u16, key: u32 },
    CharacterList {
        characters: Vec<CharacterEntry>,
        cities: Vec<StartingCity>,
        flags: u32,
    },
    LoginConfirm {
        serial: Serial,
        body: u16,
        location: Location,
        facing: Direction,
        map_width: u16,
        map_height: u16,
    },
    LoginComplete,
    DrawPlayer {
        serial: Serial,
        body: u16,
        hue: u16,
        flags: u8,
        location: Location,
        facing: Direction,
    },
    DrawObject {
        serial: Serial,
        body: u16,
        location: Location,
        facing: Direction,
        hue: u16,
        flags: u8,
        notoriety: u8,
        equipment: Vec<EquipmentEntry>,
    },
    WorldItem {
        serial: Serial,
        graphic: u16,
        amount: u16,
        location: Location,
        hue: u16,
    },
    WornItem {
        serial: Serial,
        graphic: u16,
        layer: u8,
        mobile: Serial,
        hue: u16,
    },
    ContainerItem(ContainerEntry),
    ContainerContents { items: Vec<ContainerEntry> },
    DrawContainer { serial: Serial, gump: u16 },
    Delete { serial: Serial },
    AsciiMessage {
        serial: Serial,
        graphic: u16,
        mode: u8,
        hue: u16,
        font: u16,
        name: String,
        text: String,
    },
    Target(TargetPacket),
    MoveAck { sequence: u8, notoriety: u8 },
    MoveReject { sequence: u8, location: Location, facing: Direction },
    PickupFailed { reason: u8 },
    WarMode { war: bool },
    Status {
        serial: Serial,
        name: String,
        hits: u16,
        max_hits: u16,
        renamable: bool,
        stats: Option<StatusStats>,
    },
    OplRevision { serial: Serial, hash: u32 },
    OplInfo { serial: Serial, hash: u32, lines: Vec<String> },
    Light { level: u8 },
    Season { season: u8, play_sound: bool },
    Features { flags: u16 },
    Ping { sequence: u8 },
}

impl ServerPacket {
    /// A message from nobody in particular, shown in the journal.
    pub fn system(text: impl Into<String>) -> Self {
        ServerPacket::AsciiMessage {
            serial: Serial(0xFFFF_FFFF),
            graphic: 0xFFFF,
            mode: 0,
            hue: 0x03B2,
            font: 3,
            name: "System".into(),
            text: text.into(),
        }
    }

    pub fn id(&self) -> u8 {
        match self {
            ServerPacket::LoginDenied { .. } => 0x82,
            ServerPacket::ServerList { .. } => 0xA8,
            ServerPacket::Connect { .. } => 0x8C,
            ServerPacket::CharacterList { .. } => 0xA9,
            ServerPacket::LoginConfirm { .. } => 0x1B,
            ServerPacket::LoginComplete => 0x55,
            ServerPacket::DrawPlayer { .. } => 0x20,
            ServerPacket::DrawObject { .. } => 0x78,
            ServerPacket::WorldItem { .. } => 0x1A,
            ServerPacket::WornItem { .. } => 0x2E,
            ServerPacket::ContainerItem(_) => 0x25,
            ServerPacket::ContainerContents { .. } => 0x3C,
            ServerPacket::DrawContainer { .. } => 0x24,
            ServerPacket::Delete { .. } => 0x1D,
            ServerPacket::AsciiMessage { .. } => 0x1C,
            ServerPacket::Target(_) => 0x6C,
            ServerPacket::MoveAck { .. } => 0x22,
            ServerPacket::MoveReject { .. } => 0x21,
            ServerPacket::PickupFailed { .. } => 0x27,
            ServerPacket::WarMode { .. } => 0x72,
            ServerPacket::Status { .. } => 0x11,
            ServerPacket::OplRevision { .. } => 0xDC,
            ServerPacket::OplInfo { .. } => 0xD6,
            ServerPacket::Light { .. } => 0x4F,
            ServerPacket::Season { .. } => 0xBC,
            ServerPacket::Features { .. } => 0xB9,
            ServerPacket::Ping { .. } => 0x73,
        }
    }

    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(64);
        self.encode(&mut buf);
        buf
    }

    /// Appends the wire form to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            ServerPacket::LoginDenied { reason } => {
                buf.put_u8(0x82);
                buf.put_u8(*reason);
            }
            ServerPacket::ServerList { servers } => {
                let start = begin_dynamic(buf, 0xA8);
                buf.put_u8(0x5D);
                buf.put_u16(servers.len() as u16);
                for s in servers {
                    buf.put_u16(s.index);
                    put_fixed_ascii(buf, &s.name, 32);
                    buf.put_u8(s.percent_full);
                    buf.put_u8(s.timezone);
                    // this list carries the address with its octets reversed
                    let o = s.address.octets();
                    buf.put_slice(&[o[3], o[2], o[1], o[0]]);
                }
                end_dynamic(buf, start);
            }
            ServerPacket::Connect { address, port, key } => {
                buf.put_u8(0x8C);
                buf.put_slice(&address.octets());
                buf.put_u16(*port);
                buf.put_u32(*key);
            }
            ServerPacket::CharacterList { characters, cities, flags } => {
                let start = begin_dynamic(buf, 0xA9);
                let slots = characters.len().max(5);
                buf.put_u8(slots as u8);
                for i in 0..slots {
                    let name = characters.get(i).map(|c| c.name.as_str()).unwrap_or("");
                    put_fixed_ascii(buf, name, 30);
                    put_fixed_ascii(buf, "", 30);
                }
                buf.put_u8(cities.len() as u8);
                for (i, city) in cities.iter().enumerate() {
                    buf.put_u8(i as u8);
                    put_fixed_ascii(buf, &city.name, 31);
                    put_fixed_ascii(buf, &city.building, 31);
                }
                buf.put_u32(*flags);
                end_dynamic(buf, start);
            }
            ServerPacket::LoginConfirm {
                serial,
                body,
                location,
                facing,
                map_width,
                map_height,
            } => {
                buf.put_u8(0x1B);
                buf.put_u32(serial.0);
                buf.put_u32(0);
                buf.put_u16(*body);
                buf.put_i16(location.x);
                buf.put_i16(location.y);
                buf.put_i16(location.z as i16);
                buf.put_u8(*facing as u8);
                buf.put_u8(0);
                buf.put_u32(0xFFFF_FFFF);
                buf.put_u16(0);
                buf.put_u16(0);
                buf.put_u16(*map_width);
                buf.put_u16(*map_height);
                buf.put_bytes(0, 6);
            }
            ServerPacket::LoginComplete => buf.put_u8(0x55),
            ServerPacket::DrawPlayer { serial, body, hue, flags, location, facing } => {
                buf.put_u8(0x20);
                buf.put_u32(serial.0);
                buf.put_u16(*body);
                buf.put_u8(0);
                buf.put_u16(*hue);
                buf.put_u8(*flags);
                buf.put_i16(location.x);
                buf.put_i16(location.y);
                buf.put_u16(0);
                buf.put_u8(*facing as u8);
                buf.put_i8(location.z);
            }
            ServerPacket::DrawObject {
                serial,
                body,
                location,
                facing,
                hue,
                flags,
                notoriety,
                equipment,
            } => {
                let start = begin_dynamic(buf, 0x78);
                buf.put_u32(serial.0);
                buf.put_u16(*body);
                buf.put_i16(location.x);
                buf.put_i16(location.y);
                buf.put_i8(location.z);
                buf.put_u8(*facing as u8);
                buf.put_u16(*hue);
                buf.put_u8(*flags);
                buf.put_u8(*notoriety);
                for e in equipment {
                    buf.put_u32(e.serial.0);
                    buf.put_u16(e.graphic | 0x8000);
                    buf.put_u8(e.layer);
                    buf.put_u16(e.hue);
                }
                buf.put_u32(0);
                end_dynamic(buf, start);
            }
            ServerPacket::WorldItem { serial, graphic, amount, location, hue } => {
                let start = begin_dynamic(buf, 0x1A);
                let stacked = *amount > 1;
                buf.put_u32(serial.0 | if stacked { 0x8000_0000 } else { 0 });
                buf.put_u16(*graphic);
                if stacked {
                    buf.put_u16(*amount);
                }
                buf.put_u16(location.x as u16 & 0x7FFF);
                let hued = *hue != 0;
                buf.put_u16((location.y as u16 & 0x3FFF) | if hued { 0x8000 } else { 0 });
                buf.put_i8(location.z);
                if hued {
                    buf.put_u16(*hue);
                }
                end_dynamic(buf, start);
            }
            ServerPacket::WornItem { serial, graphic, layer, mobile, hue } => {
                buf.put_u8(0x2E);
                buf.put_u32(serial.0);
                buf.put_u16(*graphic);
                buf.put_u8(0);
                buf.put_u8(*layer);
                buf.put_u32(mobile.0);
                buf.put_u16(*hue);
            }
            ServerPacket::ContainerItem(entry) => {
                buf.put_u8(0x25);
                entry.encode(buf);
            }
            ServerPacket::ContainerContents { items } => {
                let start = begin_dynamic(buf, 0x3C);
                buf.put_u16(items.len() as u16);
                for entry in items {
                    entry.encode(buf);
                }
                end_dynamic(buf, start);
            }
            ServerPacket::DrawContainer { serial, gump } => {
                buf.put_u8(0x24);
                buf.put_u32(serial.0);
                buf.put_u16(*gump);
            }
            ServerPacket::Delete { serial } => {
                buf.put_u8(0x1D);
                buf.put_u32(serial.0);
            }
            ServerPacket::AsciiMessage { serial, graphic, mode, hue, font, name, text } => {
                let start = begin_dynamic(buf, 0x1C);
                buf.put_u32(serial.0);
                buf.put_u16(*graphic);
                buf.put_u8(*mode);
                buf.put_u16(*hue);
                buf.put_u16(*font);
                put_fixed_ascii(buf, name, 30);
                put_ascii_cstring(buf, text);
                end_dynamic(buf, start);
            }
            ServerPacket::Target(t) => t.encode(buf),
            ServerPacket::MoveAck { sequence, notoriety } => {
                buf.put_u8(0x22);
                buf.put_u8(*sequence);
                buf.put_u8(*notoriety);
            }
            ServerPacket::MoveReject { sequence, location, facing } => {
                buf.put_u8(0x21);
                buf.put_u8(*sequence);
                buf.put_i16(location.x);
                buf.put_i16(location.y);
                buf.put_u8(*facing as u8);
                buf.put_i8(location.z);
            }
            ServerPacket::PickupFailed { reason } => {
                buf.put_u8(0x27);
                buf.put_u8(*reason);
            }
            ServerPacket::WarMode { war } => {
                buf.put_u8(0x72);
                buf.put_u8(*war as u8);
                buf.put_slice(&[0x00, 0x32, 0x00]);
            }
            ServerPacket::Status { serial, name, hits, max_hits, renamable, stats } => {
                let start = begin_dynamic(buf, 0x11);
                buf.put_u32(serial.0);
                put_fixed_ascii(buf, name, 30);
                buf.put_u16(*hits);
                buf.put_u16(*max_hits);
                buf.put_u8(*renamable as u8);
                match stats {
                    None => buf.put_u8(0),
                    Some(s) => {
                        buf.put_u8(1);
                        buf.put_u8(s.female as u8);
                        buf.put_u16(s.strength);
                        buf.put_u16(s.dexterity);
                        buf.put_u16(s.intelligence);
                        buf.put_u16(s.stamina);
                        buf.put_u16(s.max_stamina);
                        buf.put_u16(s.mana);
                        buf.put_u16(s.max_mana);
                        buf.put_u32(s.gold);
                        buf.put_u16(s.armor);
                        buf.put_u16(s.weight);
                    }
                }
                end_dynamic(buf, start);
            }
            ServerPacket::OplRevision { serial, hash } => {
                buf.put_u8(0xDC);
                buf.put_u32(serial.0);
                buf.put_u32(*hash);
            }
            ServerPacket::OplInfo { serial, hash, lines } => {
                let start = begin_dynamic(buf, 0xD6);
                buf.put_u16(1);
                buf.put_u32(serial.0);
                buf.put_u16(0);
                buf.put_u32(*hash);
                for line in lines {
                    let units: Vec<u16> = line.encode_utf16().collect();
                    buf.put_u32(CLILOC_PLAIN);
                    buf.put_u16((units.len() * 2) as u16);
                    for u in units {
                        buf.put_u16_le(u);
                    }
                }
                buf.put_u32(0);
                end_dynamic(buf, start);
            }
            ServerPacket::Light { level } => {
                buf.put_u8(0x4F);
                buf.put_u8(*level);
            }
            ServerPacket::Season { season, play_sound } => {
                buf.put_u8(0xBC);
                buf.put_u8(*season);
                buf.put_u8(*play_sound as u8);
            }
            ServerPacket::Features { flags } => {
                buf.put_u8(0xB9);
                buf.put_u16(*flags);
            }
            ServerPacket::Ping { sequence } => {
                buf.put_u8(0x73);
                buf.put_u8(*sequence);
            }
        }
    }

    /// Decodes what a client would receive. Ids shared with client packets
    /// (0x6C, 0x72, 0x73) decode to the server form here.
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let mut r = PacketReader::new(data)?;
        let packet = match r.id() {
            0x82 => ServerPacket::LoginDenied { reason: r.u8()? },
            0xA8 => {
                r.skip(1)?;
                let count = r.u16()? as usize;
                let mut servers = Vec::with_capacity(count.min(64));
                for _ in 0..count {
                    let index = r.u16()?;
                    let name = r.fixed_ascii(32)?;
                    let percent_full = r.u8()?;
                    let timezone = r.u8()?;
                    let o = r.bytes(4)?;
                    servers.push(ServerEntry {
                        index,
                        name,
                        percent_full,
                        timezone,
                        address: Ipv4Addr::new(o[3], o[2], o[1], o[0]),
                    });
                }
                ServerPacket::ServerList { servers }
            }
            0x8C => {
                let o = r.bytes(4)?;
                ServerPacket::Connect {
                    address: Ipv4Addr::new(o[0], o[1], o[2], o[3]),
                    port: r.u16()?,
                    key: r.u32()?,
                }
            }
            0xA9 => {
                let slots = r.u8()? as usize;
                let mut characters = Vec::new();
                for _ in 0..slots {
                    let name = r.fixed_ascii(30)?;
                    r.skip(30)?;
                    if !name.is_empty() {
                        characters.push(CharacterEntry { name });
                    }
                }
                let city_count = r.u8()? as usize;
                let mut cities = Vec::with_capacity(city_count);
                for _ in 0..city_count {
                    r.skip(1)?;
                    cities.push(StartingCity {
                        name: r.fixed_ascii(31)?,
                        building: r.fixed_ascii(31)?,
                    });
                }
                ServerPacket::CharacterList { characters, cities, flags: r.u32()? }
            }
            0x1B => {
                let serial = Serial(r.u32()?);
                r.skip(4)?;
                let body = r.u16()?;
                let x = r.i16()?;
                let y = r.i16()?;
                let z = r.i16()? as i8;
                let facing = Direction::from_wire(r.u8()?);
                r.skip(1 + 4 + 2 + 2)?;
                ServerPacket::LoginConfirm {
                    serial,
                    body,
                    location: Location::new(x, y, z),
                    facing,
                    map_width: r.u16()?,
                    map_height: r.u16()?,
                }
            }
            0x55 => ServerPacket::LoginComplete,
            0x78 => {
                let serial = Serial(r.u32()?);
                let body = r.u16()?;
                let x = r.i16()?;
                let y = r.i16()?;
                let z = r.i8()?;
                let facing = Direction::from_wire(r.u8()?);
                let hue = r.u16()?;
                let flags = r.u8()?;
                let notoriety = r.u8()?;
                let mut equipment = Vec::new();
                loop {
                    let item = Serial(r.u32()?);
                    if item.is_none() {
                        break;
                    }
                    let raw = r.u16()?;
                    let layer = r.u8()?;
                    let hue = if raw & 0x8000 != 0 { r.u16()? } else { 0 };
                    equipment.push(EquipmentEntry { serial: item, graphic: raw & 0x7FFF, layer, hue });
                }
                ServerPacket::DrawObject {
                    serial,
                    body,
                    location: Location::new(x, y, z),
                    facing,
                    hue,
                    flags,
                    notoriety,
                    equipment,
                }
            }
            0x1A => {
                let raw = r.u32()?;
                let graphic = r.u16()?;
                let amount = if raw & 0x8000_0000 != 0 { r.u16()? } else { 1 };
                let x = r.u16()?;
                let y = r.u16()?;
                let z = r.i8()?;
                let hue = if y & 0x8000 != 0 { r.u16()? } else { 0 };
                ServerPacket::WorldItem {
                    serial: Serial(raw & 0x7FFF_FFFF),
                    graphic,
                    amount,
                    location: Location::new((x & 0x7FFF) as i16, (y & 0x3FFF) as i16, z),
                    hue,
                }
            }
            0x2E => {
                let serial = Serial(r.u32()?);
                let graphic = r.u16()?;
                r.skip(1)?;
                ServerPacket::WornItem {
                    serial,
                    graphic,
                    layer: r.u8()?,
                    mobile: Serial(r.u32()?),
                    hue: r.u16()?,
                }
            }
            0x25 => ServerPacket::ContainerItem(ContainerEntry::decode(&mut r)?),
            0x3C => {
                let count = r.u16()? as usize;
                let mut items = Vec::with_capacity(count.min(r.remaining() / 20));
                for _ in 0..count {
                    items.push(ContainerEntry::decode(&mut r)?);
                }
                ServerPacket::ContainerContents { items }
            }
            0x24 => ServerPacket::DrawContainer {
                serial: Serial(r.u32()?),
                gump: r.u16()?,
            },
            0x1D => ServerPacket::Delete { serial: Serial(r.u32()?) },
            0x1C => ServerPacket::AsciiMessage {
                serial: Serial(r.u32()?),
                graphic: r.u16()?,
                mode: r.u8()?,
                hue: r.u16()?,
                font: r.u16()?,
                name: r.fixed_ascii(30)?,
                text: r.ascii_cstring(),
            },
            0x6C => match super::ClientPacket::decode(data)? {
                super::ClientPacket::Target(t) => ServerPacket::Target(t),
                _ => return Err(DecodeError::Unsupported(0x6C)),
            },
            0x22 => ServerPacket::MoveAck {
                sequence: r.u8()?,
                notoriety: r.u8()?,
            },
            0x21 => {
                let sequence = r.u8()?;
                let x = r.i16()?;
                let y = r.i16()?;
                let facing = Direction::from_wire(r.u8()?);
                let z = r.i8()?;
                ServerPacket::MoveReject { sequence, location: Location::new(x, y, z), facing }
            }
            0x27 => ServerPacket::PickupFailed { reason: r.u8()? },
            0x72 => ServerPacket::WarMode { war: r.u8()? != 0 },
            0x11 => {
                let serial = Serial(r.u32()?);
                let name = r.fixed_ascii(30)?;
                let hits = r.u16()?;
                let max_hits = r.u16()?;
                let renamable = r.u8()? != 0;
                let stats = if r.u8()? >= 1 {
                    Some(StatusStats {
                        female: r.u8()? != 0,
                        strength: r.u16()?,
                        dexterity: r.u16()?,
                        intelligence: r.u16()?,
                        stamina: r.u16()?,
                        max_stamina: r.u16()?,
                        mana: r.u16()?,
                        max_mana: r.u16()?,
                        gold: r.u32()?,
                        armor: r.u16()?,
                        weight: r.u16()?,
                    })
                } else {
                    None
                };
                ServerPacket::Status { serial, name, hits, max_hits, renamable, stats }
            }
            0xDC => ServerPacket::OplRevision {
                serial: Serial(r.u32()?),
                hash: r.u32()?,
            },
            0xD6 => {
                r.skip(2)?;
                let serial = Serial(r.u32()?);
                r.skip(2)?;
                let hash = r.u32()?;
                let mut lines = Vec::new();
                loop {
                    if r.u32()? == 0 {
                        break;
                    }
                    let len = r.u16()? as usize;
                    let units: Vec<u16> = r
                        .bytes(len)?
                        .chunks_exact(2)
                        .map(|c| u16::from_le_bytes([c[0], c[1]]))
                        .collect();
                    lines.push(String::from_utf16_lossy(&units));
                }
                ServerPacket::OplInfo { serial, hash, lines }
            }
            0x4F => ServerPacket::Light { level: r.u8()? },
            0xBC => ServerPacket::Season {
                season: r.u8()?,
                play_sound: r.u8()? != 0,
            },
            0xB9 => ServerPacket::Features { flags: r.u16()? },
            0x73 => ServerPacket::Ping { sequence: r.u8()? },
            id => return Err(DecodeError::Unsupported(id)),
        };
        Ok(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{classify_length, PacketLength};

    fn roundtrip(p: ServerPacket) {
        let buf = p.to_bytes();
        match classify_length(p.id()) {
            PacketLength::Fixed(n) => assert_eq!(buf.len(), n, "length of {:#04X}", p.id()),
            PacketLength::Dynamic => {
                assert_eq!(u16::from_be_bytes([buf[1], buf[2]]) as usize, buf.len())
            }
            PacketLength::Invalid => panic!("invalid id {:#04X}", p.id()),
        }
        assert_eq!(ServerPacket::decode(&buf).unwrap(), p);
    }

    #[test]
    fn test_login_sequence_packets() {
        roundtrip(ServerPacket::LoginDenied { reason: deny::BAD_PASSWORD });
        roundtrip(ServerPacket::ServerList {
            servers: vec![ServerEntry {
                index: 0,
                name: "uod".into(),
                percent_full: 0,
                timezone: 0,
                address: Ipv4Addr::new(192, 168, 1, 10),
            }],
        });
        roundtrip(ServerPacket::Connect {
            address: Ipv4Addr::LOCALHOST,
            port: 7776,
            key: 0x1234_5678,
        });
        roundtrip(ServerPacket::CharacterList {
            characters: vec![CharacterEntry { name: "alice".into() }],
            cities: vec![StartingCity { name: "Britain".into(), building: "Inn".into() }],
            flags: 0x08,
        });
    }

    #[test]
    fn test_server_list_reverses_address() {
        let buf = ServerPacket::ServerList {
            servers: vec![ServerEntry {
                index: 0,
                name: "uod".into(),
                percent_full: 0,
                timezone: 0,
                address: Ipv4Addr::new(1, 2, 3, 4),
            }],
        }
        .to_bytes();
        assert_eq!(&buf[buf.len() - 4..], &[4, 3, 2, 1]);
    }

    #[test]
    fn test_world_packets() {
        roundtrip(ServerPacket::LoginConfirm {
            serial: Serial(1),
            body: 0x190,
            location: Location::new(1475, 1645, 20),
            facing: Direction::South,
            map_width: 6144,
            map_height: 4096,
        });
        roundtrip(ServerPacket::LoginComplete);
        roundtrip(ServerPacket::DrawObject {
            serial: Serial(1),
            body: 0x190,
            location: Location::new(10, 10, 0),
            facing: Direction::East,
            hue: 0x83EA,
            flags: 0,
            notoriety: 1,
            equipment: vec![EquipmentEntry {
                serial: Serial(0x4000_0001),
                graphic: 0x0E75,
                layer: 0x15,
                hue: 0,
            }],
        });
        roundtrip(ServerPacket::WorldItem {
            serial: Serial(0x4000_0002),
            graphic: 0x0EED,
            amount: 50,
            location: Location::new(100, 200, -3),
            hue: 0x0481,
        });
        roundtrip(ServerPacket::WornItem {
            serial: Serial(0x4000_0003),
            graphic: 0x1517,
            layer: 0x05,
            mobile: Serial(1),
            hue: 0,
        });
        roundtrip(ServerPacket::Delete { serial: Serial(0x4000_0003) });
        roundtrip(ServerPacket::MoveAck { sequence: 3, notoriety: 1 });
        roundtrip(ServerPacket::MoveReject {
            sequence: 4,
            location: Location::new(5, 6, 7),
            facing: Direction::West,
        });
    }

    #[test]
    fn test_container_packets() {
        let entry = ContainerEntry {
            serial: Serial(0x4000_0002),
            graphic: 0x0EED,
            amount: 100,
            x: 44,
            y: 65,
            grid: 0,
            container: Serial(0x4000_0001),
            hue: 0,
        };
        roundtrip(ServerPacket::ContainerItem(entry));
        roundtrip(ServerPacket::ContainerContents { items: vec![entry, entry] });
        roundtrip(ServerPacket::DrawContainer { serial: Serial(0x4000_0001), gump: 0x3C });
    }

    #[test]
    fn test_container_contents_length_limit() {
        let entry = ContainerEntry {
            serial: Serial(0x4000_0002),
            graphic: 0x0EED,
            amount: 1,
            x: 0,
            y: 0,
            grid: 0,
            container: Serial(0x4000_0001),
            hue: 0,
        };
        let full = ServerPacket::ContainerContents { items: vec![entry; MAX_CONTAINER_ENTRIES] };
        assert_eq!(full.to_bytes().len(), 5 + MAX_CONTAINER_ENTRIES * ContainerEntry::ENCODED_LEN);
        roundtrip(full);

        let oversized = ServerPacket::ContainerContents { items: vec![entry; 3300] };
        assert!(oversized.to_bytes().is_empty());
    }

    #[test]
    fn test_status_and_properties() {
        roundtrip(ServerPacket::Status {
            serial: Serial(1),
            name: "alice".into(),
            hits: 40,
            max_hits: 50,
            renamable: false,
            stats: None,
        });
        let extended = ServerPacket::Status {
            serial: Serial(1),
            name: "alice".into(),
            hits: 40,
            max_hits: 50,
            renamable: false,
            stats: Some(StatusStats {
                female: true,
                strength: 50,
                dexterity: 40,
                intelligence: 30,
                stamina: 40,
                max_stamina: 40,
                mana: 30,
                max_mana: 30,
                gold: 100,
                armor: 0,
                weight: 12,
            }),
        };
        assert_eq!(extended.to_bytes().len(), 66);
        roundtrip(extended);
        roundtrip(ServerPacket::OplRevision { serial: Serial(0x4000_0001), hash: 77 });
        roundtrip(ServerPacket::OplInfo {
            serial: Serial(0x4000_0001),
            hash: 77,
            lines: vec!["Backpack".into(), "1 items, 0 stones".into()],
        });
    }

    #[test]
    fn test_message_and_misc_packets() {
        roundtrip(ServerPacket::system("Saving the world"));
        roundtrip(ServerPacket::Target(TargetPacket::cancel(9)));
        roundtrip(ServerPacket::WarMode { war: true });
        roundtrip(ServerPacket::PickupFailed { reason: 1 });
        roundtrip(ServerPacket::Light { level: 0 });
        roundtrip(ServerPacket::Season { season: 0, play_sound: true });
        roundtrip(ServerPacket::Features { flags: 0x8003 });
        roundtrip(ServerPacket::Ping { sequence: 1 });
    }
}
