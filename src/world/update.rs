//! Batched network updates.
//!
//! Mutators only record a serial in `updates` or `opl_updates`. Once per
//! tick [`World::flush_updates`] swaps both sets out and sends one packet
//! per live object to that object's audience. Anything marked while the
//! flush runs lands in the fresh sets and goes out next tick.

use std::sync::Arc;

use crate::game::{Item, Location, Mobile, ObjectRef, Serial};
use crate::protocol::server::{ContainerEntry, EquipmentEntry, StatusStats, MAX_CONTAINER_ENTRIES};
use crate::protocol::ServerPacket;
use crate::session::NetState;

use super::World;

const WAR_MODE_FLAG: u8 = 0x40;

/// Property-list revision hash over rendered tooltip lines.
pub fn lines_hash(lines: &[String]) -> u32 {
    let mut h: u32 = 0x811C_9DC5;
    for line in lines {
        for b in line.as_bytes().iter().chain(std::iter::once(&0u8)) {
            h ^= *b as u32;
            h = h.wrapping_mul(0x0100_0193);
        }
    }
    h & 0x3FFF_FFFF
}

pub(super) fn container_entry(item: &Item) -> ContainerEntry {
    ContainerEntry {
        serial: item.serial,
        graphic: item.graphic,
        amount: item.amount,
        x: item.location.x,
        y: item.location.y,
        grid: 0,
        container: item.parent,
        hue: item.hue,
    }
}

fn mobile_flags(mobile: &Mobile) -> u8 {
    if mobile.war_mode {
        WAR_MODE_FLAG
    } else {
        0
    }
}

impl World {
    pub fn mark_dirty(&mut self, serial: Serial) {
        self.updates.insert(serial);
    }

    pub fn mark_opl_dirty(&mut self, serial: Serial) {
        self.opl_updates.insert(serial);
    }

    pub fn pending_updates(&self) -> (usize, usize) {
        (self.updates.len(), self.opl_updates.len())
    }

    /// Marks `container` and every container above it as having new
    /// totals in their property lists.
    pub(super) fn touch_containers(&mut self, container: Serial) {
        if !container.is_item() {
            return;
        }
        self.mark_opl_dirty(container);
        for ancestor in self.store.ancestors(container) {
            if ancestor.is_item() {
                self.mark_opl_dirty(ancestor);
            }
        }
    }

    /// Sends every pending update. Returns the number of packets queued.
    pub fn flush_updates(&mut self) -> usize {
        let mut updates: Vec<Serial> = std::mem::take(&mut self.updates).into_iter().collect();
        let mut opl: Vec<Serial> = std::mem::take(&mut self.opl_updates).into_iter().collect();
        updates.sort_unstable();
        opl.sort_unstable();

        let mut sent = 0;
        for serial in updates {
            // removed since it was marked
            let Some(packet) = self.update_packet(serial) else {
                continue;
            };
            for session in self.audience(serial) {
                if serial.is_mobile() && session.player() == Some(serial) {
                    continue;
                }
                if session.send(packet.clone()) {
                    sent += 1;
                }
            }
        }

        for serial in opl {
            let Some(hash) = self.opl_hash(serial) else {
                continue;
            };
            let packet = ServerPacket::OplRevision { serial, hash };
            for session in self.audience(serial) {
                if session.send(packet.clone()) {
                    sent += 1;
                }
            }
        }
        sent
    }

    /// Sessions that can see `serial`: observers of its container for
    /// contained items, otherwise everyone in range of where it stands.
    pub fn audience(&self, serial: Serial) -> Vec<Arc<NetState>> {
        if let Some(item) = self.store.item(serial) {
            if item.parent.is_item() {
                let container = item.parent;
                return self
                    .players
                    .values()
                    .filter(|s| s.is_observing(container))
                    .cloned()
                    .collect();
            }
            // on a cursor
            if item.parent.is_none() && !self.map.contains(serial) {
                return Vec::new();
            }
        }
        match self.store.world_location(serial) {
            Some(location) => self.sessions_in_range(&location),
            None => Vec::new(),
        }
    }

    pub fn sessions_in_range(&self, center: &Location) -> Vec<Arc<NetState>> {
        self.map
            .mobiles_in_range(center, self.config.view_range)
            .into_iter()
            .filter_map(|m| self.players.get(&m))
            .filter(|s| !s.is_disconnected())
            .cloned()
            .collect()
    }

    /// Tells the audience `serial` is gone, skipping session `except`.
    pub(super) fn send_delete(&self, serial: Serial, except: Option<u64>) {
        let packet = ServerPacket::Delete { serial };
        for session in self.audience(serial) {
            if Some(session.id()) != except {
                session.send(packet.clone());
            }
        }
    }

    pub(super) fn update_packet(&self, serial: Serial) -> Option<ServerPacket> {
        match self.store.get(serial)? {
            ObjectRef::Item(item) => Some(self.item_packet(item)),
            ObjectRef::Mobile(mobile) => Some(self.draw_object(mobile)),
        }
    }

    fn item_packet(&self, item: &Item) -> ServerPacket {
        if item.parent.is_item() {
            ServerPacket::ContainerItem(container_entry(item))
        } else if item.parent.is_mobile() {
            ServerPacket::WornItem {
                serial: item.serial,
                graphic: item.graphic,
                layer: item.layer,
                mobile: item.parent,
                hue: item.hue,
            }
        } else {
            ServerPacket::WorldItem {
                serial: item.serial,
                graphic: item.graphic,
                amount: item.amount,
                location: item.location,
                hue: item.hue,
            }
        }
    }

    pub(super) fn draw_object(&self, mobile: &Mobile) -> ServerPacket {
        let equipment = mobile
            .equipment
            .iter()
            .filter_map(|(layer, serial)| {
                self.store.item(*serial).map(|i| EquipmentEntry {
                    serial: i.serial,
                    graphic: i.graphic,
                    layer: *layer,
                    hue: i.hue,
                })
            })
            .collect();
        ServerPacket::DrawObject {
            serial: mobile.serial,
            body: mobile.body,
            location: mobile.location,
            facing: mobile.facing,
            hue: mobile.hue,
            flags: mobile_flags(mobile),
            notoriety: mobile.notoriety,
            equipment,
        }
    }

    pub(super) fn draw_player(&self, mobile: &Mobile) -> ServerPacket {
        ServerPacket::DrawPlayer {
            serial: mobile.serial,
            body: mobile.body,
            hue: mobile.hue,
            flags: mobile_flags(mobile),
            location: mobile.location,
            facing: mobile.facing,
        }
    }

    /// Draws everything around `center` for one session, except `skip`.
    pub(super) fn send_area(&self, session: &NetState, center: &Location, skip: Serial) {
        for serial in self.map.objects_in_range(center, self.config.view_range) {
            if serial == skip {
                continue;
            }
            if let Some(packet) = self.update_packet(serial) {
                session.send(packet);
            }
        }
    }

    pub(super) fn open_container(&self, session: &NetState, serial: Serial) {
        let Some(container) = self.store.item(serial) else {
            return;
        };
        session.observe(serial);
        session.send(ServerPacket::DrawContainer {
            serial,
            gump: container.gump,
        });
        let items: Vec<_> = container
            .contents
            .iter()
            .filter_map(|s| self.store.item(*s))
            .map(container_entry)
            .collect();
        for chunk in items.chunks(MAX_CONTAINER_ENTRIES) {
            session.send(ServerPacket::ContainerContents { items: chunk.to_vec() });
        }
    }

    pub(super) fn opl_hash(&self, serial: Serial) -> Option<u32> {
        match self.store.get(serial)? {
            ObjectRef::Item(item) => Some(item.opl_hash()),
            ObjectRef::Mobile(mobile) => Some(lines_hash(&mobile.properties())),
        }
    }

    /// Gold coins anywhere in the mobile's backpack.
    fn gold_of(&self, mobile: &Mobile) -> u32 {
        let Some(pack) = mobile.backpack() else {
            return 0;
        };
        self.store
            .collect_tree(pack)
            .into_iter()
            .filter_map(|s| self.store.item(s))
            .filter(|i| i.template == "Gold")
            .map(|i| i.amount as u32)
            .sum()
    }

    /// Status bar; `full` adds the stat block the owner sees.
    pub fn status_packet(&self, serial: Serial, full: bool) -> Option<ServerPacket> {
        let mobile = self.store.mobile(serial)?;
        let stats = full.then(|| StatusStats {
            female: false,
            strength: mobile.strength,
            dexterity: mobile.dexterity,
            intelligence: mobile.intelligence,
            stamina: mobile.dexterity,
            max_stamina: mobile.dexterity,
            mana: mobile.intelligence,
            max_mana: mobile.intelligence,
            gold: self.gold_of(mobile),
            armor: 0,
            weight: (mobile.carried_weight / 100).min(u16::MAX as u32) as u16,
        });
        Some(ServerPacket::Status {
            serial,
            name: mobile.name.clone(),
            hits: mobile.hits,
            max_hits: mobile.max_hits,
            renamable: false,
            stats,
        })
    }
}
