//! In-game packet handlers, run inside the actor.

use std::sync::Arc;

use crate::game::{Direction, Item, Location, MapError, Object, ObjectRef, Serial};
use crate::protocol::{ClientPacket, ServerPacket, TargetPacket};
use crate::session::NetState;

use super::{RequestError, World};

/// Tiles within which a character can pick up, drop or use things.
pub const REACH: u16 = 2;

/// Speech mode for name labels.
const MODE_LABEL: u8 = 6;
const LABEL_HUE: u16 = 0x03B2;
const LABEL_FONT: u16 = 3;

/// Status request kind for the stat bar.
const STATUS_BASIC: u8 = 4;

/// Drop target meaning "on the ground".
const GROUND: Serial = Serial(0xFFFF_FFFF);

mod pickup {
    pub const CANNOT_LIFT: u8 = 0;
    pub const OUT_OF_RANGE: u8 = 1;
    pub const ALREADY_HOLDING: u8 = 4;
}

/// Where an item ends up after a drop, wear or use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    Ground(Location),
    Container(Serial, Location),
    Worn(Serial),
}

fn pickup_failed(session: &NetState, reason: u8) -> Result<(), RequestError> {
    session.send(ServerPacket::PickupFailed { reason });
    Ok(())
}

impl World {
    pub(super) fn handle_packet(&mut self, session: &Arc<NetState>, packet: ClientPacket) -> Result<(), RequestError> {
        let player = self.player_of(session)?;
        match packet {
            ClientPacket::Walk { direction, sequence, .. } => self.walk(session, player, direction, sequence),
            ClientPacket::AsciiSpeech { mode, hue, font, text }
            | ClientPacket::UnicodeSpeech { mode, hue, font, text, .. } => {
                self.speech(player, mode & 0x3F, hue, font, text)
            }
            ClientPacket::SingleClick { serial } => self.single_click(session, serial),
            ClientPacket::DoubleClick { serial, .. } => self.double_click(session, player, serial),
            ClientPacket::Lift { serial, amount } => self.lift(session, player, serial, amount),
            ClientPacket::Drop { serial, location, container, .. } => {
                self.drop_held(player, serial, location, container)
            }
            ClientPacket::Wear { serial, mobile, .. } => self.wear(player, serial, mobile),
            ClientPacket::StatusRequest { kind, serial } => {
                if kind == STATUS_BASIC {
                    session.send_optional(self.status_packet(serial, serial == player));
                }
                Ok(())
            }
            ClientPacket::WarMode { war } => {
                let mobile = self
                    .store
                    .mobile_mut(player)
                    .ok_or(RequestError::NotFound(player))?;
                mobile.war_mode = war;
                session.send(ServerPacket::WarMode { war });
                self.mark_dirty(player);
                Ok(())
            }
            ClientPacket::PropertyRequest { serials } => {
                for serial in serials {
                    let lines = match self.find(serial) {
                        Some(ObjectRef::Item(i)) => i.properties(),
                        Some(ObjectRef::Mobile(m)) => m.properties(),
                        None => continue,
                    };
                    if let Some(hash) = self.opl_hash(serial) {
                        session.send(ServerPacket::OplInfo { serial, hash, lines });
                    }
                }
                Ok(())
            }
            ClientPacket::Target(response) => {
                match session.target_response(&response, self.now()) {
                    Some(callback) => callback(self, &response),
                    None => tracing::debug!(
                        "[world] [target] id={} cursor={} dropped",
                        session.id(),
                        response.cursor_id
                    ),
                }
                Ok(())
            }
            ClientPacket::GumpResponse(response) => {
                match session.gump_close(response.type_id) {
                    Some(handler) => handler(self, &response),
                    None => tracing::debug!(
                        "[world] [gump] id={} type={:#x} was not open",
                        session.id(),
                        response.type_id
                    ),
                }
                Ok(())
            }
            other => {
                tracing::debug!(
                    "[world] [ignored] id={} packet={:#04X}",
                    session.id(),
                    other.id()
                );
                Ok(())
            }
        }
    }

    /// The player bound to `session`, checked against the live binding.
    fn player_of(&self, session: &Arc<NetState>) -> Result<Serial, RequestError> {
        let player = session.player().ok_or(RequestError::NotInWorld)?;
        match self.players.get(&player) {
            Some(bound) if Arc::ptr_eq(bound, session) => Ok(player),
            _ => Err(RequestError::NotInWorld),
        }
    }

    fn walk(&mut self, session: &NetState, player: Serial, direction: u8, sequence: u8) -> Result<(), RequestError> {
        let dir = Direction::from_wire(direction);
        let mobile = self
            .store
            .mobile_mut(player)
            .ok_or(RequestError::NotFound(player))?;
        let (from, notoriety) = (mobile.location, mobile.notoriety);

        if mobile.facing != dir {
            mobile.facing = dir;
            session.send(ServerPacket::MoveAck { sequence, notoriety });
            self.mark_dirty(player);
            return Ok(());
        }

        let to = from.step(dir);
        if let Err(e) = self.map.move_object(player, to) {
            tracing::debug!("[world] [walk] player={} blocked: {}", player, e);
            session.send(ServerPacket::MoveReject {
                sequence,
                location: from,
                facing: dir,
            });
            return Ok(());
        }
        mobile.location = to;
        session.send(ServerPacket::MoveAck { sequence, notoriety });
        self.mark_dirty(player);

        let range = self.config.view_range;
        for serial in self.map.objects_in_range(&to, range) {
            if serial == player {
                continue;
            }
            let seen = self
                .map
                .location_of(serial)
                .is_some_and(|l| l.in_range(&from, range));
            if !seen {
                session.send_optional(self.update_packet(serial));
            }
        }

        let store = &self.store;
        session.retain_observed(|c| {
            store
                .world_location(*c)
                .is_some_and(|l| l.in_range(&to, range))
        });
        Ok(())
    }

    fn speech(&mut self, player: Serial, mode: u8, hue: u16, font: u16, text: String) -> Result<(), RequestError> {
        let mobile = self.store.mobile(player).ok_or(RequestError::NotFound(player))?;
        tracing::debug!("[world] [speech] player={} text={:?}", player, text);
        let packet = ServerPacket::AsciiMessage {
            serial: player,
            graphic: mobile.body,
            mode,
            hue,
            font,
            name: mobile.name.clone(),
            text,
        };
        for session in self.sessions_in_range(&mobile.location) {
            session.send(packet.clone());
        }
        Ok(())
    }

    fn single_click(&mut self, session: &NetState, serial: Serial) -> Result<(), RequestError> {
        let (graphic, text) = match self.find(serial) {
            Some(ObjectRef::Item(i)) => (i.graphic, i.label()),
            Some(ObjectRef::Mobile(m)) => (m.body, m.name.clone()),
            None => return Err(RequestError::NotFound(serial)),
        };
        session.send(ServerPacket::AsciiMessage {
            serial,
            graphic,
            mode: MODE_LABEL,
            hue: LABEL_HUE,
            font: LABEL_FONT,
            name: String::new(),
            text,
        });
        Ok(())
    }

    /// Opens containers and status bars; any other item asks for a target
    /// to use it on.
    fn double_click(&mut self, session: &NetState, player: Serial, serial: Serial) -> Result<(), RequestError> {
        if !session.try_action(self.now()) {
            return Err(RequestError::TooFast);
        }
        if serial.is_mobile() {
            session.send_optional(self.status_packet(serial, serial == player));
            return Ok(());
        }

        let item = self.store.item(serial).ok_or(RequestError::NotFound(serial))?;
        if !self.in_reach(player, serial) {
            return Err(RequestError::OutOfReach(serial));
        }
        if item.is_container() {
            self.open_container(session, serial);
            return Ok(());
        }

        let label = item.label();
        session.target_send_cursor(
            0,
            Box::new(move |world: &mut World, response: &TargetPacket| {
                world.use_item_on(player, serial, response.serial)
            }),
        );
        session.send(ServerPacket::system(format!("What do you want to use {} on?", label)));
        Ok(())
    }

    /// Target callback for a used item: a container takes it in.
    pub(super) fn use_item_on(&mut self, player: Serial, item: Serial, target: Serial) {
        let Some(session) = self.players.get(&player).cloned() else {
            return;
        };
        let is_container = self.store.item(target).is_some_and(|t| t.is_container());
        if !is_container || self.held.values().any(|h| *h == item) {
            session.send(ServerPacket::system("Nothing happens."));
            return;
        }
        if !self.in_reach(player, item) || !self.in_reach(player, target) {
            session.send(ServerPacket::system(RequestError::OutOfReach(target).to_string()));
            return;
        }
        if let Err(e) = self.place_item(item, Placement::Container(target, Location::default())) {
            session.send(ServerPacket::system(e.to_string()));
        }
    }

    fn lift(&mut self, session: &NetState, player: Serial, serial: Serial, amount: u16) -> Result<(), RequestError> {
        if self.held.contains_key(&player) {
            return pickup_failed(session, pickup::ALREADY_HOLDING);
        }
        if !session.try_action(self.now()) {
            return pickup_failed(session, pickup::CANNOT_LIFT);
        }
        let Some(item) = self.store.item(serial) else {
            return pickup_failed(session, pickup::CANNOT_LIFT);
        };
        if !self.in_reach(player, serial) {
            return pickup_failed(session, pickup::OUT_OF_RANGE);
        }
        let (stack, parent) = (item.amount, item.parent);

        if amount > 0 && amount < stack {
            self.split_stack(serial, stack - amount)?;
            if let Some(item) = self.store.item_mut(serial) {
                item.amount = amount;
            }
        }

        self.send_delete(serial, Some(session.id()));
        self.store.detach(serial)?;
        self.map.remove_object(serial);
        self.held.insert(player, serial);
        self.store.recalculate();
        self.touch_containers(parent);
        tracing::debug!("[world] [lift] player={} item={} amount={}", player, serial, amount);
        Ok(())
    }

    /// Leaves `remainder` of a stack where it lies as a new item.
    fn split_stack(&mut self, serial: Serial, remainder: u16) -> Result<Serial, RequestError> {
        let original = self.store.item(serial).ok_or(RequestError::NotFound(serial))?;
        let (parent, location) = (original.parent, original.location);
        let mut rest: Item = original.clone();

        let split = self.store.allocate_item_serial();
        rest.serial = split;
        rest.amount = remainder;
        rest.parent = Serial::NONE;
        rest.contents.clear();
        self.store.insert(Object::Item(rest));

        if parent.is_item() {
            self.store.add_to_container(split, parent, location)?;
        } else {
            let now = self.now();
            let at = self.store.world_location(serial).unwrap_or(location);
            self.store.place_on_ground(split, at, now)?;
            self.map.force_add_object(split, at);
        }
        self.mark_dirty(split);
        Ok(split)
    }

    fn take_held(&mut self, player: Serial, serial: Serial) -> Result<(), RequestError> {
        match self.held.get(&player) {
            Some(held) if *held == serial => {
                self.held.remove(&player);
                Ok(())
            }
            _ => Err(RequestError::NotHolding(serial)),
        }
    }

    fn drop_held(&mut self, player: Serial, serial: Serial, location: Location, container: Serial) -> Result<(), RequestError> {
        self.take_held(player, serial)?;
        let placement = self.drop_placement(player, location, container);
        match placement.and_then(|p| self.place_item(serial, p)) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.bounce(player, serial);
                Err(e)
            }
        }
    }

    fn drop_placement(&self, player: Serial, location: Location, container: Serial) -> Result<Placement, RequestError> {
        let mobile = self.store.mobile(player).ok_or(RequestError::NotFound(player))?;
        if container.is_none() || container == GROUND {
            if !mobile.location.in_range(&location, REACH) {
                return Err(RequestError::OutOfReach(container));
            }
            return Ok(Placement::Ground(location));
        }
        if container.is_mobile() {
            if container != player {
                return Err(RequestError::OutOfReach(container));
            }
            let pack = mobile.backpack().ok_or(RequestError::NotFound(container))?;
            return Ok(Placement::Container(pack, Location::default()));
        }
        if !self.in_reach(player, container) {
            return Err(RequestError::OutOfReach(container));
        }
        Ok(Placement::Container(container, location))
    }

    fn wear(&mut self, player: Serial, serial: Serial, mobile: Serial) -> Result<(), RequestError> {
        self.take_held(player, serial)?;
        let target = if mobile.is_none() { player } else { mobile };
        let result = if target == player {
            self.place_item(serial, Placement::Worn(player))
        } else {
            Err(RequestError::OutOfReach(target))
        };
        if result.is_err() {
            self.bounce(player, serial);
        }
        result
    }

    /// Moves an item to its new home and tells everyone who can see
    /// either end. Sessions that saw the old spot but not the new one get
    /// a delete; the new audience gets the update on the next flush.
    fn place_item(&mut self, serial: Serial, placement: Placement) -> Result<(), RequestError> {
        let item = self.store.item(serial).ok_or(RequestError::NotFound(serial))?;
        let old_parent = item.parent;
        let was_placed = !old_parent.is_none() || self.map.contains(serial);
        let before = if was_placed { self.audience(serial) } else { Vec::new() };
        let now = self.now();

        match placement {
            Placement::Ground(location) => {
                if !self.map.in_bounds(&location) {
                    return Err(MapError::OutOfBounds(location).into());
                }
                self.store.place_on_ground(serial, location, now)?;
                self.map.force_add_object(serial, location);
            }
            Placement::Container(container, position) => {
                self.store.add_to_container(serial, container, position)?;
                self.map.remove_object(serial);
            }
            Placement::Worn(mobile) => {
                self.store.equip(serial, mobile)?;
                self.map.remove_object(serial);
            }
        }

        let after: Vec<u64> = self.audience(serial).iter().map(|s| s.id()).collect();
        for session in before {
            if !after.contains(&session.id()) {
                session.send(ServerPacket::Delete { serial });
            }
        }

        self.store.recalculate();
        self.mark_dirty(serial);
        self.touch_containers(old_parent);
        if let Placement::Container(container, _) = placement {
            self.touch_containers(container);
        }
        Ok(())
    }

    /// Returns a held item to its owner's backpack, or drops it at their feet.
    fn bounce(&mut self, player: Serial, serial: Serial) {
        let Some(mobile) = self.store.mobile(player) else {
            return;
        };
        let (pack, feet) = (mobile.backpack(), mobile.location);
        let packed = match pack {
            Some(pack) => self
                .place_item(serial, Placement::Container(pack, Location::default()))
                .is_ok(),
            None => false,
        };
        if !packed {
            if let Err(e) = self.place_item(serial, Placement::Ground(feet)) {
                tracing::warn!("[world] [bounce] player={} item={} lost: {}", player, serial, e);
            }
        }
        tracing::debug!("[world] [bounce] player={} item={}", player, serial);
    }

    /// Whatever is on the player's cursor goes back to the backpack.
    pub(super) fn return_held(&mut self, player: Serial) {
        if let Some(serial) = self.held.remove(&player) {
            self.bounce(player, serial);
        }
    }

    /// Carried by the player, or near enough to touch.
    fn in_reach(&self, player: Serial, serial: Serial) -> bool {
        let root = self.store.root_of(serial);
        if root == player {
            return true;
        }
        if root.is_mobile() {
            return false;
        }
        match (self.store.mobile(player), self.store.world_location(serial)) {
            (Some(mobile), Some(location)) => mobile.location.in_range(&location, REACH),
            _ => false,
        }
    }
}
