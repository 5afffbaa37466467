//! Object model: items, mobiles and the serial-keyed datastore.
//!
//! Containment is stored on both sides: an item records its `parent`
//! (container or wearer) and the parent lists the child in `contents` or
//! `equipment`. `ObjectStore` keeps the two in sync.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use super::types::{Direction, Location, Serial, Tick};

/// Equipment layers used by the built-in templates.
pub mod layer {
    pub const NONE: u8 = 0x00;
    pub const ONE_HANDED: u8 = 0x01;
    pub const TWO_HANDED: u8 = 0x02;
    pub const SHOES: u8 = 0x03;
    pub const PANTS: u8 = 0x04;
    pub const SHIRT: u8 = 0x05;
    pub const HELM: u8 = 0x06;
    pub const HAIR: u8 = 0x0B;
    pub const BACKPACK: u8 = 0x15;
    pub const OUTER_TORSO: u8 = 0x16;
    pub const LAST: u8 = 0x19;

    pub fn is_wearable(layer: u8) -> bool {
        (ONE_HANDED..=LAST).contains(&layer)
    }
}

/// Nesting limit for container trees.
pub const MAX_DEPTH: usize = 32;

/// Items one container may hold directly.
pub const MAX_CONTAINER_ITEMS: usize = 125;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ObjectError {
    #[error("No such object {0}")]
    NotFound(Serial),

    #[error("{0} is not a container")]
    NotContainer(Serial),

    #[error("{0} cannot be worn")]
    NotWearable(Serial),

    #[error("Layer {layer:#04X} on {mobile} is already occupied")]
    LayerOccupied { mobile: Serial, layer: u8 },

    #[error("Placing {0} there would nest it inside itself")]
    WouldNest(Serial),

    #[error("{0} cannot hold any more items")]
    ContainerFull(Serial),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub serial: Serial,
    pub template: String,
    pub name: String,
    pub graphic: u16,
    #[serde(default)]
    pub hue: u16,
    pub amount: u16,
    /// Weight of one unit in hundredths of a stone
    pub weight: u32,
    /// Map location on the ground, container-local x/y otherwise
    pub location: Location,
    /// Container or wearer, NONE on the ground
    #[serde(default)]
    pub parent: Serial,
    /// Layer this item occupies when worn
    #[serde(default)]
    pub layer: u8,
    /// Container gump id, 0 when the item cannot hold anything
    #[serde(default)]
    pub gump: u16,
    #[serde(default)]
    pub contents: Vec<Serial>,
    /// When the item last landed on the ground
    #[serde(default)]
    pub dropped_at: Tick,

    #[serde(skip)]
    pub total_weight: u32,
    #[serde(skip)]
    pub total_items: u32,
}

impl Item {
    pub fn new(serial: Serial, template: &str, name: &str, graphic: u16) -> Self {
        Self {
            serial,
            template: template.to_string(),
            name: name.to_string(),
            graphic,
            hue: 0,
            amount: 1,
            weight: 100,
            location: Location::default(),
            parent: Serial::NONE,
            layer: layer::NONE,
            gump: 0,
            contents: Vec::new(),
            dropped_at: 0,
            total_weight: 0,
            total_items: 0,
        }
    }

    pub fn is_container(&self) -> bool {
        self.gump != 0
    }

    pub fn on_ground(&self) -> bool {
        self.parent.is_none()
    }

    /// Display label, including the stack size.
    pub fn label(&self) -> String {
        if self.amount > 1 {
            format!("{} {}", self.amount, self.name)
        } else {
            self.name.clone()
        }
    }

    /// Revision hash for the property list; changes whenever a tooltip line does.
    pub fn opl_hash(&self) -> u32 {
        let mut h: u32 = 0x811C_9DC5;
        let mut mix = |bytes: &[u8]| {
            for b in bytes {
                h ^= *b as u32;
                h = h.wrapping_mul(0x0100_0193);
            }
        };
        mix(self.name.as_bytes());
        mix(&self.amount.to_be_bytes());
        mix(&self.hue.to_be_bytes());
        mix(&self.total_weight.to_be_bytes());
        mix(&self.total_items.to_be_bytes());
        h & 0x3FFF_FFFF
    }

    /// Property list lines shown in the tooltip.
    pub fn properties(&self) -> Vec<String> {
        let mut lines = vec![self.label()];
        if self.is_container() {
            lines.push(format!(
                "{} items, {} stones",
                self.total_items,
                self.total_weight / 100
            ));
        } else {
            lines.push(format!("Weight: {} stones", self.total_weight / 100));
        }
        lines
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mobile {
    pub serial: Serial,
    pub template: String,
    pub name: String,
    pub body: u16,
    #[serde(default)]
    pub hue: u16,
    pub location: Location,
    #[serde(default)]
    pub facing: Direction,
    #[serde(default = "default_notoriety")]
    pub notoriety: u8,
    pub hits: u16,
    pub max_hits: u16,
    pub strength: u16,
    pub dexterity: u16,
    pub intelligence: u16,
    #[serde(default)]
    pub war_mode: bool,
    /// Owning account for player characters
    #[serde(default)]
    pub account: Option<String>,
    /// Worn items by layer
    #[serde(default)]
    pub equipment: BTreeMap<u8, Serial>,

    #[serde(skip)]
    pub carried_weight: u32,
}

fn default_notoriety() -> u8 {
    1
}

impl Mobile {
    pub fn new(serial: Serial, template: &str, name: &str, body: u16) -> Self {
        Self {
            serial,
            template: template.to_string(),
            name: name.to_string(),
            body,
            hue: 0,
            location: Location::default(),
            facing: Direction::default(),
            notoriety: default_notoriety(),
            hits: 50,
            max_hits: 50,
            strength: 50,
            dexterity: 50,
            intelligence: 50,
            war_mode: false,
            account: None,
            equipment: BTreeMap::new(),
            carried_weight: 0,
        }
    }

    pub fn backpack(&self) -> Option<Serial> {
        self.equipment.get(&layer::BACKPACK).copied()
    }

    pub fn is_player(&self) -> bool {
        self.account.is_some()
    }

    pub fn properties(&self) -> Vec<String> {
        vec![self.name.clone()]
    }
}

/// Either kind of object, owned. Used at the save and template boundaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Object {
    Item(Item),
    Mobile(Mobile),
}

impl Object {
    pub fn serial(&self) -> Serial {
        match self {
            Object::Item(i) => i.serial,
            Object::Mobile(m) => m.serial,
        }
    }
}

/// Objects parked off the active world, keyed by their root mobile.
pub type DeepStorage = BTreeMap<Serial, Vec<Object>>;

/// Borrowed view returned by lookups.
#[derive(Debug, Clone, Copy)]
pub enum ObjectRef<'a> {
    Item(&'a Item),
    Mobile(&'a Mobile),
}

impl<'a> ObjectRef<'a> {
    pub fn serial(&self) -> Serial {
        match self {
            ObjectRef::Item(i) => i.serial,
            ObjectRef::Mobile(m) => m.serial,
        }
    }

    pub fn name(&self) -> &'a str {
        match self {
            ObjectRef::Item(i) => &i.name,
            ObjectRef::Mobile(m) => &m.name,
        }
    }

    pub fn to_object(&self) -> Object {
        match self {
            ObjectRef::Item(i) => Object::Item((*i).clone()),
            ObjectRef::Mobile(m) => Object::Mobile((*m).clone()),
        }
    }
}

/// The serial -> object datastore.
#[derive(Debug, Clone, Default)]
pub struct ObjectStore {
    items: HashMap<Serial, Item>,
    mobiles: HashMap<Serial, Mobile>,
    /// Last serials handed out; persisted in the global save section
    last_item: u32,
    last_mobile: u32,
}

impl ObjectStore {
    pub fn new() -> Self {
        Self {
            last_item: Serial::ITEM_TAG,
            ..Default::default()
        }
    }

    pub fn counters(&self) -> (u32, u32) {
        (self.last_mobile, self.last_item)
    }

    pub fn set_counters(&mut self, last_mobile: u32, last_item: u32) {
        self.last_mobile = last_mobile;
        self.last_item = last_item.max(Serial::ITEM_TAG);
    }

    pub fn allocate_mobile_serial(&mut self) -> Serial {
        loop {
            self.last_mobile = if self.last_mobile >= Serial::MOBILE_MAX {
                1
            } else {
                self.last_mobile + 1
            };
            let serial = Serial(self.last_mobile);
            if !self.mobiles.contains_key(&serial) {
                return serial;
            }
        }
    }

    pub fn allocate_item_serial(&mut self) -> Serial {
        loop {
            self.last_item = if self.last_item >= Serial::ITEM_MAX {
                Serial::ITEM_TAG + 1
            } else {
                self.last_item + 1
            };
            let serial = Serial(self.last_item);
            if !self.items.contains_key(&serial) {
                return serial;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.items.len() + self.mobiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, serial: Serial) -> bool {
        self.items.contains_key(&serial) || self.mobiles.contains_key(&serial)
    }

    pub fn get(&self, serial: Serial) -> Option<ObjectRef<'_>> {
        if serial.is_item() {
            self.items.get(&serial).map(ObjectRef::Item)
        } else {
            self.mobiles.get(&serial).map(ObjectRef::Mobile)
        }
    }

    pub fn item(&self, serial: Serial) -> Option<&Item> {
        self.items.get(&serial)
    }

    pub fn item_mut(&mut self, serial: Serial) -> Option<&mut Item> {
        self.items.get_mut(&serial)
    }

    pub fn mobile(&self, serial: Serial) -> Option<&Mobile> {
        self.mobiles.get(&serial)
    }

    pub fn mobile_mut(&mut self, serial: Serial) -> Option<&mut Mobile> {
        self.mobiles.get_mut(&serial)
    }

    pub fn items(&self) -> impl Iterator<Item = &Item> {
        self.items.values()
    }

    pub fn mobiles(&self) -> impl Iterator<Item = &Mobile> {
        self.mobiles.values()
    }

    pub fn mobiles_mut(&mut self) -> impl Iterator<Item = &mut Mobile> {
        self.mobiles.values_mut()
    }

    /// Every serial in ascending order; the stable order used for save shards.
    pub fn sorted_serials(&self) -> Vec<Serial> {
        let mut serials: Vec<Serial> = self
            .mobiles
            .keys()
            .chain(self.items.keys())
            .copied()
            .collect();
        serials.sort_unstable();
        serials
    }

    /// Inserts as-is, without touching any parent's child list.
    pub fn insert(&mut self, object: Object) {
        match object {
            Object::Item(item) => {
                self.items.insert(item.serial, item);
            }
            Object::Mobile(mobile) => {
                self.mobiles.insert(mobile.serial, mobile);
            }
        }
    }

    /// Removes a single object as-is, leaving parent and children untouched.
    pub fn remove(&mut self, serial: Serial) -> Option<Object> {
        if serial.is_item() {
            self.items.remove(&serial).map(Object::Item)
        } else {
            self.mobiles.remove(&serial).map(Object::Mobile)
        }
    }

    /// Unlinks an item from its container or wearer. Returns the old parent.
    pub fn detach(&mut self, serial: Serial) -> Result<Serial, ObjectError> {
        let item = self.items.get_mut(&serial).ok_or(ObjectError::NotFound(serial))?;
        let parent = std::mem::replace(&mut item.parent, Serial::NONE);
        if parent.is_item() {
            if let Some(container) = self.items.get_mut(&parent) {
                container.contents.retain(|s| *s != serial);
            }
        } else if parent.is_mobile() {
            if let Some(mobile) = self.mobiles.get_mut(&parent) {
                mobile.equipment.retain(|_, s| *s != serial);
            }
        }
        Ok(parent)
    }

    pub fn add_to_container(
        &mut self,
        serial: Serial,
        container: Serial,
        position: Location,
    ) -> Result<(), ObjectError> {
        if !self.items.contains_key(&serial) {
            return Err(ObjectError::NotFound(serial));
        }
        match self.items.get(&container) {
            None => return Err(ObjectError::NotFound(container)),
            Some(c) if !c.is_container() => return Err(ObjectError::NotContainer(container)),
            Some(c) if c.contents.len() >= MAX_CONTAINER_ITEMS && !c.contents.contains(&serial) => {
                return Err(ObjectError::ContainerFull(container))
            }
            Some(_) => {}
        }
        if self.ancestors(container).contains(&serial) || container == serial {
            return Err(ObjectError::WouldNest(serial));
        }

        self.detach(serial)?;
        if let Some(c) = self.items.get_mut(&container) {
            c.contents.push(serial);
        }
        if let Some(item) = self.items.get_mut(&serial) {
            item.parent = container;
            item.location = position;
        }
        Ok(())
    }

    pub fn equip(&mut self, serial: Serial, mobile: Serial) -> Result<(), ObjectError> {
        let layer = match self.items.get(&serial) {
            None => return Err(ObjectError::NotFound(serial)),
            Some(i) if !layer::is_wearable(i.layer) => {
                return Err(ObjectError::NotWearable(serial))
            }
            Some(i) => i.layer,
        };
        match self.mobiles.get(&mobile) {
            None => return Err(ObjectError::NotFound(mobile)),
            Some(m) => {
                if let Some(current) = m.equipment.get(&layer) {
                    if *current != serial {
                        return Err(ObjectError::LayerOccupied { mobile, layer });
                    }
                }
            }
        }

        self.detach(serial)?;
        if let Some(m) = self.mobiles.get_mut(&mobile) {
            m.equipment.insert(layer, serial);
        }
        if let Some(item) = self.items.get_mut(&serial) {
            item.parent = mobile;
            item.location = Location::default();
        }
        Ok(())
    }

    pub fn place_on_ground(
        &mut self,
        serial: Serial,
        location: Location,
        now: Tick,
    ) -> Result<(), ObjectError> {
        self.detach(serial)?;
        if let Some(item) = self.items.get_mut(&serial) {
            item.location = location;
            item.dropped_at = now;
        }
        Ok(())
    }

    /// Parent chain from the immediate parent up to the top-level object.
    pub fn ancestors(&self, serial: Serial) -> Vec<Serial> {
        let mut chain = Vec::new();
        let mut current = serial;
        while chain.len() < MAX_DEPTH {
            let parent = match self.items.get(&current) {
                Some(item) => item.parent,
                None => break,
            };
            if parent.is_none() {
                break;
            }
            chain.push(parent);
            current = parent;
        }
        chain
    }

    /// The top-level object: a mobile or an item on the ground.
    pub fn root_of(&self, serial: Serial) -> Serial {
        self.ancestors(serial).last().copied().unwrap_or(serial)
    }

    /// Map position of the object's top-level ancestor.
    pub fn world_location(&self, serial: Serial) -> Option<Location> {
        match self.get(self.root_of(serial))? {
            ObjectRef::Item(i) => Some(i.location),
            ObjectRef::Mobile(m) => Some(m.location),
        }
    }

    /// The object and everything it contains or wears, parents before children.
    pub fn collect_tree(&self, serial: Serial) -> Vec<Serial> {
        let mut out = Vec::new();
        let mut stack = vec![(serial, 0usize)];
        while let Some((current, depth)) = stack.pop() {
            if !self.contains(current) || depth > MAX_DEPTH {
                continue;
            }
            out.push(current);
            if let Some(item) = self.items.get(&current) {
                stack.extend(item.contents.iter().rev().map(|s| (*s, depth + 1)));
            } else if let Some(mobile) = self.mobiles.get(&current) {
                stack.extend(mobile.equipment.values().rev().map(|s| (*s, depth + 1)));
            }
        }
        out
    }

    /// Removes a whole tree. The root is unlinked from its parent first.
    pub fn take_tree(&mut self, serial: Serial) -> Vec<Object> {
        if serial.is_item() {
            let _ = self.detach(serial);
        }
        self.collect_tree(serial)
            .into_iter()
            .filter_map(|s| self.remove(s))
            .collect()
    }

    /// Recomputes container totals and carried weight across every object.
    ///
    /// Loading cannot do this per object because children may not exist yet.
    pub fn recalculate(&mut self) {
        let mut memo: HashMap<Serial, (u32, u32)> = HashMap::with_capacity(self.items.len());
        let serials: Vec<Serial> = self.items.keys().copied().collect();
        for serial in &serials {
            self.item_totals(*serial, &mut memo, 0);
        }
        for (serial, (weight, count)) in &memo {
            if let Some(item) = self.items.get_mut(serial) {
                item.total_weight = *weight;
                item.total_items = *count;
            }
        }
        for mobile in self.mobiles.values_mut() {
            mobile.carried_weight = mobile
                .equipment
                .values()
                .filter_map(|s| memo.get(s))
                .map(|(w, _)| *w)
                .sum();
        }
    }

    fn item_totals(
        &self,
        serial: Serial,
        memo: &mut HashMap<Serial, (u32, u32)>,
        depth: usize,
    ) -> (u32, u32) {
        if let Some(t) = memo.get(&serial) {
            return *t;
        }
        let item = match self.items.get(&serial) {
            Some(i) => i,
            None => return (0, 0),
        };
        let mut weight = item.weight.saturating_mul(item.amount as u32);
        let mut count = 0u32;
        if depth < MAX_DEPTH {
            for child in &item.contents {
                let (w, c) = self.item_totals(*child, memo, depth + 1);
                weight = weight.saturating_add(w);
                count = count.saturating_add(c + 1);
            }
        }
        memo.insert(serial, (weight, count));
        (weight, count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_pack() -> (ObjectStore, Serial, Serial) {
        let mut store = ObjectStore::new();
        let m = store.allocate_mobile_serial();
        store.insert(Object::Mobile(Mobile::new(m, "Player", "alice", 0x190)));
        let pack = store.allocate_item_serial();
        let mut backpack = Item::new(pack, "Backpack", "backpack", 0x0E75);
        backpack.layer = layer::BACKPACK;
        backpack.gump = 0x3C;
        store.insert(Object::Item(backpack));
        store.equip(pack, m).unwrap();
        (store, m, pack)
    }

    #[test]
    fn test_serial_allocation_keyspaces() {
        let mut store = ObjectStore::new();
        let m = store.allocate_mobile_serial();
        let i = store.allocate_item_serial();
        assert_eq!(m, Serial(1));
        assert_eq!(i, Serial(0x4000_0001));
        assert!(m.is_mobile());
        assert!(i.is_item());
    }

    #[test]
    fn test_allocation_skips_existing() {
        let mut store = ObjectStore::new();
        store.insert(Object::Mobile(Mobile::new(Serial(1), "x", "x", 1)));
        assert_eq!(store.allocate_mobile_serial(), Serial(2));
    }

    #[test]
    fn test_container_and_totals() {
        let (mut store, m, pack) = store_with_pack();
        let gold = store.allocate_item_serial();
        let mut coins = Item::new(gold, "Gold", "gold coin", 0x0EED);
        coins.amount = 100;
        coins.weight = 2;
        store.insert(Object::Item(coins));
        store.add_to_container(gold, pack, Location::new(40, 60, 0)).unwrap();

        store.recalculate();
        let p = store.item(pack).unwrap();
        assert_eq!(p.total_items, 1);
        assert_eq!(p.total_weight, 100 + 200);
        assert_eq!(store.mobile(m).unwrap().carried_weight, 300);
        assert_eq!(store.root_of(gold), m);
    }

    #[test]
    fn test_full_container_rejects_more_items() {
        let (mut store, _, pack) = store_with_pack();
        let mut last = Serial::NONE;
        for i in 0..MAX_CONTAINER_ITEMS {
            last = store.allocate_item_serial();
            store.insert(Object::Item(Item::new(last, "Gold", "gold coin", 0x0EED)));
            store.add_to_container(last, pack, Location::new(i as i16, 0, 0)).unwrap();
        }
        store.add_to_container(last, pack, Location::new(5, 5, 0)).unwrap();

        let extra = store.allocate_item_serial();
        store.insert(Object::Item(Item::new(extra, "Gold", "gold coin", 0x0EED)));
        assert_eq!(
            store.add_to_container(extra, pack, Location::default()),
            Err(ObjectError::ContainerFull(pack))
        );
        assert_eq!(store.item(extra).unwrap().parent, Serial::NONE);
    }

    #[test]
    fn test_container_cannot_nest_in_itself() {
        let (mut store, _, pack) = store_with_pack();
        let bag = store.allocate_item_serial();
        let mut b = Item::new(bag, "Bag", "bag", 0x0E76);
        b.gump = 0x3D;
        store.insert(Object::Item(b));
        store.add_to_container(bag, pack, Location::default()).unwrap();
        assert_eq!(
            store.add_to_container(pack, bag, Location::default()),
            Err(ObjectError::WouldNest(pack))
        );
    }

    #[test]
    fn test_equip_layer_occupied() {
        let (mut store, m, _) = store_with_pack();
        let other = store.allocate_item_serial();
        let mut pack2 = Item::new(other, "Backpack", "backpack", 0x0E75);
        pack2.layer = layer::BACKPACK;
        store.insert(Object::Item(pack2));
        assert_eq!(
            store.equip(other, m),
            Err(ObjectError::LayerOccupied { mobile: m, layer: layer::BACKPACK })
        );
    }

    #[test]
    fn test_take_tree_removes_everything() {
        let (mut store, m, pack) = store_with_pack();
        let tree = store.take_tree(m);
        assert_eq!(tree.len(), 2);
        assert!(!store.contains(m));
        assert!(!store.contains(pack));
    }

    #[test]
    fn test_detach_updates_both_sides() {
        let (mut store, m, pack) = store_with_pack();
        store.place_on_ground(pack, Location::new(1, 2, 0), 5).unwrap();
        assert!(store.mobile(m).unwrap().backpack().is_none());
        let item = store.item(pack).unwrap();
        assert!(item.on_ground());
        assert_eq!(item.dropped_at, 5);
    }
}
