//! Spatial index for top-level objects (mobiles and ground items).
//!
//! The map is split into 8x8 chunks; range queries visit only the chunks
//! that overlap the query square.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use super::types::{Location, Serial, Tick};

pub const CHUNK_SIZE: i16 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapMeta {
    pub width: u16,
    pub height: u16,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MapError {
    #[error("{0} is not on the map")]
    NotPlaced(Serial),

    #[error("{0} is out of bounds")]
    OutOfBounds(Location),
}

type ChunkKey = (i16, i16);

#[derive(Debug)]
pub struct GameMap {
    meta: MapMeta,
    chunks: HashMap<ChunkKey, HashSet<Serial>>,
    placed: HashMap<Serial, Location>,
}

fn chunk_of(loc: &Location) -> ChunkKey {
    (loc.x.div_euclid(CHUNK_SIZE), loc.y.div_euclid(CHUNK_SIZE))
}

impl GameMap {
    pub fn new(meta: MapMeta) -> Self {
        Self {
            meta,
            chunks: HashMap::new(),
            placed: HashMap::new(),
        }
    }

    pub fn meta(&self) -> MapMeta {
        self.meta
    }

    pub fn len(&self) -> usize {
        self.placed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.placed.is_empty()
    }

    pub fn in_bounds(&self, loc: &Location) -> bool {
        loc.x >= 0
            && loc.y >= 0
            && (loc.x as u32) < self.meta.width as u32
            && (loc.y as u32) < self.meta.height as u32
    }

    /// Pulls an out-of-bounds location onto the nearest edge tile.
    pub fn clamp(&self, loc: Location) -> Location {
        let max_x = (self.meta.width as i32 - 1).clamp(0, i16::MAX as i32) as i16;
        let max_y = (self.meta.height as i32 - 1).clamp(0, i16::MAX as i32) as i16;
        Location::new(loc.x.clamp(0, max_x), loc.y.clamp(0, max_y), loc.z)
    }

    pub fn location_of(&self, serial: Serial) -> Option<Location> {
        self.placed.get(&serial).copied()
    }

    pub fn contains(&self, serial: Serial) -> bool {
        self.placed.contains_key(&serial)
    }

    /// Places an object unconditionally, clamped onto the map. Replaces any
    /// previous position.
    pub fn force_add_object(&mut self, serial: Serial, loc: Location) -> Location {
        let loc = self.clamp(loc);
        self.remove_object(serial);
        self.chunks.entry(chunk_of(&loc)).or_default().insert(serial);
        self.placed.insert(serial, loc);
        loc
    }

    pub fn remove_object(&mut self, serial: Serial) -> Option<Location> {
        let loc = self.placed.remove(&serial)?;
        let key = chunk_of(&loc);
        if let Some(chunk) = self.chunks.get_mut(&key) {
            chunk.remove(&serial);
            if chunk.is_empty() {
                self.chunks.remove(&key);
            }
        }
        Some(loc)
    }

    /// Moves a placed object. Returns the previous location.
    pub fn move_object(&mut self, serial: Serial, to: Location) -> Result<Location, MapError> {
        if !self.in_bounds(&to) {
            return Err(MapError::OutOfBounds(to));
        }
        let from = self.location_of(serial).ok_or(MapError::NotPlaced(serial))?;
        if chunk_of(&from) == chunk_of(&to) {
            self.placed.insert(serial, to);
        } else {
            self.force_add_object(serial, to);
        }
        Ok(from)
    }

    /// Every placed object within `range` tiles of `center`.
    pub fn objects_in_range(&self, center: &Location, range: u16) -> Vec<Serial> {
        let range_i = range.min(i16::MAX as u16) as i16;
        let (cx0, cy0) = chunk_of(&Location::new(
            center.x.saturating_sub(range_i),
            center.y.saturating_sub(range_i),
            0,
        ));
        let (cx1, cy1) = chunk_of(&Location::new(
            center.x.saturating_add(range_i),
            center.y.saturating_add(range_i),
            0,
        ));

        let mut out = Vec::new();
        for cx in cx0..=cx1 {
            for cy in cy0..=cy1 {
                let Some(chunk) = self.chunks.get(&(cx, cy)) else {
                    continue;
                };
                for serial in chunk {
                    if let Some(loc) = self.placed.get(serial) {
                        if loc.in_range(center, range) {
                            out.push(*serial);
                        }
                    }
                }
            }
        }
        out.sort_unstable();
        out
    }

    pub fn mobiles_in_range(&self, center: &Location, range: u16) -> Vec<Serial> {
        let mut out = self.objects_in_range(center, range);
        out.retain(|s| s.is_mobile());
        out
    }

    /// Ground items in the chunks scheduled for this tick.
    ///
    /// Chunks are spread over `spread` ticks so each chunk is visited once
    /// per cycle, not all on the same tick.
    pub fn chunk_items_due(&self, now: Tick, spread: u64) -> Vec<Serial> {
        let spread = spread.max(1);
        let slot = now % spread;
        let mut out: Vec<Serial> = self
            .chunks
            .iter()
            .filter(|(key, _)| chunk_slot(key, spread) == slot)
            .flat_map(|(_, chunk)| chunk.iter().copied())
            .filter(|s| s.is_item())
            .collect();
        out.sort_unstable();
        out
    }

    /// Placed serials with their locations, sorted; the saved map section.
    pub fn placements(&self) -> Vec<(Serial, Location)> {
        let mut out: Vec<(Serial, Location)> =
            self.placed.iter().map(|(s, l)| (*s, *l)).collect();
        out.sort_unstable_by_key(|(s, _)| *s);
        out
    }
}

fn chunk_slot(key: &ChunkKey, spread: u64) -> u64 {
    let h = (key.0 as i64 as u64).wrapping_mul(0x9E37_79B9) ^ (key.1 as i64 as u64);
    h % spread
}
