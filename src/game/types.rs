//! Shared game value types: serials, locations, directions and logical time.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical time in world ticks.
pub type Tick = u64;

/// Unique object identifier.
///
/// Mobiles and items live in two disjoint keyspaces; items carry
/// [`Serial::ITEM_TAG`]. Zero is never a live object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Serial(pub u32);

impl Serial {
    pub const NONE: Serial = Serial(0);
    pub const ITEM_TAG: u32 = 0x4000_0000;
    pub const MOBILE_MAX: u32 = 0x3FFF_FFFF;
    pub const ITEM_MAX: u32 = 0x7FFF_FFFF;

    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    pub fn is_item(self) -> bool {
        self.0 & Self::ITEM_TAG != 0 && self.0 <= Self::ITEM_MAX
    }

    pub fn is_mobile(self) -> bool {
        self.0 != 0 && self.0 <= Self::MOBILE_MAX
    }
}

impl fmt::Display for Serial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

/// A tile position on the map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Location {
    pub x: i16,
    pub y: i16,
    pub z: i8,
}

impl Location {
    pub const fn new(x: i16, y: i16, z: i8) -> Self {
        Self { x, y, z }
    }

    /// Chebyshev distance on the x/y plane; z is ignored for visibility.
    pub fn distance(&self, other: &Location) -> u16 {
        let dx = (self.x as i32 - other.x as i32).unsigned_abs();
        let dy = (self.y as i32 - other.y as i32).unsigned_abs();
        dx.max(dy).min(u16::MAX as u32) as u16
    }

    pub fn in_range(&self, other: &Location, range: u16) -> bool {
        self.distance(other) <= range
    }

    /// The neighbouring tile in `dir`.
    pub fn step(&self, dir: Direction) -> Location {
        let (dx, dy) = dir.offset();
        Location::new(self.x.wrapping_add(dx), self.y.wrapping_add(dy), self.z)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{},{})", self.x, self.y, self.z)
    }
}

/// Facing / walking direction. The wire value may carry a running flag (0x80).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum Direction {
    #[default]
    North = 0,
    NorthEast = 1,
    East = 2,
    SouthEast = 3,
    South = 4,
    SouthWest = 5,
    West = 6,
    NorthWest = 7,
}

impl Direction {
    pub const RUNNING: u8 = 0x80;

    /// Decodes the low three bits; the running flag is ignored.
    pub fn from_wire(value: u8) -> Direction {
        match value & 0x07 {
            0 => Direction::North,
            1 => Direction::NorthEast,
            2 => Direction::East,
            3 => Direction::SouthEast,
            4 => Direction::South,
            5 => Direction::SouthWest,
            6 => Direction::West,
            _ => Direction::NorthWest,
        }
    }

    pub fn offset(self) -> (i16, i16) {
        match self {
            Direction::North => (0, -1),
            Direction::NorthEast => (1, -1),
            Direction::East => (1, 0),
            Direction::SouthEast => (1, 1),
            Direction::South => (0, 1),
            Direction::SouthWest => (-1, 1),
            Direction::West => (-1, 0),
            Direction::NorthWest => (-1, -1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_keyspaces() {
        assert!(Serial(1).is_mobile());
        assert!(!Serial(1).is_item());
        assert!(Serial(0x4000_0001).is_item());
        assert!(!Serial(0x4000_0001).is_mobile());
        assert!(!Serial::NONE.is_mobile());
        assert!(!Serial::NONE.is_item());
        assert!(Serial::NONE.is_none());
    }

    #[test]
    fn test_serial_display() {
        assert_eq!(Serial(0x4000_00AB).to_string(), "0x400000AB");
    }

    #[test]
    fn test_location_distance_is_chebyshev() {
        let a = Location::new(10, 10, 0);
        assert_eq!(a.distance(&Location::new(13, 11, 50)), 3);
        assert!(a.in_range(&Location::new(28, 10, 0), 18));
        assert!(!a.in_range(&Location::new(29, 10, 0), 18));
    }

    #[test]
    fn test_step_and_running_flag() {
        let a = Location::new(5, 5, 0);
        assert_eq!(a.step(Direction::from_wire(0x80 | 2)), Location::new(6, 5, 0));
        assert_eq!(a.step(Direction::NorthWest), Location::new(4, 4, 0));
    }
}
