//! Map coordinates

use serde::{Deserialize, Serialize};

/// Tile position on the world map. Immutable once assigned to a village.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Coordinate {
    pub x: i32,
    pub y: i32,
}

impl Coordinate {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Absolute per-axis offsets to another tile
    pub fn abs_delta(&self, other: &Coordinate) -> (u64, u64) {
        (
            (i64::from(self.x) - i64::from(other.x)).unsigned_abs(),
            (i64::from(self.y) - i64::from(other.y)).unsigned_abs(),
        )
    }
}

impl std::fmt::Display for Coordinate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}|{})", self.x, self.y)
    }
}

/// Square world extent centred on the origin: `-radius..=radius` on both axes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldBounds {
    pub radius: i32,
}

impl WorldBounds {
    pub fn new(radius: i32) -> Self {
        Self { radius }
    }

    pub fn contains(&self, coord: &Coordinate) -> bool {
        (-self.radius..=self.radius).contains(&coord.x)
            && (-self.radius..=self.radius).contains(&coord.y)
    }
}

impl Default for WorldBounds {
    fn default() -> Self {
        Self { radius: 200 }
    }
}
