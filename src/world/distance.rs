//! Memoized tile distances

use dashmap::DashMap;
use serde::Serialize;

use super::coords::Coordinate;

/// Distance between two tiles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DistanceResult {
    /// `max(|dx|,|dy|) + floor(min(|dx|,|dy|) / 2)`, no square root needed
    pub approximate: u64,
    /// Euclidean distance rounded to the nearest tile
    pub exact: u64,
    /// True when `exact` was not computed and holds `approximate`
    pub used_approximation: bool,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    approximate: u64,
    exact: u64,
}

/// Process-wide distance memo.
///
/// Keys are normalized so `(a, b)` and `(b, a)` share one entry. Coordinates
/// never move, so entries never go stale. With a non-zero `max_entries` an
/// arbitrary entry is evicted once the cap is reached.
#[derive(Debug, Default)]
pub struct DistanceCache {
    entries: DashMap<(Coordinate, Coordinate), Entry>,
    max_entries: usize,
}

impl DistanceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity_limit(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries,
        }
    }

    /// Exact distance, computing and caching it if needed
    pub fn exact(&self, a: Coordinate, b: Coordinate) -> u64 {
        self.distance(a, b, false, 0).exact
    }

    /// Distance between `a` and `b`.
    ///
    /// With `allow_approximate`, the square root is skipped when the
    /// heuristic's worst-case overshoot (`floor(min / 2)` tiles) is within
    /// `approximation_threshold`.
    pub fn distance(
        &self,
        a: Coordinate,
        b: Coordinate,
        allow_approximate: bool,
        approximation_threshold: u64,
    ) -> DistanceResult {
        let (dx, dy) = a.abs_delta(&b);
        let (major, minor) = if dx >= dy { (dx, dy) } else { (dy, dx) };
        let approximate = major + minor / 2;

        if allow_approximate && minor / 2 <= approximation_threshold {
            return DistanceResult {
                approximate,
                exact: approximate,
                used_approximation: true,
            };
        }

        let key = if a <= b { (a, b) } else { (b, a) };
        if let Some(entry) = self.entries.get(&key) {
            return DistanceResult {
                approximate: entry.approximate,
                exact: entry.exact,
                used_approximation: false,
            };
        }

        let exact = euclidean(dx, dy);
        self.evict_if_full();
        self.entries.insert(key, Entry { approximate, exact });

        DistanceResult {
            approximate,
            exact,
            used_approximation: false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_if_full(&self) {
        if self.max_entries == 0 || self.entries.len() < self.max_entries {
            return;
        }
        let victim = self.entries.iter().next().map(|e| *e.key());
        if let Some(key) = victim {
            self.entries.remove(&key);
        }
    }
}

fn euclidean(dx: u64, dy: u64) -> u64 {
    let (dx, dy) = (dx as f64, dy as f64);
    (dx * dx + dy * dy).sqrt().round() as u64
}
