//! Count-Min sketch with reversible cells
//!
//! A `depth x width` grid of counting cells, generic over the per-cell
//! value. The destination sketch stores [`VictimCell`] aggregates, the
//! source sketch bare [`BitCount`] counters; both can reconstruct the
//! dominant key hashed into a cell, which is what makes heavy-hitter
//! recovery possible without a side heap.

pub mod bitcount;
pub mod victim;

pub use bitcount::BitCount;
pub use victim::VictimCell;

use serde::{Deserialize, Serialize};

use crate::models::FlowRecord;

/// Value carried alongside the counter in every sketch cell.
pub trait CellValue: Clone + Default {
    /// Payload handed to the cell on every update.
    type Update;

    fn absorb(&mut self, key: u32, update: &Self::Update);
    fn merge(&mut self, other: &Self);
    fn saturating_sub_assign(&mut self, other: &Self);
}

impl CellValue for BitCount {
    type Update = u16;

    fn absorb(&mut self, key: u32, update: &u16) {
        self.update(key, *update);
    }

    fn merge(&mut self, other: &Self) {
        BitCount::merge(self, other)
    }

    fn saturating_sub_assign(&mut self, other: &Self) {
        BitCount::saturating_sub_assign(self, other)
    }
}

impl CellValue for VictimCell {
    type Update = FlowRecord;

    fn absorb(&mut self, _key: u32, update: &FlowRecord) {
        self.update(update);
    }

    fn merge(&mut self, other: &Self) {
        VictimCell::merge(self, other)
    }

    fn saturating_sub_assign(&mut self, other: &Self) {
        VictimCell::saturating_sub_assign(self, other)
    }
}

/// One sketch cell: an update counter plus the domain value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Cell<V> {
    pub count: u32,
    pub value: V,
}

/// Count-Min sketch over host-order IPv4 keys.
///
/// With `conservative` set, updates only touch the cells sitting at the
/// current minimum for the key (classic conservative update). The
/// `learning` flag disables that optimisation so a warm-up phase counts
/// plainly in every row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountMinSketch<V> {
    depth: usize,
    width: usize,
    conservative: bool,
    learning: bool,
    seeds: Vec<(u64, u64)>,
    rows: Vec<Vec<Cell<V>>>,
}

/// splitmix64 step, used to derive per-row seed pairs from the base seed.
fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

impl<V: CellValue> CountMinSketch<V> {
    pub fn new(depth: usize, width: usize, conservative: bool, learning: bool, seed: u64) -> Self {
        let mut state = seed;
        let seeds = (0..depth)
            .map(|_| (splitmix64(&mut state), splitmix64(&mut state)))
            .collect();
        Self {
            depth,
            width,
            conservative,
            learning,
            seeds,
            rows: vec![vec![Cell::default(); width]; depth],
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Column for `key` in `row`.
    pub fn col(&self, key: u32, row: usize) -> usize {
        let (s1, s2) = self.seeds[row];
        let mut x = u64::from(key) ^ s1;
        x ^= x >> 33;
        x = x.wrapping_mul(0xFF51_AFD7_ED55_8CCD);
        x ^= x >> 33;
        x = x.wrapping_mul(s2 | 1);
        x ^= x >> 29;
        (x % self.width as u64) as usize
    }

    pub fn cell(&self, row: usize, col: usize) -> &Cell<V> {
        &self.rows[row][col]
    }

    pub fn cell_mut(&mut self, row: usize, col: usize) -> &mut Cell<V> {
        &mut self.rows[row][col]
    }

    /// Record one occurrence of `key` carrying `update`.
    pub fn update(&mut self, key: u32, update: &V::Update) {
        if self.conservative && !self.learning {
            let min = (0..self.depth)
                .map(|r| self.rows[r][self.col(key, r)].count)
                .min()
                .unwrap_or(0);
            for row in 0..self.depth {
                let col = self.col(key, row);
                let cell = &mut self.rows[row][col];
                if cell.count == min {
                    cell.count = cell.count.saturating_add(1);
                    cell.value.absorb(key, update);
                }
            }
        } else {
            for row in 0..self.depth {
                let col = self.col(key, row);
                let cell = &mut self.rows[row][col];
                cell.count = cell.count.saturating_add(1);
                cell.value.absorb(key, update);
            }
        }
    }

    /// Locate the minimum-count cell for `key`: the least-collided view.
    pub fn estimate(&self, key: u32) -> (usize, usize) {
        let mut best = (0, self.col(key, 0));
        let mut best_count = self.rows[best.0][best.1].count;
        for row in 1..self.depth {
            let col = self.col(key, row);
            let count = self.rows[row][col].count;
            if count < best_count {
                best = (row, col);
                best_count = count;
            }
        }
        best
    }

    /// Subtract a recovered cell from every row of `key`, saturating.
    pub fn subtract(&mut self, key: u32, snapshot: &Cell<V>) {
        for row in 0..self.depth {
            let col = self.col(key, row);
            let cell = &mut self.rows[row][col];
            cell.count = cell.count.saturating_sub(snapshot.count);
            cell.value.saturating_sub_assign(&snapshot.value);
        }
    }

    /// Zero every cell, keeping the hash seeds so column indices remain
    /// stable across windows.
    pub fn reset(&mut self) {
        for row in self.rows.iter_mut() {
            for cell in row.iter_mut() {
                cell.count = 0;
                cell.value = V::default();
            }
        }
    }

    /// True when no update has landed since the last reset.
    pub fn is_empty(&self) -> bool {
        self.rows
            .iter()
            .all(|row| row.iter().all(|cell| cell.count == 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn src_sketch(width: usize) -> CountMinSketch<BitCount> {
        CountMinSketch::new(3, width, false, true, 0xF100D)
    }

    #[test]
    fn test_columns_are_deterministic_per_seed() {
        let a = src_sketch(1024);
        let b = src_sketch(1024);
        for key in [0u32, 1, 0x0A00_0001, 0xFFFF_FFFF] {
            for row in 0..3 {
                assert_eq!(a.col(key, row), b.col(key, row));
            }
        }
    }

    #[test]
    fn test_estimate_returns_minimum_row() {
        let mut sketch = src_sketch(64);
        for _ in 0..5 {
            sketch.update(42, &1);
        }
        // force extra mass into row 0 at the key's column
        let col0 = sketch.col(42, 0);
        sketch.rows[0][col0].count += 100;
        let (row, col) = sketch.estimate(42);
        let min = (0..3)
            .map(|r| sketch.cell(r, sketch.col(42, r)).count)
            .min()
            .unwrap();
        assert_eq!(sketch.cell(row, col).count, min);
    }

    #[test]
    fn test_update_then_reverse_recovers_key() {
        let mut sketch = src_sketch(4096);
        let key = 0xC633_6401; // 198.51.100.1
        for _ in 0..10 {
            sketch.update(key, &1);
        }
        let (row, col) = sketch.estimate(key);
        assert_eq!(sketch.cell(row, col).value.reverse_key(), key);
    }

    #[test]
    fn test_subtract_saturates_to_empty() {
        let mut sketch = src_sketch(64);
        sketch.update(7, &1);
        let (row, col) = sketch.estimate(7);
        let snapshot = sketch.cell(row, col).clone();
        sketch.subtract(7, &snapshot);
        sketch.subtract(7, &snapshot);
        let (row, col) = sketch.estimate(7);
        assert_eq!(sketch.cell(row, col).count, 0);
    }

    #[test]
    fn test_reset_clears_but_keeps_seeds() {
        let mut sketch = src_sketch(64);
        let col_before = sketch.col(9, 2);
        sketch.update(9, &1);
        assert!(!sketch.is_empty());
        sketch.reset();
        assert!(sketch.is_empty());
        assert_eq!(sketch.col(9, 2), col_before);
    }

    #[test]
    fn test_conservative_update_tracks_true_count() {
        let mut sketch: CountMinSketch<BitCount> = CountMinSketch::new(3, 64, true, false, 1);
        for _ in 0..20 {
            sketch.update(5, &1);
        }
        let (row, col) = sketch.estimate(5);
        assert_eq!(sketch.cell(row, col).count, 20);
    }

    #[test]
    fn test_distinct_keys_recovered_from_their_columns() {
        let mut sketch = src_sketch(32768);
        let keys: Vec<u32> = (0..50).map(|i| 0x0A00_0000 + i * 257).collect();
        for &key in &keys {
            for _ in 0..20 {
                sketch.update(key, &1);
            }
        }
        let mut recovered = 0;
        for &key in &keys {
            let (row, col) = sketch.estimate(key);
            let cell = sketch.cell(row, col);
            // skip cells polluted by a collision
            if cell.count == 20 && cell.value.reverse_key() == key {
                recovered += 1;
            }
        }
        assert!(recovered >= 48, "only {} of 50 keys recovered", recovered);
    }
}
