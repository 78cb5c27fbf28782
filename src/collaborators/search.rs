// THEORY:
// Downstream nearest-neighbor hand-off. Only the sizing and layout of the
// result region matter to the pipeline; the search itself is external.

use std::fmt::Debug;

use crate::core_modules::compaction::CompactedVectors;
use crate::error::SearchError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    /// Row in the compacted vectors, `u32::MAX` when unset.
    pub index: u32,
    pub distance: f32,
}

impl Neighbor {
    pub const EMPTY: Neighbor = Neighbor {
        index: u32::MAX,
        distance: f32::INFINITY,
    };
}

/// `rows x k` neighbor slots, one row per compacted vector.
#[derive(Debug, Clone, PartialEq)]
pub struct KnnRegion {
    rows: usize,
    k: usize,
    neighbors: Vec<Neighbor>,
}

impl KnnRegion {
    pub fn new(rows: usize, k: usize) -> Self {
        Self {
            rows,
            k,
            neighbors: vec![Neighbor::EMPTY; rows * k],
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn row(&self, row: usize) -> Option<&[Neighbor]> {
        (row < self.rows).then(|| &self.neighbors[row * self.k..(row + 1) * self.k])
    }

    pub fn row_mut(&mut self, row: usize) -> Option<&mut [Neighbor]> {
        (row < self.rows).then(|| &mut self.neighbors[row * self.k..(row + 1) * self.k])
    }
}

pub trait NeighborSearch: Send + Sync + Debug {
    fn search(&self, vectors: &CompactedVectors, out: &mut KnnRegion) -> Result<(), SearchError>;
}

/// Checks the hand-off layout and leaves every slot empty.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSearch;

impl NeighborSearch for NoopSearch {
    fn search(&self, vectors: &CompactedVectors, out: &mut KnnRegion) -> Result<(), SearchError> {
        if out.rows() != vectors.len() {
            return Err(SearchError::RegionSize {
                expected: vectors.len(),
                actual: out.rows(),
            });
        }
        Ok(())
    }
}
