// THEORY:
// Compaction: rebuilds the set of items that passed the filter from the
// literal flag values, after every color has finished.
//
// The PASS color of the predicate partition lists exactly the passing
// indices in their original order. `gather` copies the matching vectors into
// one dense buffer for the downstream consumer.

use tracing::debug;

use crate::core_modules::partition::{PredicatePartition, predicate_partition};
use crate::core_modules::region::{FilterFlag, VectorRegion};
use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compaction {
    partition: PredicatePartition<i32>,
    filtered_size: usize,
}

impl Compaction {
    pub fn filtered_size(&self) -> usize {
        self.filtered_size
    }

    /// Indices of the PASS color, ascending.
    pub fn passed(&self) -> &[usize] {
        self.partition.color(&FilterFlag::Pass.raw())
    }

    pub fn partition(&self) -> &PredicatePartition<i32> {
        &self.partition
    }
}

/// Groups every slot by its stored flag. Every flag must have been written.
pub fn compact(vectors: &VectorRegion) -> Result<Compaction> {
    let flags = vectors
        .raw_flags()
        .into_iter()
        .enumerate()
        .map(|(index, flag)| flag.ok_or(PipelineError::FilterIncomplete { index }))
        .collect::<Result<Vec<i32>>>()?;

    let partition = predicate_partition(&flags);
    let filtered_size = partition.size(&FilterFlag::Pass.raw());
    debug!(
        input = flags.len(),
        filtered_size,
        colors = partition.num_colors(),
        "compaction partition built"
    );
    Ok(Compaction {
        partition,
        filtered_size,
    })
}

/// The passing vectors packed densely, row `r` belonging to `indices[r]`.
#[derive(Debug, Clone, PartialEq)]
pub struct CompactedVectors {
    dim: usize,
    indices: Vec<usize>,
    data: Vec<f32>,
}

impl CompactedVectors {
    pub fn empty(dim: usize) -> Self {
        Self {
            dim,
            indices: Vec::new(),
            data: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Original item index of each row.
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn row(&self, row: usize) -> Option<&[f32]> {
        (row < self.len()).then(|| &self.data[row * self.dim..(row + 1) * self.dim])
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }
}

pub fn gather(compaction: &Compaction, vectors: &VectorRegion) -> Result<CompactedVectors> {
    let dim = vectors.dim();
    let indices = compaction.passed().to_vec();
    if let Some(&index) = indices.iter().find(|&&index| !vectors.has_vector(index)) {
        return Err(PipelineError::MissingVector { index });
    }

    let data = vectors.with_dense_vectors(|dense| {
        let mut data = Vec::with_capacity(indices.len() * dim);
        for &index in &indices {
            data.extend_from_slice(&dense[index * dim..(index + 1) * dim]);
        }
        data
    });
    Ok(CompactedVectors { dim, indices, data })
}
