//! Chunk layout planning under a memory budget.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::PlanError;

const MIB: u64 = 1024 * 1024;

/// Bounds the planner works within.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkLimits {
    /// Smallest chunk the server accepts (except for single-chunk files).
    pub min_chunk_size: u64,
    /// Largest chunk the server accepts.
    pub max_chunk_size: u64,
    /// Chunk count the planner aims for before clamping.
    pub optimal_chunk_count: u64,
    /// Hard cap on chunks per session.
    pub max_chunk_count: u64,
    /// Cap on concurrently transmitted chunks.
    pub max_parallel_chunks: u32,
}

impl Default for ChunkLimits {
    fn default() -> Self {
        Self {
            min_chunk_size: MIB,
            max_chunk_size: 50 * MIB,
            optimal_chunk_count: 200,
            max_chunk_count: 10_000,
            max_parallel_chunks: 4,
        }
    }
}

impl ChunkLimits {
    /// Largest file that can be chunked under these limits.
    pub fn max_file_size(&self) -> u64 {
        self.max_chunk_size.saturating_mul(self.max_chunk_count)
    }
}

/// How a file is cut into chunks and how many travel at once.
///
/// Derived from `(file_size, chunk_size)` and never persisted on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLayout {
    pub file_size: u64,
    pub chunk_size: u64,
    pub total_chunks: u32,
    pub parallelism: u32,
}

/// One contiguous byte range of the source, numbered from 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkDescriptor {
    pub index: u32,
    pub offset: u64,
    pub length: u64,
    pub already_accepted: bool,
}

impl ChunkLayout {
    /// Length of chunk `index` (1-based), or `None` when out of range.
    ///
    /// The last chunk holds the remainder, or a full chunk when the file size
    /// is an exact multiple of the chunk size.
    pub fn chunk_length(&self, index: u32) -> Option<u64> {
        if index == 0 || index > self.total_chunks {
            return None;
        }
        let offset = u64::from(index - 1) * self.chunk_size;
        Some((self.file_size - offset).min(self.chunk_size))
    }

    /// Describes chunk `index` (1-based).
    pub fn chunk(&self, index: u32) -> Option<ChunkDescriptor> {
        let length = self.chunk_length(index)?;
        Some(ChunkDescriptor {
            index,
            offset: u64::from(index - 1) * self.chunk_size,
            length,
            already_accepted: false,
        })
    }

    /// Describes every chunk in index order, flagging those in `accepted`.
    pub fn descriptors(&self, accepted: &BTreeSet<u32>) -> Vec<ChunkDescriptor> {
        (1..=self.total_chunks)
            .filter_map(|index| self.chunk(index))
            .map(|mut chunk| {
                chunk.already_accepted = accepted.contains(&chunk.index);
                chunk
            })
            .collect()
    }

    /// Returns a copy with parallelism capped at `max` (at least 1).
    pub fn with_max_parallelism(mut self, max: u32) -> Self {
        self.parallelism = self.parallelism.min(max.max(1));
        self
    }
}

/// Derives chunk layouts. Pure and deterministic.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChunkPlanner {
    limits: ChunkLimits,
}

impl ChunkPlanner {
    pub fn new(limits: ChunkLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &ChunkLimits {
        &self.limits
    }

    /// Computes the layout of a `file_size`-byte file.
    ///
    /// `forced_chunk_size` pins the chunk size of an existing session; the
    /// memory budget then only affects parallelism.
    pub fn compute_layout(
        &self,
        file_size: u64,
        memory_budget: u64,
        forced_chunk_size: Option<u64>,
    ) -> Result<ChunkLayout, PlanError> {
        if file_size == 0 {
            return Err(PlanError::EmptyFile);
        }
        if memory_budget == 0 {
            return Err(PlanError::NoMemoryBudget);
        }

        let limits = &self.limits;
        let chunk_size = match forced_chunk_size {
            Some(size) => {
                if size < limits.min_chunk_size || size > limits.max_chunk_size {
                    return Err(PlanError::IllegalLayout(format!(
                        "chunk size {size} outside [{}, {}]",
                        limits.min_chunk_size, limits.max_chunk_size
                    )));
                }
                size
            }
            None => self.plan_chunk_size(file_size, memory_budget)?,
        };

        let total_chunks = file_size.div_ceil(chunk_size);
        if total_chunks > limits.max_chunk_count {
            return Err(PlanError::IllegalLayout(format!(
                "{total_chunks} chunks exceed the limit of {}",
                limits.max_chunk_count
            )));
        }
        let total_chunks = u32::try_from(total_chunks)
            .map_err(|_| PlanError::IllegalLayout(format!("{total_chunks} chunks")))?;

        let parallelism = if total_chunks == 1 {
            1
        } else {
            let cap = total_chunks.min(limits.max_parallel_chunks.max(1));
            let fits = u32::try_from(memory_budget / chunk_size).unwrap_or(u32::MAX);
            fits.clamp(1, cap)
        };

        Ok(ChunkLayout {
            file_size,
            chunk_size,
            total_chunks,
            parallelism,
        })
    }

    fn plan_chunk_size(&self, file_size: u64, memory_budget: u64) -> Result<u64, PlanError> {
        let limits = &self.limits;

        // Smallest chunk that keeps the count under the cap.
        let needed = file_size.div_ceil(limits.max_chunk_count.max(1));
        if needed > limits.max_chunk_size {
            return Err(PlanError::FileTooLarge {
                file_size,
                max_file_size: limits.max_file_size(),
            });
        }

        let half_budget = memory_budget / 2;
        if file_size <= limits.max_chunk_size && file_size <= half_budget {
            return Ok(file_size.clamp(limits.min_chunk_size, limits.max_chunk_size));
        }

        let target = file_size
            .div_ceil(limits.optimal_chunk_count.max(1))
            .clamp(limits.min_chunk_size, limits.max_chunk_size)
            .max(needed);

        // Two buffers must fit in the budget, but never go under the minimum
        // chunk or past the chunk-count cap.
        let memory_cap = half_budget.max(limits.min_chunk_size).max(needed);
        Ok(target.min(memory_cap))
    }
}
