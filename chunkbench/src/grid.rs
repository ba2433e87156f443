//! Chunk enumeration over a regular chunk grid.
//!
//! A [`ChunkGrid`] pairs an array shape with a chunk (or shard) shape and yields the
//! [`ChunkIndex`]es covering the array in row-major order (first dimension slowest).
//! The [`ChunkRegion`] of an index is always recomputed from the grid, never stored.

use std::{num::NonZeroU64, ops::Range};

/// Position of one chunk in the chunk grid, one entry per dimension.
pub type ChunkIndex = Vec<u64>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShapeError {
    #[error("array shape {array_shape:?} and chunk shape {chunk_shape:?} differ in dimensionality")]
    ShapeMismatch {
        array_shape: Vec<u64>,
        chunk_shape: Vec<u64>,
    },
    #[error("invalid {which} shape {shape:?}: need at least one dimension, all positive")]
    InvalidShape { which: &'static str, shape: Vec<u64> },
    #[error("chunk grid {grid_shape:?} has more chunks than fit in a u64")]
    GridOverflow { grid_shape: Vec<u64> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkGrid {
    array_shape: Vec<NonZeroU64>,
    chunk_shape: Vec<NonZeroU64>,
    grid_shape: Vec<u64>,
    num_chunks: u64,
}

fn validate(which: &'static str, shape: &[u64]) -> Result<Vec<NonZeroU64>, ShapeError> {
    let invalid = || ShapeError::InvalidShape {
        which,
        shape: shape.to_vec(),
    };
    if shape.is_empty() {
        return Err(invalid());
    }
    shape
        .iter()
        .map(|&d| NonZeroU64::new(d).ok_or_else(invalid))
        .collect()
}

impl ChunkGrid {
    pub fn new(array_shape: &[u64], chunk_shape: &[u64]) -> Result<Self, ShapeError> {
        if array_shape.len() != chunk_shape.len() {
            return Err(ShapeError::ShapeMismatch {
                array_shape: array_shape.to_vec(),
                chunk_shape: chunk_shape.to_vec(),
            });
        }
        let array_shape = validate("array", array_shape)?;
        let chunk_shape = validate("chunk", chunk_shape)?;
        let grid_shape: Vec<u64> = std::iter::zip(&array_shape, &chunk_shape)
            .map(|(a, c)| a.get().div_ceil(c.get()))
            .collect();
        let num_chunks = grid_shape
            .iter()
            .try_fold(1u64, |acc, &n| acc.checked_mul(n))
            .ok_or_else(|| ShapeError::GridOverflow {
                grid_shape: grid_shape.clone(),
            })?;
        Ok(Self {
            array_shape,
            chunk_shape,
            grid_shape,
            num_chunks,
        })
    }

    pub fn dimensionality(&self) -> usize {
        self.array_shape.len()
    }

    pub fn array_shape(&self) -> Vec<u64> {
        self.array_shape.iter().map(|d| d.get()).collect()
    }

    pub fn chunk_shape(&self) -> Vec<u64> {
        self.chunk_shape.iter().map(|d| d.get()).collect()
    }

    /// Number of chunks along each dimension.
    pub fn grid_shape(&self) -> &[u64] {
        &self.grid_shape
    }

    pub fn num_chunks(&self) -> u64 {
        self.num_chunks
    }

    /// Number of elements in the whole array.
    pub fn num_elements(&self) -> u64 {
        self.array_shape
            .iter()
            .fold(1u64, |acc, d| acc.saturating_mul(d.get()))
    }

    /// Iterate all chunk indices in row-major order.
    ///
    /// Each call starts a fresh enumeration.
    pub fn indices(&self) -> ChunkIndices {
        ChunkIndices {
            grid_shape: self.grid_shape.clone(),
            next: 0,
            end: self.num_chunks,
        }
    }

    /// The region of the array covered by `index`.
    ///
    /// Returns `None` if `index` has the wrong dimensionality or lies outside the grid.
    /// The last chunk along a dimension is clipped to the array bounds.
    pub fn region(&self, index: &[u64]) -> Option<ChunkRegion> {
        if index.len() != self.dimensionality() {
            return None;
        }
        let ranges = itertools::izip!(index, &self.grid_shape, &self.chunk_shape, &self.array_shape)
            .map(|(&i, &n, c, a)| {
                if i >= n {
                    return None;
                }
                let start = i * c.get();
                Some(start..std::cmp::min(a.get(), start + c.get()))
            })
            .collect::<Option<Vec<_>>>()?;
        Some(ChunkRegion { ranges })
    }
}

/// Enumerate the chunks covering `array_shape` when split into `chunk_shape` sized chunks.
pub fn enumerate_chunks(array_shape: &[u64], chunk_shape: &[u64]) -> Result<ChunkIndices, ShapeError> {
    Ok(ChunkGrid::new(array_shape, chunk_shape)?.indices())
}

/// Row-major iterator over the chunk indices of a [`ChunkGrid`].
#[derive(Debug, Clone)]
pub struct ChunkIndices {
    grid_shape: Vec<u64>,
    next: u64,
    end: u64,
}

fn unravel(mut linear: u64, shape: &[u64]) -> ChunkIndex {
    let mut index = vec![0; shape.len()];
    for (i, &dim) in index.iter_mut().rev().zip(shape.iter().rev()) {
        *i = linear % dim;
        linear /= dim;
    }
    index
}

impl Iterator for ChunkIndices {
    type Item = ChunkIndex;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.end {
            return None;
        }
        let index = unravel(self.next, &self.grid_shape);
        self.next += 1;
        Some(index)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = usize::try_from(self.end - self.next).unwrap_or(usize::MAX);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for ChunkIndices {}

/// Per-dimension half-open element ranges of one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRegion {
    ranges: Vec<Range<u64>>,
}

impl ChunkRegion {
    pub fn ranges(&self) -> &[Range<u64>] {
        &self.ranges
    }

    pub fn shape(&self) -> Vec<u64> {
        self.ranges.iter().map(|r| r.end - r.start).collect()
    }

    pub fn num_elements(&self) -> u64 {
        self.ranges.iter().map(|r| r.end - r.start).product()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn one_dimensional_with_remainder() {
        let grid = ChunkGrid::new(&[10], &[3]).unwrap();
        let indices: Vec<_> = grid.indices().collect();
        assert_eq!(indices, vec![vec![0], vec![1], vec![2], vec![3]]);
        let regions: Vec<_> = indices
            .iter()
            .map(|i| grid.region(i).unwrap().ranges()[0].clone())
            .collect();
        assert_eq!(regions, vec![0..3, 3..6, 6..9, 9..10]);
    }

    #[test]
    fn row_major_order() {
        let indices: Vec<_> = enumerate_chunks(&[4, 6], &[2, 3]).unwrap().collect();
        assert_eq!(
            indices,
            vec![vec![0, 0], vec![0, 1], vec![1, 0], vec![1, 1]]
        );
    }

    #[test]
    fn enumeration_is_restartable() {
        let grid = ChunkGrid::new(&[7, 5, 3], &[2, 2, 2]).unwrap();
        let first: Vec<_> = grid.indices().collect();
        let second: Vec<_> = grid.indices().collect();
        assert_eq!(first, second);
        let iter = grid.indices();
        assert_eq!(iter.clone().collect::<Vec<_>>(), iter.collect::<Vec<_>>());
    }

    #[test]
    fn regions_tile_the_domain() {
        for (array_shape, chunk_shape) in [
            (vec![10u64], vec![3u64]),
            (vec![9, 4], vec![3, 4]),
            (vec![5, 7, 3], vec![2, 3, 5]),
            (vec![1, 1], vec![8, 8]),
        ] {
            let grid = ChunkGrid::new(&array_shape, &chunk_shape).unwrap();
            let expected: u64 = array_shape
                .iter()
                .zip(&chunk_shape)
                .map(|(a, c)| a.div_ceil(*c))
                .product();
            let indices: Vec<_> = grid.indices().collect();
            assert_eq!(indices.len() as u64, expected);
            assert_eq!(grid.indices().len() as u64, expected);
            assert_eq!(indices.iter().collect::<HashSet<_>>().len(), indices.len());

            // every element is covered by exactly one region
            let mut covered = vec![0u32; grid.num_elements() as usize];
            for index in &indices {
                let region = grid.region(index).unwrap();
                for element in ChunkGrid::new(&region.shape(), &vec![1; region.shape().len()])
                    .unwrap()
                    .indices()
                {
                    let mut linear = 0u64;
                    for ((offset, range), dim) in element.iter().zip(region.ranges()).zip(&array_shape)
                    {
                        linear = linear * dim + range.start + offset;
                    }
                    covered[linear as usize] += 1;
                }
            }
            assert!(covered.iter().all(|&c| c == 1), "{array_shape:?} {chunk_shape:?}");
        }
    }

    #[test]
    fn region_out_of_grid() {
        let grid = ChunkGrid::new(&[10, 10], &[5, 5]).unwrap();
        assert!(grid.region(&[2, 0]).is_none());
        assert!(grid.region(&[0]).is_none());
        assert_eq!(grid.region(&[1, 1]).unwrap().num_elements(), 25);
    }

    #[test]
    fn shape_errors() {
        assert!(matches!(
            ChunkGrid::new(&[10, 10], &[5]),
            Err(ShapeError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            ChunkGrid::new(&[10, 0], &[5, 5]),
            Err(ShapeError::InvalidShape { which: "array", .. })
        ));
        assert!(matches!(
            ChunkGrid::new(&[10, 10], &[0, 5]),
            Err(ShapeError::InvalidShape { which: "chunk", .. })
        ));
        assert!(matches!(
            ChunkGrid::new(&[], &[]),
            Err(ShapeError::InvalidShape { .. })
        ));
        assert!(matches!(
            ChunkGrid::new(&[u64::MAX, u64::MAX], &[1, 1]),
            Err(ShapeError::GridOverflow { .. })
        ));
    }
}
