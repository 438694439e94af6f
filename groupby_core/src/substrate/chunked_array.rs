/*
* Copyright 2022-2025 Crown Copyright
*
* Licensed under the Apache License, Version 2.0 (the "License");
* you may not use this file except in compliance with the License.
* You may obtain a copy of the License at
*
*     http://www.apache.org/licenses/LICENSE-2.0
*
* Unless required by applicable law or agreed to in writing, software
* distributed under the License is distributed on an "AS IS" BASIS,
* WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
* See the License for the specific language governing permissions and
* limitations under the License.
*/
use crate::error::{GroupbyError, Result};
use ndarray::{ArrayD, ArrayViewD, Axis, IxDyn, Slice};

/// An N-dimensional array partitioned into blocks.
///
/// `chunks[axis]` lists the block sizes along `axis`; they always sum to the axis length.
/// An axis of length zero has a single empty block.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkedArray<T> {
    data: ArrayD<T>,
    chunks: Vec<Vec<usize>>,
}

impl<T: Clone> ChunkedArray<T> {
    /// Partition `data` into the given blocks.
    ///
    /// # Errors
    /// If there is not one block list per axis or a list does not sum to its axis length.
    pub fn from_chunks(data: ArrayD<T>, chunks: Vec<Vec<usize>>) -> Result<Self> {
        validate(data.shape(), &chunks)?;
        Ok(Self { data, chunks })
    }

    /// Partition `data` into blocks of `chunksize[axis]` elements, with a shorter last block
    /// where the length does not divide evenly. A size of zero keeps the axis whole.
    ///
    /// # Errors
    /// If `chunksize` does not have one entry per axis.
    pub fn from_uniform(data: ArrayD<T>, chunksize: &[usize]) -> Result<Self> {
        if chunksize.len() != data.ndim() {
            return Err(GroupbyError::unsupported(format!(
                "received chunk sizes for {} axes of a {}-dimensional array",
                chunksize.len(),
                data.ndim()
            )));
        }
        let chunks = data
            .shape()
            .iter()
            .zip(chunksize)
            .map(|(&len, &size)| uniform(len, size))
            .collect();
        Ok(Self { data, chunks })
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    #[must_use]
    pub fn ndim(&self) -> usize {
        self.data.ndim()
    }

    #[must_use]
    pub fn chunks(&self) -> &[Vec<usize>] {
        &self.chunks
    }

    /// Number of blocks along each axis.
    #[must_use]
    pub fn numblocks(&self) -> Vec<usize> {
        self.chunks.iter().map(Vec::len).collect()
    }

    /// View of the block at `index`, one block number per axis.
    #[must_use]
    pub fn block(&self, index: &[usize]) -> Option<ArrayViewD<'_, T>> {
        if index.len() != self.ndim() {
            return None;
        }
        let ranges = index
            .iter()
            .zip(&self.chunks)
            .map(|(&block, sizes)| {
                let start: usize = sizes.get(..block)?.iter().sum();
                sizes.get(block).map(|size| (start, start + size))
            })
            .collect::<Option<Vec<_>>>()?;
        Some(self.data.slice_each_axis(|description| {
            let (start, end) = ranges[description.axis.index()];
            Slice::from(start..end)
        }))
    }

    /// Every block index in row-major order.
    #[must_use]
    pub fn block_indices(&self) -> Vec<Vec<usize>> {
        row_major(&self.numblocks())
    }

    /// Every block with its index, in row-major order.
    pub fn blocks(&self) -> impl Iterator<Item = (Vec<usize>, ArrayViewD<'_, T>)> + '_ {
        self.block_indices()
            .into_iter()
            .filter_map(move |index| self.block(&index).map(|block| (index, block)))
    }

    /// The same data partitioned along `axis` into blocks of `sizes`.
    ///
    /// # Errors
    /// If `axis` is out of range or `sizes` does not sum to its length.
    pub fn rechunk(&self, axis: usize, sizes: Vec<usize>) -> Result<Self> {
        let mut chunks = self.chunks.clone();
        let slot = chunks.get_mut(axis).ok_or(GroupbyError::InvalidAxis {
            axis: axis_as_isize(axis),
            ndim: self.ndim(),
        })?;
        *slot = sizes;
        Self::from_chunks(self.data.clone(), chunks)
    }

    /// Reorder axes so that new axis `i` is old axis `axes[i]`, keeping each axis' blocks.
    ///
    /// # Errors
    /// If `axes` is not a permutation of the array's axes.
    pub fn permute_axes(self, axes: &[usize]) -> Result<Self> {
        let mut sorted = axes.to_vec();
        sorted.sort_unstable();
        if sorted != (0..self.ndim()).collect::<Vec<_>>() {
            return Err(GroupbyError::unsupported(format!(
                "{axes:?} is not a permutation of the axes of a {}-dimensional array",
                self.ndim()
            )));
        }
        let chunks = axes.iter().map(|&axis| self.chunks[axis].clone()).collect();
        Ok(Self {
            data: self.data.permuted_axes(IxDyn(axes)),
            chunks,
        })
    }

    /// Take `indices` along `axis`.
    ///
    /// Consecutive selected elements from the same original block stay together in one
    /// block, so selecting whole blocks preserves their boundaries.
    ///
    /// # Errors
    /// If `axis` is out of range or an index is beyond the axis length.
    pub fn select(&self, axis: usize, indices: &[usize]) -> Result<Self> {
        let sizes = self.chunks.get(axis).ok_or(GroupbyError::InvalidAxis {
            axis: axis_as_isize(axis),
            ndim: self.ndim(),
        })?;
        let len = self.shape()[axis];
        if let Some(bad) = indices.iter().find(|&&index| index >= len) {
            return Err(GroupbyError::unsupported(format!(
                "index {bad} is out of bounds for axis {axis} with size {len}"
            )));
        }
        let starts = starts(sizes);
        let mut runs: Vec<usize> = Vec::new();
        let mut previous = None;
        for &index in indices {
            let block = starts.partition_point(|start| *start <= index).saturating_sub(1);
            match runs.last_mut() {
                Some(run) if previous == Some(block) => *run += 1,
                _ => runs.push(1),
            }
            previous = Some(block);
        }
        if runs.is_empty() {
            runs.push(0);
        }
        let mut chunks = self.chunks.clone();
        chunks[axis] = runs;
        Ok(Self {
            data: self.data.select(Axis(axis), indices),
            chunks,
        })
    }

    /// Apply `f` to every element, keeping the blocks.
    #[must_use]
    pub fn map<U: Clone>(&self, f: impl FnMut(&T) -> U) -> ChunkedArray<U> {
        ChunkedArray {
            data: self.data.map(f),
            chunks: self.chunks.clone(),
        }
    }

    /// Materialise the whole array.
    #[must_use]
    pub fn compute(&self) -> ArrayD<T> {
        self.data.clone()
    }

    #[must_use]
    pub fn into_data(self) -> ArrayD<T> {
        self.data
    }
}

/// Input or result array, either whole in memory or partitioned into blocks.
#[derive(Debug, Clone, PartialEq)]
pub enum DataArray<T> {
    InMemory(ArrayD<T>),
    Chunked(ChunkedArray<T>),
}

impl<T: Clone> DataArray<T> {
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        match self {
            Self::InMemory(array) => array.shape(),
            Self::Chunked(array) => array.shape(),
        }
    }

    #[must_use]
    pub fn ndim(&self) -> usize {
        self.shape().len()
    }

    #[must_use]
    pub fn is_chunked(&self) -> bool {
        matches!(self, Self::Chunked(_))
    }

    #[must_use]
    pub fn chunks(&self) -> Option<&[Vec<usize>]> {
        match self {
            Self::InMemory(_) => None,
            Self::Chunked(array) => Some(array.chunks()),
        }
    }

    /// The whole array, when it is not partitioned.
    #[must_use]
    pub fn as_in_memory(&self) -> Option<&ArrayD<T>> {
        match self {
            Self::InMemory(array) => Some(array),
            Self::Chunked(_) => None,
        }
    }

    #[must_use]
    pub fn compute(&self) -> ArrayD<T> {
        match self {
            Self::InMemory(array) => array.clone(),
            Self::Chunked(array) => array.compute(),
        }
    }

    /// This array partitioned into `chunks`, whatever its current partitioning.
    ///
    /// # Errors
    /// If `chunks` does not fit the shape.
    pub fn to_chunked(&self, chunks: Vec<Vec<usize>>) -> Result<ChunkedArray<T>> {
        ChunkedArray::from_chunks(self.compute(), chunks)
    }
}

impl<T> From<ArrayD<T>> for DataArray<T> {
    fn from(value: ArrayD<T>) -> Self {
        Self::InMemory(value)
    }
}

impl<T> From<ChunkedArray<T>> for DataArray<T> {
    fn from(value: ChunkedArray<T>) -> Self {
        Self::Chunked(value)
    }
}

fn validate(shape: &[usize], chunks: &[Vec<usize>]) -> Result<()> {
    if chunks.len() != shape.len() {
        return Err(GroupbyError::unsupported(format!(
            "received chunks for {} axes of a {}-dimensional array",
            chunks.len(),
            shape.len()
        )));
    }
    for (axis, (&len, sizes)) in shape.iter().zip(chunks).enumerate() {
        if sizes.is_empty() || sizes.iter().sum::<usize>() != len {
            return Err(GroupbyError::InvalidChunks {
                axis,
                len,
                chunks: sizes.clone(),
            });
        }
    }
    Ok(())
}

fn uniform(len: usize, size: usize) -> Vec<usize> {
    if size == 0 || size >= len {
        return vec![len];
    }
    let mut sizes = vec![size; len / size];
    if len % size != 0 {
        sizes.push(len % size);
    }
    sizes
}

/// Start offset of every block.
pub(crate) fn starts(sizes: &[usize]) -> Vec<usize> {
    sizes
        .iter()
        .scan(0, |start, size| {
            let current = *start;
            *start += size;
            Some(current)
        })
        .collect()
}

/// Every index of an array with `extents`, in row-major order.
pub(crate) fn row_major(extents: &[usize]) -> Vec<Vec<usize>> {
    let total: usize = extents.iter().product();
    (0..total)
        .map(|mut flat| {
            let mut index = vec![0; extents.len()];
            for axis in (0..extents.len()).rev() {
                index[axis] = flat % extents[axis];
                flat /= extents[axis];
            }
            index
        })
        .collect()
}

#[allow(clippy::cast_possible_wrap)]
fn axis_as_isize(axis: usize) -> isize {
    axis as isize
}

#[cfg(test)]
mod tests {
    use super::{ChunkedArray, DataArray, row_major};
    use color_eyre::eyre::Result;
    use ndarray::{Array, ArrayD, IxDyn, array};
    use test_log::test;

    #[allow(clippy::cast_precision_loss)]
    fn arange(shape: &[usize]) -> ArrayD<f64> {
        let len = shape.iter().product::<usize>();
        Array::from_iter((0..len).map(|v| v as f64))
            .into_shape_with_order(IxDyn(shape))
            .expect("shape fits")
    }

    #[test]
    fn should_split_axes_uniformly() -> Result<()> {
        let chunked = ChunkedArray::from_uniform(arange(&[2, 7]), &[0, 3])?;
        assert_eq!(chunked.chunks(), &[vec![2], vec![3, 3, 1]]);
        assert_eq!(chunked.numblocks(), vec![1, 3]);
        Ok(())
    }

    #[test]
    fn should_view_blocks_in_row_major_order() -> Result<()> {
        // Given
        let chunked = ChunkedArray::from_chunks(arange(&[2, 4]), vec![vec![1, 1], vec![3, 1]])?;

        // When
        let blocks: Vec<_> = chunked.blocks().collect();

        // Then
        assert_eq!(blocks.len(), 4);
        assert_eq!(blocks[0].0, vec![0, 0]);
        assert_eq!(blocks[0].1, array![[0.0, 1.0, 2.0]].into_dyn());
        assert_eq!(blocks[3].0, vec![1, 1]);
        assert_eq!(blocks[3].1, array![[7.0]].into_dyn());
        assert!(chunked.block(&[2, 0]).is_none());
        Ok(())
    }

    #[test]
    fn should_reject_chunks_that_do_not_cover_axis() {
        let result = ChunkedArray::from_chunks(arange(&[5]), vec![vec![2, 2]]);
        assert_eq!(
            result.err().map(|e| e.to_string()),
            Some("chunks [2, 2] do not sum to length 5 of axis 0".to_string())
        );
    }

    #[test]
    fn should_keep_runs_from_one_block_together_when_selecting() -> Result<()> {
        // Given
        let chunked = ChunkedArray::from_chunks(arange(&[6]), vec![vec![2, 2, 2]])?;

        // When
        let selected = chunked.select(0, &[0, 1, 4, 5, 3])?;

        // Then
        assert_eq!(selected.chunks(), &[vec![2, 2, 1]]);
        assert_eq!(selected.compute(), array![0.0, 1.0, 4.0, 5.0, 3.0].into_dyn());
        Ok(())
    }

    #[test]
    fn should_permute_axes_with_their_chunks() -> Result<()> {
        let chunked = ChunkedArray::from_chunks(arange(&[2, 3]), vec![vec![2], vec![1, 2]])?;
        let permuted = chunked.permute_axes(&[1, 0])?;
        assert_eq!(permuted.shape(), &[3, 2]);
        assert_eq!(permuted.chunks(), &[vec![1, 2], vec![2]]);
        assert_eq!(
            permuted.block(&[1, 0]).map(|b| b.to_owned()),
            Some(array![[1.0, 4.0], [2.0, 5.0]].into_dyn())
        );
        Ok(())
    }

    #[test]
    fn should_rechunk_one_axis() -> Result<()> {
        let chunked = ChunkedArray::from_uniform(arange(&[4]), &[1])?;
        let rechunked = chunked.rechunk(0, vec![3, 1])?;
        assert_eq!(rechunked.chunks(), &[vec![3, 1]]);
        assert_eq!(rechunked.compute(), chunked.compute());
        Ok(())
    }

    #[test]
    fn should_convert_in_memory_data_to_chunked() -> Result<()> {
        let data = DataArray::from(arange(&[3]));
        assert!(!data.is_chunked());
        let chunked = data.to_chunked(vec![vec![1, 2]])?;
        assert_eq!(chunked.numblocks(), vec![2]);
        Ok(())
    }

    #[test]
    fn should_enumerate_indices_row_major() {
        assert_eq!(
            row_major(&[2, 2]),
            vec![vec![0, 0], vec![0, 1], vec![1, 0], vec![1, 1]]
        );
        assert_eq!(row_major(&[]), vec![Vec::<usize>::new()]);
    }
}
