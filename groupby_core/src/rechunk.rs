//! Planning block boundaries that line up with group boundaries.
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
use crate::{
    error::{GroupbyError, Result},
    factorize::{Grouper, factorize},
    label::Label,
    substrate::ChunkedArray,
};
use log::{info, warn};
use ndarray::ArrayView1;
use std::collections::BTreeSet;

/// New block sizes starting a block at every label in `force_new_chunk_at`.
///
/// Walking the labels in order, a block also starts at every old block boundary, and once
/// the running block holds `chunksize` elements, unless a forcing label occurs within
/// `chunksize / 2` elements ahead, in which case the block runs on to it.
///
/// # Errors
/// If `old_chunks` does not cover `labels`, or none of the forcing labels occur.
pub fn plan_forced_boundaries(
    labels: &[Label],
    old_chunks: &[usize],
    force_new_chunk_at: &[Label],
    chunksize: usize,
) -> Result<Vec<usize>> {
    check_cover(labels, old_chunks)?;
    let old_breaks: BTreeSet<usize> = boundaries(old_chunks).into_iter().collect();
    let is_break: Vec<bool> = labels
        .iter()
        .map(|label| force_new_chunk_at.contains(label))
        .collect();
    if !is_break.contains(&true) {
        return Err(GroupbyError::ForceLabelsAbsent);
    }

    // next_break[i] is the first forcing position at or after i
    let mut next_break = vec![None; labels.len()];
    let mut upcoming = None;
    for idx in (0..labels.len()).rev() {
        if is_break[idx] {
            upcoming = Some(idx);
        }
        next_break[idx] = upcoming;
    }

    let mut divisions = Vec::new();
    let mut counter = 1;
    for idx in 0..labels.len() {
        if is_break[idx] {
            divisions.push(idx);
            counter = 1;
            continue;
        }
        let next_break_is_close = next_break[idx].is_some_and(|at| at - idx <= chunksize / 2);
        if old_breaks.contains(&idx) || (counter >= chunksize && !next_break_is_close) {
            divisions.push(idx);
            counter = 1;
            continue;
        }
        counter += 1;
    }
    divisions.push(labels.len());
    Ok(divisions.windows(2).map(|w| w[1] - w[0]).collect())
}

/// New block sizes with each old boundary moved to the nearer end of the group that
/// straddles it.
///
/// Meant for sequential labels, such as the output of resampling. When every block already
/// ends at a group end, `chunks` is returned unchanged.
///
/// # Errors
/// If `chunks` does not cover `labels`.
#[allow(clippy::cast_possible_wrap)]
pub fn plan_group_boundaries(labels: &[Label], chunks: &[usize]) -> Result<Vec<usize>> {
    check_cover(labels, chunks)?;
    if labels.is_empty() {
        return Ok(chunks.to_vec());
    }
    let by = ArrayView1::from(labels).into_dyn();
    let factorized = factorize(&[by], &[Grouper::Observed], None)?;
    let ngroups = factorized.ngroups;

    let mut first_index = vec![usize::MAX; ngroups];
    let mut last_index = vec![0; ngroups];
    for (position, code) in factorized.codes.iter().enumerate() {
        if let Some(code) = code.valid() {
            first_index[code] = first_index[code].min(position);
            last_index[code] = position;
        }
    }

    let chunk_ends: Vec<usize> = boundaries(chunks)
        .into_iter()
        .skip(1)
        .filter_map(|end| end.checked_sub(1))
        .collect();
    let groups_at_ends: Vec<usize> = chunk_ends
        .iter()
        .filter_map(|&end| factorized.codes[end].valid())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let last: Vec<usize> = groups_at_ends.iter().map(|&g| last_index[g]).collect();
    if chunk_ends == last {
        return Ok(chunks.to_vec());
    }
    let first: Vec<usize> = groups_at_ends.iter().map(|&g| first_index[g]).collect();

    let mut new_ends = vec![0];
    for ((&c, &f), &l) in chunk_ends.iter().zip(&first).zip(&last) {
        let current = new_ends.last().copied().unwrap_or(0);
        if c == 0 || current > l {
            continue;
        }
        let to_first = (c as isize - f as isize).abs();
        let to_last = (c as isize - l as isize).abs();
        if to_first < to_last && f > current {
            new_ends.push(f);
        } else {
            new_ends.push(l + 1);
        }
    }
    if new_ends.last() != Some(&labels.len()) {
        new_ends.push(labels.len());
    }
    Ok(new_ends.windows(2).map(|w| w[1] - w[0]).collect())
}

/// Median block size, rounded down.
#[must_use]
pub fn median_chunksize(chunks: &[usize]) -> usize {
    let mut sorted = chunks.to_vec();
    sorted.sort_unstable();
    match sorted.len() {
        0 => 0,
        n if n % 2 == 1 => sorted[n / 2],
        n => (sorted[n / 2 - 1] + sorted[n / 2]) / 2,
    }
}

/// Rechunk `array` along `axis` so that every label in `force_new_chunk_at` starts a block.
///
/// `chunksize` defaults to the median existing block size along `axis`.
///
/// # Errors
/// If `axis` is out of range, `labels` does not match the axis length, or no forcing label
/// occurs.
pub fn rechunk_for_cohorts<T: Clone>(
    array: &ChunkedArray<T>,
    axis: usize,
    labels: &[Label],
    force_new_chunk_at: &[Label],
    chunksize: Option<usize>,
) -> Result<ChunkedArray<T>> {
    let old_chunks = axis_chunks(array, axis, labels)?;
    let chunksize = chunksize.unwrap_or_else(|| median_chunksize(old_chunks));
    let new_chunks = plan_forced_boundaries(labels, old_chunks, force_new_chunk_at, chunksize)?;
    apply_plan(array, axis, new_chunks)
}

/// Rechunk `array` along `axis` so that block boundaries fall on group boundaries of the
/// sequential `labels`.
///
/// # Errors
/// If `axis` is out of range or `labels` does not match the axis length.
pub fn rechunk_for_blockwise<T: Clone>(
    array: &ChunkedArray<T>,
    axis: usize,
    labels: &[Label],
) -> Result<ChunkedArray<T>> {
    let old_chunks = axis_chunks(array, axis, labels)?;
    let new_chunks = plan_group_boundaries(labels, old_chunks)?;
    apply_plan(array, axis, new_chunks)
}

fn axis_chunks<'a, T: Clone>(
    array: &'a ChunkedArray<T>,
    axis: usize,
    labels: &[Label],
) -> Result<&'a [usize]> {
    let ndim = array.ndim();
    let sizes = array.chunks().get(axis).ok_or(GroupbyError::InvalidAxis {
        axis: isize::try_from(axis).unwrap_or(isize::MAX),
        ndim,
    })?;
    let len = array.shape()[axis];
    if labels.len() != len {
        return Err(GroupbyError::LabelLengthMismatch {
            labels: labels.len(),
            len,
            axis,
        });
    }
    Ok(sizes)
}

fn apply_plan<T: Clone>(
    array: &ChunkedArray<T>,
    axis: usize,
    new_chunks: Vec<usize>,
) -> Result<ChunkedArray<T>> {
    if new_chunks == array.chunks()[axis] {
        warn!("Rechunk plan for axis {axis} matches the existing chunks, leaving them unchanged");
        return Ok(array.clone());
    }
    info!(
        "Rechunking axis {axis} from {} to {} blocks: {new_chunks:?}",
        array.chunks()[axis].len(),
        new_chunks.len()
    );
    array.rechunk(axis, new_chunks)
}

fn check_cover(labels: &[Label], chunks: &[usize]) -> Result<()> {
    if chunks.iter().sum::<usize>() == labels.len() {
        Ok(())
    } else {
        Err(GroupbyError::InvalidChunks {
            axis: 0,
            len: labels.len(),
            chunks: chunks.to_vec(),
        })
    }
}

/// Block start offsets followed by the total length.
fn boundaries(chunks: &[usize]) -> Vec<usize> {
    std::iter::once(0)
        .chain(chunks.iter().scan(0, |end, size| {
            *end += size;
            Some(*end)
        }))
        .collect()
}
