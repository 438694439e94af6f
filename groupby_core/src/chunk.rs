//! Reduction of a single block into an [`IntermediateResult`].
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
    intermediate::IntermediateResult,
    label::Label,
};
use aggregations::{FinalizeKwargs, Kernel};
use log::debug;
use ndarray::{Array2, ArrayView2, ArrayViewD};

/// What to compute for one block.
#[derive(Debug, Clone, Copy)]
pub struct ChunkSpec<'a> {
    /// One output channel per kernel.
    pub kernels: &'a [Kernel],
    /// Fill value of each kernel for groups that receive no elements.
    pub fill_values: &'a [f64],
    /// Number of trailing axes being reduced.
    pub nax: usize,
    pub expected: Option<&'a [Label]>,
    /// Size the output to `expected` instead of the groups found in the block.
    pub reindex: bool,
    pub kwargs: &'a FinalizeKwargs,
}

/// Reduce one block with each kernel of `spec`.
///
/// `by` must match the trailing dimensions of `values`; its last `spec.nax` dimensions are
/// reduced. Labels are factorized locally so the output only holds the groups present in
/// this block, in ascending order. With `spec.reindex` the output holds the expected groups
/// in their given order instead.
///
/// # Errors
/// If `by` does not align with `values`, or `spec.nax` exceeds the dimensions of `by`.
pub fn chunk_reduce(
    values: ArrayViewD<'_, f64>,
    by: ArrayViewD<'_, Label>,
    spec: &ChunkSpec<'_>,
) -> Result<IntermediateResult> {
    reduce_block(values, None, by, spec)
}

/// As [`chunk_reduce`], but arg kernels report entries of `index` rather than positions
/// within the block.
///
/// `index` has the shape of `values` and holds the position of each element in the whole
/// array, so the reported positions stay meaningful once blocks are combined.
///
/// # Errors
/// As [`chunk_reduce`], or if `index` and `values` differ in shape.
pub fn chunk_argreduce(
    values: ArrayViewD<'_, f64>,
    index: ArrayViewD<'_, f64>,
    by: ArrayViewD<'_, Label>,
    spec: &ChunkSpec<'_>,
) -> Result<IntermediateResult> {
    if index.shape() != values.shape() {
        return Err(GroupbyError::ShapeMismatch {
            array: values.shape().to_vec(),
            by: index.shape().to_vec(),
        });
    }
    reduce_block(values, Some(index), by, spec)
}

fn reduce_block(
    values: ArrayViewD<'_, f64>,
    index: Option<ArrayViewD<'_, f64>>,
    by: ArrayViewD<'_, Label>,
    spec: &ChunkSpec<'_>,
) -> Result<IntermediateResult> {
    let ndim = values.ndim();
    let by_ndim = by.ndim();
    if by_ndim > ndim || values.shape()[ndim - by_ndim..] != *by.shape() {
        return Err(GroupbyError::ShapeMismatch {
            array: values.shape().to_vec(),
            by: by.shape().to_vec(),
        });
    }
    if spec.nax == 0 || spec.nax > by_ndim {
        return Err(GroupbyError::unsupported(format!(
            "cannot reduce {} axes of a {by_ndim}-dimensional grouping array",
            spec.nax
        )));
    }

    let outer: usize = values.shape()[..ndim - by_ndim].iter().product();
    let rows: usize = by.shape()[..by_ndim - spec.nax].iter().product();
    let columns = by.len();
    let matrix = values.to_shape((outer, columns))?.to_owned();
    let index = match index {
        Some(index) => Some(index.to_shape((outer, columns))?.iter().copied().collect::<Vec<_>>()),
        None => None,
    };

    let grouper = match spec.expected {
        Some(expected) if spec.reindex => Grouper::Expected(expected),
        _ => Grouper::Observed,
    };
    let factorized = factorize(&[by], &[grouper], Some(spec.nax))?;

    if columns == 0 || factorized.all_missing() {
        let groups = match spec.expected {
            Some(expected) if spec.reindex => expected.to_vec(),
            _ => vec![Label::Missing],
        };
        debug!("Block of shape {:?} has no groups", values.shape());
        return Ok(IntermediateResult::filled(
            outer * rows,
            groups,
            spec.fill_values,
        ));
    }

    let ngroups = factorized.ngroups;
    let intermediates = reduce_matrix(
        matrix.view(),
        &factorized.dense_codes(),
        factorized.size(),
        spec,
        index.as_deref(),
    )
    .into_iter()
    .map(|channel| channel.into_shape_with_order((outer * rows, ngroups)))
    .collect::<std::result::Result<Vec<_>, _>>()?;

    let groups = factorized.found_groups.into_iter().next().unwrap_or_default();
    Ok(IntermediateResult {
        groups,
        intermediates,
    })
}

/// Apply each kernel of `spec` to the columns of `values` grouped by `codes`.
///
/// When `index` is given, arg kernel outputs are looked up in it, `index` being the
/// row-major flattening of an array shaped like `values`.
pub(crate) fn reduce_matrix(
    values: ArrayView2<'_, f64>,
    codes: &[usize],
    size: usize,
    spec: &ChunkSpec<'_>,
    index: Option<&[f64]>,
) -> Vec<Array2<f64>> {
    spec.kernels
        .iter()
        .zip(spec.fill_values)
        .map(|(kernel, fill)| {
            let mut out = kernel.aggregate(codes, values, size, *fill, spec.kwargs);
            if let Some(index) = index.filter(|_| kernel.is_arg()) {
                out.mapv_inplace(|position| lookup(position, index));
            }
            out
        })
        .collect()
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn lookup(position: f64, index: &[f64]) -> f64 {
    if position >= 0.0 && position.fract() == 0.0 {
        index.get(position as usize).copied().unwrap_or(position)
    } else {
        position
    }
}
