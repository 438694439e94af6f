//! Choosing and driving a reduction strategy for one call.
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
    chunk::{ChunkSpec, chunk_argreduce, chunk_reduce},
    cohorts::find_cohorts,
    combine::combine,
    config::{ExpectedGroups, GroupbyConfig, PlanInputs, ReductionPlan},
    error::{GroupbyError, Result},
    factorize::{BinEdges, Grouper, factorize, index_label},
    finalize::{FinalResult, finalize},
    intermediate::IntermediateResult,
    label::Label,
    rechunk::rechunk_for_blockwise,
    reindex::reindex,
    substrate::{ChunkedArray, DataArray, Scheduler, row_major, starts},
};
use aggregations::{
    AggregationCatalog, Dtype, FinalizeKwargs, Kernel, ReductionType, ResolvedAggregation,
};
use log::{debug, info};
use ndarray::{Array2, ArrayD, ArrayView1, Axis, IxDyn, Slice, concatenate};
use num_format::{Locale, ToFormattedString};
use std::{
    borrow::Cow,
    collections::{BTreeSet, HashMap, HashSet, hash_map::Entry},
    ops::Range,
};

const MIN_COUNT_ONLY_FOR_SUMS: &str = "min_count can be > 1 only for nansum, nanprod. or for sum, prod with skipna=True.";

/// Outcome of a grouped reduction.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupbyResult {
    /// Reduction that was run, after any NaN-skipping substitution.
    pub name: String,
    /// The non-reduced axes of the array, in their original order, then the group axis.
    pub values: DataArray<f64>,
    /// Label of each position along the group axis.
    pub groups: Vec<Label>,
    pub dtype: Dtype,
}

/// One grouping variable of [`GroupbyEngine::reduce_multi`].
#[derive(Debug, Clone, PartialEq)]
pub struct GroupKey {
    pub by: DataArray<Label>,
    pub expected: Option<ExpectedGroups>,
}

/// Outcome of a reduction over several grouping variables.
#[derive(Debug, Clone, PartialEq)]
pub struct MultiGroupbyResult {
    pub name: String,
    /// The non-reduced axes of the array, then one axis per key.
    pub values: ArrayD<f64>,
    /// Labels along each key's axis.
    pub groups: Vec<Vec<Label>>,
    pub dtype: Dtype,
}

/// Runs grouped reductions with aggregations from a catalog on a scheduler.
#[derive(Debug)]
pub struct GroupbyEngine<'a, S> {
    catalog: &'a AggregationCatalog,
    scheduler: S,
}

/// Everything about one call that the reduction stages share.
struct Job<'a> {
    agg: ResolvedAggregation,
    nax: usize,
    fill_value: f64,
    min_count: Option<usize>,
    kwargs: &'a FinalizeKwargs,
}

impl Job<'_> {
    fn chunk_spec<'s>(&'s self, expected: Option<&'s [Label]>, reindex: bool) -> ChunkSpec<'s> {
        ChunkSpec {
            kernels: &self.agg.chunk,
            fill_values: &self.agg.intermediate_fill,
            nax: self.nax,
            expected,
            reindex,
            kwargs: self.kwargs,
        }
    }

    fn finalize(&self, merged: IntermediateResult, expected: Option<&[Label]>) -> Result<FinalResult> {
        finalize(
            merged,
            &self.agg,
            expected,
            Some(self.fill_value),
            self.min_count,
            self.kwargs,
        )
    }
}

/// Values with the group axis last, before wrapping into a result.
struct Assembled {
    values: ArrayD<f64>,
    groups: Vec<Label>,
    /// Block sizes along the group axis.
    group_chunks: Vec<usize>,
}

impl<'a, S: Scheduler> GroupbyEngine<'a, S> {
    pub fn new(catalog: &'a AggregationCatalog, scheduler: S) -> Self {
        Self { catalog, scheduler }
    }

    #[must_use]
    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }

    /// Reduce `array` with `func` over the groups given by `by`.
    ///
    /// `by` must match the trailing dimensions of `array`. The reduced axes default to all
    /// axes of `by`. Inputs held in memory are reduced in one direct pass; otherwise the
    /// configured method runs over the blocks of the inputs.
    ///
    /// # Errors
    /// If the inputs are misaligned, the reduction is unknown, the options are inconsistent
    /// with each other or with the inputs, or a group needs filling with no fill value.
    pub fn reduce(
        &self,
        array: &DataArray<f64>,
        by: &DataArray<Label>,
        func: &str,
        config: &GroupbyConfig,
    ) -> Result<GroupbyResult> {
        check_alignment(array.shape(), by.shape())?;
        let func = nan_skipping_name(self.catalog, func, config.skipna())?;
        if let Some(min_count) = config.min_count()
            && min_count > 1
            && !matches!(func.as_str(), "nansum" | "nanprod")
        {
            return Err(GroupbyError::unsupported(MIN_COUNT_ONLY_FOR_SUMS));
        }
        let ndim = array.ndim();
        let by_ndim = by.ndim();
        let axes = normalize_axes(config.axis(), ndim, by_ndim)?;
        let nax = axes.len();

        let by: Cow<'_, DataArray<Label>> = match config.expected_groups() {
            Some(ExpectedGroups::Bins(edges)) => Cow::Owned(bin_by(by, edges)?),
            _ => Cow::Borrowed(by),
        };
        let expected: Option<Vec<Label>> = match (config.expected_groups(), &*by) {
            (Some(groups), _) => Some(groups.labels()),
            (None, DataArray::InMemory(labels)) => Some(sorted_unique(labels.iter())),
            (None, DataArray::Chunked(_)) => None,
        };
        if nax < by_ndim && expected.is_none() {
            return Err(GroupbyError::unsupported(
                "Please provide expected_groups when not reducing along all axes.",
            ));
        }

        let agg = self.catalog.get(&func)?.resolve(Dtype::Float64);
        let fill_value = if config.min_count().is_some() {
            f64::NAN
        } else {
            config.fill_value().unwrap_or(agg.final_fill)
        };
        let plan = config.plan(&PlanInputs {
            func: &func,
            array_chunked: array.is_chunked(),
            by_chunked: by.is_chunked(),
            by_ndim,
            reduced_axes: nax,
            expected_known: expected.is_some(),
            argreduce: agg.is_argreduce(),
        })?;
        info!(
            "Reducing {} elements with {func} over axes {axes:?} using {plan}, {config}",
            array
                .shape()
                .iter()
                .product::<usize>()
                .to_formatted_string(&Locale::en)
        );

        let order = reduction_order(&axes, ndim);
        let by_order: Vec<usize> = order[ndim - by_ndim..]
            .iter()
            .map(|axis| axis - (ndim - by_ndim))
            .collect();
        let dtype = agg.dtype;

        if plan == ReductionPlan::InMemory
            && let Some(kernel) = direct_kernel(&agg.name)
        {
            let job = Job {
                agg,
                nax,
                fill_value,
                min_count: config.min_count(),
                kwargs: config.finalize_kwargs(),
            };
            let (values, groups) =
                reduce_in_memory(&job, kernel, array, &by, &order, &by_order, expected.as_deref())?;
            return Ok(GroupbyResult {
                name: func,
                dtype: result_dtype(dtype, &values),
                values: DataArray::InMemory(values),
                groups,
            });
        }

        let job = Job {
            agg: agg.with_count_channel(),
            nax,
            fill_value,
            min_count: config.min_count(),
            kwargs: config.finalize_kwargs(),
        };
        let (array_blocks, by_blocks) = permuted_blocks(array, &by, &order, &by_order)?;
        let positions = if job.agg.is_argreduce() {
            Some(position_index(&array_blocks, nax)?)
        } else {
            None
        };
        let expected = expected.as_deref();
        let assembled = match plan {
            ReductionPlan::InMemory => {
                debug!("{} has no direct kernel, reducing as one block", job.agg.name);
                self.map_reduce(&job, &array_blocks, &by_blocks, positions.as_ref(), expected, 1)?
            }
            ReductionPlan::MapReduce { split_out } => self.map_reduce(
                &job,
                &array_blocks,
                &by_blocks,
                positions.as_ref(),
                expected,
                split_out,
            )?,
            ReductionPlan::Blockwise => self.blockwise(&job, &array_blocks, &by_blocks, expected)?,
            ReductionPlan::Cohorts { split_out } => self.cohorts(
                &job,
                &array_blocks,
                &by_blocks,
                positions.as_ref(),
                expected,
                split_out,
            )?,
        };

        let dtype = result_dtype(dtype, &assembled.values);
        let values = if array.is_chunked() || by.is_chunked() {
            let kept = array_blocks.ndim() - nax;
            let mut chunks = array_blocks.chunks()[..kept].to_vec();
            chunks.push(assembled.group_chunks);
            DataArray::Chunked(ChunkedArray::from_chunks(assembled.values, chunks)?)
        } else {
            DataArray::InMemory(assembled.values)
        };
        Ok(GroupbyResult {
            name: func,
            values,
            groups: assembled.groups,
            dtype,
        })
    }

    /// Reduce `array` over the combinations of several in-memory grouping variables.
    ///
    /// The keys are factorized together and the result holds every combination of their
    /// groups, one axis per key, filling absent combinations.
    ///
    /// # Errors
    /// As [`GroupbyEngine::reduce`], or if a key is chunked, keys differ in shape, or
    /// `config` carries its own expected groups.
    pub fn reduce_multi(
        &self,
        array: &DataArray<f64>,
        keys: &[GroupKey],
        func: &str,
        config: &GroupbyConfig,
    ) -> Result<MultiGroupbyResult> {
        if keys.is_empty() {
            return Err(GroupbyError::unsupported(
                "at least one grouping array is required",
            ));
        }
        if keys.iter().any(|key| key.by.is_chunked()) {
            return Err(GroupbyError::unsupported(
                "grouping by several variables requires every variable in memory",
            ));
        }
        if config.expected_groups().is_some() {
            return Err(GroupbyError::InvalidConfig(
                "expected groups are given per key when grouping by several variables".into(),
            ));
        }

        let mut labels = Vec::with_capacity(keys.len());
        let mut expected = Vec::with_capacity(keys.len());
        for key in keys {
            let by = match &key.expected {
                Some(ExpectedGroups::Bins(edges)) => bin_by(&key.by, edges)?.compute(),
                _ => key.by.compute(),
            };
            expected.push(key.expected.as_ref().map(ExpectedGroups::labels));
            labels.push(by);
        }
        let views: Vec<_> = labels.iter().map(|labels| labels.view()).collect();
        let groupers: Vec<Grouper<'_>> = expected
            .iter()
            .map(|labels| labels.as_deref().map_or(Grouper::Observed, Grouper::Expected))
            .collect();
        let factorized = factorize(&views, &groupers, None)?;
        debug!(
            "Factorized {} keys into {} combined groups of shape {:?}",
            keys.len(),
            factorized.ngroups,
            factorized.group_shape
        );

        let shape = views[0].shape().to_vec();
        let codes: Vec<Label> = factorized
            .codes
            .iter()
            .map(|code| code.valid().map_or(Label::Missing, index_label))
            .collect();
        let combined = DataArray::InMemory(ArrayD::from_shape_vec(IxDyn(&shape), codes)?);
        let every_combination = ExpectedGroups::Labels((0..factorized.ngroups).map(index_label).collect());
        let result = self.reduce(
            array,
            &combined,
            func,
            &config.with_expected_groups(Some(every_combination)),
        )?;

        let values = result.values.compute();
        let mut shape = values.shape()[..values.ndim() - 1].to_vec();
        shape.extend(&factorized.group_shape);
        let values = values.to_shape(IxDyn(&shape))?.to_owned();
        Ok(MultiGroupbyResult {
            name: result.name,
            values,
            groups: factorized.found_groups,
            dtype: result.dtype,
        })
    }

    /// Reduce every block, then merge each kept block's partial results in a tree.
    ///
    /// With `split_out > 1` the expected groups are cut into contiguous ranges, each reduced
    /// by its own tree.
    fn map_reduce(
        &self,
        job: &Job<'_>,
        array: &ChunkedArray<f64>,
        by: &ChunkedArray<Label>,
        positions: Option<&ChunkedArray<f64>>,
        expected: Option<&[Label]>,
        split_out: usize,
    ) -> Result<Assembled> {
        let ranges = match expected {
            Some(expected) if split_out > 1 => split_ranges(expected.len(), split_out),
            _ => Vec::new(),
        };
        let spec = job.chunk_spec(expected, !ranges.is_empty());
        let block_indices = array.block_indices();
        debug!(
            "Reducing {} blocks of shape {:?}",
            block_indices.len().to_formatted_string(&Locale::en),
            array.chunks()
        );
        let leaves = self.scheduler.map_blocks(block_indices, |index| {
            reduce_block_at(array, by, positions, &index, &spec)
        })?;

        let kept = array.ndim() - job.nax;
        let mut pieces = Vec::new();
        for leaves in split_into(leaves, blocks_per_kept(array, kept)) {
            let trees: Vec<(Vec<IntermediateResult>, Option<&[Label]>)> = match expected {
                Some(expected) if !ranges.is_empty() => ranges
                    .iter()
                    .map(|range| {
                        let part = leaves
                            .iter()
                            .map(|leaf| leaf.select_groups(range.clone()))
                            .collect();
                        (part, Some(&expected[range.clone()]))
                    })
                    .collect(),
                _ => vec![(leaves, expected)],
            };
            let mut finished = Vec::with_capacity(trees.len());
            for (leaves, expected) in trees {
                finished.push(self.scheduler.tree_reduce(
                    leaves,
                    |level: Vec<IntermediateResult>| combine(&level, &job.agg, job.kwargs),
                    |level| job.finalize(combine(&level, &job.agg, job.kwargs)?, expected),
                )?);
            }
            pieces.push(finished);
        }
        assemble(pieces, &array.chunks()[..kept], expected, job.fill_value)
    }

    /// Reduce and finalize every block on its own after moving block boundaries onto group
    /// boundaries.
    fn blockwise(
        &self,
        job: &Job<'_>,
        array: &ChunkedArray<f64>,
        by: &ChunkedArray<Label>,
        expected: Option<&[Label]>,
    ) -> Result<Assembled> {
        let axis = array.ndim() - 1;
        let labels: Vec<Label> = by.compute().iter().cloned().collect();
        let array = rechunk_for_blockwise(array, axis, &labels)?;
        let by = by.rechunk(0, array.chunks()[axis].clone())?;
        ensure_groups_within_blocks(&labels, &array.chunks()[axis])?;
        self.independent_blocks(job, &array, &by, None, expected)
    }

    fn independent_blocks(
        &self,
        job: &Job<'_>,
        array: &ChunkedArray<f64>,
        by: &ChunkedArray<Label>,
        positions: Option<&ChunkedArray<f64>>,
        expected: Option<&[Label]>,
    ) -> Result<Assembled> {
        let spec = job.chunk_spec(None, false);
        let finished = self.scheduler.map_blocks(array.block_indices(), |index| {
            job.finalize(reduce_block_at(array, by, positions, &index, &spec)?, None)
        })?;
        let kept = array.ndim() - job.nax;
        let pieces = split_into(finished, blocks_per_kept(array, kept));
        assemble(pieces, &array.chunks()[..kept], expected, job.fill_value)
    }

    /// Reduce each cohort of groups from just the blocks it occurs in, then put the cohort
    /// results in canonical group order.
    fn cohorts(
        &self,
        job: &Job<'_>,
        array: &ChunkedArray<f64>,
        by: &ChunkedArray<Label>,
        positions: Option<&ChunkedArray<f64>>,
        expected: Option<&[Label]>,
        split_out: usize,
    ) -> Result<Assembled> {
        let axis = array.ndim() - 1;
        let kept = axis;
        let labels: Vec<Label> = by.compute().iter().cloned().collect();
        let cohorts = find_cohorts(
            ArrayView1::from(&labels).into_dyn(),
            &array.chunks()[axis],
            true,
        )?;
        info!(
            "Found {} cohorts over {} blocks",
            cohorts.len(),
            array.chunks()[axis].len()
        );

        let mut parts = Vec::with_capacity(cohorts.len());
        for cohort in &cohorts {
            let members: HashSet<&Label> = cohort.groups.iter().collect();
            let selected: Vec<usize> = labels
                .iter()
                .enumerate()
                .filter(|(_, label)| members.contains(label))
                .map(|(position, _)| position)
                .collect();
            let sub_array = array.select(axis, &selected)?;
            let sub_by = by.select(0, &selected)?;
            let sub_positions = positions
                .map(|positions| positions.select(axis, &selected))
                .transpose()?;
            debug!(
                "Cohort of {} groups spans blocks {:?}",
                cohort.groups.len(),
                cohort.blocks
            );
            let part = if sub_array.numblocks()[axis] == 1 {
                self.independent_blocks(
                    job,
                    &sub_array,
                    &sub_by,
                    sub_positions.as_ref(),
                    Some(cohort.groups.as_slice()),
                )?
            } else {
                self.map_reduce(
                    job,
                    &sub_array,
                    &sub_by,
                    sub_positions.as_ref(),
                    Some(cohort.groups.as_slice()),
                    split_out,
                )?
            };
            parts.push(part);
        }

        let groups: Vec<Label> = parts.iter().flat_map(|part| part.groups.clone()).collect();
        let canonical = expected.map_or_else(|| sorted_unique(groups.iter()), <[Label]>::to_vec);
        let mut shape = array.shape()[..kept].to_vec();
        shape.push(canonical.len());
        let values = if parts.is_empty() {
            ArrayD::from_elem(IxDyn(&shape), job.fill_value)
        } else {
            let views: Vec<_> = parts.iter().map(|part| part.values.view()).collect();
            let joined = concatenate(Axis(kept), &views)?;
            let rows: usize = shape[..kept].iter().product();
            let flat = joined.to_shape((rows, groups.len()))?.to_owned();
            reindex(&flat, &groups, &canonical, Some(job.fill_value))?
                .to_shape(IxDyn(&shape))?
                .to_owned()
        };
        Ok(Assembled {
            values,
            group_chunks: vec![canonical.len()],
            groups: canonical,
        })
    }
}

/// Reduce a whole in-memory array with a single kernel.
fn reduce_in_memory(
    job: &Job<'_>,
    kernel: Kernel,
    array: &DataArray<f64>,
    by: &DataArray<Label>,
    order: &[usize],
    by_order: &[usize],
    expected: Option<&[Label]>,
) -> Result<(ArrayD<f64>, Vec<Label>)> {
    let (Some(values), Some(labels)) = (array.as_in_memory(), by.as_in_memory()) else {
        return Err(GroupbyError::unsupported(
            "a direct reduction needs both inputs in memory",
        ));
    };
    let values = values.view().permuted_axes(IxDyn(order));
    let labels = labels.view().permuted_axes(IxDyn(by_order));
    let nanvar = matches!(job.agg.name.as_str(), "nanvar" | "nanstd");
    let with_counts = job.min_count.is_some() || nanvar;

    let mut kernels = vec![kernel];
    let mut fill_values = vec![job.fill_value];
    if with_counts {
        kernels.push(job.agg.count_kernel());
        fill_values.push(0.0);
    }
    let direct = ResolvedAggregation {
        name: job.agg.name.clone(),
        chunk: kernels.clone(),
        combine: kernels,
        finalize: None,
        dtype: job.agg.dtype,
        intermediate_fill: fill_values,
        final_fill: job.fill_value,
        reduction_type: job.agg.reduction_type,
        count_channel: job.min_count.is_some(),
    };
    let spec = ChunkSpec {
        kernels: &direct.chunk,
        fill_values: &direct.intermediate_fill,
        nax: job.nax,
        expected: None,
        reindex: false,
        kwargs: job.kwargs,
    };
    let mut reduced = chunk_reduce(values.view(), labels.view(), &spec)?;

    if direct.reduction_type == ReductionType::ArgReduce {
        let reduced_len: usize = values.shape()[values.ndim() - job.nax..].iter().product();
        #[allow(clippy::cast_precision_loss)]
        let reduced_len = reduced_len.max(1) as f64;
        reduced.intermediates[0].mapv_inplace(|position| {
            if position >= 0.0 {
                position % reduced_len
            } else {
                position
            }
        });
    } else if nanvar && let [value, counts, ..] = reduced.intermediates.as_mut_slice() {
        ndarray::Zip::from(value).and(&*counts).for_each(|value, count| {
            if *count <= 0.0 {
                *value = f64::NAN;
            }
        });
    }

    let finished = finalize(
        reduced,
        &direct,
        expected,
        Some(job.fill_value),
        job.min_count,
        job.kwargs,
    )?;
    let mut shape = values.shape()[..values.ndim() - job.nax].to_vec();
    shape.push(finished.groups.len());
    let values = finished.values.to_shape(IxDyn(&shape))?.to_owned();
    Ok((values, finished.groups))
}

fn reduce_block_at(
    array: &ChunkedArray<f64>,
    by: &ChunkedArray<Label>,
    positions: Option<&ChunkedArray<f64>>,
    index: &[usize],
    spec: &ChunkSpec<'_>,
) -> Result<IntermediateResult> {
    let by_offset = array.ndim() - by.ndim();
    let values = array.block(index).ok_or_else(|| missing_block(index))?;
    let labels = by
        .block(&index[by_offset..])
        .ok_or_else(|| missing_block(index))?;
    match positions {
        Some(positions) => {
            let positions = positions.block(index).ok_or_else(|| missing_block(index))?;
            chunk_argreduce(values, positions, labels, spec)
        }
        None => chunk_reduce(values, labels, spec),
    }
}

fn missing_block(index: &[usize]) -> GroupbyError {
    GroupbyError::unsupported(format!("no block at index {index:?}"))
}

/// Join the finished pieces of every kept block and place them into one array.
///
/// `pieces` holds, per kept block in row-major order, results to be laid side by side
/// along the group axis.
fn assemble(
    pieces: Vec<Vec<FinalResult>>,
    kept_chunks: &[Vec<usize>],
    expected: Option<&[Label]>,
    fill_value: f64,
) -> Result<Assembled> {
    let joined = pieces
        .into_iter()
        .map(join_side_by_side)
        .collect::<Result<Vec<_>>>()?;
    let canonical = expected.map_or_else(
        || sorted_unique(joined.iter().flat_map(|(groups, ..)| groups.iter())),
        <[Label]>::to_vec,
    );
    let group_chunks = match joined.first() {
        Some((_, _, sizes)) if joined.iter().all(|(groups, ..)| *groups == canonical) => {
            sizes.clone()
        }
        _ => vec![canonical.len()],
    };

    let kept = kept_chunks.len();
    let mut shape: Vec<usize> = kept_chunks.iter().map(|sizes| sizes.iter().sum()).collect();
    shape.push(canonical.len());
    let mut values = ArrayD::from_elem(IxDyn(&shape), fill_value);
    let numblocks: Vec<usize> = kept_chunks.iter().map(Vec::len).collect();
    let offsets: Vec<Vec<usize>> = kept_chunks.iter().map(|sizes| starts(sizes)).collect();
    for (block, (groups, piece, _)) in row_major(&numblocks).into_iter().zip(joined) {
        let piece = reindex(&piece, &groups, &canonical, Some(fill_value))?;
        let mut extents: Vec<usize> = (0..kept).map(|axis| kept_chunks[axis][block[axis]]).collect();
        extents.push(canonical.len());
        let piece = piece.to_shape(IxDyn(&extents))?;
        values
            .slice_each_axis_mut(|description| {
                let axis = description.axis.index();
                if axis < kept {
                    let start = offsets[axis][block[axis]];
                    Slice::from(start..start + extents[axis])
                } else {
                    Slice::new(0, None, 1)
                }
            })
            .assign(&piece);
    }
    Ok(Assembled {
        values,
        groups: canonical,
        group_chunks,
    })
}

fn join_side_by_side(pieces: Vec<FinalResult>) -> Result<(Vec<Label>, Array2<f64>, Vec<usize>)> {
    let sizes: Vec<usize> = pieces.iter().map(|piece| piece.groups.len()).collect();
    let groups: Vec<Label> = pieces.iter().flat_map(|piece| piece.groups.clone()).collect();
    let values = match pieces.as_slice() {
        [single] => single.values.clone(),
        _ => {
            let views: Vec<_> = pieces.iter().map(|piece| piece.values.view()).collect();
            concatenate(Axis(1), &views)?
        }
    };
    Ok((groups, values, sizes))
}

fn blocks_per_kept<T: Clone>(array: &ChunkedArray<T>, kept: usize) -> usize {
    array.numblocks()[kept..].iter().product::<usize>().max(1)
}

fn split_into<T>(items: Vec<T>, size: usize) -> Vec<Vec<T>> {
    let mut out = Vec::with_capacity(items.len().div_ceil(size.max(1)));
    let mut items = items.into_iter().peekable();
    while items.peek().is_some() {
        out.push(items.by_ref().take(size.max(1)).collect());
    }
    out
}

/// Contiguous ranges of `ceil(len / split_out)` groups covering `0..len`.
fn split_ranges(len: usize, split_out: usize) -> Vec<Range<usize>> {
    let size = len.div_ceil(split_out.max(1)).max(1);
    (0..len)
        .step_by(size)
        .map(|start| start..(start + size).min(len))
        .collect()
}

fn check_alignment(array: &[usize], by: &[usize]) -> Result<()> {
    if by.is_empty() || by.len() > array.len() || array[array.len() - by.len()..] != *by {
        return Err(GroupbyError::ShapeMismatch {
            array: array.to_vec(),
            by: by.to_vec(),
        });
    }
    Ok(())
}

/// The NaN-skipping variant of `func` when `skipna` asks for it and the catalog has one.
fn nan_skipping_name(
    catalog: &AggregationCatalog,
    func: &str,
    skipna: Option<bool>,
) -> Result<String> {
    let never_skips = matches!(func, "all" | "any" | "count");
    if never_skips && skipna == Some(true) {
        return Err(GroupbyError::unsupported(format!(
            "skipna cannot be truthy for {func} reductions."
        )));
    }
    let candidate = format!("nan{func}");
    if skipna != Some(false)
        && !never_skips
        && !func.starts_with("nan")
        && catalog.contains(&candidate)
    {
        Ok(candidate)
    } else {
        Ok(func.to_string())
    }
}

/// Sorted, distinct axes of the array to reduce, all within the trailing axes covered by
/// `by`.
fn normalize_axes(axis: Option<&[isize]>, ndim: usize, by_ndim: usize) -> Result<Vec<usize>> {
    let first_by_axis = ndim - by_ndim;
    let Some(axis) = axis else {
        return Ok((first_by_axis..ndim).collect());
    };
    let mut axes = BTreeSet::new();
    for &requested in axis {
        let resolved = if requested < 0 {
            isize::try_from(ndim).ok().map(|n| n + requested)
        } else {
            Some(requested)
        };
        let resolved = resolved
            .and_then(|a| usize::try_from(a).ok())
            .filter(|a| *a < ndim)
            .ok_or(GroupbyError::InvalidAxis {
                axis: requested,
                ndim,
            })?;
        if resolved < first_by_axis {
            return Err(GroupbyError::unsupported(format!(
                "cannot reduce over axis {requested}, by only covers the last {by_ndim} axes"
            )));
        }
        if !axes.insert(resolved) {
            return Err(GroupbyError::unsupported(format!("axis {requested} is repeated")));
        }
    }
    Ok(axes.into_iter().collect())
}

/// Kept axes in order followed by the reduced axes.
fn reduction_order(axes: &[usize], ndim: usize) -> Vec<usize> {
    (0..ndim)
        .filter(|axis| !axes.contains(axis))
        .chain(axes.iter().copied())
        .collect()
}

fn sorted_unique<'l>(labels: impl Iterator<Item = &'l Label>) -> Vec<Label> {
    labels
        .filter(|label| !label.is_missing())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .cloned()
        .collect()
}

fn bin_by(by: &DataArray<Label>, edges: &BinEdges) -> Result<DataArray<Label>> {
    let mut failure = None;
    let mut to_bin = |label: &Label| {
        edges.bin_label_of(label).unwrap_or_else(|e| {
            failure.get_or_insert(e);
            Label::Missing
        })
    };
    let binned = match by {
        DataArray::InMemory(labels) => DataArray::InMemory(labels.map(&mut to_bin)),
        DataArray::Chunked(labels) => DataArray::Chunked(labels.map(&mut to_bin)),
    };
    match failure {
        Some(e) => Err(e),
        None => Ok(binned),
    }
}

/// Kernel computing `name` in one pass, if there is one.
fn direct_kernel(name: &str) -> Option<Kernel> {
    let name = if name == "count" { "nanlen" } else { name };
    Kernel::try_from(name).ok()
}

/// Both inputs as aligned blocks with the reduced axes last.
///
/// `by` takes the blocks of the trailing axes of `array`. An in-memory array takes the
/// blocks of a chunked `by` and is whole along its other axes.
fn permuted_blocks(
    array: &DataArray<f64>,
    by: &DataArray<Label>,
    order: &[usize],
    by_order: &[usize],
) -> Result<(ChunkedArray<f64>, ChunkedArray<Label>)> {
    let offset = array.ndim() - by.ndim();
    let array = match (array, by) {
        (DataArray::Chunked(array), _) => array.clone(),
        (DataArray::InMemory(array), DataArray::Chunked(by)) => {
            let chunks = array.shape()[..offset]
                .iter()
                .map(|&len| vec![len])
                .chain(by.chunks().iter().cloned())
                .collect();
            ChunkedArray::from_chunks(array.clone(), chunks)?
        }
        (DataArray::InMemory(array), DataArray::InMemory(_)) => {
            ChunkedArray::from_uniform(array.clone(), &vec![0; array.ndim()])?
        }
    };
    let by = by.to_chunked(array.chunks()[offset..].to_vec())?;
    Ok((array.permute_axes(order)?, by.permute_axes(by_order)?))
}

/// Position of every element within the trailing `nax` axes, blocked like `array`.
fn position_index(array: &ChunkedArray<f64>, nax: usize) -> Result<ChunkedArray<f64>> {
    let shape = array.shape().to_vec();
    let first = shape.len() - nax;
    #[allow(clippy::cast_precision_loss)]
    let data = ArrayD::from_shape_fn(IxDyn(&shape), |index| {
        (first..shape.len()).fold(0, |flat, axis| flat * shape[axis] + index[axis]) as f64
    });
    ChunkedArray::from_chunks(data, array.chunks().to_vec())
}

fn ensure_groups_within_blocks(labels: &[Label], chunks: &[usize]) -> Result<()> {
    let mut owner: HashMap<&Label, usize> = HashMap::new();
    for (block, (start, size)) in starts(chunks).into_iter().zip(chunks).enumerate() {
        for label in labels[start..start + size].iter().filter(|l| !l.is_missing()) {
            match owner.entry(label) {
                Entry::Occupied(entry) if *entry.get() != block => {
                    return Err(GroupbyError::unsupported(format!(
                        "method blockwise needs each group within one block, group {label} is in blocks {} and {block}",
                        entry.get()
                    )));
                }
                Entry::Occupied(_) => {}
                Entry::Vacant(entry) => {
                    entry.insert(block);
                }
            }
        }
    }
    Ok(())
}

/// Integer and boolean results that had to be filled with NaN are reported as floats.
fn result_dtype(dtype: Dtype, values: &ArrayD<f64>) -> Dtype {
    match dtype {
        Dtype::Int64 | Dtype::Bool if values.iter().any(|value| value.is_nan()) => Dtype::Float64,
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::{
        GroupKey, GroupbyEngine, normalize_axes, position_index, reduction_order, split_ranges,
    };
    use crate::{
        config::{ExpectedGroups, GroupbyConfigBuilder, Method},
        error::GroupbyError,
        label::Label,
        substrate::{ChunkedArray, DataArray, LocalScheduler},
    };
    use aggregations::{AggregationCatalog, Dtype};
    use color_eyre::eyre::Result;
    use ndarray::{ArrayD, IxDyn, array};
    use test_log::test;

    macro_rules! assert_error {
        ($err_expr: expr, $err_contents: expr) => {
            assert_eq!(
                $err_expr.err().map(|e| e.to_string()),
                Some($err_contents.to_string())
            )
        };
    }

    fn strs(values: &[&str]) -> Vec<Label> {
        values.iter().map(|v| Label::from(*v)).collect()
    }

    fn by(shape: &[usize], labels: Vec<Label>) -> DataArray<Label> {
        DataArray::InMemory(ArrayD::from_shape_vec(IxDyn(shape), labels).expect("labels fit shape"))
    }

    fn values(data: ArrayD<f64>, chunks: Option<Vec<Vec<usize>>>) -> DataArray<f64> {
        match chunks {
            Some(chunks) => ChunkedArray::from_chunks(data, chunks)
                .expect("chunks fit shape")
                .into(),
            None => data.into(),
        }
    }

    #[test]
    fn should_split_groups_into_ceiling_ranges() {
        assert_eq!(split_ranges(10, 3), vec![0..4, 4..8, 8..10]);
        assert_eq!(split_ranges(4, 3), vec![0..2, 2..4]);
        assert_eq!(split_ranges(2, 5), vec![0..1, 1..2]);
    }

    #[test]
    fn should_normalize_axes() -> Result<()> {
        assert_eq!(normalize_axes(None, 3, 2)?, vec![1, 2]);
        assert_eq!(normalize_axes(Some(&[-1, 1]), 3, 2)?, vec![1, 2]);
        assert!(matches!(
            normalize_axes(Some(&[3]), 3, 2),
            Err(GroupbyError::InvalidAxis { axis: 3, ndim: 3 })
        ));
        assert_error!(
            normalize_axes(Some(&[0]), 3, 2),
            "cannot reduce over axis 0, by only covers the last 2 axes"
        );
        assert_error!(normalize_axes(Some(&[2, -1]), 3, 2), "axis -1 is repeated");
        Ok(())
    }

    #[test]
    fn should_move_reduced_axes_last() {
        assert_eq!(reduction_order(&[1], 3), vec![0, 2, 1]);
        assert_eq!(reduction_order(&[1, 2], 3), vec![0, 1, 2]);
    }

    #[test]
    fn should_index_positions_within_reduced_axes() -> Result<()> {
        let array = ChunkedArray::from_uniform(ArrayD::zeros(IxDyn(&[2, 3])), &[1, 2])?;
        let positions = position_index(&array, 1)?;
        assert_eq!(positions.compute(), array![[0.0, 1.0, 2.0], [0.0, 1.0, 2.0]].into_dyn());
        assert_eq!(positions.chunks(), array.chunks());
        Ok(())
    }

    #[test]
    fn should_reject_misaligned_inputs() -> Result<()> {
        // Given
        let catalog = AggregationCatalog::default();
        let engine = GroupbyEngine::new(&catalog, LocalScheduler::default());
        let array = values(ArrayD::zeros(IxDyn(&[2, 3])), None);
        let labels = by(&[2], strs(&["a", "b"]));

        // When
        let result = engine.reduce(&array, &labels, "sum", &GroupbyConfigBuilder::new().build()?);

        // Then
        assert_error!(
            result,
            "array and by must be aligned i.e. array.shape[-by.ndim..] == by.shape. Received array of shape [2, 3] and by of shape [2]"
        );
        Ok(())
    }

    #[test]
    fn should_reject_skipna_for_count() -> Result<()> {
        let catalog = AggregationCatalog::default();
        let engine = GroupbyEngine::new(&catalog, LocalScheduler::default());
        let array = values(array![1.0, 2.0].into_dyn(), None);
        let labels = by(&[2], strs(&["a", "b"]));
        let config = GroupbyConfigBuilder::new().skipna(Some(true)).build()?;
        assert_error!(
            engine.reduce(&array, &labels, "count", &config),
            "skipna cannot be truthy for count reductions."
        );
        Ok(())
    }

    #[test]
    fn should_reject_min_count_for_mean() -> Result<()> {
        let catalog = AggregationCatalog::default();
        let engine = GroupbyEngine::new(&catalog, LocalScheduler::default());
        let array = values(array![1.0, 2.0].into_dyn(), None);
        let labels = by(&[2], strs(&["a", "b"]));
        let config = GroupbyConfigBuilder::new().min_count(Some(2)).build()?;
        assert_error!(
            engine.reduce(&array, &labels, "mean", &config),
            "min_count can be > 1 only for nansum, nanprod. or for sum, prod with skipna=True."
        );
        Ok(())
    }

    #[test]
    fn should_report_unknown_reduction() -> Result<()> {
        let catalog = AggregationCatalog::default();
        let engine = GroupbyEngine::new(&catalog, LocalScheduler::default());
        let array = values(array![1.0].into_dyn(), None);
        let labels = by(&[1], strs(&["a"]));
        let config = GroupbyConfigBuilder::new().skipna(Some(false)).build()?;
        assert_error!(
            engine.reduce(&array, &labels, "foo", &config),
            "Reduction \"foo\" not implemented yet"
        );
        Ok(())
    }

    #[test]
    fn should_skip_nan_by_default() -> Result<()> {
        // Given
        let catalog = AggregationCatalog::default();
        let engine = GroupbyEngine::new(&catalog, LocalScheduler::default());
        let array = values(array![1.0, f64::NAN, 2.0, 5.0].into_dyn(), None);
        let labels = by(&[4], strs(&["a", "a", "b", "b"]));

        // When
        let skipping = engine.reduce(&array, &labels, "sum", &GroupbyConfigBuilder::new().build()?)?;
        let propagating = engine.reduce(
            &array,
            &labels,
            "sum",
            &GroupbyConfigBuilder::new().skipna(Some(false)).build()?,
        )?;

        // Then
        assert_eq!(skipping.name, "nansum");
        assert_eq!(skipping.values.compute(), array![1.0, 7.0].into_dyn());
        assert_eq!(propagating.name, "sum");
        assert!(propagating.values.compute()[[0]].is_nan());
        Ok(())
    }

    #[test]
    fn should_reduce_leading_axes_of_by_separately() -> Result<()> {
        // Given
        let catalog = AggregationCatalog::default();
        let engine = GroupbyEngine::new(&catalog, LocalScheduler::default());
        let array = values(array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]].into_dyn(), None);
        let labels = by(&[2, 3], strs(&["a", "b", "a", "b", "b", "c"]));
        let config = GroupbyConfigBuilder::new().axis(Some(vec![-1])).build()?;

        // When
        let result = engine.reduce(&array, &labels, "sum", &config)?;

        // Then
        assert_eq!(result.groups, strs(&["a", "b", "c"]));
        assert_eq!(
            result.values.compute(),
            array![[4.0, 2.0, 0.0], [0.0, 9.0, 6.0]].into_dyn()
        );
        Ok(())
    }

    #[test]
    fn should_require_expected_groups_for_partial_chunked_reduction() -> Result<()> {
        let catalog = AggregationCatalog::default();
        let engine = GroupbyEngine::new(&catalog, LocalScheduler::default());
        let array = values(ArrayD::zeros(IxDyn(&[2, 2])), Some(vec![vec![1, 1], vec![2]]));
        let labels: DataArray<Label> = ChunkedArray::from_chunks(
            ArrayD::from_shape_vec(IxDyn(&[2, 2]), strs(&["a", "b", "a", "b"]))?,
            vec![vec![1, 1], vec![2]],
        )?
        .into();
        let config = GroupbyConfigBuilder::new().axis(Some(vec![1])).build()?;
        assert_error!(
            engine.reduce(&array, &labels, "sum", &config),
            "Please provide expected_groups when not reducing along all axes."
        );
        Ok(())
    }

    #[test]
    fn should_report_arg_positions_along_reduced_axis() -> Result<()> {
        // Given
        let catalog = AggregationCatalog::default();
        let engine = GroupbyEngine::new(&catalog, LocalScheduler::default());
        let data = array![[1.0, 9.0, 3.0, 4.0], [8.0, 2.0, 7.0, 0.0]].into_dyn();
        let labels = by(&[4], strs(&["a", "a", "b", "b"]));
        let config = GroupbyConfigBuilder::new().build()?;

        // When
        let in_memory = engine.reduce(&values(data.clone(), None), &labels, "argmax", &config)?;
        let chunked = engine.reduce(
            &values(data, Some(vec![vec![1, 1], vec![1, 3]])),
            &labels,
            "argmax",
            &config,
        )?;

        // Then
        let expected = array![[1.0, 3.0], [0.0, 2.0]].into_dyn();
        assert_eq!(in_memory.values.compute(), expected);
        assert_eq!(chunked.values.compute(), expected);
        assert_eq!(chunked.dtype, Dtype::Int64);
        assert_eq!(chunked.values.chunks(), Some(&[vec![1, 1], vec![2]][..]));
        Ok(())
    }

    #[test]
    fn should_fill_groups_absent_from_expected() -> Result<()> {
        // Given
        let catalog = AggregationCatalog::default();
        let engine = GroupbyEngine::new(&catalog, LocalScheduler::default());
        let array = values(array![1.0, 2.0, 3.0].into_dyn(), Some(vec![vec![2, 1]]));
        let labels = by(&[3], strs(&["a", "b", "a"]));
        let config = GroupbyConfigBuilder::new()
            .expected_groups(Some(ExpectedGroups::Labels(strs(&["c", "a"]))))
            .fill_value(Some(-1.0))
            .build()?;

        // When
        let result = engine.reduce(&array, &labels, "max", &config)?;

        // Then
        assert_eq!(result.groups, strs(&["c", "a"]));
        assert_eq!(result.values.compute(), array![-1.0, 3.0].into_dyn());
        Ok(())
    }

    #[test]
    fn should_rechunk_sequential_groups_for_blockwise() -> Result<()> {
        // Given
        let catalog = AggregationCatalog::default();
        let engine = GroupbyEngine::new(&catalog, LocalScheduler::default());
        let array = values(
            array![1.0, 2.0, 3.0, 4.0, 5.0, 6.0].into_dyn(),
            Some(vec![vec![2, 2, 2]]),
        );
        let labels = by(&[6], vec![
            Label::Int(1), Label::Int(1), Label::Int(1), Label::Int(2), Label::Int(3), Label::Int(3),
        ]);
        let config = GroupbyConfigBuilder::new().method(Method::Blockwise).build()?;

        // When
        let result = engine.reduce(&array, &labels, "sum", &config)?;

        // Then
        assert_eq!(result.groups, vec![Label::Int(1), Label::Int(2), Label::Int(3)]);
        assert_eq!(result.values.compute(), array![6.0, 4.0, 11.0].into_dyn());
        assert_eq!(result.values.chunks(), Some(&[vec![1, 1, 1]][..]));
        Ok(())
    }

    #[test]
    fn should_reject_blockwise_when_groups_repeat_across_blocks() -> Result<()> {
        let catalog = AggregationCatalog::default();
        let engine = GroupbyEngine::new(&catalog, LocalScheduler::default());
        let array = values(array![1.0, 2.0, 3.0, 4.0].into_dyn(), Some(vec![vec![2, 2]]));
        let labels = by(&[4], strs(&["a", "b", "a", "b"]));
        let config = GroupbyConfigBuilder::new().method(Method::Blockwise).build()?;
        assert!(matches!(
            engine.reduce(&array, &labels, "sum", &config),
            Err(GroupbyError::Unsupported(_))
        ));
        Ok(())
    }

    #[test]
    fn should_reduce_every_combination_of_keys() -> Result<()> {
        // Given
        let catalog = AggregationCatalog::default();
        let engine = GroupbyEngine::new(&catalog, LocalScheduler::default());
        let array = values(array![1.0, 2.0, 3.0, 4.0].into_dyn(), None);
        let keys = [
            GroupKey {
                by: by(&[4], strs(&["x", "x", "y", "y"])),
                expected: None,
            },
            GroupKey {
                by: by(&[4], vec![Label::Int(1), Label::Int(2), Label::Int(1), Label::Int(1)]),
                expected: None,
            },
        ];
        let config = GroupbyConfigBuilder::new().fill_value(Some(0.0)).build()?;

        // When
        let result = engine.reduce_multi(&array, &keys, "sum", &config)?;

        // Then
        assert_eq!(
            result.groups,
            vec![strs(&["x", "y"]), vec![Label::Int(1), Label::Int(2)]]
        );
        assert_eq!(result.values, array![[1.0, 2.0], [7.0, 0.0]].into_dyn());
        Ok(())
    }
}
