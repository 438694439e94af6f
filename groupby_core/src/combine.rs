//! Merging of sibling intermediate results.
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
    chunk::{ChunkSpec, reduce_matrix},
    error::{GroupbyError, Result},
    intermediate::IntermediateResult,
    label::Label,
};
use aggregations::{FinalizeKwargs, ResolvedAggregation};
use log::debug;
use ndarray::{Array2, Axis, concatenate};
use std::collections::BTreeSet;

/// Merge `inputs` into one result over the sorted union of their groups.
///
/// Each input is first reindexed onto the union using the intermediate fill value of every
/// channel. Channels are then merged independently with the combine kernels, except for arg
/// reductions whose value and index channels are merged together so the winning value
/// selects the reported position.
///
/// # Errors
/// If an arg reduction has fewer than two channels or the inputs disagree in shape.
pub fn combine(
    inputs: &[IntermediateResult],
    agg: &ResolvedAggregation,
    kwargs: &FinalizeKwargs,
) -> Result<IntermediateResult> {
    let rows = inputs.first().map_or(0, IntermediateResult::nrows);
    let union: Vec<Label> = inputs
        .iter()
        .flat_map(|input| input.groups.iter())
        .filter(|label| !label.is_missing())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .cloned()
        .collect();
    debug!(
        "Combining {} intermediates over {} groups",
        inputs.len(),
        union.len()
    );
    if union.is_empty() {
        return Ok(IntermediateResult::filled(
            rows,
            Vec::new(),
            &agg.intermediate_fill,
        ));
    }

    let reindexed = inputs
        .iter()
        .map(|input| input.reindexed(&union, &agg.intermediate_fill))
        .collect::<Result<Vec<_>>>()?;
    let concatenated = (0..agg.combine.len())
        .map(|channel| {
            let views: Vec<_> = reindexed
                .iter()
                .map(|input| input.intermediates[channel].view())
                .collect();
            concatenate(Axis(1), &views)
        })
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let size = union.len();
    let codes: Vec<usize> = (0..inputs.len()).flat_map(|_| 0..size).collect();

    let mut intermediates: Vec<Array2<f64>> = Vec::with_capacity(agg.combine.len());
    let mut first_independent = 0;
    if agg.is_argreduce() {
        if concatenated.len() < 2 {
            return Err(GroupbyError::unsupported(format!(
                "arg reduction {} needs a value and an index channel",
                agg.name
            )));
        }
        let index: Vec<f64> = concatenated[1].iter().copied().collect();
        let spec = ChunkSpec {
            kernels: &agg.combine[..2],
            fill_values: &agg.intermediate_fill[..2],
            nax: 1,
            expected: None,
            reindex: false,
            kwargs,
        };
        intermediates.extend(reduce_matrix(
            concatenated[0].view(),
            &codes,
            size,
            &spec,
            Some(&index),
        ));
        first_independent = 2;
    }
    for channel in first_independent..concatenated.len() {
        intermediates.push(agg.combine[channel].aggregate(
            &codes,
            concatenated[channel].view(),
            size,
            agg.intermediate_fill[channel],
            kwargs,
        ));
    }

    Ok(IntermediateResult {
        groups: union,
        intermediates,
    })
}
