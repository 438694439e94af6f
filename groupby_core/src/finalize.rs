//! Conversion of merged intermediates into the user-facing statistic.
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
    intermediate::IntermediateResult,
    label::Label,
    reindex::reindex,
};
use aggregations::{FinalizeKwargs, ResolvedAggregation};
use ndarray::{Array2, Axis, Zip};

/// A finished reduction of one block or tree, shaped `(rows, groups.len())`.
#[derive(Debug, Clone, PartialEq)]
pub struct FinalResult {
    pub name: String,
    pub values: Array2<f64>,
    pub groups: Vec<Label>,
}

/// Derive the statistic from `merged`, mask sparse groups and reindex onto `expected`.
///
/// When the aggregation carries a count channel, every group with fewer than `min_count`
/// (default 1) counted elements is set to `fill_value`.
///
/// # Errors
/// If masking or reindexing needs `fill_value` but it is `None`.
pub fn finalize(
    merged: IntermediateResult,
    agg: &ResolvedAggregation,
    expected: Option<&[Label]>,
    fill_value: Option<f64>,
    min_count: Option<usize>,
    kwargs: &FinalizeKwargs,
) -> Result<FinalResult> {
    let merged = without_missing_group(merged);
    let value_channels = agg.value_channels().min(merged.intermediates.len());
    let mut values = match &agg.finalize {
        None => merged
            .intermediates
            .first()
            .cloned()
            .unwrap_or_else(|| Array2::zeros((0, merged.groups.len()))),
        Some(step) => step.apply(&merged.intermediates[..value_channels], kwargs),
    };

    if agg.count_channel {
        if let Some(counts) = merged.intermediates.last() {
            #[allow(clippy::cast_precision_loss)]
            let threshold = min_count.unwrap_or(1) as f64;
            if counts.iter().any(|count| *count < threshold) {
                let fill = fill_value.ok_or(GroupbyError::MissingFillValue)?;
                Zip::from(&mut values).and(counts).for_each(|value, count| {
                    if *count < threshold {
                        *value = fill;
                    }
                });
            }
        }
    }

    match expected {
        Some(expected) => Ok(FinalResult {
            name: agg.name.clone(),
            values: reindex(&values, &merged.groups, expected, fill_value)?,
            groups: expected.to_vec(),
        }),
        None => Ok(FinalResult {
            name: agg.name.clone(),
            values,
            groups: merged.groups,
        }),
    }
}

fn without_missing_group(merged: IntermediateResult) -> IntermediateResult {
    if !merged.groups.iter().any(Label::is_missing) {
        return merged;
    }
    let keep: Vec<usize> = merged
        .groups
        .iter()
        .enumerate()
        .filter(|(_, label)| !label.is_missing())
        .map(|(position, _)| position)
        .collect();
    IntermediateResult {
        groups: keep.iter().map(|&i| merged.groups[i].clone()).collect(),
        intermediates: merged
            .intermediates
            .iter()
            .map(|channel| channel.select(Axis(1), &keep))
            .collect(),
    }
}
