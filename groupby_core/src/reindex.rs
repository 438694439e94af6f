//! Re-expressing the group axis of a result in another group order.
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
    label::Label,
};
use ndarray::{Array2, Axis};
use std::collections::HashMap;

/// Reorder the last axis of `array` from the groups `from` onto the groups `to`.
///
/// Groups of `to` not present in `from` are set to `fill_value`. Missing labels in `from`
/// never match anything. Reindexing onto the existing group set returns a copy.
///
/// # Errors
/// If a group needs filling but `fill_value` is `None`.
pub fn reindex(
    array: &Array2<f64>,
    from: &[Label],
    to: &[Label],
    fill_value: Option<f64>,
) -> Result<Array2<f64>> {
    debug_assert_eq!(array.ncols(), from.len());
    if from == to {
        return Ok(array.clone());
    }
    let positions: HashMap<&Label, usize> = from
        .iter()
        .enumerate()
        .filter(|(_, label)| !label.is_missing())
        .map(|(position, label)| (label, position))
        .collect();
    let sources: Vec<Option<usize>> = to.iter().map(|label| positions.get(label).copied()).collect();
    let fill = if sources.iter().any(Option::is_none) {
        fill_value.ok_or(GroupbyError::MissingFillValue)?
    } else {
        f64::NAN
    };

    let mut out = Array2::from_elem((array.nrows(), to.len()), fill);
    for (mut column, source) in out.axis_iter_mut(Axis(1)).zip(&sources) {
        if let Some(source) = source {
            column.assign(&array.column(*source));
        }
    }
    Ok(out)
}
