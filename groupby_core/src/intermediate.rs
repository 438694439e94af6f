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
use crate::{error::Result, label::Label, reindex::reindex};
use ndarray::{Array2, s};
use std::ops::Range;

/// Partial statistics of one block or tree node.
///
/// Every channel has shape `(rows, groups.len())`, where `rows` counts the flattened
/// non-reduced positions of the block. Channel order follows the chunk kernels of the
/// aggregation.
#[derive(Debug, Clone, PartialEq)]
pub struct IntermediateResult {
    pub groups: Vec<Label>,
    pub intermediates: Vec<Array2<f64>>,
}

impl IntermediateResult {
    /// A result for `groups` holding only fill values.
    #[must_use]
    pub fn filled(rows: usize, groups: Vec<Label>, fill_values: &[f64]) -> Self {
        let intermediates = fill_values
            .iter()
            .map(|fill| Array2::from_elem((rows, groups.len()), *fill))
            .collect();
        Self {
            groups,
            intermediates,
        }
    }

    #[must_use]
    pub fn nrows(&self) -> usize {
        self.intermediates.first().map_or(0, Array2::nrows)
    }

    /// Are there no real groups in this result?
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.iter().all(Label::is_missing)
    }

    /// Reindex every channel onto `to`, filling each channel with its own fill value.
    ///
    /// # Errors
    /// Never in practice, since every channel is given a fill value.
    pub fn reindexed(&self, to: &[Label], fill_values: &[f64]) -> Result<Self> {
        let intermediates = self
            .intermediates
            .iter()
            .zip(fill_values)
            .map(|(channel, fill)| reindex(channel, &self.groups, to, Some(*fill)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            groups: to.to_vec(),
            intermediates,
        })
    }

    /// The contiguous range of groups `range`, for splitting a reduction into
    /// independent sub-trees.
    #[must_use]
    pub fn select_groups(&self, range: Range<usize>) -> Self {
        Self {
            groups: self.groups[range.clone()].to_vec(),
            intermediates: self
                .intermediates
                .iter()
                .map(|channel| channel.slice(s![.., range.clone()]).to_owned())
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::IntermediateResult;
    use crate::label::Label;
    use color_eyre::eyre::Result;
    use ndarray::array;
    use test_log::test;

    #[test]
    fn should_reindex_each_channel_with_its_fill() -> Result<()> {
        // Given
        let result = IntermediateResult {
            groups: vec![Label::Int(2)],
            intermediates: vec![array![[5.0]], array![[1.0]]],
        };

        // When
        let out = result.reindexed(&[Label::Int(1), Label::Int(2)], &[f64::NEG_INFINITY, 0.0])?;

        // Then
        assert_eq!(out.groups, vec![Label::Int(1), Label::Int(2)]);
        assert_eq!(out.intermediates[0], array![[f64::NEG_INFINITY, 5.0]]);
        assert_eq!(out.intermediates[1], array![[0.0, 1.0]]);
        Ok(())
    }

    #[test]
    fn should_select_group_range() {
        let result = IntermediateResult {
            groups: vec![Label::Int(0), Label::Int(1), Label::Int(2)],
            intermediates: vec![array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]],
        };
        let out = result.select_groups(1..3);
        assert_eq!(out.groups, vec![Label::Int(1), Label::Int(2)]);
        assert_eq!(out.intermediates[0], array![[2.0, 3.0], [5.0, 6.0]]);
    }

    #[test]
    fn should_report_empty_when_only_missing() {
        let result = IntermediateResult::filled(3, vec![Label::Missing], &[0.0]);
        assert!(result.is_empty());
        assert_eq!(result.nrows(), 3);
    }
}
