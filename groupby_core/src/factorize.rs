//! Conversion of raw grouping arrays into dense group codes.
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
    label::{GroupCode, Label},
};
use ndarray::ArrayViewD;
use std::collections::{BTreeSet, HashMap};

/// Strictly increasing bin edges. Bin `i` is the half-open interval `[edges[i], edges[i + 1])`.
#[derive(Debug, Clone, PartialEq)]
pub struct BinEdges(Vec<f64>);

impl BinEdges {
    /// # Errors
    /// If there are fewer than two edges or they are not strictly increasing.
    pub fn new(edges: Vec<f64>) -> Result<Self> {
        if edges.len() < 2 || edges.windows(2).any(|w| w[0].partial_cmp(&w[1]).is_none_or(|o| o.is_ge())) {
            return Err(GroupbyError::InvalidBins(edges));
        }
        Ok(Self(edges))
    }

    #[must_use]
    pub fn edges(&self) -> &[f64] {
        &self.0
    }

    #[must_use]
    pub fn nbins(&self) -> usize {
        self.0.len() - 1
    }

    /// Bin index of `value`, or `None` if it is NaN or outside every bin.
    #[must_use]
    pub fn bin(&self, value: f64) -> Option<usize> {
        if value.is_nan() {
            return None;
        }
        let above = self.0.partition_point(|edge| *edge <= value);
        (above > 0 && above < self.0.len()).then(|| above - 1)
    }

    /// The bin-index label that `label` falls into, missing when it is outside every bin.
    ///
    /// # Errors
    /// If `label` is not numeric.
    pub fn bin_label_of(&self, label: &Label) -> Result<Label> {
        let value = label
            .as_f64()
            .ok_or_else(|| GroupbyError::NonNumericLabel(label.to_string()))?;
        Ok(self.bin(value).map_or(Label::Missing, index_label))
    }

    /// Group labels of all bins: their indices.
    #[must_use]
    pub fn bin_labels(&self) -> Vec<Label> {
        (0..self.nbins()).map(index_label).collect()
    }
}

/// Label of a dense index, such as a bin or a combined group code.
#[allow(clippy::cast_possible_wrap)]
pub(crate) fn index_label(index: usize) -> Label {
    Label::Int(index as i64)
}

/// How one grouping input is assigned codes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Grouper<'a> {
    /// Dense rank of the distinct observed values in ascending order.
    Observed,
    /// Position within the given labels. Values not listed are missing.
    Expected(&'a [Label]),
    /// Bin index, with codes compacted over the bins actually observed.
    Bins(&'a BinEdges),
}

/// Output of [`factorize`].
#[derive(Debug, Clone, PartialEq)]
pub struct Factorized {
    /// One code per element of the grouping arrays, in row-major order.
    pub codes: Vec<GroupCode>,
    /// The labels behind the codes of each input.
    pub found_groups: Vec<Vec<Label>>,
    pub group_shape: Vec<usize>,
    pub ngroups: usize,
    /// Total code slots over all rows in offset mode.
    pub size: Option<usize>,
    pub offset_group: bool,
}

impl Factorized {
    /// Number of code slots a kernel must allocate.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size.unwrap_or(self.ngroups)
    }

    /// Codes in the kernel encoding, where `self.size()` marks missing.
    #[must_use]
    pub fn dense_codes(&self) -> Vec<usize> {
        let sentinel = self.size();
        self.codes.iter().map(|code| code.dense(sentinel)).collect()
    }

    #[must_use]
    pub fn all_missing(&self) -> bool {
        self.codes.iter().all(|code| *code == GroupCode::Missing)
    }
}

/// Factorize one or more equally shaped grouping arrays into a single set of codes.
///
/// Several inputs are combined with a row-major multi-index over their individual group
/// counts; an element missing in any input is missing overall. When `reduce_ndim` is
/// smaller than the dimensionality of `by`, the leading dimensions are not reduced and each
/// of their rows receives a private code range (`code + row * ngroups`).
///
/// # Errors
/// If inputs differ in shape, the grouper count does not match, or a binned input holds a
/// non-numeric label.
pub fn factorize(
    by: &[ArrayViewD<'_, Label>],
    groupers: &[Grouper<'_>],
    reduce_ndim: Option<usize>,
) -> Result<Factorized> {
    let Some(first) = by.first() else {
        return Err(GroupbyError::unsupported("at least one grouping array is required"));
    };
    if groupers.len() != by.len() {
        return Err(GroupbyError::unsupported(format!(
            "received {} groupers for {} grouping arrays",
            groupers.len(),
            by.len()
        )));
    }
    if let Some(other) = by.iter().find(|b| b.shape() != first.shape()) {
        return Err(GroupbyError::ShapeMismatch {
            array: first.shape().to_vec(),
            by: other.shape().to_vec(),
        });
    }

    let mut per_input = Vec::with_capacity(by.len());
    let mut found_groups = Vec::with_capacity(by.len());
    for (labels, grouper) in by.iter().zip(groupers) {
        let (codes, found) = factorize_one(labels, *grouper)?;
        per_input.push(codes);
        found_groups.push(found);
    }
    let group_shape: Vec<usize> = found_groups.iter().map(Vec::len).collect();
    let ngroups = group_shape.iter().product();

    let mut codes = ravel_multi_index(&per_input, &group_shape);

    let ndim = first.ndim();
    let offset_group = reduce_ndim.is_some_and(|n| n < ndim);
    let size = if offset_group {
        let reduced: usize = first.shape()[ndim - reduce_ndim.unwrap_or(ndim)..]
            .iter()
            .product();
        let rows = first.len().checked_div(reduced).unwrap_or(0);
        for (position, code) in codes.iter_mut().enumerate() {
            if let GroupCode::Valid(value) = code {
                *value += (position / reduced.max(1)) * ngroups;
            }
        }
        Some(rows * ngroups)
    } else {
        None
    };

    Ok(Factorized {
        codes,
        found_groups,
        group_shape,
        ngroups,
        size,
        offset_group,
    })
}

fn factorize_one(
    labels: &ArrayViewD<'_, Label>,
    grouper: Grouper<'_>,
) -> Result<(Vec<GroupCode>, Vec<Label>)> {
    match grouper {
        Grouper::Observed => {
            let found: Vec<Label> = labels
                .iter()
                .filter(|label| !label.is_missing())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .cloned()
                .collect();
            let codes = labels
                .iter()
                .map(|label| {
                    if label.is_missing() {
                        GroupCode::Missing
                    } else {
                        found
                            .binary_search(label)
                            .map_or(GroupCode::Missing, GroupCode::Valid)
                    }
                })
                .collect();
            Ok((codes, found))
        }
        Grouper::Expected(expected) => {
            let mut positions = HashMap::with_capacity(expected.len());
            for (position, label) in expected.iter().enumerate() {
                if !label.is_missing() {
                    positions.entry(label).or_insert(position);
                }
            }
            let codes = labels
                .iter()
                .map(|label| {
                    positions
                        .get(label)
                        .map_or(GroupCode::Missing, |&p| GroupCode::Valid(p))
                })
                .collect();
            Ok((codes, expected.to_vec()))
        }
        Grouper::Bins(edges) => {
            let bins = labels
                .iter()
                .map(|label| {
                    label
                        .as_f64()
                        .map(|value| edges.bin(value))
                        .ok_or_else(|| GroupbyError::NonNumericLabel(label.to_string()))
                })
                .collect::<Result<Vec<_>>>()?;
            let observed: Vec<usize> = bins
                .iter()
                .flatten()
                .copied()
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            let codes = bins
                .iter()
                .map(|bin| {
                    bin.and_then(|b| observed.binary_search(&b).ok())
                        .map_or(GroupCode::Missing, GroupCode::Valid)
                })
                .collect();
            Ok((codes, observed.into_iter().map(index_label).collect()))
        }
    }
}

fn ravel_multi_index(per_input: &[Vec<GroupCode>], group_shape: &[usize]) -> Vec<GroupCode> {
    if let [single] = per_input {
        return single.clone();
    }
    let len = per_input.first().map_or(0, Vec::len);
    (0..len)
        .map(|i| {
            per_input
                .iter()
                .zip(group_shape)
                .try_fold(0, |flat, (codes, &extent)| {
                    codes[i].valid().map(|code| flat * extent + code)
                })
                .map_or(GroupCode::Missing, GroupCode::Valid)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{BinEdges, Grouper, factorize};
    use crate::label::{GroupCode, Label};
    use color_eyre::eyre::Result;
    use ndarray::{ArrayD, IxDyn};
    use test_log::test;

    macro_rules! assert_error {
        ($err_expr: expr, $err_contents: expr) => {
            assert_eq!(
                $err_expr.err().map(|e| e.to_string()),
                Some($err_contents.to_string())
            )
        };
    }

    #[test]
    fn should_rank_observed_labels_in_sorted_order() -> Result<()> {
        // Given
        let by = labels(&[4], vec!["c".into(), "a".into(), Label::Missing, "c".into()]);

        // When
        let factorized = factorize(&[by.view()], &[Grouper::Observed], None)?;

        // Then
        assert_eq!(
            factorized.codes,
            vec![valid(1), valid(0), GroupCode::Missing, valid(1)]
        );
        assert_eq!(factorized.found_groups, vec![vec!["a".into(), "c".into()]]);
        assert_eq!(factorized.ngroups, 2);
        assert_eq!(factorized.size(), 2);
        assert_eq!(factorized.dense_codes(), vec![1, 0, 2, 1]);
        assert!(!factorized.offset_group);
        Ok(())
    }

    #[test]
    fn should_code_by_expected_position() -> Result<()> {
        // Given
        let expected = vec![Label::Int(30), Label::Int(10)];
        let by = labels(&[3], vec![Label::Int(10), Label::Int(20), Label::Int(30)]);

        // When
        let factorized = factorize(&[by.view()], &[Grouper::Expected(&expected)], None)?;

        // Then
        assert_eq!(
            factorized.codes,
            vec![valid(1), GroupCode::Missing, valid(0)]
        );
        assert_eq!(factorized.found_groups, vec![expected]);
        Ok(())
    }

    #[test]
    fn should_bin_closed_left_open_right() -> Result<()> {
        // Given
        let edges = BinEdges::new(vec![1.0, 2.0, 4.0, 5.0])?;
        let by = labels(
            &[7],
            vec![
                1.0.into(),
                1.5.into(),
                2.0.into(),
                Label::Int(3),
                5.0.into(),
                0.5.into(),
                Label::Missing,
            ],
        );

        // When
        let factorized = factorize(&[by.view()], &[Grouper::Bins(&edges)], None)?;

        // Then
        assert_eq!(
            factorized.codes,
            vec![
                valid(0),
                valid(0),
                valid(1),
                valid(1),
                GroupCode::Missing,
                GroupCode::Missing,
                GroupCode::Missing
            ]
        );
        assert_eq!(factorized.found_groups, vec![vec![Label::Int(0), Label::Int(1)]]);
        Ok(())
    }

    #[test]
    fn should_label_values_by_bin_index() -> Result<()> {
        let edges = BinEdges::new(vec![0.0, 10.0, 20.0])?;
        assert_eq!(edges.bin_label_of(&Label::Int(10))?, Label::Int(1));
        assert_eq!(edges.bin_label_of(&Label::from(20.0))?, Label::Missing);
        assert_error!(
            edges.bin_label_of(&Label::from("x")),
            "cannot bin non-numeric label x"
        );
        Ok(())
    }

    #[test]
    fn should_reject_bad_bins() {
        assert_error!(
            BinEdges::new(vec![1.0, 1.0]),
            "bin edges must be strictly increasing with at least two edges, received [1.0, 1.0]"
        );
        assert!(BinEdges::new(vec![1.0]).is_err());
    }

    #[test]
    fn should_reject_non_numeric_binned_label() -> Result<()> {
        let edges = BinEdges::new(vec![0.0, 1.0])?;
        let by = labels(&[1], vec!["x".into()]);
        assert_error!(
            factorize(&[by.view()], &[Grouper::Bins(&edges)], None),
            "cannot bin non-numeric label x"
        );
        Ok(())
    }

    #[test]
    fn should_combine_keys_with_mixed_radix() -> Result<()> {
        // Given
        let first = labels(&[4], vec!["a".into(), "b".into(), "a".into(), Label::Missing]);
        let second = labels(&[4], vec![Label::Int(1), Label::Int(1), Label::Int(3), Label::Int(3)]);

        // When
        let factorized = factorize(
            &[first.view(), second.view()],
            &[Grouper::Observed, Grouper::Observed],
            None,
        )?;

        // Then
        assert_eq!(factorized.group_shape, vec![2, 2]);
        assert_eq!(factorized.ngroups, 4);
        assert_eq!(
            factorized.codes,
            vec![valid(0), valid(2), valid(1), GroupCode::Missing]
        );
        Ok(())
    }

    #[test]
    fn should_offset_rows_not_reduced() -> Result<()> {
        // Given
        let by = labels(
            &[2, 3],
            vec![
                "x".into(),
                "y".into(),
                "x".into(),
                "y".into(),
                Label::Missing,
                "y".into(),
            ],
        );

        // When
        let factorized = factorize(&[by.view()], &[Grouper::Observed], Some(1))?;

        // Then
        assert!(factorized.offset_group);
        assert_eq!(factorized.ngroups, 2);
        assert_eq!(factorized.size, Some(4));
        assert_eq!(factorized.dense_codes(), vec![0, 1, 0, 3, 4, 3]);
        Ok(())
    }

    #[test]
    fn should_reject_mismatched_shapes() {
        let first = labels(&[2], vec![Label::Int(1), Label::Int(2)]);
        let second = labels(&[3], vec![Label::Int(1), Label::Int(2), Label::Int(3)]);
        assert!(
            factorize(
                &[first.view(), second.view()],
                &[Grouper::Observed, Grouper::Observed],
                None
            )
            .is_err()
        );
    }

    fn labels(shape: &[usize], values: Vec<Label>) -> ArrayD<Label> {
        ArrayD::from_shape_vec(IxDyn(shape), values).expect("shape matches values")
    }

    fn valid(code: usize) -> GroupCode {
        GroupCode::Valid(code)
    }
}
