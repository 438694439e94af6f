//! Discovery of groups that always occur in the same blocks.
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
};
use log::debug;
use ndarray::ArrayViewD;
use nohash::IntSet;
use std::collections::{BTreeSet, HashMap};

/// Groups sharing one set of blocks along the reduced axis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cohort {
    /// Indices of the blocks holding these groups, ascending.
    pub blocks: Vec<usize>,
    /// Member groups, ascending.
    pub groups: Vec<Label>,
}

/// Find cohorts of the labels in `labels`, blocked along its last axis by `chunks`.
///
/// Groups whose elements touch exactly the same blocks form one cohort. With `merge`,
/// cohorts are visited from the widest block set down and any later cohort whose blocks are
/// a subset of an earlier one is folded into it. Missing labels belong to no cohort.
///
/// # Errors
/// If `chunks` does not sum to the length of the last axis.
pub fn find_cohorts(
    labels: ArrayViewD<'_, Label>,
    chunks: &[usize],
    merge: bool,
) -> Result<Vec<Cohort>> {
    let axis = labels.ndim().saturating_sub(1);
    let len = labels.shape().last().copied().unwrap_or(0);
    if chunks.iter().sum::<usize>() != len {
        return Err(GroupbyError::InvalidChunks {
            axis,
            len,
            chunks: chunks.to_vec(),
        });
    }
    let which_block: Vec<usize> = chunks
        .iter()
        .enumerate()
        .flat_map(|(block, size)| std::iter::repeat_n(block, *size))
        .collect();

    let factorized = factorize(&[labels.view()], &[Grouper::Observed], None)?;
    let found = factorized.found_groups.into_iter().next().unwrap_or_default();
    let mut touched = vec![BTreeSet::new(); found.len()];
    for (position, code) in factorized.codes.iter().enumerate() {
        if let Some(code) = code.valid() {
            touched[code].insert(which_block[position % len.max(1)]);
        }
    }

    let mut signatures: Vec<Vec<usize>> = Vec::new();
    let mut members: Vec<Vec<usize>> = Vec::new();
    let mut seen: HashMap<Vec<usize>, usize> = HashMap::new();
    for (code, blocks) in touched.into_iter().enumerate() {
        let signature: Vec<usize> = blocks.into_iter().collect();
        if let Some(&cohort) = seen.get(&signature) {
            members[cohort].push(code);
        } else {
            seen.insert(signature.clone(), signatures.len());
            signatures.push(signature);
            members.push(vec![code]);
        }
    }

    let mut cohorts: Vec<(Vec<usize>, Vec<usize>)> = signatures.into_iter().zip(members).collect();
    if merge {
        cohorts = merge_subsets(cohorts);
    }
    debug!("Found {} cohorts over {} blocks", cohorts.len(), chunks.len());

    Ok(cohorts
        .into_iter()
        .map(|(blocks, mut codes)| {
            codes.sort_unstable();
            Cohort {
                blocks,
                groups: codes.into_iter().map(|code| found[code].clone()).collect(),
            }
        })
        .collect())
}

fn merge_subsets(mut cohorts: Vec<(Vec<usize>, Vec<usize>)>) -> Vec<(Vec<usize>, Vec<usize>)> {
    cohorts.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
    let mut merged: IntSet<usize> = IntSet::default();
    let mut out = Vec::new();
    for (i, (blocks, codes)) in cohorts.iter().enumerate() {
        if merged.contains(&i) {
            continue;
        }
        let mut codes = codes.clone();
        for (j, (other_blocks, other_codes)) in cohorts.iter().enumerate().skip(i + 1) {
            if merged.contains(&j) {
                continue;
            }
            if other_blocks.iter().all(|b| blocks.binary_search(b).is_ok()) {
                codes.extend(other_codes);
                merged.insert(j);
            }
        }
        out.push((blocks.clone(), codes));
    }
    out
}

/// Indices along the blocked axis covered by `blocks`, in order.
#[must_use]
pub fn positions_of_blocks(chunks: &[usize], blocks: &[usize]) -> Vec<usize> {
    let starts: Vec<usize> = chunks
        .iter()
        .scan(0, |start, size| {
            let current = *start;
            *start += size;
            Some(current)
        })
        .collect();
    blocks
        .iter()
        .filter_map(|&block| chunks.get(block).map(|size| starts[block]..starts[block] + size))
        .flatten()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{Cohort, find_cohorts, positions_of_blocks};
    use crate::label::Label;
    use color_eyre::eyre::Result;
    use ndarray::{ArrayD, IxDyn};
    use std::collections::BTreeSet;
    use test_log::test;

    fn labels(shape: &[usize], values: &[&str]) -> ArrayD<Label> {
        ArrayD::from_shape_vec(
            IxDyn(shape),
            values
                .iter()
                .map(|v| if *v == "-" { Label::Missing } else { Label::from(*v) })
                .collect(),
        )
        .expect("labels fit shape")
    }

    fn cohort(blocks: &[usize], groups: &[&str]) -> Cohort {
        Cohort {
            blocks: blocks.to_vec(),
            groups: groups.iter().map(|g| Label::from(*g)).collect(),
        }
    }

    #[test]
    fn should_partition_groups_by_block_signature() -> Result<()> {
        // Given
        let by = labels(&[8], &["a", "a", "b", "b", "c", "c", "a", "-"]);

        // When
        let cohorts = find_cohorts(by.view(), &[2, 2, 2, 2], false)?;

        // Then
        assert_eq!(
            cohorts,
            vec![cohort(&[0, 3], &["a"]), cohort(&[1], &["b"]), cohort(&[2], &["c"])]
        );
        let all: BTreeSet<_> = cohorts.iter().flat_map(|c| c.groups.clone()).collect();
        let total: usize = cohorts.iter().map(|c| c.groups.len()).sum();
        assert_eq!(all.len(), 3);
        assert_eq!(total, 3);
        Ok(())
    }

    #[test]
    fn should_merge_subset_cohorts_into_wider_ones() -> Result<()> {
        // Given
        let by = labels(&[4], &["b", "a", "a", "c"]);

        // When
        let cohorts = find_cohorts(by.view(), &[2, 2], true)?;

        // Then
        assert_eq!(cohorts, vec![cohort(&[0, 1], &["a", "b", "c"])]);
        Ok(())
    }

    #[test]
    fn should_group_identical_signatures_together() -> Result<()> {
        let by = labels(&[6], &["x", "y", "y", "x", "z", "z"]);
        let cohorts = find_cohorts(by.view(), &[2, 2, 2], false)?;
        assert_eq!(cohorts, vec![cohort(&[0, 1], &["x", "y"]), cohort(&[2], &["z"])]);
        Ok(())
    }

    #[test]
    fn should_use_last_axis_of_multidimensional_labels() -> Result<()> {
        let by = labels(&[2, 2], &["p", "q", "q", "p"]);
        let cohorts = find_cohorts(by.view(), &[1, 1], false)?;
        assert_eq!(cohorts, vec![cohort(&[0, 1], &["p", "q"])]);
        Ok(())
    }

    #[test]
    fn should_reject_chunks_not_covering_labels() {
        let by = labels(&[3], &["a", "b", "c"]);
        assert_eq!(
            find_cohorts(by.view(), &[2, 2], false).err().map(|e| e.to_string()),
            Some("chunks [2, 2] do not sum to length 3 of axis 0".to_string())
        );
    }

    #[test]
    fn should_list_positions_of_blocks() {
        assert_eq!(positions_of_blocks(&[2, 3, 1], &[0, 2]), vec![0, 1, 5]);
    }
}
