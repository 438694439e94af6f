//! Per-call configuration of a grouped reduction.
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
    factorize::BinEdges,
    label::Label,
};
use aggregations::FinalizeKwargs;
use std::{
    collections::HashSet,
    fmt::{Display, Formatter},
};

/// The canonical groups of a result.
#[derive(Debug, Clone, PartialEq)]
pub enum ExpectedGroups {
    /// These labels, in this order.
    Labels(Vec<Label>),
    /// One group per bin, labelled by bin index.
    Bins(BinEdges),
}

impl ExpectedGroups {
    /// Group labels of the result.
    #[must_use]
    pub fn labels(&self) -> Vec<Label> {
        match self {
            Self::Labels(labels) => labels.clone(),
            Self::Bins(edges) => edges.bin_labels(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Labels(labels) => labels.len(),
            Self::Bins(edges) => edges.nbins(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Strategy for reducing chunked inputs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Method {
    /// Reduce every block, then merge the partial results in a tree.
    #[default]
    MapReduce,
    /// Reduce each block independently; every group must lie within one block.
    Blockwise,
    /// Reduce each set of groups that share blocks on its own.
    Cohorts,
}

impl TryFrom<&str> for Method {
    type Error = GroupbyError;
    fn try_from(value: &str) -> Result<Self> {
        match value.to_lowercase().as_str() {
            "mapreduce" => Ok(Self::MapReduce),
            "blockwise" => Ok(Self::Blockwise),
            "cohorts" => Ok(Self::Cohorts),
            _ => Err(GroupbyError::InvalidConfig(format!(
                "unknown method {value:?}, expected one of mapreduce, blockwise, cohorts"
            ))),
        }
    }
}

impl Display for Method {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MapReduce => write!(f, "mapreduce"),
            Self::Blockwise => write!(f, "blockwise"),
            Self::Cohorts => write!(f, "cohorts"),
        }
    }
}

/// Options of one grouped reduction. Build with [`GroupbyConfigBuilder`].
#[derive(Debug, Clone, PartialEq)]
pub struct GroupbyConfig {
    /// Canonical result groups. Inferred from an in-memory `by` when absent.
    expected_groups: Option<ExpectedGroups>,
    /// Axes of the array to reduce. Defaults to all axes of `by`.
    axis: Option<Vec<isize>>,
    /// Value of groups with no data. Defaults to the aggregation's own fill value.
    fill_value: Option<f64>,
    /// Skip NaN elements? Unset behaves as true for float input.
    skipna: Option<bool>,
    /// Groups with fewer valid elements are set to NaN.
    min_count: Option<usize>,
    /// Number of independent reduction trees over the expected groups.
    split_out: usize,
    method: Method,
    finalize_kwargs: FinalizeKwargs,
}

impl GroupbyConfig {
    #[must_use]
    pub fn expected_groups(&self) -> Option<&ExpectedGroups> {
        self.expected_groups.as_ref()
    }

    #[must_use]
    pub fn axis(&self) -> Option<&[isize]> {
        self.axis.as_deref()
    }

    #[must_use]
    pub fn fill_value(&self) -> Option<f64> {
        self.fill_value
    }

    #[must_use]
    pub fn skipna(&self) -> Option<bool> {
        self.skipna
    }

    #[must_use]
    pub fn min_count(&self) -> Option<usize> {
        self.min_count
    }

    #[must_use]
    pub fn split_out(&self) -> usize {
        self.split_out
    }

    #[must_use]
    pub fn method(&self) -> Method {
        self.method
    }

    #[must_use]
    pub fn finalize_kwargs(&self) -> &FinalizeKwargs {
        &self.finalize_kwargs
    }

    /// This configuration with different expected groups.
    pub(crate) fn with_expected_groups(&self, expected_groups: Option<ExpectedGroups>) -> Self {
        Self {
            expected_groups,
            ..self.clone()
        }
    }

    /// Decide how a call with these inputs runs.
    ///
    /// Every unsupported combination is reported here, before any block is reduced.
    ///
    /// # Errors
    /// If the inputs and options cannot be reduced together.
    pub fn plan(&self, inputs: &PlanInputs<'_>) -> Result<ReductionPlan> {
        if !inputs.array_chunked && !inputs.by_chunked {
            return Ok(ReductionPlan::InMemory);
        }
        if matches!(inputs.func, "first" | "last") {
            return Err(GroupbyError::unsupported(
                "first, last not implemented for chunked arrays",
            ));
        }
        if self.split_out > 1 && !inputs.expected_known {
            return Err(GroupbyError::unsupported(
                "split_out > 1 requires expected_groups, unknown groups cannot be split",
            ));
        }
        match self.method {
            Method::MapReduce => Ok(ReductionPlan::MapReduce {
                split_out: self.split_out,
            }),
            Method::Blockwise => {
                if !inputs.expected_known {
                    return Err(GroupbyError::unsupported(
                        "For method blockwise, expected_groups must be known",
                    ));
                }
                if self.split_out > 1 {
                    return Err(GroupbyError::unsupported(
                        "split_out > 1 is not supported with method blockwise",
                    ));
                }
                if inputs.reduced_axes != 1 {
                    return Err(GroupbyError::unsupported(format!(
                        "method blockwise reduces a single axis, received {} axes",
                        inputs.reduced_axes
                    )));
                }
                if inputs.by_ndim != 1 {
                    return Err(GroupbyError::unsupported(format!(
                        "For method blockwise, by must be 1D. Received {} dimensions instead.",
                        inputs.by_ndim
                    )));
                }
                if inputs.by_chunked {
                    return Err(GroupbyError::unsupported(
                        "For method blockwise, by must be held in memory",
                    ));
                }
                if inputs.argreduce {
                    return Err(GroupbyError::unsupported(format!(
                        "{} is not supported with method blockwise",
                        inputs.func
                    )));
                }
                Ok(ReductionPlan::Blockwise)
            }
            Method::Cohorts => {
                if inputs.reduced_axes != 1 || inputs.by_ndim != 1 {
                    return Err(GroupbyError::unsupported(format!(
                        "method cohorts reduces a single axis of a 1D by, received {} axes of a {}D by",
                        inputs.reduced_axes, inputs.by_ndim
                    )));
                }
                Ok(ReductionPlan::Cohorts {
                    split_out: self.split_out,
                })
            }
        }
    }
}

impl Display for GroupbyConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "method {}, axis {:?}, ", self.method, self.axis)?;
        match &self.expected_groups {
            None => write!(f, "observed groups")?,
            Some(ExpectedGroups::Labels(labels)) => write!(f, "{} expected groups", labels.len())?,
            Some(ExpectedGroups::Bins(edges)) => write!(f, "bins {:?}", edges.edges())?,
        }
        write!(
            f,
            ", fill value {:?}, skipna {:?}, min count {:?}, split out {}, ddof {}",
            self.fill_value, self.skipna, self.min_count, self.split_out, self.finalize_kwargs.ddof
        )
    }
}

/// Facts about the inputs of one call that decide how it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanInputs<'a> {
    /// Reduction name after NaN-skipping substitution.
    pub func: &'a str,
    pub array_chunked: bool,
    pub by_chunked: bool,
    pub by_ndim: usize,
    pub reduced_axes: usize,
    /// Are the result groups known before reducing any block?
    pub expected_known: bool,
    pub argreduce: bool,
}

/// A validated way of running one reduction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReductionPlan {
    /// Both inputs in memory: one direct pass over the whole array.
    InMemory,
    MapReduce { split_out: usize },
    Blockwise,
    Cohorts { split_out: usize },
}

impl Display for ReductionPlan {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InMemory => write!(f, "in-memory"),
            Self::MapReduce { split_out } => write!(f, "mapreduce with split_out {split_out}"),
            Self::Blockwise => write!(f, "blockwise"),
            Self::Cohorts { split_out } => write!(f, "cohorts with split_out {split_out}"),
        }
    }
}

/// Builder for `GroupbyConfig`.
#[derive(Debug, Clone)]
pub struct GroupbyConfigBuilder {
    expected_groups: Option<ExpectedGroups>,
    axis: Option<Vec<isize>>,
    fill_value: Option<f64>,
    skipna: Option<bool>,
    min_count: Option<usize>,
    split_out: usize,
    method: Method,
    finalize_kwargs: FinalizeKwargs,
}

impl Default for GroupbyConfigBuilder {
    fn default() -> Self {
        Self {
            expected_groups: None,
            axis: None,
            fill_value: None,
            skipna: None,
            min_count: None,
            split_out: 1,
            method: Method::default(),
            finalize_kwargs: FinalizeKwargs::default(),
        }
    }
}

impl GroupbyConfigBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn expected_groups(mut self, expected_groups: Option<ExpectedGroups>) -> Self {
        self.expected_groups = expected_groups;
        self
    }

    #[must_use]
    pub fn axis(mut self, axis: Option<Vec<isize>>) -> Self {
        self.axis = axis;
        self
    }

    #[must_use]
    pub fn fill_value(mut self, fill_value: Option<f64>) -> Self {
        self.fill_value = fill_value;
        self
    }

    #[must_use]
    pub fn skipna(mut self, skipna: Option<bool>) -> Self {
        self.skipna = skipna;
        self
    }

    #[must_use]
    pub fn min_count(mut self, min_count: Option<usize>) -> Self {
        self.min_count = min_count;
        self
    }

    #[must_use]
    pub fn split_out(mut self, split_out: usize) -> Self {
        self.split_out = split_out;
        self
    }

    #[must_use]
    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    #[must_use]
    pub fn finalize_kwargs(mut self, finalize_kwargs: FinalizeKwargs) -> Self {
        self.finalize_kwargs = finalize_kwargs;
        self
    }

    /// Build the `GroupbyConfig`, consuming the builder.
    ///
    /// # Errors
    /// The configuration must validate. `split_out` must be at least 1, an axis list
    /// mustn't be empty and expected labels must be distinct and not missing.
    pub fn build(self) -> Result<GroupbyConfig> {
        self.validate()?;
        Ok(GroupbyConfig {
            expected_groups: self.expected_groups,
            axis: self.axis,
            fill_value: self.fill_value,
            skipna: self.skipna,
            min_count: self.min_count,
            split_out: self.split_out,
            method: self.method,
            finalize_kwargs: self.finalize_kwargs,
        })
    }

    fn validate(&self) -> Result<()> {
        if self.split_out == 0 {
            return Err(GroupbyError::InvalidConfig(
                "split_out must be at least 1".into(),
            ));
        }
        if self.axis.as_ref().is_some_and(Vec::is_empty) {
            return Err(GroupbyError::InvalidConfig(
                "axis must name at least one axis".into(),
            ));
        }
        if let Some(ExpectedGroups::Labels(labels)) = &self.expected_groups {
            if labels.iter().any(Label::is_missing) {
                return Err(GroupbyError::InvalidConfig(
                    "expected_groups must not contain missing labels".into(),
                ));
            }
            let distinct: HashSet<&Label> = labels.iter().collect();
            if distinct.len() != labels.len() {
                return Err(GroupbyError::InvalidConfig(
                    "expected_groups must not contain duplicates".into(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{ExpectedGroups, GroupbyConfigBuilder, Method, PlanInputs, ReductionPlan};
    use crate::{factorize::BinEdges, label::Label};
    use color_eyre::eyre::Result;
    use test_log::test;

    macro_rules! assert_error {
        ($err_expr: expr, $err_contents: expr) => {
            assert_eq!(
                $err_expr.err().map(|e| e.to_string()),
                Some($err_contents.to_string())
            )
        };
    }

    fn chunked_inputs() -> PlanInputs<'static> {
        PlanInputs {
            func: "nansum",
            array_chunked: true,
            by_chunked: false,
            by_ndim: 1,
            reduced_axes: 1,
            expected_known: true,
            argreduce: false,
        }
    }

    #[test]
    fn should_default_to_mapreduce_without_split() -> Result<()> {
        // Given
        let config = GroupbyConfigBuilder::new().build()?;

        // Then
        assert_eq!(config.method(), Method::MapReduce);
        assert_eq!(config.split_out(), 1);
        assert_eq!(config.expected_groups(), None);
        assert_eq!(config.finalize_kwargs().ddof, 0);
        Ok(())
    }

    #[test]
    fn should_parse_method_ignoring_case() -> Result<()> {
        assert_eq!(Method::try_from("Cohorts")?, Method::Cohorts);
        assert_eq!(Method::try_from("BLOCKWISE")?, Method::Blockwise);
        assert_error!(
            Method::try_from("shuffle"),
            "invalid configuration: unknown method \"shuffle\", expected one of mapreduce, blockwise, cohorts"
        );
        Ok(())
    }

    #[test]
    fn should_reject_zero_split_out() {
        assert_error!(
            GroupbyConfigBuilder::new().split_out(0).build(),
            "invalid configuration: split_out must be at least 1"
        );
    }

    #[test]
    fn should_reject_empty_axis_list() {
        assert_error!(
            GroupbyConfigBuilder::new().axis(Some(vec![])).build(),
            "invalid configuration: axis must name at least one axis"
        );
    }

    #[test]
    fn should_reject_duplicate_expected_groups() {
        let expected = ExpectedGroups::Labels(vec![Label::Int(1), Label::Int(2), Label::Int(1)]);
        assert_error!(
            GroupbyConfigBuilder::new()
                .expected_groups(Some(expected))
                .build(),
            "invalid configuration: expected_groups must not contain duplicates"
        );
    }

    #[test]
    fn should_list_bin_groups() -> Result<()> {
        let expected = ExpectedGroups::Bins(BinEdges::new(vec![1.0, 2.0, 4.0, 5.0])?);
        assert_eq!(expected.len(), 3);
        assert_eq!(
            expected.labels(),
            vec![Label::Int(0), Label::Int(1), Label::Int(2)]
        );
        Ok(())
    }

    #[test]
    fn should_run_in_memory_whatever_the_method() -> Result<()> {
        // Given
        let config = GroupbyConfigBuilder::new()
            .method(Method::Blockwise)
            .build()?;
        let inputs = PlanInputs {
            array_chunked: false,
            expected_known: false,
            ..chunked_inputs()
        };

        // When
        let plan = config.plan(&inputs)?;

        // Then
        assert_eq!(plan, ReductionPlan::InMemory);
        Ok(())
    }

    #[test]
    fn should_plan_split_mapreduce() -> Result<()> {
        let config = GroupbyConfigBuilder::new().split_out(3).build()?;
        assert_eq!(
            config.plan(&chunked_inputs())?,
            ReductionPlan::MapReduce { split_out: 3 }
        );
        Ok(())
    }

    #[test]
    fn should_require_expected_groups_to_split() -> Result<()> {
        let config = GroupbyConfigBuilder::new().split_out(2).build()?;
        let inputs = PlanInputs {
            expected_known: false,
            ..chunked_inputs()
        };
        assert_error!(
            config.plan(&inputs),
            "split_out > 1 requires expected_groups, unknown groups cannot be split"
        );
        Ok(())
    }

    #[test]
    fn should_reject_first_on_chunked_input() -> Result<()> {
        let config = GroupbyConfigBuilder::new().build()?;
        let inputs = PlanInputs {
            func: "first",
            ..chunked_inputs()
        };
        assert_error!(
            config.plan(&inputs),
            "first, last not implemented for chunked arrays"
        );
        Ok(())
    }

    #[test]
    fn should_validate_blockwise_preconditions() -> Result<()> {
        // Given
        let config = GroupbyConfigBuilder::new()
            .method(Method::Blockwise)
            .build()?;

        // Then
        assert_eq!(config.plan(&chunked_inputs())?, ReductionPlan::Blockwise);
        assert_error!(
            config.plan(&PlanInputs {
                by_ndim: 2,
                ..chunked_inputs()
            }),
            "For method blockwise, by must be 1D. Received 2 dimensions instead."
        );
        assert_error!(
            config.plan(&PlanInputs {
                by_chunked: true,
                ..chunked_inputs()
            }),
            "For method blockwise, by must be held in memory"
        );
        assert_error!(
            config.plan(&PlanInputs {
                func: "argmax",
                argreduce: true,
                ..chunked_inputs()
            }),
            "argmax is not supported with method blockwise"
        );
        assert_error!(
            config.plan(&PlanInputs {
                expected_known: false,
                ..chunked_inputs()
            }),
            "For method blockwise, expected_groups must be known"
        );
        Ok(())
    }

    #[test]
    fn should_require_single_axis_for_cohorts() -> Result<()> {
        let config = GroupbyConfigBuilder::new().method(Method::Cohorts).build()?;
        assert_eq!(
            config.plan(&chunked_inputs())?,
            ReductionPlan::Cohorts { split_out: 1 }
        );
        assert_error!(
            config.plan(&PlanInputs {
                reduced_axes: 2,
                by_ndim: 2,
                ..chunked_inputs()
            }),
            "method cohorts reduces a single axis of a 1D by, received 2 axes of a 2D by"
        );
        Ok(())
    }

    #[test]
    fn should_summarise_for_logging() -> Result<()> {
        let config = GroupbyConfigBuilder::new()
            .axis(Some(vec![-1]))
            .min_count(Some(2))
            .build()?;
        assert_eq!(
            config.to_string(),
            "method mapreduce, axis Some([-1]), observed groups, fill value None, skipna None, min count Some(2), split out 1, ddof 0"
        );
        Ok(())
    }
}
