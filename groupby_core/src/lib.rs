//! The `groupby_core` crate reduces arrays over groups given by a label array, either in
//! one pass when everything is in memory or block by block over chunked arrays.
//!
//! Block reductions produce intermediate results which are merged in a tree and finalized
//! into the requested statistic. Three strategies are available for chunked inputs: a
//! map-reduce over every block, a blockwise reduction once block boundaries sit on group
//! boundaries, and a cohort reduction that only merges the blocks each group set touches.
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
mod chunk;
mod cohorts;
mod combine;
mod config;
mod error;
mod factorize;
mod finalize;
mod intermediate;
mod label;
mod orchestrator;
mod rechunk;
mod reindex;
pub mod substrate;

pub use aggregations::{AggregationCatalog, Dtype, FinalizeKwargs};
pub use chunk::{ChunkSpec, chunk_argreduce, chunk_reduce};
pub use cohorts::{Cohort, find_cohorts, positions_of_blocks};
pub use combine::combine;
pub use config::{
    ExpectedGroups, GroupbyConfig, GroupbyConfigBuilder, Method, PlanInputs, ReductionPlan,
};
pub use error::{GroupbyError, Result};
pub use factorize::{BinEdges, Factorized, Grouper, factorize};
pub use finalize::{FinalResult, finalize};
pub use intermediate::IntermediateResult;
pub use label::{GroupCode, Label};
pub use orchestrator::{GroupKey, GroupbyEngine, GroupbyResult, MultiGroupbyResult};
pub use rechunk::{
    median_chunksize, plan_forced_boundaries, plan_group_boundaries, rechunk_for_blockwise,
    rechunk_for_cohorts,
};
pub use reindex::reindex;
pub use substrate::{ChunkedArray, DataArray, LocalScheduler, Scheduler, ThreadedScheduler};

/// Reduces `array` with `func` over the groups of `by` using the built-in aggregations on
/// the calling thread.
///
/// # Examples
/// ```
/// # use groupby_core::{groupby_reduce, DataArray, GroupbyConfigBuilder, Label};
/// # use ndarray::array;
/// # fn main() -> Result<(), groupby_core::GroupbyError> {
/// let values: DataArray<f64> = array![1.0, 2.0, 3.0, 4.0].into_dyn().into();
/// let by: DataArray<Label> = array![
///     Label::from("a"), Label::from("b"), Label::from("a"), Label::from("b")
/// ]
/// .into_dyn()
/// .into();
/// let result = groupby_reduce(&values, &by, "sum", &GroupbyConfigBuilder::new().build()?)?;
/// assert_eq!(result.groups, vec![Label::from("a"), Label::from("b")]);
/// assert_eq!(result.values.compute(), array![4.0, 6.0].into_dyn());
/// # Ok(())
/// # }
/// ```
///
/// # Errors
/// See [`GroupbyEngine::reduce`].
pub fn groupby_reduce(
    array: &DataArray<f64>,
    by: &DataArray<Label>,
    func: &str,
    config: &GroupbyConfig,
) -> Result<GroupbyResult> {
    let catalog = AggregationCatalog::default();
    GroupbyEngine::new(&catalog, LocalScheduler::default()).reduce(array, by, func, config)
}
