//! Group-wise reduction kernels and named aggregation recipes.
//!
//! A [`Kernel`] reduces the columns of a 2-D block of values into one column per group
//! code. An [`Aggregation`] describes how a user-facing statistic is built from kernels in
//! three stages: a chunk stage run on every block, a combine stage that merges partial
//! results, and an optional finalize step that derives the statistic from the merged
//! intermediates. The [`AggregationCatalog`] maps reduction names to recipes.
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
mod aggregation;
mod catalog;
mod kernels;
pub mod request;

pub use aggregation::{
    Aggregation, Dtype, FillValue, Finalize, FinalizeFn, ReductionType, ResolvedAggregation,
    StageFillValues,
};
pub use catalog::AggregationCatalog;
pub use kernels::{CustomKernel, FinalizeKwargs, Kernel, KernelFn};
use thiserror::Error;

/// Errors raised while looking up kernels or aggregation recipes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AggregationError {
    #[error("Reduction \"{name}\" not implemented yet")]
    UnknownReduction { name: String },
    #[error("unrecognised kernel name \"{name}\"")]
    UnknownKernel { name: String },
}
