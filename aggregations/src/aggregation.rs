//! Aggregation recipes and their per-call resolution.
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
use crate::kernels::{FinalizeKwargs, Kernel};
use ndarray::{Array2, Zip};
use std::{
    fmt::{Debug, Display, Formatter},
    sync::Arc,
};

/// Element type of an input or result array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dtype {
    Float64,
    Int64,
    Bool,
}

impl Display for Dtype {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Float64 => write!(f, "float64"),
            Self::Int64 => write!(f, "int64"),
            Self::Bool => write!(f, "bool"),
        }
    }
}

/// A fill value that may depend on the dtype it is applied to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FillValue {
    Value(f64),
    /// Positive infinity, or the largest value for integer types.
    Inf,
    /// Negative infinity, or the smallest value for integer types.
    NegInf,
    /// Missing: NaN for floats, the smallest value for integer types.
    Na,
}

impl FillValue {
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn resolve(self, dtype: Dtype) -> f64 {
        match (self, dtype) {
            (Self::Value(value), _) => value,
            (Self::Inf, Dtype::Float64) => f64::INFINITY,
            (Self::Inf, Dtype::Int64) => i64::MAX as f64,
            (Self::Inf, Dtype::Bool) => 1.0,
            (Self::NegInf, Dtype::Float64) => f64::NEG_INFINITY,
            (Self::NegInf | Self::Na, Dtype::Int64) => i64::MIN as f64,
            (Self::NegInf | Self::Na, Dtype::Bool) => 0.0,
            (Self::Na, Dtype::Float64) => f64::NAN,
        }
    }
}

/// Fill values for groups absent from a partial result (`intermediate`, one per chunk
/// kernel) and from the final result.
#[derive(Debug, Clone, PartialEq)]
pub struct StageFillValues {
    pub intermediate: Vec<FillValue>,
    pub final_value: FillValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReductionType {
    Reduce,
    /// The result is a position in the input rather than a value.
    ArgReduce,
}

/// Signature of a user supplied finalize step.
pub type FinalizeFn = dyn Fn(&[Array2<f64>], &FinalizeKwargs) -> Array2<f64> + Send + Sync;

/// Derives the user-facing statistic from merged intermediates.
#[derive(Clone)]
pub enum Finalize {
    /// `sum / count`
    SumOverCount,
    /// Variance from sum of squares, sum and count.
    Variance,
    /// Square root of [`Finalize::Variance`].
    StdDev,
    /// Select the index channel of an arg reduction.
    ArgIndex,
    Custom(Arc<FinalizeFn>),
}

impl Debug for Finalize {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SumOverCount => write!(f, "SumOverCount"),
            Self::Variance => write!(f, "Variance"),
            Self::StdDev => write!(f, "StdDev"),
            Self::ArgIndex => write!(f, "ArgIndex"),
            Self::Custom(_) => write!(f, "Custom"),
        }
    }
}

impl Finalize {
    /// Apply to the intermediates, excluding any trailing count channel.
    #[must_use]
    pub fn apply(&self, intermediates: &[Array2<f64>], kwargs: &FinalizeKwargs) -> Array2<f64> {
        match self {
            Self::SumOverCount => &intermediates[0] / &intermediates[1],
            Self::Variance => variance(intermediates, kwargs.ddof),
            Self::StdDev => variance(intermediates, kwargs.ddof).mapv(f64::sqrt),
            Self::ArgIndex => intermediates[1].clone(),
            Self::Custom(func) => func(intermediates, kwargs),
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn variance(intermediates: &[Array2<f64>], ddof: usize) -> Array2<f64> {
    let ddof = ddof as f64;
    Zip::from(&intermediates[0])
        .and(&intermediates[1])
        .and(&intermediates[2])
        .map_collect(|&sum_of_squares, &sum, &count| {
            if count - ddof <= 0.0 {
                f64::NAN
            } else {
                let deviations = (sum_of_squares - sum * sum / count).max(0.0);
                deviations / (count - ddof)
            }
        })
}

/// A declarative recipe for a grouped reduction.
///
/// Chunk kernels run on every block, combine kernels merge the partial results channel by
/// channel and `finalize`, when present, derives the statistic. Arg reductions carry a
/// value channel and an index channel that must be combined together.
#[derive(Debug, Clone)]
pub struct Aggregation {
    pub name: String,
    pub chunk: Vec<Kernel>,
    pub combine: Vec<Kernel>,
    pub finalize: Option<Finalize>,
    /// Result dtype. `None` means the input dtype.
    pub dtype: Option<Dtype>,
    pub fill_value: StageFillValues,
    pub reduction_type: ReductionType,
}

impl Aggregation {
    /// Recipe whose single chunk kernel and combine kernel need no finalize step.
    #[must_use]
    pub fn simple(
        name: &str,
        chunk: Kernel,
        combine: Kernel,
        intermediate: FillValue,
        final_value: FillValue,
    ) -> Self {
        Self {
            name: name.into(),
            chunk: vec![chunk],
            combine: vec![combine],
            finalize: None,
            dtype: None,
            fill_value: StageFillValues {
                intermediate: vec![intermediate],
                final_value,
            },
            reduction_type: ReductionType::Reduce,
        }
    }

    #[must_use]
    pub fn with_dtype(mut self, dtype: Dtype) -> Self {
        self.dtype = Some(dtype);
        self
    }

    /// Resolve dtype dependent fill values against the input dtype.
    ///
    /// The catalog entry is left untouched; the returned value is owned by one call.
    #[must_use]
    pub fn resolve(&self, input: Dtype) -> ResolvedAggregation {
        let dtype = self.dtype.unwrap_or(input);
        ResolvedAggregation {
            name: self.name.clone(),
            chunk: self.chunk.clone(),
            combine: self.combine.clone(),
            finalize: self.finalize.clone(),
            dtype,
            intermediate_fill: self
                .fill_value
                .intermediate
                .iter()
                .map(|fill| fill.resolve(input))
                .collect(),
            final_fill: self.fill_value.final_value.resolve(dtype),
            reduction_type: self.reduction_type,
            count_channel: false,
        }
    }
}

/// An [`Aggregation`] with concrete fill values, owned by one reduction call.
#[derive(Debug, Clone)]
pub struct ResolvedAggregation {
    pub name: String,
    pub chunk: Vec<Kernel>,
    pub combine: Vec<Kernel>,
    pub finalize: Option<Finalize>,
    pub dtype: Dtype,
    pub intermediate_fill: Vec<f64>,
    pub final_fill: f64,
    pub reduction_type: ReductionType,
    /// Whether the last channel is an element count used only for masking.
    pub count_channel: bool,
}

impl ResolvedAggregation {
    #[must_use]
    pub fn is_argreduce(&self) -> bool {
        self.reduction_type == ReductionType::ArgReduce
    }

    /// Kernel counting the elements this reduction actually consumes.
    ///
    /// NaN-skipping reductions count non-NaN elements, the others count every element
    /// so that NaN results survive masking.
    #[must_use]
    pub fn count_kernel(&self) -> Kernel {
        if self.name.starts_with("nan") || self.name == "count" {
            Kernel::NanLen
        } else {
            Kernel::Len
        }
    }

    /// Append a trailing count channel (summed at the combine stage) used for masking.
    #[must_use]
    pub fn with_count_channel(mut self) -> Self {
        if !self.count_channel {
            self.chunk.push(self.count_kernel());
            self.combine.push(Kernel::Sum);
            self.intermediate_fill.push(0.0);
            self.count_channel = true;
        }
        self
    }

    /// Number of channels excluding the count channel.
    #[must_use]
    pub fn value_channels(&self) -> usize {
        self.chunk.len() - usize::from(self.count_channel)
    }
}
