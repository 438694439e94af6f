//! Error type for the group-reduction engine.
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
use aggregations::AggregationError;
use ndarray::ShapeError;
use rayon::ThreadPoolBuildError;
use thiserror::Error;

pub type Result<T, E = GroupbyError> = std::result::Result<T, E>;

/// All failures are detected synchronously and returned before or instead of any result.
#[derive(Error, Debug)]
pub enum GroupbyError {
    #[error(
        "array and by must be aligned i.e. array.shape[-by.ndim..] == by.shape. Received array of shape {array:?} and by of shape {by:?}"
    )]
    ShapeMismatch { array: Vec<usize>, by: Vec<usize> },

    #[error("axis {axis} is out of bounds for array of dimension {ndim}")]
    InvalidAxis { axis: isize, ndim: usize },

    #[error("{0}")]
    Unsupported(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Filling is required. fill_value cannot be None.")]
    MissingFillValue,

    #[error(transparent)]
    Aggregation(#[from] AggregationError),

    #[error("chunks {chunks:?} do not sum to length {len} of axis {axis}")]
    InvalidChunks {
        axis: usize,
        len: usize,
        chunks: Vec<usize>,
    },

    #[error("bin edges must be strictly increasing with at least two edges, received {0:?}")]
    InvalidBins(Vec<f64>),

    #[error("cannot bin non-numeric label {0}")]
    NonNumericLabel(String),

    #[error("length of labels {labels} does not match length {len} of axis {axis}")]
    LabelLengthMismatch {
        labels: usize,
        len: usize,
        axis: usize,
    },

    #[error("None of the labels to force a new chunk at are present in the labels")]
    ForceLabelsAbsent,

    #[error(transparent)]
    Shape(#[from] ShapeError),

    #[error(transparent)]
    ThreadPool(#[from] ThreadPoolBuildError),
}

impl GroupbyError {
    pub(crate) fn unsupported(reason: impl Into<String>) -> Self {
        Self::Unsupported(reason.into())
    }
}
