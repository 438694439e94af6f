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
use color_eyre::eyre::Result;
use groupby_core::{ChunkedArray, DataArray, Label};
use ndarray::{ArrayD, IxDyn};
use rand::{Rng, rngs::StdRng};

#[must_use]
pub fn labels(values: &[&str]) -> Vec<Label> {
    values.iter().map(|value| Label::from(*value)).collect()
}

#[allow(clippy::missing_errors_doc)]
pub fn in_memory<T: Clone>(shape: &[usize], data: Vec<T>) -> Result<DataArray<T>> {
    Ok(ArrayD::from_shape_vec(IxDyn(shape), data)?.into())
}

#[allow(clippy::missing_errors_doc)]
pub fn chunked<T: Clone>(
    shape: &[usize],
    data: Vec<T>,
    chunks: Vec<Vec<usize>>,
) -> Result<DataArray<T>> {
    let data = ArrayD::from_shape_vec(IxDyn(shape), data)?;
    Ok(ChunkedArray::from_chunks(data, chunks)?.into())
}

/// Random block sizes of at most `max` summing to `len`.
pub fn random_chunks(rng: &mut StdRng, len: usize, max: usize) -> Vec<usize> {
    let mut chunks = Vec::new();
    let mut remaining = len;
    while remaining > 0 {
        let size = rng.random_range(1..=max.min(remaining));
        chunks.push(size);
        remaining -= size;
    }
    chunks
}

/// Random values in `[0, 1)` with NaN at every seventh position from the fourth.
pub fn values_with_nans(rng: &mut StdRng, len: usize) -> Vec<f64> {
    (0..len)
        .map(|i| if i % 7 == 3 { f64::NAN } else { rng.random() })
        .collect()
}

/// Element-wise equality to a relative tolerance, treating NaN as equal to NaN.
#[allow(clippy::missing_panics_doc)]
pub fn assert_close(actual: &ArrayD<f64>, expected: &ArrayD<f64>) {
    assert_eq!(actual.shape(), expected.shape());
    for (a, e) in actual.iter().zip(expected) {
        let close = (a.is_nan() && e.is_nan()) || (a - e).abs() <= 1e-9 * e.abs().max(1.0);
        assert!(close, "{actual} is not close to {expected}");
    }
}
