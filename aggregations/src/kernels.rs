//! Group-wise kernels over 2-D blocks.
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
use crate::AggregationError;
use ndarray::{Array2, ArrayView2, Zip};
use std::{
    fmt::{Debug, Formatter},
    sync::Arc,
};

/// Keyword parameters forwarded to kernels and finalize steps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FinalizeKwargs {
    /// Delta degrees of freedom for variance and standard deviation.
    pub ddof: usize,
}

/// Signature of a user supplied kernel.
///
/// Arguments are the dense group code of each column, the values block with shape
/// `(rows, columns)`, the number of output groups and the fill value for groups
/// that receive no elements. Codes greater than or equal to the group count must be
/// ignored.
pub type KernelFn = dyn Fn(&[usize], ArrayView2<'_, f64>, usize, f64) -> Array2<f64> + Send + Sync;

/// A named kernel supplied by the caller.
#[derive(Clone)]
pub struct CustomKernel {
    name: String,
    func: Arc<KernelFn>,
}

impl CustomKernel {
    pub fn new(name: impl Into<String>, func: Arc<KernelFn>) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl Debug for CustomKernel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustomKernel")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl PartialEq for CustomKernel {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && Arc::ptr_eq(&self.func, &other.func)
    }
}

/// Group-wise reduction kernels.
///
/// Kernels prefixed with `Nan` ignore NaN elements entirely. The others propagate
/// NaN, with the arg kernels reporting the position of the first NaN seen.
#[derive(Debug, Clone, PartialEq)]
pub enum Kernel {
    Sum,
    NanSum,
    Prod,
    NanProd,
    Max,
    NanMax,
    Min,
    NanMin,
    Mean,
    NanMean,
    Var,
    NanVar,
    Std,
    NanStd,
    SumOfSquares,
    NanSumOfSquares,
    ArgMax,
    NanArgMax,
    ArgMin,
    NanArgMin,
    Len,
    NanLen,
    All,
    Any,
    First,
    NanFirst,
    Last,
    NanLast,
    Custom(CustomKernel),
}

impl TryFrom<&str> for Kernel {
    type Error = AggregationError;
    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value.to_lowercase().as_str() {
            "sum" => Ok(Self::Sum),
            "nansum" => Ok(Self::NanSum),
            "prod" => Ok(Self::Prod),
            "nanprod" => Ok(Self::NanProd),
            "max" => Ok(Self::Max),
            "nanmax" => Ok(Self::NanMax),
            "min" => Ok(Self::Min),
            "nanmin" => Ok(Self::NanMin),
            "mean" => Ok(Self::Mean),
            "nanmean" => Ok(Self::NanMean),
            "var" => Ok(Self::Var),
            "nanvar" => Ok(Self::NanVar),
            "std" => Ok(Self::Std),
            "nanstd" => Ok(Self::NanStd),
            "sum_of_squares" => Ok(Self::SumOfSquares),
            "nansum_of_squares" => Ok(Self::NanSumOfSquares),
            "argmax" => Ok(Self::ArgMax),
            "nanargmax" => Ok(Self::NanArgMax),
            "argmin" => Ok(Self::ArgMin),
            "nanargmin" => Ok(Self::NanArgMin),
            "len" => Ok(Self::Len),
            "nanlen" => Ok(Self::NanLen),
            "all" => Ok(Self::All),
            "any" => Ok(Self::Any),
            "first" => Ok(Self::First),
            "nanfirst" => Ok(Self::NanFirst),
            "last" => Ok(Self::Last),
            "nanlast" => Ok(Self::NanLast),
            _ => Err(AggregationError::UnknownKernel { name: value.into() }),
        }
    }
}

impl Kernel {
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Sum => "sum",
            Self::NanSum => "nansum",
            Self::Prod => "prod",
            Self::NanProd => "nanprod",
            Self::Max => "max",
            Self::NanMax => "nanmax",
            Self::Min => "min",
            Self::NanMin => "nanmin",
            Self::Mean => "mean",
            Self::NanMean => "nanmean",
            Self::Var => "var",
            Self::NanVar => "nanvar",
            Self::Std => "std",
            Self::NanStd => "nanstd",
            Self::SumOfSquares => "sum_of_squares",
            Self::NanSumOfSquares => "nansum_of_squares",
            Self::ArgMax => "argmax",
            Self::NanArgMax => "nanargmax",
            Self::ArgMin => "argmin",
            Self::NanArgMin => "nanargmin",
            Self::Len => "len",
            Self::NanLen => "nanlen",
            Self::All => "all",
            Self::Any => "any",
            Self::First => "first",
            Self::NanFirst => "nanfirst",
            Self::Last => "last",
            Self::NanLast => "nanlast",
            Self::Custom(custom) => &custom.name,
        }
    }

    /// Does this kernel report positions rather than values?
    #[must_use]
    pub fn is_arg(&self) -> bool {
        matches!(
            self,
            Self::ArgMax | Self::NanArgMax | Self::ArgMin | Self::NanArgMin
        )
    }

    /// Reduce `values` column-wise into `size` groups.
    ///
    /// The output has shape `(values.nrows(), size)`. Column `j` of `values` contributes to
    /// group `codes[j]`; codes at or beyond `size` are the missing sentinel and contribute
    /// nowhere. Groups receiving no elements are set to `fill_value`. Arg kernels emit the
    /// flat position `row * values.ncols() + column` of the selected element.
    #[must_use]
    pub fn aggregate(
        &self,
        codes: &[usize],
        values: ArrayView2<'_, f64>,
        size: usize,
        fill_value: f64,
        kwargs: &FinalizeKwargs,
    ) -> Array2<f64> {
        debug_assert_eq!(codes.len(), values.ncols());
        let groups = Grouped {
            codes,
            values,
            size,
            fill_value,
        };
        match self {
            Self::Sum => groups.fold(false, |x| x, |acc, x| acc + x),
            Self::NanSum => groups.fold(true, |x| x, |acc, x| acc + x),
            Self::Prod => groups.fold(false, |x| x, |acc, x| acc * x),
            Self::NanProd => groups.fold(true, |x| x, |acc, x| acc * x),
            Self::Max => groups.fold(false, |x| x, nan_propagating(f64::max)),
            Self::NanMax => groups.fold(true, |x| x, f64::max),
            Self::Min => groups.fold(false, |x| x, nan_propagating(f64::min)),
            Self::NanMin => groups.fold(true, |x| x, f64::min),
            Self::SumOfSquares => groups.fold(false, |x| x * x, |acc, x| acc + x * x),
            Self::NanSumOfSquares => groups.fold(true, |x| x * x, |acc, x| acc + x * x),
            Self::Len => groups.fold(false, |_| 1.0, |acc, _| acc + 1.0),
            Self::NanLen => groups.fold(true, |_| 1.0, |acc, _| acc + 1.0),
            Self::All => groups.fold(false, truthy, |acc, x| truthy(acc) * truthy(x)),
            Self::Any => groups.fold(false, truthy, |acc, x| truthy(acc + truthy(x))),
            Self::First => groups.fold(false, |x| x, |acc, _| acc),
            Self::NanFirst => groups.fold(true, |x| x, |acc, _| acc),
            Self::Last => groups.fold(false, |x| x, |_, x| x),
            Self::NanLast => groups.fold(true, |x| x, |_, x| x),
            Self::Mean => groups.moments(false, Moment::Mean, kwargs.ddof),
            Self::NanMean => groups.moments(true, Moment::Mean, kwargs.ddof),
            Self::Var => groups.moments(false, Moment::Var, kwargs.ddof),
            Self::NanVar => groups.moments(true, Moment::Var, kwargs.ddof),
            Self::Std => groups.moments(false, Moment::Std, kwargs.ddof),
            Self::NanStd => groups.moments(true, Moment::Std, kwargs.ddof),
            Self::ArgMax => groups.arg(false, |x, best| x > best),
            Self::NanArgMax => groups.arg(true, |x, best| x > best),
            Self::ArgMin => groups.arg(false, |x, best| x < best),
            Self::NanArgMin => groups.arg(true, |x, best| x < best),
            Self::Custom(custom) => (custom.func)(codes, values, size, fill_value),
        }
    }
}

fn truthy(x: f64) -> f64 {
    if x == 0.0 { 0.0 } else { 1.0 }
}

fn nan_propagating(op: fn(f64, f64) -> f64) -> impl Fn(f64, f64) -> f64 {
    move |acc, x| {
        if acc.is_nan() || x.is_nan() {
            f64::NAN
        } else {
            op(acc, x)
        }
    }
}

#[derive(Clone, Copy)]
enum Moment {
    Mean,
    Var,
    Std,
}

struct Grouped<'a, 'v> {
    codes: &'a [usize],
    values: ArrayView2<'v, f64>,
    size: usize,
    fill_value: f64,
}

impl Grouped<'_, '_> {
    /// Visit every element that contributes to a group.
    fn for_each(&self, skip_nan: bool, mut f: impl FnMut(usize, usize, usize, f64)) {
        for (row, values) in self.values.outer_iter().enumerate() {
            for (column, (&code, &x)) in self.codes.iter().zip(values.iter()).enumerate() {
                if code >= self.size || (skip_nan && x.is_nan()) {
                    continue;
                }
                f(row, column, code, x);
            }
        }
    }

    fn fold(
        &self,
        skip_nan: bool,
        first: impl Fn(f64) -> f64,
        step: impl Fn(f64, f64) -> f64,
    ) -> Array2<f64> {
        let shape = (self.values.nrows(), self.size);
        let mut out = Array2::from_elem(shape, self.fill_value);
        let mut seen = Array2::from_elem(shape, false);
        self.for_each(skip_nan, |row, _, code, x| {
            let slot = &mut out[[row, code]];
            if seen[[row, code]] {
                *slot = step(*slot, x);
            } else {
                *slot = first(x);
                seen[[row, code]] = true;
            }
        });
        out
    }

    #[allow(clippy::cast_precision_loss)]
    fn moments(&self, skip_nan: bool, moment: Moment, ddof: usize) -> Array2<f64> {
        let shape = (self.values.nrows(), self.size);
        let mut count = Array2::<f64>::zeros(shape);
        let mut sum = Array2::<f64>::zeros(shape);
        self.for_each(skip_nan, |row, _, code, x| {
            count[[row, code]] += 1.0;
            sum[[row, code]] += x;
        });
        let mean = &sum / &count;
        if matches!(moment, Moment::Mean) {
            return Zip::from(&mean)
                .and(&count)
                .map_collect(|&m, &n| if n == 0.0 { self.fill_value } else { m });
        }
        let mut squared_deviations = Array2::<f64>::zeros(shape);
        self.for_each(skip_nan, |row, _, code, x| {
            let deviation = x - mean[[row, code]];
            squared_deviations[[row, code]] += deviation * deviation;
        });
        let ddof = ddof as f64;
        Zip::from(&squared_deviations)
            .and(&count)
            .map_collect(|&ss, &n| {
                if n == 0.0 {
                    self.fill_value
                } else if n - ddof <= 0.0 {
                    f64::NAN
                } else {
                    let var = ss / (n - ddof);
                    match moment {
                        Moment::Std => var.sqrt(),
                        _ => var,
                    }
                }
            })
    }

    #[allow(clippy::cast_precision_loss)]
    fn arg(&self, skip_nan: bool, better: impl Fn(f64, f64) -> bool) -> Array2<f64> {
        let shape = (self.values.nrows(), self.size);
        let ncols = self.values.ncols();
        let mut best = Array2::from_elem(shape, f64::NAN);
        let mut position = Array2::from_elem(shape, self.fill_value);
        let mut seen = Array2::from_elem(shape, false);
        self.for_each(skip_nan, |row, column, code, x| {
            let index = [row, code];
            let take = if !seen[index] {
                true
            } else if best[index].is_nan() {
                false
            } else {
                x.is_nan() || better(x, best[index])
            };
            if take {
                seen[index] = true;
                best[index] = x;
                position[index] = (row * ncols + column) as f64;
            }
        });
        position
    }
}
