//! The catalog of named aggregation recipes.
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
    AggregationError,
    aggregation::{Aggregation, Dtype, FillValue, Finalize, ReductionType, StageFillValues},
    kernels::Kernel,
};
use log::debug;
use std::collections::BTreeMap;

/// Maps reduction names to immutable [`Aggregation`] recipes.
///
/// Build one at start up, register any custom recipes, then share it by reference.
#[derive(Debug, Clone)]
pub struct AggregationCatalog {
    aggregations: BTreeMap<String, Aggregation>,
}

impl Default for AggregationCatalog {
    fn default() -> Self {
        let mut catalog = Self::empty();
        for agg in builtin() {
            catalog.register(agg);
        }
        catalog
    }
}

impl AggregationCatalog {
    /// A catalog with no recipes.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            aggregations: BTreeMap::new(),
        }
    }

    /// Add or replace a recipe, keyed by its name.
    pub fn register(&mut self, agg: Aggregation) {
        debug!("Registering aggregation {}", agg.name);
        self.aggregations.insert(agg.name.clone(), agg);
    }

    /// Look up a recipe by name.
    ///
    /// # Errors
    /// If no recipe has been registered under `name`.
    pub fn get(&self, name: &str) -> Result<&Aggregation, AggregationError> {
        self.aggregations
            .get(name)
            .ok_or_else(|| AggregationError::UnknownReduction { name: name.into() })
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.aggregations.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.aggregations.keys().map(String::as_str)
    }
}

fn builtin() -> Vec<Aggregation> {
    let zero = FillValue::Value(0.0);
    let one = FillValue::Value(1.0);
    let mut aggs = vec![
        Aggregation::simple("count", Kernel::NanLen, Kernel::Sum, zero, zero)
            .with_dtype(Dtype::Int64),
        Aggregation::simple("sum", Kernel::Sum, Kernel::Sum, zero, zero),
        Aggregation::simple("nansum", Kernel::NanSum, Kernel::Sum, zero, zero),
        Aggregation::simple("prod", Kernel::Prod, Kernel::Prod, one, one),
        Aggregation::simple("nanprod", Kernel::NanProd, Kernel::Prod, one, one),
        Aggregation::simple("max", Kernel::Max, Kernel::Max, FillValue::NegInf, FillValue::Na),
        Aggregation::simple("nanmax", Kernel::NanMax, Kernel::Max, FillValue::NegInf, FillValue::Na),
        Aggregation::simple("min", Kernel::Min, Kernel::Min, FillValue::Inf, FillValue::Na),
        Aggregation::simple("nanmin", Kernel::NanMin, Kernel::Min, FillValue::Inf, FillValue::Na),
        Aggregation::simple("all", Kernel::All, Kernel::All, one, zero).with_dtype(Dtype::Bool),
        Aggregation::simple("any", Kernel::Any, Kernel::Any, zero, zero).with_dtype(Dtype::Bool),
        Aggregation::simple("first", Kernel::First, Kernel::First, FillValue::Na, FillValue::Na),
        Aggregation::simple("nanfirst", Kernel::NanFirst, Kernel::NanFirst, FillValue::Na, FillValue::Na),
        Aggregation::simple("last", Kernel::Last, Kernel::Last, FillValue::Na, FillValue::Na),
        Aggregation::simple("nanlast", Kernel::NanLast, Kernel::NanLast, FillValue::Na, FillValue::Na),
    ];
    for (name, sum) in [("mean", Kernel::Sum), ("nanmean", Kernel::NanSum)] {
        aggs.push(derived(
            name,
            vec![sum, Kernel::NanLen],
            vec![zero, zero],
            Finalize::SumOverCount,
        ));
    }
    for (name, sum_of_squares, sum, finalize) in [
        ("var", Kernel::SumOfSquares, Kernel::Sum, Finalize::Variance),
        ("nanvar", Kernel::NanSumOfSquares, Kernel::NanSum, Finalize::Variance),
        ("std", Kernel::SumOfSquares, Kernel::Sum, Finalize::StdDev),
        ("nanstd", Kernel::NanSumOfSquares, Kernel::NanSum, Finalize::StdDev),
    ] {
        aggs.push(derived(
            name,
            vec![sum_of_squares, sum, Kernel::NanLen],
            vec![zero, zero, zero],
            finalize,
        ));
    }
    for (name, value, index, fill) in [
        ("argmax", Kernel::Max, Kernel::ArgMax, FillValue::NegInf),
        ("nanargmax", Kernel::NanMax, Kernel::NanArgMax, FillValue::NegInf),
        ("argmin", Kernel::Min, Kernel::ArgMin, FillValue::Inf),
        ("nanargmin", Kernel::NanMin, Kernel::NanArgMin, FillValue::Inf),
    ] {
        let combine = if index == Kernel::ArgMax || index == Kernel::NanArgMax {
            vec![Kernel::Max, Kernel::ArgMax]
        } else {
            vec![Kernel::Min, Kernel::ArgMin]
        };
        aggs.push(Aggregation {
            name: name.into(),
            chunk: vec![value, index],
            combine,
            finalize: Some(Finalize::ArgIndex),
            dtype: Some(Dtype::Int64),
            fill_value: StageFillValues {
                intermediate: vec![fill, zero],
                final_value: FillValue::Value(-1.0),
            },
            reduction_type: ReductionType::ArgReduce,
        });
    }
    aggs
}

fn derived(
    name: &str,
    chunk: Vec<Kernel>,
    intermediate: Vec<FillValue>,
    finalize: Finalize,
) -> Aggregation {
    Aggregation {
        name: name.into(),
        combine: vec![Kernel::Sum; chunk.len()],
        chunk,
        finalize: Some(finalize),
        dtype: Some(Dtype::Float64),
        fill_value: StageFillValues {
            intermediate,
            final_value: FillValue::Na,
        },
        reduction_type: ReductionType::Reduce,
    }
}
