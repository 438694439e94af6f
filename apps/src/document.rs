//! JSON documents read and written by the command-line applications.
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
use color_eyre::eyre::{Result, bail, eyre};
use groupby_core::{ChunkedArray, DataArray, GroupbyResult, Label};
use log::debug;
use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

/// Input of the `groupby` application.
///
/// `array` holds nested lists of numbers where `null` is NaN. `by` holds nested lists of
/// strings, numbers or `null` for missing, matching the trailing dimensions of `array`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InputDocument {
    pub array: Value,
    pub by: Value,
    /// Block sizes of every axis of `array`.
    #[serde(default)]
    pub chunks: Option<Vec<Vec<usize>>>,
    /// Block sizes of every axis of `by`.
    #[serde(default)]
    pub by_chunks: Option<Vec<Vec<usize>>>,
}

impl InputDocument {
    /// # Errors
    /// If the text is not a valid input document.
    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// The values to reduce, chunked when `chunks` is present.
    ///
    /// # Errors
    /// If `array` is ragged, holds something other than numbers and nulls, or does not fit
    /// `chunks`.
    pub fn array(&self) -> Result<DataArray<f64>> {
        let values = nested_to_array(&self.array, |leaf| match leaf {
            Value::Null => Ok(f64::NAN),
            Value::Number(number) => number
                .as_f64()
                .ok_or_else(|| eyre!("array value {number} is not representable")),
            other => Err(eyre!("array values must be numbers or null, found {other}")),
        })?;
        with_chunks(values, self.chunks.clone())
    }

    /// The labels to group by, chunked when `by_chunks` is present.
    ///
    /// # Errors
    /// If `by` is ragged, holds nested objects, or does not fit `by_chunks`.
    pub fn by(&self) -> Result<DataArray<Label>> {
        let labels = nested_to_array(&self.by, label_of_json)?;
        with_chunks(labels, self.by_chunks.clone())
    }
}

/// Output of the `groupby` application.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputDocument {
    pub name: String,
    pub dtype: String,
    pub groups: Vec<Value>,
    /// Nested lists with the group axis last; NaN is written as `null`.
    pub values: Value,
    /// Block sizes of every axis of `values` when the result is chunked.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunks: Option<Vec<Vec<usize>>>,
}

impl From<&GroupbyResult> for OutputDocument {
    fn from(result: &GroupbyResult) -> Self {
        let values = result.values.compute();
        Self {
            name: result.name.clone(),
            dtype: result.dtype.to_string(),
            groups: result.groups.iter().map(json_of_label).collect(),
            values: array_to_nested(&values),
            chunks: result.values.chunks().map(<[Vec<usize>]>::to_vec),
        }
    }
}

/// A label typed on the command line: an integer, a float or otherwise a string.
#[must_use]
pub fn parse_label(text: &str) -> Label {
    text.parse::<i64>()
        .map(Label::Int)
        .or_else(|_| text.parse::<f64>().map(Label::from))
        .unwrap_or_else(|_| Label::from(text))
}

fn label_of_json(value: &Value) -> Result<Label> {
    match value {
        Value::Null => Ok(Label::Missing),
        Value::String(text) => Ok(Label::from(text.as_str())),
        Value::Bool(flag) => Ok(Label::Int(i64::from(*flag))),
        Value::Number(number) => number
            .as_i64()
            .map(Label::Int)
            .or_else(|| number.as_f64().map(Label::from))
            .ok_or_else(|| eyre!("label {number} is not representable")),
        other => Err(eyre!("labels must be strings, numbers or null, found {other}")),
    }
}

fn json_of_label(label: &Label) -> Value {
    match label {
        Label::Int(value) => Value::from(*value),
        Label::Float(value) => json_of_f64(*value),
        Label::Str(value) => Value::from(value.as_str()),
        Label::Missing => Value::Null,
    }
}

fn json_of_f64(value: f64) -> Value {
    Number::from_f64(value).map_or(Value::Null, Value::Number)
}

fn with_chunks<T: Clone>(data: ArrayD<T>, chunks: Option<Vec<Vec<usize>>>) -> Result<DataArray<T>> {
    Ok(match chunks {
        Some(chunks) => ChunkedArray::from_chunks(data, chunks)?.into(),
        None => data.into(),
    })
}

/// Read a rectangular nest of JSON lists into an array.
fn nested_to_array<T>(value: &Value, leaf: impl Fn(&Value) -> Result<T>) -> Result<ArrayD<T>> {
    let mut shape = Vec::new();
    let mut level = value;
    while let Value::Array(items) = level {
        shape.push(items.len());
        match items.first() {
            Some(first) => level = first,
            None => break,
        }
    }
    let mut data = Vec::with_capacity(shape.iter().product());
    collect_leaves(value, &shape, &leaf, &mut data)?;
    debug!("Read array of shape {shape:?}");
    Ok(ArrayD::from_shape_vec(IxDyn(&shape), data)?)
}

fn collect_leaves<T>(
    value: &Value,
    shape: &[usize],
    leaf: &impl Fn(&Value) -> Result<T>,
    out: &mut Vec<T>,
) -> Result<()> {
    match (value, shape.split_first()) {
        (Value::Array(items), Some((&len, rest))) => {
            if items.len() != len {
                bail!("ragged nested lists, expected {len} items but found {}", items.len());
            }
            items
                .iter()
                .try_for_each(|item| collect_leaves(item, rest, leaf, out))
        }
        (Value::Array(_), None) => bail!("ragged nested lists, found a list where a value belongs"),
        (_, Some(_)) => bail!("ragged nested lists, found a value where a list belongs"),
        (value, None) => {
            out.push(leaf(value)?);
            Ok(())
        }
    }
}

fn array_to_nested(values: &ArrayD<f64>) -> Value {
    if values.ndim() == 0 {
        return values.first().copied().map_or(Value::Null, json_of_f64);
    }
    Value::Array(
        values
            .outer_iter()
            .map(|row| array_to_nested(&row.to_owned()))
            .collect(),
    )
}
