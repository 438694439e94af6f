//! Raw group labels and dense group codes.
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
use std::{
    cmp::Ordering,
    fmt::{Display, Formatter},
    hash::{Hash, Hasher},
};

/// A raw grouping value.
///
/// Labels are totally ordered: integers, then floats, then strings, then missing.
/// Floats compare with [`f64::total_cmp`]. A NaN float is normalised to [`Label::Missing`]
/// by the `From<f64>` conversion.
#[derive(Debug, Clone)]
pub enum Label {
    Int(i64),
    Float(f64),
    Str(String),
    Missing,
}

impl Label {
    #[must_use]
    pub fn is_missing(&self) -> bool {
        match self {
            Self::Missing => true,
            Self::Float(value) => value.is_nan(),
            _ => false,
        }
    }

    /// Numeric value of this label, if it has one.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(value) => Some(*value as f64),
            Self::Float(value) => Some(*value),
            Self::Missing => Some(f64::NAN),
            Self::Str(_) => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Int(_) => 0,
            Self::Float(value) if !value.is_nan() => 1,
            Self::Str(_) => 2,
            Self::Float(_) | Self::Missing => 3,
        }
    }
}

impl From<i64> for Label {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for Label {
    fn from(value: f64) -> Self {
        if value.is_nan() {
            Self::Missing
        } else {
            Self::Float(value)
        }
    }
}

impl From<&str> for Label {
    fn from(value: &str) -> Self {
        Self::Str(value.into())
    }
}

impl From<String> for Label {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl Ord for Label {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a.cmp(b),
            (Self::Float(a), Self::Float(b)) if !a.is_nan() && !b.is_nan() => a.total_cmp(b),
            (Self::Str(a), Self::Str(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Label {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Label {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Label {}

impl Hash for Label {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            Self::Int(value) => value.hash(state),
            Self::Float(value) if !value.is_nan() => value.to_bits().hash(state),
            Self::Str(value) => value.hash(state),
            Self::Float(_) | Self::Missing => {}
        }
    }
}

impl Display for Label {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(value) => write!(f, "{value}"),
            Self::Float(value) if !value.is_nan() => write!(f, "{value}"),
            Self::Str(value) => write!(f, "{value}"),
            Self::Float(_) | Self::Missing => write!(f, "NaN"),
        }
    }
}

/// Dense group identifier produced by factorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GroupCode {
    Valid(usize),
    Missing,
}

impl GroupCode {
    /// Integer encoding for kernels, with `Missing` mapped onto `sentinel`.
    #[must_use]
    pub fn dense(self, sentinel: usize) -> usize {
        match self {
            Self::Valid(code) => code,
            Self::Missing => sentinel,
        }
    }

    #[must_use]
    pub fn valid(self) -> Option<usize> {
        match self {
            Self::Valid(code) => Some(code),
            Self::Missing => None,
        }
    }
}
