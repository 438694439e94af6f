//! Parsing of reduction requests written as text, such as `nanvar(ddof=1)`.
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
use crate::kernels::FinalizeKwargs;
use color_eyre::eyre::{Result, eyre};
use function_reader::FunctionReader;

pub mod function_call;
pub mod function_reader;

/// Reductions that accept a `ddof` parameter.
const DDOF_REDUCTIONS: [&str; 4] = ["var", "nanvar", "std", "nanstd"];

/// A reduction name with its keyword parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReductionRequest {
    pub name: String,
    pub kwargs: FinalizeKwargs,
}

impl ReductionRequest {
    /// Parse a request such as `sum`, `mean()`, `var(1)` or `nanstd(ddof=1)`.
    ///
    /// Only the variance family accepts a parameter. The name is lower-cased; whether it
    /// names a known reduction is checked later against a catalog.
    ///
    /// # Errors
    /// If the text is not a single well formed call or its parameters don't suit the
    /// reduction.
    pub fn parse(text: &str) -> Result<Self> {
        let call = FunctionReader::new(text)
            .read_single_call()
            .map_err(|e| eyre!("could not read reduction {text:?}: {e}"))?;
        let name = call.name.to_lowercase();
        let mut kwargs = FinalizeKwargs::default();
        if DDOF_REDUCTIONS.contains(&name.as_str()) {
            call.expect_at_most_parameters(&["ddof"])?;
            if let Some(ddof) = call.count_param(0, "ddof")? {
                kwargs.ddof = ddof;
            }
        } else {
            call.expect_at_most_parameters(&[])?;
        }
        Ok(Self { name, kwargs })
    }
}
