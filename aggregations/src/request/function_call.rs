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
use color_eyre::eyre::{Result, ensure, eyre};

/// A reduction written as `name(parameter, ...)`.
#[derive(Debug, PartialEq, Eq)]
pub struct FunctionCall<'h> {
    pub name: &'h str,
    pub parameters: Vec<FunctionParameter<'h>>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum FunctionParameter<'h> {
    Word(&'h str),
    Number(i64),
    Keyword { name: &'h str, value: i64 },
}

impl FunctionCall<'_> {
    /// Check no more than the named parameters were given.
    pub fn expect_at_most_parameters(&self, param_names: &[&str]) -> Result<()> {
        ensure!(
            self.parameters.len() <= param_names.len(),
            "{} accepts at most {} argument{}{}, found {}",
            self.name,
            param_names.len(),
            if param_names.len() == 1 { "" } else { "s" },
            if param_names.is_empty() {
                String::new()
            } else {
                format!(" ({})", param_names.join(", "))
            },
            self.parameters.len()
        );
        Ok(())
    }

    /// Read an optional non-negative number parameter, given either by keyword or at
    /// position `index`.
    pub fn count_param(&self, index: usize, param_name: &str) -> Result<Option<usize>> {
        let keyword = self.parameters.iter().find_map(|param| match param {
            FunctionParameter::Keyword { name, value } if *name == param_name => {
                Some(FunctionParameter::Number(*value))
            }
            _ => None,
        });
        match keyword.as_ref().or_else(|| self.parameters.get(index)) {
            None => Ok(None),
            Some(FunctionParameter::Number(value)) => usize::try_from(*value)
                .map(Some)
                .map_err(|_| {
                    eyre!(
                        "{} parameter {index} ({param_name}) must not be negative, found {value}",
                        self.name
                    )
                }),
            Some(param) => Err(eyre!(
                "wrong type for {} parameter {index} ({param_name}), expected number, found {param:?}",
                self.name
            )),
        }
    }
}
