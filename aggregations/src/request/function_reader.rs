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
use super::function_call::{FunctionCall, FunctionParameter};
use std::{iter::Peekable, str::CharIndices};
use thiserror::Error;

/// Reads a single reduction call such as `sum`, `mean()` or `var(ddof = 1)`.
pub struct FunctionReader<'h> {
    haystack: &'h str,
    chars: Peekable<CharIndices<'h>>,
    characters_read: usize,
}

#[derive(Error, Debug)]
#[error("expected {expected_next} at position {position}")]
pub struct FunctionReaderError {
    position: usize,
    expected_next: ExpectedNext,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedNext {
    #[error("function name")]
    FunctionName,
    #[error("open parenthesis or end of input")]
    OpenParenthesisOrEnd,
    #[error("end of input")]
    End,
    #[error("parameter")]
    Parameter,
    #[error("parameter or close parenthesis")]
    ParameterOrCloseParenthesis,
    #[error("comma or close parenthesis")]
    CommaOrCloseParenthesis,
    #[error("close parenthesis")]
    CloseParenthesis,
    #[error("number after =")]
    KeywordValue,
}

impl<'h> FunctionReader<'h> {
    pub fn new(haystack: &'h str) -> Self {
        FunctionReader {
            haystack,
            chars: haystack.char_indices().peekable(),
            characters_read: 0,
        }
    }

    /// Read one call and require the input to end after it.
    ///
    /// The parameter list may be omitted entirely for a bare name.
    pub fn read_single_call(mut self) -> Result<FunctionCall<'h>, FunctionReaderError> {
        let name = self
            .read_word()
            .ok_or_else(|| self.error(ExpectedNext::FunctionName))?;
        let parenthesised = self.read_expected_char('(');
        let parameters = if parenthesised {
            self.read_parameters()?
        } else {
            vec![]
        };
        self.ignore_whitespace();
        if self.at_end() {
            Ok(FunctionCall { name, parameters })
        } else if parenthesised {
            Err(self.error(ExpectedNext::End))
        } else {
            Err(self.error(ExpectedNext::OpenParenthesisOrEnd))
        }
    }

    fn read_parameters(&mut self) -> Result<Vec<FunctionParameter<'h>>, FunctionReaderError> {
        let mut parameters = vec![];
        if self.read_expected_char(')') {
            return Ok(parameters);
        }
        loop {
            let expected = if parameters.is_empty() {
                ExpectedNext::ParameterOrCloseParenthesis
            } else {
                ExpectedNext::Parameter
            };
            let parameter = self.read_parameter(expected)?;
            parameters.push(parameter);
            if self.read_expected_char(',') {
                continue;
            }
            if self.read_expected_char(')') {
                return Ok(parameters);
            }
            let at_end = self.at_end();
            return Err(self.error(if at_end {
                ExpectedNext::CloseParenthesis
            } else {
                ExpectedNext::CommaOrCloseParenthesis
            }));
        }
    }

    fn read_parameter(
        &mut self,
        expected: ExpectedNext,
    ) -> Result<FunctionParameter<'h>, FunctionReaderError> {
        let word = self.read_word().ok_or_else(|| self.error(expected))?;
        if self.read_expected_char('=') {
            return self
                .read_word()
                .and_then(|value| value.parse::<i64>().ok())
                .map(|value| FunctionParameter::Keyword { name: word, value })
                .ok_or_else(|| self.error(ExpectedNext::KeywordValue));
        }
        Ok(match word.parse::<i64>() {
            Ok(number) => FunctionParameter::Number(number),
            Err(_) => FunctionParameter::Word(word),
        })
    }

    fn read_word(&mut self) -> Option<&'h str> {
        self.ignore_whitespace();
        let (start, _) = *self.chars.peek()?;
        while self
            .chars
            .peek()
            .is_some_and(|&(_, c)| c.is_alphanumeric() || c == '_' || c == '-')
        {
            self.advance();
        }
        let haystack = self.haystack;
        let end = self.chars.peek().map_or(haystack.len(), |&(i, _)| i);
        (start != end).then(|| &haystack[start..end])
    }

    fn read_expected_char(&mut self, expected: char) -> bool {
        self.ignore_whitespace();
        if self.chars.peek().is_some_and(|&(_, c)| c == expected) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn ignore_whitespace(&mut self) {
        while self.chars.peek().is_some_and(|&(_, c)| c.is_whitespace()) {
            self.advance();
        }
    }

    fn advance(&mut self) {
        if self.chars.next().is_some() {
            self.characters_read += 1;
        }
    }

    fn at_end(&mut self) -> bool {
        self.chars.peek().is_none()
    }

    fn error(&self, expected_next: ExpectedNext) -> FunctionReaderError {
        FunctionReaderError {
            position: self.characters_read,
            expected_next,
        }
    }
}
