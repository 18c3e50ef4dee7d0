// Copyright 2022 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Error types returned from the encoder and the verification decoder.

use std::error::Error;
use std::fmt;
use std::rc::Rc;

/// Error emitted when a parameter is out of the expected range.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
#[allow(clippy::module_name_repetitions)]
pub struct RangeError {
    var: String,
    reason: String,
    actual: String,
}

impl RangeError {
    /// Makes range error from `actual: impl Display` that is out of range.
    pub(crate) fn from_display<T>(var: &str, reason: &str, actual: &T) -> Self
    where
        T: fmt::Display,
    {
        Self {
            var: var.to_owned(),
            reason: reason.to_owned(),
            actual: format!("{actual}"),
        }
    }
}

impl Error for RangeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        None
    }
}

impl fmt::Display for RangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "`{}` is out of range: {} (actual={})",
            self.var, self.reason, self.actual
        )
    }
}

/// Error emitted when the analysis coprocessor cannot be acquired or driven.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
#[allow(clippy::module_name_repetitions)]
pub struct CoprocessorError {
    reason: String,
}

impl CoprocessorError {
    pub(crate) fn new(reason: &str) -> Self {
        Self {
            reason: reason.to_owned(),
        }
    }
}

impl Error for CoprocessorError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        None
    }
}

impl fmt::Display for CoprocessorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "coprocessor error: {}", self.reason)
    }
}

/// Error emitted when a decoded frame doesn't reproduce the input samples.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
#[allow(clippy::module_name_repetitions)]
pub struct VerifyError {
    frame_number: u64,
    reason: String,
}

impl VerifyError {
    /// Makes verification error for the frame with the given number.
    pub(crate) fn new(frame_number: u64, reason: &str) -> Self {
        Self {
            frame_number,
            reason: reason.to_owned(),
        }
    }

    /// Returns the number of the frame that failed verification.
    pub const fn frame_number(&self) -> u64 {
        self.frame_number
    }
}

impl Error for VerifyError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        None
    }
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "verification of frame {} failed. reason: {}",
            self.frame_number, self.reason
        )
    }
}

/// Error emitted when a bitstream cannot be parsed back.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
#[allow(clippy::module_name_repetitions)]
pub struct DecodeError {
    bit_offset: usize,
    reason: String,
}

impl DecodeError {
    pub(crate) fn new(bit_offset: usize, reason: &str) -> Self {
        Self {
            bit_offset,
            reason: reason.to_owned(),
        }
    }

    /// Returns the bit offset where parsing stopped.
    pub const fn bit_offset(&self) -> usize {
        self.bit_offset
    }
}

impl Error for DecodeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        None
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "bitstream not decodable at bit {}: {}",
            self.bit_offset, self.reason
        )
    }
}

/// Enum for possible encoder errors.
#[non_exhaustive]
#[allow(clippy::module_name_repetitions)]
#[derive(Clone, Debug)]
pub enum EncodeError {
    /// Encoder errors due to invalid configuration or stream parameters.
    Range(RangeError),
    /// Encoder errors due to the output sink.
    Io(Rc<std::io::Error>),
    /// The coprocessor backend failed.
    Coprocessor(CoprocessorError),
    /// A frame did not decode back to the input samples.
    Verify(VerifyError),
    /// The number of samples written differs from the declared stream length.
    SampleCountMismatch {
        /// Sample count declared when the stream was opened.
        expected: u64,
        /// Sample count actually written.
        actual: u64,
    },
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Range(e) => e.fmt(f),
            Self::Io(e) => e.fmt(f),
            Self::Coprocessor(e) => e.fmt(f),
            Self::Verify(e) => e.fmt(f),
            Self::SampleCountMismatch { expected, actual } => write!(
                f,
                "samples written ({actual}) != samples declared ({expected})"
            ),
        }
    }
}

impl Error for EncodeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Range(e) => Some(e),
            Self::Io(e) => Some(e.as_ref()),
            Self::Coprocessor(e) => Some(e),
            Self::Verify(e) => Some(e),
            Self::SampleCountMismatch { .. } => None,
        }
    }
}

impl From<RangeError> for EncodeError {
    fn from(e: RangeError) -> Self {
        Self::Range(e)
    }
}

impl From<std::io::Error> for EncodeError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(Rc::new(e))
    }
}

impl From<CoprocessorError> for EncodeError {
    fn from(e: CoprocessorError) -> Self {
        Self::Coprocessor(e)
    }
}

impl From<VerifyError> for EncodeError {
    fn from(e: VerifyError) -> Self {
        Self::Verify(e)
    }
}
