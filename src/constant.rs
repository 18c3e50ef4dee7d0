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

//! Configuration constants

#![allow(dead_code)] // it's okay if some FLAC-spec constants are not used.

// Constants sorted in an alphabetical-order.  Top-level constants first, and
// then sub-modules. Constants that are used only in a specific sub-module or
// its caller should be placed in the corresponding submodule.

/// Maximum bits-per-sample supported.
pub const MAX_BITS_PER_SAMPLE: usize = 24;

/// Maximum length of a block supported (65535 in the specification.)
pub const MAX_BLOCKSIZE: usize = 8192;

/// Maximum number of channels of a FLAC stream.
pub const MAX_CHANNELS: usize = 8;

/// Minimum length of a block supported.
pub const MIN_BLOCKSIZE: usize = 32;

/// Maximum sample rate expressible in a frame header (code 14, tens of Hz).
pub const MAX_SAMPLE_RATE: u32 = 655_350;

/// Block sizes expressible with a 4-bit code in a frame header.
///
/// Sizes not in this table are still encodable via the 8/16-bit explicit
/// block-size field following the header.
pub const CODED_BLOCKSIZES: [usize; 11] = [
    192, 576, 1152, 2304, 4608, 256, 512, 1024, 2048, 4096, 8192,
];

/// Sample rates expressible with a 4-bit code in a frame header.
///
/// Index `i` of a rate in this table maps to the header code `i + 4`.
pub const CODED_SAMPLE_RATES: [u32; 8] = [8000, 16000, 22050, 24000, 32000, 44100, 48000, 96000];

/// Bit depths expressible with a 3-bit code in a frame header.
///
/// Index `i` of a depth in this table maps to the header code `i + 1`,
/// skipping the reserved code `0b011` (element 0 below).
pub const CODED_BIT_DEPTHS: [u32; 6] = [8, 12, 0, 16, 20, 24];

/// Constants related to fixed-parameter prediction.
pub mod fixed {
    /// Maximum order of the fixed polynomial predictors.
    pub const MAX_ORDER: usize = 4;
}

/// Constants related to quantized linear predictive coding (QLPC).
pub mod qlpc {
    /// The number of bits used for encoding shift bits of QLPC.
    pub const SHIFT_BITS: usize = 5;

    /// Maximum order of LPC supported. (32 in the specification.)
    pub const MAX_ORDER: usize = 32;

    /// Max number of bits (precision) for storing QLPC coefficients.
    pub const MAX_PRECISION: usize = 15;

    /// Minimum precision for storing QLPC coefficients.
    pub const MIN_PRECISION: usize = 5;

    /// The number of precision offsets probed in a precision search.
    pub const MAX_PRECISIONS: usize = 4;

    /// Maximum shift parameter of QLPC defined in the specification.
    pub const MAX_SHIFT: i32 = (1i32 << (SHIFT_BITS - 1)) - 1;

    /// Minimum shift parameter of QLPC.
    ///
    /// According to the bitstream specification, it can be negative, but the
    /// reference decoder doesn't support the negative shift case.
    pub const MIN_SHIFT: i32 = 0;

    /// Reflection-coefficient magnitude above which an order is regarded as
    /// still contributing to the prediction.
    pub const INTERESTING_REFLECTION: f64 = 0.10;
}

/// Constants related to partitioned rice coding (PRC).
pub mod rice {
    /// Maximum allowed value for the Rice parameters.
    ///
    /// 5-bit rice coding is not supported currently, and 0b1111 is reserved
    /// for escape coding. So, 14 will be the maximum.
    pub const MAX_RICE_PARAMETER: usize = 14;

    /// Maximum order of Rice parameter partitioning.
    pub const MAX_PARTITION_ORDER: usize = 8;

    /// Maximum number of Rice partitions.
    pub const MAX_PARTITIONS: usize = 1usize << MAX_PARTITION_ORDER;
}

/// Constants related to analysis windows.
pub mod window {
    /// Maximum number of window functions applied per frame.
    pub const MAX_WINDOWS: usize = 4;
}

/// Module for internal error messages.
///
/// Use `panic!` and those messages only for env-related unrecoverable errors.
/// It's okay to use them in tests, but it's not okay to add another variable
/// only for test functions.
pub(crate) mod panic_msg {
    pub const DATA_INCONSISTENT: &str = "INTERNAL ERROR: Internal variable inconsistency detected.";
    pub const NO_ERROR_EXPECTED: &str =
        "INTERNAL ERROR: Error emitted from the function designed not to return err.";
}
