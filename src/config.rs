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

//! Encoder configuration and compression-level presets.

use serde::Deserialize;
use serde::Serialize;

use super::constant::qlpc::MAX_ORDER as MAX_LPC_ORDER;
use super::constant::qlpc::MAX_PRECISIONS;
use super::constant::CODED_BLOCKSIZES;
use super::constant::MAX_BLOCKSIZE;
use super::error::RangeError;

/// Highest compression level accepted by [`EncoderConfig::from_level`].
pub const MAX_COMPRESSION_LEVEL: usize = 12;

/// Strategy for choosing which predictor orders to evaluate.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum OrderMethod {
    /// Only the maximum configured order.
    Max,
    /// Heuristic walk downward from the maximum order.
    Estimate,
    /// Heuristic walk upward from the minimum order.
    EstSearch,
    /// The maximum order plus all powers of two below it.
    LogFast,
    /// `LogFast` seeds followed by step-halving refinement.
    LogSearch,
    /// Every order in the configured range.
    Search,
}

/// Class of predictors evaluated for each subframe.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PredictionType {
    /// No prediction. Subframes are constant or verbatim only.
    None,
    /// Fixed polynomial predictors only.
    Fixed,
    /// LPC via Levinson-Durbin recursion, plus the fixed range.
    Levinson,
    /// Like `Levinson` but with a precision search around the estimate.
    Search,
}

/// Strategy for choosing the inter-channel decorrelation mode.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StereoMethod {
    /// Always encode left and right independently.
    Independent,
    /// Two-pass search. A cheap pass picks the window, a full pass encodes.
    Estimate,
    /// Encode all four derived channels and keep the cheapest combination.
    Evaluate,
}

/// Set of window functions applied before LPC analysis.
///
/// This is a bit-set. Combine members with `|`; each member set adds one
/// window slot to the per-frame search.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(transparent)]
pub struct WindowFunctions(u8);

impl WindowFunctions {
    pub const WELCH: Self = Self(1);
    pub const TUKEY: Self = Self(2);
    pub const HANN: Self = Self(4);
    pub const FLATTOP: Self = Self(8);
    pub const BARTLETT: Self = Self(16);

    /// Returns `true` if all windows of `other` are also set in `self`.
    pub const fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Returns the number of windows set.
    pub const fn count(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Returns `true` if no window is set.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for WindowFunctions {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Encoder configuration.
///
/// A configuration is mutated through validated setters and becomes
/// immutable once handed to a stream encoder.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct EncoderConfig {
    block_size: usize,
    block_time_ms: usize,
    padding_size: usize,
    order_method: OrderMethod,
    prediction_type: PredictionType,
    stereo_method: StereoMethod,
    window_functions: WindowFunctions,
    min_lpc_order: usize,
    max_lpc_order: usize,
    min_fixed_order: usize,
    max_fixed_order: usize,
    min_partition_order: usize,
    max_partition_order: usize,
    min_precision_search: usize,
    max_precision_search: usize,
    estimation_depth: usize,
    variable_block_size: usize,
    do_md5: bool,
    do_verify: bool,
    do_seektable: bool,
    use_coprocessor: bool,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            block_size: 0,
            block_time_ms: 105,
            padding_size: 8192,
            order_method: OrderMethod::Estimate,
            prediction_type: PredictionType::Search,
            stereo_method: StereoMethod::Evaluate,
            window_functions: WindowFunctions::FLATTOP | WindowFunctions::TUKEY,
            min_lpc_order: 1,
            max_lpc_order: 12,
            min_fixed_order: 2,
            max_fixed_order: 2,
            min_partition_order: 0,
            max_partition_order: 6,
            min_precision_search: 1,
            max_precision_search: 1,
            estimation_depth: 1,
            variable_block_size: 0,
            do_md5: true,
            do_verify: false,
            do_seektable: true,
            use_coprocessor: false,
        }
    }
}

impl EncoderConfig {
    /// Constructs a configuration from a compression level in `0..=12`.
    ///
    /// The default configuration corresponds to level 7.
    ///
    /// # Errors
    ///
    /// Returns [`RangeError`] if `level` is out of range.
    pub fn from_level(level: usize) -> Result<Self, RangeError> {
        if level > MAX_COMPRESSION_LEVEL {
            return Err(RangeError::from_display(
                "compression_level",
                "must not exceed 12",
                &level,
            ));
        }
        let mut config = Self::default();
        match level {
            0 => {
                config.block_time_ms = 53;
                config.prediction_type = PredictionType::Fixed;
                config.stereo_method = StereoMethod::Independent;
                config.max_partition_order = 4;
            }
            1 => {
                config.prediction_type = PredictionType::Levinson;
                config.stereo_method = StereoMethod::Independent;
                config.window_functions = WindowFunctions::BARTLETT;
                config.max_lpc_order = 8;
                config.max_partition_order = 4;
            }
            2 => {
                config.stereo_method = StereoMethod::Independent;
                config.window_functions = WindowFunctions::BARTLETT;
                config.max_partition_order = 4;
            }
            3 => {
                config.stereo_method = StereoMethod::Estimate;
                config.window_functions = WindowFunctions::BARTLETT;
                config.max_lpc_order = 8;
            }
            4 => {
                config.stereo_method = StereoMethod::Estimate;
                config.window_functions = WindowFunctions::BARTLETT;
            }
            5 => {
                config.window_functions = WindowFunctions::BARTLETT;
            }
            6 => {
                config.stereo_method = StereoMethod::Estimate;
            }
            8 => {
                config.estimation_depth = 3;
                config.min_fixed_order = 0;
                config.max_fixed_order = 4;
                config.max_precision_search = 2;
            }
            9 => {
                config.window_functions = WindowFunctions::BARTLETT;
                config.max_lpc_order = 32;
            }
            10 => {
                config.min_fixed_order = 0;
                config.max_fixed_order = 4;
                config.max_lpc_order = 32;
            }
            11 => {
                config.min_fixed_order = 0;
                config.max_fixed_order = 4;
                config.max_lpc_order = 32;
                config.estimation_depth = 5;
                config.variable_block_size = 4;
            }
            _ => {}
        }
        Ok(config)
    }

    pub const fn block_size(&self) -> usize {
        self.block_size
    }

    pub const fn block_time_ms(&self) -> usize {
        self.block_time_ms
    }

    pub const fn padding_size(&self) -> usize {
        self.padding_size
    }

    pub const fn order_method(&self) -> OrderMethod {
        self.order_method
    }

    pub const fn prediction_type(&self) -> PredictionType {
        self.prediction_type
    }

    pub const fn stereo_method(&self) -> StereoMethod {
        self.stereo_method
    }

    pub const fn window_functions(&self) -> WindowFunctions {
        self.window_functions
    }

    pub const fn min_lpc_order(&self) -> usize {
        self.min_lpc_order
    }

    pub const fn max_lpc_order(&self) -> usize {
        self.max_lpc_order
    }

    pub const fn min_fixed_order(&self) -> usize {
        self.min_fixed_order
    }

    pub const fn max_fixed_order(&self) -> usize {
        self.max_fixed_order
    }

    pub const fn min_partition_order(&self) -> usize {
        self.min_partition_order
    }

    pub const fn max_partition_order(&self) -> usize {
        self.max_partition_order
    }

    pub const fn min_precision_search(&self) -> usize {
        self.min_precision_search
    }

    pub const fn max_precision_search(&self) -> usize {
        self.max_precision_search
    }

    pub const fn estimation_depth(&self) -> usize {
        self.estimation_depth
    }

    /// Returns the variable-block-size mode. `0` means fixed block size.
    pub const fn variable_block_size(&self) -> usize {
        self.variable_block_size
    }

    pub const fn do_md5(&self) -> bool {
        self.do_md5
    }

    pub const fn do_verify(&self) -> bool {
        self.do_verify
    }

    pub const fn do_seektable(&self) -> bool {
        self.do_seektable
    }

    pub const fn use_coprocessor(&self) -> bool {
        self.use_coprocessor
    }

    /// Sets an explicit block size. `0` derives it from [`block_time_ms`].
    ///
    /// [`block_time_ms`]: EncoderConfig::block_time_ms
    ///
    /// # Errors
    ///
    /// Returns [`RangeError`] if `size` exceeds the supported maximum.
    pub fn set_block_size(&mut self, size: usize) -> Result<(), RangeError> {
        if size > MAX_BLOCKSIZE {
            return Err(RangeError::from_display(
                "block_size",
                "must not exceed the maximum block size",
                &size,
            ));
        }
        self.block_size = size;
        Ok(())
    }

    pub fn set_padding_size(&mut self, size: usize) {
        self.padding_size = size;
    }

    pub fn set_order_method(&mut self, method: OrderMethod) {
        self.order_method = method;
    }

    pub fn set_prediction_type(&mut self, ptype: PredictionType) {
        self.prediction_type = ptype;
    }

    pub fn set_stereo_method(&mut self, method: StereoMethod) {
        self.stereo_method = method;
    }

    /// Sets the window bank used for LPC analysis.
    ///
    /// # Errors
    ///
    /// Returns [`RangeError`] if `windows` is empty.
    pub fn set_window_functions(&mut self, windows: WindowFunctions) -> Result<(), RangeError> {
        if windows.is_empty() {
            return Err(RangeError::from_display(
                "window_functions",
                "at least one window must be selected",
                &"(empty)",
            ));
        }
        self.window_functions = windows;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`RangeError`] if `order` is zero or above the current maximum.
    pub fn set_min_lpc_order(&mut self, order: usize) -> Result<(), RangeError> {
        if order < 1 || order > self.max_lpc_order {
            return Err(RangeError::from_display(
                "min_lpc_order",
                "must be in `1..=max_lpc_order`",
                &order,
            ));
        }
        self.min_lpc_order = order;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`RangeError`] if `order` is below the current minimum or
    /// above the format limit.
    pub fn set_max_lpc_order(&mut self, order: usize) -> Result<(), RangeError> {
        if order > MAX_LPC_ORDER || order < self.min_lpc_order {
            return Err(RangeError::from_display(
                "max_lpc_order",
                "must be in `min_lpc_order..=32`",
                &order,
            ));
        }
        self.max_lpc_order = order;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`RangeError`] if `order` is above the current maximum.
    pub fn set_min_fixed_order(&mut self, order: usize) -> Result<(), RangeError> {
        if order > self.max_fixed_order {
            return Err(RangeError::from_display(
                "min_fixed_order",
                "must not exceed `max_fixed_order`",
                &order,
            ));
        }
        self.min_fixed_order = order;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`RangeError`] if `order` is below the current minimum or
    /// above 4.
    pub fn set_max_fixed_order(&mut self, order: usize) -> Result<(), RangeError> {
        if order > super::constant::fixed::MAX_ORDER || order < self.min_fixed_order {
            return Err(RangeError::from_display(
                "max_fixed_order",
                "must be in `min_fixed_order..=4`",
                &order,
            ));
        }
        self.max_fixed_order = order;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`RangeError`] if `order` is above the current maximum.
    pub fn set_min_partition_order(&mut self, order: usize) -> Result<(), RangeError> {
        if order > self.max_partition_order {
            return Err(RangeError::from_display(
                "min_partition_order",
                "must not exceed `max_partition_order`",
                &order,
            ));
        }
        self.min_partition_order = order;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`RangeError`] if `order` is below the current minimum or
    /// above 8.
    pub fn set_max_partition_order(&mut self, order: usize) -> Result<(), RangeError> {
        if order > super::constant::rice::MAX_PARTITION_ORDER || order < self.min_partition_order {
            return Err(RangeError::from_display(
                "max_partition_order",
                "must be in `min_partition_order..=8`",
                &order,
            ));
        }
        self.max_partition_order = order;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`RangeError`] if `offset` is above the current maximum.
    pub fn set_min_precision_search(&mut self, offset: usize) -> Result<(), RangeError> {
        if offset > self.max_precision_search {
            return Err(RangeError::from_display(
                "min_precision_search",
                "must not exceed `max_precision_search`",
                &offset,
            ));
        }
        self.min_precision_search = offset;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`RangeError`] if `offset` is below the current minimum or not
    /// below the number of probed precisions.
    pub fn set_max_precision_search(&mut self, offset: usize) -> Result<(), RangeError> {
        if offset >= MAX_PRECISIONS || offset < self.min_precision_search {
            return Err(RangeError::from_display(
                "max_precision_search",
                "must be in `min_precision_search..4`",
                &offset,
            ));
        }
        self.max_precision_search = offset;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`RangeError`] if `depth` is not in `1..=32`.
    pub fn set_estimation_depth(&mut self, depth: usize) -> Result<(), RangeError> {
        if depth < 1 || depth > 32 {
            return Err(RangeError::from_display(
                "estimation_depth",
                "must be in `1..=32`",
                &depth,
            ));
        }
        self.estimation_depth = depth;
        Ok(())
    }

    pub fn set_variable_block_size(&mut self, mode: usize) {
        self.variable_block_size = mode;
    }

    pub fn set_do_md5(&mut self, enabled: bool) {
        self.do_md5 = enabled;
    }

    pub fn set_do_verify(&mut self, enabled: bool) {
        self.do_verify = enabled;
    }

    pub fn set_do_seektable(&mut self, enabled: bool) {
        self.do_seektable = enabled;
    }

    pub fn set_use_coprocessor(&mut self, enabled: bool) {
        self.use_coprocessor = enabled;
    }

    /// Chooses the frame length for a stream with the given sample rate.
    ///
    /// When no explicit block size is set, picks the largest header-codable
    /// size not longer than [`block_time_ms`]. In variable-block-size mode
    /// the base size is additionally constrained to a power of two.
    ///
    /// [`block_time_ms`]: EncoderConfig::block_time_ms
    pub fn select_block_size(&self, sample_rate: usize) -> usize {
        if self.block_size != 0 {
            return self.block_size;
        }
        let target = sample_rate * self.block_time_ms / 1000;
        if self.variable_block_size > 0 {
            let mut size = 1024;
            while target >= size && size < MAX_BLOCKSIZE {
                size <<= 1;
            }
            return size >> 1;
        }
        let mut best = CODED_BLOCKSIZES[0];
        for &size in &CODED_BLOCKSIZES {
            if target >= size && size > best {
                best = size;
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_level_seven() {
        let config = EncoderConfig::default();
        assert_eq!(config, EncoderConfig::from_level(7).expect("valid level"));
        assert_eq!(config.max_lpc_order(), 12);
        assert_eq!(config.stereo_method(), StereoMethod::Evaluate);
        assert!(config
            .window_functions()
            .contains(WindowFunctions::TUKEY | WindowFunctions::FLATTOP));
        assert_eq!(config.window_functions().count(), 2);
    }

    #[test]
    fn level_presets() {
        let fastest = EncoderConfig::from_level(0).expect("valid level");
        assert_eq!(fastest.prediction_type(), PredictionType::Fixed);
        assert_eq!(fastest.stereo_method(), StereoMethod::Independent);
        assert_eq!(fastest.block_time_ms(), 53);

        let best = EncoderConfig::from_level(11).expect("valid level");
        assert_eq!(best.max_lpc_order(), 32);
        assert_eq!(best.max_fixed_order(), 4);
        assert_eq!(best.estimation_depth(), 5);
        assert_eq!(best.variable_block_size(), 4);

        assert!(EncoderConfig::from_level(13).is_err());
    }

    #[test]
    fn setter_validation() {
        let mut config = EncoderConfig::default();
        assert!(config.set_max_lpc_order(33).is_err());
        assert!(config.set_max_lpc_order(32).is_ok());
        assert!(config.set_min_lpc_order(0).is_err());
        assert!(config.set_min_lpc_order(26).is_ok());
        // Lowering the max below the current min must fail.
        assert!(config.set_max_lpc_order(25).is_err());

        assert!(config.set_max_partition_order(9).is_err());
        assert!(config.set_max_fixed_order(5).is_err());
        assert!(config.set_estimation_depth(0).is_err());
        assert!(config.set_estimation_depth(33).is_err());
        assert!(config.set_max_precision_search(4).is_err());
        assert!(config.set_window_functions(WindowFunctions::default()).is_err());
    }

    #[test]
    fn block_size_selection() {
        let config = EncoderConfig::default();
        // 44.1kHz * 105ms = 4630 samples => 4608 is the largest codable size.
        assert_eq!(config.select_block_size(44100), 4608);

        let fastest = EncoderConfig::from_level(0).expect("valid level");
        // 44.1kHz * 53ms = 2337 samples => 2304.
        assert_eq!(fastest.select_block_size(44100), 2304);

        let mut vbs = EncoderConfig::from_level(11).expect("valid level");
        // Power-of-two base size in variable-block-size mode.
        assert_eq!(vbs.select_block_size(44100), 4096);
        vbs.set_block_size(1000).expect("valid size");
        assert_eq!(vbs.select_block_size(44100), 1000);
    }

    #[test]
    fn serialization_round_trip() {
        let mut config = EncoderConfig::from_level(8).expect("valid level");
        config.set_do_verify(true);
        let doc = toml::to_string(&config).expect("serialization failed");
        let recovered: EncoderConfig = toml::from_str(&doc).expect("deserialization failed");
        assert_eq!(recovered, config);
    }

    #[test]
    fn deserialization_with_defaults() {
        let config: EncoderConfig =
            toml::from_str("max_lpc_order = 20\nstereo_method = \"independent\"")
                .expect("deserialization failed");
        assert_eq!(config.max_lpc_order(), 20);
        assert_eq!(config.stereo_method(), StereoMethod::Independent);
        // Unspecified fields fall back to the level-7 defaults.
        assert_eq!(config.max_partition_order(), 6);
    }
}
