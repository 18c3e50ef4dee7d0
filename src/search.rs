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

//! Subframe search: predictor, order and stereo-mode selection.

use super::config::EncoderConfig;
use super::config::OrderMethod;
use super::config::PredictionType;
use super::config::StereoMethod;
use super::constant::fixed::MAX_ORDER as MAX_FIXED_ORDER;
use super::constant::qlpc::MAX_ORDER as MAX_LPC_ORDER;
use super::fixed;
use super::frame::ChannelMode;
use super::frame::FrameState;
use super::frame::SubframeType;
use super::lpc;
use super::rice;
use super::window::WindowBank;

/// Search knobs copied out of the configuration.
///
/// The two-pass stereo estimation narrows these for its first pass
/// without touching the stream configuration.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SearchParams {
    pub min_fixed_order: usize,
    pub max_fixed_order: usize,
    pub min_lpc_order: usize,
    pub max_lpc_order: usize,
    pub min_partition_order: usize,
    pub max_partition_order: usize,
    pub min_precision_search: usize,
    pub max_precision_search: usize,
    pub estimation_depth: usize,
}

impl SearchParams {
    pub fn from_config(config: &EncoderConfig) -> Self {
        Self {
            min_fixed_order: config.min_fixed_order(),
            max_fixed_order: config.max_fixed_order(),
            min_lpc_order: config.min_lpc_order().max(1),
            max_lpc_order: config.max_lpc_order(),
            min_partition_order: config.min_partition_order(),
            max_partition_order: config.max_partition_order(),
            min_precision_search: config.min_precision_search(),
            max_precision_search: config.max_precision_search(),
            estimation_depth: config.estimation_depth(),
        }
    }

    /// Cheap variant used by the first estimation pass: one fixed order,
    /// one precision, shallow orders.
    fn narrowed(mut self) -> Self {
        self.min_fixed_order = 2;
        self.max_fixed_order = 2;
        self.min_precision_search = self.max_precision_search;
        self.max_lpc_order = self.max_lpc_order.min(8);
        self.min_lpc_order = self.min_lpc_order.min(self.max_lpc_order);
        self.estimation_depth = 1;
        self
    }
}

fn partition_range(params: &SearchParams, n: usize, pred_order: usize) -> (usize, usize) {
    (
        rice::max_partition_order(params.min_partition_order, n, pred_order),
        rice::max_partition_order(params.max_partition_order, n, pred_order),
    )
}

/// Evaluates one fixed-predictor order as a candidate for channel `ch`.
fn evaluate_fixed(frame: &mut FrameState, params: &SearchParams, order: usize, ch: usize) {
    let FrameState {
        current,
        subframes,
        finder,
        blocksize,
        ..
    } = frame;
    let n = *blocksize;
    let st = &mut subframes[ch];
    if st.done_fixed & (1u8 << order) != 0 {
        return;
    }
    st.done_fixed |= 1u8 << order;

    current.kind = SubframeType::Fixed;
    current.order = order;
    fixed::compute_residual(order, &st.samples, &mut current.residual);

    let (pmin, pmax) = partition_range(params, n, order);
    let bits = finder.find(&mut current.rc, pmin, pmax, &current.residual[..n], order);
    current.size = (order as u32) * st.obits + 6 + bits as u32;

    if current.size <= st.best.size {
        std::mem::swap(current, &mut st.best);
    }
}

/// Evaluates one LPC order under the configured precision offsets.
///
/// Evaluation is skipped for (precision, order) pairs already tried on
/// this window in an earlier pass.
fn evaluate_lpc(
    frame: &mut FrameState,
    params: &SearchParams,
    window: usize,
    order: usize,
    ch: usize,
) {
    let FrameState {
        current,
        subframes,
        finder,
        blocksize,
        ..
    } = frame;
    let n = *blocksize;
    let st = &mut subframes[ch];
    let base_precision = lpc::baseline_precision(n);

    for ip in params.min_precision_search..=params.max_precision_search {
        let cbits = base_precision + ip;
        if cbits >= 16 {
            break;
        }
        if !st.lpc_ctx[window].mark_done(ip, order) {
            continue;
        }

        let mut coefs = [0i32; MAX_LPC_ORDER];
        let shift = lpc::quantize_coefs(st.lpc_ctx[window].lpc_row(order), cbits, &mut coefs);

        current.kind = SubframeType::Lpc;
        current.order = order;
        current.window = window;
        current.shift = shift;
        current.cbits = cbits as u32;
        current.coefs = coefs;

        if lpc::needs_wide_accumulator(&coefs[..order], st.obits as usize) {
            lpc::compute_residual_wide(&st.samples, &coefs[..order], shift, &mut current.residual);
        } else {
            lpc::compute_residual(&st.samples, &coefs[..order], shift, &mut current.residual);
        }

        let (pmin, pmax) = partition_range(params, n, order);
        let bits = finder.find(&mut current.rc, pmin, pmax, &current.residual[..n], order);
        current.size = (order as u32) * st.obits
            + 4
            + 5
            + (order as u32) * cbits as u32
            + 6
            + bits as u32;

        if current.size <= st.best.size {
            std::mem::swap(current, &mut st.best);
        }
    }
}

/// Evaluates a specific LPC (window, order) with precomputed quantized
/// coefficients, as produced by the coprocessor estimation.
pub(crate) fn evaluate_lpc_precomputed(
    frame: &mut FrameState,
    params: &SearchParams,
    window: usize,
    order: usize,
    cbits: usize,
    ch: usize,
) {
    let FrameState {
        current,
        subframes,
        finder,
        blocksize,
        ..
    } = frame;
    let n = *blocksize;
    let st = &mut subframes[ch];

    let mut coefs = [0i32; MAX_LPC_ORDER];
    coefs[..order].copy_from_slice(&st.lpc_ctx[window].coefs[..order]);
    let shift = st.lpc_ctx[window].shift;

    current.kind = SubframeType::Lpc;
    current.order = order;
    current.window = window;
    current.shift = shift;
    current.cbits = cbits as u32;
    current.coefs = coefs;

    if lpc::needs_wide_accumulator(&coefs[..order], st.obits as usize) {
        lpc::compute_residual_wide(&st.samples, &coefs[..order], shift, &mut current.residual);
    } else {
        lpc::compute_residual(&st.samples, &coefs[..order], shift, &mut current.residual);
    }

    let (pmin, pmax) = partition_range(params, n, order);
    let bits = finder.find(&mut current.rc, pmin, pmax, &current.residual[..n], order);
    current.size =
        (order as u32) * st.obits + 4 + 5 + (order as u32) * cbits as u32 + 6 + bits as u32;

    if current.size <= st.best.size {
        std::mem::swap(current, &mut st.best);
    }
}

/// Returns `true` and installs a constant subframe if all samples agree.
fn try_constant(frame: &mut FrameState, ch: usize) -> bool {
    let n = frame.blocksize;
    let st = &mut frame.subframes[ch];
    if !st.samples[1..n].iter().all(|&s| s == st.samples[0]) {
        return false;
    }
    st.best.kind = SubframeType::Constant;
    st.best.residual[0] = st.samples[0];
    st.best.size = st.obits;
    true
}

/// Runs one full candidate search for channel `ch`.
///
/// `pass` steers the two-pass stereo estimation: pass 1 skips the fixed
/// predictors for searched prediction, pass 2 restricts LPC to the window
/// chosen by pass 1.
pub(crate) fn encode_residual(
    frame: &mut FrameState,
    bank: &WindowBank,
    params: &SearchParams,
    predict: PredictionType,
    omethod: OrderMethod,
    pass: u32,
    ch: usize,
) {
    let n = frame.blocksize;
    let best_window = (frame.subframes[ch].best.kind == SubframeType::Lpc)
        .then(|| frame.subframes[ch].best.window);

    if try_constant(frame, ch) {
        return;
    }

    frame.current.kind = SubframeType::Verbatim;
    frame.current.size = frame.subframes[ch].obits * n as u32;
    frame.choose_best(ch);

    if n < 5 || predict == PredictionType::None {
        return;
    }

    if predict == PredictionType::Fixed
        || (predict == PredictionType::Search && pass != 1)
        || n <= params.max_lpc_order
    {
        let max_fixed = params.max_fixed_order.min(MAX_FIXED_ORDER);
        let min_fixed = params.min_fixed_order.min(max_fixed);
        for order in min_fixed..=max_fixed {
            evaluate_fixed(frame, params, order, ch);
        }
    }

    if n > params.max_lpc_order
        && matches!(predict, PredictionType::Levinson | PredictionType::Search)
    {
        let min_order = params.min_lpc_order;
        let max_order = params.max_lpc_order;

        for window in 0..bank.count() {
            if pass == 2 && Some(window) != best_window {
                continue;
            }

            {
                let st = &mut frame.subframes[ch];
                st.lpc_ctx[window].analyze(max_order, &st.samples, bank.window(window));
            }

            match omethod {
                OrderMethod::Max => {
                    evaluate_lpc(frame, params, window, max_order, ch);
                }
                OrderMethod::Estimate => {
                    // Probe orders where the reflection coefficients cross
                    // the significance threshold, from the top down.
                    let mut found = 0;
                    for order in (min_order..=max_order).rev() {
                        if found >= params.estimation_depth {
                            break;
                        }
                        if frame.subframes[ch].lpc_ctx[window].is_interesting_order(order, max_order)
                        {
                            evaluate_lpc(frame, params, window, order, ch);
                            found += 1;
                        }
                    }
                    if found == 0 {
                        evaluate_lpc(frame, params, window, min_order, ch);
                    }
                }
                OrderMethod::EstSearch => {
                    let mut found = 0;
                    for order in min_order..=max_order {
                        if found >= params.estimation_depth {
                            break;
                        }
                        if frame.subframes[ch].lpc_ctx[window].is_interesting_order(order, max_order)
                        {
                            evaluate_lpc(frame, params, window, order, ch);
                            found += 1;
                        }
                    }
                    if found == 0 {
                        evaluate_lpc(frame, params, window, min_order, ch);
                    }
                }
                OrderMethod::Search => {
                    for order in (min_order..=max_order).rev() {
                        evaluate_lpc(frame, params, window, order, ch);
                    }
                }
                OrderMethod::LogFast => {
                    log_fast(frame, params, window, min_order, max_order, ch);
                }
                OrderMethod::LogSearch => {
                    log_fast(frame, params, window, min_order, max_order, ch);
                    // Refine around the best found order by halving steps.
                    if frame.subframes[ch].best.kind == SubframeType::Lpc {
                        let mut step = MAX_LPC_ORDER;
                        while step > 0 {
                            let last = frame.subframes[ch].best.order;
                            if step <= (last + 1) / 2 {
                                let mut order = last.saturating_sub(step);
                                while order <= last + step {
                                    if order >= min_order && order <= max_order {
                                        evaluate_lpc(frame, params, window, order, ch);
                                    }
                                    order += step;
                                }
                            }
                            step >>= 1;
                        }
                    }
                }
            }
        }
    }
}

/// The maximum order plus every power of two below it.
fn log_fast(
    frame: &mut FrameState,
    params: &SearchParams,
    window: usize,
    min_order: usize,
    max_order: usize,
    ch: usize,
) {
    evaluate_lpc(frame, params, window, max_order, ch);
    let mut order = MAX_LPC_ORDER;
    while order >= min_order {
        if order < max_order {
            evaluate_lpc(frame, params, window, order, ch);
        }
        order >>= 1;
    }
}

/// Re-runs the exact candidate evaluation for the (window, order) winner
/// of a coprocessor estimation pass.
pub(crate) fn encode_selected_residual(
    frame: &mut FrameState,
    params: &SearchParams,
    predict: PredictionType,
    best_window: usize,
    best_order: usize,
    cbits: usize,
    ch: usize,
) {
    let n = frame.blocksize;

    if try_constant(frame, ch) {
        return;
    }

    frame.current.kind = SubframeType::Verbatim;
    frame.current.size = frame.subframes[ch].obits * n as u32;
    frame.choose_best(ch);

    if n < 5 || predict == PredictionType::None {
        return;
    }

    if matches!(predict, PredictionType::Fixed | PredictionType::Search)
        || n <= params.max_lpc_order
    {
        let max_fixed = params.max_fixed_order.min(MAX_FIXED_ORDER);
        let min_fixed = params.min_fixed_order.min(max_fixed);
        for order in min_fixed..=max_fixed {
            evaluate_fixed(frame, params, order, ch);
        }
    }

    if n > params.max_lpc_order
        && matches!(predict, PredictionType::Levinson | PredictionType::Search)
    {
        evaluate_lpc_precomputed(frame, params, best_window, best_order, cbits, ch);
    }
}

fn encode_residual_pass1(
    frame: &mut FrameState,
    bank: &WindowBank,
    config: &EncoderConfig,
    ch: usize,
) {
    let params = SearchParams::from_config(config).narrowed();
    encode_residual(
        frame,
        bank,
        &params,
        config.prediction_type(),
        OrderMethod::Estimate,
        1,
        ch,
    );
}

fn encode_residual_pass2(
    frame: &mut FrameState,
    bank: &WindowBank,
    config: &EncoderConfig,
    ch: usize,
) {
    let params = SearchParams::from_config(config);
    encode_residual(
        frame,
        bank,
        &params,
        config.prediction_type(),
        config.order_method(),
        2,
        ch,
    );
}

fn encode_residual_onepass(
    frame: &mut FrameState,
    bank: &WindowBank,
    config: &EncoderConfig,
    ch: usize,
) {
    if bank.count() > 1 {
        encode_residual_pass1(frame, bank, config, ch);
        encode_residual_pass2(frame, bank, config, ch);
    } else {
        let params = SearchParams::from_config(config);
        encode_residual(
            frame,
            bank,
            &params,
            config.prediction_type(),
            config.order_method(),
            0,
            ch,
        );
    }
}

/// Runs the whole per-frame search on the CPU.
///
/// `slots` is the number of populated channel slots: the stereo search
/// uses four (left, right, mid, side), otherwise one per channel. For the
/// four-slot search this also settles the channel mode and compacts the
/// winning slots.
pub(crate) fn encode_frame(
    frame: &mut FrameState,
    bank: &WindowBank,
    config: &EncoderConfig,
    counter: u64,
    slots: usize,
    four_slot: bool,
) {
    if !four_slot {
        for ch in 0..slots {
            encode_residual_onepass(frame, bank, config, ch);
        }
        return;
    }

    debug_assert_eq!(slots, 4);
    match config.stereo_method() {
        StereoMethod::Independent => unreachable!(),
        StereoMethod::Estimate => {
            for ch in 0..4 {
                encode_residual_pass1(frame, bank, config, ch);
            }
            frame.measure_size(counter, config.variable_block_size() > 0, true);
            frame.choose_subframes();
            for ch in 0..2 {
                encode_residual_pass2(frame, bank, config, ch);
            }
        }
        StereoMethod::Evaluate => {
            for ch in 0..4 {
                encode_residual_onepass(frame, bank, config, ch);
            }
            frame.measure_size(counter, config.variable_block_size() > 0, true);
            frame.choose_subframes();
        }
    }
    debug_assert!(frame.ch_mode != ChannelMode::NotStereo);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WindowFunctions;
    use crate::frame::ChannelMode;

    fn make_frame(blocksize: usize) -> (FrameState, WindowBank) {
        let mut bank = WindowBank::new(WindowFunctions::TUKEY);
        bank.ensure_size(blocksize);
        let mut frame = FrameState::new(4);
        frame.blocksize = blocksize;
        (frame, bank)
    }

    fn sine(n: usize, period: f64, amp: f64) -> Vec<i32> {
        (0..n)
            .map(|t| (amp * (2.0 * std::f64::consts::PI * t as f64 / period).sin()) as i32)
            .collect()
    }

    #[test]
    fn constant_channel_costs_one_sample() {
        let (mut frame, bank) = make_frame(4096);
        frame.subframes[0].load(&vec![-42i32; 4096], 16);
        let config = EncoderConfig::default();
        let params = SearchParams::from_config(&config);
        encode_residual(
            &mut frame,
            &bank,
            &params,
            config.prediction_type(),
            config.order_method(),
            0,
            0,
        );
        let best = &frame.subframes[0].best;
        assert_eq!(best.kind, SubframeType::Constant);
        assert_eq!(best.size, frame.subframes[0].obits);
        assert_eq!(best.residual[0], -21); // one wasted bit stripped
    }

    #[test]
    fn prediction_beats_verbatim_on_tonal_signal() {
        let (mut frame, bank) = make_frame(4096);
        frame.subframes[0].load(&sine(4096, 93.7, 12000.0), 16);
        let config = EncoderConfig::default();
        let params = SearchParams::from_config(&config);
        encode_residual(
            &mut frame,
            &bank,
            &params,
            config.prediction_type(),
            config.order_method(),
            0,
            0,
        );
        let best = &frame.subframes[0].best;
        assert!(matches!(best.kind, SubframeType::Fixed | SubframeType::Lpc));
        assert!(best.size < 16 * 4096);
    }

    #[test]
    fn tiny_blocks_never_use_lpc() {
        let (mut frame, bank) = make_frame(4);
        frame.subframes[0].load(&[3, 1, 4, 1], 16);
        let config = EncoderConfig::default();
        let params = SearchParams::from_config(&config);
        encode_residual(
            &mut frame,
            &bank,
            &params,
            config.prediction_type(),
            config.order_method(),
            0,
            0,
        );
        assert_eq!(frame.subframes[0].best.kind, SubframeType::Verbatim);
    }

    #[test]
    fn search_is_idempotent_per_frame() {
        let (mut frame, bank) = make_frame(4096);
        let signal = sine(4096, 411.3, 9000.0);
        let config = EncoderConfig::default();
        let params = SearchParams::from_config(&config);

        frame.subframes[0].load(&signal, 16);
        encode_residual(
            &mut frame,
            &bank,
            &params,
            config.prediction_type(),
            config.order_method(),
            0,
            0,
        );
        let first = frame.subframes[0].best.size;
        let first_kind = frame.subframes[0].best.kind;

        // Reloading resets the memoization, so a fresh search over the
        // same samples reproduces the same winner.
        frame.subframes[0].load(&signal, 16);
        encode_residual(
            &mut frame,
            &bank,
            &params,
            config.prediction_type(),
            config.order_method(),
            0,
            0,
        );
        assert_eq!(frame.subframes[0].best.size, first);
        assert_eq!(frame.subframes[0].best.kind, first_kind);
    }

    #[test]
    fn stereo_evaluate_picks_cheap_mode_for_correlated_input() {
        let blocksize = 4096;
        let (mut frame, bank) = make_frame(blocksize);
        let left = sine(blocksize, 128.0, 11000.0);
        // Right channel nearly equals left: side channel is tiny.
        let right: Vec<i32> = left.iter().map(|&l| l - 1).collect();
        let mut mid = Vec::new();
        let mut side = Vec::new();
        crate::frame::channel_decorrelation(&left, &right, &mut mid, &mut side);
        frame.subframes[0].load(&left, 16);
        frame.subframes[1].load(&right, 16);
        frame.subframes[2].load(&mid, 16);
        frame.subframes[3].load(&side, 17);

        let config = EncoderConfig::default();
        encode_frame(&mut frame, &bank, &config, 0, 4, true);
        assert!(matches!(
            frame.ch_mode,
            ChannelMode::MidSide | ChannelMode::LeftSide | ChannelMode::RightSide
        ));
    }
}
