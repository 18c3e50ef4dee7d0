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

//! Coprocessor offloading of the per-frame analysis.
//!
//! The expensive part of a frame search is evaluating every LPC order over
//! every analysis window. [`Coprocessor`] models an accelerator that runs
//! two batch kernels over uploaded sample slots: blockwise autocorrelation
//! partial sums and estimated residual sizes for a batch of quantized
//! predictors. [`estimate_frame`] drives the kernels, folds their partial
//! outputs on the host, and selects one (window, order) winner per channel.
//! The winner is then re-encoded exactly on the CPU, so an estimation
//! mismatch can only cost compression, never correctness.
//!
//! [`HostCoprocessor`] is a conforming backend running the kernels on the
//! host; it doubles as the reference for what accelerator implementations
//! must produce.

use super::config::EncoderConfig;
use super::constant::qlpc::MAX_ORDER as MAX_LPC_ORDER;
use super::error::CoprocessorError;
use super::frame::FrameState;
use super::frame::SubframeType;
use super::lpc;
use super::rice;
use super::search;
use super::search::SearchParams;
use super::window::WindowBank;

/// Samples per partition of the residual estimation kernel.
///
/// Unrelated to the Rice partition order; this is the kernel's work-group
/// granularity.
pub const RESIDUAL_PART_SIZE: usize = 224;

/// Samples per block of the autocorrelation kernel.
pub const AUTOCOR_BLOCK_SIZE: usize = 2048;

/// One predictor evaluation request for the residual kernel.
#[derive(Clone, Copy, Debug)]
pub struct ResidualTask {
    /// Sample slot the predictor applies to.
    pub slot: usize,
    /// Analysis window the coefficients came from.
    pub window: usize,
    pub order: usize,
    pub shift: i32,
    pub coefs: [i32; MAX_LPC_ORDER],
}

/// Batch analysis backend.
///
/// Uploads are asynchronous: they may return before the data is visible to
/// the device. `synchronize` completes all uploads and enqueued kernels;
/// the partial-sum accessors are only valid after it returns `Ok`.
pub trait Coprocessor {
    /// Copies one channel slot of samples to the device.
    fn upload_samples(&mut self, slot: usize, samples: &[i32]) -> Result<(), CoprocessorError>;

    /// Copies one analysis window to the device.
    fn upload_window(&mut self, index: usize, window: &[f32]) -> Result<(), CoprocessorError>;

    /// Schedules the autocorrelation kernel over `slots` sample slots and
    /// `windows` windows, for lags `0..=max_lag`.
    fn enqueue_autocorrelation(
        &mut self,
        blocksize: usize,
        slots: usize,
        windows: usize,
        max_lag: usize,
    ) -> Result<(), CoprocessorError>;

    /// Schedules the residual estimation kernel for a batch of predictors.
    fn enqueue_residual(
        &mut self,
        blocksize: usize,
        tasks: &[ResidualTask],
    ) -> Result<(), CoprocessorError>;

    /// Blocks until all scheduled work has completed.
    fn synchronize(&mut self) -> Result<(), CoprocessorError>;

    /// Blockwise autocorrelation partial sums for one (slot, window) pair,
    /// concatenated per block in chunks of `max_lag + 1`.
    fn autocorrelation_partials(&self, slot: usize, window: usize) -> &[f64];

    /// Estimated residual bits per kernel partition for one task.
    fn residual_partials(&self, task: usize) -> &[u64];
}

fn fold_autocorrelation(partials: &[f64], max_lag: usize, dest: &mut [f64]) {
    for d in dest.iter_mut().take(max_lag + 1) {
        *d = 0.0;
    }
    for block in partials.chunks_exact(max_lag + 1) {
        for (d, &p) in dest.iter_mut().zip(block.iter()) {
            *d += p;
        }
    }
}

/// Runs the offloaded four-slot stereo search for one frame.
///
/// On return the frame's channel mode is chosen, slots 0 and 1 hold the
/// output channels and their `best` candidates are exact encodings.
pub(crate) fn estimate_frame<C: Coprocessor + ?Sized>(
    frame: &mut FrameState,
    bank: &WindowBank,
    cop: &mut C,
    config: &EncoderConfig,
    counter: u64,
) -> Result<(), CoprocessorError> {
    let n = frame.blocksize;
    let windows = bank.count();
    let max_order = config.max_lpc_order().min(n - 1);
    let cbits = lpc::baseline_precision(n) + 1;

    for ch in 0..4 {
        cop.upload_samples(ch, &frame.subframes[ch].samples)?;
    }
    for w in 0..windows {
        cop.upload_window(w, &bank.window(w)[..n])?;
    }
    cop.enqueue_autocorrelation(n, 4, windows, max_order)?;
    cop.synchronize()?;

    let mut autocorr = [0.0f64; MAX_LPC_ORDER + 1];
    let mut tasks = Vec::with_capacity(4 * windows * max_order);
    for ch in 0..4 {
        for w in 0..windows {
            fold_autocorrelation(
                cop.autocorrelation_partials(ch, w),
                max_order,
                &mut autocorr,
            );
            let st = &mut frame.subframes[ch];
            st.lpc_ctx[w].analyze_from_autocorrelation(max_order, &autocorr);
            for order in 1..=max_order {
                let mut coefs = [0i32; MAX_LPC_ORDER];
                let shift = lpc::quantize_coefs(st.lpc_ctx[w].lpc_row(order), cbits, &mut coefs);
                tasks.push(ResidualTask {
                    slot: ch,
                    window: w,
                    order,
                    shift,
                    coefs,
                });
            }
        }
    }
    cop.enqueue_residual(n, &tasks)?;
    cop.synchronize()?;

    for (i, task) in tasks.iter().enumerate() {
        let bits: u64 = cop.residual_partials(i).iter().sum();
        let st = &mut frame.subframes[task.slot];
        let order = task.order as u64;
        let nbits = bits
            + order * u64::from(st.obits)
            + 4
            + 5
            + order * cbits as u64
            + 6;
        let nbits = u32::try_from(nbits).unwrap_or(u32::MAX);
        // Strict comparison: of equal estimates the first evaluated
        // (lower window, lower order) wins.
        if st.best.size > nbits {
            st.best.size = nbits;
            st.best.kind = SubframeType::Lpc;
            st.best.order = task.order;
            st.best.window = task.window;
            st.lpc_ctx[task.window].coefs = task.coefs;
            st.lpc_ctx[task.window].shift = task.shift;
        }
    }

    frame.measure_size(counter, config.variable_block_size() > 0, true);
    frame.choose_subframes();

    // Exact re-encoding of the estimated winners.
    let params = SearchParams::from_config(config);
    for ch in 0..2 {
        let best_window = frame.subframes[ch].best.window;
        let best_order = frame.subframes[ch].best.order;
        frame.subframes[ch].best.size = u32::MAX;
        frame.subframes[ch].best.kind = SubframeType::Verbatim;
        search::encode_selected_residual(
            frame,
            &params,
            config.prediction_type(),
            best_window,
            best_order,
            cbits,
            ch,
        );
    }
    Ok(())
}

enum Kernel {
    Autocorrelation {
        blocksize: usize,
        slots: usize,
        windows: usize,
        max_lag: usize,
    },
    Residual {
        blocksize: usize,
    },
}

/// Host implementation of the [`Coprocessor`] kernels.
pub struct HostCoprocessor {
    samples: Vec<Vec<i32>>,
    windows: Vec<Vec<f32>>,
    queue: Vec<Kernel>,
    tasks: Vec<ResidualTask>,
    /// Autocorrelation partials per (slot, window), blocks concatenated.
    autocor_out: Vec<Vec<f64>>,
    /// Laid-out shape of `autocor_out`: (windows, lag count).
    autocor_shape: (usize, usize),
    /// Per-partition bit estimates, one row per task.
    residual_out: Vec<Vec<u64>>,
    scratch: Vec<i32>,
}

impl Default for HostCoprocessor {
    fn default() -> Self {
        Self::new()
    }
}

impl HostCoprocessor {
    pub fn new() -> Self {
        Self {
            samples: Vec::new(),
            windows: Vec::new(),
            queue: Vec::new(),
            tasks: Vec::new(),
            autocor_out: Vec::new(),
            autocor_shape: (0, 0),
            residual_out: Vec::new(),
            scratch: Vec::new(),
        }
    }

    fn run_autocorrelation(
        &mut self,
        blocksize: usize,
        slots: usize,
        windows: usize,
        max_lag: usize,
    ) -> Result<(), CoprocessorError> {
        if slots > self.samples.len() || windows > self.windows.len() {
            return Err(CoprocessorError::new("kernel references unset buffers"));
        }
        let lags = max_lag + 1;
        let blocks = blocksize.div_ceil(AUTOCOR_BLOCK_SIZE);
        self.autocor_shape = (windows, lags);
        self.autocor_out.clear();
        self.autocor_out
            .resize(slots * windows, vec![0.0f64; blocks * lags]);

        for slot in 0..slots {
            let samples = &self.samples[slot];
            if samples.len() < blocksize {
                return Err(CoprocessorError::new("sample slot shorter than blocksize"));
            }
            for w in 0..windows {
                let window = &self.windows[w];
                if window.len() < blocksize {
                    return Err(CoprocessorError::new("window shorter than blocksize"));
                }
                let out = &mut self.autocor_out[slot * windows + w];
                for b in 0..blocks {
                    let start = b * AUTOCOR_BLOCK_SIZE;
                    let end = blocksize.min(start + AUTOCOR_BLOCK_SIZE);
                    for lag in 0..lags {
                        let mut acc = 0.0f64;
                        for i in start.max(lag)..end {
                            let x = f64::from(samples[i]) * f64::from(window[i]);
                            let y = f64::from(samples[i - lag]) * f64::from(window[i - lag]);
                            acc += x * y;
                        }
                        out[b * lags + lag] = acc;
                    }
                }
            }
        }
        Ok(())
    }

    fn run_residual(&mut self, blocksize: usize) -> Result<(), CoprocessorError> {
        let parts = blocksize.div_ceil(RESIDUAL_PART_SIZE);
        self.residual_out.clear();
        self.scratch.resize(blocksize, 0);
        for task in &self.tasks {
            let samples = self
                .samples
                .get(task.slot)
                .ok_or_else(|| CoprocessorError::new("task references unset sample slot"))?;
            if samples.len() < blocksize {
                return Err(CoprocessorError::new("sample slot shorter than blocksize"));
            }
            lpc::compute_residual_wide(
                &samples[..blocksize],
                &task.coefs[..task.order],
                task.shift,
                &mut self.scratch,
            );

            let mut row = vec![0u64; parts];
            for (p, bits) in row.iter_mut().enumerate() {
                let start = (p * RESIDUAL_PART_SIZE).max(task.order);
                let end = blocksize.min((p + 1) * RESIDUAL_PART_SIZE);
                if start >= end {
                    *bits = 4;
                    continue;
                }
                let sum: u64 = self.scratch[start..end]
                    .iter()
                    .map(|&r| u64::from(rice::encode_signbit(r)))
                    .sum();
                let (_, nbits) = rice::find_optimal_param(sum, (end - start) as u64);
                *bits = nbits + 4;
            }
            self.residual_out.push(row);
        }
        Ok(())
    }
}

impl Coprocessor for HostCoprocessor {
    fn upload_samples(&mut self, slot: usize, samples: &[i32]) -> Result<(), CoprocessorError> {
        if self.samples.len() <= slot {
            self.samples.resize(slot + 1, Vec::new());
        }
        self.samples[slot].clear();
        self.samples[slot].extend_from_slice(samples);
        Ok(())
    }

    fn upload_window(&mut self, index: usize, window: &[f32]) -> Result<(), CoprocessorError> {
        if self.windows.len() <= index {
            self.windows.resize(index + 1, Vec::new());
        }
        self.windows[index].clear();
        self.windows[index].extend_from_slice(window);
        Ok(())
    }

    fn enqueue_autocorrelation(
        &mut self,
        blocksize: usize,
        slots: usize,
        windows: usize,
        max_lag: usize,
    ) -> Result<(), CoprocessorError> {
        self.queue.push(Kernel::Autocorrelation {
            blocksize,
            slots,
            windows,
            max_lag,
        });
        Ok(())
    }

    fn enqueue_residual(
        &mut self,
        blocksize: usize,
        tasks: &[ResidualTask],
    ) -> Result<(), CoprocessorError> {
        self.tasks.clear();
        self.tasks.extend_from_slice(tasks);
        self.queue.push(Kernel::Residual { blocksize });
        Ok(())
    }

    fn synchronize(&mut self) -> Result<(), CoprocessorError> {
        let queue = std::mem::take(&mut self.queue);
        for kernel in queue {
            match kernel {
                Kernel::Autocorrelation {
                    blocksize,
                    slots,
                    windows,
                    max_lag,
                } => self.run_autocorrelation(blocksize, slots, windows, max_lag)?,
                Kernel::Residual { blocksize } => self.run_residual(blocksize)?,
            }
        }
        Ok(())
    }

    fn autocorrelation_partials(&self, slot: usize, window: usize) -> &[f64] {
        let (windows, _) = self.autocor_shape;
        &self.autocor_out[slot * windows + window]
    }

    fn residual_partials(&self, task: usize) -> &[u64] {
        &self.residual_out[task]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WindowFunctions;
    use crate::frame::channel_decorrelation;
    use crate::frame::ChannelMode;

    fn stereo_signal(n: usize) -> (Vec<i32>, Vec<i32>) {
        use rand::Rng;
        use rand::SeedableRng;
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let left: Vec<i32> = (0..n)
            .map(|t| {
                let tone = 9000.0 * (2.0 * std::f64::consts::PI * t as f64 / 97.3).sin();
                (tone + rng.gen_range(-40.0..40.0)) as i32
            })
            .collect();
        let right: Vec<i32> = left
            .iter()
            .enumerate()
            .map(|(t, &l)| l + ((t as f64 / 51.1).sin() * 30.0) as i32)
            .collect();
        (left, right)
    }

    fn load_stereo(frame: &mut FrameState, left: &[i32], right: &[i32]) {
        let mut mid = Vec::new();
        let mut side = Vec::new();
        channel_decorrelation(left, right, &mut mid, &mut side);
        frame.subframes[0].load(left, 16);
        frame.subframes[1].load(right, 16);
        frame.subframes[2].load(&mid, 16);
        frame.subframes[3].load(&side, 17);
    }

    #[test]
    fn host_autocorrelation_matches_direct_computation() {
        let n = 4096;
        let (left, _) = stereo_signal(n);
        let mut bank = WindowBank::new(WindowFunctions::TUKEY);
        bank.ensure_size(n);

        let mut cop = HostCoprocessor::new();
        cop.upload_samples(0, &left).unwrap();
        cop.upload_window(0, &bank.window(0)[..n]).unwrap();
        cop.enqueue_autocorrelation(n, 1, 1, 12).unwrap();
        cop.synchronize().unwrap();

        let mut folded = [0.0f64; MAX_LPC_ORDER + 1];
        fold_autocorrelation(cop.autocorrelation_partials(0, 0), 12, &mut folded);

        let mut direct = [0.0f64; MAX_LPC_ORDER + 1];
        let mut scratch = Vec::new();
        lpc::auto_correlation(&left, bank.window(0), 12, &mut direct, &mut scratch);
        for lag in 0..=12 {
            let rel = (folded[lag] - direct[lag]).abs() / direct[0].max(1.0);
            assert!(rel < 1e-9, "lag {lag}: {} vs {}", folded[lag], direct[lag]);
        }
    }

    #[test]
    fn kernel_rejects_missing_buffers() {
        let mut cop = HostCoprocessor::new();
        cop.enqueue_autocorrelation(1024, 2, 1, 8).unwrap();
        assert!(cop.synchronize().is_err());
    }

    #[test]
    fn estimation_settles_stereo_mode_and_exact_sizes() {
        let n = 4096;
        let (left, right) = stereo_signal(n);
        let mut bank = WindowBank::new(WindowFunctions::TUKEY);
        bank.ensure_size(n);
        let mut frame = FrameState::new(4);
        frame.blocksize = n;
        load_stereo(&mut frame, &left, &right);

        let config = EncoderConfig::default();
        let mut cop = HostCoprocessor::new();
        estimate_frame(&mut frame, &bank, &mut cop, &config, 0).unwrap();

        // Nearly identical channels should decorrelate well.
        assert!(matches!(
            frame.ch_mode,
            ChannelMode::MidSide | ChannelMode::LeftSide | ChannelMode::RightSide
        ));
        for ch in 0..2 {
            let best = &frame.subframes[ch].best;
            assert_ne!(best.size, u32::MAX);
            assert!(best.size < 16 * n as u32);
        }
    }

    #[test]
    fn offloaded_winner_is_no_worse_than_verbatim() {
        let n = 2048;
        let (left, right) = stereo_signal(n);
        let mut bank = WindowBank::new(WindowFunctions::TUKEY);
        bank.ensure_size(n);
        let mut frame = FrameState::new(4);
        frame.blocksize = n;
        load_stereo(&mut frame, &left, &right);

        let config = EncoderConfig::default();
        let mut cop = HostCoprocessor::new();
        estimate_frame(&mut frame, &bank, &mut cop, &config, 3).unwrap();
        for ch in 0..2 {
            let sub = &frame.subframes[ch];
            assert!(sub.best.size <= sub.obits * n as u32);
        }
    }
}
