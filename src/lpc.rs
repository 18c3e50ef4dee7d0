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

//! Linear-predictive coding analysis and quantized prediction.

use super::constant::qlpc::INTERESTING_REFLECTION;
use super::constant::qlpc::MAX_ORDER;
use super::constant::qlpc::MAX_PRECISIONS;
use super::constant::qlpc::MAX_SHIFT;
use super::constant::MAX_BLOCKSIZE;

/// Selects the baseline coefficient precision for a block size.
pub const fn baseline_precision(block_size: usize) -> usize {
    if block_size <= 192 {
        7
    } else if block_size <= 384 {
        8
    } else if block_size <= 576 {
        9
    } else if block_size <= 1152 {
        10
    } else if block_size <= 2304 {
        11
    } else if block_size <= 4608 {
        12
    } else if block_size <= 8192 {
        13
    } else if block_size <= 16384 {
        14
    } else {
        15
    }
}

/// Windowed autocorrelation of `samples` for lags `0..=max_lag`.
///
/// `scratch` holds the windowed signal between calls and is resized as
/// needed.
pub fn auto_correlation(
    samples: &[i32],
    window: &[f32],
    max_lag: usize,
    dest: &mut [f64],
    scratch: &mut Vec<f64>,
) {
    let n = samples.len();
    debug_assert!(window.len() >= n && dest.len() > max_lag);
    scratch.clear();
    scratch.extend(
        samples
            .iter()
            .zip(window.iter())
            .map(|(&s, &w)| f64::from(s) * f64::from(w)),
    );
    for (lag, d) in dest.iter_mut().enumerate().take(max_lag + 1) {
        let mut acc = 0.0f64;
        for i in lag..n {
            acc += scratch[i] * scratch[i - lag];
        }
        *d = acc;
    }
}

/// Quantizes one row of floating LPC coefficients.
///
/// The shift is chosen so that the largest coefficient uses the full
/// `precision` bits, clamped to the non-negative range the format allows.
/// Rounding errors are fed back into the following coefficients.
pub fn quantize_coefs(row: &[f32], precision: usize, coefs: &mut [i32]) -> i32 {
    let order = row.len();
    debug_assert!(order <= coefs.len());
    let qmax = (1i64 << (precision - 1)) - 1;
    let qmin = -(qmax + 1);

    let mut cmax = 0.0f64;
    for &c in row {
        cmax = cmax.max(f64::from(c).abs());
    }
    if cmax * f64::from(1i32 << MAX_SHIFT) < 1.0 {
        for c in coefs.iter_mut().take(order) {
            *c = 0;
        }
        return 0;
    }

    let mut shift = MAX_SHIFT;
    while shift > 0 && cmax * f64::from(1i32 << shift) > qmax as f64 {
        shift -= 1;
    }

    let scale = f64::from(1i32 << shift);
    let mut error = 0.0f64;
    for (c, &f) in coefs.iter_mut().zip(row.iter()) {
        error += f64::from(f) * scale;
        let q = error.round().clamp(qmin as f64, qmax as f64) as i64;
        error -= q as f64;
        *c = q as i32;
    }
    shift
}

/// Returns `true` if prediction must accumulate in 64 bits.
///
/// The 32-bit path is safe only when the sum of coefficient magnitudes
/// scaled by the sample width cannot overflow.
pub fn needs_wide_accumulator(coefs: &[i32], obits: usize) -> bool {
    let csum: u64 = coefs.iter().map(|&c| c.unsigned_abs() as u64).sum();
    (csum << obits) >= 1u64 << 32
}

/// Computes the LPC residual with a 32-bit accumulator.
///
/// The first `coefs.len()` elements of `dest` are warm-up samples.
pub fn compute_residual(samples: &[i32], coefs: &[i32], shift: i32, dest: &mut [i32]) {
    let order = coefs.len();
    let n = samples.len();
    dest[..order].copy_from_slice(&samples[..order]);
    for i in order..n {
        let mut pred = 0i32;
        for (j, &c) in coefs.iter().enumerate() {
            pred = pred.wrapping_add(c.wrapping_mul(samples[i - 1 - j]));
        }
        dest[i] = samples[i] - (pred >> shift);
    }
}

/// Computes the LPC residual with a 64-bit accumulator.
pub fn compute_residual_wide(samples: &[i32], coefs: &[i32], shift: i32, dest: &mut [i32]) {
    let order = coefs.len();
    let n = samples.len();
    dest[..order].copy_from_slice(&samples[..order]);
    for i in order..n {
        let mut pred = 0i64;
        for (j, &c) in coefs.iter().enumerate() {
            pred += i64::from(c) * i64::from(samples[i - 1 - j]);
        }
        dest[i] = samples[i] - ((pred >> shift) as i32);
    }
}

/// Per-window analysis state of one channel.
///
/// Autocorrelation, reflection coefficients and the coefficient rows for
/// every order are computed once per frame and reused by all order-search
/// strategies. `done_lpcs` remembers which (precision, order) pairs were
/// already evaluated so a two-pass search doesn't redo them.
pub struct LpcContext {
    autocorr: [f64; MAX_ORDER + 1],
    reflection: [f64; MAX_ORDER],
    rows: Vec<f32>,
    windowed: Vec<f64>,
    computed_orders: usize,
    done_lpcs: [u32; MAX_PRECISIONS],
    /// Quantized coefficients of the last winning candidate.
    pub coefs: [i32; MAX_ORDER],
    /// Shift of the last winning candidate.
    pub shift: i32,
}

impl Default for LpcContext {
    fn default() -> Self {
        Self::new()
    }
}

impl LpcContext {
    pub fn new() -> Self {
        Self {
            autocorr: [0.0; MAX_ORDER + 1],
            reflection: [0.0; MAX_ORDER],
            rows: vec![0.0f32; MAX_ORDER * MAX_ORDER],
            windowed: Vec::with_capacity(MAX_BLOCKSIZE),
            computed_orders: 0,
            done_lpcs: [0u32; MAX_PRECISIONS],
            coefs: [0i32; MAX_ORDER],
            shift: 0,
        }
    }

    /// Invalidates all per-frame state.
    pub fn reset(&mut self) {
        self.computed_orders = 0;
        self.done_lpcs = [0u32; MAX_PRECISIONS];
    }

    /// Ensures reflection coefficients and coefficient rows exist for all
    /// orders up to `max_order`.
    pub fn analyze(&mut self, max_order: usize, samples: &[i32], window: &[f32]) {
        if self.computed_orders >= max_order {
            return;
        }
        let mut windowed = std::mem::take(&mut self.windowed);
        auto_correlation(samples, window, max_order, &mut self.autocorr, &mut windowed);
        self.windowed = windowed;
        self.levinson(max_order);
    }

    /// Like [`analyze`] but starting from externally computed
    /// autocorrelation sums.
    ///
    /// [`analyze`]: LpcContext::analyze
    pub fn analyze_from_autocorrelation(&mut self, max_order: usize, autocorr: &[f64]) {
        if self.computed_orders >= max_order {
            return;
        }
        self.autocorr[..=max_order].copy_from_slice(&autocorr[..=max_order]);
        self.levinson(max_order);
    }

    /// Levinson-Durbin recursion producing reflection coefficients and the
    /// coefficient row of every order in a single pass.
    fn levinson(&mut self, max_order: usize) {
        let mut lpc = [0.0f64; MAX_ORDER];
        let mut err = self.autocorr[0];
        for i in 0..max_order {
            let mut r = -self.autocorr[i + 1];
            for j in 0..i {
                r -= lpc[j] * self.autocorr[i - j];
            }
            if err.abs() > f64::EPSILON {
                r /= err;
            } else {
                r = 0.0;
            }
            self.reflection[i] = r;
            lpc[i] = r;
            for j in 0..(i >> 1) {
                let tmp = lpc[j];
                lpc[j] += r * lpc[i - 1 - j];
                lpc[i - 1 - j] += r * tmp;
            }
            if i & 1 == 1 {
                lpc[i >> 1] += lpc[i >> 1] * r;
            }
            err *= 1.0 - r * r;
            for j in 0..=i {
                self.rows[i * MAX_ORDER + j] = (-lpc[j]) as f32;
            }
        }
        self.computed_orders = max_order;
    }

    /// Returns the floating coefficients for the given order.
    pub fn lpc_row(&self, order: usize) -> &[f32] {
        debug_assert!(order >= 1 && order <= self.computed_orders);
        &self.rows[(order - 1) * MAX_ORDER..(order - 1) * MAX_ORDER + order]
    }

    /// Returns `true` if the reflection coefficient crosses the
    /// significance threshold at `order`.
    ///
    /// An order is a crossing point when its own reflection magnitude is
    /// above the threshold while the next order's is below it. The maximum
    /// order counts as a crossing whenever its magnitude is significant.
    pub fn is_interesting_order(&self, order: usize, max_order: usize) -> bool {
        debug_assert!(order >= 1 && order <= self.computed_orders);
        let k = self.reflection[order - 1].abs();
        if k < INTERESTING_REFLECTION {
            return false;
        }
        order == max_order || self.reflection[order].abs() < INTERESTING_REFLECTION
    }

    /// Marks the (precision offset, order) pair as evaluated.
    ///
    /// Returns `false` if it was already marked.
    pub fn mark_done(&mut self, precision_idx: usize, order: usize) -> bool {
        let bit = 1u32 << (order - 1);
        if self.done_lpcs[precision_idx] & bit != 0 {
            return false;
        }
        self.done_lpcs[precision_idx] |= bit;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ones_window(n: usize) -> Vec<f32> {
        vec![1.0f32; n]
    }

    fn ar2_signal(n: usize) -> Vec<i32> {
        use rand::Rng;
        use rand::SeedableRng;
        // x[t] = 1.5 x[t-1] - 0.7 x[t-2] + e[t] with white excitation.
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        let mut x = vec![0.0f64; n];
        for t in 2..n {
            let e = rng.gen_range(-64.0..64.0);
            x[t] = 1.5 * x[t - 1] - 0.7 * x[t - 2] + e;
        }
        x.iter().map(|&v| v as i32).collect()
    }

    #[test]
    fn levinson_recovers_ar_coefficients() {
        let signal = ar2_signal(4096);
        let window = ones_window(4096);
        let mut ctx = LpcContext::new();
        ctx.analyze(8, &signal, &window);

        let row = ctx.lpc_row(2);
        assert!((row[0] - 1.5).abs() < 0.1, "got {}", row[0]);
        assert!((row[1] + 0.7).abs() < 0.1, "got {}", row[1]);
    }

    #[test]
    fn interesting_orders_follow_reflection_decay() {
        let signal = ar2_signal(4096);
        let window = ones_window(4096);
        let mut ctx = LpcContext::new();
        ctx.analyze(8, &signal, &window);

        // An AR(2) process has significant reflection coefficients only at
        // the first two orders.
        assert!(ctx.is_interesting_order(2, 8));
        assert!(!ctx.is_interesting_order(6, 8));
    }

    #[test]
    fn analysis_is_memoized_per_frame() {
        let signal = ar2_signal(512);
        let window = ones_window(512);
        let mut ctx = LpcContext::new();
        ctx.analyze(4, &signal, &window);
        assert!(ctx.mark_done(0, 4));
        assert!(!ctx.mark_done(0, 4));
        assert!(ctx.mark_done(1, 4));
        ctx.reset();
        assert!(ctx.mark_done(0, 4));
    }

    #[test]
    fn quantizer_uses_available_precision() {
        let row = [1.5f32, -0.7f32];
        let mut coefs = [0i32; MAX_ORDER];
        let shift = quantize_coefs(&row, 12, &mut coefs);
        assert!(shift >= 0 && shift <= MAX_SHIFT);
        let qmax = (1 << 11) - 1;
        assert!(coefs[0].abs() <= qmax && coefs[1].abs() <= qmax);
        // Dequantized coefficients reproduce the row within a quantum.
        let scale = f64::from(1i32 << shift);
        assert!((f64::from(coefs[0]) / scale - 1.5).abs() < 2.0 / scale);
        assert!((f64::from(coefs[1]) / scale + 0.7).abs() < 2.0 / scale);
    }

    #[test]
    fn quantizer_flushes_negligible_rows() {
        let row = [1e-9f32; 4];
        let mut coefs = [7i32; MAX_ORDER];
        let shift = quantize_coefs(&row, 12, &mut coefs);
        assert_eq!(shift, 0);
        assert_eq!(&coefs[..4], &[0, 0, 0, 0]);
    }

    #[test]
    fn narrow_and_wide_residuals_agree() {
        let signal = ar2_signal(1024);
        let coefs = [100i32, -50, 25, -12];
        let mut narrow = vec![0i32; 1024];
        let mut wide = vec![0i32; 1024];
        assert!(!needs_wide_accumulator(&coefs, 16));
        compute_residual(&signal, &coefs, 7, &mut narrow);
        compute_residual_wide(&signal, &coefs, 7, &mut wide);
        assert_eq!(narrow, wide);
    }

    #[test]
    fn wide_accumulator_guard() {
        // 17-bit side channel with large coefficients overflows 32 bits.
        let coefs = [16000i32, -16000, 8000, -4000];
        assert!(needs_wide_accumulator(&coefs, 17));
        assert!(!needs_wide_accumulator(&[1, -2, 1], 17));
    }

    #[test]
    fn residual_drops_when_model_matches() {
        let signal = ar2_signal(4096);
        let window = ones_window(4096);
        let mut ctx = LpcContext::new();
        ctx.analyze(4, &signal, &window);
        let mut coefs = [0i32; MAX_ORDER];
        let shift = quantize_coefs(ctx.lpc_row(2), 12, &mut coefs);

        let mut res = vec![0i32; 4096];
        compute_residual_wide(&signal, &coefs[..2], shift, &mut res);
        let res_energy: u64 = res[2..].iter().map(|&r| r.unsigned_abs() as u64).sum();
        let sig_energy: u64 = signal[2..].iter().map(|&s| s.unsigned_abs() as u64).sum();
        assert!(res_energy * 2 < sig_energy, "{res_energy} vs {sig_energy}");
    }
}
