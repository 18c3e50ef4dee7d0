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

//! Analysis windows applied to a block before LPC analysis.

use heapless::Vec as HeaplessVec;

use super::config::WindowFunctions;
use super::constant::panic_msg;
use super::constant::window::MAX_WINDOWS;
use super::constant::MAX_BLOCKSIZE;
use super::constant::MIN_BLOCKSIZE;

/// Length of the sample arena reserved for one window slot.
///
/// A slot holds the full-length window followed by its successively halved
/// variants, so twice the block size is always sufficient.
pub const SLOT_LEN: usize = MAX_BLOCKSIZE * 2;

/// Alpha parameter of the Tukey window.
const TUKEY_ALPHA: f32 = 0.5;

/// A single window function selected from [`WindowFunctions`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WindowKind {
    Welch,
    Tukey,
    Hann,
    Flattop,
    Bartlett,
}

impl WindowKind {
    /// Enumeration order determines the slot order in [`WindowBank`].
    const ALL: [(Self, WindowFunctions); 5] = [
        (Self::Welch, WindowFunctions::WELCH),
        (Self::Tukey, WindowFunctions::TUKEY),
        (Self::Hann, WindowFunctions::HANN),
        (Self::Flattop, WindowFunctions::FLATTOP),
        (Self::Bartlett, WindowFunctions::BARTLETT),
    ];

    fn fill(self, dest: &mut [f32]) {
        match self {
            Self::Welch => welch(dest),
            Self::Tukey => tukey(dest, TUKEY_ALPHA),
            Self::Hann => hann(dest),
            Self::Flattop => flattop(dest),
            Self::Bartlett => bartlett(dest),
        }
    }
}

fn welch(dest: &mut [f32]) {
    let half = (dest.len() - 1) as f32 / 2.0;
    for (i, w) in dest.iter_mut().enumerate() {
        let x = (i as f32 - half) / half;
        *w = 1.0 - x * x;
    }
}

fn tukey(dest: &mut [f32], alpha: f32) {
    let n = dest.len();
    let taper = (alpha / 2.0 * (n - 1) as f32).floor() as usize;
    for (i, w) in dest.iter_mut().enumerate() {
        *w = 1.0;
        let edge_dist = std::cmp::min(i, n - 1 - i);
        if edge_dist < taper {
            let x = edge_dist as f32 / taper as f32;
            *w = 0.5 * (1.0 + (std::f32::consts::PI * (x - 1.0)).cos());
        }
    }
}

fn hann(dest: &mut [f32]) {
    let n1 = (dest.len() - 1) as f32;
    for (i, w) in dest.iter_mut().enumerate() {
        *w = 0.5 - 0.5 * (2.0 * std::f32::consts::PI * i as f32 / n1).cos();
    }
}

fn flattop(dest: &mut [f32]) {
    const A: [f32; 5] = [1.0, 1.93, 1.29, 0.388, 0.0322];
    let n1 = (dest.len() - 1) as f32;
    for (i, w) in dest.iter_mut().enumerate() {
        let t = 2.0 * std::f32::consts::PI * i as f32 / n1;
        *w = A[0] - A[1] * t.cos() + A[2] * (2.0 * t).cos() - A[3] * (3.0 * t).cos()
            + A[4] * (4.0 * t).cos();
    }
}

fn bartlett(dest: &mut [f32]) {
    let half = (dest.len() - 1) as f32 / 2.0;
    for (i, w) in dest.iter_mut().enumerate() {
        *w = 1.0 - ((i as f32 - half) / half).abs();
    }
}

/// Preallocated bank of window slots, regenerated when the block size
/// changes.
///
/// Each slot holds the window at the current block size followed by the
/// same window at successively halved sizes, packed back to back. The
/// halved variants serve analyses of shorter sub-blocks without another
/// regeneration.
pub struct WindowBank {
    functions: WindowFunctions,
    kinds: HeaplessVec<WindowKind, MAX_WINDOWS>,
    buffer: Vec<f32>,
    size: usize,
}

impl WindowBank {
    /// Allocates a bank for the given set of window functions.
    ///
    /// Slots are generated lazily on the first [`ensure_size`] call.
    ///
    /// [`ensure_size`]: WindowBank::ensure_size
    pub fn new(functions: WindowFunctions) -> Self {
        Self {
            functions,
            kinds: HeaplessVec::new(),
            buffer: vec![0.0f32; MAX_WINDOWS * SLOT_LEN],
            size: 0,
        }
    }

    /// Regenerates all slots if `block_size` differs from the current size.
    pub fn ensure_size(&mut self, block_size: usize) {
        if block_size == self.size || block_size <= 4 {
            return;
        }
        self.size = block_size;
        self.kinds.clear();
        for (kind, flag) in WindowKind::ALL {
            if !self.functions.contains(flag) || self.kinds.is_full() {
                continue;
            }
            let slot = self.kinds.len();
            let stripe = &mut self.buffer[slot * SLOT_LEN..(slot + 1) * SLOT_LEN];
            let mut pos = 0;
            let mut sz = block_size;
            loop {
                kind.fill(&mut stripe[pos..pos + sz]);
                if sz & 1 != 0 {
                    break;
                }
                pos += sz;
                sz >>= 1;
                if sz < MIN_BLOCKSIZE {
                    break;
                }
            }
            let _ = self.kinds.push(kind);
        }
        assert!(!self.kinds.is_empty(), "{}", panic_msg::DATA_INCONSISTENT);
    }

    /// Returns the number of active window slots.
    pub fn count(&self) -> usize {
        self.kinds.len()
    }

    /// Returns the block size the bank is currently generated for.
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Returns the function generated in the given slot.
    pub fn kind(&self, slot: usize) -> WindowKind {
        self.kinds[slot]
    }

    /// Returns the full-length window of the given slot.
    pub fn window(&self, slot: usize) -> &[f32] {
        debug_assert!(slot < self.kinds.len());
        &self.buffer[slot * SLOT_LEN..slot * SLOT_LEN + self.size]
    }

    /// Returns the whole stripe of the slot including halved variants.
    pub fn slot(&self, slot: usize) -> &[f32] {
        debug_assert!(slot < self.kinds.len());
        &self.buffer[slot * SLOT_LEN..(slot + 1) * SLOT_LEN]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_symmetric(w: &[f32]) {
        for i in 0..w.len() / 2 {
            let d = (w[i] - w[w.len() - 1 - i]).abs();
            assert!(d < 1e-6, "asymmetry at {i}: {} vs {}", w[i], w[w.len() - 1 - i]);
        }
    }

    #[test]
    fn slot_order_follows_flag_order() {
        let mut bank =
            WindowBank::new(WindowFunctions::FLATTOP | WindowFunctions::TUKEY);
        bank.ensure_size(4096);
        assert_eq!(bank.count(), 2);
        assert_eq!(bank.kind(0), WindowKind::Tukey);
        assert_eq!(bank.kind(1), WindowKind::Flattop);
    }

    #[test]
    fn windows_are_symmetric_and_peak_at_center() {
        let mut bank = WindowBank::new(
            WindowFunctions::WELCH
                | WindowFunctions::TUKEY
                | WindowFunctions::HANN
                | WindowFunctions::BARTLETT,
        );
        bank.ensure_size(1152);
        for slot in 0..bank.count() {
            let w = bank.window(slot);
            assert_eq!(w.len(), 1152);
            assert_symmetric(w);
            let center = w[w.len() / 2];
            assert!((center - 1.0).abs() < 1e-2, "center {center}");
        }
    }

    #[test]
    fn tukey_taper() {
        let mut w = vec![0.0f32; 512];
        tukey(&mut w, 0.5);
        // Flat in the middle, tapered at both ends.
        assert!((w[256] - 1.0).abs() < 1e-6);
        assert!((w[200] - 1.0).abs() < 1e-6);
        assert!(w[0] < 1e-6);
        assert!(w[511] < 1e-6);
        assert!(w[30] > 0.0 && w[30] < 1.0);
    }

    #[test]
    fn halved_variants_packed_after_full_window() {
        let mut bank = WindowBank::new(WindowFunctions::HANN);
        bank.ensure_size(4096);
        let stripe = bank.slot(0);

        let mut reference = vec![0.0f32; 2048];
        hann(&mut reference);
        assert_eq!(&stripe[4096..4096 + 2048], &reference[..]);
    }

    #[test]
    fn regenerated_on_resize_only() {
        let mut bank = WindowBank::new(WindowFunctions::BARTLETT);
        bank.ensure_size(4608);
        assert_eq!(bank.size(), 4608);
        bank.ensure_size(4608);
        assert_eq!(bank.size(), 4608);
        bank.ensure_size(576);
        assert_eq!(bank.size(), 576);
        assert_eq!(bank.window(0).len(), 576);
        // Tiny tail blocks don't disturb the generated bank.
        bank.ensure_size(2);
        assert_eq!(bank.size(), 576);
    }
}
