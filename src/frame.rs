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

//! Per-frame encoding state: candidates, channel slots and mode selection.

use super::constant::qlpc::MAX_ORDER as MAX_LPC_ORDER;
use super::constant::window::MAX_WINDOWS;
use super::constant::MAX_BLOCKSIZE;
use super::lpc::LpcContext;
use super::rice::PrcParameterFinder;
use super::rice::RiceContext;

/// Subframe encodings defined by the format.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SubframeType {
    Constant,
    Verbatim,
    Fixed,
    Lpc,
}

/// Stereo decorrelation mode of a frame.
///
/// The discriminants are the channel-assignment codes written into the
/// frame header.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChannelMode {
    /// Not a stereo stream; the header code is `channels - 1`.
    NotStereo = 0,
    LeftRight = 1,
    LeftSide = 8,
    RightSide = 9,
    MidSide = 10,
}

/// One evaluated encoding of a subframe.
///
/// The residual buffer is allocated once and reused for every candidate
/// evaluated over the stream.
#[derive(Clone, Debug)]
pub struct SubframeCandidate {
    pub kind: SubframeType,
    pub order: usize,
    pub window: usize,
    pub coefs: [i32; MAX_LPC_ORDER],
    pub cbits: u32,
    pub shift: i32,
    pub size: u32,
    pub rc: RiceContext,
    pub residual: Vec<i32>,
}

impl SubframeCandidate {
    fn new() -> Self {
        Self {
            kind: SubframeType::Verbatim,
            order: 0,
            window: 0,
            coefs: [0i32; MAX_LPC_ORDER],
            cbits: 0,
            shift: 0,
            size: u32::MAX,
            rc: RiceContext::default(),
            residual: vec![0i32; MAX_BLOCKSIZE],
        }
    }
}

/// State of one channel slot within a frame.
///
/// For stereo input four slots are populated: left, right, mid and side.
/// [`FrameState::choose_subframes`] later compacts the two slots of the
/// winning channel mode into positions 0 and 1.
pub struct ChannelState {
    /// Samples with wasted bits already shifted out.
    pub samples: Vec<i32>,
    /// Effective bits per sample after the wasted-bit shift.
    pub obits: u32,
    /// Number of wasted (always-zero) low bits.
    pub wbits: u32,
    pub best: SubframeCandidate,
    /// Bitmask of fixed orders already evaluated this frame.
    pub done_fixed: u8,
    pub lpc_ctx: Vec<LpcContext>,
}

impl ChannelState {
    fn new() -> Self {
        Self {
            samples: Vec::with_capacity(MAX_BLOCKSIZE),
            obits: 0,
            wbits: 0,
            best: SubframeCandidate::new(),
            done_fixed: 0,
            lpc_ctx: (0..MAX_WINDOWS).map(|_| LpcContext::new()).collect(),
        }
    }

    /// Loads samples into the slot and strips wasted bits.
    pub fn load(&mut self, src: &[i32], bps: u32) {
        let mut accum = 0i32;
        for &s in src {
            accum |= s;
        }
        let wbits = if accum == 0 {
            0
        } else {
            accum.trailing_zeros()
        };
        self.samples.clear();
        self.samples.extend(src.iter().map(|&s| s >> wbits));
        self.wbits = wbits;
        self.obits = bps - wbits;
        self.best.size = u32::MAX;
        self.best.kind = SubframeType::Verbatim;
        self.done_fixed = 0;
        for ctx in &mut self.lpc_ctx {
            ctx.reset();
        }
    }
}

const fn log2i(v: u64) -> u32 {
    if v == 0 {
        0
    } else {
        63 - v.leading_zeros()
    }
}

/// Mutable state shared by all subframe searches of one frame.
pub struct FrameState {
    pub blocksize: usize,
    pub ch_mode: ChannelMode,
    pub subframes: Vec<ChannelState>,
    /// The candidate currently being evaluated. Swapped into a channel's
    /// `best` by [`choose_best`].
    ///
    /// [`choose_best`]: FrameState::choose_best
    pub current: SubframeCandidate,
    pub finder: PrcParameterFinder,
}

impl FrameState {
    /// Allocates a frame with the given number of channel slots.
    pub fn new(slots: usize) -> Self {
        Self {
            blocksize: 0,
            ch_mode: ChannelMode::NotStereo,
            subframes: (0..slots).map(|_| ChannelState::new()).collect(),
            current: SubframeCandidate::new(),
            finder: PrcParameterFinder::new(),
        }
    }

    /// Keeps `current` as the channel's best candidate if it is no larger.
    ///
    /// The comparison is `<=` so of equally sized candidates the most
    /// recently evaluated one wins.
    pub fn choose_best(&mut self, ch: usize) {
        if self.current.size <= self.subframes[ch].best.size {
            std::mem::swap(&mut self.current, &mut self.subframes[ch].best);
        }
    }

    /// Estimated size in bits of the whole frame, and for stereo input
    /// the choice of the cheapest channel mode.
    pub fn measure_size(&mut self, counter: u64, variable_block_size: bool, do_midside: bool) -> u32 {
        // Crude estimation of the header and footer size.
        let mut total =
            32 + ((log2i(counter) + 4) / 5) * 8 + u32::from(variable_block_size) * 16 + 16;

        if do_midside {
            let mut sizes = [0u32; 4];
            for (dst, sub) in sizes.iter_mut().zip(self.subframes.iter()) {
                *dst = sub.best.size;
            }
            let mut best_bits = u32::MAX;
            let mut best_mode = ChannelMode::LeftRight;
            for (mode, bits) in [
                (ChannelMode::MidSide, sizes[2] + sizes[3]),
                (ChannelMode::RightSide, sizes[3] + sizes[1]),
                (ChannelMode::LeftSide, sizes[3] + sizes[0]),
                (ChannelMode::LeftRight, sizes[0] + sizes[1]),
            ] {
                if best_bits > bits {
                    best_bits = bits;
                    best_mode = mode;
                }
            }
            self.ch_mode = best_mode;
            return total + best_bits;
        }

        for sub in &self.subframes {
            total += sub.best.size;
        }
        total
    }

    /// Moves the two slots of the chosen channel mode into positions 0
    /// and 1, matching the subframe order of the bitstream.
    pub fn choose_subframes(&mut self) {
        match self.ch_mode {
            ChannelMode::MidSide => {
                self.subframes.swap(0, 2);
                self.subframes.swap(1, 3);
            }
            ChannelMode::LeftSide => {
                self.subframes.swap(1, 3);
            }
            ChannelMode::RightSide => {
                self.subframes.swap(0, 3);
            }
            ChannelMode::LeftRight | ChannelMode::NotStereo => {}
        }
    }
}

/// Computes the mid and side channels from left and right.
pub fn channel_decorrelation(left: &[i32], right: &[i32], mid: &mut Vec<i32>, side: &mut Vec<i32>) {
    mid.clear();
    side.clear();
    for (&l, &r) in left.iter().zip(right.iter()) {
        mid.push((l + r) >> 1);
        side.push(l - r);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wasted_bits_are_stripped() {
        let mut st = ChannelState::new();
        st.load(&[8, 16, -24, 1024], 16);
        assert_eq!(st.wbits, 3);
        assert_eq!(st.obits, 13);
        assert_eq!(st.samples, vec![1, 2, -3, 128]);

        st.load(&[1, 2, 3], 16);
        assert_eq!(st.wbits, 0);
        assert_eq!(st.obits, 16);

        // The all-zero signal has no meaningful wasted-bit count.
        st.load(&[0, 0, 0], 16);
        assert_eq!(st.wbits, 0);
        assert_eq!(st.obits, 16);
    }

    #[test]
    fn ties_prefer_most_recent_candidate() {
        let mut frame = FrameState::new(1);
        frame.subframes[0].load(&[1, 2, 3, 4], 16);

        frame.current.kind = SubframeType::Verbatim;
        frame.current.size = 100;
        frame.choose_best(0);
        assert_eq!(frame.subframes[0].best.size, 100);

        frame.current.kind = SubframeType::Fixed;
        frame.current.order = 2;
        frame.current.size = 100;
        frame.choose_best(0);
        assert_eq!(frame.subframes[0].best.kind, SubframeType::Fixed);

        frame.current.kind = SubframeType::Lpc;
        frame.current.size = 101;
        frame.choose_best(0);
        assert_eq!(frame.subframes[0].best.kind, SubframeType::Fixed);
    }

    #[test]
    fn cheapest_channel_mode_wins() {
        let mut frame = FrameState::new(4);
        for (ch, size) in [(0usize, 500u32), (1, 400), (2, 300), (3, 100)] {
            frame.subframes[ch].best.size = size;
            frame.subframes[ch].best.order = ch;
        }
        // left+side = 600, right+side = 500, mid+side = 400, l+r = 900.
        frame.measure_size(0, false, true);
        assert_eq!(frame.ch_mode, ChannelMode::MidSide);
        frame.choose_subframes();
        assert_eq!(frame.subframes[0].best.order, 2);
        assert_eq!(frame.subframes[1].best.order, 3);
    }

    #[test]
    fn decorrelation_is_exact_for_odd_sums() {
        let left = [3, -5, 100, 0];
        let right = [2, -5, -100, 1];
        let mut mid = Vec::new();
        let mut side = Vec::new();
        channel_decorrelation(&left, &right, &mut mid, &mut side);
        assert_eq!(mid, vec![2, -5, 0, 0]);
        assert_eq!(side, vec![1, 0, 200, -1]);
        // Reconstruction: l = ((m << 1) | (s & 1)) + s >> 1.
        for i in 0..4 {
            let m = (mid[i] << 1) | (side[i] & 1);
            assert_eq!((m + side[i]) >> 1, left[i]);
            assert_eq!((m - side[i]) >> 1, right[i]);
        }
    }
}
