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

//! Deterministic signal generators for tests.

#![allow(clippy::missing_panics_doc)]

use rand::Rng;
use rand::SeedableRng;

/// Generates a sinusoid with additive uniform noise.
///
/// Deterministic: the noise generator is seeded from the arguments.
pub fn sinusoid_plus_noise(
    len: usize,
    period: usize,
    amplitude: f64,
    noise_width: i32,
) -> Vec<i32> {
    let seed = len as u64 ^ (period as u64) << 24;
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    (0..len)
        .map(|t| {
            let phase = 2.0 * std::f64::consts::PI * (t % period) as f64 / period as f64;
            let noise = if noise_width > 0 {
                rng.gen_range(-noise_width..=noise_width)
            } else {
                0
            };
            (amplitude * phase.sin()) as i32 + noise
        })
        .collect()
}

/// Interleaves planar channel buffers into a single sample stream.
pub fn interleave(channels: &[Vec<i32>]) -> Vec<i32> {
    let len = channels[0].len();
    assert!(channels.iter().all(|ch| ch.len() == len));
    let mut ret = Vec::with_capacity(len * channels.len());
    for t in 0..len {
        for ch in channels {
            ret.push(ch[t]);
        }
    }
    ret
}

/// Generates `channels` correlated sinusoids and interleaves them.
pub fn stereo_test_signal(len: usize, channels: usize) -> Vec<i32> {
    let planar: Vec<Vec<i32>> = (0..channels)
        .map(|ch| sinusoid_plus_noise(len, 100 + 11 * ch, 18000.0, 32))
        .collect();
    interleave(&planar)
}
