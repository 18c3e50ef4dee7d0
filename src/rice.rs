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

//! Partitioned Rice coding (PRC) parameter optimization.

use super::constant::rice::MAX_PARTITIONS;
use super::constant::rice::MAX_PARTITION_ORDER;
use super::constant::rice::MAX_RICE_PARAMETER;

/// Maps a signed residual to the unsigned value that is Rice-coded.
#[inline]
pub const fn encode_signbit(v: i32) -> u32 {
    ((2 * v) ^ (v >> 31)) as u32
}

/// Inverse of [`encode_signbit`].
#[inline]
pub const fn decode_signbit(v: u32) -> i32 {
    ((v >> 1) as i32) ^ -((v & 1) as i32)
}

/// Estimates the number of bits to encode a partition with parameter `k`.
///
/// `sum` is the sum of the sign-folded residuals, `n` their count. The
/// quotient term is approximated from `sum` instead of being accumulated
/// per sample.
#[inline]
pub const fn encode_count(sum: u64, n: u64, k: u32) -> u64 {
    n * (k as u64 + 1) + (sum.saturating_sub(n >> 1) >> k)
}

/// Finds the cheapest Rice parameter for a partition.
///
/// Returns the parameter and its estimated bit count. The scan keeps the
/// two terms of [`encode_count`] incrementally updated instead of
/// re-evaluating the formula for every `k`.
pub fn find_optimal_param(sum: u64, n: u64) -> (u8, u64) {
    let mut k_opt = 0u8;
    let mut a = n;
    let mut b = sum.saturating_sub(n >> 1);
    let mut nbits = a + b;
    for k in 1..=MAX_RICE_PARAMETER as u8 {
        a += n;
        b >>= 1;
        let nbits_k = a + b;
        if nbits_k < nbits {
            k_opt = k;
            nbits = nbits_k;
        }
    }
    (k_opt, nbits)
}

/// Upper bound on the partition order for a given block.
///
/// Each partition must divide the block evenly and the first partition
/// must keep at least one residual after the warm-up samples.
pub fn max_partition_order(limit: usize, block_size: usize, pred_order: usize) -> usize {
    let mut porder = std::cmp::min(limit, block_size.trailing_zeros() as usize);
    if pred_order > 0 {
        let mut log2 = 0usize;
        let mut m = block_size / pred_order;
        while m > 1 {
            m >>= 1;
            log2 += 1;
        }
        porder = std::cmp::min(porder, log2);
    }
    porder
}

/// Rice parameters chosen for the residual of one subframe.
#[derive(Clone, Debug)]
pub struct RiceContext {
    /// Partition order. The residual is split into `1 << porder` parts.
    pub porder: usize,
    /// Rice parameter per partition. Only the first `1 << porder` entries
    /// are meaningful.
    pub params: [u8; MAX_PARTITIONS],
}

impl Default for RiceContext {
    fn default() -> Self {
        Self {
            porder: 0,
            params: [0u8; MAX_PARTITIONS],
        }
    }
}

/// Reusable scratch space for the partitioned parameter search.
///
/// Keeping the sign-folded copy and the partition-sum pyramid here avoids
/// reallocating them for every subframe evaluation.
pub struct PrcParameterFinder {
    udata: Vec<u32>,
    sums: Vec<u64>,
    tmp: RiceContext,
}

impl Default for PrcParameterFinder {
    fn default() -> Self {
        Self::new()
    }
}

impl PrcParameterFinder {
    pub fn new() -> Self {
        Self {
            udata: Vec::new(),
            sums: vec![0u64; (MAX_PARTITION_ORDER + 1) * MAX_PARTITIONS],
            tmp: RiceContext::default(),
        }
    }

    /// Finds the optimal partition order and per-partition parameters.
    ///
    /// Searches orders in `pmin..=pmax` and stores the winner in `rc`.
    /// Ties are broken toward the lowest order, so a deeper partitioning
    /// must strictly win to be selected. Returns the estimated number of
    /// bits for the residual, excluding the subframe header.
    pub fn find(
        &mut self,
        rc: &mut RiceContext,
        pmin: usize,
        pmax: usize,
        data: &[i32],
        pred_order: usize,
    ) -> u64 {
        let n = data.len();
        debug_assert!(pmin <= pmax && pmax <= MAX_PARTITION_ORDER);
        debug_assert!(n >> pmax >= pred_order);

        self.udata.clear();
        self.udata.extend(data.iter().map(|&v| encode_signbit(v)));
        self.calc_sums(pmin, pmax, n, pred_order);

        let mut opt_bits = u64::MAX;
        for porder in pmin..=pmax {
            let bits = self.calc_optimal_params(porder, n, pred_order);
            if bits < opt_bits {
                opt_bits = bits;
                self.tmp.porder = porder;
                std::mem::swap(rc, &mut self.tmp);
            }
        }
        opt_bits
    }

    /// Sums of sign-folded residuals for every partition of every order.
    ///
    /// The finest order is summed from the data; each coarser order is a
    /// pairwise fold of the level below it.
    fn calc_sums(&mut self, pmin: usize, pmax: usize, n: usize, pred_order: usize) {
        let parts = 1usize << pmax;
        let part_len = n >> pmax;
        let mut pos = pred_order;
        for i in 0..parts {
            let end = (i + 1) * part_len;
            let sum: u64 = self.udata[pos..end].iter().map(|&u| u64::from(u)).sum();
            self.sums[pmax * MAX_PARTITIONS + i] = sum;
            pos = end;
        }
        for level in (pmin..pmax).rev() {
            for j in 0..(1usize << level) {
                self.sums[level * MAX_PARTITIONS + j] = self.sums
                    [(level + 1) * MAX_PARTITIONS + 2 * j]
                    + self.sums[(level + 1) * MAX_PARTITIONS + 2 * j + 1];
            }
        }
    }

    fn calc_optimal_params(&mut self, porder: usize, n: usize, pred_order: usize) -> u64 {
        let parts = 1usize << porder;
        let sums = &self.sums[porder * MAX_PARTITIONS..porder * MAX_PARTITIONS + parts];
        let cnt = n >> porder;
        let (param, mut all_bits) = find_optimal_param(sums[0], (cnt - pred_order) as u64);
        self.tmp.params[0] = param;
        for i in 1..parts {
            let (param, nbits) = find_optimal_param(sums[i], cnt as u64);
            self.tmp.params[i] = param;
            all_bits += nbits;
        }
        all_bits + 4 * parts as u64
    }
}
