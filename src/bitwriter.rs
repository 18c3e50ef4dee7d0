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

//! MSB-first bit-level output buffer.

use super::rice::encode_signbit;

/// Accumulates bits MSB-first into a reusable byte buffer.
///
/// Whole bytes are moved into the buffer eagerly, so [`as_slice`] is valid
/// for checksumming at any byte-aligned point without an explicit flush.
///
/// [`as_slice`]: BitWriter::as_slice
#[derive(Clone, Debug, Default)]
pub struct BitWriter {
    buf: Vec<u8>,
    acc: u64,
    nbits: u32,
}

impl BitWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(bytes: usize) -> Self {
        Self {
            buf: Vec::with_capacity(bytes),
            acc: 0,
            nbits: 0,
        }
    }

    /// Discards all content, keeping the allocation.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.acc = 0;
        self.nbits = 0;
    }

    /// Writes the lowest `nbits` bits of `val`.
    #[inline]
    pub fn write_bits(&mut self, nbits: u32, val: u32) {
        debug_assert!(nbits <= 32);
        if nbits == 0 {
            return;
        }
        let mask = if nbits == 32 {
            u64::from(u32::MAX)
        } else {
            (1u64 << nbits) - 1
        };
        self.acc = (self.acc << nbits) | (u64::from(val) & mask);
        self.nbits += nbits;
        while self.nbits >= 8 {
            self.nbits -= 8;
            self.buf.push((self.acc >> self.nbits) as u8);
        }
    }

    /// Writes the lowest `nbits` bits of a 64-bit value.
    pub fn write_bits64(&mut self, nbits: u32, val: u64) {
        debug_assert!(nbits <= 64);
        if nbits > 32 {
            self.write_bits(nbits - 32, (val >> 32) as u32);
            self.write_bits(32, val as u32);
        } else {
            self.write_bits(nbits, val as u32);
        }
    }

    /// Writes a two's-complement signed value in `nbits` bits.
    #[inline]
    pub fn write_signed(&mut self, nbits: u32, val: i32) {
        self.write_bits(nbits, val as u32);
    }

    /// Writes `q` zero bits followed by a one bit.
    pub fn write_unary(&mut self, mut q: u32) {
        while q >= 32 {
            self.write_bits(32, 0);
            q -= 32;
        }
        self.write_bits(q + 1, 1);
    }

    /// Rice-codes a run of signed residuals with parameter `k`.
    pub fn write_rice_signed(&mut self, k: u8, vals: &[i32]) {
        let k = u32::from(k);
        for &v in vals {
            let u = encode_signbit(v);
            self.write_unary(u >> k);
            self.write_bits(k, u);
        }
    }

    /// Writes a frame counter in the UTF-8-like variable-length code.
    ///
    /// Values up to 36 bits are supported, occupying 1 to 7 bytes.
    pub fn write_utf8(&mut self, val: u64) {
        debug_assert!(val < (1u64 << 36));
        if val < 0x80 {
            self.write_bits(8, val as u32);
            return;
        }
        let mut n = 2u32;
        while n < 7 && val >= (1u64 << (5 * n + 1)) {
            n += 1;
        }
        if n == 7 {
            self.write_bits(8, 0xFE);
        } else {
            let head = (0xFFu32 << (8 - n)) & 0xFF;
            self.write_bits(8, head | (val >> (6 * (n - 1))) as u32);
        }
        for i in (0..n - 1).rev() {
            self.write_bits(8, 0x80 | ((val >> (6 * i)) as u32 & 0x3F));
        }
    }

    /// Pads the pending bits with zeros up to the next byte boundary.
    pub fn flush(&mut self) {
        if self.nbits > 0 {
            self.buf.push((self.acc << (8 - self.nbits)) as u8);
            self.nbits = 0;
        }
    }

    /// Number of completed bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty() && self.nbits == 0
    }

    /// Total number of bits written so far.
    pub fn bit_len(&self) -> usize {
        self.buf.len() * 8 + self.nbits as usize
    }

    /// Completed bytes. Pending sub-byte bits are not included.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }
}
