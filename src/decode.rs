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

//! Frame decoder used for self-verification.
//!
//! This is not a general player: it only accepts what the encoder can
//! emit, and it reports any structural surprise as a [`DecodeError`]
//! instead of trying to resynchronize.

use super::bitstream::FRAME_CRC;
use super::bitstream::HEADER_CRC;
use super::constant::qlpc::MAX_ORDER as MAX_LPC_ORDER;
use super::constant::CODED_BIT_DEPTHS;
use super::constant::CODED_BLOCKSIZES;
use super::constant::CODED_SAMPLE_RATES;
use super::constant::MAX_BLOCKSIZE;
use super::error::DecodeError;
use super::fixed;
use super::rice::decode_signbit;

/// MSB-first bit-level reader over a byte slice.
pub struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Current position in bits from the start of the slice.
    pub fn bit_pos(&self) -> usize {
        self.pos
    }

    fn err(&self, reason: &str) -> DecodeError {
        DecodeError::new(self.pos, reason)
    }

    /// Reads `nbits` bits (at most 32) as an unsigned value.
    pub fn read_bits(&mut self, nbits: u32) -> Result<u32, DecodeError> {
        debug_assert!(nbits <= 32);
        if self.pos + nbits as usize > self.data.len() * 8 {
            return Err(self.err("unexpected end of stream"));
        }
        let mut val = 0u64;
        let mut remaining = nbits;
        while remaining > 0 {
            let byte = self.data[self.pos / 8];
            let avail = 8 - (self.pos % 8) as u32;
            let take = avail.min(remaining);
            let chunk = (u64::from(byte) >> (avail - take)) & ((1u64 << take) - 1);
            val = (val << take) | chunk;
            self.pos += take as usize;
            remaining -= take;
        }
        Ok(val as u32)
    }

    /// Reads `nbits` bits as a two's-complement signed value.
    pub fn read_signed(&mut self, nbits: u32) -> Result<i32, DecodeError> {
        let v = self.read_bits(nbits)?;
        let shift = 32 - nbits;
        Ok(((v << shift) as i32) >> shift)
    }

    /// Reads a zero run terminated by a one bit.
    pub fn read_unary(&mut self) -> Result<u32, DecodeError> {
        let mut q = 0u32;
        loop {
            if self.pos >= self.data.len() * 8 {
                return Err(self.err("unterminated unary code"));
            }
            if self.read_bits(1)? == 1 {
                return Ok(q);
            }
            q += 1;
        }
    }

    /// Reads a frame counter in the UTF-8-like variable-length code.
    pub fn read_utf8(&mut self) -> Result<u64, DecodeError> {
        let head = self.read_bits(8)?;
        let nbytes = match head {
            0x00..=0x7F => return Ok(u64::from(head)),
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            0xF8..=0xFB => 5,
            0xFC..=0xFD => 6,
            0xFE => 7,
            _ => return Err(self.err("malformed frame counter")),
        };
        let head_bits = if nbytes == 7 { 0 } else { 7 - nbytes };
        let mut val = u64::from(head) & ((1u64 << head_bits) - 1);
        for _ in 1..nbytes {
            let b = self.read_bits(8)?;
            if b & 0xC0 != 0x80 {
                return Err(self.err("malformed frame counter"));
            }
            val = (val << 6) | u64::from(b & 0x3F);
        }
        Ok(val)
    }

    /// Skips to the next byte boundary; the skipped bits must be zero.
    pub fn align(&mut self) -> Result<(), DecodeError> {
        let rem = (8 - self.pos % 8) % 8;
        if rem > 0 && self.read_bits(rem as u32)? != 0 {
            return Err(DecodeError::new(self.pos - rem, "nonzero padding bits"));
        }
        Ok(())
    }
}

/// Stream-level parameters the frame header is checked against.
#[derive(Clone, Copy, Debug)]
pub struct StreamParams {
    pub channels: usize,
    pub bits_per_sample: u32,
    pub sample_rate: u32,
}

/// One decoded frame in planar layout.
#[derive(Clone, Debug)]
pub struct DecodedFrame {
    pub blocksize: usize,
    pub counter: u64,
    pub channels: Vec<Vec<i32>>,
    /// Number of bytes the frame occupied in the input.
    pub bytes: usize,
}

fn decode_residual(
    reader: &mut BitReader,
    blocksize: usize,
    order: usize,
    dest: &mut Vec<i32>,
) -> Result<(), DecodeError> {
    let method = reader.read_bits(2)?;
    if method != 0 {
        return Err(DecodeError::new(reader.bit_pos(), "unsupported residual method"));
    }
    let porder = reader.read_bits(4)? as usize;
    let part_len = blocksize >> porder;
    if part_len == 0 || part_len << porder != blocksize || part_len < order {
        return Err(DecodeError::new(reader.bit_pos(), "invalid partition order"));
    }
    for p in 0..(1usize << porder) {
        let k = reader.read_bits(4)?;
        if k == 15 {
            return Err(DecodeError::new(reader.bit_pos(), "unsupported escape code"));
        }
        let count = if p == 0 { part_len - order } else { part_len };
        for _ in 0..count {
            let q = reader.read_unary()?;
            let r = reader.read_bits(k)?;
            dest.push(decode_signbit((q << k) | r));
        }
    }
    Ok(())
}

fn decode_subframe(
    reader: &mut BitReader,
    blocksize: usize,
    bps: u32,
) -> Result<Vec<i32>, DecodeError> {
    if reader.read_bits(1)? != 0 {
        return Err(DecodeError::new(reader.bit_pos(), "bad subframe padding bit"));
    }
    let type_code = reader.read_bits(6)?;
    let wbits = if reader.read_bits(1)? == 1 {
        reader.read_unary()? + 1
    } else {
        0
    };
    if wbits >= bps {
        return Err(DecodeError::new(reader.bit_pos(), "wasted bits exceed sample width"));
    }
    let obits = bps - wbits;

    let mut samples = Vec::with_capacity(blocksize);
    match type_code {
        0 => {
            let v = reader.read_signed(obits)?;
            samples.resize(blocksize, v);
        }
        1 => {
            for _ in 0..blocksize {
                samples.push(reader.read_signed(obits)?);
            }
        }
        0b00_1000..=0b00_1100 => {
            let order = (type_code & 0x7) as usize;
            for _ in 0..order {
                samples.push(reader.read_signed(obits)?);
            }
            decode_residual(reader, blocksize, order, &mut samples)?;
            fixed::restore_signal(order, &mut samples);
        }
        0b10_0000..=0b11_1111 => {
            let order = (type_code as usize & 0x1F) + 1;
            debug_assert!(order <= MAX_LPC_ORDER);
            for _ in 0..order {
                samples.push(reader.read_signed(obits)?);
            }
            let cbits = reader.read_bits(4)? + 1;
            if cbits > 15 {
                return Err(DecodeError::new(reader.bit_pos(), "invalid coefficient precision"));
            }
            let shift = reader.read_signed(5)?;
            if shift < 0 {
                return Err(DecodeError::new(reader.bit_pos(), "negative prediction shift"));
            }
            let mut coefs = [0i32; MAX_LPC_ORDER];
            for c in coefs.iter_mut().take(order) {
                *c = reader.read_signed(cbits)?;
            }
            decode_residual(reader, blocksize, order, &mut samples)?;
            for i in order..blocksize {
                let mut pred = 0i64;
                for (j, &c) in coefs[..order].iter().enumerate() {
                    pred += i64::from(c) * i64::from(samples[i - 1 - j]);
                }
                samples[i] += (pred >> shift) as i32;
            }
        }
        _ => {
            return Err(DecodeError::new(reader.bit_pos(), "reserved subframe type"));
        }
    }

    if wbits > 0 {
        for s in &mut samples {
            *s <<= wbits;
        }
    }
    Ok(samples)
}

/// Decodes one frame starting at the beginning of `data`.
pub fn decode_frame(data: &[u8], stream: &StreamParams) -> Result<DecodedFrame, DecodeError> {
    let mut reader = BitReader::new(data);

    if reader.read_bits(15)? != 0x7FFC {
        return Err(DecodeError::new(0, "missing frame sync code"));
    }
    let _variable = reader.read_bits(1)?;
    let bs_code = reader.read_bits(4)? as usize;
    let sr_code = reader.read_bits(4)? as usize;
    let ch_code = reader.read_bits(4)?;
    let bps_code = reader.read_bits(3)? as usize;
    if reader.read_bits(1)? != 0 {
        return Err(DecodeError::new(reader.bit_pos(), "reserved header bit set"));
    }
    let counter = reader.read_utf8()?;

    let blocksize = match bs_code {
        1 => 192,
        2..=5 => 576 << (bs_code - 2),
        6 => reader.read_bits(8)? as usize + 1,
        7 => reader.read_bits(16)? as usize + 1,
        8..=15 => 256 << (bs_code - 8),
        _ => return Err(DecodeError::new(reader.bit_pos(), "reserved block size code")),
    };
    if blocksize > MAX_BLOCKSIZE || !CODED_BLOCKSIZES.contains(&blocksize) && bs_code < 6 {
        return Err(DecodeError::new(reader.bit_pos(), "block size out of range"));
    }
    let sample_rate = match sr_code {
        // Code 0 defers to the stream metadata.
        0 => stream.sample_rate,
        4..=11 => CODED_SAMPLE_RATES[sr_code - 4],
        12 => reader.read_bits(8)? * 1000,
        13 => reader.read_bits(16)?,
        14 => reader.read_bits(16)? * 10,
        _ => return Err(DecodeError::new(reader.bit_pos(), "unsupported sample rate code")),
    };
    if sample_rate != stream.sample_rate {
        return Err(DecodeError::new(reader.bit_pos(), "sample rate mismatch"));
    }
    let bps = match CODED_BIT_DEPTHS.get(bps_code.wrapping_sub(1)) {
        Some(&b) if b != 0 => b,
        _ => return Err(DecodeError::new(reader.bit_pos(), "unsupported bit depth code")),
    };
    if bps != stream.bits_per_sample {
        return Err(DecodeError::new(reader.bit_pos(), "bit depth mismatch"));
    }

    let channels = match ch_code {
        0..=7 => ch_code as usize + 1,
        8..=10 => 2,
        _ => return Err(DecodeError::new(reader.bit_pos(), "reserved channel code")),
    };
    if channels != stream.channels {
        return Err(DecodeError::new(reader.bit_pos(), "channel count mismatch"));
    }

    let header_bytes = reader.bit_pos() / 8;
    let crc = reader.read_bits(8)? as u8;
    if crc != HEADER_CRC.checksum(&data[..header_bytes]) {
        return Err(DecodeError::new(reader.bit_pos(), "frame header checksum mismatch"));
    }

    let mut decoded = Vec::with_capacity(channels);
    for ch in 0..channels {
        // The side channel of a stereo decorrelation mode carries one
        // extra bit.
        let extra = u32::from(match ch_code {
            8 | 10 => ch == 1,
            9 => ch == 0,
            _ => false,
        });
        decoded.push(decode_subframe(&mut reader, blocksize, bps + extra)?);
    }

    reader.align()?;
    let body_bytes = reader.bit_pos() / 8;
    let crc = reader.read_bits(16)? as u16;
    if crc != FRAME_CRC.checksum(&data[..body_bytes]) {
        return Err(DecodeError::new(reader.bit_pos(), "frame checksum mismatch"));
    }

    // Undo stereo decorrelation in place.
    if (8..=10).contains(&ch_code) {
        let (head, tail) = decoded.split_at_mut(1);
        let (c0, c1) = (&mut head[0], &mut tail[0]);
        match ch_code {
            // left + side
            8 => {
                for i in 0..blocksize {
                    c1[i] = c0[i] - c1[i];
                }
            }
            // side + right
            9 => {
                for i in 0..blocksize {
                    c0[i] += c1[i];
                }
            }
            // mid + side
            _ => {
                for i in 0..blocksize {
                    let side = c1[i];
                    let m = (c0[i] << 1) | (side & 1);
                    c0[i] = (m + side) >> 1;
                    c1[i] = (m - side) >> 1;
                }
            }
        }
    }

    Ok(DecodedFrame {
        blocksize,
        counter,
        channels: decoded,
        bytes: reader.bit_pos() / 8,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitreader_round_trip() {
        use crate::bitwriter::BitWriter;
        let mut bw = BitWriter::new();
        bw.write_bits(15, 0x7FFC);
        bw.write_bits(1, 1);
        bw.write_signed(14, -75);
        bw.write_unary(9);
        bw.write_utf8(123_456);
        bw.flush();

        let mut reader = BitReader::new(bw.as_slice());
        assert_eq!(reader.read_bits(15).unwrap(), 0x7FFC);
        assert_eq!(reader.read_bits(1).unwrap(), 1);
        assert_eq!(reader.read_signed(14).unwrap(), -75);
        assert_eq!(reader.read_unary().unwrap(), 9);
        assert_eq!(reader.read_utf8().unwrap(), 123_456);
    }

    #[test]
    fn reader_reports_truncation() {
        let data = [0xFFu8, 0xF8];
        let mut reader = BitReader::new(&data);
        assert!(reader.read_bits(16).is_ok());
        let err = reader.read_bits(1).unwrap_err();
        assert_eq!(err.bit_offset(), 16);
    }

    #[test]
    fn escape_coded_partitions_are_rejected() {
        // method 0, partition order 0, then the reserved parameter 0b1111.
        let data = [0b0000_0011u8, 0b1100_0000];
        let mut reader = BitReader::new(&data);
        let mut dest = Vec::new();
        let err = decode_residual(&mut reader, 4, 0, &mut dest).unwrap_err();
        assert!(format!("{err}").contains("escape"));
    }

    #[test]
    fn garbage_is_rejected_at_sync() {
        let stream = StreamParams {
            channels: 1,
            bits_per_sample: 16,
            sample_rate: 44100,
        };
        let err = decode_frame(&[0u8; 16], &stream).unwrap_err();
        assert_eq!(err.bit_offset(), 0);
    }
}
