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

//! Frame serialization to the interchange bitstream.

use super::bitwriter::BitWriter;
use super::constant::CODED_BLOCKSIZES;
use super::constant::CODED_BIT_DEPTHS;
use super::constant::CODED_SAMPLE_RATES;
use super::frame::ChannelMode;
use super::frame::FrameState;
use super::frame::SubframeCandidate;
use super::frame::SubframeType;

const CRC_8_FLAC: crc::Algorithm<u8> = crc::CRC_8_SMBUS;
const CRC_16_FLAC: crc::Algorithm<u16> = crc::CRC_16_UMTS;

pub static HEADER_CRC: crc::Crc<u8, crc::Table<16>> =
    crc::Crc::<u8, crc::Table<16>>::new(&CRC_8_FLAC);
pub static FRAME_CRC: crc::Crc<u16, crc::Table<16>> =
    crc::Crc::<u16, crc::Table<16>>::new(&CRC_16_FLAC);

/// Stream-level parameters needed to serialize one frame.
#[derive(Clone, Copy, Debug)]
pub(crate) struct FrameHeader {
    pub blocksize: usize,
    pub sample_rate: u32,
    pub bits_per_sample: u32,
    /// Number of output channels of the stream.
    pub channels: usize,
    /// Frame number, or the number of the first sample for variable
    /// block size streams.
    pub counter: u64,
    pub variable_block_size: bool,
}

/// Returns the 4-bit block size code and the explicit field, if any.
fn block_size_code(blocksize: usize) -> (u32, Option<(u32, u32)>) {
    for (i, &bs) in CODED_BLOCKSIZES.iter().enumerate() {
        if bs == blocksize {
            let code = if i < 5 { i + 1 } else { i + 3 } as u32;
            return (code, None);
        }
    }
    let bs = blocksize as u32 - 1;
    if bs < 256 {
        (6, Some((8, bs)))
    } else {
        (7, Some((16, bs)))
    }
}

/// Returns the 4-bit sample rate code and the explicit field, if any.
///
/// Rates outside the coded table use the escape codes: 12 carries the
/// rate in kHz as 8 bits, 13 the rate in Hz as 16 bits, and 14 the rate
/// in tens of Hz as 16 bits.
fn sample_rate_code(rate: u32) -> (u32, Option<(u32, u32)>) {
    for (i, &r) in CODED_SAMPLE_RATES.iter().enumerate() {
        if r == rate {
            return (i as u32 + 4, None);
        }
    }
    if rate % 1000 == 0 && rate / 1000 < 256 {
        (12, Some((8, rate / 1000)))
    } else if rate < 65536 {
        (13, Some((16, rate)))
    } else if rate % 10 == 0 && rate / 10 < 65536 {
        (14, Some((16, rate / 10)))
    } else {
        // Only representable in the stream metadata.
        (0, None)
    }
}

fn bit_depth_code(bps: u32) -> u32 {
    for (i, &b) in CODED_BIT_DEPTHS.iter().enumerate() {
        if b == bps {
            return i as u32 + 1;
        }
    }
    0
}

fn write_header(bw: &mut BitWriter, frame: &FrameState, head: &FrameHeader) {
    let start = bw.len();
    bw.write_bits(15, 0x7FFC);
    bw.write_bits(1, u32::from(head.variable_block_size));

    let (bs_code, bs_field) = block_size_code(head.blocksize);
    bw.write_bits(4, bs_code);
    let (sr_code, sr_field) = sample_rate_code(head.sample_rate);
    bw.write_bits(4, sr_code);

    let ch_code = match frame.ch_mode {
        ChannelMode::NotStereo => head.channels as u32 - 1,
        mode => mode as u32,
    };
    bw.write_bits(4, ch_code);
    bw.write_bits(3, bit_depth_code(head.bits_per_sample));
    bw.write_bits(1, 0);

    bw.write_utf8(head.counter);
    if let Some((nbits, val)) = bs_field {
        bw.write_bits(nbits, val);
    }
    if let Some((nbits, val)) = sr_field {
        bw.write_bits(nbits, val);
    }

    let crc = HEADER_CRC.checksum(&bw.as_slice()[start..]);
    bw.write_bits(8, u32::from(crc));
}

fn write_residual(bw: &mut BitWriter, sub: &SubframeCandidate, blocksize: usize) {
    // Partitioned Rice, method 0 (4-bit parameters).
    bw.write_bits(2, 0);
    let porder = sub.rc.porder;
    bw.write_bits(4, porder as u32);
    let part_len = blocksize >> porder;
    let mut pos = sub.order;
    for p in 0..(1usize << porder) {
        let end = (p + 1) * part_len;
        let k = sub.rc.params[p];
        bw.write_bits(4, u32::from(k));
        bw.write_rice_signed(k, &sub.residual[pos..end]);
        pos = end;
    }
}

fn write_subframe(bw: &mut BitWriter, st_samples: &[i32], sub: &SubframeCandidate, obits: u32, wbits: u32, blocksize: usize) {
    bw.write_bits(1, 0);
    let type_code = match sub.kind {
        SubframeType::Constant => 0,
        SubframeType::Verbatim => 1,
        SubframeType::Fixed => 0b00_1000 | sub.order as u32,
        SubframeType::Lpc => 0b10_0000 | (sub.order as u32 - 1),
    };
    bw.write_bits(6, type_code);
    if wbits > 0 {
        bw.write_bits(1, 1);
        bw.write_unary(wbits - 1);
    } else {
        bw.write_bits(1, 0);
    }

    match sub.kind {
        SubframeType::Constant => {
            bw.write_signed(obits, sub.residual[0]);
        }
        SubframeType::Verbatim => {
            for &s in &st_samples[..blocksize] {
                bw.write_signed(obits, s);
            }
        }
        SubframeType::Fixed => {
            for &s in &sub.residual[..sub.order] {
                bw.write_signed(obits, s);
            }
            write_residual(bw, sub, blocksize);
        }
        SubframeType::Lpc => {
            for &s in &sub.residual[..sub.order] {
                bw.write_signed(obits, s);
            }
            bw.write_bits(4, sub.cbits - 1);
            bw.write_bits(5, sub.shift as u32);
            for &c in &sub.coefs[..sub.order] {
                bw.write_signed(sub.cbits, c);
            }
            write_residual(bw, sub, blocksize);
        }
    }
}

/// Serializes one frame into `bw`.
///
/// `bw` must contain exactly this frame when the footer checksum is
/// computed, so the caller clears it beforehand.
pub(crate) fn write_frame(bw: &mut BitWriter, frame: &FrameState, head: &FrameHeader) {
    debug_assert!(bw.is_empty());
    write_header(bw, frame, head);

    let channels = match frame.ch_mode {
        ChannelMode::NotStereo => head.channels,
        _ => 2,
    };
    for ch in 0..channels {
        let st = &frame.subframes[ch];
        write_subframe(bw, &st.samples, &st.best, st.obits, st.wbits, head.blocksize);
    }

    bw.flush();
    let crc = FRAME_CRC.checksum(bw.as_slice());
    bw.write_bits(16, u32::from(crc));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constant_frame(value: i32, blocksize: usize) -> (FrameState, FrameHeader) {
        let mut frame = FrameState::new(1);
        frame.blocksize = blocksize;
        frame.subframes[0].load(&vec![value; blocksize], 16);
        let st = &mut frame.subframes[0];
        st.best.kind = SubframeType::Constant;
        st.best.residual[0] = st.samples[0];
        st.best.size = st.obits;
        let head = FrameHeader {
            blocksize,
            sample_rate: 44100,
            bits_per_sample: 16,
            channels: 1,
            counter: 0,
            variable_block_size: false,
        };
        (frame, head)
    }

    #[test]
    fn header_layout_for_coded_parameters() {
        let (frame, head) = constant_frame(0, 192);
        let mut bw = BitWriter::new();
        write_frame(&mut bw, &frame, &head);
        let bytes = bw.as_slice();
        // sync(15) + fixed-size(1), bs code 1, sr code 9, mono, 16 bit.
        assert_eq!(&bytes[..5], &[0xFF, 0xF8, 0x19, 0x08, 0x00]);
        assert_eq!(bytes[5], HEADER_CRC.checksum(&bytes[..5]));
    }

    #[test]
    fn uncommon_block_size_gets_explicit_field() {
        let (frame, mut head) = constant_frame(0, 192);
        head.blocksize = 100;
        let mut frame = frame;
        frame.blocksize = 100;
        let mut bw = BitWriter::new();
        write_frame(&mut bw, &frame, &head);
        let bytes = bw.as_slice();
        // Code 6 selects an 8-bit (size - 1) field after the counter.
        assert_eq!(bytes[2] >> 4, 6);
        assert_eq!(bytes[5], 99);

        head.blocksize = 1000;
        frame.blocksize = 1000;
        let mut bw = BitWriter::new();
        write_frame(&mut bw, &frame, &head);
        let bytes = bw.as_slice();
        assert_eq!(bytes[2] >> 4, 7);
        assert_eq!(u32::from(bytes[5]) << 8 | u32::from(bytes[6]), 999);
    }

    #[test]
    fn uncommon_sample_rate_gets_explicit_field() {
        let (frame, mut head) = constant_frame(0, 192);
        head.sample_rate = 192_000;
        let mut bw = BitWriter::new();
        write_frame(&mut bw, &frame, &head);
        let bytes = bw.as_slice();
        // Code 12 selects an 8-bit rate-in-kHz field after the counter.
        assert_eq!(bytes[2] & 0x0F, 12);
        assert_eq!(bytes[5], 192);

        head.sample_rate = 88_200;
        let mut bw = BitWriter::new();
        write_frame(&mut bw, &frame, &head);
        let bytes = bw.as_slice();
        // Code 14 selects a 16-bit rate-in-tens-of-Hz field.
        assert_eq!(bytes[2] & 0x0F, 14);
        assert_eq!((u32::from(bytes[5]) << 8) | u32::from(bytes[6]), 8820);

        head.sample_rate = 44_101;
        let mut bw = BitWriter::new();
        write_frame(&mut bw, &frame, &head);
        let bytes = bw.as_slice();
        // Code 13 selects a 16-bit rate-in-Hz field.
        assert_eq!(bytes[2] & 0x0F, 13);
        assert_eq!((u32::from(bytes[5]) << 8) | u32::from(bytes[6]), 44_101);
    }

    #[test]
    fn constant_subframe_body() {
        let (frame, head) = constant_frame(-300, 4096);
        let mut bw = BitWriter::new();
        write_frame(&mut bw, &frame, &head);
        let bytes = bw.as_slice();
        // -300 has two wasted bits: the subframe stores -75 in 14 bits.
        // Header is 6 bytes; subframe starts with pad(1) + type(6) +
        // wasted flag(1) = 0b0_000000_1, then unary "01", then the value.
        assert_eq!(bytes[6], 0b0000_0001);
        // "01" + 14-bit two's complement of -75: exactly two bytes.
        let body = (u32::from(bytes[7]) << 8) | u32::from(bytes[8]);
        let expected = (0b01u32 << 14) | ((-75i32 as u32) & 0x3FFF);
        assert_eq!(body, expected);
        // Footer checksum covers everything before it.
        let n = bytes.len();
        let crc = FRAME_CRC.checksum(&bytes[..n - 2]);
        assert_eq!(crc, u16::from(bytes[n - 2]) << 8 | u16::from(bytes[n - 1]));
    }

    #[test]
    fn frame_is_byte_aligned_before_footer() {
        let (frame, head) = constant_frame(1, 576);
        let mut bw = BitWriter::new();
        write_frame(&mut bw, &frame, &head);
        assert_eq!(bw.bit_len() % 8, 0);
    }
}
