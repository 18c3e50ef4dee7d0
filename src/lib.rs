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

#![doc = include_str!("../README.md")]
#![warn(clippy::all, clippy::nursery, clippy::pedantic, clippy::cargo)]
// Some of clippy::pedantic rules are actually useful, so use it with a lot of
// ad-hoc exceptions.
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss,
    clippy::missing_const_for_fn,
    clippy::multiple_crate_versions,
    clippy::must_use_candidate
)]
// Some from restriction lint-group
#![warn(
    clippy::clone_on_ref_ptr,
    clippy::create_dir,
    clippy::dbg_macro,
    clippy::empty_structs_with_brackets,
    clippy::exit,
    clippy::if_then_some_else_none,
    clippy::let_underscore_must_use,
    clippy::lossy_float_literal,
    clippy::print_stdout,
    clippy::rc_buffer,
    clippy::rc_mutex,
    clippy::rest_pat_in_fully_bound_structs,
    clippy::separated_literal_suffix,
    clippy::str_to_string,
    clippy::string_add,
    clippy::string_to_string,
    clippy::try_err,
    clippy::unnecessary_self_imports
)]

pub(crate) mod bitstream;
pub mod bitwriter;
pub mod config;
pub mod constant;
pub mod decode;
pub mod encoder;
pub mod error;
pub(crate) mod fixed;
pub(crate) mod frame;
pub(crate) mod lpc;
pub mod offload;
pub(crate) mod rice;
pub(crate) mod search;
pub(crate) mod window;

#[cfg(any(test, doctest, feature = "test_helper"))]
pub mod test_helper;

pub use config::EncoderConfig;
pub use config::OrderMethod;
pub use config::PredictionType;
pub use config::StereoMethod;
pub use config::WindowFunctions;
pub use encoder::encode_to_vec;
pub use encoder::PipeSink;
pub use encoder::SeekableSink;
pub use encoder::Sink;
pub use encoder::StreamEncoder;
pub use error::EncodeError;

#[cfg(test)]
mod test {
    // end-to-end tests over the public surface.
    use super::*;
    use crate::decode::StreamParams;
    use crate::encoder::decode_all;
    use md5::Digest;
    use rstest::rstest;

    fn roundtrip(config: EncoderConfig, channels: usize, signal: &[i32]) -> Vec<u8> {
        let encoded = encode_to_vec(config, 44100, channels, 16, signal).expect("encoding failed");
        let stream = StreamParams {
            channels,
            bits_per_sample: 16,
            sample_rate: 44100,
        };
        let decoded = decode_all(&encoded[..], &stream).expect("decoding failed");
        assert_eq!(decoded, signal);
        encoded
    }

    #[rstest]
    fn e2e_with_generated_sinusoids(
        #[values(1, 2, 3)] channels: usize,
        #[values(0, 2, 5, 7, 8, 11)] level: usize,
    ) {
        let signal_len = 16123;
        let signal = test_helper::stereo_test_signal(signal_len, channels);
        let config = EncoderConfig::from_level(level).expect("valid level");
        let encoded = roundtrip(config, channels, &signal);
        // 16-bit input must compress at least a little.
        assert!(encoded.len() < signal.len() * 2);
    }

    #[test]
    fn e2e_with_verification_enabled() {
        let signal = test_helper::stereo_test_signal(10000, 2);
        let mut config = EncoderConfig::default();
        config.set_do_verify(true);
        roundtrip(config, 2, &signal);
    }

    #[test]
    fn e2e_with_coprocessor_backend() {
        let signal = test_helper::stereo_test_signal(20000, 2);
        let mut config = EncoderConfig::default();
        config.set_use_coprocessor(true);
        config.set_do_verify(true);
        roundtrip(config, 2, &signal);
    }

    #[rstest]
    fn e2e_with_uncoded_sample_rates(#[values(88_200, 176_400, 192_000)] sample_rate: u32) {
        let signal = test_helper::stereo_test_signal(12000, 2);
        let encoded = encode_to_vec(EncoderConfig::default(), sample_rate, 2, 16, &signal)
            .expect("encoding failed");
        let stream = StreamParams {
            channels: 2,
            bits_per_sample: 16,
            sample_rate,
        };
        let decoded = decode_all(&encoded[..], &stream).expect("decoding failed");
        assert_eq!(decoded, signal);
    }

    #[test]
    fn silence_compresses_to_constant_frames() {
        let signal = vec![0i32; 4096 * 4];
        let encoded = roundtrip(EncoderConfig::default(), 2, &signal);
        // Metadata dominates; the frames themselves are tiny.
        let config = EncoderConfig::default();
        assert!(encoded.len() < config.padding_size() + 1024);
    }

    #[test]
    fn variable_block_size_frames_carry_sample_numbers() {
        let signal = test_helper::stereo_test_signal(10000, 2);
        let config = EncoderConfig::from_level(11).expect("valid level");
        assert!(config.variable_block_size() > 0);
        let block = config.select_block_size(44100);
        let encoded =
            encode_to_vec(config, 44100, 2, 16, &signal).expect("encoding failed");

        // Skip the metadata blocks.
        let mut pos = 4;
        loop {
            let last = encoded[pos] & 0x80 != 0;
            let len = (usize::from(encoded[pos + 1]) << 16)
                | (usize::from(encoded[pos + 2]) << 8)
                | usize::from(encoded[pos + 3]);
            pos += 4 + len;
            if last {
                break;
            }
        }

        let stream = StreamParams {
            channels: 2,
            bits_per_sample: 16,
            sample_rate: 44100,
        };
        let mut counters = Vec::new();
        while pos < encoded.len() {
            let frame = decode::decode_frame(&encoded[pos..], &stream).expect("decoding failed");
            counters.push(frame.counter);
            pos += frame.bytes;
        }
        // Counters address the first sample of each frame, not its index.
        assert_eq!(counters[0], 0);
        assert_eq!(counters[1], block as u64);
        assert_eq!(counters[2], 2 * block as u64);
    }

    #[test]
    fn md5_digest_is_stored() {
        let signal = test_helper::stereo_test_signal(5000, 2);
        let encoded = encode_to_vec(EncoderConfig::default(), 44100, 2, 16, &signal)
            .expect("encoding failed");

        let mut hasher = md5::Md5::new();
        let bytes: Vec<u8> = signal
            .iter()
            .flat_map(|&s| [(s & 0xFF) as u8, (s >> 8) as u8])
            .collect();
        hasher.update(&bytes);
        let digest: [u8; 16] = hasher.finalize().into();
        assert_eq!(&encoded[26..42], &digest);
    }

    #[test]
    fn sample_count_mismatch_is_reported() {
        let signal = test_helper::stereo_test_signal(1000, 2);
        let sink = SeekableSink::new(std::io::Cursor::new(Vec::new()));
        let mut encoder = StreamEncoder::new(sink, EncoderConfig::default(), 44100, 2, 16, 999)
            .expect("stream parameters rejected");
        encoder.write_interleaved(&signal).expect("write failed");
        assert!(matches!(
            encoder.finish(),
            Err(EncodeError::SampleCountMismatch {
                expected: 999,
                actual: 1000
            })
        ));
    }

    #[test]
    fn pipe_sink_leaves_digest_zeroed() {
        let signal = test_helper::stereo_test_signal(3000, 2);
        let mut out = Vec::new();
        {
            let sink = PipeSink::new(&mut out);
            let mut encoder =
                StreamEncoder::new(sink, EncoderConfig::default(), 44100, 2, 16, 3000)
                    .expect("stream parameters rejected");
            encoder.write_interleaved(&signal).expect("write failed");
            encoder.finish().expect("finish failed");
        }
        assert_eq!(&out[26..42], &[0u8; 16]);
        let stream = StreamParams {
            channels: 2,
            bits_per_sample: 16,
            sample_rate: 44100,
        };
        let decoded = decode_all(&out[..], &stream).expect("decoding failed");
        assert_eq!(decoded, signal);
    }

    #[test]
    fn e2e_through_a_real_file() {
        use std::io::Read;
        use std::io::Seek;

        let signal = test_helper::stereo_test_signal(12345, 2);
        let mut file = tempfile::tempfile().expect("temp file creation failed");
        {
            let sink = SeekableSink::new(&mut file);
            let mut encoder =
                StreamEncoder::new(sink, EncoderConfig::default(), 44100, 2, 16, 12345)
                    .expect("stream parameters rejected");
            encoder.write_interleaved(&signal).expect("write failed");
            encoder.finish().expect("finish failed");
        }
        file.rewind().expect("rewind failed");
        let mut encoded = Vec::new();
        file.read_to_end(&mut encoded).expect("read failed");
        let stream = StreamParams {
            channels: 2,
            bits_per_sample: 16,
            sample_rate: 44100,
        };
        let decoded = decode_all(&encoded[..], &stream).expect("decoding failed");
        assert_eq!(decoded, signal);
    }

    #[test]
    fn invalid_stream_parameters_are_rejected() {
        let sink = SeekableSink::new(std::io::Cursor::new(Vec::new()));
        assert!(matches!(
            StreamEncoder::new(sink, EncoderConfig::default(), 0, 2, 16, 0),
            Err(EncodeError::Range(_))
        ));
        // Above what a frame header can express even in tens of Hz.
        let sink = SeekableSink::new(std::io::Cursor::new(Vec::new()));
        assert!(matches!(
            StreamEncoder::new(sink, EncoderConfig::default(), 655_360, 2, 16, 0),
            Err(EncodeError::Range(_))
        ));
        let sink = SeekableSink::new(std::io::Cursor::new(Vec::new()));
        assert!(matches!(
            StreamEncoder::new(sink, EncoderConfig::default(), 44100, 2, 17, 0),
            Err(EncodeError::Range(_))
        ));
        let sink = SeekableSink::new(std::io::Cursor::new(Vec::new()));
        assert!(matches!(
            StreamEncoder::new(sink, EncoderConfig::default(), 44100, 0, 16, 0),
            Err(EncodeError::Range(_))
        ));
    }

    #[test]
    fn stream_starts_with_marker_and_streaminfo() {
        let signal = test_helper::stereo_test_signal(2000, 2);
        let encoded = encode_to_vec(EncoderConfig::default(), 44100, 2, 16, &signal)
            .expect("encoding failed");
        assert_eq!(&encoded[..4], b"fLaC");
        // STREAMINFO block type 0, length 34.
        assert_eq!(encoded[4] & 0x7F, 0);
        assert_eq!(
            (usize::from(encoded[5]) << 16) | (usize::from(encoded[6]) << 8) | usize::from(encoded[7]),
            34
        );
        // Declared sample count sits in the lower bits of bytes 21..26.
        let total = (u64::from(encoded[21] & 0x0F) << 32)
            | (u64::from(encoded[22]) << 24)
            | (u64::from(encoded[23]) << 16)
            | (u64::from(encoded[24]) << 8)
            | u64::from(encoded[25]);
        assert_eq!(total, 2000);
    }
}
