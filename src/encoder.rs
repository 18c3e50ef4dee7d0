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

//! Stream-level encoding: metadata blocks, buffering and frame output.

use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;

use md5::Digest;
use md5::Md5;

use super::bitstream;
use super::bitstream::FrameHeader;
use super::bitwriter::BitWriter;
use super::config::EncoderConfig;
use super::config::StereoMethod;
use super::constant::CODED_BIT_DEPTHS;
use super::constant::MAX_SAMPLE_RATE;
use super::constant::MIN_BLOCKSIZE;
use super::decode;
use super::decode::StreamParams;
use super::error::EncodeError;
use super::error::RangeError;
use super::error::VerifyError;
use super::frame::channel_decorrelation;
use super::frame::ChannelMode;
use super::frame::FrameState;
use super::offload;
use super::offload::HostCoprocessor;
use super::search;
use super::window::WindowBank;

/// Vendor string stored in the metadata of every stream.
pub const VENDOR_STRING: &str = concat!("flakenc ", env!("CARGO_PKG_VERSION"));

/// Byte offset of the MD5 digest within the stream.
const MD5_OFFSET: u64 = 26;
/// Byte offset of the STREAMINFO payload within the stream.
const STREAMINFO_OFFSET: u64 = 8;
/// Interval between seek points, in seconds.
const SEEKPOINT_INTERVAL: u64 = 10;

/// Output abstraction of the encoder.
///
/// Seekability decides whether the MD5 digest and seek table can be
/// patched when the stream is finished.
pub trait Sink {
    /// Writes all bytes to the output.
    ///
    /// # Errors
    ///
    /// Returns any error of the underlying writer.
    fn write_all(&mut self, data: &[u8]) -> std::io::Result<()>;

    /// Returns `true` if [`seek_to`] is supported.
    ///
    /// [`seek_to`]: Sink::seek_to
    fn is_seekable(&self) -> bool;

    /// Moves the write position to `offset` bytes from the start.
    ///
    /// # Errors
    ///
    /// Returns an error when the sink cannot seek.
    fn seek_to(&mut self, offset: u64) -> std::io::Result<()>;

    /// Flushes buffered bytes to the output.
    ///
    /// # Errors
    ///
    /// Returns any error of the underlying writer.
    fn flush(&mut self) -> std::io::Result<()>;
}

/// [`Sink`] over a seekable writer, typically a file.
pub struct SeekableSink<W: Write + Seek> {
    inner: W,
}

impl<W: Write + Seek> SeekableSink<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Unwraps the inner writer.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write + Seek> Sink for SeekableSink<W> {
    fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.inner.write_all(data)
    }

    fn is_seekable(&self) -> bool {
        true
    }

    fn seek_to(&mut self, offset: u64) -> std::io::Result<()> {
        self.inner.seek(SeekFrom::Start(offset)).map(|_| ())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// [`Sink`] over a non-seekable writer, such as a pipe.
///
/// Streams written through this sink carry a zeroed MD5 digest and
/// placeholder seek points, since neither can be patched afterwards.
pub struct PipeSink<W: Write> {
    inner: W,
}

impl<W: Write> PipeSink<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Sink for PipeSink<W> {
    fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.inner.write_all(data)
    }

    fn is_seekable(&self) -> bool {
        false
    }

    fn seek_to(&mut self, _offset: u64) -> std::io::Result<()> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "sink is not seekable",
        ))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

#[derive(Clone, Copy, Debug)]
struct SeekPoint {
    sample: u64,
    offset: u64,
    frame_samples: u16,
    filled: bool,
}

/// Incremental stream encoder.
///
/// Accepts interleaved samples through [`write_interleaved`] and emits a
/// complete stream once [`finish`] is called.
///
/// [`write_interleaved`]: StreamEncoder::write_interleaved
/// [`finish`]: StreamEncoder::finish
pub struct StreamEncoder<S: Sink> {
    sink: S,
    config: EncoderConfig,
    sample_rate: u32,
    channels: usize,
    bits_per_sample: u32,
    total_samples: u64,
    block_size: usize,

    frame: FrameState,
    bank: WindowBank,
    frame_buffer: BitWriter,
    cop: Option<HostCoprocessor>,
    md5: Option<Md5>,
    digest: [u8; 16],

    /// Pending samples, one buffer per channel.
    buffer: Vec<Vec<i32>>,
    mid: Vec<i32>,
    side: Vec<i32>,

    /// Samples fully encoded so far.
    position: u64,
    frame_count: u64,
    /// Bytes written to the sink so far.
    stream_length: u64,
    /// Byte offset of the first frame.
    frame_data_offset: u64,
    min_frame_size: u32,
    max_frame_size: u32,

    seek_points: Vec<SeekPoint>,
    seek_table_offset: u64,
}

impl<S: Sink> StreamEncoder<S> {
    /// Opens a stream and writes its metadata blocks.
    ///
    /// `total_samples` is the declared per-channel stream length; passing
    /// a different number of samples before [`finish`] is an error.
    ///
    /// [`finish`]: StreamEncoder::finish
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError::Range`] when the stream parameters are not
    /// representable, or an I/O error from the sink.
    pub fn new(
        sink: S,
        config: EncoderConfig,
        sample_rate: u32,
        channels: usize,
        bits_per_sample: u32,
        total_samples: u64,
    ) -> Result<Self, EncodeError> {
        if sample_rate == 0 || sample_rate > MAX_SAMPLE_RATE {
            return Err(RangeError::from_display(
                "sample_rate",
                "must be in `1..=655350`",
                &sample_rate,
            )
            .into());
        }
        if !CODED_BIT_DEPTHS.contains(&bits_per_sample) || bits_per_sample == 0 {
            return Err(RangeError::from_display(
                "bits_per_sample",
                "is not supported",
                &bits_per_sample,
            )
            .into());
        }
        if channels < 1 || channels > 8 {
            return Err(
                RangeError::from_display("channels", "must be in `1..=8`", &channels).into(),
            );
        }
        if total_samples >= 1u64 << 36 {
            return Err(RangeError::from_display(
                "total_samples",
                "must fit in 36 bits",
                &total_samples,
            )
            .into());
        }
        let block_size = config.select_block_size(sample_rate as usize);
        if block_size < MIN_BLOCKSIZE {
            return Err(RangeError::from_display(
                "block_size",
                "is too small for a stream",
                &block_size,
            )
            .into());
        }

        let slots = if channels == 2 { 4 } else { channels };
        let mut encoder = Self {
            md5: config.do_md5().then(Md5::new),
            cop: config.use_coprocessor().then(HostCoprocessor::new),
            bank: WindowBank::new(config.window_functions()),
            frame: FrameState::new(slots),
            frame_buffer: BitWriter::with_capacity(block_size * channels * 3),
            buffer: (0..channels).map(|_| Vec::new()).collect(),
            mid: Vec::new(),
            side: Vec::new(),
            sink,
            config,
            sample_rate,
            channels,
            bits_per_sample,
            total_samples,
            block_size,
            digest: [0u8; 16],
            position: 0,
            frame_count: 0,
            stream_length: 0,
            frame_data_offset: 0,
            min_frame_size: u32::MAX,
            max_frame_size: 0,
            seek_points: Vec::new(),
            seek_table_offset: 0,
        };
        encoder.write_stream_header()?;
        log::info!(
            "stream opened: {sample_rate}Hz, {channels}ch, {bits_per_sample}bit, block size {block_size}"
        );
        Ok(encoder)
    }

    pub const fn block_size(&self) -> usize {
        self.block_size
    }

    /// Samples per channel encoded and written so far.
    pub const fn position(&self) -> u64 {
        self.position
    }

    /// Bytes written to the sink so far.
    pub const fn stream_length(&self) -> u64 {
        self.stream_length
    }

    fn put(&mut self, data: &[u8]) -> Result<(), EncodeError> {
        self.sink.write_all(data)?;
        self.stream_length += data.len() as u64;
        Ok(())
    }

    fn streaminfo_bytes(&self) -> [u8; 34] {
        let mut bw = BitWriter::with_capacity(34);
        bw.write_bits(16, self.block_size as u32);
        bw.write_bits(16, self.block_size as u32);
        let (min_fs, max_fs) = if self.max_frame_size == 0 {
            (0, 0)
        } else {
            (self.min_frame_size, self.max_frame_size)
        };
        bw.write_bits(24, min_fs);
        bw.write_bits(24, max_fs);
        bw.write_bits(20, self.sample_rate);
        bw.write_bits(3, self.channels as u32 - 1);
        bw.write_bits(5, self.bits_per_sample - 1);
        bw.write_bits64(36, self.total_samples);
        let mut data = [0u8; 34];
        data[..18].copy_from_slice(bw.as_slice());
        data[18..].copy_from_slice(&self.digest);
        data
    }

    fn seek_table_bytes(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(self.seek_points.len() * 18);
        for point in &self.seek_points {
            if point.filled {
                data.extend_from_slice(&point.sample.to_be_bytes());
                data.extend_from_slice(&point.offset.to_be_bytes());
                data.extend_from_slice(&point.frame_samples.to_be_bytes());
            } else {
                // Placeholder point.
                data.extend_from_slice(&u64::MAX.to_be_bytes());
                data.extend_from_slice(&[0u8; 10]);
            }
        }
        data
    }

    fn write_stream_header(&mut self) -> Result<(), EncodeError> {
        self.put(b"fLaC")?;

        let streaminfo = self.streaminfo_bytes();
        self.write_metadata_block(0, &streaminfo, false)?;

        if self.config.do_seektable() && self.total_samples > 0 && self.sink.is_seekable() {
            let step = u64::from(self.sample_rate) * SEEKPOINT_INTERVAL;
            let mut sample = 0u64;
            while sample < self.total_samples {
                self.seek_points.push(SeekPoint {
                    sample,
                    offset: 0,
                    frame_samples: 0,
                    filled: false,
                });
                sample += step;
            }
            self.seek_table_offset = self.stream_length + 4;
            let table = self.seek_table_bytes();
            self.write_metadata_block(3, &table, false)?;
        }

        let mut comment = Vec::new();
        comment.extend_from_slice(&(VENDOR_STRING.len() as u32).to_le_bytes());
        comment.extend_from_slice(VENDOR_STRING.as_bytes());
        comment.extend_from_slice(&0u32.to_le_bytes());
        let last = self.config.padding_size() == 0;
        self.write_metadata_block(4, &comment, last)?;

        if self.config.padding_size() > 0 {
            let padding = vec![0u8; self.config.padding_size()];
            self.write_metadata_block(1, &padding, true)?;
        }
        self.frame_data_offset = self.stream_length;
        Ok(())
    }

    fn write_metadata_block(
        &mut self,
        block_type: u8,
        data: &[u8],
        last: bool,
    ) -> Result<(), EncodeError> {
        let len = data.len() as u32;
        let header = [
            block_type | if last { 0x80 } else { 0 },
            (len >> 16) as u8,
            (len >> 8) as u8,
            len as u8,
        ];
        self.put(&header)?;
        self.put(data)
    }

    /// Feeds interleaved samples into the encoder.
    ///
    /// `samples` holds one value per channel per instant, channels
    /// interleaved; its length must be a multiple of the channel count.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError`] on invalid input length, a verification
    /// failure or a sink error.
    pub fn write_interleaved(&mut self, samples: &[i32]) -> Result<(), EncodeError> {
        if samples.len() % self.channels != 0 {
            return Err(RangeError::from_display(
                "samples",
                "length must be a multiple of the channel count",
                &samples.len(),
            )
            .into());
        }
        if let Some(md5) = &mut self.md5 {
            let bytes_per_sample = (self.bits_per_sample as usize + 7) / 8;
            let mut bytes = Vec::with_capacity(samples.len() * bytes_per_sample);
            for &s in samples {
                for b in 0..bytes_per_sample {
                    bytes.push((s >> (8 * b)) as u8);
                }
            }
            md5.update(&bytes);
        }
        for (i, &s) in samples.iter().enumerate() {
            self.buffer[i % self.channels].push(s);
        }
        while self.buffer[0].len() >= self.block_size {
            self.output_frame(self.block_size)?;
        }
        Ok(())
    }

    fn encode_frame(&mut self, blocksize: usize) -> Result<(), EncodeError> {
        self.bank.ensure_size(blocksize);
        self.frame.blocksize = blocksize;

        let counter = if self.config.variable_block_size() > 0 {
            self.position
        } else {
            self.frame_count
        };

        let four_slot = self.channels == 2
            && self.config.stereo_method() != StereoMethod::Independent
            && blocksize >= MIN_BLOCKSIZE;
        if four_slot {
            let (left, right) = (&self.buffer[0][..blocksize], &self.buffer[1][..blocksize]);
            channel_decorrelation(left, right, &mut self.mid, &mut self.side);
            self.frame.subframes[0].load(left, self.bits_per_sample);
            self.frame.subframes[1].load(right, self.bits_per_sample);
            self.frame.subframes[2].load(&self.mid, self.bits_per_sample);
            self.frame.subframes[3].load(&self.side, self.bits_per_sample + 1);

            let offloadable = blocksize > self.config.max_lpc_order() + 1 && self.bank.count() > 0;
            match (&mut self.cop, offloadable) {
                (Some(cop), true) => {
                    offload::estimate_frame(
                        &mut self.frame,
                        &self.bank,
                        cop,
                        &self.config,
                        counter,
                    )?;
                }
                _ => {
                    search::encode_frame(
                        &mut self.frame,
                        &self.bank,
                        &self.config,
                        counter,
                        4,
                        true,
                    );
                }
            }
        } else {
            self.frame.ch_mode = ChannelMode::NotStereo;
            for ch in 0..self.channels {
                self.frame.subframes[ch].load(&self.buffer[ch][..blocksize], self.bits_per_sample);
            }
            search::encode_frame(
                &mut self.frame,
                &self.bank,
                &self.config,
                counter,
                self.channels,
                false,
            );
        }

        let head = FrameHeader {
            blocksize,
            sample_rate: self.sample_rate,
            bits_per_sample: self.bits_per_sample,
            channels: self.channels,
            counter,
            variable_block_size: self.config.variable_block_size() > 0,
        };
        self.frame_buffer.clear();
        bitstream::write_frame(&mut self.frame_buffer, &self.frame, &head);
        Ok(())
    }

    fn verify_frame(&self, blocksize: usize) -> Result<(), VerifyError> {
        let stream = StreamParams {
            channels: self.channels,
            bits_per_sample: self.bits_per_sample,
            sample_rate: self.sample_rate,
        };
        let decoded = decode::decode_frame(self.frame_buffer.as_slice(), &stream)
            .map_err(|e| VerifyError::new(self.frame_count, &format!("{e}")))?;
        if decoded.blocksize != blocksize {
            return Err(VerifyError::new(self.frame_count, "block size differs"));
        }
        for ch in 0..self.channels {
            if decoded.channels[ch][..blocksize] != self.buffer[ch][..blocksize] {
                return Err(VerifyError::new(
                    self.frame_count,
                    &format!("samples of channel {ch} differ"),
                ));
            }
        }
        Ok(())
    }

    fn output_frame(&mut self, blocksize: usize) -> Result<(), EncodeError> {
        self.encode_frame(blocksize)?;
        if self.config.do_verify() {
            self.verify_frame(blocksize)?;
        }

        let frame_bytes = self.frame_buffer.len() as u64;
        let offset = self.stream_length - self.frame_data_offset;
        let end = self.position + blocksize as u64;
        for point in &mut self.seek_points {
            if !point.filled && point.sample >= self.position && point.sample < end {
                point.sample = self.position;
                point.offset = offset;
                point.frame_samples = blocksize as u16;
                point.filled = true;
            }
        }

        let buf = std::mem::take(&mut self.frame_buffer);
        self.put(buf.as_slice())?;
        self.frame_buffer = buf;

        self.min_frame_size = self.min_frame_size.min(frame_bytes as u32);
        self.max_frame_size = self.max_frame_size.max(frame_bytes as u32);
        log::debug!(
            "frame {}: {} samples, {} bytes, mode {:?}",
            self.frame_count,
            blocksize,
            frame_bytes,
            self.frame.ch_mode
        );

        self.position += blocksize as u64;
        self.frame_count += 1;
        for buffer in &mut self.buffer {
            buffer.drain(..blocksize);
        }
        Ok(())
    }

    /// Encodes any buffered samples and completes the stream.
    ///
    /// On a seekable sink the MD5 digest, frame-size statistics and seek
    /// table are patched in place.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError::SampleCountMismatch`] when fewer or more
    /// samples than declared were written, and any pending verification
    /// or sink error.
    pub fn finish(mut self) -> Result<S, EncodeError> {
        while !self.buffer[0].is_empty() {
            let blocksize = self.block_size.min(self.buffer[0].len());
            self.output_frame(blocksize)?;
        }
        if self.total_samples > 0 && self.position != self.total_samples {
            return Err(EncodeError::SampleCountMismatch {
                expected: self.total_samples,
                actual: self.position,
            });
        }

        if let Some(md5) = self.md5.take() {
            self.digest = md5.finalize().into();
        }
        if self.sink.is_seekable() {
            let streaminfo = self.streaminfo_bytes();
            self.sink.seek_to(STREAMINFO_OFFSET)?;
            self.sink.write_all(&streaminfo)?;
            debug_assert_eq!(STREAMINFO_OFFSET + 18, MD5_OFFSET);

            if !self.seek_points.is_empty() {
                let table = self.seek_table_bytes();
                self.sink.seek_to(self.seek_table_offset)?;
                self.sink.write_all(&table)?;
            }
            self.sink.seek_to(self.stream_length)?;
        }
        self.sink.flush()?;
        log::info!(
            "stream finished: {} samples in {} frames, {} bytes",
            self.position,
            self.frame_count,
            self.stream_length
        );
        Ok(self.sink)
    }
}

/// Encodes a whole interleaved signal into a byte vector.
///
/// Convenience wrapper over [`StreamEncoder`] with an in-memory sink.
///
/// # Errors
///
/// Returns [`EncodeError`] on invalid parameters or a verification
/// failure.
pub fn encode_to_vec(
    config: EncoderConfig,
    sample_rate: u32,
    channels: usize,
    bits_per_sample: u32,
    samples: &[i32],
) -> Result<Vec<u8>, EncodeError> {
    let total = (samples.len() / channels.max(1)) as u64;
    let sink = SeekableSink::new(std::io::Cursor::new(Vec::new()));
    let mut encoder = StreamEncoder::new(
        sink,
        config,
        sample_rate,
        channels,
        bits_per_sample,
        total,
    )?;
    encoder.write_interleaved(samples)?;
    let sink = encoder.finish()?;
    Ok(sink.into_inner().into_inner())
}

/// Decodes all frames of an encoded stream back to interleaved samples.
///
/// Metadata blocks are skipped, not interpreted, except that the caller
/// must pass the stream parameters. Used by tests and stream validation.
///
/// # Errors
///
/// Returns [`super::error::DecodeError`] when the stream is malformed.
pub fn decode_all<R: Read>(
    mut reader: R,
    stream: &StreamParams,
) -> Result<Vec<i32>, super::error::DecodeError> {
    let mut data = Vec::new();
    reader
        .read_to_end(&mut data)
        .map_err(|e| super::error::DecodeError::new(0, &format!("read failed: {e}")))?;
    if data.len() < 4 || &data[..4] != b"fLaC" {
        return Err(super::error::DecodeError::new(0, "missing stream marker"));
    }
    let mut pos = 4usize;
    loop {
        if pos + 4 > data.len() {
            return Err(super::error::DecodeError::new(
                pos * 8,
                "truncated metadata block",
            ));
        }
        let last = data[pos] & 0x80 != 0;
        let len = (usize::from(data[pos + 1]) << 16)
            | (usize::from(data[pos + 2]) << 8)
            | usize::from(data[pos + 3]);
        pos += 4 + len;
        if last {
            break;
        }
    }

    let mut samples = Vec::new();
    while pos < data.len() {
        let frame = decode::decode_frame(&data[pos..], stream)?;
        for i in 0..frame.blocksize {
            for ch in 0..stream.channels {
                samples.push(frame.channels[ch][i]);
            }
        }
        pos += frame.bytes;
    }
    Ok(samples)
}
