//! Opus codec, wrapping libopus through the `audiopus` crate.
//!
//! Opus only accepts a fixed set of frame durations, so `setup` rounds the
//! requested block size up to the next legal frame size and reports the
//! adjusted format. The options blob carries bitrate, complexity and
//! signal type as three big-endian i32 values; the signal tag uses the
//! libopus constants so it survives the wire unchanged.

use audiopus::coder;
use audiopus::{Application, Bitrate, Channels, SampleRate, Signal};
use tracing::{debug, warn};

use super::{Codec, Decoder, Encoder};
use crate::error::{Error, Result};
use crate::types::Format;

pub const NAME: &str = "opus";

/// Signal-type tags on the wire (libopus values).
pub const SIGNAL_AUTO: i32 = -1000;
pub const SIGNAL_VOICE: i32 = 3001;
pub const SIGNAL_MUSIC: i32 = 3002;

const OPTIONS_SIZE: usize = 12;

/// libopus default complexity.
const DEFAULT_COMPLEXITY: i32 = 9;

fn sample_rate(sr: i32) -> Result<SampleRate> {
    match sr {
        8000 => Ok(SampleRate::Hz8000),
        12000 => Ok(SampleRate::Hz12000),
        16000 => Ok(SampleRate::Hz16000),
        24000 => Ok(SampleRate::Hz24000),
        48000 => Ok(SampleRate::Hz48000),
        other => Err(Error::InvalidArgument(format!(
            "opus does not support {other} Hz"
        ))),
    }
}

fn channels(n: i32) -> Result<Channels> {
    match n {
        1 => Ok(Channels::Mono),
        2 => Ok(Channels::Stereo),
        other => Err(Error::InvalidArgument(format!(
            "opus supports 1 or 2 channels, got {other}"
        ))),
    }
}

fn signal_from_tag(tag: i32) -> Signal {
    match tag {
        SIGNAL_VOICE => Signal::Voice,
        SIGNAL_MUSIC => Signal::Music,
        SIGNAL_AUTO => Signal::Auto,
        other => {
            warn!("unknown opus signal tag {}, using auto", other);
            Signal::Auto
        }
    }
}

fn codec_err(err: audiopus::Error) -> Error {
    Error::Codec(err.to_string())
}

/// Round `blocksize` up to the next frame size opus accepts at this rate
/// (2.5, 5, 10, 20, 40 or 60 ms).
fn legal_blocksize(samplerate: i32, blocksize: i32) -> i32 {
    let frames = [
        samplerate / 400,
        samplerate / 200,
        samplerate / 100,
        samplerate / 50,
        samplerate / 25,
        3 * samplerate / 50,
    ];
    for &n in &frames {
        if blocksize <= n {
            return n;
        }
    }
    frames[frames.len() - 1]
}

fn check_format(fmt: &Format) -> Result<Format> {
    sample_rate(fmt.samplerate)?;
    channels(fmt.nchannels)?;
    if fmt.blocksize < 1 {
        return Err(Error::InvalidArgument("bad opus block size".into()));
    }
    let mut adjusted = fmt.clone();
    adjusted.blocksize = legal_blocksize(fmt.samplerate, fmt.blocksize);
    if adjusted.blocksize != fmt.blocksize {
        debug!(
            "adjusted opus block size {} -> {}",
            fmt.blocksize, adjusted.blocksize
        );
    }
    Ok(adjusted)
}

/// Serialize `(bitrate, complexity, signal)` as big-endian i32 triplet.
fn write_options(bitrate: i32, complexity: i32, signal: i32) -> Vec<u8> {
    let mut blob = Vec::with_capacity(OPTIONS_SIZE);
    blob.extend_from_slice(&bitrate.to_be_bytes());
    blob.extend_from_slice(&complexity.to_be_bytes());
    blob.extend_from_slice(&signal.to_be_bytes());
    blob
}

fn read_options(options: &[u8]) -> Result<(i32, i32, i32)> {
    if options.len() < OPTIONS_SIZE {
        return Err(Error::Codec("short opus options blob".into()));
    }
    let int = |i: usize| i32::from_be_bytes([options[i], options[i + 1], options[i + 2], options[i + 3]]);
    Ok((int(0), int(4), int(8)))
}

pub struct OpusEncoder {
    format: Option<Format>,
    encoder: Option<coder::Encoder>,
    bitrate: i32,
    complexity: i32,
    signal: i32,
    input: Vec<f32>,
    packet: Vec<u8>,
}

impl OpusEncoder {
    pub fn new() -> Self {
        Self {
            format: None,
            encoder: None,
            bitrate: 0,
            complexity: DEFAULT_COMPLEXITY,
            signal: SIGNAL_AUTO,
            input: Vec::new(),
            packet: Vec::new(),
        }
    }

    /// Target bitrate in bits per second; 0 restores the library default.
    pub fn set_bitrate(&mut self, bitrate: i32) -> Result<()> {
        self.bitrate = bitrate.max(0);
        if let Some(enc) = &mut self.encoder {
            apply_bitrate(enc, self.bitrate)?;
        }
        Ok(())
    }

    /// Encoder complexity, clamped to the opus range 0..=10.
    pub fn set_complexity(&mut self, complexity: i32) -> Result<()> {
        self.complexity = complexity.clamp(0, 10);
        if let Some(enc) = &mut self.encoder {
            enc.set_complexity(self.complexity as u8).map_err(codec_err)?;
        }
        Ok(())
    }

    /// Signal-type hint, one of the `SIGNAL_*` tags.
    pub fn set_signal_type(&mut self, signal: i32) -> Result<()> {
        self.signal = signal;
        if let Some(enc) = &mut self.encoder {
            enc.set_signal(signal_from_tag(self.signal)).map_err(codec_err)?;
        }
        Ok(())
    }

    pub fn bitrate(&self) -> i32 {
        self.bitrate
    }

    pub fn complexity(&self) -> i32 {
        self.complexity
    }

    pub fn signal_type(&self) -> i32 {
        self.signal
    }
}

fn apply_bitrate(encoder: &mut coder::Encoder, bitrate: i32) -> Result<()> {
    let setting = if bitrate > 0 {
        Bitrate::BitsPerSecond(bitrate)
    } else {
        Bitrate::Auto
    };
    encoder.set_bitrate(setting).map_err(codec_err)
}

impl Encoder for OpusEncoder {
    fn setup(&mut self, fmt: &Format) -> Result<()> {
        let adjusted = check_format(fmt)?;
        let mut encoder = coder::Encoder::new(
            sample_rate(adjusted.samplerate)?,
            channels(adjusted.nchannels)?,
            Application::Audio,
        )
        .map_err(codec_err)?;
        // apply the stream settings to the fresh encoder state
        apply_bitrate(&mut encoder, self.bitrate)?;
        encoder
            .set_complexity(self.complexity.clamp(0, 10) as u8)
            .map_err(codec_err)?;
        encoder
            .set_signal(signal_from_tag(self.signal))
            .map_err(codec_err)?;
        self.encoder = Some(encoder);
        self.input = Vec::with_capacity(adjusted.block_samples());
        self.format = Some(adjusted);
        Ok(())
    }

    fn format(&self) -> Option<&Format> {
        self.format.as_ref()
    }

    fn write_format(&self) -> Result<Vec<u8>> {
        Ok(write_options(self.bitrate, self.complexity, self.signal))
    }

    fn encode(&mut self, samples: &[f32], out: &mut [u8]) -> Result<usize> {
        let fmt = self.format.as_ref().ok_or(Error::NotSetup)?;
        let encoder = self.encoder.as_mut().ok_or(Error::NotSetup)?;
        if samples.len() != fmt.block_samples() {
            return Err(Error::Codec(format!(
                "expected {} samples, got {}",
                fmt.block_samples(),
                samples.len()
            )));
        }
        self.input.clear();
        self.input.extend_from_slice(samples);
        if self.packet.len() != out.len() {
            self.packet.resize(out.len(), 0);
        }
        let nbytes = encoder
            .encode_float(&self.input, &mut self.packet)
            .map_err(codec_err)?;
        out[..nbytes].copy_from_slice(&self.packet[..nbytes]);
        Ok(nbytes)
    }
}

pub struct OpusDecoder {
    format: Option<Format>,
    decoder: Option<coder::Decoder>,
    // the encoder-side settings as seen on the wire; a libopus decoder
    // takes no such knobs, so they are recorded, not applied
    bitrate: i32,
    complexity: i32,
    signal: i32,
    output: Vec<f32>,
}

impl OpusDecoder {
    pub fn new() -> Self {
        Self {
            format: None,
            decoder: None,
            bitrate: 0,
            complexity: DEFAULT_COMPLEXITY,
            signal: SIGNAL_AUTO,
            output: Vec::new(),
        }
    }

    pub fn bitrate(&self) -> i32 {
        self.bitrate
    }

    pub fn complexity(&self) -> i32 {
        self.complexity
    }

    pub fn signal_type(&self) -> i32 {
        self.signal
    }
}

impl Decoder for OpusDecoder {
    fn read_format(&mut self, fmt: &Format, options: &[u8]) -> Result<()> {
        let adjusted = check_format(fmt)?;
        let (bitrate, complexity, signal) = read_options(options)?;
        self.bitrate = bitrate;
        self.complexity = complexity;
        self.signal = signal;
        self.decoder = Some(
            coder::Decoder::new(
                sample_rate(adjusted.samplerate)?,
                channels(adjusted.nchannels)?,
            )
            .map_err(codec_err)?,
        );
        self.output = vec![0.0; adjusted.block_samples()];
        self.format = Some(adjusted);
        Ok(())
    }

    fn format(&self) -> Option<&Format> {
        self.format.as_ref()
    }

    fn decode(&mut self, data: &[u8], out: &mut [f32]) -> Result<usize> {
        let fmt = self.format.as_ref().ok_or(Error::NotSetup)?;
        let decoder = self.decoder.as_mut().ok_or(Error::NotSetup)?;
        let packet = audiopus::packet::Packet::try_from(data).map_err(codec_err)?;
        let signals = audiopus::MutSignals::try_from(&mut self.output).map_err(codec_err)?;
        let frames = decoder
            .decode_float(Some(packet), signals, false)
            .map_err(codec_err)?;
        let nsamples = frames * fmt.nchannels as usize;
        if out.len() < nsamples {
            return Err(Error::Codec("opus output buffer too small".into()));
        }
        out[..nsamples].copy_from_slice(&self.output[..nsamples]);
        Ok(nsamples)
    }
}

pub struct OpusCodec;

impl Codec for OpusCodec {
    fn name(&self) -> &'static str {
        NAME
    }

    fn create_encoder(&self) -> Box<dyn Encoder> {
        Box::new(OpusEncoder::new())
    }

    fn create_decoder(&self) -> Box<dyn Decoder> {
        Box::new(OpusDecoder::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legal_blocksize() {
        assert_eq!(legal_blocksize(48000, 64), 120);
        assert_eq!(legal_blocksize(48000, 120), 120);
        assert_eq!(legal_blocksize(48000, 512), 960);
        assert_eq!(legal_blocksize(48000, 4000), 2880);
        assert_eq!(legal_blocksize(8000, 20), 20);
    }

    #[test]
    fn test_rejects_odd_samplerate() {
        let mut enc = OpusEncoder::new();
        let fmt = Format {
            nchannels: 2,
            samplerate: 44100,
            blocksize: 512,
            codec: NAME.into(),
        };
        assert!(enc.setup(&fmt).is_err());
    }

    #[test]
    fn test_rejects_multichannel() {
        let mut enc = OpusEncoder::new();
        let fmt = Format {
            nchannels: 6,
            samplerate: 48000,
            blocksize: 512,
            codec: NAME.into(),
        };
        assert!(enc.setup(&fmt).is_err());
    }

    #[test]
    fn test_options_roundtrip() {
        let mut enc = OpusEncoder::new();
        enc.set_bitrate(96000).unwrap();
        enc.set_complexity(5).unwrap();
        enc.set_signal_type(SIGNAL_MUSIC).unwrap();

        let blob = enc.write_format().unwrap();
        assert_eq!(blob.len(), OPTIONS_SIZE);

        let fmt = Format {
            nchannels: 1,
            samplerate: 48000,
            blocksize: 960,
            codec: NAME.into(),
        };
        let mut dec = OpusDecoder::new();
        dec.read_format(&fmt, &blob).unwrap();
        assert_eq!(dec.bitrate(), 96000);
        assert_eq!(dec.complexity(), 5);
        assert_eq!(dec.signal_type(), SIGNAL_MUSIC);
    }

    #[test]
    fn test_rejects_short_options() {
        let fmt = Format {
            nchannels: 1,
            samplerate: 48000,
            blocksize: 960,
            codec: NAME.into(),
        };
        let mut dec = OpusDecoder::new();
        assert!(dec.read_format(&fmt, &[0u8; 4]).is_err());
    }

    #[test]
    fn test_complexity_clamped() {
        let mut enc = OpusEncoder::new();
        enc.set_complexity(99).unwrap();
        assert_eq!(enc.complexity(), 10);
        enc.set_complexity(-3).unwrap();
        assert_eq!(enc.complexity(), 0);
    }

    #[test]
    fn test_encode_decode_block() {
        let fmt = Format {
            nchannels: 1,
            samplerate: 48000,
            blocksize: 960,
            codec: NAME.into(),
        };
        let mut enc = OpusEncoder::new();
        enc.set_bitrate(64000).unwrap();
        enc.set_signal_type(SIGNAL_MUSIC).unwrap();
        enc.setup(&fmt).unwrap();
        assert_eq!(enc.format().unwrap().blocksize, 960);

        let mut dec = OpusDecoder::new();
        dec.read_format(enc.format().unwrap(), &enc.write_format().unwrap())
            .unwrap();

        // 440 Hz sine, one 20 ms block
        let input: Vec<f32> = (0..960)
            .map(|i| (i as f32 * 440.0 * std::f32::consts::TAU / 48000.0).sin() * 0.5)
            .collect();
        let mut wire = vec![0u8; 4000];
        let nbytes = enc.encode(&input, &mut wire).unwrap();
        assert!(nbytes > 0 && nbytes < wire.len());

        let mut output = vec![0.0f32; 960];
        let nsamples = dec.decode(&wire[..nbytes], &mut output).unwrap();
        assert_eq!(nsamples, 960);
    }
}
