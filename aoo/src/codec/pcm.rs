//! Uncompressed PCM codec.
//!
//! Wire format is big-endian (network byte order) at 16 or 24 bit integer
//! or 32 bit float depth. The options blob carries the bytes-per-sample
//! tag as a single big-endian i32.

use tracing::warn;

use super::{Codec, Decoder, Encoder};
use crate::error::{Error, Result};
use crate::types::Format;

pub const NAME: &str = "pcm";

/// Bytes per sample on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitDepth {
    Int16 = 2,
    Int24 = 3,
    Float32 = 4,
}

impl BitDepth {
    pub fn bytes(self) -> usize {
        self as usize
    }

    fn from_bytes(n: i32) -> Result<Self> {
        match n {
            2 => Ok(BitDepth::Int16),
            3 => Ok(BitDepth::Int24),
            4 => Ok(BitDepth::Float32),
            other => Err(Error::Codec(format!("bad PCM bit depth tag {other}"))),
        }
    }
}

fn check_format(fmt: &Format) -> Result<()> {
    if fmt.nchannels < 1 || fmt.samplerate < 1 || fmt.blocksize < 1 {
        return Err(Error::InvalidArgument(format!(
            "bad PCM format: {} ch, {} Hz, {} frames",
            fmt.nchannels, fmt.samplerate, fmt.blocksize
        )));
    }
    Ok(())
}

fn write_samples(samples: &[f32], depth: BitDepth, out: &mut [u8]) -> Result<usize> {
    let nbytes = samples.len() * depth.bytes();
    if out.len() < nbytes {
        return Err(Error::Codec("PCM output buffer too small".into()));
    }
    match depth {
        BitDepth::Int16 => {
            for (i, &sample) in samples.iter().enumerate() {
                let v = (sample.clamp(-1.0, 1.0) * 32767.0) as i16;
                out[i * 2..i * 2 + 2].copy_from_slice(&v.to_be_bytes());
            }
        }
        BitDepth::Int24 => {
            for (i, &sample) in samples.iter().enumerate() {
                let v = ((sample.clamp(-1.0, 1.0) * 8_388_607.0) as i32).clamp(-8_388_608, 8_388_607);
                let u = (v as u32) & 0x00FF_FFFF;
                out[i * 3] = (u >> 16) as u8;
                out[i * 3 + 1] = (u >> 8) as u8;
                out[i * 3 + 2] = u as u8;
            }
        }
        BitDepth::Float32 => {
            for (i, &sample) in samples.iter().enumerate() {
                out[i * 4..i * 4 + 4].copy_from_slice(&sample.to_be_bytes());
            }
        }
    }
    Ok(nbytes)
}

fn read_samples(data: &[u8], depth: BitDepth, out: &mut [f32]) -> Result<usize> {
    let nsamples = data.len() / depth.bytes();
    if out.len() < nsamples {
        return Err(Error::Codec("PCM sample buffer too small".into()));
    }
    match depth {
        BitDepth::Int16 => {
            const SCALE: f32 = 1.0 / 32768.0;
            for i in 0..nsamples {
                let v = i16::from_be_bytes([data[i * 2], data[i * 2 + 1]]);
                out[i] = v as f32 * SCALE;
            }
        }
        BitDepth::Int24 => {
            const SCALE: f32 = 1.0 / 8_388_608.0;
            for i in 0..nsamples {
                let mut v = ((data[i * 3] as i32) << 16)
                    | ((data[i * 3 + 1] as i32) << 8)
                    | data[i * 3 + 2] as i32;
                // sign extend from 24 bits
                if v & 0x0080_0000 != 0 {
                    v |= 0xFF00_0000u32 as i32;
                }
                out[i] = v as f32 * SCALE;
            }
        }
        BitDepth::Float32 => {
            for i in 0..nsamples {
                let bytes = [data[i * 4], data[i * 4 + 1], data[i * 4 + 2], data[i * 4 + 3]];
                out[i] = f32::from_be_bytes(bytes);
            }
        }
    }
    Ok(nsamples)
}

pub struct PcmEncoder {
    format: Option<Format>,
    depth: BitDepth,
}

impl PcmEncoder {
    pub fn new(depth: BitDepth) -> Self {
        Self {
            format: None,
            depth,
        }
    }
}

impl Encoder for PcmEncoder {
    fn setup(&mut self, fmt: &Format) -> Result<()> {
        check_format(fmt)?;
        self.format = Some(fmt.clone());
        Ok(())
    }

    fn format(&self) -> Option<&Format> {
        self.format.as_ref()
    }

    fn write_format(&self) -> Result<Vec<u8>> {
        Ok((self.depth.bytes() as i32).to_be_bytes().to_vec())
    }

    fn encode(&mut self, samples: &[f32], out: &mut [u8]) -> Result<usize> {
        let fmt = self.format.as_ref().ok_or(Error::NotSetup)?;
        if samples.len() != fmt.block_samples() {
            return Err(Error::Codec(format!(
                "expected {} samples, got {}",
                fmt.block_samples(),
                samples.len()
            )));
        }
        write_samples(samples, self.depth, out)
    }
}

pub struct PcmDecoder {
    format: Option<Format>,
    depth: BitDepth,
}

impl PcmDecoder {
    pub fn new() -> Self {
        Self {
            format: None,
            depth: BitDepth::Float32,
        }
    }
}

impl Decoder for PcmDecoder {
    fn read_format(&mut self, fmt: &Format, options: &[u8]) -> Result<()> {
        check_format(fmt)?;
        if options.len() < 4 {
            return Err(Error::Codec("short PCM options blob".into()));
        }
        let tag = i32::from_be_bytes([options[0], options[1], options[2], options[3]]);
        self.depth = BitDepth::from_bytes(tag)?;
        self.format = Some(fmt.clone());
        Ok(())
    }

    fn format(&self) -> Option<&Format> {
        self.format.as_ref()
    }

    fn decode(&mut self, data: &[u8], out: &mut [f32]) -> Result<usize> {
        let fmt = self.format.as_ref().ok_or(Error::NotSetup)?;
        let expected = fmt.block_samples() * self.depth.bytes();
        if data.len() != expected {
            warn!(
                "PCM block size mismatch: got {} bytes, expected {}",
                data.len(),
                expected
            );
            return Err(Error::Codec("PCM block size mismatch".into()));
        }
        read_samples(data, self.depth, out)
    }
}

/// PCM codec factory. Encoders default to 32-bit float on the wire.
pub struct PcmCodec;

impl Codec for PcmCodec {
    fn name(&self) -> &'static str {
        NAME
    }

    fn create_encoder(&self) -> Box<dyn Encoder> {
        Box::new(PcmEncoder::new(BitDepth::Float32))
    }

    fn create_decoder(&self) -> Box<dyn Decoder> {
        Box::new(PcmDecoder::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fmt() -> Format {
        Format {
            nchannels: 2,
            samplerate: 48000,
            blocksize: 4,
            codec: NAME.into(),
        }
    }

    #[test]
    fn test_float32_exact_roundtrip() {
        let mut enc = PcmEncoder::new(BitDepth::Float32);
        enc.setup(&fmt()).unwrap();
        let mut dec = PcmDecoder::new();
        dec.read_format(&fmt(), &enc.write_format().unwrap()).unwrap();

        let input = [0.0f32, 0.5, -0.5, 1.0, -1.0, 0.25, -0.125, 0.75];
        let mut wire = [0u8; 32];
        let n = enc.encode(&input, &mut wire).unwrap();
        assert_eq!(n, 32);

        let mut output = [0.0f32; 8];
        let samples = dec.decode(&wire, &mut output).unwrap();
        assert_eq!(samples, 8);
        // float32 on the wire is bit exact
        assert_eq!(input, output);
    }

    #[test]
    fn test_int_depth_roundtrip() {
        for depth in [BitDepth::Int16, BitDepth::Int24] {
            let mut enc = PcmEncoder::new(depth);
            enc.setup(&fmt()).unwrap();
            let mut dec = PcmDecoder::new();
            dec.read_format(&fmt(), &enc.write_format().unwrap()).unwrap();

            let input = [0.0f32, 0.5, -0.5, 0.99, -0.99, 0.25, -0.125, 0.75];
            let mut wire = [0u8; 32];
            let n = enc.encode(&input, &mut wire).unwrap();
            assert_eq!(n, 8 * depth.bytes());

            let mut output = [0.0f32; 8];
            dec.decode(&wire[..n], &mut output).unwrap();
            let tolerance = match depth {
                BitDepth::Int16 => 1.0 / 32000.0,
                _ => 1.0 / 8_000_000.0,
            };
            for (a, b) in input.iter().zip(&output) {
                assert!((a - b).abs() < tolerance, "{a} vs {b}");
            }
        }
    }

    #[test]
    fn test_decoder_rejects_truncated_block() {
        let mut enc = PcmEncoder::new(BitDepth::Float32);
        enc.setup(&fmt()).unwrap();
        let mut dec = PcmDecoder::new();
        dec.read_format(&fmt(), &enc.write_format().unwrap()).unwrap();
        let mut out = [0.0f32; 8];
        assert!(dec.decode(&[0u8; 16], &mut out).is_err());
    }

    #[test]
    fn test_rejects_bad_format() {
        let mut enc = PcmEncoder::new(BitDepth::Float32);
        let bad = Format {
            nchannels: 0,
            samplerate: 48000,
            blocksize: 64,
            codec: NAME.into(),
        };
        assert!(enc.setup(&bad).is_err());
    }
}
