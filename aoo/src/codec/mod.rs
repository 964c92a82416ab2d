//! Codec interface and process-wide codec registry.
//!
//! The engines treat every codec as an opaque encode/decode object; codec
//! plugins register themselves by name through [`register_codec`] before
//! the first stream is created.

pub mod opus;
pub mod pcm;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use lazy_static::lazy_static;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::types::Format;

/// Upper bound for serialized codec options.
pub const MAX_OPTIONS_SIZE: usize = 256;

/// Stream encoder. One block of interleaved samples in, one encoded
/// payload out.
pub trait Encoder: Send {
    /// Validate `fmt` and reconfigure. The codec may adjust fields (e.g.
    /// round the block size up to a legal frame size); the stored format
    /// is the adjusted one.
    fn setup(&mut self, fmt: &Format) -> Result<()>;

    /// The validated format, or `None` before the first `setup`.
    fn format(&self) -> Option<&Format>;

    /// Serialize codec-specific options for the wire format message.
    fn write_format(&self) -> Result<Vec<u8>>;

    /// Encode one block of `format().block_samples()` interleaved samples.
    /// Returns the number of bytes written; 0 marks a deliberately skipped
    /// (silent) block.
    fn encode(&mut self, samples: &[f32], out: &mut [u8]) -> Result<usize>;
}

/// Stream decoder, configured from a received format message.
pub trait Decoder: Send {
    /// Apply a format received from the wire, including the codec-specific
    /// options blob.
    fn read_format(&mut self, fmt: &Format, options: &[u8]) -> Result<()>;

    /// The current format, or `None` before the first `read_format`.
    fn format(&self) -> Option<&Format>;

    /// Decode one payload into `format().block_samples()` interleaved
    /// samples. Returns the number of samples written; the caller fills
    /// the block with silence on error.
    fn decode(&mut self, data: &[u8], out: &mut [f32]) -> Result<usize>;
}

/// Codec factory, registered once per process.
pub trait Codec: Send + Sync {
    fn name(&self) -> &'static str;
    fn create_encoder(&self) -> Box<dyn Encoder>;
    fn create_decoder(&self) -> Box<dyn Decoder>;
}

lazy_static! {
    static ref REGISTRY: RwLock<HashMap<String, Arc<dyn Codec>>> = RwLock::new(HashMap::new());
}

static FROZEN: AtomicBool = AtomicBool::new(false);

/// Register a codec under its name. Fails after the registry has been
/// used for the first lookup, and on duplicate names.
pub fn register_codec(codec: Arc<dyn Codec>) -> Result<()> {
    if FROZEN.load(Ordering::Acquire) {
        return Err(Error::InvalidArgument(
            "codec registry is frozen after first use".into(),
        ));
    }
    let name = codec.name().to_string();
    let mut registry = REGISTRY.write();
    if registry.contains_key(&name) {
        warn!("codec '{}' already registered", name);
        return Err(Error::InvalidArgument(format!(
            "codec '{name}' already registered"
        )));
    }
    debug!("registered codec '{}'", name);
    registry.insert(name, codec);
    Ok(())
}

/// Look up a codec by name. The first lookup freezes the registry.
pub fn find_codec(name: &str) -> Option<Arc<dyn Codec>> {
    FROZEN.store(true, Ordering::Release);
    REGISTRY.read().get(name).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_registered_codecs() {
        crate::initialize();
        assert!(find_codec("pcm").is_some());
        assert!(find_codec("opus").is_some());
        assert!(find_codec("flac").is_none());
    }

    #[test]
    fn test_registry_frozen_after_use() {
        crate::initialize();
        let _ = find_codec("pcm");
        let err = register_codec(Arc::new(pcm::PcmCodec));
        assert!(err.is_err());
    }
}
