//! Peer-to-peer audio-over-OSC streaming engines.
//!
//! One or more sources send live PCM or Opus-coded audio over UDP to one
//! or more sinks, with sub-block timing accuracy, automatic clock-drift
//! compensation via a time-DLL, and packet-loss recovery by
//! retransmission. This crate holds the two endpoint engines plus the
//! shared timing, codec and buffer machinery; NAT traversal and the
//! rendezvous protocol live in `aoo-net`.
//!
//! The engines are transport agnostic: incoming datagrams are fed through
//! `handle_message()` and outgoing ones leave through a caller-supplied
//! send function, so hosts keep full control over their sockets.

pub mod buffer;
pub mod codec;
pub mod error;
pub mod event;
pub mod osc;
pub mod sink;
pub mod source;
pub mod time;
pub mod types;

use std::sync::{Arc, Once};

pub use error::{Error, Result};
pub use event::{SinkEvent, SourceEvent, StreamState};
pub use sink::{Sink, SinkOptions};
pub use source::{Source, SourceOptions};
pub use time::{TimeDll, TimeTag, Timer, TimerState};
pub use types::{Endpoint, EndpointId, Fingerprint, Format, NO_ID, WILDCARD_ID};

/// Byte allowance for the OSC header of a data message (address pattern,
/// type tags and non-blob arguments).
pub const DATA_HEADER_SIZE: i32 = 80;

/// Hard upper bound for UDP packets built by the engines.
pub const MAX_PACKET_SIZE: i32 = 4096;

/// Smallest usable packet size: the data header plus some payload.
pub const MIN_PACKET_SIZE: i32 = DATA_HEADER_SIZE + 64;

static INITIALIZE: Once = Once::new();

/// Register the built-in codecs (PCM, Opus). Call once at startup,
/// before creating any source or sink; later calls are no-ops.
pub fn initialize() {
    INITIALIZE.call_once(|| {
        let _ = codec::register_codec(Arc::new(codec::pcm::PcmCodec));
        let _ = codec::register_codec(Arc::new(codec::opus::OpusCodec));
    });
}
