//! Events delivered from the engines to the host application.
//!
//! Each engine owns an unbounded MPSC queue; the host drains it from its
//! own thread via `poll_events`.

use crate::time::TimeTag;
use crate::types::Endpoint;

/// Playback state of a remote source as seen by a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Stop,
    Play,
}

/// Events emitted by a source engine.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    /// A sink pinged us; `tt` is the sink's send time.
    Ping { endpoint: Endpoint, tt: TimeTag },
    /// A sink asks to be streamed to.
    Invite { endpoint: Endpoint },
    /// A sink asks to stop being streamed to.
    Uninvite { endpoint: Endpoint },
}

/// Events emitted by a sink engine.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    /// A new source registered itself (first format or data message).
    SourceAdd { endpoint: Endpoint },
    /// The source's stream format changed.
    SourceFormat { endpoint: Endpoint },
    /// The source started or stopped playing (edge triggered).
    SourceState { endpoint: Endpoint, state: StreamState },
    /// Blocks never arrived in time and played as silence.
    BlockLost { endpoint: Endpoint, count: i32 },
    /// Blocks arrived out of order.
    BlockReordered { endpoint: Endpoint, count: i32 },
    /// Blocks recovered by retransmission.
    BlockResent { endpoint: Endpoint, count: i32 },
    /// Observed sequence gaps, in blocks.
    BlockGap { endpoint: Endpoint, count: i32 },
    /// Ping from the source: its send time and our receive time.
    Ping {
        endpoint: Endpoint,
        tt1: TimeTag,
        tt2: TimeTag,
    },
}
