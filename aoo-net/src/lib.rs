//! Peer connection core for audio-over-OSC: a TCP control channel to the
//! rendezvous server, a UDP handshake state machine that discovers the
//! working endpoint for each peer, per-peer keep-alive, and the matching
//! server library with its `aoo-server` binary.
//!
//! Like the engines in the `aoo` crate, the client is transport agnostic
//! on the UDP side: datagrams come in through `handle_message()` and go
//! out through a caller-supplied send function, so the same socket can
//! carry audio-plane and control-plane traffic.

pub mod client;
pub mod error;
pub mod peer;
pub mod server;
pub mod slip;

pub use client::{Client, ClientEvent, ClientState, ConnectReply, Reply};
pub use error::{Error, Result};
pub use server::{Server, ServerOptions};

/// Default rendezvous server port.
pub const DEFAULT_SERVER_PORT: u16 = 7078;

/// Keep-alive interval for server and peer pings, seconds.
pub const PING_INTERVAL: f64 = 5.0;

/// Interval between handshake probes, seconds.
pub const REQUEST_INTERVAL: f64 = 0.1;

/// Give up on a handshake or pending request after this long, seconds.
pub const REQUEST_TIMEOUT: f64 = 5.0;

/// Lowercase hex MD5 digest, as sent in login and group messages.
pub fn password_hash(password: &str) -> String {
    format!("{:x}", md5::compute(password.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_hash_is_lowercase_md5() {
        // well-known MD5 test vector
        assert_eq!(password_hash(""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(password_hash("abc"), "900150983cd24fb0d6963f7d28e17f72");
    }
}
