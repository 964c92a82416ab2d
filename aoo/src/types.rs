//! Identifiers, endpoints and stream formats shared by source and sink.

use std::fmt;
use std::net::SocketAddr;

/// Numeric id of a source or sink within one process.
pub type EndpointId = i32;

/// Matches any id.
pub const WILDCARD_ID: EndpointId = -1;

/// Placeholder for "no id".
pub const NO_ID: EndpointId = -2;

/// Identity of a remote source, sink or peer: socket address plus id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub addr: SocketAddr,
    pub id: EndpointId,
}

impl Endpoint {
    pub fn new(addr: SocketAddr, id: EndpointId) -> Self {
        Self { addr, id }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.addr, self.id)
    }
}

/// Identity of one stream generation: endpoint plus salt.
///
/// The source picks a fresh salt on every format change or sequence wrap,
/// so a sink can detect a restarted stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint {
    pub endpoint: Endpoint,
    pub salt: i32,
}

/// Negotiated stream format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Format {
    pub nchannels: i32,
    pub samplerate: i32,
    pub blocksize: i32,
    pub codec: String,
}

impl Format {
    /// Interleaved samples per block.
    pub fn block_samples(&self) -> usize {
        (self.nchannels * self.blocksize).max(0) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_equality() {
        let a = Endpoint::new("127.0.0.1:9000".parse().unwrap(), 1);
        let b = Endpoint::new("127.0.0.1:9000".parse().unwrap(), 1);
        let c = Endpoint::new("127.0.0.1:9001".parse().unwrap(), 1);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, Endpoint::new(a.addr, 2));
    }

    #[test]
    fn test_block_samples() {
        let f = Format {
            nchannels: 2,
            samplerate: 48000,
            blocksize: 64,
            codec: "pcm".into(),
        };
        assert_eq!(f.block_samples(), 128);
    }
}
