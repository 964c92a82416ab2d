//! Crate-wide error and result types.

use thiserror::Error;

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by the streaming engines and codecs.
///
/// Remote faults (malformed packets, unknown patterns) are logged and
/// dropped inside the engines; only programmer-contract violations and
/// codec failures surface through this type.
#[derive(Debug, Error)]
pub enum Error {
    /// No codec with this name has been registered.
    #[error("codec '{0}' not supported")]
    UnsupportedCodec(String),

    /// A format or option failed validation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The engine has not been set up yet.
    #[error("engine not set up")]
    NotSetup,

    /// Encoder/decoder failure.
    #[error("codec error: {0}")]
    Codec(String),

    /// OSC encoding or decoding failure.
    #[error("OSC error: {0}")]
    Osc(String),
}

impl From<rosc::OscError> for Error {
    fn from(err: rosc::OscError) -> Self {
        Error::Osc(format!("{err:?}"))
    }
}
