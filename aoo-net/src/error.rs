//! Crate-wide error and result types.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("OSC error: {0}")]
    Osc(String),

    #[error("{0}")]
    State(String),

    #[error("{0}")]
    Server(String),
}

impl From<rosc::OscError> for Error {
    fn from(err: rosc::OscError) -> Self {
        Error::Osc(format!("{err:?}"))
    }
}

impl From<aoo::Error> for Error {
    fn from(err: aoo::Error) -> Self {
        Error::Osc(err.to_string())
    }
}
