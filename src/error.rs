use std::io;
use std::path::PathBuf;

use crate::dpth::Location;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(
        "data path namespace under {root:?} is exhausted; move the storage pool aside and start a fresh one"
    )]
    Exhausted { root: PathBuf },

    #[error("failed to load candidate manifest {path:?}: {source}")]
    CandidateLoad { path: PathBuf, source: Box<Error> },

    #[error("failed to write block {index} to {location}: {source}")]
    BlockWrite {
        index: u64,
        location: Location,
        source: io::Error,
    },

    #[error("malformed record: {0}")]
    Record(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("wire encoding error: {0}")]
    Encoding(#[from] postcard::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to parse configuration: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("deduplication service is gone")]
    ServiceGone,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Whether the error ends the backup session it occurred in.
    ///
    /// Candidate load failures are the only recoverable class: the scorer
    /// proceeds with fewer champions.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::CandidateLoad { .. })
    }

    pub(crate) fn record(msg: impl Into<String>) -> Self {
        Self::Record(msg.into())
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}
