use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the engine core.
///
/// Recovery distinguishes conditions that are recoverable from data (broken
/// linkage, missing checkpoint versions) from logic-invariant violations.
/// Only the latter appear here; the former are handled in place by queuing
/// or purging the affected records.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(String),

    #[error("persistent memory overflow: requested {requested} bytes, {available} available")]
    PmemOverflow { requested: u64, available: u64 },

    #[error("malformed sorted collection value: {0}")]
    Decode(String),

    #[error("comparator \"{0}\" is not registered")]
    MissingComparator(String),

    #[error("hash index entry for a sorted key already present before rebuild")]
    HashIndexOccupied,

    #[error("broken linkage on record at offset {0:#x}")]
    LinkageCorruption(u64),

    #[error("recovery worker panicked")]
    WorkerPanicked,

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}
