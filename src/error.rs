use thiserror::Error;

/// Every way a run of the engine can fail.
///
/// Configuration errors surface before any computation begins. Communication
/// errors are fatal to the run: a halo exchange that fails midway cannot be
/// retried without re-synchronizing every rank. Persistence errors are fatal
/// for the checkpoint they affect; the caller decides whether to keep going.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Communication failure: {0}")]
    CommunicationFailure(String),
    #[error("Persistence failure: {0}")]
    PersistenceFailure(String),
    #[error("No further steps available: {0}")]
    StepUnavailable(String),
    #[error("Invalid rank: {0}")]
    InvalidRank(usize),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Shared memory error: {0}")]
    SharedMemoryError(String),
    #[error("Process error: {0}")]
    ProcessError(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Error::InvalidConfiguration(msg.into())
    }

    pub(crate) fn comm(msg: impl Into<String>) -> Self {
        Error::CommunicationFailure(msg.into())
    }

    pub(crate) fn persistence(msg: impl Into<String>) -> Self {
        Error::PersistenceFailure(msg.into())
    }

    /// True for errors that end the run rather than a single checkpoint.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::PersistenceFailure(_) | Error::StepUnavailable(_))
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::SerializationError(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::InvalidConfiguration(format!("settings file: {e}"))
    }
}
