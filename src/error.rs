use serde_derive::{Deserialize, Serialize};

/// A quorumdb error. All errors are string-encoded, to allow passing them
/// across the wire and between threads.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Error {
    /// The operation was aborted and must be retried, typically because the
    /// node or cluster state changed (lost leadership, shutdown, rollback).
    Abort,
    /// Invalid data, e.g. a malformed message or a divergent commit hash.
    InvalidData(String),
    /// Invalid user input, e.g. a malformed peer list.
    InvalidInput(String),
    /// An IO error.
    IO(String),
    /// A transaction conflicted with a concurrent commit and was rolled
    /// back. The caller can retry it from the start.
    Serialization,
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Abort => write!(f, "operation aborted"),
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
            Error::Serialization => write!(f, "serialization failure, retry transaction"),
        }
    }
}

impl Error {
    /// Returns whether the error is considered deterministic, i.e. whether
    /// every node in the cluster is guaranteed to produce it for the same
    /// operation. Non-deterministic errors (e.g. IO errors) must not be
    /// treated as replicated results, since replicas may diverge.
    pub fn is_deterministic(&self) -> bool {
        match self {
            Error::InvalidData(_) | Error::InvalidInput(_) => true,
            Error::Abort | Error::IO(_) | Error::Serialization => false,
        }
    }
}

/// Constructs an Error::InvalidData via format!() and into().
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => { $crate::error::Error::InvalidData(format!($($args)*)).into() };
}

/// Constructs an Error::InvalidInput via format!() and into().
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { $crate::error::Error::InvalidInput(format!($($args)*)).into() };
}

/// A quorumdb result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Allows constructing a Result<T> from an Error via into(), as the errdata!
/// and errinput! macros do.
impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::InvalidData(err.to_string())
    }
}

impl From<std::net::AddrParseError> for Error {
    fn from(err: std::net::AddrParseError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<std::num::ParseIntError> for Error {
    fn from(err: std::num::ParseIntError) -> Self {
        Error::InvalidData(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        // This only happens when a different thread panics while holding a
        // lock, which will typically abort the process anyway.
        Error::IO(err.to_string())
    }
}

impl<T> From<crossbeam::channel::SendError<T>> for Error {
    fn from(err: crossbeam::channel::SendError<T>) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<crossbeam::channel::RecvError> for Error {
    fn from(err: crossbeam::channel::RecvError) -> Self {
        Error::IO(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_deterministic() {
        assert!(Error::InvalidData("divergent hash".into()).is_deterministic());
        assert!(!Error::Serialization.is_deterministic());
        assert!(!Error::IO("connection reset".into()).is_deterministic());
    }

    #[test]
    fn macros() {
        let err: Error = errdata!("bad {}", "frame");
        assert_eq!(err, Error::InvalidData("bad frame".into()));
        let err: Error = errinput!("bad {}", "peer list");
        assert_eq!(err, Error::InvalidInput("bad peer list".into()));
    }
}
