use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// Emberdb errors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// Invalid on-disk data: CRC mismatch, header overflow, corrupted varint,
    /// unknown entry id, footer magic mismatch, and similar decode failures.
    Corruption(String),
    /// A Function key-value referenced an id that is not registered.
    NoFunction(String),
    /// The single-flight reservation is held by another caller. The operation
    /// must be retried later.
    Busy,
    /// A write was attempted on a closed or read-only structure.
    ReadOnly,
    /// An IO error from the underlying file handle.
    IO(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Corruption(msg) => write!(f, "corruption: {msg}"),
            Error::NoFunction(id) => write!(f, "no function registered for id: {id}"),
            Error::Busy => write!(f, "reservation held by another caller, retry"),
            Error::ReadOnly => write!(f, "write attempted on read-only structure"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
        }
    }
}

/// Constructs an Error::Corruption for the given format string.
#[macro_export]
macro_rules! errcorrupt {
    ($($args:tt)*) => { $crate::error::Error::Corruption(format!($($args)*)).into() };
}

/// An emberdb Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

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

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::IO(err.to_string())
    }
}
