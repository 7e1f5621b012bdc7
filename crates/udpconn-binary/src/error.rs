use thiserror::Error;

/// Errors that can occur during binary encoding or decoding.
#[derive(Error, Debug)]
pub enum BinaryError {
    /// Not enough bytes remaining in the buffer for the requested read.
    #[error("buffer ended unexpectedly: needed {needed}, remaining {remaining}")]
    UnexpectedEof { needed: usize, remaining: usize },
    /// An underlying I/O error, surfaced for parity with `std::io::Error`-based callers.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Decoded data that isn't valid for its target type (e.g. non-UTF-8 string bytes).
    #[error("invalid data: {0}")]
    InvalidData(String),
}

pub type Result<T> = std::result::Result<T, BinaryError>;
