use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    IO(#[from] std::io::Error),

    /// The file ended before the requested range could be read.
    #[error("unexpected eof: {0}")]
    UnexpectedEof(&'static str),

    #[error("corruption: {0}")]
    Corruption(&'static str),

    #[error("decompression failed: {0}")]
    CompressedFailed(#[from] snap::Error),

    /// Used by point lookups; cursors signal absence through `eof`.
    #[error("not found")]
    NotFound,
}

pub type IResult<T> = std::result::Result<T, Error>;
