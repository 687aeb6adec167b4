//! Crate-wide error type.
//!
//! "Key not found" is NOT an error: seeks position the iterator at the end
//! and `next_*` returns `Ok(None)`.  `NotExist` is reserved for a section
//! that is absent from the file altogether.

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Underlying sink/source failure.  Fatal to the current operation.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Malformed on-disk data: bad magic, truncated block, inconsistent
    /// restart table, corrupt varint, footer CRC mismatch.
    #[error("malformed reftable: {0}")]
    Format(String),

    /// The requested section is not present in this file.
    #[error("section not present")]
    NotExist,

    /// Reserved for the multi-table stack layer.
    #[error("table is locked")]
    Lock,

    /// API misuse: out-of-order keys, wrong iterator kind, writes after
    /// close, unset limits.
    #[error("API misuse: {0}")]
    Api(String),

    /// Log payload compression or decompression failed.
    #[error("zlib: {0}")]
    Zlib(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Shorthand for a format error with a static description.
    pub(crate) fn format(msg: impl Into<String>) -> Error {
        Error::Format(msg.into())
    }

    pub(crate) fn api(msg: impl Into<String>) -> Error {
        Error::Api(msg.into())
    }
}
