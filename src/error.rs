//! Error types.
use std::{io, path::PathBuf};

use tortilla_footer::FooterError;

#[derive(Debug, thiserror::Error)]
pub enum TortillaError {
    /// The first two bytes were not the `#y` magic.
    #[error("not a tortilla file (bad magic)")]
    BadMagic,

    /// File or buffer too short for the header, or for the footer the
    /// header points at.
    #[error("truncated tortilla: {0}")]
    Truncated(&'static str),

    /// The footer failed to decompress or deserialize.
    #[error("footer decode: {0}")]
    FooterDecode(#[from] FooterError),

    #[error("duplicate item id: {0}")]
    DuplicateId(String),

    #[error("unknown mode: {0:?} (expected \"local\" or \"online\")")]
    UnknownMode(String),

    /// A `<stem>.NNNN.part.tortilla` partition is absent.
    #[error("missing partition file: {0}")]
    MissingPart(PathBuf),

    /// Non-206 status, missing Range support, or transport failure. The
    /// remote compiler leaves its partial output behind for resume.
    #[error("http: {0}")]
    Http(String),

    #[error("invalid size string: {0:?}")]
    InvalidSize(String),

    /// A source file named by a sample does not exist.
    #[error("source file does not exist: {0}")]
    InvalidPath(PathBuf),

    /// Sample metadata rejected at construction (time ordering, empty
    /// selections, and similar).
    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),

    /// `data_format` longer than 24 bytes or not 7-bit ASCII.
    #[error("invalid data format: {0:?}")]
    DataFormat(String),

    /// Online compile rows pointing at more than one source URL.
    #[error("rows reference multiple source urls: {0} and {1}")]
    MixedSources(String, String),

    #[error("{0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Table(#[from] tortilla_footer::TableError),
}

impl From<reqwest::Error> for TortillaError {
    fn from(err: reqwest::Error) -> Self {
        TortillaError::Http(err.to_string())
    }
}
