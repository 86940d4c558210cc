//! Columnar footer table for Tortilla container files.
//!
//! A Tortilla file ends with a compressed columnar table carrying one row per
//! stored item. This crate owns the in-memory table model and the byte-level
//! codec; the container layout (header, data region) lives in the `tortilla`
//! crate.

mod codec;
pub mod table;

pub use codec::{decode_footer, encode_footer};
pub use table::{Column, ColumnType, RowRef, Table, TableError, Value};

/// Unique item identifier, first well-known footer column.
pub const ID_COLUMN: &str = "tortilla:id";
/// Absolute byte position of the item within its container.
pub const OFFSET_COLUMN: &str = "tortilla:offset";
/// Item payload length in bytes.
pub const LENGTH_COLUMN: &str = "tortilla:length";

#[derive(Debug, thiserror::Error)]
pub enum FooterError {
    #[error("footer io: {0}")]
    Io(#[from] std::io::Error),

    #[error("footer framing: {0}")]
    Framing(&'static str),

    #[error(transparent)]
    Table(#[from] TableError),
}
