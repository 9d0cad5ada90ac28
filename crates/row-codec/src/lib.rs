//! Binary encoding of typed rows against a logical schema.
//!
//! A [`Row`] is an ordered sequence of [`Value`]s plus a [`RowKind`] change flag.
//! A [`RowCodec`] packs the values of a row (never its kind) into a compact
//! byte layout described by a [`Schema`], and unpacks them again:
//!
//! * A null mask of `ceil(width / 8)` bytes, where bit `i % 8` of byte `i / 8`
//!   is set if field `i` is null.
//! * Each non-null field in schema order. Fixed-width numerics are big-endian,
//!   booleans are a single `0` or `1` byte, and strings and bytes are a
//!   big-endian `u32` length followed by their content.

mod codec;
mod row;
mod schema;

pub use codec::RowCodec;
pub use row::{Row, RowKind, Value};
pub use schema::{Field, LogicalType, Schema};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),
    #[error("truncated input at byte {offset}: needed {needed} bytes but only {remaining} remain")]
    TruncatedInput {
        offset: usize,
        needed: usize,
        remaining: usize,
    },
    #[error("offset {offset} is out of bounds for a schema of width {width}")]
    OffsetOutOfBounds { offset: usize, width: usize },
}

pub type Result<T> = std::result::Result<T, Error>;
