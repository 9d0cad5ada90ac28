use crate::{Error, Result, Row, RowCodec, Schema};
use bytes::{Bytes, BytesMut};

/// CallEncoder builds the call payload of a record: the encoding of the
/// record's function arguments, selected by offset, under their projected schema.
///
/// Every field of the record is checked against the input schema,
/// including fields which are only forwarded.
pub struct CallEncoder {
    offsets: Vec<usize>,
    codec: RowCodec,
    input: RowCodec,
    // Re-used across calls. Each payload is split off of it, which
    // leaves its unused remainder capacity available to the next call.
    scratch: BytesMut,
}

impl CallEncoder {
    /// Build a CallEncoder for `offsets` into records of `input_schema`.
    /// Offsets are checked here, once, rather than on every record.
    pub fn new(input_schema: &Schema, offsets: &[usize]) -> Result<Self> {
        let codec = RowCodec::new(input_schema.project(offsets).map_err(|err| {
            Error::Config(format!("invalid function input offsets: {err}"))
        })?);

        Ok(Self {
            offsets: offsets.to_vec(),
            codec,
            input: RowCodec::new(input_schema.clone()),
            scratch: BytesMut::with_capacity(BUFFER_RESERVE),
        })
    }

    /// Schema of the function's arguments.
    pub fn call_schema(&self) -> &Schema {
        self.codec.schema()
    }

    /// Encode the call payload of `row`.
    pub fn encode(&mut self, row: &Row) -> Result<Bytes> {
        self.input.validate(row.fields.iter())?;

        if self.scratch.capacity() - self.scratch.len() < BUFFER_RESERVE / 8 {
            self.scratch.reserve(BUFFER_RESERVE);
        }

        let args = self.offsets.iter().map(|&offset| &row.fields[offset]);
        self.codec.encode_values(args, &mut self.scratch)?;

        Ok(self.scratch.split().freeze())
    }
}

// Initial reservation size of the scratch buffer.
const BUFFER_RESERVE: usize = 4096;
