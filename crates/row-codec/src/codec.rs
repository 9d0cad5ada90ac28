use crate::{Error, Field, LogicalType, Result, Row, RowKind, Schema, Value};
use bytes::{BufMut, Bytes, BytesMut};

/// RowCodec packs and unpacks the values of rows having a fixed Schema.
/// It holds no mutable state, and may be shared across threads.
#[derive(Debug, Clone, PartialEq)]
pub struct RowCodec {
    schema: Schema,
}

impl RowCodec {
    pub fn new(schema: Schema) -> Self {
        Self { schema }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Build a RowCodec for the projection of this codec's schema at `offsets`.
    pub fn project(&self, offsets: &[usize]) -> Result<RowCodec> {
        Ok(RowCodec::new(self.schema.project(offsets)?))
    }

    /// Encode `fields` into a newly allocated buffer.
    pub fn encode(&self, fields: &[Value]) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        self.encode_values(fields.iter(), &mut buf)?;
        Ok(buf.freeze())
    }

    /// Encode `values` by appending to `buf`. On error `buf` is restored
    /// to its length at entry, so a scratch buffer may be safely re-used.
    pub fn encode_values<'v, I>(&self, values: I, buf: &mut BytesMut) -> Result<()>
    where
        I: ExactSizeIterator<Item = &'v Value>,
    {
        let begin = buf.len();
        let result = self.encode_inner(values, begin, buf);

        if result.is_err() {
            buf.truncate(begin);
        }
        result
    }

    fn encode_inner<'v, I>(&self, values: I, begin: usize, buf: &mut BytesMut) -> Result<()>
    where
        I: ExactSizeIterator<Item = &'v Value>,
    {
        self.check_width(values.len())?;
        buf.put_bytes(0, self.schema.null_mask_len());

        for (index, (value, field)) in values.zip(self.schema.fields.iter()).enumerate() {
            match (value, field.r#type) {
                (Value::Null, _) if field.nullable => {
                    buf[begin + index / 8] |= 1 << (index % 8);
                }
                (Value::Null, _) => {
                    return Err(mismatch(index, field, "is not nullable but is null"));
                }
                (Value::Boolean(v), LogicalType::Boolean) => buf.put_u8(*v as u8),
                (Value::TinyInt(v), LogicalType::TinyInt) => buf.put_i8(*v),
                (Value::SmallInt(v), LogicalType::SmallInt) => buf.put_i16(*v),
                (Value::Int(v), LogicalType::Int) => buf.put_i32(*v),
                (Value::BigInt(v), LogicalType::BigInt) => buf.put_i64(*v),
                (Value::Float(v), LogicalType::Float) => buf.put_f32(*v),
                (Value::Double(v), LogicalType::Double) => buf.put_f64(*v),
                (Value::String(v), LogicalType::String) => {
                    put_length_prefixed(index, field, v.as_bytes(), buf)?
                }
                (Value::Bytes(v), LogicalType::Bytes) => put_length_prefixed(index, field, v, buf)?,
                (value, _) => {
                    let actual = value.logical_type().map(LogicalType::as_str).unwrap_or("null");
                    return Err(mismatch(index, field, &format!("has a {actual} value")));
                }
            }
        }
        Ok(())
    }

    /// Check that `values` conform to the schema, as `encode_values` would,
    /// but without encoding them.
    pub fn validate<'v, I>(&self, values: I) -> Result<()>
    where
        I: ExactSizeIterator<Item = &'v Value>,
    {
        self.check_width(values.len())?;

        for (index, (value, field)) in values.zip(self.schema.fields.iter()).enumerate() {
            match value.logical_type() {
                None if field.nullable => (),
                None => return Err(mismatch(index, field, "is not nullable but is null")),
                Some(actual) if actual == field.r#type => (),
                Some(actual) => return Err(mismatch(index, field, &format!("has a {actual} value"))),
            }
        }
        Ok(())
    }

    fn check_width(&self, width: usize) -> Result<()> {
        if width != self.schema.width() {
            return Err(Error::SchemaMismatch(format!(
                "schema has {} fields but the row has {width}",
                self.schema.width(),
            )));
        }
        Ok(())
    }

    /// Decode the values of a row from `buf`, which must hold exactly one encoded row.
    pub fn decode(&self, buf: &[u8]) -> Result<Vec<Value>> {
        let mut reader = Reader { buf, offset: 0 };
        let mask = reader.take(self.schema.null_mask_len())?;

        let mut values = Vec::with_capacity(self.schema.width());
        for (index, field) in self.schema.fields.iter().enumerate() {
            if mask[index / 8] & (1 << (index % 8)) != 0 {
                if !field.nullable {
                    return Err(mismatch(index, field, "is not nullable but is null"));
                }
                values.push(Value::Null);
                continue;
            }

            let value = match field.r#type {
                LogicalType::Boolean => match reader.array::<1>()? {
                    [0] => Value::Boolean(false),
                    [1] => Value::Boolean(true),
                    [b] => {
                        return Err(mismatch(index, field, &format!("has invalid boolean byte {b:#04x}")))
                    }
                },
                LogicalType::TinyInt => Value::TinyInt(i8::from_be_bytes(reader.array()?)),
                LogicalType::SmallInt => Value::SmallInt(i16::from_be_bytes(reader.array()?)),
                LogicalType::Int => Value::Int(i32::from_be_bytes(reader.array()?)),
                LogicalType::BigInt => Value::BigInt(i64::from_be_bytes(reader.array()?)),
                LogicalType::Float => Value::Float(f32::from_be_bytes(reader.array()?)),
                LogicalType::Double => Value::Double(f64::from_be_bytes(reader.array()?)),
                LogicalType::String => {
                    let content = reader.length_prefixed()?;
                    match std::str::from_utf8(content) {
                        Ok(s) => Value::String(s.to_string()),
                        Err(_) => return Err(mismatch(index, field, "is not valid UTF-8")),
                    }
                }
                LogicalType::Bytes => Value::Bytes(Bytes::copy_from_slice(reader.length_prefixed()?)),
            };
            values.push(value);
        }

        // Mask bits beyond the schema width must be clear.
        let width = self.schema.width();
        if width % 8 != 0 && mask[width / 8] >> (width % 8) != 0 {
            return Err(Error::SchemaMismatch(format!(
                "null mask sets bits beyond the schema width of {width}"
            )));
        }
        if reader.remaining() != 0 {
            return Err(Error::SchemaMismatch(format!(
                "{} trailing bytes after the final field",
                reader.remaining()
            )));
        }
        Ok(values)
    }

    /// Decode a Row of the given `kind` from `buf`.
    pub fn decode_row(&self, kind: RowKind, buf: &[u8]) -> Result<Row> {
        Ok(Row::new(kind, self.decode(buf)?))
    }
}

fn mismatch(index: usize, field: &Field, what: &str) -> Error {
    Error::SchemaMismatch(format!(
        "field {index} ({:?}) of type {} {what}",
        field.name, field.r#type
    ))
}

fn put_length_prefixed(index: usize, field: &Field, content: &[u8], buf: &mut BytesMut) -> Result<()> {
    let Ok(len) = u32::try_from(content.len()) else {
        return Err(mismatch(index, field, "is too large to encode"));
    };
    buf.reserve(4 + content.len());
    buf.put_u32(len);
    buf.put_slice(content);
    Ok(())
}

// Bounds-checked cursor over an encoded row.
struct Reader<'b> {
    buf: &'b [u8],
    offset: usize,
}

impl<'b> Reader<'b> {
    fn remaining(&self) -> usize {
        self.buf.len() - self.offset
    }

    fn take(&mut self, needed: usize) -> Result<&'b [u8]> {
        if needed > self.remaining() {
            return Err(Error::TruncatedInput {
                offset: self.offset,
                needed,
                remaining: self.remaining(),
            });
        }
        let out = &self.buf[self.offset..self.offset + needed];
        self.offset += needed;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn length_prefixed(&mut self) -> Result<&'b [u8]> {
        let len = u32::from_be_bytes(self.array()?) as usize;
        self.take(len)
    }
}
