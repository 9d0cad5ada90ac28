use serde::{Deserialize, Serialize};

/// LogicalType is the type of a single schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogicalType {
    Boolean,
    TinyInt,
    SmallInt,
    Int,
    BigInt,
    Float,
    Double,
    String,
    Bytes,
}

impl LogicalType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Boolean => "boolean",
            Self::TinyInt => "tinyint",
            Self::SmallInt => "smallint",
            Self::Int => "int",
            Self::BigInt => "bigint",
            Self::Float => "float",
            Self::Double => "double",
            Self::String => "string",
            Self::Bytes => "bytes",
        }
    }
}

impl std::fmt::Display for LogicalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Field {
    pub name: String,
    #[serde(rename = "type")]
    pub r#type: LogicalType,
    #[serde(default = "nullable_default")]
    pub nullable: bool,
}

fn nullable_default() -> bool {
    true
}

impl Field {
    pub fn new(name: impl Into<String>, r#type: LogicalType) -> Self {
        Self {
            name: name.into(),
            r#type,
            nullable: true,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

/// Schema is an ordered list of fields. It's data, not a type:
/// one RowCodec serves any Schema.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schema {
    pub fields: Vec<Field>,
}

impl Schema {
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    pub fn width(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Build the sub-schema selecting `offsets`, in the order given.
    /// Offsets may repeat.
    pub fn project(&self, offsets: &[usize]) -> crate::Result<Schema> {
        let fields = offsets
            .iter()
            .map(|&offset| {
                self.fields
                    .get(offset)
                    .cloned()
                    .ok_or(crate::Error::OffsetOutOfBounds {
                        offset,
                        width: self.width(),
                    })
            })
            .collect::<crate::Result<Vec<_>>>()?;

        Ok(Schema { fields })
    }

    /// Length in bytes of this schema's null mask.
    pub fn null_mask_len(&self) -> usize {
        (self.width() + 7) / 8
    }
}
