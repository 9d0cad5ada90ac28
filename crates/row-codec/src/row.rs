use crate::LogicalType;
use serde::{Deserialize, Serialize};

/// RowKind is the change flag of a Row, describing how downstream
/// consumers should interpret it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RowKind {
    #[default]
    #[serde(rename = "+I")]
    Insert,
    #[serde(rename = "-U")]
    UpdateBefore,
    #[serde(rename = "+U")]
    UpdateAfter,
    #[serde(rename = "-D")]
    Delete,
}

impl RowKind {
    pub fn short_string(self) -> &'static str {
        match self {
            Self::Insert => "+I",
            Self::UpdateBefore => "-U",
            Self::UpdateAfter => "+U",
            Self::Delete => "-D",
        }
    }
}

/// Value is a single, possibly-null field of a Row.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    TinyInt(i8),
    SmallInt(i16),
    Int(i32),
    BigInt(i64),
    Float(f32),
    Double(f64),
    String(String),
    Bytes(bytes::Bytes),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// LogicalType of this Value, or None if it's Null.
    pub fn logical_type(&self) -> Option<LogicalType> {
        Some(match self {
            Value::Null => return None,
            Value::Boolean(_) => LogicalType::Boolean,
            Value::TinyInt(_) => LogicalType::TinyInt,
            Value::SmallInt(_) => LogicalType::SmallInt,
            Value::Int(_) => LogicalType::Int,
            Value::BigInt(_) => LogicalType::BigInt,
            Value::Float(_) => LogicalType::Float,
            Value::Double(_) => LogicalType::Double,
            Value::String(_) => LogicalType::String,
            Value::Bytes(_) => LogicalType::Bytes,
        })
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}
impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}
impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::BigInt(v)
    }
}
impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}
impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}
impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}
impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Row is one record of a stream. Its identity is its position within
/// the stream, not its content.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    pub kind: RowKind,
    pub fields: Vec<Value>,
}

impl Row {
    pub fn new(kind: RowKind, fields: Vec<Value>) -> Self {
        Self { kind, fields }
    }

    pub fn insert(fields: Vec<Value>) -> Self {
        Self::new(RowKind::Insert, fields)
    }

    pub fn width(&self) -> usize {
        self.fields.len()
    }

    /// Build a new Row of the same kind, cloning the fields at `offsets`.
    /// Panics if an offset is out of bounds; callers validate offsets
    /// against the row's schema up front.
    pub fn project(&self, offsets: &[usize]) -> Row {
        Row {
            kind: self.kind,
            fields: offsets.iter().map(|&o| self.fields[o].clone()).collect(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_row_kind_serde() {
        let kinds = vec![
            RowKind::Insert,
            RowKind::UpdateBefore,
            RowKind::UpdateAfter,
            RowKind::Delete,
        ];
        let encoded = serde_json::to_string(&kinds).unwrap();
        assert_eq!(encoded, r#"["+I","-U","+U","-D"]"#);

        for kind in kinds {
            assert_eq!(serde_json::to_string(&kind).unwrap(), format!("\"{}\"", kind.short_string()));
        }
        assert_eq!(RowKind::default(), RowKind::Insert);
    }

    #[test]
    fn test_projection_keeps_kind() {
        let row = Row::new(
            RowKind::UpdateAfter,
            vec![1.into(), "two".into(), Value::Null],
        );
        assert_eq!(
            row.project(&[2, 0, 0]),
            Row::new(RowKind::UpdateAfter, vec![Value::Null, 1.into(), 1.into()]),
        );
        assert_eq!(row.project(&[]).width(), 0);
    }

    #[test]
    fn test_logical_types() {
        assert_eq!(Value::Null.logical_type(), None);
        assert_eq!(Value::from(Some(3i64)).logical_type(), Some(LogicalType::BigInt));
        assert_eq!(Value::from(None::<i32>), Value::Null);
        assert_eq!(
            Value::Bytes(bytes::Bytes::from_static(b"x")).logical_type(),
            Some(LogicalType::Bytes)
        );
    }
}
