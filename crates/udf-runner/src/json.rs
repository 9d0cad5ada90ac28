//! JSON-lines representation of rows, as read and written by `udf-pipe`.
//!
//! A row is `{"kind": "+I", "fields": [...]}`. `kind` defaults to `+I`,
//! and `bytes` fields are base64 strings.

use anyhow::Context;
use row_codec::{LogicalType, Row, RowKind, Schema, Value};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct InputRow {
    #[serde(default)]
    kind: RowKind,
    fields: Vec<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct OutputRow {
    kind: RowKind,
    fields: Vec<serde_json::Value>,
}

/// Parse a JSON line into a Row of `schema`.
pub fn parse_row(line: &str, schema: &Schema) -> anyhow::Result<Row> {
    let InputRow { kind, fields } = serde_json::from_str(line).context("invalid JSON row")?;

    anyhow::ensure!(
        fields.len() == schema.width(),
        "row has {} fields but the input schema has {}",
        fields.len(),
        schema.width(),
    );

    let fields = fields
        .iter()
        .zip(schema.fields.iter())
        .map(|(value, field)| {
            from_json(value, field.r#type)
                .with_context(|| format!("field {:?} is not a valid {}", field.name, field.r#type))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    Ok(Row { kind, fields })
}

/// Render a Row as a JSON line.
pub fn render_row(row: &Row) -> String {
    let row = OutputRow {
        kind: row.kind,
        fields: row.fields.iter().map(to_json).collect(),
    };
    serde_json::to_string(&row).expect("rows always serialize")
}

fn from_json(value: &serde_json::Value, r#type: LogicalType) -> anyhow::Result<Value> {
    use serde_json::Value as J;

    let out = match (r#type, value) {
        (_, J::Null) => Value::Null,
        (LogicalType::Boolean, J::Bool(b)) => Value::Boolean(*b),
        (LogicalType::TinyInt, J::Number(n)) => Value::TinyInt(integer(n)?.try_into()?),
        (LogicalType::SmallInt, J::Number(n)) => Value::SmallInt(integer(n)?.try_into()?),
        (LogicalType::Int, J::Number(n)) => Value::Int(integer(n)?.try_into()?),
        (LogicalType::BigInt, J::Number(n)) => Value::BigInt(integer(n)?),
        (LogicalType::Float, J::Number(n)) => {
            let f = float(n)? as f32;
            // JSON numbers are finite, so an infinite `f` has overflowed.
            anyhow::ensure!(f.is_finite(), "{n} is out of range for a float");
            Value::Float(f)
        }
        (LogicalType::Double, J::Number(n)) => Value::Double(float(n)?),
        (LogicalType::String, J::String(s)) => Value::String(s.clone()),
        (LogicalType::Bytes, J::String(s)) => {
            Value::Bytes(base64::decode(s).context("invalid base64")?.into())
        }
        (_, other) => anyhow::bail!("unexpected JSON value {other}"),
    };
    Ok(out)
}

fn integer(n: &serde_json::Number) -> anyhow::Result<i64> {
    n.as_i64()
        .with_context(|| format!("{n} is not a 64-bit signed integer"))
}

fn float(n: &serde_json::Number) -> anyhow::Result<f64> {
    n.as_f64().with_context(|| format!("{n} is not a number"))
}

fn to_json(value: &Value) -> serde_json::Value {
    use serde_json::Value as J;

    match value {
        Value::Null => J::Null,
        Value::Boolean(b) => J::Bool(*b),
        Value::TinyInt(i) => J::from(*i),
        Value::SmallInt(i) => J::from(*i),
        Value::Int(i) => J::from(*i),
        Value::BigInt(i) => J::from(*i),
        // Non-finite floats have no JSON representation.
        Value::Float(f) => J::from(*f as f64),
        Value::Double(f) => J::from(*f),
        Value::String(s) => J::String(s.clone()),
        Value::Bytes(b) => J::String(base64::encode(b)),
    }
}
