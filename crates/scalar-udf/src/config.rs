use crate::{Error, Result, Schema};
use serde::{Deserialize, Serialize};

/// ShutdownPolicy decides the fate of calls still in flight when an operator closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownPolicy {
    /// Wait for every in-flight call to complete, and emit its joined row.
    Drain,
    /// Stop the runner immediately and discard in-flight records without emitting them.
    Abandon,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct OperatorConfig {
    /// Maximum number of records awaiting a function result.
    pub max_in_flight: usize,
    /// Offsets of `input_schema` fields which are arguments of the function, in call order.
    pub input_field_offsets: Vec<usize>,
    /// Offsets of `input_schema` fields which are passed through into joined rows.
    pub forwarded_field_offsets: Vec<usize>,
    /// Schema of records given to the operator.
    pub input_schema: Schema,
    /// Schema of each function result.
    pub output_schema: Schema,
    /// What to do with in-flight calls on close.
    pub on_shutdown: ShutdownPolicy,
}

impl OperatorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_in_flight == 0 {
            return Err(Error::Config("maxInFlight must be at least one".to_string()));
        }
        if self.output_schema.is_empty() {
            return Err(Error::Config("outputSchema must have at least one field".to_string()));
        }
        let width = self.input_schema.width();

        for (name, offsets) in [
            ("inputFieldOffsets", &self.input_field_offsets),
            ("forwardedFieldOffsets", &self.forwarded_field_offsets),
        ] {
            if let Some(offset) = offsets.iter().find(|o| **o >= width) {
                return Err(Error::Config(format!(
                    "{name} offset {offset} is out of bounds for an input schema of width {width}"
                )));
            }
        }
        Ok(())
    }

    /// Schema of joined rows: forwarded fields, then function output fields.
    pub fn joined_schema(&self) -> Result<Schema> {
        let mut joined = self
            .input_schema
            .project(&self.forwarded_field_offsets)
            .map_err(|err| Error::Config(err.to_string()))?;
        joined.fields.extend(self.output_schema.fields.iter().cloned());
        Ok(joined)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use row_codec::{Field, LogicalType};
    use serde_json::json;

    fn fixture() -> OperatorConfig {
        serde_json::from_value(json!({
            "maxInFlight": 2,
            "inputFieldOffsets": [1, 2],
            "forwardedFieldOffsets": [0],
            "inputSchema": [
                {"name": "id", "type": "bigint", "nullable": false},
                {"name": "a", "type": "int"},
                {"name": "b", "type": "int"},
            ],
            "outputSchema": [
                {"name": "sum", "type": "int"},
            ],
            "onShutdown": "drain",
        }))
        .unwrap()
    }

    #[test]
    fn test_parse_and_validate() {
        let config = fixture();
        config.validate().unwrap();

        assert_eq!(config.on_shutdown, ShutdownPolicy::Drain);
        assert_eq!(
            config.joined_schema().unwrap(),
            Schema::new(vec![
                Field::new("id", LogicalType::BigInt).not_null(),
                Field::new("sum", LogicalType::Int),
            ])
        );
    }

    #[test]
    fn test_shutdown_policy_is_required() {
        let mut value = serde_json::to_value(fixture()).unwrap();
        value.as_object_mut().unwrap().remove("onShutdown");

        let err = serde_json::from_value::<OperatorConfig>(value).unwrap_err();
        assert!(err.to_string().contains("missing field `onShutdown`"));
    }

    #[test]
    fn test_validation_errors() {
        let mut errors = Vec::new();

        let mut config = fixture();
        config.max_in_flight = 0;
        errors.push(config.validate().unwrap_err().to_string());

        let mut config = fixture();
        config.output_schema = Schema::default();
        errors.push(config.validate().unwrap_err().to_string());

        let mut config = fixture();
        config.input_field_offsets = vec![1, 3];
        errors.push(config.validate().unwrap_err().to_string());

        let mut config = fixture();
        config.forwarded_field_offsets = vec![7];
        errors.push(config.validate().unwrap_err().to_string());

        insta::assert_debug_snapshot!(errors, @r###"
        [
            "invalid operator configuration: maxInFlight must be at least one",
            "invalid operator configuration: outputSchema must have at least one field",
            "invalid operator configuration: inputFieldOffsets offset 3 is out of bounds for an input schema of width 3",
            "invalid operator configuration: forwardedFieldOffsets offset 7 is out of bounds for an input schema of width 3",
        ]
        "###);
    }
}
