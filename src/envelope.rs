use serde_json::{Map, Value};

use crate::WorkerError;

/// Decoded body of an inbound request.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestEnvelope {
    pub params: Value,
    pub metadata: Option<Value>,
}

impl RequestEnvelope {
    pub fn new(params: Value) -> Self {
        Self {
            params,
            metadata: None,
        }
    }

    /// Decodes a UTF-8 JSON object carrying at least `params`.
    ///
    /// Keys other than `params` and `metadata` are ignored.
    pub fn decode(payload: &[u8]) -> Result<Self, WorkerError> {
        let value: Value = serde_json::from_slice(payload)
            .map_err(|e| WorkerError::MalformedRequest(e.to_string()))?;

        let mut object: Map<String, Value> = match value {
            Value::Object(object) => object,
            other => {
                return Err(WorkerError::MalformedRequest(format!(
                    "expected a JSON object, got {}",
                    kind_of(&other)
                )))
            }
        };

        let params = object
            .remove("params")
            .ok_or_else(|| WorkerError::MalformedRequest("missing field `params`".into()))?;

        Ok(Self {
            params,
            metadata: object.remove("metadata"),
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, WorkerError> {
        let mut object = Map::new();
        object.insert("params".into(), self.params.clone());
        if let Some(metadata) = &self.metadata {
            object.insert("metadata".into(), metadata.clone());
        }
        Ok(serde_json::to_vec(&Value::Object(object))?)
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
