//! The standardized result shape returned by every node and graph (spec.md §3).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorType;

/// `{success, error, error_type, node_type, node_id, input, output, attributes}`.
///
/// Every node and graph `execute` call returns this. Because the shape is
/// uniform, transport encoding and UI rendering can treat all entities
/// identically (spec.md §9 "Result shape").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<ErrorType>,
    pub node_type: String,
    pub node_id: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub output: Value,
    #[serde(default)]
    pub attributes: Value,
}

impl NodeResult {
    pub fn ok(node_type: impl Into<String>, node_id: impl Into<String>, input: Value, output: Value) -> Self {
        Self {
            success: true,
            error: None,
            error_type: None,
            node_type: node_type.into(),
            node_id: node_id.into(),
            input,
            output,
            attributes: Value::Object(Default::default()),
        }
    }

    pub fn err(
        node_type: impl Into<String>,
        node_id: impl Into<String>,
        input: Value,
        error: impl Into<String>,
        error_type: ErrorType,
    ) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            error_type: Some(error_type),
            node_type: node_type.into(),
            node_id: node_id.into(),
            input,
            output: Value::Null,
            attributes: Value::Object(Default::default()),
        }
    }

    pub fn with_attributes(mut self, attributes: Value) -> Self {
        self.attributes = attributes;
        self
    }

    /// Validates the invariant `success == error.is_none() == error_type.is_none()`
    /// (spec.md §8). Used at boundaries (transports, tests) to catch drift.
    pub fn validate_shape(&self) -> Result<(), String> {
        if self.success != self.error.is_none() {
            return Err("success must imply error is None and vice versa".to_string());
        }
        if self.success != self.error_type.is_none() {
            return Err("success must imply error_type is None and vice versa".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_result_has_no_error() {
        let r = NodeResult::ok("bash", "sh", Value::Null, Value::String("hi".into()));
        assert!(r.success);
        assert!(r.validate_shape().is_ok());
    }

    #[test]
    fn err_result_carries_error_type() {
        let r = NodeResult::err("bash", "sh", Value::Null, "boom", ErrorType::Timeout);
        assert!(!r.success);
        assert_eq!(r.error_type, Some(ErrorType::Timeout));
        assert!(r.validate_shape().is_ok());
    }

    #[test]
    fn shape_violation_is_detected() {
        let mut r = NodeResult::ok("bash", "sh", Value::Null, Value::Null);
        r.error = Some("oops".to_string());
        assert!(r.validate_shape().is_err());
    }
}
