use crate::error::{ErrorPayload, ForemanError};
use serde::{Deserialize, Serialize};

/// A request to invoke one named engine operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Caller-chosen correlation id, echoed in the result.
    #[serde(default)]
    pub id: String,
    /// Operation name, e.g. `claim_task`.
    pub name: String,
    /// Structured argument record for the operation.
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// The outcome of a [`ToolCall`]: a success payload or a structured error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// The ID of the [`ToolCall`] this result corresponds to.
    pub call_id: String,
    /// Success payload; `null` on error.
    #[serde(default)]
    pub content: serde_json::Value,
    /// Present when the operation failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

impl ToolResult {
    /// Creates a successful result.
    pub fn success(call_id: impl Into<String>, content: serde_json::Value) -> Self {
        Self {
            call_id: call_id.into(),
            content,
            error: None,
        }
    }

    /// Creates an error result from an engine error.
    pub fn failure(call_id: impl Into<String>, err: &ForemanError) -> Self {
        Self {
            call_id: call_id.into(),
            content: serde_json::Value::Null,
            error: Some(err.to_payload()),
        }
    }

    /// Whether the operation failed.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    #[test]
    fn test_tool_result_success() {
        let result = ToolResult::success("call_1", serde_json::json!({"ok": true}));
        assert!(!result.is_error());
        assert_eq!(result.content["ok"], true);
    }

    #[test]
    fn test_tool_result_failure() {
        let result = ToolResult::failure("call_1", &ForemanError::Conflict("taken".into()));
        assert!(result.is_error());
        assert_eq!(result.error.unwrap().kind, ErrorKind::Conflict);
    }
}
