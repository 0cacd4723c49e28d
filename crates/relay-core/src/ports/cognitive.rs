//! CognitiveProcessor port - モデル呼び出しの抽象化
//!
//! Prompt construction, credentials and the model client all live behind
//! this trait. The core only sees instructions in, text out.

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::{Payload, ProcessingError};

/// Opaque handle to a processor-side conversation (thread) so that related
/// calls can share context.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConversationHandle(String);

impl ConversationHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[async_trait]
pub trait CognitiveProcessor: Send + Sync {
    /// Submits `input` with `instructions`.
    ///
    /// Implementations that enforce their own deadline report it as
    /// [`ProcessingError::Timeout`].
    async fn invoke(
        &self,
        instructions: &str,
        input: &Payload,
        context: Option<&ConversationHandle>,
    ) -> Result<String, ProcessingError>;
}

/// Processor text as a JSON value: parsed when it is valid JSON, otherwise
/// kept as a string.
pub fn parse_response(text: &str) -> Value {
    serde_json::from_str(text.trim()).unwrap_or_else(|_| Value::String(text.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_response_prefers_json() {
        assert_eq!(parse_response("6"), json!(6));
        assert_eq!(parse_response(" {\"a\": 1} "), json!({"a": 1}));
        assert_eq!(parse_response("plain words"), json!("plain words"));
    }
}
