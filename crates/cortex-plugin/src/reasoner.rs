//! Generic `Reasoner` trait for language-model backends.
//!
//! The core treats a Reasoner as a black box with a structured-output
//! contract: it receives the fused prompt plus the JSON Schema of the
//! available actions and must answer with JSON describing a list of action
//! calls.  Any free-text cleanup a particular model needs (code fences,
//! leading prose) belongs in the implementation, not in the core.

use async_trait::async_trait;
use cortex_types::CortexError;
use serde_json::Value;

/// A language-model backend that decides which actions to take.
#[async_trait]
pub trait Reasoner: Send + Sync {
    /// Short identifier used in logs, e.g. `"openai:gpt-4o-mini"`.
    fn name(&self) -> &str;

    /// Ask the model for its next actions.
    ///
    /// `action_schema` is the JSON Schema of the expected response.  The
    /// returned value should be `{"actions": [...]}` or a bare array of
    /// `{"action": "<name>", "arguments": {...}}` objects.
    ///
    /// # Errors
    ///
    /// Returns [`CortexError::ReasonerFailed`] when the backend cannot be
    /// reached or answers with something that is not JSON.
    async fn ask(
        &self,
        system_context: &str,
        user_content: &str,
        action_schema: &Value,
    ) -> Result<Value, CortexError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoReasoner;

    #[async_trait]
    impl Reasoner for EchoReasoner {
        fn name(&self) -> &str {
            "echo"
        }

        async fn ask(&self, _system: &str, user: &str, _schema: &Value) -> Result<Value, CortexError> {
            Ok(json!([{"action": "speak", "arguments": {"text": user}}]))
        }
    }

    #[tokio::test]
    async fn reasoner_is_object_safe() {
        let reasoner: Box<dyn Reasoner> = Box::new(EchoReasoner);
        let reply = reasoner.ask("sys", "hello", &Value::Null).await.unwrap();
        assert_eq!(reply[0]["arguments"]["text"], "hello");
        assert_eq!(reasoner.name(), "echo");
    }
}
