//! Generic `ActionConnector` trait for actuators, speech synthesis, motion
//! commands and any other side effect the agent can request.
//!
//! Connectors declare their arguments through an
//! [`ActionSchema`][cortex_types::ActionSchema].  The schema drives three
//! things: the action catalogue line in the prompt, the JSON Schema handed to
//! the Reasoner, and validation/repair of incoming arguments.  By the time
//! [`ActionConnector::execute`] is called the arguments have already passed
//! that validation.

use async_trait::async_trait;
use cortex_types::{ActionSchema, CortexError};
use serde_json::{Map, Value};

/// Executes one kind of action against the outside world.
#[async_trait]
pub trait ActionConnector: Send + Sync {
    /// The declared argument schema.  Its `name` is the action name the
    /// Reasoner must use.
    fn schema(&self) -> &ActionSchema;

    /// Action name; defaults to the schema name.
    fn name(&self) -> &str {
        &self.schema().name
    }

    /// Perform the action.
    ///
    /// # Errors
    ///
    /// Returns [`CortexError::ActionFailed`] when the connector cannot apply
    /// the command.  The failure is isolated to this invocation.
    async fn execute(&self, arguments: &Map<String, Value>) -> Result<Value, CortexError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use cortex_types::{FieldKind, FieldSpec};
    use serde_json::json;

    struct MockSpeaker {
        schema: ActionSchema,
    }

    #[async_trait]
    impl ActionConnector for MockSpeaker {
        fn schema(&self) -> &ActionSchema {
            &self.schema
        }

        async fn execute(&self, arguments: &Map<String, Value>) -> Result<Value, CortexError> {
            match arguments.get("text").and_then(Value::as_str) {
                Some(text) => Ok(json!({"spoken": text})),
                None => Err(CortexError::ActionFailed {
                    action: "speak".into(),
                    details: "nothing to say".into(),
                }),
            }
        }
    }

    #[tokio::test]
    async fn name_defaults_to_schema_name() {
        let speaker = MockSpeaker {
            schema: ActionSchema::new("speak", "Say something.")
                .field(FieldSpec::required("text", FieldKind::String)),
        };
        assert_eq!(speaker.name(), "speak");

        let mut args = Map::new();
        args.insert("text".into(), json!("hi"));
        assert_eq!(speaker.execute(&args).await.unwrap(), json!({"spoken": "hi"}));
        assert!(speaker.execute(&Map::new()).await.is_err());
    }
}
