//! [`ActionDispatcher`] – validated, concurrent, isolated action execution.
//!
//! For each [`ActionInvocation`] of a tick the dispatcher:
//!
//! 1. looks up the bound connector by name (unknown →
//!    [`CortexError::ConnectorNotFound`]),
//! 2. validates and repairs the arguments through the kernel's
//!    [`SchemaGate`] (failure → [`CortexError::SchemaValidation`]),
//! 3. runs the connector on its own task under its own timeout.
//!
//! Rejections are reported per invocation and never stop siblings.  All
//! connectors of a tick run concurrently; a connector that fails, times out
//! or panics only affects its own [`ActionResult`].  Results come back in
//! invocation order once every task has finished.
//!
//! The tasks live in a [`JoinSet`], so dropping an in-flight
//! [`dispatch`][ActionDispatcher::dispatch] future (drain deadline, shutdown)
//! aborts every connector call it started.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use cortex_kernel::SchemaGate;
use cortex_plugin::ActionConnector;
use cortex_types::{ActionInvocation, ActionResult, ActionSchema, CortexError};
use serde_json::{Value, json};
use tokio::task::JoinSet;
use tokio::time::{Instant, timeout};
use tracing::{debug, info, warn};

/// A connector bound under an action name with its timeout.
#[derive(Clone)]
pub struct BoundAction {
    pub schema: ActionSchema,
    pub connector: Arc<dyn ActionConnector>,
    pub timeout: Duration,
}

/// Name → connector table for one mode.
#[derive(Default)]
pub struct ActionDispatcher {
    actions: Vec<BoundAction>,
    index: HashMap<String, usize>,
    gate: SchemaGate,
}

impl ActionDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `connector` under its own name.
    pub fn bind(&mut self, connector: Arc<dyn ActionConnector>, timeout: Duration) -> Result<(), CortexError> {
        let name = connector.name().to_string();
        self.bind_as(name, connector, timeout)
    }

    /// Bind `connector` under `name`.
    ///
    /// # Errors
    ///
    /// [`CortexError::InvalidConfig`] when `name` is already bound.
    pub fn bind_as(
        &mut self,
        name: impl Into<String>,
        connector: Arc<dyn ActionConnector>,
        timeout: Duration,
    ) -> Result<(), CortexError> {
        let name = name.into();
        if self.index.contains_key(&name) {
            return Err(CortexError::InvalidConfig(format!(
                "action '{name}' is bound more than once"
            )));
        }
        let mut schema = connector.schema().clone();
        schema.name = name.clone();
        self.gate.register(schema.clone());
        self.index.insert(name, self.actions.len());
        self.actions.push(BoundAction {
            schema,
            connector,
            timeout,
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Bound action names in binding order.
    pub fn names(&self) -> Vec<&str> {
        self.actions.iter().map(|a| a.schema.name.as_str()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&BoundAction> {
        self.index.get(name).map(|&i| &self.actions[i])
    }

    /// One-line description per bound action, in binding order.
    pub fn catalogue(&self) -> Vec<String> {
        self.actions.iter().map(|a| a.schema.describe()).collect()
    }

    /// JSON Schema of the structured reply expected from the Reasoner:
    /// `{"actions": [{"action": <name>, "arguments": {...}}, ...]}`.
    pub fn response_schema(&self) -> Value {
        let items = if self.actions.is_empty() {
            json!({"type": "object"})
        } else {
            let variants: Vec<Value> = self
                .actions
                .iter()
                .map(|a| {
                    json!({
                        "type": "object",
                        "properties": {
                            "action": {"type": "string", "enum": [a.schema.name]},
                            "arguments": a.schema.to_json_schema(),
                        },
                        "required": ["action", "arguments"],
                    })
                })
                .collect();
            json!({"anyOf": variants})
        };
        let mut actions = json!({"type": "array", "items": items});
        if self.actions.is_empty() {
            actions["maxItems"] = json!(0);
        }
        json!({
            "type": "object",
            "properties": {"actions": actions},
            "required": ["actions"],
        })
    }

    /// Validate and execute `invocations` concurrently.
    ///
    /// Returns exactly one [`ActionResult`] per invocation, in order.
    pub async fn dispatch(&self, invocations: &[ActionInvocation]) -> Vec<ActionResult> {
        let mut results: Vec<Option<ActionResult>> = vec![None; invocations.len()];
        let mut tasks = JoinSet::new();

        for (slot, invocation) in invocations.iter().enumerate() {
            let checked = match self.gate.check(invocation) {
                Ok(checked) => checked,
                Err(error) => {
                    warn!(action = %invocation.action_name, %error, "invocation rejected");
                    results[slot] = Some(ActionResult::rejected(invocation.action_name.clone(), error));
                    continue;
                }
            };
            let Some(bound) = self.get(&invocation.action_name) else {
                let error = CortexError::ConnectorNotFound(invocation.action_name.clone());
                results[slot] = Some(ActionResult::rejected(invocation.action_name.clone(), error));
                continue;
            };

            let name = bound.schema.name.clone();
            let connector = Arc::clone(&bound.connector);
            let limit = bound.timeout;
            let arguments = checked.invocation.arguments;
            debug!(action = %name, "dispatching");

            tasks.spawn(async move {
                let started = Instant::now();
                let result = match timeout(limit, connector.execute(&arguments)).await {
                    Ok(Ok(value)) => ActionResult::completed(name, value, started.elapsed()),
                    Ok(Err(error)) => ActionResult::failed(name, error, started.elapsed()),
                    Err(_) => {
                        let error = CortexError::ActionTimeout {
                            action: name.clone(),
                            timeout_ms: limit.as_millis() as u64,
                        };
                        ActionResult::failed(name, error, started.elapsed())
                    }
                };
                (slot, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((slot, result)) => {
                    match &result.outcome {
                        Ok(_) => info!(action = %result.action_name, elapsed_ms = result.elapsed_ms, "action completed"),
                        Err(error) => warn!(action = %result.action_name, elapsed_ms = result.elapsed_ms, %error, "action failed"),
                    }
                    results[slot] = Some(result);
                }
                Err(join_error) => warn!(error = %join_error, "action task aborted"),
            }
        }

        results
            .into_iter()
            .zip(invocations)
            .map(|(result, invocation)| {
                result.unwrap_or_else(|| {
                    ActionResult::rejected(
                        invocation.action_name.clone(),
                        CortexError::ActionFailed {
                            action: invocation.action_name.clone(),
                            details: "connector task panicked".into(),
                        },
                    )
                })
            })
            .collect()
    }
}
