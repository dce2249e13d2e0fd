//! Stub plugins for tests and local experiments.
//!
//! - [`ScriptedReasoner`] – replays a fixed list of [`ReasonerStep`]s and
//!   records every prompt it receives.
//! - [`RecordingAction`] – an action connector that appends every successful
//!   call to a shared [`ActionLog`]; its [`ActionBehavior`] can make it slow,
//!   failing, hanging or panicking.
//! - [`ScriptedInput`] – emits a fixed list of observations, then either
//!   stays silent or reports exhaustion.
//! - [`StubPlugins`] – registers [`ScriptedInput`] under the `scripted` input
//!   type so it can be used from configuration documents.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use cortex_plugin::{CapabilityRegistry, Reasoner};
//! use cortex_runtime::testing::{ActionLog, ScriptedReasoner, recording_factory, speak_schema};
//! use serde_json::json;
//!
//! let log = ActionLog::default();
//! let reasoner = ScriptedReasoner::replying(json!([]));
//!
//! let mut builder = CapabilityRegistry::builder();
//! let shared = Arc::clone(&reasoner);
//! builder
//!     .reasoner("scripted", move |_| Ok(shared.clone() as Arc<dyn Reasoner>))
//!     .action("speak", recording_factory(speak_schema(), log.clone()));
//! let registry = builder.build();
//! assert_eq!(registry.type_names(cortex_types::PluginRole::Action), vec!["speak"]);
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use cortex_plugin::{ActionConnector, InputPlugin, PluginSource, Reasoner, RegistryBuilder};
use cortex_types::{
    ActionInvocation, ActionSchema, CortexError, FieldKind, FieldSpec, FusedPrompt, PluginDescriptor,
};
use serde_json::{Map, Value, json};

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ─────────────────────────────────────────────────────────────────────────────
// Reasoner
// ─────────────────────────────────────────────────────────────────────────────

/// One scripted Reasoner reaction.
#[derive(Debug, Clone)]
pub enum ReasonerStep {
    Reply(Value),
    /// Reply after a delay.
    Delayed(Duration, Value),
    Fail(String),
    /// Never answer.
    Hang,
}

/// Reasoner that replays [`ReasonerStep`]s in order, then repeats its
/// fallback step.
pub struct ScriptedReasoner {
    steps: Mutex<VecDeque<ReasonerStep>>,
    fallback: ReasonerStep,
    prompts: Mutex<Vec<FusedPrompt>>,
    calls: AtomicUsize,
}

impl ScriptedReasoner {
    /// Replays `steps`, then answers `[]` forever.
    pub fn new(steps: impl IntoIterator<Item = ReasonerStep>) -> Arc<Self> {
        Self::with_fallback(steps, ReasonerStep::Reply(json!([])))
    }

    pub fn with_fallback(
        steps: impl IntoIterator<Item = ReasonerStep>,
        fallback: ReasonerStep,
    ) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into_iter().collect()),
            fallback,
            prompts: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        })
    }

    /// Always answers `reply`.
    pub fn replying(reply: Value) -> Arc<Self> {
        Self::with_fallback([], ReasonerStep::Reply(reply))
    }

    /// Append a step to the script.
    pub fn push(&self, step: ReasonerStep) {
        locked(&self.steps).push_back(step);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every prompt received so far, oldest first.
    pub fn prompts(&self) -> Vec<FusedPrompt> {
        locked(&self.prompts).clone()
    }
}

#[async_trait]
impl Reasoner for ScriptedReasoner {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn ask(
        &self,
        system_context: &str,
        user_content: &str,
        _action_schema: &Value,
    ) -> Result<Value, CortexError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        locked(&self.prompts).push(FusedPrompt {
            system_context: system_context.to_string(),
            user_content: user_content.to_string(),
        });
        let step = locked(&self.steps)
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        match step {
            ReasonerStep::Reply(value) => Ok(value),
            ReasonerStep::Delayed(delay, value) => {
                tokio::time::sleep(delay).await;
                Ok(value)
            }
            ReasonerStep::Fail(reason) => Err(CortexError::ReasonerFailed(reason)),
            ReasonerStep::Hang => std::future::pending().await,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Action
// ─────────────────────────────────────────────────────────────────────────────

/// Shared, ordered record of executed invocations.
#[derive(Clone, Default)]
pub struct ActionLog(Arc<Mutex<Vec<ActionInvocation>>>);

impl ActionLog {
    pub fn record(&self, invocation: ActionInvocation) {
        locked(&self.0).push(invocation);
    }

    pub fn entries(&self) -> Vec<ActionInvocation> {
        locked(&self.0).clone()
    }

    /// Entries rendered as `name(arg=value)`.
    pub fn rendered(&self) -> Vec<String> {
        locked(&self.0).iter().map(ToString::to_string).collect()
    }

    pub fn len(&self) -> usize {
        locked(&self.0).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// How a [`RecordingAction`] reacts to a call.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionBehavior {
    Succeed,
    /// Succeed after a delay.
    Delay(Duration),
    Fail(String),
    Hang,
    Panic,
}

/// Action connector that records successful calls.
pub struct RecordingAction {
    schema: ActionSchema,
    log: ActionLog,
    behavior: ActionBehavior,
}

impl RecordingAction {
    pub fn new(schema: ActionSchema, log: ActionLog) -> Self {
        Self::behaving(schema, log, ActionBehavior::Succeed)
    }

    pub fn behaving(schema: ActionSchema, log: ActionLog, behavior: ActionBehavior) -> Self {
        Self {
            schema,
            log,
            behavior,
        }
    }
}

#[async_trait]
impl ActionConnector for RecordingAction {
    fn schema(&self) -> &ActionSchema {
        &self.schema
    }

    async fn execute(&self, arguments: &Map<String, Value>) -> Result<Value, CortexError> {
        match &self.behavior {
            ActionBehavior::Succeed => {}
            ActionBehavior::Delay(delay) => tokio::time::sleep(*delay).await,
            ActionBehavior::Fail(details) => {
                return Err(CortexError::ActionFailed {
                    action: self.schema.name.clone(),
                    details: details.clone(),
                });
            }
            ActionBehavior::Hang => std::future::pending::<()>().await,
            ActionBehavior::Panic => panic!("{} connector panicked", self.schema.name),
        }
        self.log
            .record(ActionInvocation::new(self.schema.name.clone(), arguments.clone()));
        Ok(json!({"ok": true}))
    }
}

/// Registry factory producing a succeeding [`RecordingAction`].
pub fn recording_factory(
    schema: ActionSchema,
    log: ActionLog,
) -> impl Fn(&PluginDescriptor) -> Result<Arc<dyn ActionConnector>, CortexError> + Send + Sync + 'static {
    behaving_factory(schema, log, ActionBehavior::Succeed)
}

/// Registry factory producing a [`RecordingAction`] with `behavior`.
pub fn behaving_factory(
    schema: ActionSchema,
    log: ActionLog,
    behavior: ActionBehavior,
) -> impl Fn(&PluginDescriptor) -> Result<Arc<dyn ActionConnector>, CortexError> + Send + Sync + 'static {
    move |_| {
        Ok(Arc::new(RecordingAction::behaving(
            schema.clone(),
            log.clone(),
            behavior.clone(),
        )) as Arc<dyn ActionConnector>)
    }
}

/// `speak(text)` – one required string argument.
pub fn speak_schema() -> ActionSchema {
    ActionSchema::new("speak", "Say a sentence out loud.")
        .field(FieldSpec::required("text", FieldKind::String).describe("What to say"))
}

// ─────────────────────────────────────────────────────────────────────────────
// Input
// ─────────────────────────────────────────────────────────────────────────────

/// Input that emits a fixed list of observations.
pub struct ScriptedInput {
    descriptor: String,
    observations: VecDeque<String>,
    hold_open: bool,
}

impl ScriptedInput {
    /// Emits `observations`, then stays silent without ending.
    pub fn new(descriptor: impl Into<String>, observations: impl IntoIterator<Item = String>) -> Self {
        Self {
            descriptor: descriptor.into(),
            observations: observations.into_iter().collect(),
            hold_open: true,
        }
    }

    /// Report exhaustion (`Ok(None)`) once the script runs out.
    pub fn finite(mut self) -> Self {
        self.hold_open = false;
        self
    }

    /// Build from `{descriptor?, observations?, hold_open?}` configuration.
    pub fn from_descriptor(descriptor: &PluginDescriptor) -> Result<Self, CortexError> {
        let label = descriptor.str_setting("descriptor").unwrap_or("Input").to_string();
        let observations = match descriptor.config.get("observations") {
            None => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| {
                    item.as_str().map(str::to_string).ok_or_else(|| {
                        CortexError::InvalidConfig(format!(
                            "{}.config.observations must contain strings",
                            descriptor.type_name
                        ))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?,
            Some(_) => {
                return Err(CortexError::InvalidConfig(format!(
                    "{}.config.observations must be a list",
                    descriptor.type_name
                )));
            }
        };
        let mut input = Self::new(label, observations);
        if descriptor.config.get("hold_open").and_then(Value::as_bool) == Some(false) {
            input = input.finite();
        }
        Ok(input)
    }
}

#[async_trait]
impl InputPlugin for ScriptedInput {
    fn descriptor(&self) -> &str {
        &self.descriptor
    }

    async fn next_observation(&mut self) -> Result<Option<String>, CortexError> {
        if let Some(next) = self.observations.pop_front() {
            return Ok(Some(next));
        }
        if self.hold_open {
            std::future::pending::<()>().await;
        }
        Ok(None)
    }
}

/// Registers the `scripted` input type.
pub struct StubPlugins;

impl PluginSource for StubPlugins {
    fn name(&self) -> &str {
        "stub"
    }

    fn register(&self, builder: &mut RegistryBuilder) {
        builder.input("scripted", |descriptor| {
            Ok(Box::new(ScriptedInput::from_descriptor(descriptor)?) as Box<dyn InputPlugin>)
        });
    }
}
