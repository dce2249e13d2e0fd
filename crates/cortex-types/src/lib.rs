//! `cortex-types` – Shared data model for the Cortex agent runtime.
//!
//! Every crate in the workspace speaks in terms of these types:
//!
//! - [`PluginDescriptor`] – the `{role, type, config}` triple parsed from
//!   declarative configuration and handed to the capability registry.
//! - [`ActionInvocation`] / [`ActionResult`] – one structured action request
//!   produced by the Reasoner and the outcome of dispatching it.
//! - [`Observation`] – the latest text held by one input buffer.
//! - [`FusedPrompt`] – the two-part prompt the Fuser hands to the Reasoner.
//! - [`TickReport`] – what a single fuse → reason → dispatch pass did.
//! - [`schema`] – declarative argument schemas for action connectors.
//! - [`CortexError`] – the workspace-wide error taxonomy.

pub mod schema;

pub use schema::{ActionSchema, FieldKind, FieldSpec};

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// Opaque plugin configuration map, as written in the configuration document.
pub type PluginConfig = Map<String, Value>;

// ─────────────────────────────────────────────────────────────────────────────
// Plugins
// ─────────────────────────────────────────────────────────────────────────────

/// The three capability roles a pluggable component can fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginRole {
    /// Produces textual observations (ASR, vision captions, battery, …).
    Input,
    /// Turns a fused prompt into structured action invocations.
    Reasoner,
    /// Executes one kind of action against the outside world.
    Action,
}

impl fmt::Display for PluginRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginRole::Input => write!(f, "input"),
            PluginRole::Reasoner => write!(f, "reasoner"),
            PluginRole::Action => write!(f, "action"),
        }
    }
}

/// Declarative description of one plugin instance.
///
/// Immutable once a runtime has been built from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    pub role: PluginRole,
    /// Registered type name, e.g. `"openai"` or `"speak"`.
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub config: PluginConfig,
}

impl PluginDescriptor {
    pub fn new(role: PluginRole, type_name: impl Into<String>) -> Self {
        Self {
            role,
            type_name: type_name.into(),
            config: PluginConfig::new(),
        }
    }

    /// Replace the configuration map.
    pub fn with_config(mut self, config: PluginConfig) -> Self {
        self.config = config;
        self
    }

    /// Set a single configuration entry.
    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    /// Optional string setting.
    pub fn str_setting(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(Value::as_str)
    }

    /// Required string setting.
    ///
    /// # Errors
    ///
    /// Returns [`CortexError::MissingConfigKey`] naming `<type>.config.<key>`
    /// when the key is absent or not a string.
    pub fn require_str(&self, key: &str) -> Result<&str, CortexError> {
        self.str_setting(key).ok_or_else(|| {
            CortexError::MissingConfigKey(format!("{}.config.{key}", self.type_name))
        })
    }

    /// Optional unsigned integer setting.
    pub fn u64_setting(&self, key: &str) -> Option<u64> {
        self.config.get(key).and_then(Value::as_u64)
    }

    /// Optional millisecond duration setting.
    pub fn millis_setting(&self, key: &str) -> Option<Duration> {
        self.u64_setting(key).map(Duration::from_millis)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Actions
// ─────────────────────────────────────────────────────────────────────────────

/// One structured action request emitted by the Reasoner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionInvocation {
    #[serde(rename = "action")]
    pub action_name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

impl ActionInvocation {
    pub fn new(action_name: impl Into<String>, arguments: Map<String, Value>) -> Self {
        Self {
            action_name: action_name.into(),
            arguments,
        }
    }

    /// Invocation with no arguments.
    pub fn bare(action_name: impl Into<String>) -> Self {
        Self::new(action_name, Map::new())
    }

    pub fn argument(&self, key: &str) -> Option<&Value> {
        self.arguments.get(key)
    }
}

/// Renders as `speak(text="hi")`; arguments appear in key order.
impl fmt::Display for ActionInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.action_name)?;
        for (i, (key, value)) in self.arguments.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{key}={value}")?;
        }
        write!(f, ")")
    }
}

/// Outcome of dispatching one [`ActionInvocation`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub action_name: String,
    pub outcome: Result<Value, CortexError>,
    /// Wall-clock time spent in the connector (0 when never dispatched).
    pub elapsed_ms: u64,
}

impl ActionResult {
    pub fn completed(action_name: impl Into<String>, value: Value, elapsed: Duration) -> Self {
        Self {
            action_name: action_name.into(),
            outcome: Ok(value),
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    pub fn failed(action_name: impl Into<String>, error: CortexError, elapsed: Duration) -> Self {
        Self {
            action_name: action_name.into(),
            outcome: Err(error),
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    /// Result for an invocation that was rejected before reaching a connector.
    pub fn rejected(action_name: impl Into<String>, error: CortexError) -> Self {
        Self::failed(action_name, error, Duration::ZERO)
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Observations & prompt
// ─────────────────────────────────────────────────────────────────────────────

/// Most recent textual observation of one input plugin.
///
/// Replaced wholesale on every update; an empty `text` means the input has
/// not produced anything yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub text: String,
    pub updated_at: DateTime<Utc>,
}

impl Observation {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            updated_at: Utc::now(),
        }
    }

    /// The initial, empty observation.
    pub fn empty() -> Self {
        Self::new(String::new())
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }

    /// `true` when the observation was written more than `max_age` before `now`.
    pub fn is_stale(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        match chrono::Duration::from_std(max_age) {
            Ok(max_age) => now.signed_duration_since(self.updated_at) > max_age,
            Err(_) => false,
        }
    }
}

/// The prompt handed to the Reasoner on every tick.
///
/// `system_context` carries the static policy sections and is cached per
/// mode; `user_content` carries the live observations and the instruction
/// footer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FusedPrompt {
    pub system_context: String,
    pub user_content: String,
}

/// Summary of one tick, returned by the runtimes for logging and tests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickReport {
    pub tick_id: Uuid,
    /// Active mode, `None` for a single-mode runtime.
    pub mode: Option<String>,
    /// State the runtime was in while the tick ran.
    pub state: RuntimeState,
    pub prompt: FusedPrompt,
    /// Invocations that survived parsing and validation.
    pub invocations: Vec<ActionInvocation>,
    /// One entry per dispatched or rejected invocation, in Reasoner order.
    pub results: Vec<ActionResult>,
    /// `false` when the Reasoner timed out or failed on this tick.
    pub reasoner_ok: bool,
}

impl TickReport {
    pub fn new(state: RuntimeState, prompt: FusedPrompt) -> Self {
        Self {
            tick_id: Uuid::new_v4(),
            mode: None,
            state,
            prompt,
            invocations: Vec::new(),
            results: Vec::new(),
            reasoner_ok: true,
        }
    }

    /// Names of actions whose connector ran successfully.
    pub fn completed_actions(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|r| r.is_success())
            .map(|r| r.action_name.as_str())
            .collect()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Runtime state
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle state of a runtime (single- or multi-mode).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeState {
    Init,
    Ready,
    Ticking,
    /// Reduced cadence after repeated Reasoner failures.
    Degraded,
    /// A mode switch is in progress; no new ticks are admitted.
    Draining,
    Shutdown,
}

impl fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RuntimeState::Init => "init",
            RuntimeState::Ready => "ready",
            RuntimeState::Ticking => "ticking",
            RuntimeState::Degraded => "degraded",
            RuntimeState::Draining => "draining",
            RuntimeState::Shutdown => "shutdown",
        };
        f.write_str(label)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Global error type spanning configuration problems, Reasoner failures,
/// action failures and lifecycle issues.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CortexError {
    #[error("Unknown {role} plugin type '{type_name}'")]
    UnknownPlugin { role: PluginRole, type_name: String },

    #[error("Ambiguous {role} plugin type '{type_name}': {candidates} implementations registered")]
    AmbiguousPlugin {
        role: PluginRole,
        type_name: String,
        candidates: usize,
    },

    #[error("Missing required configuration key: {0}")]
    MissingConfigKey(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Schema validation failed for '{action}.{field}': {reason}")]
    SchemaValidation {
        action: String,
        field: String,
        reason: String,
    },

    #[error("No connector bound for action '{0}'")]
    ConnectorNotFound(String),

    #[error("Reasoner Error: {0}")]
    ReasonerFailed(String),

    #[error("Reasoner timed out after {timeout_ms} ms")]
    ReasonerTimeout { timeout_ms: u64 },

    #[error("Action '{action}' failed: {details}")]
    ActionFailed { action: String, details: String },

    #[error("Action '{action}' timed out after {timeout_ms} ms")]
    ActionTimeout { action: String, timeout_ms: u64 },

    #[error("Input '{plugin}' failed: {details}")]
    InputFailed { plugin: String, details: String },

    #[error("Unknown mode '{0}'")]
    UnknownMode(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Channel Error: {0}")]
    Channel(String),
}

impl CortexError {
    /// `true` for errors that stem from the configuration rather than from a
    /// transient external failure.  These are fatal at startup.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            CortexError::UnknownPlugin { .. }
                | CortexError::AmbiguousPlugin { .. }
                | CortexError::MissingConfigKey(_)
                | CortexError::InvalidConfig(_)
                | CortexError::UnknownMode(_)
        )
    }
}
