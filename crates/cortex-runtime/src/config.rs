//! Declarative runtime configuration.
//!
//! A configuration document is TOML (`.toml`) or JSON (`.json`) and comes in
//! two shapes:
//!
//! **Single mode** – one static plugin set:
//!
//! ```toml
//! hertz = 1.0
//! system_prompt_base = "You are a friendly robot dog."
//! system_governance = "Never run indoors."
//!
//! [reasoner]
//! type = "openai"
//! config = { model = "llama3" }
//!
//! [[inputs]]
//! type = "asr"
//!
//! [[actions]]
//! type = "speak"
//! config = { timeout_ms = 3000 }
//!
//! [runtime]
//! reasoner_timeout_ms = 8000
//! ```
//!
//! **Multi mode** – `default_mode` plus a `[modes.<name>]` table per mode,
//! each carrying the single-mode keys.  A mode without its own `hertz` uses
//! the document-level value.  Optional `[[transitions]]` entries switch modes
//! when an observation contains one of the listed keywords.
//!
//! Required keys are checked on the raw document before typed parsing, so a
//! missing key is reported by its path (e.g. `modes.patrol.reasoner`).
//!
//! # Environment variables
//!
//! | Variable | Effect |
//! |---|---|
//! | `CORTEX_HERTZ` | Overrides every loop frequency in the document. |
//! | `CORTEX_DEFAULT_MODE` | Overrides `default_mode` (multi mode only). |
//! | `CORTEX_REASONER_TIMEOUT_MS` | Overrides `runtime.reasoner_timeout_ms`. |
//!
//! Values that do not parse are ignored.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use cortex_types::{CortexError, PluginConfig, PluginDescriptor, PluginRole};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Errors raised while loading a configuration document.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Unsupported config format '{0}' (expected .toml or .json)")]
    UnsupportedFormat(String),
    #[error("Failed to parse TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Missing required configuration key: {0}")]
    MissingKey(String),
    #[error("Unknown mode '{0}'")]
    UnknownMode(String),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<ConfigError> for CortexError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::MissingKey(key) => CortexError::MissingConfigKey(key),
            ConfigError::UnknownMode(mode) => CortexError::UnknownMode(mode),
            other => CortexError::InvalidConfig(other.to_string()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Typed model
// ─────────────────────────────────────────────────────────────────────────────

/// One plugin entry: `{type, name?, config}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginEntry {
    #[serde(rename = "type")]
    pub type_name: String,
    /// Instance name; defaults to the type name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub config: PluginConfig,
}

impl PluginEntry {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            name: None,
            config: PluginConfig::new(),
        }
    }

    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn instance_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.type_name)
    }

    pub fn descriptor(&self, role: PluginRole) -> PluginDescriptor {
        PluginDescriptor::new(role, self.type_name.clone()).with_config(self.config.clone())
    }
}

/// Plugin set and prompt text of one mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hertz: Option<f64>,
    pub system_prompt_base: String,
    #[serde(default)]
    pub system_governance: String,
    #[serde(default)]
    pub system_prompt_examples: String,
    #[serde(default)]
    pub inputs: Vec<PluginEntry>,
    pub reasoner: PluginEntry,
    #[serde(default)]
    pub actions: Vec<PluginEntry>,
    /// Observations older than this are treated as empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_stale_after_ms: Option<u64>,
    /// Leave the mode for `on_timeout` after this long.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_duration_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_timeout: Option<String>,
}

impl ModeConfig {
    pub fn new(system_prompt_base: impl Into<String>, reasoner: PluginEntry) -> Self {
        Self {
            hertz: None,
            system_prompt_base: system_prompt_base.into(),
            system_governance: String::new(),
            system_prompt_examples: String::new(),
            inputs: Vec::new(),
            reasoner,
            actions: Vec::new(),
            input_stale_after_ms: None,
            max_duration_secs: None,
            on_timeout: None,
        }
    }

    pub fn with_input(mut self, entry: PluginEntry) -> Self {
        self.inputs.push(entry);
        self
    }

    pub fn with_action(mut self, entry: PluginEntry) -> Self {
        self.actions.push(entry);
        self
    }

    /// Every plugin descriptor of this mode, reasoner first.
    pub fn descriptors(&self) -> Vec<PluginDescriptor> {
        let mut out = vec![self.reasoner.descriptor(PluginRole::Reasoner)];
        out.extend(self.inputs.iter().map(|e| e.descriptor(PluginRole::Input)));
        out.extend(self.actions.iter().map(|e| e.descriptor(PluginRole::Action)));
        out
    }

    pub fn stale_after(&self) -> Option<Duration> {
        self.input_stale_after_ms.map(Duration::from_millis)
    }

    pub fn max_duration(&self) -> Option<Duration> {
        self.max_duration_secs.map(Duration::from_secs)
    }
}

/// Timing knobs shared by every mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    pub reasoner_timeout_ms: u64,
    pub action_timeout_ms: u64,
    pub drain_deadline_ms: u64,
    /// Consecutive Reasoner failures before entering the degraded state.
    pub failure_threshold: u32,
    pub degraded_cooldown_ms: u64,
    pub max_backoff_ms: u64,
    /// Extra attempts within one tick after a Reasoner error.
    pub reasoner_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            reasoner_timeout_ms: 10_000,
            action_timeout_ms: 5_000,
            drain_deadline_ms: 2_000,
            failure_threshold: 3,
            degraded_cooldown_ms: 5_000,
            max_backoff_ms: 60_000,
            reasoner_retries: 1,
            retry_backoff_ms: 250,
        }
    }
}

impl RuntimeSettings {
    pub fn reasoner_timeout(&self) -> Duration {
        Duration::from_millis(self.reasoner_timeout_ms)
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_millis(self.action_timeout_ms)
    }

    pub fn drain_deadline(&self) -> Duration {
        Duration::from_millis(self.drain_deadline_ms)
    }

    pub fn degraded_cooldown(&self) -> Duration {
        Duration::from_millis(self.degraded_cooldown_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Single-mode document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub hertz: f64,
    #[serde(flatten)]
    pub mode: ModeConfig,
    #[serde(default)]
    pub runtime: RuntimeSettings,
}

impl AgentConfig {
    pub fn new(hertz: f64, mode: ModeConfig) -> Self {
        Self {
            hertz,
            mode,
            runtime: RuntimeSettings::default(),
        }
    }
}

/// Keyword-triggered mode transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRule {
    /// Source mode, or `"*"` for any.
    #[serde(default = "any_mode")]
    pub from: String,
    pub to: String,
    pub keywords: Vec<String>,
}

fn any_mode() -> String {
    "*".to_string()
}

impl TransitionRule {
    /// `true` when the rule applies in `current` and some observation
    /// contains one of its keywords (case-insensitive).
    pub fn matches<S: AsRef<str>>(&self, current: &str, observations: &[S]) -> bool {
        if self.to == current || (self.from != "*" && self.from != current) {
            return false;
        }
        observations.iter().any(|obs| {
            let obs = obs.as_ref().to_lowercase();
            self.keywords
                .iter()
                .any(|k| !k.trim().is_empty() && obs.contains(&k.trim().to_lowercase()))
        })
    }
}

/// Multi-mode document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiModeConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hertz: Option<f64>,
    pub default_mode: String,
    pub modes: BTreeMap<String, ModeConfig>,
    #[serde(default)]
    pub transitions: Vec<TransitionRule>,
    #[serde(default)]
    pub runtime: RuntimeSettings,
}

impl MultiModeConfig {
    pub fn mode(&self, name: &str) -> Result<&ModeConfig, CortexError> {
        self.modes
            .get(name)
            .ok_or_else(|| CortexError::UnknownMode(name.to_string()))
    }

    /// Loop frequency of `name`, falling back to the document-level value.
    pub fn hertz_for(&self, name: &str) -> Result<f64, CortexError> {
        let mode = self.mode(name)?;
        mode.hertz
            .or(self.hertz)
            .ok_or_else(|| CortexError::MissingConfigKey(format!("modes.{name}.hertz")))
    }

    pub fn mode_names(&self) -> Vec<String> {
        self.modes.keys().cloned().collect()
    }
}

/// A parsed configuration document.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeConfig {
    Single(AgentConfig),
    Multi(MultiModeConfig),
}

impl RuntimeConfig {
    pub fn settings(&self) -> &RuntimeSettings {
        match self {
            RuntimeConfig::Single(c) => &c.runtime,
            RuntimeConfig::Multi(c) => &c.runtime,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Loading
// ─────────────────────────────────────────────────────────────────────────────

/// Document syntax.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Toml,
    Json,
}

impl Format {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("toml") => Ok(Format::Toml),
            Some(ext) if ext.eq_ignore_ascii_case("json") => Ok(Format::Json),
            other => Err(ConfigError::UnsupportedFormat(other.unwrap_or("").to_string())),
        }
    }
}

/// Load, validate and apply environment overrides to the document at `path`.
pub fn load(path: &Path) -> Result<RuntimeConfig, ConfigError> {
    let format = Format::from_path(path)?;
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut config = parse_str(&raw, format)?;
    apply_env_overrides(&mut config);
    validate(&config)?;
    debug!(path = %path.display(), "configuration loaded");
    Ok(config)
}

/// Parse and validate a document without touching the environment.
pub fn parse_str(raw: &str, format: Format) -> Result<RuntimeConfig, ConfigError> {
    let doc: Value = match format {
        Format::Toml => toml::from_str(raw)?,
        Format::Json => serde_json::from_str(raw)?,
    };
    from_value(doc)
}

/// Build a configuration from an already-parsed document.
pub fn from_value(doc: Value) -> Result<RuntimeConfig, ConfigError> {
    check_required(&doc)?;
    let is_multi = doc.get("modes").is_some();
    let config = if is_multi {
        RuntimeConfig::Multi(serde_json::from_value(doc)?)
    } else {
        RuntimeConfig::Single(serde_json::from_value(doc)?)
    };
    validate(&config)?;
    Ok(config)
}

fn require(table: &Map<String, Value>, prefix: &str, keys: &[&str]) -> Result<(), ConfigError> {
    for key in keys {
        if table.get(*key).is_none_or(Value::is_null) {
            return Err(ConfigError::MissingKey(format!("{prefix}{key}")));
        }
    }
    Ok(())
}

fn check_plugins(table: &Map<String, Value>, prefix: &str) -> Result<(), ConfigError> {
    if let Some(reasoner) = table.get("reasoner") {
        let reasoner = reasoner
            .as_object()
            .ok_or_else(|| ConfigError::Invalid(format!("{prefix}reasoner must be a table")))?;
        require(reasoner, &format!("{prefix}reasoner."), &["type"])?;
    }
    for list in ["inputs", "actions"] {
        let Some(entries) = table.get(list) else { continue };
        let entries = entries
            .as_array()
            .ok_or_else(|| ConfigError::Invalid(format!("{prefix}{list} must be a list")))?;
        for (i, entry) in entries.iter().enumerate() {
            let entry = entry
                .as_object()
                .ok_or_else(|| ConfigError::Invalid(format!("{prefix}{list}[{i}] must be a table")))?;
            require(entry, &format!("{prefix}{list}[{i}]."), &["type"])?;
        }
    }
    Ok(())
}

fn check_required(doc: &Value) -> Result<(), ConfigError> {
    let root = doc
        .as_object()
        .ok_or_else(|| ConfigError::Invalid("document root must be a table".into()))?;

    if root.get("modes").is_none() {
        require(root, "", &["hertz", "system_prompt_base", "reasoner"])?;
        return check_plugins(root, "");
    }

    require(root, "", &["default_mode", "modes"])?;
    let modes = root
        .get("modes")
        .and_then(Value::as_object)
        .ok_or_else(|| ConfigError::Invalid("modes must be a table".into()))?;
    if modes.is_empty() {
        return Err(ConfigError::Invalid("modes must declare at least one mode".into()));
    }
    for (name, mode) in modes {
        let prefix = format!("modes.{name}.");
        let mode = mode
            .as_object()
            .ok_or_else(|| ConfigError::Invalid(format!("modes.{name} must be a table")))?;
        require(mode, &prefix, &["system_prompt_base", "reasoner"])?;
        if mode.get("hertz").is_none() && root.get("hertz").is_none() {
            return Err(ConfigError::MissingKey(format!("{prefix}hertz")));
        }
        check_plugins(mode, &prefix)?;
    }
    Ok(())
}

fn check_hertz(hertz: f64, key: &str) -> Result<(), ConfigError> {
    if hertz.is_finite() && hertz > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!("{key} must be a positive number, got {hertz}")))
    }
}

/// Semantic checks that need the typed model.
pub fn validate(config: &RuntimeConfig) -> Result<(), ConfigError> {
    match config {
        RuntimeConfig::Single(c) => check_hertz(c.hertz, "hertz"),
        RuntimeConfig::Multi(c) => {
            if !c.modes.contains_key(&c.default_mode) {
                return Err(ConfigError::UnknownMode(c.default_mode.clone()));
            }
            for (name, mode) in &c.modes {
                let hertz = mode
                    .hertz
                    .or(c.hertz)
                    .ok_or_else(|| ConfigError::MissingKey(format!("modes.{name}.hertz")))?;
                check_hertz(hertz, &format!("modes.{name}.hertz"))?;
                match (&mode.max_duration_secs, &mode.on_timeout) {
                    (Some(_), Some(target)) if !c.modes.contains_key(target) => {
                        return Err(ConfigError::UnknownMode(target.clone()));
                    }
                    (Some(_), None) => {
                        return Err(ConfigError::MissingKey(format!("modes.{name}.on_timeout")));
                    }
                    _ => {}
                }
            }
            for rule in &c.transitions {
                for target in [&rule.to, &rule.from] {
                    if target != "*" && !c.modes.contains_key(target) {
                        return Err(ConfigError::UnknownMode(target.clone()));
                    }
                }
            }
            Ok(())
        }
    }
}

/// Apply `CORTEX_*` environment overrides to `config`.
pub fn apply_env_overrides(config: &mut RuntimeConfig) {
    apply_overrides_from(config, |key| std::env::var(key).ok());
}

/// Apply `CORTEX_*` overrides read through `lookup` instead of the process
/// environment.
pub fn apply_overrides_from<F>(config: &mut RuntimeConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let hertz = lookup("CORTEX_HERTZ")
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|h| h.is_finite() && *h > 0.0);
    let timeout = lookup("CORTEX_REASONER_TIMEOUT_MS").and_then(|v| v.trim().parse::<u64>().ok());

    match config {
        RuntimeConfig::Single(c) => {
            if let Some(h) = hertz {
                c.hertz = h;
            }
            if let Some(ms) = timeout {
                c.runtime.reasoner_timeout_ms = ms;
            }
        }
        RuntimeConfig::Multi(c) => {
            if let Some(h) = hertz {
                c.hertz = Some(h);
                for mode in c.modes.values_mut() {
                    mode.hertz = Some(h);
                }
            }
            if let Some(ms) = timeout {
                c.runtime.reasoner_timeout_ms = ms;
            }
            if let Some(mode) = lookup("CORTEX_DEFAULT_MODE")
                && !mode.trim().is_empty()
            {
                c.default_mode = mode.trim().to_string();
            }
        }
    }
}
