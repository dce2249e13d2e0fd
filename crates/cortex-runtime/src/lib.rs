//! `cortex-runtime` – The tick loop
//!
//! Turns a configuration document and a [`CapabilityRegistry`] into a running
//! agent: inputs fill buffers in the background, and every tick fuses them
//! into a prompt, asks the Reasoner for action calls and dispatches those
//! calls concurrently.
//!
//! # Modules
//!
//! - [`config`] – TOML/JSON documents for single- and multi-mode agents,
//!   required-key validation, `CORTEX_*` environment overrides.
//! - [`invocation`] – [`ReasonerInvocation`]: timeout, retry with backoff,
//!   structured-output parsing and failure counting for one Reasoner.
//! - [`failure_guard`] – [`FailureGuard`]: consecutive-failure counter that
//!   trips the degraded state.
//! - [`dispatcher`] – [`ActionDispatcher`]: schema gate, per-action timeout,
//!   concurrent execution with per-action isolation.
//! - [`instance`] – [`ActiveMode`]: one live plugin set and its tick.
//! - [`agent_loop`] – [`AgentRuntime`]: single-mode lifecycle and periodic
//!   loop.
//! - [`mode_manager`] – [`ModeRuntime`]: multi-mode orchestration with the
//!   drain / teardown / rebuild switch protocol.
//! - [`llm_driver`] – [`OpenAiReasoner`]: built-in OpenAI-compatible
//!   Reasoner (Ollama, vLLM, OpenAI …).
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: `tracing`
//!   subscriber with optional OTLP export.
//! - `testing` – stub plugins for tests (`testing` feature).
//!
//! # Example
//!
//! ```rust,no_run
//! use cortex_runtime::{RuntimeConfig, builtin_registry, config, AgentRuntime, ModeRuntime};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let _guard = cortex_runtime::telemetry::init_tracing("cortex");
//! let shutdown = CancellationToken::new();
//! match config::load("agent.toml".as_ref())? {
//!     RuntimeConfig::Single(agent) => {
//!         AgentRuntime::new(&agent, &builtin_registry())?.run(shutdown).await;
//!     }
//!     RuntimeConfig::Multi(modes) => {
//!         ModeRuntime::new(modes, builtin_registry())?.run(shutdown).await?;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod agent_loop;
pub mod config;
pub mod dispatcher;
pub mod failure_guard;
pub mod instance;
pub mod invocation;
pub mod llm_driver;
pub mod mode_manager;
pub mod telemetry;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use agent_loop::AgentRuntime;
pub use config::{AgentConfig, ConfigError, ModeConfig, MultiModeConfig, PluginEntry, RuntimeConfig, RuntimeSettings};
pub use dispatcher::ActionDispatcher;
pub use failure_guard::FailureGuard;
pub use instance::ActiveMode;
pub use invocation::{InvocationPolicy, Invoked, ReasonerInvocation};
pub use llm_driver::{CompletionError, OpenAiReasoner};
pub use mode_manager::{ModeController, ModeRuntime, RuntimeStatus, SWITCH_MODE_ACTION};
pub use telemetry::{TelemetryGuard, TelemetrySettings, init_tracing};

use cortex_plugin::{CapabilityRegistry, PluginSource, RegistryBuilder};

/// Plugins shipped with this crate: the `openai` Reasoner.
pub struct BuiltinPlugins;

impl PluginSource for BuiltinPlugins {
    fn name(&self) -> &str {
        "builtin"
    }

    fn register(&self, builder: &mut RegistryBuilder) {
        OpenAiReasoner::register(builder);
    }
}

/// Registry holding only [`BuiltinPlugins`].
pub fn builtin_registry() -> CapabilityRegistry {
    registry_with(&[])
}

/// Registry holding [`BuiltinPlugins`] followed by `sources`.
pub fn registry_with(sources: &[&dyn PluginSource]) -> CapabilityRegistry {
    let mut all: Vec<&dyn PluginSource> = vec![&BuiltinPlugins];
    all.extend_from_slice(sources);
    CapabilityRegistry::discover(&all)
}
