//! [`AgentRuntime`] – the single-mode tick loop.
//!
//! ```text
//! INIT ──▶ READY ──▶ TICKING ⇄ DEGRADED ──▶ SHUTDOWN
//! ```
//!
//! * **INIT** – [`AgentRuntime::new`] instantiates every plugin of the
//!   configured mode.  Unknown plugin types or bad plugin configuration fail
//!   here, before anything runs.
//! * **READY → TICKING** – [`AgentRuntime::start`] (or the first
//!   [`tick`][AgentRuntime::tick]) spawns one background task per input.
//! * **TICKING ⇄ DEGRADED** – see [`ActiveMode`].
//! * **SHUTDOWN** – [`AgentRuntime::run`] stops when its cancellation token
//!   fires.  An in-flight tick gets the drain deadline to finish; after that
//!   it is dropped, which cancels the Reasoner call and every running action.
//!
//! Ticks are spaced by the loop period measured from the start of the
//! previous tick.  A tick that overruns its period is followed immediately by
//! the next one; missed periods are not made up.
//!
//! # Example
//!
//! ```rust,no_run
//! use cortex_runtime::agent_loop::AgentRuntime;
//! use cortex_runtime::config::{self, RuntimeConfig};
//! use cortex_runtime::builtin_registry;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let RuntimeConfig::Single(agent) = config::load("agent.toml".as_ref())? else {
//!     return Err("expected a single-mode document".into());
//! };
//! let runtime = AgentRuntime::new(&agent, &builtin_registry())?;
//! let shutdown = CancellationToken::new();
//! runtime.run(shutdown.clone()).await;
//! # Ok(())
//! # }
//! ```

use std::pin::pin;

use cortex_plugin::CapabilityRegistry;
use cortex_types::{CortexError, RuntimeState, TickReport};
use tokio::sync::watch;
use tokio::time::{Instant, sleep_until, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{AgentConfig, RuntimeSettings};
use crate::instance::ActiveMode;

/// Drives one [`ActiveMode`] until shut down.
pub struct AgentRuntime {
    active: ActiveMode,
    settings: RuntimeSettings,
    state_tx: watch::Sender<RuntimeState>,
}

impl AgentRuntime {
    /// Instantiate every plugin named in `config`.
    ///
    /// # Errors
    ///
    /// Configuration errors only: unknown or ambiguous plugin types, missing
    /// plugin config keys, invalid timing values.
    pub fn new(config: &AgentConfig, registry: &CapabilityRegistry) -> Result<Self, CortexError> {
        let (state_tx, _) = watch::channel(RuntimeState::Init);
        let active = ActiveMode::build(registry, None, &config.mode, config.hertz, &config.runtime, &[])?;
        state_tx.send_replace(RuntimeState::Ready);
        info!(hertz = config.hertz, "agent runtime ready");
        Ok(Self {
            active,
            settings: config.runtime.clone(),
            state_tx,
        })
    }

    pub fn state(&self) -> RuntimeState {
        *self.state_tx.borrow()
    }

    /// Follow state transitions.
    pub fn subscribe(&self) -> watch::Receiver<RuntimeState> {
        self.state_tx.subscribe()
    }

    pub fn active(&self) -> &ActiveMode {
        &self.active
    }

    /// Overwrite the buffer of input `name` (operator injection, tests).
    pub fn set_input(&self, name: &str, text: impl Into<String>) -> Result<(), CortexError> {
        self.active.set_input(name, text)
    }

    /// Start the input tasks.  Idempotent.
    pub fn start(&mut self) {
        self.active.start();
        self.publish();
    }

    /// Run exactly one tick.
    pub async fn tick(&mut self) -> TickReport {
        let report = self.active.tick().await;
        self.publish();
        report
    }

    fn publish(&self) {
        let state = self.active.state();
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            info!(from = %current, to = %state, "runtime state changed");
            *current = state;
            true
        });
    }

    /// Tick at the configured frequency until `shutdown` is cancelled, then
    /// shut down.
    pub async fn run(mut self, shutdown: CancellationToken) {
        self.start();
        let drain = self.settings.drain_deadline();

        loop {
            let started = Instant::now();
            let interrupted = {
                let mut tick = pin!(self.active.tick());
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => {
                        self.state_tx.send_replace(RuntimeState::Draining);
                        if timeout(drain, &mut tick).await.is_err() {
                            warn!(
                                drain_ms = drain.as_millis() as u64,
                                "in-flight tick exceeded the drain deadline; cancelled"
                            );
                        }
                        true
                    }
                    _ = &mut tick => false,
                }
            };
            if interrupted {
                break;
            }
            self.publish();

            let next = started + self.active.next_period();
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = sleep_until(next) => {}
            }
        }

        self.shutdown().await;
    }

    /// Cancel the input tasks under the drain deadline and release every
    /// plugin.
    pub async fn shutdown(self) {
        let Self {
            active,
            settings,
            state_tx,
        } = self;
        state_tx.send_replace(RuntimeState::Draining);
        active.teardown(settings.drain_deadline()).await;
        state_tx.send_replace(RuntimeState::Shutdown);
        info!("agent runtime shut down");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::config::{ModeConfig, PluginEntry};
    use crate::testing::{
        ActionLog, ReasonerStep, ScriptedReasoner, StubPlugins, recording_factory, speak_schema,
    };
    use cortex_plugin::Reasoner;
    use serde_json::json;

    fn registry(reasoner: Arc<ScriptedReasoner>, log: &ActionLog) -> CapabilityRegistry {
        let mut builder = CapabilityRegistry::builder();
        builder
            .source(&StubPlugins)
            .reasoner("scripted", move |_| Ok(reasoner.clone() as Arc<dyn Reasoner>))
            .action("speak", recording_factory(speak_schema(), log.clone()));
        builder.build()
    }

    fn config(hertz: f64) -> AgentConfig {
        let mut config = AgentConfig::new(
            hertz,
            ModeConfig::new("You are a robot.", PluginEntry::new("scripted"))
                .with_input(PluginEntry::new("scripted").named("mic").with_setting("descriptor", "Voice"))
                .with_action(PluginEntry::new("speak")),
        );
        config.runtime.reasoner_timeout_ms = 200;
        config.runtime.reasoner_retries = 0;
        config.runtime.drain_deadline_ms = 100;
        config
    }

    #[test]
    fn unknown_reasoner_fails_at_init() {
        let log = ActionLog::default();
        let mut cfg = config(1.0);
        cfg.mode.reasoner = PluginEntry::new("oracle");
        let err = AgentRuntime::new(&cfg, &registry(ScriptedReasoner::replying(json!([])), &log))
            .err()
            .unwrap();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn lifecycle_states_are_published() {
        let log = ActionLog::default();
        let mut runtime = AgentRuntime::new(&config(1.0), &registry(ScriptedReasoner::replying(json!([])), &log))
            .unwrap();
        assert_eq!(runtime.state(), RuntimeState::Ready);
        let rx = runtime.subscribe();
        runtime.tick().await;
        assert_eq!(*rx.borrow(), RuntimeState::Ticking);
        runtime.shutdown().await;
        assert_eq!(*rx.borrow(), RuntimeState::Shutdown);
    }

    #[tokio::test(start_paused = true)]
    async fn run_ticks_at_the_configured_period() {
        let log = ActionLog::default();
        let reasoner = ScriptedReasoner::replying(json!([{"action": "speak", "arguments": {"text": "tick"}}]));
        let runtime = AgentRuntime::new(&config(10.0), &registry(reasoner.clone(), &log)).unwrap();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(runtime.run(shutdown.clone()));

        // Ticks at t = 0, 100, 200 ms.
        tokio::time::sleep(Duration::from_millis(250)).await;
        shutdown.cancel();
        handle.await.unwrap();
        assert_eq!(reasoner.calls(), 3);
        assert_eq!(log.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn overrunning_tick_is_followed_immediately() {
        let log = ActionLog::default();
        let reasoner = ScriptedReasoner::new([ReasonerStep::Delayed(Duration::from_millis(150), json!([]))]);
        let runtime = AgentRuntime::new(&config(10.0), &registry(reasoner.clone(), &log)).unwrap();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(runtime.run(shutdown.clone()));

        // First tick ends at 150 ms, second starts right away, third at 250 ms.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(reasoner.calls(), 2);
        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_a_hung_tick_within_the_drain_deadline() {
        let log = ActionLog::default();
        let reasoner = ScriptedReasoner::with_fallback([], ReasonerStep::Hang);
        let mut cfg = config(1.0);
        cfg.runtime.reasoner_timeout_ms = 60_000;
        let runtime = AgentRuntime::new(&cfg, &registry(reasoner, &log)).unwrap();
        let rx = runtime.subscribe();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(runtime.run(shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(10)).await;
        let cancelled_at = Instant::now();
        shutdown.cancel();
        handle.await.unwrap();
        assert!(cancelled_at.elapsed() < Duration::from_secs(1));
        assert_eq!(*rx.borrow(), RuntimeState::Shutdown);
    }
}
