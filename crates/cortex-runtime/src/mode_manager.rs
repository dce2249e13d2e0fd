//! [`ModeRuntime`] – multi-mode orchestration.
//!
//! Exactly one [`ActiveMode`] ticks at a time.  A switch is requested by
//!
//! 1. the Reasoner, through the reserved [`SWITCH_MODE_ACTION`] action that
//!    is bound in every mode when more than one mode is declared;
//! 2. an external caller, through [`ModeController::request_switch`];
//! 3. a keyword [`TransitionRule`][crate::config::TransitionRule] matching a
//!    current observation;
//! 4. a mode's `max_duration_secs` elapsing (switch to its `on_timeout`).
//!
//! Requests are considered in that order after each tick; among several
//! signals the latest valid one wins.  Unknown targets are logged and
//! ignored.
//!
//! # Switch protocol
//!
//! ```text
//! TICKING ──signal──▶ DRAINING ──▶ teardown(old) ──▶ build(new) ──▶ TICKING
//!                        │                              │ fails
//!                        │ in-flight tick gets          ▼
//!                        │ the drain deadline      build(old) again
//! ```
//!
//! Every plugin type of the target is resolved against the registry before
//! the current mode is touched; a switch to a mode that cannot resolve is
//! rejected outright.  [`RuntimeStatus`] only ever names one mode, and the
//! old mode's input tasks are gone before the new mode's are spawned.

use std::collections::BTreeMap;
use std::pin::pin;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cortex_plugin::{ActionConnector, CapabilityRegistry};
use cortex_types::{ActionSchema, CortexError, FieldKind, FieldSpec, RuntimeState, TickReport};
use serde_json::{Map, Value, json};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep_until, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ModeConfig, MultiModeConfig};
use crate::instance::ActiveMode;

/// Name of the reserved mode-switch action.
pub const SWITCH_MODE_ACTION: &str = "switch_mode";

/// Which mode is live and what it is doing.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeStatus {
    pub mode: String,
    pub state: RuntimeState,
    /// When `mode` was entered.
    pub since: DateTime<Utc>,
}

// ─────────────────────────────────────────────────────────────────────────────
// External control
// ─────────────────────────────────────────────────────────────────────────────

/// Cloneable handle for steering a running [`ModeRuntime`].
#[derive(Clone)]
pub struct ModeController {
    requests: mpsc::UnboundedSender<String>,
    status: watch::Receiver<RuntimeStatus>,
}

impl ModeController {
    /// Ask the runtime to switch to `mode` after the current tick.
    ///
    /// # Errors
    ///
    /// [`CortexError::Channel`] when the runtime is gone.
    pub fn request_switch(&self, mode: impl Into<String>) -> Result<(), CortexError> {
        self.requests
            .send(mode.into())
            .map_err(|_| CortexError::Channel("mode runtime has stopped".into()))
    }

    pub fn status(&self) -> RuntimeStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RuntimeStatus> {
        self.status.clone()
    }
}

/// The reserved `switch_mode(mode)` action.
pub struct ModeSwitchConnector {
    schema: ActionSchema,
    requests: mpsc::UnboundedSender<String>,
}

impl ModeSwitchConnector {
    pub fn new(mode_names: Vec<String>, requests: mpsc::UnboundedSender<String>) -> Self {
        let schema = ActionSchema::new(
            SWITCH_MODE_ACTION,
            "Switch the agent to another operating mode.",
        )
        .field(FieldSpec::required("mode", FieldKind::Enum(mode_names)).describe("Target mode"));
        Self { schema, requests }
    }
}

#[async_trait]
impl ActionConnector for ModeSwitchConnector {
    fn schema(&self) -> &ActionSchema {
        &self.schema
    }

    async fn execute(&self, arguments: &Map<String, Value>) -> Result<Value, CortexError> {
        let target = arguments
            .get("mode")
            .and_then(Value::as_str)
            .ok_or_else(|| CortexError::ActionFailed {
                action: SWITCH_MODE_ACTION.into(),
                details: "argument 'mode' must be a string".into(),
            })?;
        self.requests
            .send(target.to_string())
            .map_err(|_| CortexError::Channel("mode runtime has stopped".into()))?;
        info!(target, "mode switch requested by reasoner");
        Ok(json!({ "requested": target }))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ModeRuntime
// ─────────────────────────────────────────────────────────────────────────────

enum Wake {
    Shutdown,
    Switch(String),
    Elapsed,
}

/// Runs the modes of a [`MultiModeConfig`], one at a time.
pub struct ModeRuntime {
    config: MultiModeConfig,
    registry: CapabilityRegistry,
    active: Option<ActiveMode>,
    current: String,
    entered_at: Instant,
    requests_tx: mpsc::UnboundedSender<String>,
    requests_rx: mpsc::UnboundedReceiver<String>,
    status_tx: watch::Sender<RuntimeStatus>,
}

impl ModeRuntime {
    /// Instantiate the default mode.
    ///
    /// Every other mode's plugin types are resolved too; a mode that cannot
    /// resolve is reported with a warning and stays unreachable.
    ///
    /// # Errors
    ///
    /// Unknown default mode or any plugin error of the default mode.
    pub fn new(config: MultiModeConfig, registry: CapabilityRegistry) -> Result<Self, CortexError> {
        let current = config.default_mode.clone();
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (status_tx, _) = watch::channel(RuntimeStatus {
            mode: current.clone(),
            state: RuntimeState::Init,
            since: Utc::now(),
        });
        let mut runtime = Self {
            config,
            registry,
            active: None,
            current,
            entered_at: Instant::now(),
            requests_tx,
            requests_rx,
            status_tx,
        };
        let active = runtime.instantiate(&runtime.current)?;
        runtime.active = Some(active);
        for (mode, error) in runtime.unresolved_modes() {
            warn!(mode = %mode, %error, "mode references plugins the registry does not offer");
        }
        runtime.publish(RuntimeState::Ready);
        info!(mode = %runtime.current, modes = runtime.config.modes.len(), "mode runtime ready");
        Ok(runtime)
    }

    /// Modes whose plugin types do not resolve, with the first failure.
    pub fn unresolved_modes(&self) -> Vec<(String, CortexError)> {
        self.config
            .modes
            .iter()
            .filter_map(|(name, mode)| {
                self.registry
                    .check(&mode.descriptors())
                    .err()
                    .map(|error| (name.clone(), error))
            })
            .collect()
    }

    pub fn controller(&self) -> ModeController {
        ModeController {
            requests: self.requests_tx.clone(),
            status: self.status_tx.subscribe(),
        }
    }

    pub fn current_mode(&self) -> &str {
        &self.current
    }

    pub fn status(&self) -> RuntimeStatus {
        self.status_tx.borrow().clone()
    }

    pub fn active(&self) -> Option<&ActiveMode> {
        self.active.as_ref()
    }

    /// Overwrite the buffer of input `name` in the current mode.
    pub fn set_input(&self, name: &str, text: impl Into<String>) -> Result<(), CortexError> {
        self.live()?.set_input(name, text)
    }

    fn live(&self) -> Result<&ActiveMode, CortexError> {
        self.active
            .as_ref()
            .ok_or_else(|| CortexError::Cancelled("no mode is active".into()))
    }

    fn publish(&self, state: RuntimeState) {
        let mode = self.current.clone();
        self.status_tx.send_if_modified(|status| {
            if status.mode == mode && status.state == state {
                return false;
            }
            if status.mode != mode {
                status.since = Utc::now();
            }
            debug!(mode = %mode, %state, "status");
            status.mode = mode;
            status.state = state;
            true
        });
    }

    fn publish_active(&self) {
        if let Some(active) = &self.active {
            self.publish(active.state());
        }
    }

    fn instantiate(&self, name: &str) -> Result<ActiveMode, CortexError> {
        let mode = self.config.mode(name)?;
        let hertz = self.config.hertz_for(name)?;
        let mut extra: Vec<Arc<dyn ActionConnector>> = Vec::new();
        if self.config.modes.len() > 1 {
            extra.push(Arc::new(ModeSwitchConnector::new(
                self.config.mode_names(),
                self.requests_tx.clone(),
            )));
        }
        ActiveMode::build(&self.registry, Some(name), mode, hertz, &self.config.runtime, &extra)
    }

    /// Start the current mode's inputs.  Idempotent.
    pub fn start(&mut self) {
        if let Some(active) = self.active.as_mut() {
            active.start();
        }
        self.publish_active();
    }

    /// Run one tick of the current mode, then apply any pending transition.
    ///
    /// # Errors
    ///
    /// Only when a failed switch left no mode running.
    pub async fn tick(&mut self) -> Result<TickReport, CortexError> {
        let active = self
            .active
            .as_mut()
            .ok_or_else(|| CortexError::Cancelled("no mode is active".into()))?;
        let report = active.tick().await;
        self.publish_active();
        self.apply_transitions(None).await?;
        Ok(report)
    }

    /// Pick the next mode, if any: queued signals (latest valid wins, `first`
    /// counts as the oldest), then keyword rules, then the mode's time limit.
    fn next_transition(&mut self, first: Option<String>) -> Option<String> {
        let mut signal = first;
        while let Ok(target) = self.requests_rx.try_recv() {
            if is_switch_target(&self.config.modes, &self.current, &target) {
                signal = Some(target);
            }
        }
        if signal.is_some() {
            return signal;
        }

        if let Some(active) = &self.active {
            let observations = active.fuser().current_observations();
            if let Some(rule) = self
                .config
                .transitions
                .iter()
                .find(|rule| rule.matches(&self.current, &observations))
            {
                info!(from = %self.current, to = %rule.to, "keyword transition matched");
                return Some(rule.to.clone());
            }
        }

        let mode = self.config.modes.get(&self.current)?;
        if let (Some(limit), Some(target)) = (mode.max_duration(), &mode.on_timeout)
            && self.entered_at.elapsed() >= limit
            && *target != self.current
        {
            info!(from = %self.current, to = %target, limit_secs = limit.as_secs(), "mode time limit reached");
            return Some(target.clone());
        }
        None
    }

    /// Switch if a transition is pending.  Returns `true` when the mode
    /// changed.
    async fn apply_transitions(&mut self, first: Option<String>) -> Result<bool, CortexError> {
        let Some(target) = self.next_transition(first) else {
            return Ok(false);
        };
        match self.switch_to(&target).await {
            Ok(()) => Ok(true),
            Err(error) if self.active.is_some() => {
                warn!(mode = %self.current, %error, "mode switch failed; staying");
                Ok(false)
            }
            Err(error) => Err(error),
        }
    }

    /// Tear down the current mode and start `target`.
    ///
    /// A no-op when `target` is already current.
    ///
    /// # Errors
    ///
    /// * [`CortexError::UnknownMode`] – nothing changes.
    /// * a registry error for one of `target`'s plugin types – nothing
    ///   changes.
    /// * a plugin construction error – the previous mode is rebuilt and
    ///   ticks on; the error is still returned.  If the previous mode cannot
    ///   be rebuilt either, no mode is left running.
    pub async fn switch_to(&mut self, target: &str) -> Result<(), CortexError> {
        let mode = match self.config.mode(target) {
            Ok(mode) => mode,
            Err(error) => {
                warn!(mode = %self.current, target, "unknown mode requested; ignored");
                return Err(error);
            }
        };
        if target == self.current && self.active.is_some() {
            debug!(mode = target, "already in requested mode");
            return Ok(());
        }
        if let Err(error) = self.registry.check(&mode.descriptors()) {
            warn!(mode = %self.current, target, %error, "target mode cannot be resolved; staying");
            return Err(error);
        }

        let previous = self.current.clone();
        info!(from = %previous, to = target, "switching mode");
        self.publish(RuntimeState::Draining);
        if let Some(old) = self.active.take() {
            old.teardown(self.config.runtime.drain_deadline()).await;
        }

        match self.instantiate(target) {
            Ok(next) => {
                self.enter(target, next);
                info!(mode = target, "mode switched");
                Ok(())
            }
            Err(error) => {
                warn!(target, %error, "target mode failed to start; restoring previous mode");
                match self.instantiate(&previous) {
                    Ok(restored) => {
                        self.enter(&previous, restored);
                        Err(error)
                    }
                    Err(second) => {
                        error!(mode = %previous, %second, "previous mode could not be restored");
                        self.publish(RuntimeState::Shutdown);
                        Err(second)
                    }
                }
            }
        }
    }

    fn enter(&mut self, name: &str, mut active: ActiveMode) {
        active.start();
        self.current = name.to_string();
        self.entered_at = Instant::now();
        self.active = Some(active);
        self.publish_active();
    }

    /// Tick until `shutdown` is cancelled, switching modes as requested.
    ///
    /// # Errors
    ///
    /// Only when a failed switch left no mode running.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), CortexError> {
        self.start();
        let drain = self.config.runtime.drain_deadline();

        loop {
            let started = Instant::now();
            let Some(active) = self.active.as_mut() else {
                return Err(CortexError::Cancelled("no mode is active".into()));
            };

            let mut signal = None;
            let stop = {
                let mut tick = pin!(active.tick());
                let interrupted = loop {
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => break Some(true),
                        Some(target) = self.requests_rx.recv() => {
                            if is_switch_target(&self.config.modes, &self.current, &target) {
                                signal = Some(target);
                                break Some(false);
                            }
                        }
                        _ = &mut tick => break None,
                    }
                };
                if let Some(stop) = interrupted {
                    self.status_tx.send_modify(|status| status.state = RuntimeState::Draining);
                    if timeout(drain, &mut tick).await.is_err() {
                        warn!(
                            mode = %self.current,
                            drain_ms = drain.as_millis() as u64,
                            "in-flight tick exceeded the drain deadline; cancelled"
                        );
                    }
                    stop
                } else {
                    false
                }
            };
            if stop {
                break;
            }
            self.publish_active();

            if self.apply_transitions(signal).await? {
                continue;
            }

            let period = self.live()?.next_period();
            match self.wait_until(started + period, &shutdown).await {
                Wake::Shutdown => break,
                Wake::Switch(target) => {
                    self.apply_transitions(Some(target)).await?;
                }
                Wake::Elapsed => {}
            }
        }

        self.shutdown().await;
        Ok(())
    }

    async fn wait_until(&mut self, deadline: Instant, shutdown: &CancellationToken) -> Wake {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Wake::Shutdown,
                Some(target) = self.requests_rx.recv() => {
                    if is_switch_target(&self.config.modes, &self.current, &target) {
                        return Wake::Switch(target);
                    }
                }
                _ = sleep_until(deadline) => return Wake::Elapsed,
            }
        }
    }

    /// Tear down the current mode under the drain deadline.
    pub async fn shutdown(mut self) {
        self.publish(RuntimeState::Draining);
        if let Some(active) = self.active.take() {
            active.teardown(self.config.runtime.drain_deadline()).await;
        }
        self.publish(RuntimeState::Shutdown);
        info!(mode = %self.current, "mode runtime shut down");
    }
}

/// `true` for a declared mode other than `current`; warns about unknown ones.
fn is_switch_target(modes: &BTreeMap<String, ModeConfig>, current: &str, target: &str) -> bool {
    if !modes.contains_key(target) {
        warn!(mode = current, target, "switch to unknown mode rejected");
        return false;
    }
    target != current
}
