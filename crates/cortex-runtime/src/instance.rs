//! [`ActiveMode`] – one live instantiation of a plugin set.
//!
//! Owns everything a mode needs to tick: the input plugins and their
//! background tasks, the [`Fuser`] over their buffers, the
//! [`ReasonerInvocation`] and the [`ActionDispatcher`].  Both runtimes drive
//! exactly one `ActiveMode` at a time; switching modes means tearing one down
//! and building the next.
//!
//! # Tick
//!
//! ```text
//! buffers ─▶ Fuser ─▶ ReasonerInvocation ─▶ ActionDispatcher ─▶ connectors
//! ```
//!
//! # Degradation
//!
//! After `failure_threshold` consecutive Reasoner failures the mode enters
//! [`RuntimeState::Degraded`]: ticks are spaced by a growing cooldown
//! ([`next_period`][ActiveMode::next_period]) and only invoke the Reasoner
//! and log what it proposes.  The first successful call returns the mode to
//! [`RuntimeState::Ticking`].  Once the cooldown has reached the maximum
//! backoff and the Reasoner still fails, normal ticking is retried anyway.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use cortex_fuser::{Fuser, InputBuffer, PromptSections};
use cortex_kernel::BackoffPolicy;
use cortex_plugin::{ActionConnector, CapabilityRegistry, InputPlugin};
use cortex_types::{CortexError, PluginRole, RuntimeState, TickReport};
use serde_json::Value;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::config::{ModeConfig, RuntimeSettings};
use crate::dispatcher::ActionDispatcher;
use crate::invocation::{InvocationPolicy, ReasonerInvocation};

/// Restart delays for a failing input source.
const INPUT_BACKOFF_INITIAL: Duration = Duration::from_millis(200);
const INPUT_BACKOFF_MAX: Duration = Duration::from_secs(10);

/// Live plugin set of one mode.
pub struct ActiveMode {
    name: Option<String>,
    period: Duration,
    fuser: Fuser,
    reasoner: ReasonerInvocation,
    dispatcher: ActionDispatcher,
    action_schema: Value,
    pending_inputs: Vec<(InputBuffer, Box<dyn InputPlugin>)>,
    input_tasks: JoinSet<()>,
    cancel: CancellationToken,
    degraded_backoff: BackoffPolicy,
    degraded_attempt: u32,
    state: RuntimeState,
}

impl ActiveMode {
    /// Resolve and instantiate every plugin of `mode`.
    ///
    /// `extra_actions` are bound after the configured ones (the multi-mode
    /// runtime uses this for `switch_mode`).
    ///
    /// # Errors
    ///
    /// Any registry or factory error, a duplicate input or action name, or a
    /// loop frequency that does not yield a valid period.
    pub fn build(
        registry: &CapabilityRegistry,
        name: Option<&str>,
        mode: &ModeConfig,
        hertz: f64,
        settings: &RuntimeSettings,
        extra_actions: &[Arc<dyn ActionConnector>],
    ) -> Result<Self, CortexError> {
        let period = period_for(hertz)?;

        let reasoner = registry.instantiate_reasoner(&mode.reasoner.descriptor(PluginRole::Reasoner))?;

        let mut seen = HashSet::new();
        let mut pending_inputs = Vec::with_capacity(mode.inputs.len());
        for entry in &mode.inputs {
            let input_name = entry.instance_name();
            if !seen.insert(input_name.to_string()) {
                return Err(CortexError::InvalidConfig(format!(
                    "input '{input_name}' is declared more than once; give each a distinct name"
                )));
            }
            let plugin = registry.instantiate_input(&entry.descriptor(PluginRole::Input))?;
            let buffer = InputBuffer::new(input_name, plugin.descriptor());
            pending_inputs.push((buffer, plugin));
        }

        let mut dispatcher = ActionDispatcher::new();
        for entry in &mode.actions {
            let descriptor = entry.descriptor(PluginRole::Action);
            let connector = registry.instantiate_action(&descriptor)?;
            let limit = descriptor
                .millis_setting("timeout_ms")
                .unwrap_or_else(|| settings.action_timeout());
            let bound_name = entry
                .name
                .clone()
                .unwrap_or_else(|| connector.name().to_string());
            dispatcher.bind_as(bound_name, connector, limit)?;
        }
        for connector in extra_actions {
            dispatcher.bind(Arc::clone(connector), settings.action_timeout())?;
        }

        let sections = PromptSections::new(mode.system_prompt_base.clone())
            .with_rules(mode.system_governance.clone())
            .with_examples(mode.system_prompt_examples.clone());
        let buffers = pending_inputs.iter().map(|(b, _)| b.clone()).collect();
        let mut fuser = Fuser::new(sections, buffers, dispatcher.catalogue());
        if let Some(max_age) = mode.stale_after() {
            fuser = fuser.with_stale_after(max_age);
        }

        info!(
            mode = name.unwrap_or("-"),
            inputs = pending_inputs.len(),
            actions = dispatcher.len(),
            reasoner = %mode.reasoner.type_name,
            period_ms = period.as_millis() as u64,
            "mode instantiated"
        );

        Ok(Self {
            name: name.map(str::to_string),
            period,
            action_schema: dispatcher.response_schema(),
            fuser,
            reasoner: ReasonerInvocation::new(reasoner, InvocationPolicy::from_settings(settings)),
            dispatcher,
            pending_inputs,
            input_tasks: JoinSet::new(),
            cancel: CancellationToken::new(),
            degraded_backoff: BackoffPolicy::new(settings.degraded_cooldown(), settings.max_backoff()),
            degraded_attempt: 0,
            state: RuntimeState::Ready,
        })
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn state(&self) -> RuntimeState {
        self.state
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn fuser(&self) -> &Fuser {
        &self.fuser
    }

    pub fn dispatcher(&self) -> &ActionDispatcher {
        &self.dispatcher
    }

    pub fn reasoner(&self) -> &ReasonerInvocation {
        &self.reasoner
    }

    /// Overwrite the buffer of input `name`.
    pub fn set_input(&self, name: &str, text: impl Into<String>) -> Result<(), CortexError> {
        self.fuser.set_input(name, text)
    }

    /// Delay between the start of this tick and the start of the next.
    pub fn next_period(&self) -> Duration {
        match self.state {
            RuntimeState::Degraded => self.degraded_backoff.delay(self.degraded_attempt).max(self.period),
            _ => self.period,
        }
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Spawn one background task per input and enter
    /// [`RuntimeState::Ticking`].  Calling it again is a no-op.
    pub fn start(&mut self) {
        if self.state != RuntimeState::Ready {
            return;
        }
        for (buffer, plugin) in self.pending_inputs.drain(..) {
            let cancel = self.cancel.clone();
            let span = info_span!("input", input = %buffer.name());
            self.input_tasks
                .spawn(pump_input(buffer, plugin, cancel).instrument(span));
        }
        self.state = RuntimeState::Ticking;
        debug!(mode = self.name.as_deref().unwrap_or("-"), "inputs started");
    }

    /// Run one fuse → reason → dispatch pass.
    pub async fn tick(&mut self) -> TickReport {
        self.start();
        let mut report = TickReport::new(self.state, self.fuser.build_prompt());
        report.mode = self.name.clone();
        let span = info_span!(
            "tick",
            tick = %report.tick_id,
            mode = self.name.as_deref().unwrap_or("-"),
            state = %self.state,
        );
        self.run_tick(report).instrument(span).await
    }

    async fn run_tick(&mut self, mut report: TickReport) -> TickReport {
        let invoked = self.reasoner.invoke(&report.prompt, &self.action_schema).await;
        report.reasoner_ok = invoked.is_success();
        report.invocations = invoked.invocations;

        if self.state == RuntimeState::Degraded {
            for invocation in &report.invocations {
                info!(action = %invocation, "degraded: proposal logged, not dispatched");
            }
            if report.reasoner_ok {
                info!("reasoner recovered; resuming normal cadence");
                self.enter(RuntimeState::Ticking);
            } else if self.degraded_backoff.is_saturated(self.degraded_attempt) {
                info!("maximum backoff reached; retrying normal cadence");
                self.reasoner.reset_failures();
                self.enter(RuntimeState::Ticking);
            } else {
                self.degraded_attempt = self.degraded_attempt.saturating_add(1);
            }
            return report;
        }

        if !report.reasoner_ok && self.reasoner.guard().is_tripped() {
            warn!(
                failures = self.reasoner.guard().consecutive(),
                cooldown_ms = self.degraded_backoff.initial().as_millis() as u64,
                "reasoner keeps failing; entering degraded cadence"
            );
            self.enter(RuntimeState::Degraded);
        }

        report.results = self.dispatcher.dispatch(&report.invocations).await;
        report
    }

    fn enter(&mut self, state: RuntimeState) {
        self.degraded_attempt = 0;
        self.state = state;
    }

    /// Cancel the input tasks, waiting at most `deadline` for them to stop,
    /// then release every plugin.
    pub async fn teardown(mut self, deadline: Duration) {
        self.cancel.cancel();
        let tasks = &mut self.input_tasks;
        let drained = timeout(deadline, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                mode = self.name.as_deref().unwrap_or("-"),
                "input tasks ignored cancellation; aborting"
            );
            self.input_tasks.abort_all();
        }
        self.state = RuntimeState::Shutdown;
        info!(mode = self.name.as_deref().unwrap_or("-"), "mode torn down");
    }
}

fn period_for(hertz: f64) -> Result<Duration, CortexError> {
    if !(hertz.is_finite() && hertz > 0.0) {
        return Err(CortexError::InvalidConfig(format!("hertz must be positive, got {hertz}")));
    }
    Duration::try_from_secs_f64(1.0 / hertz)
        .map_err(|e| CortexError::InvalidConfig(format!("hertz {hertz} gives no usable period: {e}")))
}

/// Feed one input plugin into its buffer until cancelled or exhausted.
async fn pump_input(buffer: InputBuffer, mut plugin: Box<dyn InputPlugin>, cancel: CancellationToken) {
    let backoff = BackoffPolicy::new(INPUT_BACKOFF_INITIAL, INPUT_BACKOFF_MAX);
    let mut failures = 0u32;
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = plugin.next_observation() => next,
        };
        match next {
            Ok(Some(text)) => {
                failures = 0;
                buffer.write(text);
            }
            Ok(None) => {
                debug!("input source exhausted");
                break;
            }
            Err(error) => {
                let delay = backoff.delay(failures);
                failures = failures.saturating_add(1);
                warn!(%error, delay_ms = delay.as_millis() as u64, "input failed; backing off");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = sleep(delay) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PluginEntry;
    use crate::testing::{ActionLog, ReasonerStep, ScriptedReasoner, StubPlugins, recording_factory, speak_schema};
    use async_trait::async_trait;
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

    fn mode() -> ModeConfig {
        ModeConfig::new("You are a robot.", PluginEntry::new("scripted"))
            .with_input(PluginEntry::new("scripted").named("mic").with_setting("descriptor", "Voice"))
            .with_action(PluginEntry::new("speak"))
    }

    fn settings() -> RuntimeSettings {
        RuntimeSettings {
            reasoner_timeout_ms: 100,
            reasoner_retries: 0,
            degraded_cooldown_ms: 1_000,
            max_backoff_ms: 4_000,
            ..RuntimeSettings::default()
        }
    }

    #[tokio::test]
    async fn build_wires_catalogue_and_period() {
        let log = ActionLog::default();
        let active = ActiveMode::build(
            &registry(ScriptedReasoner::replying(json!([])), &log),
            Some("idle"),
            &mode(),
            4.0,
            &settings(),
            &[],
        )
        .unwrap();
        assert_eq!(active.period(), Duration::from_millis(250));
        assert_eq!(active.state(), RuntimeState::Ready);
        assert!(active.fuser().system_context().contains("- speak: Say a sentence out loud."));
        assert_eq!(active.dispatcher().names(), vec!["speak"]);
    }

    #[test]
    fn duplicate_input_names_are_rejected() {
        let log = ActionLog::default();
        let mode = mode().with_input(PluginEntry::new("scripted").named("mic"));
        let err = ActiveMode::build(
            &registry(ScriptedReasoner::replying(json!([])), &log),
            None,
            &mode,
            1.0,
            &settings(),
            &[],
        )
        .err()
        .unwrap();
        assert!(matches!(err, CortexError::InvalidConfig(_)));
    }

    #[test]
    fn unknown_plugin_fails_build() {
        let log = ActionLog::default();
        let mode = mode().with_action(PluginEntry::new("fly"));
        let err = ActiveMode::build(
            &registry(ScriptedReasoner::replying(json!([])), &log),
            None,
            &mode,
            1.0,
            &settings(),
            &[],
        )
        .err()
        .unwrap();
        assert!(matches!(err, CortexError::UnknownPlugin { .. }));
    }

    #[test]
    fn invalid_hertz_is_rejected() {
        assert!(period_for(0.0).is_err());
        assert!(period_for(f64::NAN).is_err());
        assert_eq!(period_for(2.0).unwrap(), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn inputs_feed_their_buffers() {
        let log = ActionLog::default();
        let mode = ModeConfig::new("Base.", PluginEntry::new("scripted")).with_input(
            PluginEntry::new("scripted")
                .with_setting("descriptor", "Voice")
                .with_setting("observations", json!(["hello"])),
        );
        let mut active = ActiveMode::build(
            &registry(ScriptedReasoner::replying(json!([])), &log),
            None,
            &mode,
            1.0,
            &settings(),
            &[],
        )
        .unwrap();
        active.start();
        let mut rx = active.fuser().buffers()[0].subscribe();
        if active.fuser().buffers()[0].snapshot().is_empty() {
            rx.changed().await.unwrap();
        }
        assert!(active.fuser().build_prompt().user_content.contains("Voice: hello"));
        active.teardown(Duration::from_millis(100)).await;
    }

    struct FlakyInput {
        calls: u32,
    }

    #[async_trait]
    impl InputPlugin for FlakyInput {
        fn descriptor(&self) -> &str {
            "Battery"
        }
        async fn next_observation(&mut self) -> Result<Option<String>, CortexError> {
            self.calls += 1;
            match self.calls {
                1 => Err(CortexError::InputFailed {
                    plugin: "battery".into(),
                    details: "i2c timeout".into(),
                }),
                2 => Ok(Some("80%".into())),
                _ => std::future::pending().await,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failing_input_backs_off_and_recovers() {
        let buffer = InputBuffer::new("battery", "Battery");
        let cancel = CancellationToken::new();
        let task = tokio::spawn(pump_input(buffer.clone(), Box::new(FlakyInput { calls: 0 }), cancel.clone()));
        let mut rx = buffer.subscribe();
        rx.changed().await.unwrap();
        assert_eq!(buffer.snapshot().text, "80%");
        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn degrades_after_threshold_and_recovers_on_success() {
        let log = ActionLog::default();
        let reasoner = ScriptedReasoner::new([
            ReasonerStep::Hang,
            ReasonerStep::Hang,
            ReasonerStep::Hang,
            ReasonerStep::Reply(json!([{"action": "speak", "arguments": {"text": "back"}}])),
            ReasonerStep::Reply(json!([{"action": "speak", "arguments": {"text": "normal"}}])),
        ]);
        let mut active =
            ActiveMode::build(&registry(reasoner, &log), None, &mode(), 2.0, &settings(), &[]).unwrap();

        for _ in 0..2 {
            active.tick().await;
            assert_eq!(active.state(), RuntimeState::Ticking);
        }
        let third = active.tick().await;
        assert!(!third.reasoner_ok);
        assert_eq!(active.state(), RuntimeState::Degraded);
        assert_eq!(active.next_period(), Duration::from_millis(1_000));

        let recovered = active.tick().await;
        assert_eq!(recovered.state, RuntimeState::Degraded);
        assert!(recovered.results.is_empty(), "degraded ticks do not dispatch");
        assert_eq!(active.state(), RuntimeState::Ticking);
        assert_eq!(active.next_period(), Duration::from_millis(500));

        let normal = active.tick().await;
        assert_eq!(normal.completed_actions(), vec!["speak"]);
        assert_eq!(log.rendered(), vec![r#"speak(text="normal")"#]);
    }

    #[tokio::test(start_paused = true)]
    async fn saturated_backoff_retries_ticking() {
        let log = ActionLog::default();
        let reasoner = ScriptedReasoner::with_fallback([], ReasonerStep::Hang);
        let mut active =
            ActiveMode::build(&registry(reasoner, &log), None, &mode(), 2.0, &settings(), &[]).unwrap();

        for _ in 0..3 {
            active.tick().await;
        }
        assert_eq!(active.state(), RuntimeState::Degraded);

        let mut periods = Vec::new();
        while active.state() == RuntimeState::Degraded {
            periods.push(active.next_period().as_millis() as u64);
            active.tick().await;
        }
        assert_eq!(periods, vec![1_000, 2_000, 4_000]);
        assert_eq!(active.state(), RuntimeState::Ticking);
        assert_eq!(active.reasoner().guard().consecutive(), 0);
    }
}
