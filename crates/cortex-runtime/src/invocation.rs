//! [`ReasonerInvocation`] – bounded, retried, parsed Reasoner calls.
//!
//! One call to [`ReasonerInvocation::invoke`] per tick:
//!
//! 1. Ask the Reasoner with `(system_context, user_content, action_schema)`.
//! 2. On an error, retry up to `retries` times with exponential backoff.
//! 3. Parse the structured reply into [`ActionInvocation`]s, dropping
//!    unrecoverable items individually.
//!
//! All attempts share one overall `timeout`.  When it expires the call is
//! cancelled and the tick proceeds with an empty list.  Every failed call
//! (timeout, error, unusable reply) is recorded on the [`FailureGuard`]; the
//! runtime reads the guard to decide when to degrade.

use std::sync::Arc;
use std::time::Duration;

use cortex_kernel::{BackoffPolicy, ParsedOutput, parse_invocations};
use cortex_plugin::Reasoner;
use cortex_types::{ActionInvocation, CortexError, FusedPrompt};
use serde_json::Value;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, warn};

use crate::config::RuntimeSettings;
use crate::failure_guard::FailureGuard;

/// Timeout and retry knobs for [`ReasonerInvocation`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InvocationPolicy {
    /// Overall budget for all attempts of one invocation.
    pub timeout: Duration,
    /// Extra attempts after a Reasoner error.
    pub retries: u32,
    pub backoff: BackoffPolicy,
    /// Consecutive failures before the guard trips.
    pub failure_threshold: u32,
}

impl InvocationPolicy {
    pub fn from_settings(settings: &RuntimeSettings) -> Self {
        Self {
            timeout: settings.reasoner_timeout(),
            retries: settings.reasoner_retries,
            backoff: BackoffPolicy::new(settings.retry_backoff(), settings.reasoner_timeout()),
            failure_threshold: settings.failure_threshold,
        }
    }
}

impl Default for InvocationPolicy {
    fn default() -> Self {
        Self::from_settings(&RuntimeSettings::default())
    }
}

/// Result of one [`ReasonerInvocation::invoke`] call.
#[derive(Debug, Clone, PartialEq)]
pub struct Invoked {
    pub invocations: Vec<ActionInvocation>,
    /// Reasons for individually dropped calls.
    pub dropped: Vec<String>,
    /// Set when the call as a whole failed.
    pub error: Option<CortexError>,
    pub elapsed: Duration,
}

impl Invoked {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Wraps a [`Reasoner`] with timeout, retry, parsing and failure tracking.
pub struct ReasonerInvocation {
    reasoner: Arc<dyn Reasoner>,
    policy: InvocationPolicy,
    guard: FailureGuard,
}

impl ReasonerInvocation {
    pub fn new(reasoner: Arc<dyn Reasoner>, policy: InvocationPolicy) -> Self {
        Self {
            reasoner,
            guard: FailureGuard::new(policy.failure_threshold),
            policy,
        }
    }

    pub fn reasoner(&self) -> &Arc<dyn Reasoner> {
        &self.reasoner
    }

    pub fn policy(&self) -> &InvocationPolicy {
        &self.policy
    }

    pub fn guard(&self) -> &FailureGuard {
        &self.guard
    }

    /// Clear the failure streak (used when the degraded backoff is exhausted).
    pub fn reset_failures(&mut self) {
        self.guard.reset();
    }

    /// Ask the Reasoner for this tick's actions.
    ///
    /// Never fails: errors are reported in [`Invoked::error`] with an empty
    /// invocation list.
    pub async fn invoke(&mut self, prompt: &FusedPrompt, action_schema: &Value) -> Invoked {
        let started = Instant::now();
        let budget = self.policy.timeout;

        let outcome = match timeout(budget, self.attempts(prompt, action_schema)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(CortexError::ReasonerTimeout {
                timeout_ms: budget.as_millis() as u64,
            }),
        };
        let elapsed = started.elapsed();

        match outcome {
            Ok(ParsedOutput {
                invocations,
                dropped,
            }) => {
                self.guard.record_success();
                debug!(
                    reasoner = self.reasoner.name(),
                    actions = invocations.len(),
                    dropped = dropped.len(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "reasoner answered"
                );
                Invoked {
                    invocations,
                    dropped,
                    error: None,
                    elapsed,
                }
            }
            Err(error) => {
                let tripped = self.guard.record_failure();
                warn!(
                    reasoner = self.reasoner.name(),
                    %error,
                    consecutive = self.guard.consecutive(),
                    tripped,
                    "reasoner call failed; continuing with no actions"
                );
                Invoked {
                    invocations: Vec::new(),
                    dropped: Vec::new(),
                    error: Some(error),
                    elapsed,
                }
            }
        }
    }

    async fn attempts(&self, prompt: &FusedPrompt, action_schema: &Value) -> Result<ParsedOutput, CortexError> {
        let mut attempt = 0u32;
        loop {
            let outcome = self
                .reasoner
                .ask(&prompt.system_context, &prompt.user_content, action_schema)
                .await
                .and_then(|reply| parse_invocations(&reply));
            match outcome {
                Ok(parsed) => return Ok(parsed),
                Err(error) if attempt < self.policy.retries => {
                    let delay = self.policy.backoff.delay(attempt);
                    attempt += 1;
                    warn!(
                        reasoner = self.reasoner.name(),
                        attempt,
                        max = self.policy.retries,
                        delay_ms = delay.as_millis() as u64,
                        %error,
                        "retrying reasoner after error"
                    );
                    sleep(delay).await;
                }
                Err(error) => return Err(error),
            }
        }
    }
}
