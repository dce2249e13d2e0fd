//! Generic `InputPlugin` trait for anything that produces textual
//! observations: speech recognisers, vision captioners, battery monitors, …
//!
//! Each instance is owned by its own background task.  The task awaits
//! [`InputPlugin::next_observation`] in a loop and publishes every result
//! into the input's buffer, so a slow source never stalls the control loop.

use async_trait::async_trait;
use cortex_types::CortexError;

/// An asynchronous source of textual observations.
#[async_trait]
pub trait InputPlugin: Send + Sync {
    /// One-line human-readable label used as the prompt prefix, e.g.
    /// `"Voice"` or `"What you see in front of you"`.
    fn descriptor(&self) -> &str;

    /// Wait for the next observation.
    ///
    /// Returns `Ok(Some(text))` for a fresh observation (an empty string means
    /// "nothing perceived"), and `Ok(None)` once the source is exhausted.
    ///
    /// # Errors
    ///
    /// A transient acquisition failure.  The owning task logs it, backs off
    /// and keeps polling.
    async fn next_observation(&mut self) -> Result<Option<String>, CortexError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Emits a fixed list of observations, then reports exhaustion.
    struct ScriptedInput {
        remaining: Vec<String>,
    }

    #[async_trait]
    impl InputPlugin for ScriptedInput {
        fn descriptor(&self) -> &str {
            "Voice"
        }

        async fn next_observation(&mut self) -> Result<Option<String>, CortexError> {
            if self.remaining.is_empty() {
                Ok(None)
            } else {
                Ok(Some(self.remaining.remove(0)))
            }
        }
    }

    #[tokio::test]
    async fn scripted_input_drains_then_ends() {
        let mut input = ScriptedInput {
            remaining: vec!["hello".into(), "bye".into()],
        };
        assert_eq!(input.descriptor(), "Voice");
        assert_eq!(input.next_observation().await.unwrap().as_deref(), Some("hello"));
        assert_eq!(input.next_observation().await.unwrap().as_deref(), Some("bye"));
        assert_eq!(input.next_observation().await.unwrap(), None);
    }
}
