//! Prompt Fusion.
//!
//! Builds the Reasoner prompt for one tick from two kinds of material:
//!
//! - **Static sections** – base instructions, behavioral rules, examples and
//!   the action catalogue.  These only change when a mode is (re)built, so the
//!   rendered `system_context` is computed once and cached.
//! - **Live observations** – one `"<descriptor>: <text>"` line per non-empty
//!   [`InputBuffer`], in the order the inputs were declared.  When every
//!   buffer is empty the single [`NO_INPUT_MARKER`] line is emitted instead.
//!
//! The Fuser never mutates a buffer, so building the same prompt twice
//! against the same buffer state yields byte-identical output.
//!
//! # Example
//!
//! ```rust
//! use cortex_fuser::{Fuser, InputBuffer, PromptSections, NO_INPUT_MARKER};
//!
//! let voice = InputBuffer::new("mic", "Voice");
//! let fuser = Fuser::new(
//!     PromptSections::new("You are a friendly robot."),
//!     vec![voice.clone()],
//!     vec!["speak: Say a sentence out loud.".into()],
//! );
//!
//! assert!(fuser.build_prompt().user_content.contains(NO_INPUT_MARKER));
//!
//! voice.write("hello");
//! let prompt = fuser.build_prompt();
//! assert!(prompt.user_content.contains("Voice: hello"));
//! assert!(prompt.system_context.contains("- speak: Say a sentence out loud."));
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};
use cortex_types::{CortexError, FusedPrompt};
use tracing::debug;

use crate::buffer::InputBuffer;

/// Line emitted when no buffer holds a usable observation.
pub const NO_INPUT_MARKER: &str = "No input detected.";

/// Final instruction appended to every prompt.
pub const INSTRUCTION_FOOTER: &str = "Respond with the list of actions to perform now, chosen only from \
the available actions. Return an empty list when no action is needed.";

const INPUTS_HEADER: &str = "INPUTS:";
const RULES_HEADER: &str = "BEHAVIORAL RULES:";
const EXAMPLES_HEADER: &str = "EXAMPLES:";
const ACTIONS_HEADER: &str = "AVAILABLE ACTIONS:";

// ─────────────────────────────────────────────────────────────────────────────
// Static sections
// ─────────────────────────────────────────────────────────────────────────────

/// Static policy text of one mode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromptSections {
    /// Base context: persona, environment, goals.
    pub base: String,
    /// Governance / behavioral rules.
    pub rules: String,
    /// Worked examples.
    pub examples: String,
}

impl PromptSections {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            ..Self::default()
        }
    }

    pub fn with_rules(mut self, rules: impl Into<String>) -> Self {
        self.rules = rules.into();
        self
    }

    pub fn with_examples(mut self, examples: impl Into<String>) -> Self {
        self.examples = examples.into();
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Fuser
// ─────────────────────────────────────────────────────────────────────────────

/// Deterministic prompt builder owned by one active mode.
#[derive(Debug)]
pub struct Fuser {
    sections: PromptSections,
    buffers: Vec<InputBuffer>,
    catalogue: Vec<String>,
    stale_after: Option<Duration>,
    system_context: String,
}

impl Fuser {
    /// Create a Fuser over `buffers` (in declared order) and the one-line
    /// action `catalogue` entries.
    pub fn new(sections: PromptSections, buffers: Vec<InputBuffer>, catalogue: Vec<String>) -> Self {
        let system_context = render_system_context(&sections, &catalogue);
        debug!(
            inputs = buffers.len(),
            actions = catalogue.len(),
            bytes = system_context.len(),
            "fuser static context built"
        );
        Self {
            sections,
            buffers,
            catalogue,
            stale_after: None,
            system_context,
        }
    }

    /// Treat observations older than `max_age` as empty.
    pub fn with_stale_after(mut self, max_age: Duration) -> Self {
        self.stale_after = Some(max_age);
        self
    }

    /// Replace the static sections and re-render the cached context.
    pub fn set_sections(&mut self, sections: PromptSections) {
        self.system_context = render_system_context(&sections, &self.catalogue);
        self.sections = sections;
    }

    pub fn sections(&self) -> &PromptSections {
        &self.sections
    }

    pub fn buffers(&self) -> &[InputBuffer] {
        &self.buffers
    }

    pub fn buffer(&self, name: &str) -> Option<&InputBuffer> {
        self.buffers.iter().find(|b| b.name() == name)
    }

    /// The cached static part of every prompt.
    pub fn system_context(&self) -> &str {
        &self.system_context
    }

    /// Overwrite the buffer of input `name`.
    ///
    /// # Errors
    ///
    /// [`CortexError::InvalidConfig`] when no input of that name exists.
    pub fn set_input(&self, name: &str, text: impl Into<String>) -> Result<(), CortexError> {
        let buffer = self
            .buffer(name)
            .ok_or_else(|| CortexError::InvalidConfig(format!("no input named '{name}'")))?;
        buffer.write(text);
        Ok(())
    }

    /// Build the prompt from the current buffer state.
    pub fn build_prompt(&self) -> FusedPrompt {
        self.build_prompt_at(Utc::now())
    }

    /// Build the prompt as seen at instant `now` (staleness reference).
    pub fn build_prompt_at(&self, now: DateTime<Utc>) -> FusedPrompt {
        FusedPrompt {
            system_context: self.system_context.clone(),
            user_content: format!("{}\n\n{INSTRUCTION_FOOTER}", self.render_inputs(now)),
        }
    }

    /// The whole prompt as a single document, sections in canonical order:
    /// base, inputs, rules, examples, actions, instruction.
    pub fn build_flat_prompt(&self) -> String {
        let mut parts = vec![self.sections.base.trim().to_string(), self.render_inputs(Utc::now())];
        parts.extend(rules_and_examples(&self.sections));
        parts.extend(render_catalogue(&self.catalogue));
        parts.push(INSTRUCTION_FOOTER.to_string());
        parts.retain(|p| !p.is_empty());
        parts.join("\n\n")
    }

    /// Live observation texts, in declared order, empty or stale ones omitted.
    pub fn current_observations(&self) -> Vec<String> {
        self.live_lines(Utc::now()).into_iter().map(|(_, text)| text).collect()
    }

    fn live_lines(&self, now: DateTime<Utc>) -> Vec<(&str, String)> {
        self.buffers
            .iter()
            .filter_map(|buffer| {
                let observation = buffer.snapshot();
                if observation.is_empty() {
                    return None;
                }
                if let Some(max_age) = self.stale_after {
                    if observation.is_stale(now, max_age) {
                        debug!(input = buffer.name(), "stale observation skipped");
                        return None;
                    }
                }
                Some((buffer.descriptor(), observation.text.trim().to_string()))
            })
            .collect()
    }

    fn render_inputs(&self, now: DateTime<Utc>) -> String {
        let lines = self.live_lines(now);
        let mut out = String::from(INPUTS_HEADER);
        if lines.is_empty() {
            out.push('\n');
            out.push_str(NO_INPUT_MARKER);
        }
        for (descriptor, text) in lines {
            out.push('\n');
            out.push_str(descriptor);
            out.push_str(": ");
            out.push_str(&text);
        }
        out
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Rendering helpers
// ─────────────────────────────────────────────────────────────────────────────

fn rules_and_examples(sections: &PromptSections) -> Vec<String> {
    let mut out = Vec::new();
    if !sections.rules.trim().is_empty() {
        out.push(format!("{RULES_HEADER}\n{}", sections.rules.trim()));
    }
    if !sections.examples.trim().is_empty() {
        out.push(format!("{EXAMPLES_HEADER}\n{}", sections.examples.trim()));
    }
    out
}

fn render_catalogue(catalogue: &[String]) -> Option<String> {
    if catalogue.is_empty() {
        return None;
    }
    let lines: Vec<String> = catalogue.iter().map(|line| format!("- {line}")).collect();
    Some(format!("{ACTIONS_HEADER}\n{}", lines.join("\n")))
}

fn render_system_context(sections: &PromptSections, catalogue: &[String]) -> String {
    let mut parts = vec![sections.base.trim().to_string()];
    parts.extend(rules_and_examples(sections));
    parts.extend(render_catalogue(catalogue));
    parts.retain(|p| !p.is_empty());
    parts.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fuser() -> (Fuser, InputBuffer, InputBuffer) {
        let voice = InputBuffer::new("mic", "Voice");
        let vision = InputBuffer::new("cam", "Vision");
        let fuser = Fuser::new(
            PromptSections::new("You are a robot dog.")
                .with_rules("Never run indoors.")
                .with_examples("Voice: sit -> sit()"),
            vec![voice.clone(), vision.clone()],
            vec!["speak: Say it.".into(), "sit: Sit down. No arguments.".into()],
        );
        (fuser, voice, vision)
    }

    #[test]
    fn empty_buffers_yield_marker() {
        let (fuser, _, _) = fuser();
        let prompt = fuser.build_prompt();
        assert_eq!(
            prompt.user_content,
            format!("INPUTS:\n{NO_INPUT_MARKER}\n\n{INSTRUCTION_FOOTER}")
        );
    }

    #[test]
    fn observations_follow_declared_order() {
        let (fuser, voice, vision) = fuser();
        vision.write("a red ball");
        voice.write("fetch!");
        let prompt = fuser.build_prompt();
        assert!(prompt.user_content.starts_with("INPUTS:\nVoice: fetch!\nVision: a red ball\n\n"));
        assert!(!prompt.user_content.contains(NO_INPUT_MARKER));
    }

    #[test]
    fn empty_buffer_is_omitted_not_marked() {
        let (fuser, _, vision) = fuser();
        vision.write("a cat");
        let prompt = fuser.build_prompt();
        assert!(prompt.user_content.contains("Vision: a cat"));
        assert!(!prompt.user_content.contains("Voice:"));
        assert!(!prompt.user_content.contains(NO_INPUT_MARKER));
    }

    #[test]
    fn fusion_is_deterministic() {
        let (fuser, voice, vision) = fuser();
        voice.write("hello");
        vision.write("a person waving");
        let now = Utc::now();
        assert_eq!(fuser.build_prompt_at(now), fuser.build_prompt_at(now));
        assert_eq!(fuser.build_prompt(), fuser.build_prompt());
    }

    #[test]
    fn system_context_section_order() {
        let (fuser, _, _) = fuser();
        let ctx = fuser.system_context();
        let base = ctx.find("You are a robot dog.").unwrap();
        let rules = ctx.find(RULES_HEADER).unwrap();
        let examples = ctx.find(EXAMPLES_HEADER).unwrap();
        let actions = ctx.find(ACTIONS_HEADER).unwrap();
        assert!(base < rules && rules < examples && examples < actions);
        assert!(ctx.contains("- sit: Sit down. No arguments."));
    }

    #[test]
    fn flat_prompt_uses_canonical_order() {
        let (fuser, voice, _) = fuser();
        voice.write("hello");
        let flat = fuser.build_flat_prompt();
        let positions: Vec<usize> = [
            "You are a robot dog.",
            INPUTS_HEADER,
            RULES_HEADER,
            EXAMPLES_HEADER,
            ACTIONS_HEADER,
            INSTRUCTION_FOOTER,
        ]
        .iter()
        .map(|needle| flat.find(needle).unwrap())
        .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn empty_sections_are_skipped() {
        let fuser = Fuser::new(PromptSections::new("Base."), vec![], vec![]);
        assert_eq!(fuser.system_context(), "Base.");
    }

    #[test]
    fn set_input_by_name() {
        let (fuser, voice, _) = fuser();
        fuser.set_input("mic", "sit").unwrap();
        assert_eq!(voice.snapshot().text, "sit");
        assert!(matches!(fuser.set_input("radar", "x"), Err(CortexError::InvalidConfig(_))));
    }

    #[test]
    fn building_does_not_consume_buffers() {
        let (fuser, voice, _) = fuser();
        voice.write("hello");
        let _ = fuser.build_prompt();
        assert_eq!(voice.snapshot().text, "hello");
    }

    #[test]
    fn stale_observations_are_treated_as_empty() {
        let voice = InputBuffer::new("mic", "Voice");
        let fuser = Fuser::new(PromptSections::new("Base."), vec![voice.clone()], vec![])
            .with_stale_after(Duration::from_secs(2));
        voice.write("hello");
        let written = voice.snapshot().updated_at;
        let fresh = fuser.build_prompt_at(written + chrono::Duration::seconds(1));
        assert!(fresh.user_content.contains("Voice: hello"));
        let stale = fuser.build_prompt_at(written + chrono::Duration::seconds(3));
        assert!(stale.user_content.contains(NO_INPUT_MARKER));
    }

    #[test]
    fn set_sections_rebuilds_cache() {
        let (mut fuser, _, _) = fuser();
        fuser.set_sections(PromptSections::new("You are a tour guide."));
        assert!(fuser.system_context().starts_with("You are a tour guide."));
        assert!(!fuser.system_context().contains(RULES_HEADER));
        assert!(fuser.system_context().contains(ACTIONS_HEADER));
    }

    #[test]
    fn current_observations_skip_empty() {
        let (fuser, _, vision) = fuser();
        vision.write("a ball");
        assert_eq!(fuser.current_observations(), vec!["a ball".to_string()]);
    }
}
