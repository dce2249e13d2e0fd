//! `cortex-fuser` – Input buffers and prompt fusion.
//!
//! Input plugins write their latest observation into an [`InputBuffer`]; once
//! per tick the [`Fuser`] reads every buffer in declared order and merges the
//! observations with the mode's static policy text into a [`FusedPrompt`].
//!
//! - [`buffer`] – single-slot, overwrite-semantics observation holders.
//! - [`fusion`] – deterministic prompt assembly.
//!
//! [`FusedPrompt`]: cortex_types::FusedPrompt

pub mod buffer;
pub mod fusion;

pub use buffer::InputBuffer;
pub use fusion::{Fuser, PromptSections, INSTRUCTION_FOOTER, NO_INPUT_MARKER};
