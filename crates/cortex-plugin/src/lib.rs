//! `cortex-plugin` – Pluggable capabilities and the Capability Registry.
//!
//! The runtime never talks to a concrete sensor, model or actuator.  It talks
//! to three traits and lets the registry map configuration type names onto
//! implementations:
//!
//! - [`input`] – [`InputPlugin`][input::InputPlugin]: an asynchronous source
//!   of textual observations with a one-line descriptor.
//! - [`reasoner`] – [`Reasoner`][reasoner::Reasoner]: turns a fused prompt and
//!   an action schema into a structured response.
//! - [`action`] – [`ActionConnector`][action::ActionConnector]: executes one
//!   kind of action and declares its argument schema.
//! - [`registry`] – [`CapabilityRegistry`][registry::CapabilityRegistry]:
//!   resolves `(role, type_name)` to exactly one constructor and instantiates
//!   it from a [`PluginDescriptor`][cortex_types::PluginDescriptor].

pub mod action;
pub mod input;
pub mod reasoner;
pub mod registry;

pub use action::ActionConnector;
pub use input::InputPlugin;
pub use reasoner::Reasoner;
pub use registry::{CapabilityRegistry, Constructor, PluginInstance, PluginSource, RegistryBuilder};
