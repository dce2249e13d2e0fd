//! [`CapabilityRegistry`] – maps configuration type names to constructors.
//!
//! Plugins are made available through explicit registration rather than
//! directory scanning.  A [`PluginSource`] (a plugin pack, a vendor crate, the
//! runtime's built-ins) registers factories into a [`RegistryBuilder`];
//! [`CapabilityRegistry::discover`] runs every source exactly once and freezes
//! the result.  After that the registry is read-only and is shared behind an
//! `Arc` for the rest of the process.
//!
//! # Resolution rules
//!
//! A `(role, type_name)` pair must match exactly one registration:
//!
//! | Matches | Result |
//! |---|---|
//! | 0 | [`CortexError::UnknownPlugin`] |
//! | 1 | the constructor |
//! | >1 (from different sources) | [`CortexError::AmbiguousPlugin`] |
//!
//! Registering the same name twice from the *same* source replaces the
//! earlier factory.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use cortex_plugin::{ActionConnector, CapabilityRegistry};
//! use cortex_types::{ActionSchema, CortexError, PluginDescriptor, PluginRole};
//! use serde_json::{Map, Value};
//!
//! struct Stop(ActionSchema);
//!
//! #[async_trait]
//! impl ActionConnector for Stop {
//!     fn schema(&self) -> &ActionSchema { &self.0 }
//!     async fn execute(&self, _: &Map<String, Value>) -> Result<Value, CortexError> {
//!         Ok(Value::Null)
//!     }
//! }
//!
//! let mut builder = CapabilityRegistry::builder();
//! builder.action("stop", |_| Ok(Arc::new(Stop(ActionSchema::new("stop", "Halt.")))));
//! let registry = builder.build();
//!
//! let stop = registry
//!     .instantiate_action(&PluginDescriptor::new(PluginRole::Action, "stop"))
//!     .unwrap();
//! assert_eq!(stop.name(), "stop");
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use cortex_types::{CortexError, PluginDescriptor, PluginRole};
use tracing::{debug, info, warn};

use crate::action::ActionConnector;
use crate::input::InputPlugin;
use crate::reasoner::Reasoner;

// ─────────────────────────────────────────────────────────────────────────────
// Factories
// ─────────────────────────────────────────────────────────────────────────────

pub type InputFactory =
    Arc<dyn Fn(&PluginDescriptor) -> Result<Box<dyn InputPlugin>, CortexError> + Send + Sync>;
pub type ReasonerFactory =
    Arc<dyn Fn(&PluginDescriptor) -> Result<Arc<dyn Reasoner>, CortexError> + Send + Sync>;
pub type ActionFactory =
    Arc<dyn Fn(&PluginDescriptor) -> Result<Arc<dyn ActionConnector>, CortexError> + Send + Sync>;

/// A registered constructor for one capability role.
#[derive(Clone)]
pub enum Constructor {
    Input(InputFactory),
    Reasoner(ReasonerFactory),
    Action(ActionFactory),
}

impl Constructor {
    pub fn role(&self) -> PluginRole {
        match self {
            Constructor::Input(_) => PluginRole::Input,
            Constructor::Reasoner(_) => PluginRole::Reasoner,
            Constructor::Action(_) => PluginRole::Action,
        }
    }
}

/// A live plugin produced by [`CapabilityRegistry::instantiate`].
pub enum PluginInstance {
    Input(Box<dyn InputPlugin>),
    Reasoner(Arc<dyn Reasoner>),
    Action(Arc<dyn ActionConnector>),
}

// ─────────────────────────────────────────────────────────────────────────────
// Sources
// ─────────────────────────────────────────────────────────────────────────────

/// A bundle of plugins that registers itself during discovery.
pub trait PluginSource {
    /// Name used in ambiguity diagnostics, e.g. `"builtin"` or `"unitree"`.
    fn name(&self) -> &str;

    /// Register every factory this source provides.
    fn register(&self, builder: &mut RegistryBuilder);
}

struct Registration {
    source: String,
    constructor: Constructor,
}

type Key = (PluginRole, String);

// ─────────────────────────────────────────────────────────────────────────────
// RegistryBuilder
// ─────────────────────────────────────────────────────────────────────────────

/// Mutable registration phase of a [`CapabilityRegistry`].
pub struct RegistryBuilder {
    entries: HashMap<Key, Vec<Registration>>,
    current_source: String,
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            current_source: "direct".to_string(),
        }
    }
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an input plugin factory under `type_name`.
    pub fn input<F>(&mut self, type_name: &str, factory: F) -> &mut Self
    where
        F: Fn(&PluginDescriptor) -> Result<Box<dyn InputPlugin>, CortexError> + Send + Sync + 'static,
    {
        self.insert(type_name, Constructor::Input(Arc::new(factory)))
    }

    /// Register a reasoner factory under `type_name`.
    pub fn reasoner<F>(&mut self, type_name: &str, factory: F) -> &mut Self
    where
        F: Fn(&PluginDescriptor) -> Result<Arc<dyn Reasoner>, CortexError> + Send + Sync + 'static,
    {
        self.insert(type_name, Constructor::Reasoner(Arc::new(factory)))
    }

    /// Register an action connector factory under `type_name`.
    pub fn action<F>(&mut self, type_name: &str, factory: F) -> &mut Self
    where
        F: Fn(&PluginDescriptor) -> Result<Arc<dyn ActionConnector>, CortexError>
            + Send
            + Sync
            + 'static,
    {
        self.insert(type_name, Constructor::Action(Arc::new(factory)))
    }

    /// Let `source` register its factories, attributing them to its name.
    pub fn source(&mut self, source: &dyn PluginSource) -> &mut Self {
        let previous = std::mem::replace(&mut self.current_source, source.name().to_string());
        source.register(self);
        self.current_source = previous;
        self
    }

    /// Freeze the registrations.
    pub fn build(self) -> CapabilityRegistry {
        let count: usize = self.entries.values().map(Vec::len).sum();
        info!(registrations = count, "capability registry built");
        CapabilityRegistry {
            entries: self.entries,
        }
    }

    fn insert(&mut self, type_name: &str, constructor: Constructor) -> &mut Self {
        let key = (constructor.role(), type_name.to_string());
        let slot = self.entries.entry(key).or_default();
        if let Some(existing) = slot.iter_mut().find(|r| r.source == self.current_source) {
            debug!(
                plugin = type_name,
                source = %self.current_source,
                "re-registration replaces previous factory"
            );
            existing.constructor = constructor;
        } else {
            slot.push(Registration {
                source: self.current_source.clone(),
                constructor,
            });
        }
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// CapabilityRegistry
// ─────────────────────────────────────────────────────────────────────────────

/// Read-only map from `(role, type_name)` to a plugin constructor.
pub struct CapabilityRegistry {
    entries: HashMap<Key, Vec<Registration>>,
}

impl CapabilityRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Run every source once and freeze the result.
    pub fn discover(sources: &[&dyn PluginSource]) -> Self {
        let mut builder = RegistryBuilder::new();
        for source in sources {
            debug!(source = source.name(), "discovering plugins");
            builder.source(*source);
        }
        builder.build()
    }

    /// Resolve `type_name` for `role` to exactly one constructor.
    ///
    /// # Errors
    ///
    /// [`CortexError::UnknownPlugin`] for zero matches,
    /// [`CortexError::AmbiguousPlugin`] for more than one.
    pub fn resolve(&self, role: PluginRole, type_name: &str) -> Result<&Constructor, CortexError> {
        let key = (role, type_name.to_string());
        match self.entries.get(&key).map(Vec::as_slice) {
            None | Some([]) => Err(CortexError::UnknownPlugin {
                role,
                type_name: type_name.to_string(),
            }),
            Some([only]) => Ok(&only.constructor),
            Some(many) => {
                let sources: Vec<&str> = many.iter().map(|r| r.source.as_str()).collect();
                warn!(plugin = type_name, %role, ?sources, "ambiguous plugin type");
                Err(CortexError::AmbiguousPlugin {
                    role,
                    type_name: type_name.to_string(),
                    candidates: many.len(),
                })
            }
        }
    }

    /// Check that every descriptor resolves, without instantiating anything.
    ///
    /// # Errors
    ///
    /// The first resolution error encountered, in descriptor order.
    pub fn check<'a>(
        &self,
        descriptors: impl IntoIterator<Item = &'a PluginDescriptor>,
    ) -> Result<(), CortexError> {
        for descriptor in descriptors {
            self.resolve(descriptor.role, &descriptor.type_name)?;
        }
        Ok(())
    }

    /// Resolve and construct the plugin described by `descriptor`.
    ///
    /// # Errors
    ///
    /// Resolution errors, or whatever the factory reports for an invalid
    /// configuration.
    pub fn instantiate(&self, descriptor: &PluginDescriptor) -> Result<PluginInstance, CortexError> {
        let instance = match self.resolve(descriptor.role, &descriptor.type_name)? {
            Constructor::Input(factory) => PluginInstance::Input(factory(descriptor)?),
            Constructor::Reasoner(factory) => PluginInstance::Reasoner(factory(descriptor)?),
            Constructor::Action(factory) => PluginInstance::Action(factory(descriptor)?),
        };
        debug!(plugin = %descriptor.type_name, role = %descriptor.role, "plugin instantiated");
        Ok(instance)
    }

    /// [`instantiate`][Self::instantiate] for an input descriptor.
    pub fn instantiate_input(
        &self,
        descriptor: &PluginDescriptor,
    ) -> Result<Box<dyn InputPlugin>, CortexError> {
        match self.instantiate(&Self::expect_role(descriptor, PluginRole::Input)?)? {
            PluginInstance::Input(input) => Ok(input),
            _ => Err(Self::role_mismatch(descriptor, PluginRole::Input)),
        }
    }

    /// [`instantiate`][Self::instantiate] for a reasoner descriptor.
    pub fn instantiate_reasoner(
        &self,
        descriptor: &PluginDescriptor,
    ) -> Result<Arc<dyn Reasoner>, CortexError> {
        match self.instantiate(&Self::expect_role(descriptor, PluginRole::Reasoner)?)? {
            PluginInstance::Reasoner(reasoner) => Ok(reasoner),
            _ => Err(Self::role_mismatch(descriptor, PluginRole::Reasoner)),
        }
    }

    /// [`instantiate`][Self::instantiate] for an action descriptor.
    pub fn instantiate_action(
        &self,
        descriptor: &PluginDescriptor,
    ) -> Result<Arc<dyn ActionConnector>, CortexError> {
        match self.instantiate(&Self::expect_role(descriptor, PluginRole::Action)?)? {
            PluginInstance::Action(action) => Ok(action),
            _ => Err(Self::role_mismatch(descriptor, PluginRole::Action)),
        }
    }

    /// Registered type names for `role`, sorted.
    pub fn type_names(&self, role: PluginRole) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .entries
            .keys()
            .filter(|(r, _)| *r == role)
            .map(|(_, name)| name.as_str())
            .collect();
        names.sort_unstable();
        names
    }

    fn expect_role(
        descriptor: &PluginDescriptor,
        role: PluginRole,
    ) -> Result<PluginDescriptor, CortexError> {
        if descriptor.role == role {
            Ok(descriptor.clone())
        } else {
            Err(Self::role_mismatch(descriptor, role))
        }
    }

    fn role_mismatch(descriptor: &PluginDescriptor, expected: PluginRole) -> CortexError {
        CortexError::InvalidConfig(format!(
            "plugin '{}' is declared as {} but used as {expected}",
            descriptor.type_name, descriptor.role
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cortex_types::ActionSchema;
    use serde_json::{Map, Value};

    // ------------------------------------------------------------------
    // Test doubles
    // ------------------------------------------------------------------

    struct MockAction(ActionSchema);

    #[async_trait]
    impl ActionConnector for MockAction {
        fn schema(&self) -> &ActionSchema {
            &self.0
        }
        async fn execute(&self, _: &Map<String, Value>) -> Result<Value, CortexError> {
            Ok(Value::Null)
        }
    }

    struct MockInput(String);

    #[async_trait]
    impl InputPlugin for MockInput {
        fn descriptor(&self) -> &str {
            &self.0
        }
        async fn next_observation(&mut self) -> Result<Option<String>, CortexError> {
            Ok(None)
        }
    }

    struct MockReasoner;

    #[async_trait]
    impl Reasoner for MockReasoner {
        fn name(&self) -> &str {
            "mock"
        }
        async fn ask(&self, _: &str, _: &str, _: &Value) -> Result<Value, CortexError> {
            Ok(Value::Array(vec![]))
        }
    }

    struct Pack(&'static str);

    impl PluginSource for Pack {
        fn name(&self) -> &str {
            self.0
        }
        fn register(&self, builder: &mut RegistryBuilder) {
            builder.action("speak", |_| {
                Ok(Arc::new(MockAction(ActionSchema::new("speak", "Say it."))))
            });
        }
    }

    fn populated() -> CapabilityRegistry {
        let mut builder = CapabilityRegistry::builder();
        builder
            .input("mic", |d| {
                let label = d.str_setting("descriptor").unwrap_or("Voice").to_string();
                Ok(Box::new(MockInput(label)))
            })
            .reasoner("mock", |_| Ok(Arc::new(MockReasoner)))
            .action("stop", |_| Ok(Arc::new(MockAction(ActionSchema::new("stop", "Halt.")))));
        builder.build()
    }

    // ------------------------------------------------------------------
    // Tests
    // ------------------------------------------------------------------

    #[test]
    fn resolves_each_role() {
        let registry = populated();
        assert_eq!(registry.resolve(PluginRole::Input, "mic").unwrap().role(), PluginRole::Input);
        assert_eq!(
            registry.resolve(PluginRole::Reasoner, "mock").unwrap().role(),
            PluginRole::Reasoner
        );
        assert_eq!(registry.resolve(PluginRole::Action, "stop").unwrap().role(), PluginRole::Action);
    }

    #[test]
    fn unknown_type_is_reported() {
        let registry = populated();
        let err = registry.resolve(PluginRole::Action, "fly").err().unwrap();
        assert!(matches!(err, CortexError::UnknownPlugin { role: PluginRole::Action, .. }));
    }

    #[test]
    fn name_registered_for_other_role_is_unknown() {
        let registry = populated();
        assert!(matches!(
            registry.resolve(PluginRole::Action, "mic"),
            Err(CortexError::UnknownPlugin { .. })
        ));
    }

    #[test]
    fn same_name_from_two_sources_is_ambiguous() {
        let registry = CapabilityRegistry::discover(&[&Pack("vendor_a"), &Pack("vendor_b")]);
        let err = registry.resolve(PluginRole::Action, "speak").err().unwrap();
        assert_eq!(
            err,
            CortexError::AmbiguousPlugin {
                role: PluginRole::Action,
                type_name: "speak".into(),
                candidates: 2,
            }
        );
    }

    #[test]
    fn re_registration_within_one_source_replaces() {
        let registry = CapabilityRegistry::discover(&[&Pack("vendor_a")]);
        let mut builder = RegistryBuilder::new();
        builder.source(&Pack("vendor_a")).source(&Pack("vendor_a"));
        let rebuilt = builder.build();
        assert!(registry.resolve(PluginRole::Action, "speak").is_ok());
        assert!(rebuilt.resolve(PluginRole::Action, "speak").is_ok());
    }

    #[test]
    fn instantiate_passes_descriptor_config() {
        let registry = populated();
        let descriptor =
            PluginDescriptor::new(PluginRole::Input, "mic").with_setting("descriptor", "Microphone");
        let input = registry.instantiate_input(&descriptor).unwrap();
        assert_eq!(input.descriptor(), "Microphone");
    }

    #[test]
    fn typed_instantiate_rejects_role_mismatch() {
        let registry = populated();
        let descriptor = PluginDescriptor::new(PluginRole::Action, "stop");
        assert!(matches!(
            registry.instantiate_reasoner(&descriptor),
            Err(CortexError::InvalidConfig(_))
        ));
        assert_eq!(registry.instantiate_action(&descriptor).unwrap().name(), "stop");
    }

    #[test]
    fn factory_errors_propagate() {
        let mut builder = CapabilityRegistry::builder();
        builder.reasoner("needs_model", |d| {
            d.require_str("model")?;
            Ok(Arc::new(MockReasoner))
        });
        let registry = builder.build();
        let err = registry
            .instantiate_reasoner(&PluginDescriptor::new(PluginRole::Reasoner, "needs_model"))
            .err()
            .unwrap();
        assert_eq!(err, CortexError::MissingConfigKey("needs_model.config.model".into()));
    }

    #[test]
    fn check_reports_first_unresolvable_descriptor() {
        let registry = populated();
        let descriptors = vec![
            PluginDescriptor::new(PluginRole::Input, "mic"),
            PluginDescriptor::new(PluginRole::Action, "warp"),
        ];
        assert!(matches!(
            registry.check(&descriptors),
            Err(CortexError::UnknownPlugin { .. })
        ));
        assert!(registry.check(&descriptors[..1]).is_ok());
    }

    #[test]
    fn type_names_are_sorted_per_role() {
        let registry = CapabilityRegistry::discover(&[&Pack("a")]);
        assert_eq!(registry.type_names(PluginRole::Action), vec!["speak"]);
        assert!(registry.type_names(PluginRole::Input).is_empty());
    }
}
