//! Declarative argument schemas for action connectors.
//!
//! An [`ActionSchema`] is the single source of truth for what an action
//! accepts.  It is used three ways:
//!
//! 1. [`ActionSchema::describe`] renders the one-line capability text that the
//!    Fuser places in the prompt's action catalogue.
//! 2. [`ActionSchema::to_json_schema`] renders the JSON Schema handed to the
//!    Reasoner so it can emit strictly typed calls.
//! 3. The kernel's schema gate validates and repairs incoming arguments
//!    against the [`FieldSpec`]s.
//!
//! Schemas can be written by hand or derived from a typed argument struct:
//!
//! ```rust
//! use cortex_types::schema::{ActionSchema, FieldKind, FieldSpec};
//!
//! let speak = ActionSchema::new("speak", "Say a sentence out loud.")
//!     .field(FieldSpec::required("text", FieldKind::String).describe("What to say"))
//!     .field(
//!         FieldSpec::optional("emotion", FieldKind::Enum(vec!["joy".into(), "calm".into()]))
//!             .with_default("calm"),
//!     );
//!
//! assert!(speak.describe().starts_with("speak: Say a sentence out loud."));
//! ```

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::CortexError;

// ─────────────────────────────────────────────────────────────────────────────
// Field kinds
// ─────────────────────────────────────────────────────────────────────────────

/// The value type a single argument must have.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    String,
    Number,
    Integer,
    Boolean,
    /// A string restricted to one of the listed values.
    Enum(Vec<String>),
    Object,
    Array,
    /// No type constraint.
    Any,
}

impl FieldKind {
    fn json_type(&self) -> Option<&'static str> {
        match self {
            FieldKind::String | FieldKind::Enum(_) => Some("string"),
            FieldKind::Number => Some("number"),
            FieldKind::Integer => Some("integer"),
            FieldKind::Boolean => Some("boolean"),
            FieldKind::Object => Some("object"),
            FieldKind::Array => Some("array"),
            FieldKind::Any => None,
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldKind::Enum(values) => write!(f, "one of {}", values.join("|")),
            FieldKind::Any => write!(f, "any"),
            other => write!(f, "{}", other.json_type().unwrap_or("any")),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// FieldSpec
// ─────────────────────────────────────────────────────────────────────────────

/// Declaration of a single action argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub required: bool,
    /// Documented default used to repair an omitted optional field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl FieldSpec {
    pub fn required(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            description: String::new(),
            required: true,
            default: None,
        }
    }

    pub fn optional(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            required: false,
            ..Self::required(name, kind)
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = Some(default.into());
        self
    }

    fn to_json_schema(&self) -> Value {
        let mut prop = Map::new();
        if let Some(ty) = self.kind.json_type() {
            prop.insert("type".into(), json!(ty));
        }
        if let FieldKind::Enum(values) = &self.kind {
            prop.insert("enum".into(), json!(values));
        }
        if !self.description.is_empty() {
            prop.insert("description".into(), json!(self.description));
        }
        if let Some(default) = &self.default {
            prop.insert("default".into(), default.clone());
        }
        Value::Object(prop)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ActionSchema
// ─────────────────────────────────────────────────────────────────────────────

/// Name, one-line purpose and argument list of an action connector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSchema {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
}

impl ActionSchema {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            fields: Vec::new(),
        }
    }

    /// Append an argument declaration.
    pub fn field(mut self, spec: FieldSpec) -> Self {
        self.fields.push(spec);
        self
    }

    /// Look up an argument declaration by name.
    pub fn field_spec(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// One-line capability description for the prompt's action catalogue.
    ///
    /// Fields are listed in declaration order so the text is stable.
    pub fn describe(&self) -> String {
        let mut line = format!("{}: {}", self.name, self.description.trim());
        if self.fields.is_empty() {
            line.push_str(" No arguments.");
            return line;
        }
        let args: Vec<String> = self
            .fields
            .iter()
            .map(|f| {
                let mut arg = format!("{} ({}", f.name, f.kind);
                if f.required {
                    arg.push_str(", required");
                } else {
                    arg.push_str(", optional");
                }
                if let Some(default) = &f.default {
                    arg.push_str(&format!(", default {default}"));
                }
                arg.push(')');
                if !f.description.is_empty() {
                    arg.push_str(&format!(" - {}", f.description));
                }
                arg
            })
            .collect();
        line.push_str(" Arguments: ");
        line.push_str(&args.join("; "));
        line
    }

    /// JSON Schema for this action's arguments object.
    pub fn to_json_schema(&self) -> Value {
        let properties: Map<String, Value> = self
            .fields
            .iter()
            .map(|f| (f.name.clone(), f.to_json_schema()))
            .collect();
        let required: Vec<&str> = self
            .fields
            .iter()
            .filter(|f| f.required)
            .map(|f| f.name.as_str())
            .collect();
        json!({
            "type": "object",
            "description": self.description,
            "properties": properties,
            "required": required,
        })
    }

    /// Build a schema from a typed argument struct via its `schemars` schema.
    ///
    /// Field doc comments become descriptions; `Option<T>` fields become
    /// optional. Fields keep their declaration order.
    ///
    /// # Errors
    ///
    /// Returns [`CortexError::InvalidConfig`] when `T` does not describe an
    /// object.
    pub fn derive<T: JsonSchema>(
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Result<Self, CortexError> {
        let root = serde_json::to_value(schemars::schema_for!(T))
            .map_err(|e| CortexError::InvalidConfig(format!("schema serialisation: {e}")))?;
        Self::from_json_schema(name, description, &root)
    }

    /// Build a schema from a JSON Schema object document.
    ///
    /// `$ref`s into `definitions` / `$defs` are resolved one level deep and
    /// nullable unions (`["string", "null"]`, `anyOf: [T, null]`) collapse to
    /// `T`.
    ///
    /// # Errors
    ///
    /// Returns [`CortexError::InvalidConfig`] when the document has no
    /// `properties` object.
    pub fn from_json_schema(
        name: impl Into<String>,
        description: impl Into<String>,
        root: &Value,
    ) -> Result<Self, CortexError> {
        let name = name.into();
        let properties = root
            .get("properties")
            .and_then(Value::as_object)
            .ok_or_else(|| {
                CortexError::InvalidConfig(format!("schema for '{name}' has no properties object"))
            })?;
        let required: Vec<&str> = root
            .get("required")
            .and_then(Value::as_array)
            .map(|r| r.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        let mut schema = Self::new(name, description);
        for (field, prop) in properties {
            let resolved = resolve_property(root, prop);
            let mut spec = if required.contains(&field.as_str()) {
                FieldSpec::required(field.clone(), kind_of(&resolved))
            } else {
                FieldSpec::optional(field.clone(), kind_of(&resolved))
            };
            if let Some(text) = prop
                .get("description")
                .or_else(|| resolved.get("description"))
                .and_then(Value::as_str)
            {
                spec.description = text.to_string();
            }
            spec.default = prop.get("default").or_else(|| resolved.get("default")).cloned();
            schema.fields.push(spec);
        }
        Ok(schema)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// JSON Schema helpers
// ─────────────────────────────────────────────────────────────────────────────

fn resolve_ref<'a>(root: &'a Value, reference: &str) -> Option<&'a Value> {
    let key = reference
        .strip_prefix("#/definitions/")
        .map(|k| ("definitions", k))
        .or_else(|| reference.strip_prefix("#/$defs/").map(|k| ("$defs", k)))?;
    root.get(key.0)?.get(key.1)
}

/// Follow `$ref`, single-branch `allOf` and nullable `anyOf`/`oneOf`.
fn resolve_property(root: &Value, prop: &Value) -> Value {
    if let Some(reference) = prop.get("$ref").and_then(Value::as_str) {
        if let Some(target) = resolve_ref(root, reference) {
            return resolve_property(root, target);
        }
    }
    for key in ["allOf", "anyOf", "oneOf"] {
        if let Some(branches) = prop.get(key).and_then(Value::as_array) {
            let non_null: Vec<&Value> = branches
                .iter()
                .filter(|b| b.get("type").and_then(Value::as_str) != Some("null"))
                .collect();
            if let [only] = non_null.as_slice() {
                return resolve_property(root, only);
            }
        }
    }
    prop.clone()
}

fn kind_of(prop: &Value) -> FieldKind {
    if let Some(values) = prop.get("enum").and_then(Value::as_array) {
        let names: Vec<String> = values
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect();
        if !names.is_empty() {
            return FieldKind::Enum(names);
        }
    }
    let ty = match prop.get("type") {
        Some(Value::String(t)) => Some(t.as_str()),
        Some(Value::Array(types)) => types
            .iter()
            .filter_map(Value::as_str)
            .find(|t| *t != "null"),
        _ => None,
    };
    match ty {
        Some("string") => FieldKind::String,
        Some("number") => FieldKind::Number,
        Some("integer") => FieldKind::Integer,
        Some("boolean") => FieldKind::Boolean,
        Some("object") => FieldKind::Object,
        Some("array") => FieldKind::Array,
        _ => FieldKind::Any,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn speak_schema() -> ActionSchema {
        ActionSchema::new("speak", "Say a sentence out loud.")
            .field(FieldSpec::required("text", FieldKind::String).describe("What to say"))
            .field(
                FieldSpec::optional("emotion", FieldKind::Enum(vec!["joy".into(), "calm".into()]))
                    .with_default("calm"),
            )
    }

    #[test]
    fn describe_lists_fields_in_declaration_order() {
        assert_eq!(
            speak_schema().describe(),
            "speak: Say a sentence out loud. Arguments: text (string, required) - What to say; \
             emotion (one of joy|calm, optional, default \"calm\")"
        );
    }

    #[test]
    fn describe_without_fields() {
        let stop = ActionSchema::new("stop", "Halt all motion.");
        assert_eq!(stop.describe(), "stop: Halt all motion. No arguments.");
    }

    #[test]
    fn json_schema_marks_required_fields() {
        let schema = speak_schema().to_json_schema();
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["required"], json!(["text"]));
        assert_eq!(schema["properties"]["emotion"]["enum"], json!(["joy", "calm"]));
        assert_eq!(schema["properties"]["emotion"]["default"], json!("calm"));
    }

    #[test]
    fn from_json_schema_resolves_refs_and_nullable_types() {
        let doc = json!({
            "type": "object",
            "required": ["direction"],
            "properties": {
                "direction": {"$ref": "#/definitions/Direction"},
                "speed": {"type": ["number", "null"], "default": 0.5}
            },
            "definitions": {
                "Direction": {"type": "string", "enum": ["left", "right"]}
            }
        });
        let schema = ActionSchema::from_json_schema("turn", "Turn in place.", &doc).unwrap();
        let direction = schema.field_spec("direction").unwrap();
        assert!(direction.required);
        assert_eq!(direction.kind, FieldKind::Enum(vec!["left".into(), "right".into()]));
        let speed = schema.field_spec("speed").unwrap();
        assert!(!speed.required);
        assert_eq!(speed.kind, FieldKind::Number);
        assert_eq!(speed.default, Some(json!(0.5)));
    }

    #[test]
    fn from_json_schema_rejects_non_objects() {
        let err = ActionSchema::from_json_schema("bad", "", &json!({"type": "string"})).unwrap_err();
        assert!(matches!(err, CortexError::InvalidConfig(_)));
    }

    #[allow(dead_code)]
    #[derive(JsonSchema)]
    struct MoveArgs {
        /// Distance to travel in metres.
        distance: f64,
        repeat: u32,
        label: Option<String>,
    }

    #[test]
    fn derive_from_typed_arguments() {
        let schema = ActionSchema::derive::<MoveArgs>("move", "Drive forward.").unwrap();
        let distance = schema.field_spec("distance").unwrap();
        assert!(distance.required);
        assert_eq!(distance.kind, FieldKind::Number);
        assert_eq!(distance.description, "Distance to travel in metres.");
        assert_eq!(schema.field_spec("repeat").unwrap().kind, FieldKind::Integer);
        let label = schema.field_spec("label").unwrap();
        assert!(!label.required);
        assert_eq!(label.kind, FieldKind::String);
    }

    #[test]
    fn derived_fields_keep_declaration_order() {
        let schema = ActionSchema::derive::<MoveArgs>("move", "Drive forward.").unwrap();
        let names: Vec<&str> = schema.fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["distance", "repeat", "label"]);
        let line = schema.describe();
        let distance = line.find("distance").unwrap();
        let label = line.find("label").unwrap();
        assert!(distance < label, "{line}");
    }
}
