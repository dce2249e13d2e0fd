//! [`SchemaGate`] – argument validation and repair for action invocations.
//!
//! Before an [`ActionInvocation`] reaches its connector it is checked against
//! the connector's [`ActionSchema`].  The gate applies a fixed set of repairs,
//! each reported as a [`Repair`] and logged at `warn`:
//!
//! 1. A missing optional field with a documented default is filled in.
//! 2. An argument the schema does not declare is removed, and so is an
//!    explicit `null` for an optional field without a default.
//! 3. Known-safe coercions: numeric strings for `number`/`integer` fields,
//!    `"true"`/`"false"` for booleans, case-insensitive enum matches and
//!    integral floats for `integer` fields.
//!
//! Anything else (a missing required field, a value of the wrong type that no
//! coercion covers) yields [`CortexError::SchemaValidation`] and the
//! invocation must be dropped.
//!
//! # Example
//!
//! ```
//! use cortex_kernel::SchemaGate;
//! use cortex_types::{ActionInvocation, ActionSchema, FieldKind, FieldSpec};
//! use serde_json::json;
//!
//! let mut gate = SchemaGate::new();
//! gate.register(
//!     ActionSchema::new("speak", "Say it.")
//!         .field(FieldSpec::required("text", FieldKind::String))
//!         .field(FieldSpec::optional("volume", FieldKind::Integer).with_default(5)),
//! );
//!
//! let raw: ActionInvocation =
//!     serde_json::from_value(json!({"action": "speak", "arguments": {"text": "hi"}})).unwrap();
//! let checked = gate.check(&raw).unwrap();
//! assert_eq!(checked.invocation.argument("volume"), Some(&json!(5)));
//! assert_eq!(checked.repairs.len(), 1);
//!
//! let missing = ActionInvocation::bare("speak");
//! assert!(gate.check(&missing).is_err());
//! ```

use std::collections::HashMap;
use std::fmt;

use cortex_types::{ActionInvocation, ActionSchema, CortexError, FieldKind, FieldSpec};
use serde_json::{Map, Number, Value};
use tracing::warn;

// ────────────────────────────────────────────────────────────────────────────
// Repairs
// ────────────────────────────────────────────────────────────────────────────

/// A single fix applied to an invocation's arguments.
#[derive(Debug, Clone, PartialEq)]
pub enum Repair {
    DefaultFilled { field: String, value: Value },
    UnknownRemoved { field: String },
    NullDropped { field: String },
    Coerced { field: String, from: Value, to: Value },
}

impl fmt::Display for Repair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Repair::DefaultFilled { field, value } => {
                write!(f, "filled default {value} for '{field}'")
            }
            Repair::UnknownRemoved { field } => write!(f, "removed unknown field '{field}'"),
            Repair::NullDropped { field } => write!(f, "dropped null optional field '{field}'"),
            Repair::Coerced { field, from, to } => write!(f, "coerced '{field}' from {from} to {to}"),
        }
    }
}

/// A schema-conformant invocation plus the repairs it took to get there.
#[derive(Debug, Clone, PartialEq)]
pub struct Validated {
    pub invocation: ActionInvocation,
    pub repairs: Vec<Repair>,
}

// ────────────────────────────────────────────────────────────────────────────
// validate
// ────────────────────────────────────────────────────────────────────────────

/// Validate and repair `invocation` against `schema`.
///
/// # Errors
///
/// [`CortexError::SchemaValidation`] naming the first offending field.
pub fn validate(schema: &ActionSchema, invocation: &ActionInvocation) -> Result<Validated, CortexError> {
    let mut repairs = Vec::new();
    let mut arguments = Map::new();

    for (key, value) in &invocation.arguments {
        if schema.field_spec(key).is_none() {
            repairs.push(Repair::UnknownRemoved { field: key.clone() });
            continue;
        }
        arguments.insert(key.clone(), value.clone());
    }

    for spec in &schema.fields {
        let present = arguments.get(&spec.name).filter(|v| !v.is_null()).cloned();
        match present {
            Some(value) => {
                let fixed = conform(schema, spec, value.clone())?;
                if fixed != value {
                    repairs.push(Repair::Coerced {
                        field: spec.name.clone(),
                        from: value,
                        to: fixed.clone(),
                    });
                }
                arguments.insert(spec.name.clone(), fixed);
            }
            None if spec.required => {
                return Err(violation(schema, spec, "required field is missing"));
            }
            None => {
                let was_null = arguments.remove(&spec.name).is_some();
                if let Some(default) = &spec.default {
                    repairs.push(Repair::DefaultFilled {
                        field: spec.name.clone(),
                        value: default.clone(),
                    });
                    arguments.insert(spec.name.clone(), default.clone());
                } else if was_null {
                    repairs.push(Repair::NullDropped { field: spec.name.clone() });
                }
            }
        }
    }

    for repair in &repairs {
        warn!(action = %schema.name, %repair, "invocation repaired");
    }

    Ok(Validated {
        invocation: ActionInvocation::new(invocation.action_name.clone(), arguments),
        repairs,
    })
}

fn violation(schema: &ActionSchema, spec: &FieldSpec, reason: impl Into<String>) -> CortexError {
    CortexError::SchemaValidation {
        action: schema.name.clone(),
        field: spec.name.clone(),
        reason: reason.into(),
    }
}

/// Bring `value` into the shape `spec.kind` demands, or fail.
fn conform(schema: &ActionSchema, spec: &FieldSpec, value: Value) -> Result<Value, CortexError> {
    let mismatch = |value: &Value| violation(schema, spec, format!("expected {}, got {value}", spec.kind));

    match (&spec.kind, value) {
        (FieldKind::Any, v) => Ok(v),
        (FieldKind::String, v @ Value::String(_)) => Ok(v),
        (FieldKind::Boolean, v @ Value::Bool(_)) => Ok(v),
        (FieldKind::Object, v @ Value::Object(_)) => Ok(v),
        (FieldKind::Array, v @ Value::Array(_)) => Ok(v),
        (FieldKind::Number, v @ Value::Number(_)) => Ok(v),

        (FieldKind::Number, Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(number_from_f64)
            .ok_or_else(|| mismatch(&Value::String(s))),

        (FieldKind::Integer, Value::Number(n)) => {
            if n.is_i64() || n.is_u64() {
                Ok(Value::Number(n))
            } else {
                integral(n.as_f64()).ok_or_else(|| mismatch(&Value::Number(n)))
            }
        }
        (FieldKind::Integer, Value::String(s)) => {
            let parsed = match s.trim().parse::<i64>() {
                Ok(i) => Some(Value::from(i)),
                Err(_) => integral(s.trim().parse::<f64>().ok()),
            };
            parsed.ok_or_else(|| mismatch(&Value::String(s)))
        }

        (FieldKind::Boolean, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            _ => Err(mismatch(&Value::String(s))),
        },

        (FieldKind::Enum(allowed), Value::String(s)) => {
            if allowed.contains(&s) {
                return Ok(Value::String(s));
            }
            allowed
                .iter()
                .find(|candidate| candidate.eq_ignore_ascii_case(s.trim()))
                .map(|candidate| Value::String(candidate.clone()))
                .ok_or_else(|| violation(schema, spec, format!("'{s}' is not {}", spec.kind)))
        }

        (_, other) => Err(mismatch(&other)),
    }
}

fn number_from_f64(f: f64) -> Option<Value> {
    Number::from_f64(f).map(Value::Number)
}

fn integral(f: Option<f64>) -> Option<Value> {
    let f = f?;
    if f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
        Some(Value::from(f as i64))
    } else {
        None
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SchemaGate
// ────────────────────────────────────────────────────────────────────────────

/// Schema lookup by action name plus [`validate`].
#[derive(Debug, Default, Clone)]
pub struct SchemaGate {
    schemas: HashMap<String, ActionSchema>,
}

impl SchemaGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the schema for `schema.name`.
    pub fn register(&mut self, schema: ActionSchema) {
        self.schemas.insert(schema.name.clone(), schema);
    }

    pub fn schema(&self, action: &str) -> Option<&ActionSchema> {
        self.schemas.get(action)
    }

    /// Validate `invocation` against the schema registered for its action.
    ///
    /// # Errors
    ///
    /// [`CortexError::ConnectorNotFound`] for an unregistered action name, or
    /// the [`validate`] error.
    pub fn check(&self, invocation: &ActionInvocation) -> Result<Validated, CortexError> {
        let schema = self
            .schemas
            .get(&invocation.action_name)
            .ok_or_else(|| CortexError::ConnectorNotFound(invocation.action_name.clone()))?;
        validate(schema, invocation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("arguments must be an object"),
        }
    }

    fn move_schema() -> ActionSchema {
        ActionSchema::new("move", "Drive the base.")
            .field(FieldSpec::required("distance", FieldKind::Number))
            .field(FieldSpec::optional("repeat", FieldKind::Integer).with_default(1))
            .field(FieldSpec::optional("careful", FieldKind::Boolean))
            .field(
                FieldSpec::optional(
                    "gait",
                    FieldKind::Enum(vec!["walk".into(), "trot".into()]),
                )
                .with_default("walk"),
            )
    }

    #[test]
    fn conforming_invocation_passes_untouched() {
        let inv = ActionInvocation::new(
            "move",
            args(json!({"distance": 1.5, "repeat": 2, "careful": true, "gait": "trot"})),
        );
        let checked = validate(&move_schema(), &inv).unwrap();
        assert!(checked.repairs.is_empty());
        assert_eq!(checked.invocation, inv);
    }

    #[test]
    fn missing_optional_defaults_are_filled() {
        let inv = ActionInvocation::new("move", args(json!({"distance": 1.0})));
        let checked = validate(&move_schema(), &inv).unwrap();
        assert_eq!(checked.invocation.argument("repeat"), Some(&json!(1)));
        assert_eq!(checked.invocation.argument("gait"), Some(&json!("walk")));
        assert_eq!(checked.invocation.argument("careful"), None);
        assert_eq!(checked.repairs.len(), 2);
        assert!(matches!(&checked.repairs[0], Repair::DefaultFilled { field, .. } if field == "repeat"));
    }

    #[test]
    fn missing_required_is_a_validation_error() {
        let inv = ActionInvocation::new("move", args(json!({"repeat": 3})));
        let err = validate(&move_schema(), &inv).unwrap_err();
        assert_eq!(
            err,
            CortexError::SchemaValidation {
                action: "move".into(),
                field: "distance".into(),
                reason: "required field is missing".into(),
            }
        );
    }

    #[test]
    fn null_required_counts_as_missing() {
        let inv = ActionInvocation::new("move", args(json!({"distance": null})));
        assert!(validate(&move_schema(), &inv).is_err());
    }

    #[test]
    fn null_optional_is_dropped_and_reported() {
        let inv = ActionInvocation::new("move", args(json!({"distance": 1, "careful": null})));
        let checked = validate(&move_schema(), &inv).unwrap();
        assert_eq!(checked.invocation.argument("careful"), None);
        assert!(checked
            .repairs
            .contains(&Repair::NullDropped { field: "careful".into() }));
        assert_eq!(
            Repair::NullDropped { field: "careful".into() }.to_string(),
            "dropped null optional field 'careful'"
        );
    }

    #[test]
    fn null_optional_with_default_gets_the_default() {
        let inv = ActionInvocation::new("move", args(json!({"distance": 1, "gait": null})));
        let checked = validate(&move_schema(), &inv).unwrap();
        assert_eq!(checked.invocation.argument("gait"), Some(&json!("walk")));
        assert!(!checked.repairs.iter().any(|r| matches!(r, Repair::NullDropped { .. })));
    }

    #[test]
    fn unknown_fields_are_removed() {
        let inv = ActionInvocation::new("move", args(json!({"distance": 1, "speed": "max"})));
        let checked = validate(&move_schema(), &inv).unwrap();
        assert_eq!(checked.invocation.argument("speed"), None);
        assert!(checked
            .repairs
            .contains(&Repair::UnknownRemoved { field: "speed".into() }));
    }

    #[test]
    fn safe_coercions_are_applied() {
        let inv = ActionInvocation::new(
            "move",
            args(json!({"distance": "2.5", "repeat": 3.0, "careful": "TRUE", "gait": "Trot"})),
        );
        let checked = validate(&move_schema(), &inv).unwrap();
        assert_eq!(checked.invocation.argument("distance"), Some(&json!(2.5)));
        assert_eq!(checked.invocation.argument("repeat"), Some(&json!(3)));
        assert_eq!(checked.invocation.argument("careful"), Some(&json!(true)));
        assert_eq!(checked.invocation.argument("gait"), Some(&json!("trot")));
        assert_eq!(checked.repairs.len(), 4);
    }

    #[test]
    fn integer_from_numeric_string() {
        let inv = ActionInvocation::new("move", args(json!({"distance": 1, "repeat": "4"})));
        let checked = validate(&move_schema(), &inv).unwrap();
        assert_eq!(checked.invocation.argument("repeat"), Some(&json!(4)));
    }

    #[test]
    fn irreparable_types_are_rejected() {
        for bad in [
            json!({"distance": "far"}),
            json!({"distance": 1, "repeat": 2.5}),
            json!({"distance": 1, "careful": "maybe"}),
            json!({"distance": 1, "gait": "gallop"}),
            json!({"distance": [1]}),
        ] {
            let inv = ActionInvocation::new("move", args(bad.clone()));
            assert!(
                matches!(validate(&move_schema(), &inv), Err(CortexError::SchemaValidation { .. })),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn gate_reports_unknown_action() {
        let mut gate = SchemaGate::new();
        gate.register(move_schema());
        let err = gate.check(&ActionInvocation::bare("fly")).unwrap_err();
        assert_eq!(err, CortexError::ConnectorNotFound("fly".into()));
        assert!(gate.schema("move").is_some());
    }

    #[test]
    fn repair_display() {
        let repair = Repair::Coerced {
            field: "repeat".into(),
            from: json!("4"),
            to: json!(4),
        };
        assert_eq!(repair.to_string(), r#"coerced 'repeat' from "4" to 4"#);
    }
}
