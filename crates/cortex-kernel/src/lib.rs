//! `cortex-kernel` – Validation & Regulation
//!
//! Everything the Reasoner emits passes through here before any connector
//! runs.  The kernel does not think; it enforces contracts.
//!
//! # Modules
//!
//! - [`output`] – [`parse_invocations`][output::parse_invocations]: turns the
//!   Reasoner's structured response into a list of
//!   [`ActionInvocation`][cortex_types::ActionInvocation]s, dropping items that
//!   cannot be recovered one by one.
//! - [`schema_gate`] – [`SchemaGate`][schema_gate::SchemaGate]: checks every
//!   invocation against its connector's
//!   [`ActionSchema`][cortex_types::ActionSchema] and applies the documented
//!   repairs (defaults, unknown fields, safe coercions).
//! - [`backoff`] – [`BackoffPolicy`][backoff::BackoffPolicy]: capped
//!   exponential delays for retries, input restarts and degraded cooldowns.

pub mod backoff;
pub mod output;
pub mod schema_gate;

pub use backoff::BackoffPolicy;
pub use output::{extract_json, parse_invocations, ParsedOutput};
pub use schema_gate::{Repair, SchemaGate, Validated, validate};
