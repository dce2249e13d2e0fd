//! Tracing and OpenTelemetry setup.
//!
//! Call [`init_tracing`] once at process startup and keep the returned guard
//! alive until exit.
//!
//! # Environment variables
//!
//! | Variable | Effect |
//! |---|---|
//! | `RUST_LOG` | Log filter (default `"info"`). |
//! | `CORTEX_LOG_FORMAT=json` | Newline-delimited JSON logs instead of the compact format. |
//! | `OTEL_EXPORTER_OTLP_ENDPOINT` | OTLP/HTTP collector base URL (e.g. `http://localhost:4318`). Enables span export. |
//!
//! Every tick runs in a `tick` span carrying the tick id and mode name, so a
//! collector shows one trace per tick with the Reasoner call and each action
//! nested inside.
//!
//! # Example
//!
//! ```rust,no_run
//! let _guard = cortex_runtime::telemetry::init_tracing("cortex");
//! ```

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{Resource, trace::SdkTracerProvider};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Tracer name used for every exported span.
const TRACER_NAME: &str = "cortex";

const DEFAULT_FILTER: &str = "info";

/// What the subscriber should look like.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TelemetrySettings {
    /// `EnvFilter` directives; `None` means [`DEFAULT_FILTER`].
    pub filter: Option<String>,
    pub json: bool,
    /// OTLP/HTTP collector; `None` disables span export.
    pub otlp_endpoint: Option<String>,
}

impl TelemetrySettings {
    /// Read `RUST_LOG`, `CORTEX_LOG_FORMAT` and `OTEL_EXPORTER_OTLP_ENDPOINT`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let present = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            filter: present("RUST_LOG"),
            json: present("CORTEX_LOG_FORMAT").is_some_and(|v| v.trim().eq_ignore_ascii_case("json")),
            otlp_endpoint: present("OTEL_EXPORTER_OTLP_ENDPOINT"),
        }
    }

    fn env_filter(&self) -> EnvFilter {
        self.filter
            .as_deref()
            .and_then(|directives| EnvFilter::try_new(directives).ok())
            .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
    }
}

/// [`init_with`] using [`TelemetrySettings::from_env`].
pub fn init_tracing(service_name: &str) -> TelemetryGuard {
    init_with(service_name, &TelemetrySettings::from_env())
}

/// Install the global subscriber described by `settings`.
///
/// A second call leaves the first subscriber in place and reports the fact
/// on stderr.
pub fn init_with(service_name: &str, settings: &TelemetrySettings) -> TelemetryGuard {
    let provider = settings
        .otlp_endpoint
        .as_deref()
        .and_then(|endpoint| span_exporter(service_name, endpoint));
    let otel = provider
        .as_ref()
        .map(|p| tracing_opentelemetry::layer().with_tracer(p.tracer(TRACER_NAME)));
    let (json_layer, compact_layer) = if settings.json {
        (Some(fmt::layer().json()), None)
    } else {
        (None, Some(fmt::layer().compact()))
    };

    let installed = tracing_subscriber::registry()
        .with(settings.env_filter())
        .with(otel)
        .with(json_layer)
        .with(compact_layer)
        .try_init();
    if let Err(e) = installed {
        eprintln!("[cortex] tracing subscriber not installed: {e}");
    }

    TelemetryGuard { provider }
}

/// Keeps span export alive; flushes and stops it on drop.
#[must_use = "dropping the guard stops span export"]
pub struct TelemetryGuard {
    provider: Option<SdkTracerProvider>,
}

impl TelemetryGuard {
    /// `true` when spans are exported to a collector.
    pub fn is_exporting(&self) -> bool {
        self.provider.is_some()
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        let Some(provider) = self.provider.take() else {
            return;
        };
        if let Err(e) = provider.shutdown() {
            eprintln!("[cortex] span exporter shutdown failed: {e}");
        }
    }
}

/// Tracer provider exporting to `endpoint`, or `None` when the exporter
/// cannot be built.
fn span_exporter(service_name: &str, endpoint: &str) -> Option<SdkTracerProvider> {
    let exporter = match opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint)
        .build()
    {
        Ok(exporter) => exporter,
        Err(e) => {
            eprintln!("[cortex] OTLP exporter for {endpoint} not built: {e}");
            return None;
        }
    };

    // Simple exporter: no tokio runtime is required at init time.
    Some(
        SdkTracerProvider::builder()
            .with_resource(Resource::builder().with_service_name(service_name.to_string()).build())
            .with_simple_exporter(exporter)
            .build(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(pairs: &[(&str, &str)]) -> TelemetrySettings {
        let map: HashMap<&str, &str> = pairs.iter().copied().collect();
        TelemetrySettings::from_lookup(|key| map.get(key).map(|v| v.to_string()))
    }

    #[test]
    fn settings_default_to_compact_info_without_export() {
        let s = settings(&[]);
        assert_eq!(s, TelemetrySettings::default());
        assert!(!s.json);
    }

    #[test]
    fn settings_read_format_filter_and_endpoint() {
        let s = settings(&[
            ("RUST_LOG", "cortex_runtime=debug"),
            ("CORTEX_LOG_FORMAT", " JSON "),
            ("OTEL_EXPORTER_OTLP_ENDPOINT", "http://localhost:4318"),
        ]);
        assert!(s.json);
        assert_eq!(s.filter.as_deref(), Some("cortex_runtime=debug"));
        assert_eq!(s.otlp_endpoint.as_deref(), Some("http://localhost:4318"));
        assert!(!settings(&[("CORTEX_LOG_FORMAT", "pretty")]).json);
        assert!(settings(&[("OTEL_EXPORTER_OTLP_ENDPOINT", "  ")]).otlp_endpoint.is_none());
    }

    #[test]
    fn unparsable_filter_falls_back_to_default() {
        let s = settings(&[("RUST_LOG", "cortex=[[[")]);
        assert_eq!(s.env_filter().to_string(), EnvFilter::new(DEFAULT_FILTER).to_string());
    }

    #[test]
    fn repeated_init_does_not_panic() {
        let quiet = TelemetrySettings::default();
        let first = init_with("cortex-test", &quiet);
        let second = init_with("cortex-test", &quiet);
        assert!(!first.is_exporting());
        assert!(!second.is_exporting());
    }
}
