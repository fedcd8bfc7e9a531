//! OpenTelemetry trace export
//!
//! Enabled when `OTEL_EXPORTER_OTLP_ENDPOINT` is set. Spans go through a scrubbing
//! processor so connection details and anything credential-like never leave the
//! cluster.

use std::env;

use opentelemetry::trace::{TraceError, TraceResult};
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::export::trace::SpanData;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::resource::Resource;
use opentelemetry_sdk::runtime;
use opentelemetry_sdk::trace::{BatchSpanProcessor, Config, Sampler, SpanProcessor, TracerProvider};
use tracing_subscriber::{registry::LookupSpan, Layer};

pub const SERVICE_NAME: &str = "kubedb-operator";

const REDACTED: &str = "[REDACTED]";

/// Attribute keys dropped verbatim
const SCRUBBED_KEYS: &[&str] = &["net.peer.ip", "net.host.ip", "http.client_ip", "host.name"];

/// Substrings that mark an attribute as credential-like
const SECRET_MARKERS: &[&str] = &["password", "token", "secret"];

fn is_sensitive(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    SCRUBBED_KEYS.contains(&key.as_str()) || SECRET_MARKERS.iter().any(|m| key.contains(m))
}

fn scrub(attributes: &mut [KeyValue]) {
    for kv in attributes.iter_mut() {
        if is_sensitive(kv.key.as_str()) {
            kv.value = opentelemetry::Value::String(REDACTED.into());
        }
    }
}

#[derive(Debug)]
struct ScrubbingProcessor<P> {
    inner: P,
}

impl<P: SpanProcessor> SpanProcessor for ScrubbingProcessor<P> {
    fn on_start(&self, span: &mut opentelemetry_sdk::trace::Span, cx: &opentelemetry::Context) {
        self.inner.on_start(span, cx);
    }

    fn on_end(&self, mut span: SpanData) {
        scrub(&mut span.attributes);
        self.inner.on_end(span);
    }

    fn force_flush(&self) -> TraceResult<()> {
        self.inner.force_flush()
    }

    fn shutdown(&mut self) -> TraceResult<()> {
        self.inner.shutdown()
    }
}

/// Build the OTLP tracing layer and install the global tracer provider
pub fn init_telemetry<S>() -> Result<Box<dyn Layer<S> + Send + Sync>, TraceError>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a> + Send + Sync,
{
    global::set_text_map_propagator(TraceContextPropagator::new());

    let endpoint = env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .unwrap_or_else(|_| "http://localhost:4317".to_string());

    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(&endpoint)
        .build_span_exporter()?;

    let provider = TracerProvider::builder()
        .with_config(
            Config::default()
                .with_resource(Resource::new(vec![
                    KeyValue::new("service.name", SERVICE_NAME),
                    KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                ]))
                .with_sampler(Sampler::AlwaysOn),
        )
        .with_span_processor(ScrubbingProcessor {
            inner: BatchSpanProcessor::builder(exporter, runtime::Tokio).build(),
        })
        .build();

    let tracer = opentelemetry::trace::TracerProvider::tracer(&provider, SERVICE_NAME);
    global::set_tracer_provider(provider);

    Ok(tracing_opentelemetry::layer().with_tracer(tracer).boxed())
}

/// Flush pending spans
pub fn shutdown_telemetry() {
    global::shutdown_tracer_provider();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_and_addresses_are_redacted() {
        let mut attributes = vec![
            KeyValue::new("net.peer.ip", "10.0.0.7"),
            KeyValue::new("db.kind", "PgBouncer"),
            KeyValue::new("PGBOUNCER_ADMIN_PASSWORD", "hunter2"),
        ];
        scrub(&mut attributes);

        assert_eq!(attributes[0].value, opentelemetry::Value::String(REDACTED.into()));
        assert_eq!(attributes[1].value, opentelemetry::Value::String("PgBouncer".into()));
        assert_eq!(attributes[2].value, opentelemetry::Value::String(REDACTED.into()));
    }
}
