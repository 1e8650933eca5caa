//! OpenTelemetry tracer provider setup.
//!
//! The provider returned here is what servers and clients hand to their
//! tracing interceptors. With the `otlp` feature spans are batched and sent
//! over OTLP/gRPC to `OTEL_EXPORTER_OTLP_ENDPOINT`; otherwise they are
//! recorded but not exported.

use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::SdkTracerProvider;
use opentelemetry_sdk::Resource;

/// Error raised while flushing or shutting down a tracer provider.
#[derive(Debug)]
pub enum TelemetryError {
    Exporter(String),
    Flush(String),
    Shutdown(String),
    Join(String),
}

impl std::fmt::Display for TelemetryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exporter(e) => write!(f, "Failed to build span exporter: {}", e),
            Self::Flush(e) => write!(f, "Failed to flush spans: {}", e),
            Self::Shutdown(e) => write!(f, "Failed to shut down tracer provider: {}", e),
            Self::Join(e) => write!(f, "Tracer shutdown task failed: {}", e),
        }
    }
}

impl std::error::Error for TelemetryError {}

/// Build a tracer provider for `service_name`, install it globally and set
/// the W3C trace-context propagator.
pub fn init_tracer_provider(
    service_name: impl Into<String>,
) -> Result<SdkTracerProvider, TelemetryError> {
    opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

    let resource = Resource::builder()
        .with_service_name(service_name.into())
        .build();

    let builder = SdkTracerProvider::builder().with_resource(resource);

    #[cfg(feature = "otlp")]
    let builder = {
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .build()
            .map_err(|e| TelemetryError::Exporter(e.to_string()))?;
        builder.with_batch_exporter(exporter)
    };

    let provider = builder.build();
    opentelemetry::global::set_tracer_provider(provider.clone());
    tracing::debug!("tracer provider initialised");

    Ok(provider)
}

/// Flush pending spans, then shut the provider down.
///
/// Exporters may block, so the work runs on the blocking pool.
pub async fn shutdown_tracer_provider(provider: SdkTracerProvider) -> Result<(), TelemetryError> {
    tokio::task::spawn_blocking(move || {
        provider
            .force_flush()
            .map_err(|e| TelemetryError::Flush(e.to_string()))?;
        provider
            .shutdown()
            .map_err(|e| TelemetryError::Shutdown(e.to_string()))
    })
    .await
    .map_err(|e| TelemetryError::Join(e.to_string()))?
}
