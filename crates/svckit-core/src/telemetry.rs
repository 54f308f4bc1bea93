use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{KeyValue, global};
use opentelemetry_otlp::{SpanExporter, WithExportConfig};
use opentelemetry_sdk::{
    Resource,
    propagation::TraceContextPropagator,
    trace::{RandomIdGenerator, Sampler, TracerProvider},
};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{LogRotation, ObservabilityConfig};

/// Keep alive for the life of the process. Dropping it flushes buffered log
/// lines and shuts the trace exporter down.
pub struct TelemetryGuard {
    provider: Option<TracerProvider>,
    _file_writer: Option<WorkerGuard>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(ref provider) = self.provider
            && let Err(e) = provider.shutdown()
        {
            eprintln!("Error shutting down tracer provider: {e}");
        }
    }
}

fn rotation(kind: LogRotation) -> Rotation {
    match kind {
        LogRotation::Minutely => Rotation::MINUTELY,
        LogRotation::Hourly => Rotation::HOURLY,
        LogRotation::Daily => Rotation::DAILY,
        LogRotation::Never => Rotation::NEVER,
    }
}

/// Default filter directive when `RUST_LOG` is not set.
fn default_directive(config: &ObservabilityConfig) -> &'static str {
    if config.debug { "debug" } else { "info" }
}

/// Initializes tracing with the given configuration.
///
/// `RUST_LOG` wins over the debug flag. Console output is one JSON object per
/// line when `json_logs` is set. With `log_file`, JSON lines are also written
/// through a non-blocking rolling file appender. If `otlp_endpoint` is
/// `None`, nothing is exported. The W3C trace-context propagator is always
/// installed so message headers carry trace context between services.
///
/// # Errors
///
/// Returns an error if the log directory cannot be used or the OTLP exporter
/// fails to build.
pub fn init_tracing(
    config: &ObservabilityConfig,
    service_name: &str,
) -> anyhow::Result<TelemetryGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(config)));

    let fmt_layer = if config.json_logs {
        tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_target(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .boxed()
    };

    let (file_layer, file_writer) = match &config.log_file {
        Some(file) => {
            let appender = RollingFileAppender::builder()
                .rotation(rotation(file.rotation))
                .filename_prefix(file.prefix.clone())
                .build(&file.dir)?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_ansi(false)
                .with_target(true)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    global::set_text_map_propagator(TraceContextPropagator::new());

    let (otel_layer, provider) = if let Some(ref endpoint) = config.otlp_endpoint {
        let exporter = SpanExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint.expose())
            .build()?;

        let resource = Resource::new([
            KeyValue::new("service.name", service_name.to_string()),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION").to_string()),
        ]);

        let provider = TracerProvider::builder()
            .with_batch_exporter(exporter, opentelemetry_sdk::runtime::Tokio)
            .with_sampler(Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(
                1.0,
            ))))
            .with_id_generator(RandomIdGenerator::default())
            .with_resource(resource)
            .build();

        let tracer = provider.tracer(service_name.to_string());
        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);

        (Some(otel_layer), Some(provider))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(file_layer)
        .with(otel_layer)
        .init();

    Ok(TelemetryGuard {
        provider,
        _file_writer: file_writer,
    })
}
