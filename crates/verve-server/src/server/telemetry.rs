//! # Logging and Telemetry
//!
//! Two log streams are always installed:
//!
//! - the operational stream: every event except those on
//!   [`AGGREGATED_TARGET`], filtered by `RUST_LOG` (default `info`);
//! - the aggregation stream: only events on [`AGGREGATED_TARGET`], i.e. one
//!   record per aggregation cycle.
//!
//! With `LOG_DIR` set, each stream is appended to
//! `<LOG_DIR>/<name>-<pid>.log` (`APPNAME` and `AGGREGATED_LOG_FILE_NAME`
//! respectively); otherwise both go to stdout.
//!
//! ## Feature matrix
//!
//! - `otel`: Enables OpenTelemetry distributed tracing (via spans).
//! - `metrics`: Enables OpenTelemetry metrics (counters).
//! - `stdout`: Enables the stdout OpenTelemetry exporter.
//!
//! The `stdout` exporter requires at least one of `otel` or `metrics`.
//!
//! ```bash
//! cargo run --features otel,metrics,stdout
//! ```

#[cfg(all(feature = "stdout", not(any(feature = "otel", feature = "metrics"))))]
compile_error!("The 'stdout' feature requires at least one of 'otel' or 'metrics' to be enabled.");

use crate::server::config::ServerConfig;
use std::{fs::OpenOptions, path::Path, sync::Arc};
use tracing::Level;
use tracing_subscriber::{
    EnvFilter, Layer,
    filter::{Targets, filter_fn},
    fmt::{time::ChronoLocal, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[cfg(feature = "metrics")]
use opentelemetry::metrics::{Counter, Meter};
#[cfg(feature = "metrics")]
use opentelemetry_sdk::metrics as sdkmetrics;
#[cfg(feature = "metrics")]
use std::sync::OnceLock;

#[cfg(any(feature = "metrics", feature = "otel"))]
use opentelemetry::{InstrumentationScope, KeyValue};
#[cfg(any(feature = "metrics", feature = "otel"))]
use opentelemetry_sdk::Resource;
#[cfg(any(feature = "metrics", feature = "otel"))]
use opentelemetry_semantic_conventions as semvcns;

#[cfg(feature = "otel")]
use opentelemetry::trace::TracerProvider;
#[cfg(feature = "otel")]
use opentelemetry_sdk::propagation::TraceContextPropagator;
#[cfg(feature = "otel")]
use opentelemetry_sdk::trace as sdktrace;

/// Target of the aggregation results stream.
pub const AGGREGATED_TARGET: &str = "verve::aggregated";

pub struct TelemetryProviders {
    #[cfg(feature = "otel")]
    pub tracer_provider: sdktrace::SdkTracerProvider,
    #[cfg(feature = "metrics")]
    pub meter_provider: sdkmetrics::SdkMeterProvider,
}

impl TelemetryProviders {
    /// Flushes and shuts down every exporter. Errors are printed to stderr
    /// since the log pipeline itself is being torn down.
    pub fn shutdown(self) {
        #[cfg(feature = "otel")]
        {
            if let Err(err) = self.tracer_provider.force_flush() {
                eprintln!("Error flushing traces: {err:#?}");
            }
            if let Err(err) = self.tracer_provider.shutdown() {
                eprintln!("Error shutting down tracer: {err:#?}");
            }
        }

        #[cfg(feature = "metrics")]
        {
            if let Err(err) = self.meter_provider.force_flush() {
                eprintln!("Error flushing metrics: {err:#?}");
            }
            if let Err(err) = self.meter_provider.shutdown() {
                eprintln!("Error shutting down meter: {err:#?}");
            }
        }
    }
}

fn log_writer(dir: Option<&Path>, name: &str) -> anyhow::Result<BoxMakeWriter> {
    let Some(dir) = dir else {
        return Ok(BoxMakeWriter::new(std::io::stdout));
    };
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("{name}-{}.log", std::process::id()));
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    Ok(BoxMakeWriter::new(Arc::new(file)))
}

pub fn init_telemetry(config: &ServerConfig) -> anyhow::Result<TelemetryProviders> {
    #[cfg(feature = "otel")]
    opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

    #[cfg(feature = "otel")]
    let tracer_provider = init_tracer()?;

    #[cfg(feature = "metrics")]
    let meter_provider = init_metrics();

    #[cfg(any(feature = "metrics", feature = "otel"))]
    let scope = InstrumentationScope::builder("verve")
        .with_version(env!("CARGO_PKG_VERSION"))
        .with_schema_url(semvcns::SCHEMA_URL)
        .build();

    let log_dir = config.log_dir.as_deref();
    let ansi = log_dir.is_none();

    let operational = tracing_subscriber::fmt::layer()
        .with_writer(log_writer(log_dir, &config.app_name)?)
        .with_ansi(ansi)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_target(false)
        .with_timer(ChronoLocal::rfc_3339())
        .with_file(true)
        .pretty()
        .with_filter(filter_fn(|meta| meta.target() != AGGREGATED_TARGET));

    let aggregated = tracing_subscriber::fmt::layer()
        .with_writer(log_writer(log_dir, &config.aggregated_log)?)
        .with_ansi(ansi)
        .with_target(false)
        .with_timer(ChronoLocal::rfc_3339())
        .with_filter(Targets::new().with_target(AGGREGATED_TARGET, Level::INFO));

    let registry = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(operational)
        .with(aggregated);

    #[cfg(feature = "otel")]
    let registry = {
        opentelemetry::global::set_tracer_provider(tracer_provider.clone());
        registry.with(
            tracing_opentelemetry::layer()
                .with_tracer(tracer_provider.tracer_with_scope(scope.clone()))
                .with_error_records_to_exceptions(true),
        )
    };

    #[cfg(feature = "metrics")]
    let registry = {
        opentelemetry::global::set_meter_provider(meter_provider.clone());
        let meter = opentelemetry::global::meter_with_scope(scope);
        init_metric_handles(&meter);

        registry.with(tracing_opentelemetry::MetricsLayer::new(
            meter_provider.clone(),
        ))
    };

    registry.try_init()?;

    Ok(TelemetryProviders {
        #[cfg(feature = "otel")]
        tracer_provider,
        #[cfg(feature = "metrics")]
        meter_provider,
    })
}

#[cfg(any(feature = "metrics", feature = "otel"))]
fn resource() -> Resource {
    Resource::builder()
        .with_service_name("verve")
        .with_schema_url(
            [KeyValue::new(
                semvcns::resource::SERVICE_VERSION,
                env!("CARGO_PKG_VERSION"),
            )],
            semvcns::SCHEMA_URL,
        )
        .build()
}

#[cfg(feature = "metrics")]
fn init_metrics() -> sdkmetrics::SdkMeterProvider {
    let builder = sdkmetrics::SdkMeterProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = {
        use opentelemetry_stdout::MetricExporter;
        let exporter = MetricExporter::default();
        let reader = opentelemetry_sdk::metrics::PeriodicReader::builder(exporter)
            .with_interval(std::time::Duration::from_secs(5))
            .build();

        builder.with_reader(reader)
    };

    builder.build()
}

#[cfg(feature = "otel")]
fn init_tracer() -> anyhow::Result<sdktrace::SdkTracerProvider> {
    let builder = sdktrace::SdkTracerProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = {
        use opentelemetry_stdout::SpanExporter;
        let exporter = SpanExporter::default();
        let batch = sdktrace::BatchSpanProcessor::builder(exporter)
            .with_batch_config(
                sdktrace::BatchConfigBuilder::default()
                    .with_scheduled_delay(std::time::Duration::from_secs(5))
                    .with_max_queue_size(2048)
                    .build(),
            )
            .build();
        builder.with_span_processor(batch)
    };

    Ok(builder.build())
}

#[cfg(feature = "metrics")]
static REQUESTS_ACCEPTED: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static REQUESTS_REJECTED: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static IDS_RECORDED: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static RECORD_ERRORS: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static FORWARDS: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static FORWARD_ERRORS: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static FORWARDS_DROPPED: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static AGGREGATION_CYCLES: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static LEADER_CYCLES: OnceLock<Counter<u64>> = OnceLock::new();

#[cfg(feature = "metrics")]
fn init_metric_handles(meter: &Meter) {
    let counters = [
        (&REQUESTS_ACCEPTED, "requests_accepted", "Accept calls enqueued"),
        (&REQUESTS_REJECTED, "requests_rejected", "Accept calls rejected"),
        (&IDS_RECORDED, "ids_recorded", "Ids added to the window set"),
        (&RECORD_ERRORS, "record_errors", "Ids abandoned after store failures"),
        (&FORWARDS, "forwards", "Forwarded endpoint calls"),
        (&FORWARD_ERRORS, "forward_errors", "Failed forwarded endpoint calls"),
        (&FORWARDS_DROPPED, "forwards_dropped", "Endpoint calls skipped on a full queue"),
        (&AGGREGATION_CYCLES, "aggregation_cycles", "Aggregation ticks"),
        (&LEADER_CYCLES, "leader_cycles", "Aggregation ticks won as leader"),
    ];
    for (handle, name, description) in counters {
        let _ = handle.set(meter.u64_counter(name).with_description(description).build());
    }
}

#[cfg(feature = "metrics")]
fn add(handle: &OnceLock<Counter<u64>>, n: u64) {
    if let Some(counter) = handle.get() {
        counter.add(n, &[]);
    }
}

// Convenience functions that compile to no-ops when metrics are disabled
macro_rules! counter_fn {
    ($name:ident, $handle:ident) => {
        #[cfg(feature = "metrics")]
        pub fn $name() {
            add(&$handle, 1);
        }

        #[cfg(not(feature = "metrics"))]
        pub fn $name() {}
    };
}

counter_fn!(increment_accepted, REQUESTS_ACCEPTED);
counter_fn!(increment_rejected, REQUESTS_REJECTED);
counter_fn!(increment_recorded, IDS_RECORDED);
counter_fn!(increment_record_errors, RECORD_ERRORS);
counter_fn!(increment_forwards, FORWARDS);
counter_fn!(increment_forward_errors, FORWARD_ERRORS);
counter_fn!(increment_forwards_dropped, FORWARDS_DROPPED);
counter_fn!(increment_aggregation_cycles, AGGREGATION_CYCLES);
counter_fn!(increment_leader_cycles, LEADER_CYCLES);
