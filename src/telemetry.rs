//! Tracing subscriber and OpenTelemetry wiring.
//!
//! The fmt layer is always installed with an `info`-default `EnvFilter`.
//! When enabled by config, OTLP/gRPC span and metric exporters are added:
//! spans bridge through `tracing-opentelemetry`, metrics are the
//! executor-owned instruments in [`OpMetrics`]. Initialization is guarded
//! so repeated calls (tests) are harmless; `shutdown` flushes both
//! providers.

use std::sync::{Arc, OnceLock};

use opentelemetry::metrics::MeterProvider as _;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;
use opentelemetry_sdk::Resource;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::ResolvedConfig;

const DEFAULT_OTLP_ENDPOINT: &str = "http://localhost:4317";

static SUBSCRIBER_INIT: OnceLock<()> = OnceLock::new();

/// Instruments recorded by the operation executor. Both backend families
/// are covered; attributes carry the operation, scenario label, and family.
pub struct OpMetrics {
    duration_ms: opentelemetry::metrics::Histogram<f64>,
    errors: opentelemetry::metrics::Counter<u64>,
}

impl OpMetrics {
    fn new(provider: &SdkMeterProvider) -> Self {
        let meter = provider.meter("cache-bench");
        OpMetrics {
            duration_ms: meter
                .f64_histogram("cache.client.operation.duration")
                .with_unit("ms")
                .with_description("Cache operation duration including retries")
                .build(),
            errors: meter
                .u64_counter("cache.client.operation.errors")
                .with_description("Cache operations that failed after retry exhaustion")
                .build(),
        }
    }

    pub fn record(
        &self,
        op: &'static str,
        scenario: &str,
        db_system: &'static str,
        elapsed_ms: f64,
        failed: bool,
    ) {
        let attrs = [
            KeyValue::new("db.operation", op),
            KeyValue::new("scenario", scenario.to_string()),
            KeyValue::new("db.system", db_system),
        ];
        self.duration_ms.record(elapsed_ms, &attrs);
        if failed {
            self.errors.add(1, &attrs);
        }
    }
}

/// Live telemetry handles for one process. Dropping without `shutdown`
/// loses buffered spans/metrics.
pub struct Telemetry {
    tracer_provider: Option<SdkTracerProvider>,
    meter_provider: Option<SdkMeterProvider>,
    metrics: Option<Arc<OpMetrics>>,
}

impl Telemetry {
    pub fn metrics(&self) -> Option<Arc<OpMetrics>> {
        self.metrics.clone()
    }

    /// Force-flush and shut down both providers.
    pub fn shutdown(self) {
        if let Some(provider) = self.meter_provider {
            if let Err(e) = provider.force_flush() {
                warn!(error = %e, "failed to flush OTel metrics");
            }
            if let Err(e) = provider.shutdown() {
                warn!(error = %e, "failed to shut down OTel meter provider");
            }
        }
        if let Some(provider) = self.tracer_provider {
            if let Err(e) = provider.force_flush() {
                warn!(error = %e, "failed to flush OTel spans");
            }
            if let Err(e) = provider.shutdown() {
                warn!(error = %e, "failed to shut down OTel tracer provider");
            } else {
                info!("OpenTelemetry tracing shut down");
            }
        }
    }
}

/// Install the subscriber and, per config, the OTel providers.
pub fn init(config: &ResolvedConfig) -> Telemetry {
    let tracer_provider = if config.otel_tracing_enabled {
        build_tracer_provider(config)
    } else {
        None
    };

    SUBSCRIBER_INIT.get_or_init(|| {
        global::set_text_map_propagator(
            opentelemetry_sdk::propagation::TraceContextPropagator::new(),
        );
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let registry = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer());
        if let Some(provider) = &tracer_provider {
            let tracer = provider.tracer(config.otel_service_name.clone());
            let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
            let _ = registry.with(otel_layer).try_init();
        } else {
            let _ = registry.try_init();
        }
    });

    if (config.otel_tracing_enabled || config.otel_metrics_enabled)
        && config.otel_exporter_endpoint == DEFAULT_OTLP_ENDPOINT
    {
        warn!(
            "OTel exporting enabled but the endpoint is the default ({}). \
             Ensure a collector is running there, or set --otel-exporter-endpoint.",
            DEFAULT_OTLP_ENDPOINT
        );
    }

    let meter_provider = if config.otel_metrics_enabled {
        build_meter_provider(config)
    } else {
        None
    };
    let metrics = meter_provider.as_ref().map(|p| Arc::new(OpMetrics::new(p)));

    if tracer_provider.is_some() {
        info!(
            "OpenTelemetry tracing initialized (service={}, endpoint={})",
            config.otel_service_name, config.otel_exporter_endpoint
        );
    }
    if meter_provider.is_some() {
        info!(
            "OpenTelemetry metrics initialized (service={})",
            config.otel_service_name
        );
    }

    Telemetry {
        tracer_provider,
        meter_provider,
        metrics,
    }
}

fn resource(config: &ResolvedConfig) -> Resource {
    Resource::builder_empty()
        .with_attributes([KeyValue::new(
            "service.name",
            config.otel_service_name.clone(),
        )])
        .build()
}

fn build_tracer_provider(config: &ResolvedConfig) -> Option<SdkTracerProvider> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(&config.otel_exporter_endpoint)
        .build()
        .ok()?;
    Some(
        SdkTracerProvider::builder()
            .with_batch_exporter(exporter)
            .with_resource(resource(config))
            .build(),
    )
}

fn build_meter_provider(config: &ResolvedConfig) -> Option<SdkMeterProvider> {
    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(&config.otel_exporter_endpoint)
        .build()
        .ok()?;
    Some(
        SdkMeterProvider::builder()
            .with_periodic_exporter(exporter)
            .with_resource(resource(config))
            .build(),
    )
}
