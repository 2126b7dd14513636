//! Logging setup, plus optional OpenTelemetry export
//!
//! Everything in the crate logs through `tracing`. Binaries call
//! [`init_logging`] once at startup; with the `telemetry` feature,
//! [`init_telemetry`] additionally ships spans to an OTLP collector.

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Output format of the log layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human readable
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

/// `RUST_LOG` if set, otherwise `info`
fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global `tracing` subscriber
pub fn init_logging(format: LogFormat) -> Result<()> {
    let registry = Registry::default().with(env_filter());

    match format {
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).try_init()?,
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(false))
            .try_init()?,
    }

    Ok(())
}

#[cfg(feature = "telemetry")]
pub use otel::{init_telemetry, shutdown_telemetry, TelemetryConfig};

/// OTLP span export next to the log layer
#[cfg(feature = "telemetry")]
mod otel {
    use super::{env_filter, LogFormat};
    use anyhow::{Context, Result};
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::propagation::TraceContextPropagator;
    use opentelemetry_sdk::trace::{RandomIdGenerator, Sampler};
    use opentelemetry_sdk::Resource;
    use opentelemetry_semantic_conventions::resource::{
        DEPLOYMENT_ENVIRONMENT, SERVICE_NAME, SERVICE_VERSION,
    };
    use tracing_opentelemetry::OpenTelemetryLayer;
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Registry};

    /// Where and how consumer spans are exported
    #[derive(Debug, Clone, PartialEq)]
    pub struct TelemetryConfig {
        /// OTLP gRPC endpoint
        pub endpoint: String,
        pub service_name: String,
        pub service_version: String,
        pub environment: String,
        /// Fraction of root spans kept, clamped to `0.0..=1.0`
        pub sampling_ratio: f64,
        pub log_format: LogFormat,
    }

    impl Default for TelemetryConfig {
        fn default() -> Self {
            Self {
                endpoint: "http://localhost:4317".to_string(),
                service_name: env!("CARGO_PKG_NAME").to_string(),
                service_version: env!("CARGO_PKG_VERSION").to_string(),
                environment: "development".to_string(),
                sampling_ratio: 1.0,
                log_format: LogFormat::Pretty,
            }
        }
    }

    impl TelemetryConfig {
        /// Read the standard `OTEL_*` variables plus `DEPLOYMENT_ENVIRONMENT`
        pub fn from_env(log_format: LogFormat) -> Result<Self> {
            let mut config = Self {
                log_format,
                ..Self::default()
            };

            if let Ok(endpoint) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
                config.endpoint = endpoint;
            }
            if let Ok(name) = std::env::var("OTEL_SERVICE_NAME") {
                config.service_name = name;
            }
            if let Ok(environment) = std::env::var("DEPLOYMENT_ENVIRONMENT") {
                config.environment = environment;
            }
            if let Ok(ratio) = std::env::var("OTEL_TRACES_SAMPLER_ARG") {
                config.sampling_ratio = ratio
                    .trim()
                    .parse()
                    .with_context(|| format!("OTEL_TRACES_SAMPLER_ARG={:?}", ratio))?;
            }

            Ok(config)
        }

        pub(super) fn sampler(&self) -> Sampler {
            if self.sampling_ratio >= 1.0 {
                Sampler::AlwaysOn
            } else if self.sampling_ratio > 0.0 {
                Sampler::TraceIdRatioBased(self.sampling_ratio)
            } else {
                Sampler::AlwaysOff
            }
        }

        fn resource(&self) -> Resource {
            Resource::new(vec![
                KeyValue::new(SERVICE_NAME, self.service_name.clone()),
                KeyValue::new(SERVICE_VERSION, self.service_version.clone()),
                KeyValue::new(DEPLOYMENT_ENVIRONMENT, self.environment.clone()),
            ])
        }
    }

    /// Install the global subscriber: env filter, log layer and OTLP span layer.
    ///
    /// Must run inside a Tokio runtime; spans are exported in batches.
    pub fn init_telemetry(config: TelemetryConfig) -> Result<()> {
        opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(
                opentelemetry_otlp::new_exporter()
                    .tonic()
                    .with_endpoint(&config.endpoint),
            )
            .with_trace_config(
                opentelemetry_sdk::trace::Config::default()
                    .with_sampler(config.sampler())
                    .with_id_generator(RandomIdGenerator::default())
                    .with_resource(config.resource()),
            )
            .install_batch(opentelemetry_sdk::runtime::Tokio)
            .context("installing OTLP span pipeline")?;

        let registry = Registry::default()
            .with(env_filter())
            .with(OpenTelemetryLayer::new(tracer));

        match config.log_format {
            LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).try_init()?,
            LogFormat::Json => registry
                .with(tracing_subscriber::fmt::layer().json().with_current_span(false))
                .try_init()?,
        }

        Ok(())
    }

    /// Flush buffered spans and stop the exporter
    pub fn shutdown_telemetry() {
        opentelemetry::global::shutdown_tracer_provider();
    }
}
