use anyhow::Result;
use opentelemetry::trace::TracerProvider;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    runtime,
    trace::{RandomIdGenerator, Sampler, Tracer},
    Resource,
};
use opentelemetry::KeyValue;
use tracing::{info, warn};
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::config::LoggingConfig;

/// Subscriber settings derived from the `logging` section.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Reported as `service.name` on exported spans
    pub service_name: String,
    /// `EnvFilter` directives
    pub log_level: String,
    pub json_logs: bool,
    /// Span export is enabled when set
    pub otlp_endpoint: Option<String>,
    /// Fraction of traces exported, 0.0 to 1.0
    pub sample_rate: f64,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            service_name: "smsgated".to_string(),
            log_level: "info".to_string(),
            json_logs: false,
            otlp_endpoint: None,
            sample_rate: 1.0,
        }
    }
}

impl From<&LoggingConfig> for TracingConfig {
    fn from(logging: &LoggingConfig) -> Self {
        Self {
            log_level: logging.level.clone(),
            json_logs: logging.json,
            otlp_endpoint: logging.otlp_endpoint.clone(),
            sample_rate: logging.trace_sample_rate,
            ..Self::default()
        }
    }
}

/// Whether `filter` enables debug output for any target.
///
/// Modem traffic at debug level includes SIM PINs and message bodies.
pub fn exposes_secrets(filter: &str) -> bool {
    filter.split(',').any(|directive| {
        let level = directive.rsplit('=').next().unwrap_or(directive).trim();
        level.eq_ignore_ascii_case("debug") || level.eq_ignore_ascii_case("trace")
    })
}

/// Install the global subscriber: env filter, a pretty or JSON formatter
/// and, with an OTLP endpoint, span export.
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init_tracing(config: &TracingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let output = if config.json_logs {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_events(FmtSpan::CLOSE)
            .boxed()
    } else {
        fmt::layer().pretty().with_span_events(FmtSpan::CLOSE).boxed()
    };

    let export = match config.otlp_endpoint.as_deref() {
        Some(endpoint) => Some(OpenTelemetryLayer::new(otlp_tracer(config, endpoint)?)),
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(output)
        .with(export)
        .try_init()?;

    info!(
        level = %config.log_level,
        json = config.json_logs,
        otlp = config.otlp_endpoint.is_some(),
        "tracing initialized"
    );
    if exposes_secrets(&config.log_level) {
        warn!("debug logging records SIM PINs and message bodies");
    }

    Ok(())
}

fn sampler(rate: f64) -> Sampler {
    if rate >= 1.0 {
        Sampler::AlwaysOn
    } else if rate <= 0.0 {
        Sampler::AlwaysOff
    } else {
        Sampler::TraceIdRatioBased(rate)
    }
}

fn otlp_tracer(config: &TracingConfig, endpoint: &str) -> Result<Tracer> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;

    let provider = opentelemetry_sdk::trace::TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_sampler(sampler(config.sample_rate))
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(Resource::new([
            KeyValue::new("service.name", config.service_name.clone()),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        ]))
        .build();

    // Registered globally so shutdown_tracing can flush it
    opentelemetry::global::set_tracer_provider(provider.clone());
    Ok(provider.tracer("smsgated"))
}

/// Flush spans still buffered for export.
pub fn shutdown_tracing() {
    opentelemetry::global::shutdown_tracer_provider();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exposes_secrets() {
        assert!(exposes_secrets("debug"));
        assert!(exposes_secrets("info,smsgated::modem=trace"));
        assert!(!exposes_secrets("info"));
        assert!(!exposes_secrets("warn,hyper=info"));
    }

    #[test]
    fn test_sampler() {
        assert!(matches!(sampler(1.0), Sampler::AlwaysOn));
        assert!(matches!(sampler(0.0), Sampler::AlwaysOff));
        assert!(matches!(sampler(0.25), Sampler::TraceIdRatioBased(r) if r == 0.25));
    }

    #[test]
    fn test_from_logging_config() {
        let logging = LoggingConfig {
            level: "warn".into(),
            json: true,
            ..LoggingConfig::default()
        };
        let config = TracingConfig::from(&logging);
        assert_eq!(config.service_name, "smsgated");
        assert_eq!(config.log_level, "warn");
        assert!(config.json_logs);
    }
}
