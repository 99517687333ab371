mod metrics;
mod tracing;

pub use self::metrics::{counters, Metrics, MetricsConfig};
pub use self::tracing::{exposes_secrets, init_tracing, shutdown_tracing, TracingConfig};
