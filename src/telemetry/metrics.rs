use anyhow::Result;
use axum::{http::StatusCode, routing::get, Router};
use opentelemetry::metrics::MeterProvider;
use opentelemetry_prometheus::exporter;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::{Encoder, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// Metrics configuration
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// HTTP endpoint address
    pub address: SocketAddr,
}

/// OTEL Metrics with Prometheus exporter
pub struct Metrics {
    registry: Registry,
    meter_provider: SdkMeterProvider,
    address: SocketAddr,
}

impl Metrics {
    /// Create metrics with OTEL → Prometheus pipeline and register all instruments
    pub fn new(config: &MetricsConfig) -> Result<Arc<Self>> {
        let registry = Registry::new();

        let exporter = exporter()
            .with_registry(registry.clone())
            .build()?;

        let meter_provider = SdkMeterProvider::builder()
            .with_reader(exporter)
            .build();

        // Register as global meter provider
        opentelemetry::global::set_meter_provider(meter_provider.clone());
        counters::init(&meter_provider.meter("smsgated"));

        info!(
            address = %config.address,
            "OTEL metrics configured with Prometheus exporter"
        );

        Ok(Arc::new(Self {
            registry,
            meter_provider,
            address: config.address,
        }))
    }

    /// Render metrics in Prometheus format
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            warn!(error = %e, "failed to encode metrics");
        }

        String::from_utf8_lossy(&buffer).into_owned()
    }

    /// Serve `/metrics` and `/livez` until shutdown
    pub async fn serve(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let metrics = self.clone();

        let app = Router::new()
            .route("/metrics", get(move || {
                let m = metrics.clone();
                async move { m.render() }
            }))
            .route("/livez", get(|| async { StatusCode::OK }));

        let listener = tokio::net::TcpListener::bind(self.address).await?;

        info!(address = %self.address, "metrics server started");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await?;

        Ok(())
    }
}

impl Drop for Metrics {
    fn drop(&mut self) {
        if let Err(e) = self.meter_provider.shutdown() {
            tracing::warn!(error = %e, "failed to shutdown meter provider");
        }
    }
}

/// Gateway metrics with smsgated_* prefix
pub mod counters {
    use opentelemetry::metrics::{Counter, Gauge};
    use opentelemetry::KeyValue;
    use std::sync::OnceLock;

    // ============================================================================
    // SMS METRICS
    // ============================================================================

    static SMS_SENT_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();
    static SMS_RECEIVED_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();
    static SMS_DELIVERY_REPORTS_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();
    static ROUTE_MISSES_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();
    static USSD_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();

    // ============================================================================
    // MODEM METRICS
    // ============================================================================

    static PROBES_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();
    static SESSIONS_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();
    static SESSION_FAULTS_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();
    static SLOT_READY: OnceLock<Gauge<i64>> = OnceLock::new();

    // ============================================================================
    // HEALTH METRICS
    // ============================================================================

    static HEALTH_LEVEL: OnceLock<Gauge<i64>> = OnceLock::new();
    static BALANCE: OnceLock<Gauge<f64>> = OnceLock::new();
    static SIGNAL_DBM: OnceLock<Gauge<i64>> = OnceLock::new();
    static SELF_TESTS_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();

    // ============================================================================
    // API / MAIL METRICS
    // ============================================================================

    static API_REQUESTS_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();
    static AUTH_FAILURES_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();
    static MAIL_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();

    static SERVER_INFO: OnceLock<Gauge<i64>> = OnceLock::new();

    /// Initialize all metrics
    pub fn init(meter: &opentelemetry::metrics::Meter) {
        let _ = SMS_SENT_TOTAL.set(
            meter.u64_counter("smsgated_sms_sent_total")
                .with_description("Outbound SMS by slot and result")
                .build(),
        );
        let _ = SMS_RECEIVED_TOTAL.set(
            meter.u64_counter("smsgated_sms_received_total")
                .with_description("Inbound SMS by slot")
                .build(),
        );
        let _ = SMS_DELIVERY_REPORTS_TOTAL.set(
            meter.u64_counter("smsgated_sms_delivery_reports_total")
                .with_description("Status reports by slot and outcome")
                .build(),
        );
        let _ = ROUTE_MISSES_TOTAL.set(
            meter.u64_counter("smsgated_route_misses_total")
                .with_description("Destinations without a usable slot")
                .build(),
        );
        let _ = USSD_TOTAL.set(
            meter.u64_counter("smsgated_ussd_total")
                .with_description("USSD requests by slot and result")
                .build(),
        );

        let _ = PROBES_TOTAL.set(
            meter.u64_counter("smsgated_port_probes_total")
                .with_description("Port resolution attempts by slot and result")
                .build(),
        );
        let _ = SESSIONS_TOTAL.set(
            meter.u64_counter("smsgated_sessions_total")
                .with_description("Session setups by slot and result")
                .build(),
        );
        let _ = SESSION_FAULTS_TOTAL.set(
            meter.u64_counter("smsgated_session_faults_total")
                .with_description("Sessions ended by a device fault")
                .build(),
        );
        let _ = SLOT_READY.set(
            meter.i64_gauge("smsgated_slot_ready")
                .with_description("Slot has a ready session (1=ready, 0=not)")
                .build(),
        );

        let _ = HEALTH_LEVEL.set(
            meter.i64_gauge("smsgated_health_level")
                .with_description("Slot health (0=ok, 1=warning, 2=critical)")
                .build(),
        );
        let _ = BALANCE.set(
            meter.f64_gauge("smsgated_balance")
                .with_description("Last extracted prepaid balance")
                .build(),
        );
        let _ = SIGNAL_DBM.set(
            meter.i64_gauge("smsgated_signal_dbm")
                .with_description("Signal strength in dBm")
                .build(),
        );
        let _ = SELF_TESTS_TOTAL.set(
            meter.u64_counter("smsgated_self_tests_total")
                .with_description("Scheduled self-test SMS sent")
                .build(),
        );

        let _ = API_REQUESTS_TOTAL.set(
            meter.u64_counter("smsgated_api_requests_total")
                .with_description("API requests by operation and status")
                .build(),
        );
        let _ = AUTH_FAILURES_TOTAL.set(
            meter.u64_counter("smsgated_auth_failures_total")
                .with_description("Rejected API tokens by capability")
                .build(),
        );
        let _ = MAIL_TOTAL.set(
            meter.u64_counter("smsgated_mail_total")
                .with_description("Mail forwarding attempts by result")
                .build(),
        );

        let _ = SERVER_INFO.set(
            meter.i64_gauge("smsgated_server_info")
                .with_description("Server information")
                .build(),
        );
        if let Some(g) = SERVER_INFO.get() {
            g.record(1, &[KeyValue::new("version", env!("CARGO_PKG_VERSION"))]);
        }
    }

    // ============================================================================
    // SMS RECORDING FUNCTIONS
    // ============================================================================

    pub fn sms_sent(slot: &str) {
        if let Some(c) = SMS_SENT_TOTAL.get() {
            c.add(1, &[kv("slot", slot), kv("result", "sent")]);
        }
    }

    pub fn sms_failed(slot: &str) {
        if let Some(c) = SMS_SENT_TOTAL.get() {
            c.add(1, &[kv("slot", slot), kv("result", "failed")]);
        }
    }

    pub fn sms_received(slot: &str) {
        if let Some(c) = SMS_RECEIVED_TOTAL.get() {
            c.add(1, &[kv("slot", slot)]);
        }
    }

    pub fn delivery_report(slot: &str, delivered: bool) {
        if let Some(c) = SMS_DELIVERY_REPORTS_TOTAL.get() {
            let outcome = if delivered { "delivered" } else { "failed" };
            c.add(1, &[kv("slot", slot), kv("outcome", outcome)]);
        }
    }

    pub fn route_miss() {
        if let Some(c) = ROUTE_MISSES_TOTAL.get() {
            c.add(1, &[]);
        }
    }

    pub fn ussd(slot: &str, ok: bool) {
        if let Some(c) = USSD_TOTAL.get() {
            c.add(1, &[kv("slot", slot), kv("result", if ok { "ok" } else { "error" })]);
        }
    }

    // ============================================================================
    // MODEM RECORDING FUNCTIONS
    // ============================================================================

    pub fn probe(slot: &str, found: bool) {
        if let Some(c) = PROBES_TOTAL.get() {
            c.add(1, &[kv("slot", slot), kv("result", if found { "found" } else { "not_found" })]);
        }
    }

    pub fn session_established(slot: &str) {
        if let Some(c) = SESSIONS_TOTAL.get() {
            c.add(1, &[kv("slot", slot), kv("result", "ready")]);
        }
    }

    pub fn session_failed(slot: &str) {
        if let Some(c) = SESSIONS_TOTAL.get() {
            c.add(1, &[kv("slot", slot), kv("result", "failed")]);
        }
    }

    pub fn session_fault(slot: &str) {
        if let Some(c) = SESSION_FAULTS_TOTAL.get() {
            c.add(1, &[kv("slot", slot)]);
        }
    }

    pub fn slot_ready(slot: &str, ready: bool) {
        if let Some(g) = SLOT_READY.get() {
            g.record(i64::from(ready), &[kv("slot", slot)]);
        }
    }

    // ============================================================================
    // HEALTH RECORDING FUNCTIONS
    // ============================================================================

    pub fn health_level(slot: &str, level: i64) {
        if let Some(g) = HEALTH_LEVEL.get() {
            g.record(level, &[kv("slot", slot)]);
        }
    }

    pub fn balance(slot: &str, value: f64) {
        if let Some(g) = BALANCE.get() {
            g.record(value, &[kv("slot", slot)]);
        }
    }

    pub fn signal_dbm(slot: &str, dbm: i32) {
        if let Some(g) = SIGNAL_DBM.get() {
            g.record(i64::from(dbm), &[kv("slot", slot)]);
        }
    }

    pub fn self_test_sent(slot: &str) {
        if let Some(c) = SELF_TESTS_TOTAL.get() {
            c.add(1, &[kv("slot", slot)]);
        }
    }

    // ============================================================================
    // API / MAIL RECORDING FUNCTIONS
    // ============================================================================

    pub fn api_request(operation: &str, status: u16) {
        if let Some(c) = API_REQUESTS_TOTAL.get() {
            c.add(1, &[kv("operation", operation), KeyValue::new("status", i64::from(status))]);
        }
    }

    pub fn auth_failure(capability: &str) {
        if let Some(c) = AUTH_FAILURES_TOTAL.get() {
            c.add(1, &[kv("capability", capability)]);
        }
    }

    /// `result` is one of `delivered`, `retry`, `dropped`
    pub fn mail(result: &str) {
        if let Some(c) = MAIL_TOTAL.get() {
            c.add(1, &[kv("result", result)]);
        }
    }

    fn kv(key: &'static str, value: &str) -> KeyValue {
        KeyValue::new(key, value.to_string())
    }
}
