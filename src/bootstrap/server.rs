use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::api::{ApiServer, ApiState};
use crate::config::Config;
use crate::forwarder::{self, ForwarderConfig, SmtpsTransport};
use crate::modem::{PortOpener, SerialOpener};
use crate::pool::ModemPool;
use crate::telemetry::{shutdown_tracing, Metrics, MetricsConfig};

use super::hardening;
use super::shutdown::Shutdown;

/// How long each subsystem may take to stop after the signal.
const STOP_TIMEOUT: Duration = Duration::from_secs(15);

/// The gateway process.
///
/// Components:
/// - Modem pool: one lifecycle and one health task per slot
/// - Mail forwarder: SMTPS delivery of received SMS
/// - API server: token-gated HTTP(S) interface
/// - Metrics server: Prometheus endpoint, when configured
pub struct Server {
    config: Arc<Config>,
    opener: Arc<dyn PortOpener>,
    shutdown: Arc<Shutdown>,
}

impl Server {
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
            opener: Arc::new(SerialOpener),
            shutdown: Shutdown::new(),
        }
    }

    /// Use `opener` instead of the serial ports.
    pub fn with_opener(mut self, opener: Arc<dyn PortOpener>) -> Self {
        self.opener = opener;
        self
    }

    pub fn shutdown_handle(&self) -> Arc<Shutdown> {
        Arc::clone(&self.shutdown)
    }

    /// Run until SIGINT, SIGTERM or a triggered shutdown.
    pub async fn run(self) -> Result<()> {
        let config = &self.config;

        info!(
            version = env!("CARGO_PKG_VERSION"),
            modems = config.modems.len(),
            enabled = config.modems.iter().filter(|slot| slot.enabled).count(),
            mail = config.mail.enabled,
            send_sms = config.api.enable_send_sms,
            send_ussd = config.api.enable_send_ussd,
            "starting smsgated"
        );

        hardening::apply_seccomp(config.seccomp.enabled).context("failed to restrict process")?;

        let metrics_handle = match config.logging.metrics_address {
            Some(address) => {
                let metrics = Metrics::new(&MetricsConfig { address })?;
                let shutdown = self.shutdown.subscribe();
                Some(tokio::spawn(async move {
                    if let Err(e) = metrics.serve(shutdown).await {
                        error!(error = %e, "metrics server failed");
                    }
                }))
            }
            None => None,
        };

        let (notifier, mail_health, mail_handle) = if config.mail.enabled {
            let transport = SmtpsTransport::new(&config.mail).context("failed to set up mail delivery")?;
            let forwarder_config =
                ForwarderConfig::new(&config.mail, config.modempool.health_check_interval);
            let (tx, health, handle) =
                forwarder::start(forwarder_config, Arc::new(transport), self.shutdown.subscribe());
            info!(server = %config.mail.server, port = config.mail.port, "mail forwarding enabled");
            (Some(tx), Some(health), Some(handle))
        } else {
            info!("mail forwarding disabled");
            (None, None, None)
        };

        let mut pool = ModemPool::new(
            config.modems.clone(),
            config.modempool.clone(),
            Arc::clone(&self.opener),
        )
        .await
        .context("failed to initialize modem pool")?;
        if let Some(notifier) = notifier {
            pool = pool.with_notifier(notifier);
        }
        let pool = Arc::new(pool);
        let pool_handle = tokio::spawn(Arc::clone(&pool).run(self.shutdown.subscribe()));

        let state = Arc::new(ApiState::new(pool, config.api.clone(), mail_health));
        let api = ApiServer::new(&config.server, state).context("failed to load API certificate")?;
        let listener = api.bind().await.with_context(|| {
            format!("failed to bind API address {}:{}", config.server.host, config.server.port)
        })?;
        let mut api_handle = tokio::spawn(api.serve(listener, self.shutdown.subscribe()));

        info!("smsgated started");

        let api_failed = tokio::select! {
            _ = self.shutdown.wait_for_signal() => None,
            result = &mut api_handle => Some(result),
        };

        let failure = match api_failed {
            None => {
                info!("shutdown signal received, stopping");
                stop("API server", api_handle).await;
                None
            }
            Some(result) => {
                self.shutdown.trigger();
                match result {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(anyhow::Error::new(e).context("API server failed")),
                    Err(e) => Some(anyhow::Error::new(e).context("API server task failed")),
                }
            }
        };

        stop("modem pool", pool_handle).await;
        if let Some(handle) = mail_handle {
            stop("mail forwarder", handle).await;
        }
        if let Some(handle) = metrics_handle {
            stop("metrics server", handle).await;
        }

        shutdown_tracing();
        info!("smsgated stopped");

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Wait for a task to end, giving up after [`STOP_TIMEOUT`].
async fn stop<T>(name: &str, handle: JoinHandle<T>) {
    match tokio::time::timeout(STOP_TIMEOUT, handle).await {
        Ok(Ok(_)) => info!(task = name, "stopped"),
        Ok(Err(e)) => error!(task = name, error = %e, "task failed"),
        Err(_) => warn!(task = name, "did not stop in time"),
    }
}
