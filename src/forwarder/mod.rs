//! Mail forwarding of received SMS.
//!
//! 1. The pool offers each received SMS through a bounded channel
//! 2. The forwarder composes a mail and delivers it over SMTPS
//! 3. Failed deliveries are retried with exponential backoff, then dropped
//! 4. A periodic probe keeps the mail health current

mod mail;
mod processor;
mod smtp;

pub use mail::{dot_stuff, Email};
pub use processor::{MailForwarder, MailHealth};
pub use smtp::{MailTransport, SmtpsTransport};

use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::MailConfig;
use crate::pool::InboundNotice;

/// Mail delivery errors.
#[derive(Debug, Error)]
pub enum MailError {
    #[error("connection failed: {0}")]
    Io(#[from] io::Error),

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("invalid server name {0}")]
    ServerName(String),

    #[error("server answered {code}: {message}")]
    Rejected { code: u16, message: String },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("malformed server reply: {0}")]
    Protocol(String),

    #[error("timed out")]
    Timeout,
}

/// Configuration for the forwarder.
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// Header and envelope sender
    pub from: String,
    /// Used when the receiving slot has no own address
    pub default_recipient: Option<String>,
    /// Notices buffered before new ones are dropped
    pub channel_size: usize,
    /// Deliveries per mail before it is dropped
    pub max_attempts: u32,
    /// Delay before the first retry, doubled per attempt
    pub retry_delay: Duration,
    /// Server probe interval
    pub probe_interval: Duration,
    /// How long queued mail may still be tried at shutdown
    pub drain_timeout: Duration,
}

impl ForwarderConfig {
    pub fn new(mail: &MailConfig, probe_interval: Duration) -> Self {
        Self {
            from: mail.user.clone(),
            default_recipient: mail.recipient.clone(),
            channel_size: 1_000,
            max_attempts: mail.max_attempts.max(1),
            retry_delay: mail.retry_delay,
            probe_interval,
            drain_timeout: Duration::from_secs(10),
        }
    }
}

/// Start the forwarder subsystem.
///
/// Returns the sender to hand to the pool, the shared mail health and the
/// task handle.
pub fn start(
    config: ForwarderConfig,
    transport: Arc<dyn MailTransport>,
    shutdown: watch::Receiver<bool>,
) -> (mpsc::Sender<InboundNotice>, Arc<MailHealth>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(config.channel_size);
    let health = Arc::new(MailHealth::new());

    let forwarder = MailForwarder::new(config, rx, transport, Arc::clone(&health));
    let handle = tokio::spawn(async move {
        forwarder.run(shutdown).await;
        info!("mail forwarder stopped");
    });

    (tx, health, handle)
}
