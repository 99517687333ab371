//! Delivery loop with retry queue and server probe.

use std::collections::VecDeque;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::Local;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::mail::Email;
use super::smtp::MailTransport;
use super::ForwarderConfig;
use crate::health::HealthLevel;
use crate::pool::InboundNotice;
use crate::store::MessageId;
use crate::telemetry::counters;

/// How often the retry queue is scanned.
const RETRY_SCAN: Duration = Duration::from_secs(1);

/// Last known state of mail delivery.
#[derive(Debug)]
pub struct MailHealth {
    state: RwLock<(HealthLevel, Option<String>)>,
}

impl MailHealth {
    pub fn new() -> Self {
        Self {
            state: RwLock::new((HealthLevel::Ok, None)),
        }
    }

    /// Current level and, unless OK, the reason.
    pub fn get(&self) -> (HealthLevel, Option<String>) {
        self.state.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set(&self, level: HealthLevel, message: Option<String>) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = (level, message);
    }
}

impl Default for MailHealth {
    fn default() -> Self {
        Self::new()
    }
}

/// A mail waiting for its next attempt.
struct Queued {
    id: MessageId,
    mail: Email,
    attempts: u32,
    due: Instant,
}

/// Delivers mail for received SMS.
pub struct MailForwarder {
    config: ForwarderConfig,
    notices: mpsc::Receiver<InboundNotice>,
    transport: Arc<dyn MailTransport>,
    health: Arc<MailHealth>,
    retries: VecDeque<Queued>,
}

impl MailForwarder {
    pub fn new(
        config: ForwarderConfig,
        notices: mpsc::Receiver<InboundNotice>,
        transport: Arc<dyn MailTransport>,
        health: Arc<MailHealth>,
    ) -> Self {
        Self {
            config,
            notices,
            transport,
            health,
            retries: VecDeque::new(),
        }
    }

    /// Run until shutdown, then try the remaining mail for a bounded time.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            max_attempts = self.config.max_attempts,
            retry_delay_secs = self.config.retry_delay.as_secs(),
            "mail forwarder started"
        );

        let mut retry_tick = interval(RETRY_SCAN);
        retry_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut probe_tick = interval(self.config.probe_interval);
        probe_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => break,

                notice = self.notices.recv() => match notice {
                    Some(notice) => self.accept(notice).await,
                    None => break,
                },

                _ = retry_tick.tick() => self.retry_due().await,

                _ = probe_tick.tick() => self.probe().await,
            }
        }

        self.drain().await;
    }

    async fn accept(&mut self, notice: InboundNotice) {
        let id = notice.message.id;
        let Some(to) = notice.email.clone().or_else(|| self.config.default_recipient.clone()) else {
            error!(%id, slot = %notice.message.slot, "no mail recipient configured, SMS not forwarded");
            counters::mail("dropped");
            return;
        };

        let mail = Email::compose(&notice, &self.config.from, &to, Local::now());
        self.deliver(Queued {
            id,
            mail,
            attempts: 0,
            due: Instant::now(),
        })
        .await;
    }

    async fn deliver(&mut self, mut item: Queued) {
        item.attempts += 1;
        match self.transport.send(&item.mail).await {
            Ok(()) => {
                info!(id = %item.id, to = %item.mail.to, attempt = item.attempts, "SMS forwarded by mail");
                counters::mail("delivered");
                self.health.set(HealthLevel::Ok, None);
            }
            Err(e) if item.attempts >= self.config.max_attempts => {
                error!(id = %item.id, attempts = item.attempts, error = %e, "mail delivery failed, dropping");
                counters::mail("dropped");
                self.health.set(HealthLevel::Critical, Some(format!("mail delivery failed: {e}")));
            }
            Err(e) => {
                let delay = backoff(self.config.retry_delay, item.attempts);
                warn!(
                    id = %item.id,
                    attempt = item.attempts,
                    retry_in_secs = delay.as_secs(),
                    error = %e,
                    "mail delivery failed"
                );
                counters::mail("retry");
                if self.health.get().0 < HealthLevel::Warning {
                    self.health.set(HealthLevel::Warning, Some(format!("mail delivery delayed: {e}")));
                }
                item.due = Instant::now() + delay;
                self.retries.push_back(item);
            }
        }
    }

    async fn retry_due(&mut self) {
        let now = Instant::now();
        let (due, waiting): (Vec<_>, Vec<_>) = self.retries.drain(..).partition(|q| q.due <= now);
        self.retries.extend(waiting);

        if !due.is_empty() {
            debug!(count = due.len(), "retrying mail delivery");
        }
        for item in due {
            self.deliver(item).await;
        }
    }

    async fn probe(&self) {
        match self.transport.probe().await {
            Ok(()) => {
                debug!("mail server reachable");
                if self.retries.is_empty() {
                    self.health.set(HealthLevel::Ok, None);
                }
            }
            Err(e) => {
                warn!(error = %e, "mail server check failed");
                self.health.set(HealthLevel::Critical, Some(format!("mail server check failed: {e}")));
            }
        }
    }

    /// Give queued and buffered mail one last attempt.
    async fn drain(&mut self) {
        self.notices.close();
        let mut pending: Vec<Queued> = self.retries.drain(..).collect();
        while let Ok(notice) = self.notices.try_recv() {
            let to = notice.email.clone().or_else(|| self.config.default_recipient.clone());
            if let Some(to) = to {
                pending.push(Queued {
                    id: notice.message.id,
                    mail: Email::compose(&notice, &self.config.from, &to, Local::now()),
                    attempts: 0,
                    due: Instant::now(),
                });
            }
        }
        if pending.is_empty() {
            return;
        }

        info!(count = pending.len(), "delivering queued mail before shutdown");
        let transport = Arc::clone(&self.transport);
        let attempt = async {
            let mut left = pending.len();
            for item in &pending {
                if transport.send(&item.mail).await.is_ok() {
                    counters::mail("delivered");
                    left -= 1;
                }
            }
            left
        };
        match timeout(self.config.drain_timeout, attempt).await {
            Ok(0) => {}
            Ok(left) => warn!(left, "mail not delivered before shutdown"),
            Err(_) => warn!("mail drain timed out"),
        }
    }
}

/// Delay before attempt `attempts + 1`: the base delay doubled per failure.
fn backoff(base: Duration, attempts: u32) -> Duration {
    base.saturating_mul(1u32 << attempts.saturating_sub(1).min(16))
}
