//! Pool construction, supervision and the operations served to the API.

use std::collections::BTreeMap;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::registry::{SlotStats, SlotStatus, StatusRegistry};
use super::{InboundNotice, PoolError};
use crate::config::{Encoding, ModemSlot, PoolConfig};
use crate::health::{HealthLevel, SelfTestLedger};
use crate::modem::parse::{encoded_length, is_gsm_text, max_length};
use crate::modem::{ModemSession, PortOpener};
use crate::prober::{PortHints, PortProber};
use crate::router::{normalize_number, RouteError, Router};
use crate::store::{DeliveryStatus, Direction, InboundBatch, MessageId, MessageStore, SmsMessage, StoreStats};
use crate::telemetry::counters;

/// How often expired messages are pruned.
const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// Pause before a panicked slot task is started again.
const RESTART_DELAY: Duration = Duration::from_secs(1);

/// Aggregate health of the pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolHealth {
    pub level: HealthLevel,
    pub message: String,
    pub slots: BTreeMap<String, SlotStatus>,
}

impl PoolHealth {
    /// Fold in a check from outside the pool.
    pub fn include(&mut self, level: HealthLevel, message: &str) {
        if level == HealthLevel::Ok {
            return;
        }
        self.level = self.level.max(level);
        if self.message.is_empty() || self.message == HealthLevel::Ok.as_str() {
            self.message = message.to_string();
        } else {
            self.message = format!("{}; {message}", self.message);
        }
    }
}

/// Traffic statistics.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub slots: BTreeMap<String, SlotStats>,
    pub store: StoreStats,
}

/// The set of modems and everything shared between their tasks.
pub struct ModemPool {
    pub(super) config: PoolConfig,
    pub(super) slots: BTreeMap<String, Arc<ModemSlot>>,
    pub(super) router: Router,
    /// Live session per enabled slot, `None` while there is none
    pub(super) sessions: BTreeMap<String, watch::Sender<Option<ModemSession>>>,
    pub(super) store: Arc<MessageStore>,
    pub(super) registry: Arc<StatusRegistry>,
    pub(super) prober: PortProber,
    pub(super) ledger: Arc<SelfTestLedger>,
    pub(super) notifier: Option<mpsc::Sender<InboundNotice>>,
}

impl ModemPool {
    /// Build the pool. Loads the hint file and self-test ledger; nothing
    /// touches the modems until [`run`](Self::run).
    pub async fn new(
        modems: Vec<ModemSlot>,
        config: PoolConfig,
        opener: Arc<dyn PortOpener>,
    ) -> io::Result<Self> {
        let hints = PortHints::load(&config.hint_file).await?;
        let ledger = Arc::new(SelfTestLedger::load(&config.self_test_file).await?);
        let prober = PortProber::new(opener, hints, config.command_timeout);

        let router = Router::from_slots(&modems);
        let registry = Arc::new(StatusRegistry::new(&modems));
        let sessions = modems
            .iter()
            .filter(|slot| slot.enabled)
            .map(|slot| (slot.id.clone(), watch::channel(None).0))
            .collect();
        let slots = modems
            .into_iter()
            .map(|slot| (slot.id.clone(), Arc::new(slot)))
            .collect();

        Ok(Self {
            config,
            slots,
            router,
            sessions,
            store: Arc::new(MessageStore::new()),
            registry,
            prober,
            ledger,
            notifier: None,
        })
    }

    /// Offer every received SMS to `notifier`.
    pub fn with_notifier(mut self, notifier: mpsc::Sender<InboundNotice>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn registry(&self) -> &StatusRegistry {
        &self.registry
    }

    pub fn slot(&self, id: &str) -> Option<&ModemSlot> {
        self.slots.get(id).map(Arc::as_ref)
    }

    /// Live session of `slot`.
    pub fn session(&self, slot: &str) -> Option<ModemSession> {
        self.sessions.get(slot).and_then(|tx| tx.borrow().clone())
    }

    fn is_ready(&self, slot: &str) -> bool {
        self.sessions
            .get(slot)
            .is_some_and(|tx| tx.borrow().as_ref().is_some_and(ModemSession::is_ready))
    }

    fn ready_session(&self, slot: &str) -> Result<ModemSession, PoolError> {
        if !self.slots.contains_key(slot) {
            return Err(PoolError::UnknownSlot(slot.to_string()));
        }
        self.session(slot)
            .filter(ModemSession::is_ready)
            .ok_or_else(|| PoolError::NotReady(slot.to_string()))
    }

    /// Map a sender given as slot id or phone number to its slot.
    pub fn resolve_slot(&self, sender: &str) -> Option<&str> {
        if let Some((id, _)) = self.slots.get_key_value(sender) {
            return Some(id.as_str());
        }
        let number = normalize_number(sender)?;
        self.slots
            .values()
            .find(|slot| normalize_number(&slot.phone_number).as_deref() == Some(number.as_str()))
            .map(|slot| slot.id.as_str())
    }

    /// Queue an SMS and return its id.
    ///
    /// With `pinned` set that slot is used directly, otherwise the router
    /// picks one. The destination must be covered by a configured prefix
    /// either way. Submission completes in the background; its outcome is
    /// visible through [`sms_status`](Self::sms_status).
    pub async fn send_sms(
        &self,
        destination: &str,
        body: &str,
        pinned: Option<&str>,
        flash: bool,
    ) -> Result<MessageId, PoolError> {
        let recipient = normalize_number(destination).ok_or(PoolError::InvalidNumber)?;
        if !self.router.is_routable(&recipient) {
            counters::route_miss();
            return Err(RouteError::NoRoute.into());
        }

        let slot = match pinned {
            Some(slot) => slot.to_string(),
            None => self
                .router
                .select(&recipient, |slot| self.is_ready(slot))
                .inspect_err(|_| counters::route_miss())?
                .to_string(),
        };
        let session = self.ready_session(&slot)?;
        check_body(body, session.encoding())?;

        let pending = session
            .enqueue_sms(&recipient, body, flash)
            .await
            .map_err(|e| PoolError::modem(&slot, e))?;

        let message = SmsMessage::outbound(&slot, &recipient, body, session.encoding()).with_flash(flash);
        let id = self.store.insert_outbound(message);
        info!(slot = %slot, %id, flash, "SMS queued");
        debug!(slot = %slot, %id, recipient = %recipient, body, "SMS content");

        let store = Arc::clone(&self.store);
        let registry = Arc::clone(&self.registry);
        tokio::spawn(async move {
            match pending.wait().await {
                Ok(reference) => {
                    store.update(id, |m| {
                        m.status = DeliveryStatus::Sent;
                        m.reference = Some(reference);
                    });
                    registry.record(&slot, |stats| stats.sent += 1);
                    counters::sms_sent(&slot);
                    info!(slot = %slot, %id, reference, "SMS sent");
                }
                Err(e) => {
                    warn!(slot = %slot, %id, error = %e, "SMS failed");
                    store.update(id, |m| {
                        m.status = DeliveryStatus::Failed;
                        m.failure = Some(e.to_string());
                    });
                    registry.record(&slot, |stats| stats.failed += 1);
                    registry.set_error(&slot, format!("send failed: {e}"));
                    counters::sms_failed(&slot);
                }
            }
        });

        Ok(id)
    }

    /// Run a USSD code on `slot` and return the network's answer.
    pub async fn send_ussd(&self, slot: &str, code: &str) -> Result<String, PoolError> {
        if !is_ussd_code(code) {
            return Err(PoolError::InvalidCode);
        }
        let session = self.ready_session(slot)?;

        let result = session.send_ussd(code).await;
        counters::ussd(slot, result.is_ok());
        self.registry.record(slot, |stats| stats.ussd += 1);

        result
            .inspect(|response| debug!(slot, code, response = %response, "USSD answered"))
            .map_err(|e| PoolError::modem(slot, e))
    }

    /// Received SMS newer than `cursor`, optionally for one slot only.
    pub fn fetch_inbound(&self, slot: Option<&str>, cursor: u64) -> Result<InboundBatch, PoolError> {
        if let Some(slot) = slot {
            if !self.slots.contains_key(slot) {
                return Err(PoolError::UnknownSlot(slot.to_string()));
            }
        }
        Ok(self.store.fetch_inbound(slot, cursor))
    }

    /// Status of an outbound message. Received messages are only
    /// readable through [`fetch_inbound`](Self::fetch_inbound).
    pub fn sms_status(&self, id: MessageId) -> Option<SmsMessage> {
        self.store.get(id).filter(|m| m.direction == Direction::Outbound)
    }

    /// Aggregate health over all configured slots.
    pub fn health_state(&self) -> PoolHealth {
        let slots = self.registry.snapshot();
        if slots.is_empty() {
            return PoolHealth {
                level: HealthLevel::Critical,
                message: "no modems configured".to_string(),
                slots,
            };
        }

        let level = slots.values().map(|s| s.level).max().unwrap_or_default();
        let messages: Vec<&str> = slots
            .values()
            .flat_map(|s| s.messages.iter().map(String::as_str))
            .collect();
        let message = if messages.is_empty() {
            HealthLevel::Ok.as_str().to_string()
        } else {
            messages.join("; ")
        };

        PoolHealth {
            level,
            message,
            slots,
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            slots: self
                .registry
                .snapshot()
                .into_iter()
                .map(|(id, status)| (id, status.stats))
                .collect(),
            store: self.store.stats(),
        }
    }

    /// Run the slot tasks until `shutdown` is set.
    ///
    /// Every enabled slot gets a lifecycle task and a health task. A task
    /// that panics is restarted; other slots are not affected.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let mut tasks = JoinSet::new();

        for entry in self.slots.values().filter(|slot| slot.enabled) {
            let pool = Arc::clone(&self);
            let slot = Arc::clone(entry);
            let stop = shutdown.clone();
            tasks.spawn(supervise("lifecycle", slot.id.clone(), shutdown.clone(), move || {
                Arc::clone(&pool).run_slot(Arc::clone(&slot), stop.clone())
            }));

            let pool = Arc::clone(&self);
            let slot = Arc::clone(entry);
            let stop = shutdown.clone();
            tasks.spawn(supervise("health", slot.id.clone(), shutdown.clone(), move || {
                Arc::clone(&pool).run_health(Arc::clone(&slot), stop.clone())
            }));
        }

        tasks.spawn(prune(
            Arc::clone(&self.store),
            self.config.inbound_retention,
            shutdown.clone(),
        ));

        info!(
            slots = self.slots.len(),
            enabled = self.sessions.len(),
            routes = self.router.len(),
            "modem pool started"
        );

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "pool task failed");
            }
        }
        info!("modem pool stopped");
    }
}

/// Run the task built by `make`, starting it again after a panic.
async fn supervise<F, Fut>(task: &'static str, slot: String, mut shutdown: watch::Receiver<bool>, make: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    loop {
        match tokio::spawn(make()).await {
            Ok(()) => return,
            Err(e) if e.is_panic() => {
                error!(slot = %slot, task, "slot task panicked, restarting");
            }
            Err(_) => return,
        }

        tokio::select! {
            _ = shutdown.changed() => return,
            _ = sleep(RESTART_DELAY) => {}
        }
        if *shutdown.borrow() {
            return;
        }
    }
}

async fn prune(store: Arc<MessageStore>, retention: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(PRUNE_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                store.prune(retention);
            }
        }
    }
}

/// Reject bodies the modem cannot carry in a single text-mode SMS.
fn check_body(body: &str, encoding: Encoding) -> Result<(), PoolError> {
    if encoding == Encoding::Gsm && !is_gsm_text(body) {
        return Err(PoolError::Unencodable);
    }
    let length = encoded_length(body, encoding);
    let max = max_length(encoding);
    if length > max {
        return Err(PoolError::TooLong { length, max });
    }
    Ok(())
}

fn is_ussd_code(code: &str) -> bool {
    !code.is_empty() && code.chars().all(|c| c.is_ascii_digit() || matches!(c, '*' | '#' | '+'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SelfTestCadence;
    use crate::health::period_key;
    use crate::modem::mock::{SimulatedModem, SimulatedPorts};
    use crate::modem::ModemError;
    use chrono::Local;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    const IMEI_A: &str = "351111111111111";
    const IMEI_B: &str = "352222222222222";

    const SLOTS: &str = r#"
- id: "00"
  port: /dev/ttyUSB*
  imei: "351111111111111"
  phone_number: "+4917000000"
  prefixes: "+49176 +49"
  cost_per_sms: 0.09
- id: "01"
  port: /dev/ttyUSB*
  imei: "352222222222222"
  phone_number: "+4917000001"
  prefixes: "+49"
  cost_per_sms: 0.05
  ussd_balance_code: "*100#"
- id: "02"
  enabled: false
  port: /dev/ttyACM0
  phone_number: "+4917000002"
  prefixes: "+43"
"#;

    struct Fixture {
        pool: Arc<ModemPool>,
        ports: SimulatedPorts,
        a: SimulatedModem,
        b: SimulatedModem,
        shutdown: watch::Sender<bool>,
        task: JoinHandle<()>,
        _dir: tempfile::TempDir,
    }

    impl Fixture {
        async fn start(notifier: Option<mpsc::Sender<InboundNotice>>) -> Self {
            let dir = tempfile::tempdir().unwrap();

            // Self-tests already done, so they do not interfere with sends
            let period = period_key(SelfTestCadence::Monthly, Local::now().date_naive());
            std::fs::write(
                dir.path().join("selftest.state"),
                format!("00 {period}\n01 {period}\n"),
            )
            .unwrap();

            let ports = SimulatedPorts::new();
            let a = SimulatedModem::new(IMEI_A);
            let b = SimulatedModem::new(IMEI_B).with_ussd("*100#", "Balance: 12,50 EUR");
            ports.plug("/dev/ttyUSB0", a.clone());
            ports.plug("/dev/ttyUSB1", b.clone());

            let config = PoolConfig {
                hint_file: dir.path().join("ports.hint"),
                self_test_file: dir.path().join("selftest.state"),
                discovery_interval: Duration::from_millis(50),
                command_timeout: Duration::from_millis(500),
                registration_timeout: Duration::from_secs(2),
                queue_timeout: Duration::from_secs(2),
                ..Default::default()
            };
            let slots: Vec<ModemSlot> = serde_yaml::from_str(SLOTS).unwrap();

            let mut pool = ModemPool::new(slots, config, Arc::new(ports.clone())).await.unwrap();
            if let Some(notifier) = notifier {
                pool = pool.with_notifier(notifier);
            }
            let pool = Arc::new(pool);

            let (shutdown, rx) = watch::channel(false);
            let task = tokio::spawn(Arc::clone(&pool).run(rx));

            Self {
                pool,
                ports,
                a,
                b,
                shutdown,
                task,
                _dir: dir,
            }
        }

        async fn ready(&self, slot: &str) {
            timeout(Duration::from_secs(5), async {
                while !self.pool.is_ready(slot) {
                    sleep(Duration::from_millis(10)).await;
                }
            })
            .await
            .expect("slot did not become ready");
        }

        async fn status(&self, id: MessageId) -> DeliveryStatus {
            timeout(Duration::from_secs(5), async {
                loop {
                    let status = self.pool.sms_status(id).unwrap().status;
                    if status != DeliveryStatus::Pending {
                        return status;
                    }
                    sleep(Duration::from_millis(10)).await;
                }
            })
            .await
            .expect("message stayed pending")
        }

        async fn stop(self) {
            self.shutdown.send(true).unwrap();
            timeout(Duration::from_secs(5), self.task).await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_send_routes_by_prefix() {
        let fixture = Fixture::start(None).await;
        fixture.ready("00").await;
        fixture.ready("01").await;

        let specific = fixture.pool.send_sms("+49 176 1234567", "hello", None, false).await.unwrap();
        let general = fixture.pool.send_sms("+4930000000", "hallo", None, false).await.unwrap();

        assert_eq!(fixture.status(specific).await, DeliveryStatus::Sent);
        assert_eq!(fixture.status(general).await, DeliveryStatus::Sent);
        assert_eq!(fixture.pool.sms_status(specific).unwrap().slot, "00");
        assert_eq!(fixture.pool.sms_status(general).unwrap().slot, "01");

        assert_eq!(fixture.a.sent()[0].recipient, "+491761234567");
        assert_eq!(fixture.b.sent()[0].body, "hallo");
        fixture.stop().await;
    }

    #[tokio::test]
    async fn test_no_route_has_no_side_effect() {
        let fixture = Fixture::start(None).await;
        fixture.ready("00").await;

        let err = fixture.pool.send_sms("+33123456789", "bonjour", None, false).await.unwrap_err();
        assert!(matches!(err, PoolError::Route(RouteError::NoRoute)));

        // Pinning does not bypass the prefix allow-list
        let err = fixture.pool.send_sms("+33123456789", "bonjour", Some("00"), false).await.unwrap_err();
        assert!(matches!(err, PoolError::Route(RouteError::NoRoute)));

        assert_eq!(fixture.pool.store().stats().outbound, 0);
        assert!(fixture.a.sent().is_empty());
        fixture.stop().await;
    }

    #[tokio::test]
    async fn test_concurrent_sends_keep_order() {
        let fixture = Fixture::start(None).await;
        fixture.ready("00").await;

        let pool = &fixture.pool;
        let (first, second) = tokio::join!(
            pool.send_sms("+491761111111", "first", Some("00"), false),
            pool.send_sms("+491762222222", "second", Some("00"), false),
        );
        let (first, second) = (first.unwrap(), second.unwrap());
        assert_eq!(fixture.status(first).await, DeliveryStatus::Sent);
        assert_eq!(fixture.status(second).await, DeliveryStatus::Sent);

        let bodies: Vec<String> = fixture.a.sent().into_iter().map(|s| s.body).collect();
        assert_eq!(bodies, vec!["first", "second"]);
        assert_eq!(pool.stats().slots["00"].sent, 2);
        fixture.stop().await;
    }

    #[tokio::test]
    async fn test_pinned_slot_must_be_ready() {
        let fixture = Fixture::start(None).await;
        fixture.ready("00").await;

        let err = fixture.pool.send_sms("+4930000000", "x", Some("02"), false).await.unwrap_err();
        assert!(matches!(err, PoolError::NotReady(_)));

        let err = fixture.pool.send_sms("+4930000000", "x", Some("99"), false).await.unwrap_err();
        assert!(matches!(err, PoolError::UnknownSlot(_)));
        fixture.stop().await;
    }

    #[tokio::test]
    async fn test_rejected_send_is_failed() {
        let fixture = Fixture::start(None).await;
        fixture.ready("01").await;
        fixture.b.set_reject_sms(true);

        let id = fixture.pool.send_sms("+4930000000", "x", Some("01"), false).await.unwrap();
        assert_eq!(fixture.status(id).await, DeliveryStatus::Failed);
        assert!(fixture.pool.sms_status(id).unwrap().failure.is_some());
        fixture.stop().await;
    }

    #[tokio::test]
    async fn test_body_validation() {
        let fixture = Fixture::start(None).await;
        fixture.ready("00").await;

        let long = "x".repeat(161);
        let err = fixture.pool.send_sms("+4917612345", &long, None, false).await.unwrap_err();
        assert!(matches!(err, PoolError::TooLong { length: 161, max: 160 }));

        let err = fixture.pool.send_sms("+4917612345", "日本", None, false).await.unwrap_err();
        assert!(matches!(err, PoolError::Unencodable));

        let err = fixture.pool.send_sms("call me", "x", None, false).await.unwrap_err();
        assert!(matches!(err, PoolError::InvalidNumber));
        fixture.stop().await;
    }

    #[tokio::test]
    async fn test_delivery_report_updates_status() {
        let fixture = Fixture::start(None).await;
        fixture.ready("00").await;

        let id = fixture.pool.send_sms("+491761234567", "hello", None, false).await.unwrap();
        assert_eq!(fixture.status(id).await, DeliveryStatus::Sent);

        let reference = fixture.a.sent()[0].reference;
        fixture.a.report_delivery(reference, true);

        timeout(Duration::from_secs(5), async {
            while fixture.pool.sms_status(id).unwrap().status != DeliveryStatus::Delivered {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        fixture.stop().await;
    }

    #[tokio::test]
    async fn test_inbound_is_stored_and_forwarded() {
        let (tx, mut rx) = mpsc::channel(8);
        let fixture = Fixture::start(Some(tx)).await;
        fixture.ready("01").await;

        fixture.b.deliver_sms("+4915199999999", "ping");

        let notice = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert_eq!(notice.message.body, "ping");
        assert_eq!(notice.message.slot, "01");
        assert_eq!(notice.recipient, "+4917000001");

        let batch = fixture.pool.fetch_inbound(Some("01"), 0).unwrap();
        assert_eq!(batch.messages.len(), 1);
        assert!(fixture.pool.sms_status(batch.messages[0].id).is_none());
        assert_eq!(batch.messages[0].peer, "+4915199999999");
        assert!(fixture.pool.fetch_inbound(Some("00"), 0).unwrap().messages.is_empty());
        assert!(matches!(
            fixture.pool.fetch_inbound(Some("99"), 0),
            Err(PoolError::UnknownSlot(_))
        ));
        assert_eq!(fixture.b.stored_count(), 0);
        fixture.stop().await;
    }

    #[tokio::test]
    async fn test_ussd() {
        let fixture = Fixture::start(None).await;
        fixture.ready("01").await;

        let answer = fixture.pool.send_ussd("01", "*100#").await.unwrap();
        assert_eq!(answer, "Balance: 12,50 EUR");

        let err = fixture.pool.send_ussd("01", "*100#\"; AT+CPIN").await.unwrap_err();
        assert!(matches!(err, PoolError::InvalidCode));

        let err = fixture.pool.send_ussd("01", "*999#").await.unwrap_err();
        assert!(matches!(err, PoolError::Modem { source: ModemError::Rejected(_), .. }));
        fixture.stop().await;
    }

    #[tokio::test]
    async fn test_unplugged_slot_recovers() {
        let fixture = Fixture::start(None).await;
        fixture.ready("00").await;

        fixture.ports.unplug("/dev/ttyUSB0");
        timeout(Duration::from_secs(5), async {
            while fixture.pool.is_ready("00") {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        // The other slot keeps working
        let id = fixture.pool.send_sms("+4930000000", "still here", None, false).await.unwrap();
        assert_eq!(fixture.status(id).await, DeliveryStatus::Sent);

        fixture.ports.plug("/dev/ttyUSB0", fixture.a.clone());
        fixture.ready("00").await;
        assert!(fixture.pool.stats().slots["00"].connects >= 2);
        fixture.stop().await;
    }

    #[tokio::test]
    async fn test_health_state() {
        let fixture = Fixture::start(None).await;
        let health = fixture.pool.health_state();
        assert_eq!(health.slots.len(), 3);
        assert_eq!(health.slots["02"].level, HealthLevel::Warning);
        assert!(health.message.contains("02: slot disabled"));

        let mut health = health;
        health.include(HealthLevel::Critical, "mail: server unreachable");
        assert_eq!(health.level, HealthLevel::Critical);
        assert!(health.message.ends_with("; mail: server unreachable"));
        fixture.stop().await;
    }

    #[tokio::test]
    async fn test_empty_pool_is_critical() {
        let dir = tempfile::tempdir().unwrap();
        let config = PoolConfig {
            hint_file: dir.path().join("ports.hint"),
            self_test_file: dir.path().join("selftest.state"),
            ..Default::default()
        };
        let pool = ModemPool::new(Vec::new(), config, Arc::new(SimulatedPorts::new()))
            .await
            .unwrap();

        let health = pool.health_state();
        assert_eq!(health.level, HealthLevel::Critical);
        assert!(health.slots.is_empty());
    }

    #[tokio::test]
    async fn test_resolve_slot() {
        let fixture = Fixture::start(None).await;
        assert_eq!(fixture.pool.resolve_slot("01"), Some("01"));
        assert_eq!(fixture.pool.resolve_slot("+49 170 00001"), Some("01"));
        assert_eq!(fixture.pool.resolve_slot("+49999"), None);
        fixture.stop().await;
    }

    #[test]
    fn test_body_length_counts_encoded_units() {
        assert!(check_body(&"x".repeat(160), Encoding::Gsm).is_ok());
        assert!(check_body(&format!("{}€", "x".repeat(158)), Encoding::Gsm).is_ok());
        assert!(matches!(
            check_body(&format!("{}€", "x".repeat(159)), Encoding::Gsm),
            Err(PoolError::TooLong { length: 161, max: 160 })
        ));

        assert!(check_body(&"日".repeat(70), Encoding::Ucs2).is_ok());
        assert!(check_body(&format!("{}😀", "日".repeat(68)), Encoding::Ucs2).is_ok());
        assert!(matches!(
            check_body(&format!("{}😀", "日".repeat(69)), Encoding::Ucs2),
            Err(PoolError::TooLong { length: 71, max: 70 })
        ));
    }

    #[test]
    fn test_ussd_code_charset() {
        assert!(is_ussd_code("*100#"));
        assert!(is_ussd_code("*135*1#"));
        assert!(!is_ussd_code(""));
        assert!(!is_ussd_code("*100#\""));
    }
}
