//! Per-slot tasks: the session lifecycle and the health schedule.

use std::sync::Arc;

use chrono::Local;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::supervisor::ModemPool;
use super::InboundNotice;
use crate::config::{Encoding, ModemSlot};
use crate::health::HealthEngine;
use crate::modem::parse::StoredSms;
use crate::modem::{ModemSession, SessionDriver, SessionEvent, SessionSettings, SessionState};
use crate::prober::ProbedDevice;
use crate::store::{DeliveryStatus, SmsMessage};
use crate::telemetry::counters;

/// Events buffered between a session and its lifecycle task.
const EVENT_BUFFER: usize = 64;

/// How a connection attempt ended.
enum Exit {
    /// Identify the modem again after the discovery interval
    Retry,
    /// Retrying could lock the SIM; wait for a restart
    Park,
    Shutdown,
}

/// Clears the published session when the lifecycle task ends, also by panic.
struct Unpublish<'a>(&'a watch::Sender<Option<ModemSession>>);

impl Drop for Unpublish<'_> {
    fn drop(&mut self) {
        self.0.send_replace(None);
    }
}

impl ModemPool {
    /// Identify, connect and serve the modem of `slot` until shutdown,
    /// starting over whenever the session ends.
    pub(super) async fn run_slot(self: Arc<Self>, slot: Arc<ModemSlot>, mut shutdown: watch::Receiver<bool>) {
        let Some(publisher) = self.sessions.get(&slot.id) else {
            return;
        };
        let _unpublish = Unpublish(publisher);

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.attempt(&slot, publisher, &mut shutdown).await {
                Exit::Shutdown => break,
                Exit::Park => {
                    let _ = shutdown.wait_for(|stop| *stop).await;
                    break;
                }
                Exit::Retry => {}
            }

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = sleep(self.config.discovery_interval) => {}
            }
        }

        self.registry.set_state(&slot.id, SessionState::Disconnected);
        debug!(slot = %slot.id, "slot lifecycle stopped");
    }

    async fn attempt(
        &self,
        slot: &ModemSlot,
        publisher: &watch::Sender<Option<ModemSession>>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Exit {
        let id = slot.id.as_str();

        let device = tokio::select! {
            _ = shutdown.changed() => return Exit::Shutdown,
            result = self.prober.resolve(slot) => match result {
                Ok(device) => device,
                Err(e) => {
                    debug!(slot = %id, error = %e, "modem not available");
                    self.registry.set_error(id, "modem not found");
                    return Exit::Retry;
                }
            },
        };
        let ProbedDevice { path, link, claim } = device;

        let (events_tx, mut events) = mpsc::channel(EVENT_BUFFER);
        let settings = SessionSettings::new(slot, &self.config);
        let (session, mut driver) = SessionDriver::new(settings, link, events_tx);
        let encoding = session.encoding();
        self.registry.set_state(id, SessionState::Connecting);

        // Stored messages are emitted while connecting
        let established = {
            let establish = driver.establish();
            tokio::pin!(establish);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => return Exit::Shutdown,
                    result = &mut establish => break result,
                    Some(event) = events.recv() => self.handle_event(slot, encoding, event),
                }
            }
        };

        if let Err(e) = established {
            counters::session_failed(id);
            self.registry.update(id, |status| {
                status.state = SessionState::Error;
                status.last_error = Some(e.to_string());
            });
            if e.is_fatal() {
                error!(slot = %id, error = %e, "SIM cannot be unlocked, slot disabled until restart");
                return Exit::Park;
            }
            return Exit::Retry;
        }

        counters::session_established(id);
        counters::slot_ready(id, true);
        self.registry.update(id, |status| {
            status.state = SessionState::Ready;
            status.last_error = None;
            status.stats.connects += 1;
        });
        publisher.send_replace(Some(session.clone()));
        info!(slot = %id, port = %path.display(), "session established");

        let mut state = session.subscribe();
        let run = driver.run(shutdown.clone());
        tokio::pin!(run);
        let result = loop {
            tokio::select! {
                result = &mut run => break result,
                Some(event) = events.recv() => self.handle_event(slot, encoding, event),
                Ok(()) = state.changed() => {
                    let current = *state.borrow_and_update();
                    self.registry.set_state(id, current);
                }
            }
        };

        publisher.send_replace(None);
        counters::slot_ready(id, false);
        while let Ok(event) = events.try_recv() {
            self.handle_event(slot, encoding, event);
        }
        drop(claim);

        match result {
            Ok(()) => {
                self.registry.set_state(id, SessionState::Disconnected);
                if *shutdown.borrow() {
                    Exit::Shutdown
                } else {
                    Exit::Retry
                }
            }
            Err(e) => {
                counters::session_fault(id);
                warn!(slot = %id, port = %path.display(), error = %e, "session lost");
                self.registry.update(id, |status| {
                    status.state = SessionState::Error;
                    status.last_error = Some(e.to_string());
                });
                Exit::Retry
            }
        }
    }

    fn handle_event(&self, slot: &ModemSlot, encoding: Encoding, event: SessionEvent) {
        match event {
            SessionEvent::Inbound(sms) => self.receive(slot, encoding, sms),
            SessionEvent::StatusReport { reference, delivered } => {
                self.delivery_report(&slot.id, reference, delivered)
            }
        }
    }

    fn receive(&self, slot: &ModemSlot, encoding: Encoding, sms: StoredSms) {
        let id = slot.id.as_str();
        let mut message = SmsMessage::inbound(id, &sms.sender, &sms.body, encoding, sms.timestamp);
        message.sequence = Some(self.store.insert_inbound(message.clone()));

        self.registry.record(id, |stats| stats.received += 1);
        counters::sms_received(id);
        info!(slot = %id, id = %message.id, sequence = ?message.sequence, "SMS received");
        debug!(slot = %id, sender = %message.peer, body = %message.body, "SMS content");

        if self.registry.self_test_received(id, &message.body) {
            info!(slot = %id, "self-test SMS came back");
        }

        let Some(notifier) = &self.notifier else {
            return;
        };
        let notice = InboundNotice {
            message,
            recipient: slot.phone_number.clone(),
            email: slot.email_address.clone(),
            network: self.registry.network(id),
        };
        match notifier.try_send(notice) {
            Ok(()) => {}
            Err(TrySendError::Full(notice)) => {
                warn!(slot = %id, id = %notice.message.id, "mail queue full, notification dropped");
            }
            Err(TrySendError::Closed(_)) => {
                debug!(slot = %id, "mail forwarder stopped");
            }
        }
    }

    fn delivery_report(&self, slot: &str, reference: u8, delivered: bool) {
        let Some(id) = self.store.find_by_reference(slot, reference) else {
            debug!(slot, reference, "status report for unknown message");
            return;
        };

        self.store.update(id, |m| {
            if delivered {
                m.status = DeliveryStatus::Delivered;
            } else {
                m.status = DeliveryStatus::Failed;
                m.failure = Some("delivery failed".to_string());
            }
        });
        if delivered {
            self.registry.record(slot, |stats| stats.delivered += 1);
        }
        counters::delivery_report(slot, delivered);
        debug!(slot, %id, reference, delivered, "status report");
    }

    /// Check the slot at its interval and whenever its session changes.
    pub(super) async fn run_health(self: Arc<Self>, slot: Arc<ModemSlot>, mut shutdown: watch::Receiver<bool>) {
        let Some(publisher) = self.sessions.get(&slot.id) else {
            return;
        };
        let mut sessions = publisher.subscribe();
        let engine = HealthEngine::new(Arc::clone(&slot), &self.config, Arc::clone(&self.ledger));

        let mut ticker = interval(slot.health_interval(&self.config));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
                Ok(()) = sessions.changed() => {}
            }

            let session = sessions.borrow_and_update().clone();
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = self.check(&engine, &slot.id, session.as_ref()) => {}
            }
        }
    }

    async fn check(&self, engine: &HealthEngine, slot: &str, session: Option<&ModemSession>) {
        let pending = self.registry.pending_self_test(slot);
        let mut check = engine
            .run(session, pending.as_deref(), Local::now().date_naive())
            .await;

        // The self-test SMS may have come back before this run finished
        if let Some(token) = &check.self_test_token {
            if self.store.has_inbound(slot, |m| m.body.contains(token.as_str())) {
                check.self_test_token = None;
            }
        }
        self.registry.apply_check(slot, check);
    }
}
