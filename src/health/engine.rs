//! Health check runs for one slot.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::balance::{classify, extract_balance, BalanceStatus};
use super::selftest::{period_key, SelfTestLedger};
use super::HealthLevel;
use crate::config::{ModemSlot, PoolConfig, SelfTestCadence};
use crate::modem::{ModemError, ModemSession, Registration};
use crate::telemetry::counters;

/// Prefix of self-test SMS bodies.
pub const SELF_TEST_PREFIX: &str = "health-check-";

/// Outcome of one health check run.
#[derive(Debug, Clone, Serialize)]
pub struct SlotCheck {
    pub level: HealthLevel,
    pub messages: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registration: Option<Registration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub balance: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub balance_status: Option<BalanceStatus>,
    /// Token of a self-test SMS sent during this run
    #[serde(skip)]
    pub self_test_token: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl SlotCheck {
    fn new() -> Self {
        Self {
            level: HealthLevel::Ok,
            messages: Vec::new(),
            registration: None,
            balance: None,
            balance_status: None,
            self_test_token: None,
            checked_at: Utc::now(),
        }
    }

    fn raise(&mut self, level: HealthLevel, message: impl Into<String>) {
        self.level = self.level.max(level);
        self.messages.push(message.into());
    }
}

/// Runs health checks for one slot.
pub struct HealthEngine {
    slot: Arc<ModemSlot>,
    pattern: Option<Regex>,
    cadence: SelfTestCadence,
    ledger: Arc<SelfTestLedger>,
}

impl HealthEngine {
    /// The balance pattern has been validated at config load; an invalid
    /// one disables the balance check.
    pub fn new(slot: Arc<ModemSlot>, pool: &PoolConfig, ledger: Arc<SelfTestLedger>) -> Self {
        let pattern = match slot.ussd_balance_pattern.as_deref().map(Regex::new) {
            Some(Ok(pattern)) => Some(pattern),
            Some(Err(e)) => {
                warn!(slot = %slot.id, error = %e, "invalid balance pattern");
                None
            }
            None => None,
        };
        let cadence = slot.self_test_cadence(pool);

        Self {
            slot,
            pattern,
            cadence,
            ledger,
        }
    }

    /// Run one check.
    ///
    /// `pending_token` is the body of an earlier self-test SMS that has not
    /// arrived yet. `today` selects the self-test period.
    pub async fn run(
        &self,
        session: Option<&ModemSession>,
        pending_token: Option<&str>,
        today: NaiveDate,
    ) -> SlotCheck {
        let mut check = SlotCheck::new();
        let id = &self.slot.id;

        let Some(session) = session.filter(|s| s.is_ready()) else {
            check.raise(HealthLevel::Critical, format!("{id}: no connection to modem"));
            return self.finish(check);
        };

        match session.query_registration().await {
            Ok(registration) => {
                self.check_registration(&mut check, &registration);
                check.registration = Some(registration);
            }
            Err(ModemError::Busy) => {
                check.raise(HealthLevel::Warning, format!("{id}: modem busy, check skipped"));
                return self.finish(check);
            }
            Err(e) => {
                check.raise(HealthLevel::Critical, format!("{id}: registration query failed: {e}"));
                return self.finish(check);
            }
        }
        if check.level == HealthLevel::Critical {
            return self.finish(check);
        }

        if let (Some(pattern), true) = (&self.pattern, self.slot.balance_check_enabled()) {
            self.check_balance(&mut check, session, pattern).await;
        }

        if pending_token.is_some() {
            check.raise(HealthLevel::Warning, format!("{id}: self-test SMS not received"));
        }

        self.self_test(&mut check, session, today).await;
        self.finish(check)
    }

    fn check_registration(&self, check: &mut SlotCheck, registration: &Registration) {
        let id = &self.slot.id;
        if !registration.registered {
            check.raise(HealthLevel::Critical, format!("{id}: not registered to a network"));
            return;
        }

        if let Some(dbm) = registration.signal_dbm {
            counters::signal_dbm(id, dbm);
        }
        match registration.rssi {
            None => check.raise(HealthLevel::Warning, format!("{id}: unknown signal strength")),
            Some(rssi) if rssi <= 1 => {
                check.raise(HealthLevel::Critical, format!("{id}: weak signal strength"))
            }
            Some(rssi) if rssi <= 5 => {
                check.raise(HealthLevel::Warning, format!("{id}: weak signal strength"))
            }
            Some(_) => {}
        }
    }

    async fn check_balance(&self, check: &mut SlotCheck, session: &ModemSession, pattern: &Regex) {
        let slot = &self.slot;
        let currency = &slot.currency;

        let value = match session.query_balance().await {
            Ok(answer) => {
                let value = extract_balance(&answer, pattern);
                if value.is_none() {
                    debug!(slot = %slot.id, answer = %answer, "balance not found in USSD answer");
                }
                value
            }
            Err(e) => {
                debug!(slot = %slot.id, error = %e, "balance query failed");
                None
            }
        };

        let Some(value) = value else {
            // Balance queries fail often; unknown is reported without raising the level
            check.balance_status = Some(BalanceStatus::Unknown);
            check.messages.push(format!("{}: balance unknown", slot.id));
            return;
        };

        counters::balance(&slot.id, value);
        let status = classify(value, slot.balance_warning, slot.balance_critical);
        check.balance = Some(value);
        check.balance_status = Some(status);

        match status {
            BalanceStatus::Critical => check.raise(
                HealthLevel::Critical,
                format!(
                    "{}: balance of {value} {currency} is at or below {} {currency}",
                    slot.id, slot.balance_critical
                ),
            ),
            BalanceStatus::Warning => check.raise(
                HealthLevel::Warning,
                format!(
                    "{}: balance of {value} {currency} is at or below {} {currency}",
                    slot.id, slot.balance_warning
                ),
            ),
            BalanceStatus::Ok | BalanceStatus::Unknown => {}
        }
    }

    async fn self_test(&self, check: &mut SlotCheck, session: &ModemSession, today: NaiveDate) {
        let slot = &self.slot;
        let period = period_key(self.cadence, today);
        if !self.ledger.is_due(&slot.id, &period).await {
            return;
        }

        let token = format!("{SELF_TEST_PREFIX}{}", Uuid::new_v4());
        match session.send_sms(&slot.phone_number, &token, false).await {
            Ok(reference) => {
                info!(slot = %slot.id, %period, reference, "self-test SMS sent");
                counters::self_test_sent(&slot.id);
                self.ledger.complete(&slot.id, &period).await;
                check.self_test_token = Some(token);
            }
            // The modem may have transmitted before the fault; the period is
            // spent so the billing event is not doubled
            Err(e) if e.is_fault() => {
                warn!(slot = %slot.id, %period, error = %e, "self-test SMS outcome unknown");
                self.ledger.complete(&slot.id, &period).await;
                check.self_test_token = Some(token);
                check.raise(HealthLevel::Warning, format!("{}: self-test SMS failed: {e}", slot.id));
            }
            Err(e) => {
                check.raise(HealthLevel::Warning, format!("{}: self-test SMS failed: {e}", slot.id));
            }
        }
    }

    fn finish(&self, check: SlotCheck) -> SlotCheck {
        counters::health_level(&self.slot.id, check.level.code());
        if check.level != HealthLevel::Ok {
            warn!(slot = %self.slot.id, level = %check.level, messages = ?check.messages, "health check");
        } else {
            debug!(slot = %self.slot.id, "health check ok");
        }
        check
    }
}
