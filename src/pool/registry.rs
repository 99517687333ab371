//! Per-slot status snapshots.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::ModemSlot;
use crate::health::{BalanceStatus, HealthLevel, SlotCheck};
use crate::modem::{Registration, SessionState};

/// Traffic counters of one slot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SlotStats {
    pub sent: u64,
    pub failed: u64,
    pub delivered: u64,
    pub received: u64,
    pub ussd: u64,
    /// Sessions established since start
    pub connects: u64,
}

/// What the gateway knows about one slot.
#[derive(Debug, Clone, Serialize)]
pub struct SlotStatus {
    pub slot: String,
    pub enabled: bool,
    pub phone_number: String,
    pub provider: String,
    pub state: SessionState,
    pub level: HealthLevel,
    pub messages: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registration: Option<Registration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub balance: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub balance_status: Option<BalanceStatus>,
    pub currency: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_check: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub stats: SlotStats,
    /// Body of a self-test SMS that has not come back yet
    #[serde(skip)]
    pub pending_self_test: Option<String>,
}

impl SlotStatus {
    fn initial(slot: &ModemSlot) -> Self {
        let (level, message) = if slot.enabled {
            (HealthLevel::Critical, format!("{}: no connection to modem", slot.id))
        } else {
            (HealthLevel::Warning, format!("{}: slot disabled", slot.id))
        };

        Self {
            slot: slot.id.clone(),
            enabled: slot.enabled,
            phone_number: slot.phone_number.clone(),
            provider: slot.provider.clone(),
            state: SessionState::Disconnected,
            level,
            messages: vec![message],
            registration: None,
            balance: None,
            balance_status: None,
            currency: slot.currency.clone(),
            last_check: None,
            last_error: None,
            stats: SlotStats::default(),
            pending_self_test: None,
        }
    }
}

/// Status snapshots of all configured slots.
///
/// Updates run under the write lock, so readers only ever see whole
/// records.
pub struct StatusRegistry {
    slots: RwLock<BTreeMap<String, SlotStatus>>,
}

impl StatusRegistry {
    pub fn new(slots: &[ModemSlot]) -> Self {
        let slots = slots
            .iter()
            .map(|slot| (slot.id.clone(), SlotStatus::initial(slot)))
            .collect();

        Self {
            slots: RwLock::new(slots),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, SlotStatus>> {
        self.slots.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, SlotStatus>> {
        self.slots.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, slot: &str) -> Option<SlotStatus> {
        self.read().get(slot).cloned()
    }

    /// All snapshots, ordered by slot id.
    pub fn snapshot(&self) -> BTreeMap<String, SlotStatus> {
        self.read().clone()
    }

    pub fn update<F>(&self, slot: &str, f: F)
    where
        F: FnOnce(&mut SlotStatus),
    {
        if let Some(status) = self.write().get_mut(slot) {
            f(status);
        }
    }

    pub fn set_state(&self, slot: &str, state: SessionState) {
        self.update(slot, |status| status.state = state);
    }

    pub fn set_error(&self, slot: &str, error: impl Into<String>) {
        let error = error.into();
        self.update(slot, |status| status.last_error = Some(error));
    }

    pub fn record<F>(&self, slot: &str, f: F)
    where
        F: FnOnce(&mut SlotStats),
    {
        self.update(slot, |status| f(&mut status.stats));
    }

    pub fn pending_self_test(&self, slot: &str) -> Option<String> {
        self.read().get(slot).and_then(|s| s.pending_self_test.clone())
    }

    /// Clear the pending self-test if `body` carries its token.
    pub fn self_test_received(&self, slot: &str, body: &str) -> bool {
        let mut slots = self.write();
        let Some(status) = slots.get_mut(slot) else {
            return false;
        };
        let matches = status
            .pending_self_test
            .as_deref()
            .is_some_and(|token| body.contains(token));
        if matches {
            status.pending_self_test = None;
        }
        matches
    }

    /// Store the outcome of a health check.
    pub fn apply_check(&self, slot: &str, check: SlotCheck) {
        self.update(slot, |status| {
            status.level = check.level;
            status.messages = check.messages;
            status.last_check = Some(check.checked_at);
            if check.registration.is_some() {
                status.registration = check.registration;
            }
            if check.balance_status.is_some() {
                status.balance = check.balance;
                status.balance_status = check.balance_status;
            }
            if check.self_test_token.is_some() {
                status.pending_self_test = check.self_test_token;
            }
        });
    }

    /// Operator of the current registration, if known.
    pub fn network(&self, slot: &str) -> Option<String> {
        self.read()
            .get(slot)
            .and_then(|s| s.registration.as_ref())
            .and_then(|r| r.operator.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slots() -> Vec<ModemSlot> {
        let yaml = r#"
- id: "00"
  port: /dev/ttyUSB0
  phone_number: "+4917000000"
- id: "01"
  enabled: false
  port: /dev/ttyUSB1
  phone_number: "+4917000001"
"#;
        serde_yaml::from_str(yaml).unwrap()
    }

    fn check(level: HealthLevel, token: Option<&str>) -> SlotCheck {
        SlotCheck {
            level,
            messages: vec!["00: something".into()],
            registration: Some(Registration {
                registered: true,
                operator: Some("Telekom".into()),
                ..Default::default()
            }),
            balance: Some(3.5),
            balance_status: Some(BalanceStatus::Warning),
            self_test_token: token.map(String::from),
            checked_at: Utc::now(),
        }
    }

    #[test]
    fn test_initial_levels() {
        let registry = StatusRegistry::new(&slots());

        let enabled = registry.get("00").unwrap();
        assert_eq!(enabled.level, HealthLevel::Critical);
        assert_eq!(enabled.state, SessionState::Disconnected);

        let disabled = registry.get("01").unwrap();
        assert_eq!(disabled.level, HealthLevel::Warning);
        assert!(!disabled.enabled);
    }

    #[test]
    fn test_apply_check() {
        let registry = StatusRegistry::new(&slots());
        registry.apply_check("00", check(HealthLevel::Warning, Some("health-check-1")));

        let status = registry.get("00").unwrap();
        assert_eq!(status.level, HealthLevel::Warning);
        assert_eq!(status.balance, Some(3.5));
        assert_eq!(status.pending_self_test.as_deref(), Some("health-check-1"));
        assert_eq!(registry.network("00").as_deref(), Some("Telekom"));

        // A later check without a new token keeps the pending one
        registry.apply_check("00", check(HealthLevel::Ok, None));
        assert_eq!(registry.pending_self_test("00").as_deref(), Some("health-check-1"));
    }

    #[test]
    fn test_self_test_received() {
        let registry = StatusRegistry::new(&slots());
        registry.apply_check("00", check(HealthLevel::Ok, Some("health-check-abc")));

        assert!(!registry.self_test_received("00", "hello"));
        assert!(registry.self_test_received("00", "health-check-abc"));
        assert_eq!(registry.pending_self_test("00"), None);
    }

    #[test]
    fn test_unknown_slot_is_ignored() {
        let registry = StatusRegistry::new(&slots());
        registry.set_state("99", SessionState::Ready);
        registry.record("99", |stats| stats.sent += 1);
        assert!(registry.get("99").is_none());
    }

    #[test]
    fn test_pending_token_not_serialized() {
        let registry = StatusRegistry::new(&slots());
        registry.apply_check("00", check(HealthLevel::Ok, Some("health-check-secret")));
        let json = serde_json::to_string(&registry.get("00").unwrap()).unwrap();
        assert!(!json.contains("health-check-secret"));
        assert!(json.contains("\"state\":\"disconnected\""));
    }
}
