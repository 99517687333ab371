//! In-memory message storage.
//!
//! Volatile by design: all messages are lost on restart.

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use chrono::Utc;
use tracing::debug;

use super::types::*;

/// Upper bound on fetched messages per call.
const MAX_FETCH: usize = 500;

/// Extra time an outbound message is kept while its status can still
/// change. Matches the 24h validity period requested with `AT+CSMP`.
const REPORT_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Default)]
struct Inner {
    messages: HashMap<MessageId, SmsMessage>,
    /// Inbound messages by sequence number
    inbound: BTreeMap<u64, MessageId>,
    next_sequence: u64,
}

/// Shared store of inbound and outbound SMS.
///
/// Every mutation replaces a whole record under the write lock, so readers
/// never observe a partially updated message.
#[derive(Default)]
pub struct MessageStore {
    inner: RwLock<Inner>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store an outbound message.
    pub fn insert_outbound(&self, message: SmsMessage) -> MessageId {
        let id = message.id;
        self.write().messages.insert(id, message);
        id
    }

    /// Store a received message and assign its sequence number.
    pub fn insert_inbound(&self, mut message: SmsMessage) -> u64 {
        let mut inner = self.write();
        inner.next_sequence += 1;
        let sequence = inner.next_sequence;

        message.sequence = Some(sequence);
        inner.inbound.insert(sequence, message.id);
        inner.messages.insert(message.id, message);
        sequence
    }

    /// Get a message by ID.
    pub fn get(&self, id: MessageId) -> Option<SmsMessage> {
        self.read().messages.get(&id).cloned()
    }

    /// Update a message in place. Returns false if it is unknown.
    pub fn update<F>(&self, id: MessageId, f: F) -> bool
    where
        F: FnOnce(&mut SmsMessage),
    {
        let mut inner = self.write();
        match inner.messages.get_mut(&id) {
            Some(message) => {
                f(message);
                message.updated_at = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Find the outbound message a status report refers to.
    ///
    /// References wrap at 256, so the most recent matching message wins.
    pub fn find_by_reference(&self, slot: &str, reference: u8) -> Option<MessageId> {
        self.read()
            .messages
            .values()
            .filter(|m| {
                m.direction == Direction::Outbound
                    && m.slot == slot
                    && m.reference == Some(reference)
                    && m.status == DeliveryStatus::Sent
            })
            .max_by_key(|m| m.created_at)
            .map(|m| m.id)
    }

    /// Received messages newer than `cursor`, optionally for one slot.
    pub fn fetch_inbound(&self, slot: Option<&str>, cursor: u64) -> InboundBatch {
        let inner = self.read();
        let mut messages = Vec::new();
        let mut next = cursor;

        for (&sequence, id) in inner.inbound.range(cursor.saturating_add(1)..) {
            if messages.len() >= MAX_FETCH {
                break;
            }
            next = sequence;
            let Some(message) = inner.messages.get(id) else {
                continue;
            };
            if slot.map_or(true, |s| s == message.slot) {
                messages.push(message.clone());
            }
        }

        InboundBatch { messages, cursor: next }
    }

    /// Whether any inbound message of `slot` satisfies `f`.
    pub fn has_inbound<F>(&self, slot: &str, f: F) -> bool
    where
        F: Fn(&SmsMessage) -> bool,
    {
        self.read()
            .messages
            .values()
            .any(|m| m.direction == Direction::Inbound && m.slot == slot && f(m))
    }

    /// Drop messages older than `max_age`. Messages whose status can still
    /// change (pending, or sent and awaiting a status report) are kept for
    /// another [`REPORT_WINDOW`].
    pub fn prune(&self, max_age: Duration) -> usize {
        let now = Utc::now();
        let cutoff = |age: Duration| {
            chrono::Duration::from_std(age)
                .ok()
                .and_then(|age| now.checked_sub_signed(age))
        };
        let Some(terminal_cutoff) = cutoff(max_age) else {
            return 0;
        };
        let open_cutoff = cutoff(max_age.saturating_add(REPORT_WINDOW)).unwrap_or(terminal_cutoff);
        let mut inner = self.write();

        let expired: Vec<MessageId> = inner
            .messages
            .values()
            .filter(|m| {
                if m.status.is_terminal() {
                    m.created_at < terminal_cutoff
                } else {
                    m.created_at < open_cutoff
                }
            })
            .map(|m| m.id)
            .collect();

        for id in &expired {
            if let Some(message) = inner.messages.remove(id) {
                if let Some(sequence) = message.sequence {
                    inner.inbound.remove(&sequence);
                }
            }
        }

        if !expired.is_empty() {
            debug!(pruned = expired.len(), "pruned expired messages");
        }
        expired.len()
    }

    /// Get message store statistics.
    pub fn stats(&self) -> StoreStats {
        let inner = self.read();
        let mut stats = StoreStats::default();
        for message in inner.messages.values() {
            match message.direction {
                Direction::Inbound => stats.inbound += 1,
                Direction::Outbound => stats.outbound += 1,
            }
            if message.status == DeliveryStatus::Pending {
                stats.pending += 1;
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Encoding;

    fn inbound(slot: &str, body: &str) -> SmsMessage {
        SmsMessage::inbound(slot, "+4930123456", body, Encoding::Gsm, None)
    }

    #[test]
    fn test_fetch_inbound_by_cursor() {
        let store = MessageStore::new();
        store.insert_inbound(inbound("00", "one"));
        store.insert_inbound(inbound("01", "two"));
        store.insert_inbound(inbound("00", "three"));

        let all = store.fetch_inbound(None, 0);
        assert_eq!(all.messages.len(), 3);
        assert_eq!(all.cursor, 3);

        let slot = store.fetch_inbound(Some("00"), 0);
        let bodies: Vec<_> = slot.messages.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["one", "three"]);
        assert_eq!(slot.cursor, 3);

        let newer = store.fetch_inbound(None, 2);
        assert_eq!(newer.messages.len(), 1);
        assert_eq!(newer.messages[0].body, "three");

        let none = store.fetch_inbound(None, 3);
        assert!(none.messages.is_empty());
        assert_eq!(none.cursor, 3);
    }

    #[test]
    fn test_outbound_status_update() {
        let store = MessageStore::new();
        let id = store.insert_outbound(SmsMessage::outbound("00", "+4930123456", "hi", Encoding::Gsm));
        assert_eq!(store.get(id).unwrap().status, DeliveryStatus::Pending);

        assert!(store.update(id, |m| {
            m.status = DeliveryStatus::Sent;
            m.reference = Some(42);
        }));
        assert_eq!(store.find_by_reference("00", 42), Some(id));
        assert_eq!(store.find_by_reference("01", 42), None);

        assert!(!store.update(MessageId::new(), |m| m.status = DeliveryStatus::Failed));
    }

    #[test]
    fn test_prune_keeps_pending_outbound() {
        let store = MessageStore::new();
        store.insert_inbound(inbound("00", "old"));
        let pending = store.insert_outbound(SmsMessage::outbound("00", "+4930123456", "hi", Encoding::Gsm));
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(store.prune(Duration::ZERO), 1);
        assert!(store.get(pending).is_some());
        assert!(store.fetch_inbound(None, 0).messages.is_empty());

        let stats = store.stats();
        assert_eq!(stats.inbound, 0);
        assert_eq!(stats.outbound, 1);
        assert_eq!(stats.pending, 1);
    }

    #[test]
    fn test_prune_keeps_sent_awaiting_report() {
        let store = MessageStore::new();
        let sent = store.insert_outbound(SmsMessage::outbound("00", "+4930123456", "hi", Encoding::Gsm));
        let delivered = store.insert_outbound(SmsMessage::outbound("00", "+4930123457", "yo", Encoding::Gsm));
        store.update(sent, |m| {
            m.status = DeliveryStatus::Sent;
            m.reference = Some(7);
        });
        store.update(delivered, |m| m.status = DeliveryStatus::Delivered);
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(store.prune(Duration::ZERO), 1);
        assert!(store.get(delivered).is_none());
        assert_eq!(store.find_by_reference("00", 7), Some(sent));
    }

    #[test]
    fn test_prune_drops_stale_sent_after_report_window() {
        let store = MessageStore::new();
        let mut message = SmsMessage::outbound("00", "+4930123456", "hi", Encoding::Gsm);
        message.status = DeliveryStatus::Sent;
        message.created_at = Utc::now() - chrono::Duration::hours(49);
        let id = store.insert_outbound(message);

        assert_eq!(store.prune(Duration::from_secs(24 * 60 * 60)), 1);
        assert!(store.get(id).is_none());
    }
}
