//! Gateway state storage.
//!
//! - [`MessageStore`]: inbound and outbound SMS, in memory only
//! - [`StateFile`]: small persisted maps (port hints, self-test ledger)

mod memory;
mod state_file;
pub mod types;

pub use memory::MessageStore;
pub use state_file::StateFile;
pub use types::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_status_terminal() {
        assert!(!DeliveryStatus::Pending.is_terminal());
        assert!(!DeliveryStatus::Sent.is_terminal());
        assert!(DeliveryStatus::Delivered.is_terminal());
        assert!(DeliveryStatus::Failed.is_terminal());
    }

    #[test]
    fn test_message_id_roundtrip() {
        let id = MessageId::new();
        assert_eq!(MessageId::parse(&id.to_string()), Some(id));
        assert_eq!(MessageId::parse("not-a-uuid"), None);
    }
}
