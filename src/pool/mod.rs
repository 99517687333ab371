//! The modem pool.
//!
//! [`ModemPool`] owns one lifecycle task and one health task per enabled
//! slot, the shared message store and the per-slot status registry. Slot
//! tasks are the only writers of their slot's records; API handlers only
//! read.

mod lifecycle;
mod registry;
mod supervisor;

use thiserror::Error;

pub use registry::{SlotStats, SlotStatus, StatusRegistry};
pub use supervisor::{ModemPool, PoolHealth, PoolStats};

use crate::modem::ModemError;
use crate::router::RouteError;
use crate::store::SmsMessage;

/// Errors returned by pool operations.
#[derive(Debug, Clone, Error)]
pub enum PoolError {
    #[error(transparent)]
    Route(#[from] RouteError),

    #[error("unknown slot {0}")]
    UnknownSlot(String),

    #[error("slot {0} is not ready")]
    NotReady(String),

    #[error("invalid phone number")]
    InvalidNumber,

    #[error("invalid USSD code")]
    InvalidCode,

    #[error("message too long: {length} characters, at most {max}")]
    TooLong { length: usize, max: usize },

    #[error("message contains characters outside the GSM alphabet")]
    Unencodable,

    #[error("slot {slot}: {source}")]
    Modem {
        slot: String,
        #[source]
        source: ModemError,
    },
}

impl PoolError {
    fn modem(slot: &str, source: ModemError) -> Self {
        Self::Modem {
            slot: slot.to_string(),
            source,
        }
    }
}

/// A received SMS offered to the mail forwarder.
#[derive(Debug, Clone)]
pub struct InboundNotice {
    pub message: SmsMessage,
    /// Phone number of the receiving slot
    pub recipient: String,
    /// Slot specific mail recipient
    pub email: Option<String>,
    /// Operator the slot was registered with
    pub network: Option<String>,
}
