//! Modem access: AT framing, device transports and the per-modem session.
//!
//! A [`ModemSession`] is a cheap cloneable handle. All commands go through a
//! bounded queue to a single [`SessionDriver`] which owns the device, so
//! commands against one modem never overlap and run in arrival order.

pub mod codec;
mod link;
pub mod mock;
pub mod parse;
mod session;
pub mod transport;

use std::io;

use thiserror::Error;

pub use link::AtLink;
pub use session::{
    ModemSession, Pending, Registration, SessionDriver, SessionEvent, SessionSettings,
    SessionState, SessionTimeouts,
};
pub use transport::{AtTransport, PortOpener, SerialOpener};

/// Errors from modem sessions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModemError {
    /// No queue slot within the queue timeout, or queued past its deadline
    #[error("modem busy")]
    Busy,

    #[error("modem not ready")]
    NotReady,

    #[error("{0} timed out")]
    Timeout(String),

    #[error("device I/O error: {0}")]
    Io(String),

    /// Modem or network answered with an error result
    #[error("command rejected: {0}")]
    Rejected(String),

    #[error("SIM requires a PIN but none is configured")]
    PinRequired,

    #[error("SIM PIN rejected")]
    PinRejected,

    #[error("network registration timed out")]
    NotRegistered,

    #[error("session closed")]
    Closed,
}

impl ModemError {
    /// Faults leave the device in an unknown state and end the session.
    pub fn is_fault(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Io(_) | Self::Closed)
    }

    /// Retrying would risk locking the SIM.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::PinRequired | Self::PinRejected)
    }
}

impl From<io::Error> for ModemError {
    fn from(e: io::Error) -> Self {
        Self::Io(e.to_string())
    }
}
