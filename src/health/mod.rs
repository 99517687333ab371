//! Per-slot health checks.
//!
//! Each run probes registration and signal, optionally queries the prepaid
//! balance over USSD, and sends the scheduled self-test SMS.

mod balance;
mod engine;
mod selftest;

use std::fmt;

use serde::Serialize;

pub use balance::{classify, extract_balance, BalanceStatus};
pub use engine::{HealthEngine, SlotCheck};
pub use selftest::{period_key, SelfTestLedger};

/// Monitoring level, ordered by severity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthLevel {
    #[default]
    Ok,
    Warning,
    Critical,
}

impl HealthLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Warning => "WARNING",
            Self::Critical => "CRITICAL",
        }
    }

    /// Numeric form for metrics
    pub fn code(&self) -> i64 {
        match self {
            Self::Ok => 0,
            Self::Warning => 1,
            Self::Critical => 2,
        }
    }
}

impl fmt::Display for HealthLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
