//! Self-test scheduling.
//!
//! The ledger stores the last period in which each slot sent its self-test
//! SMS, so a restart within the period does not send another one.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use chrono::{Datelike, NaiveDate};
use tracing::warn;

use crate::config::SelfTestCadence;
use crate::store::StateFile;

/// Period identifier for `date`: `YYYY-MM-DD`, ISO `YYYY-Www` or `YYYY-MM`.
pub fn period_key(cadence: SelfTestCadence, date: NaiveDate) -> String {
    match cadence {
        SelfTestCadence::Daily => date.format("%Y-%m-%d").to_string(),
        SelfTestCadence::Weekly => {
            let week = date.iso_week();
            format!("{}-W{:02}", week.year(), week.week())
        }
        SelfTestCadence::Monthly => date.format("%Y-%m").to_string(),
    }
}

/// Completed self-test periods, persisted as `SLOT PERIOD` lines.
#[derive(Debug)]
pub struct SelfTestLedger {
    file: StateFile,
    /// Completed periods that could not be persisted
    unsaved: Mutex<HashMap<String, String>>,
}

impl SelfTestLedger {
    pub async fn load(path: impl Into<PathBuf>) -> io::Result<Self> {
        Ok(Self {
            file: StateFile::load(path).await?,
            unsaved: Mutex::new(HashMap::new()),
        })
    }

    /// Whether `slot` still has to run its test in `period`.
    pub async fn is_due(&self, slot: &str, period: &str) -> bool {
        let unsaved = self
            .unsaved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(slot)
            .is_some_and(|p| p == period);
        !unsaved && self.file.get(slot).await.as_deref() != Some(period)
    }

    /// Mark `period` as done for `slot`.
    ///
    /// A failed write is logged; the in-memory state is kept so the test is
    /// not repeated before the next restart.
    pub async fn complete(&self, slot: &str, period: &str) {
        if let Err(e) = self.file.set(slot, period).await {
            self.unsaved
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(slot.to_string(), period.to_string());
            warn!(
                slot,
                file = %self.file.path().display(),
                error = %e,
                "failed to persist self-test ledger"
            );
        }
    }
}
