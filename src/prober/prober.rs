//! Slot to device resolution.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, trace};

use super::candidates::candidates;
use super::claims::{ClaimGuard, PortClaims};
use super::hints::PortHints;
use crate::config::ModemSlot;
use crate::modem::parse::parse_imei;
use crate::modem::{AtLink, ModemError, PortOpener};
use crate::telemetry::counters;

/// Commands sent before the IMEI query; rejections are ignored.
const RESET_SEQUENCE: [&str; 3] = ["AT&F", "ATZ", "ATE0"];

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("no device found for slot {slot}")]
    NotFound { slot: String },

    #[error("invalid port pattern for slot {slot}: {reason}")]
    Pattern { slot: String, reason: String },
}

/// A device identified as belonging to a slot.
pub struct ProbedDevice {
    pub path: PathBuf,
    pub link: AtLink,
    /// Held as long as the device is in use
    pub claim: ClaimGuard,
}

impl std::fmt::Debug for ProbedDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbedDevice").field("path", &self.path).finish()
    }
}

/// Finds the device of a slot by IMEI.
pub struct PortProber {
    opener: Arc<dyn PortOpener>,
    hints: PortHints,
    claims: PortClaims,
    probe_timeout: Duration,
}

impl PortProber {
    pub fn new(opener: Arc<dyn PortOpener>, hints: PortHints, probe_timeout: Duration) -> Self {
        Self {
            opener,
            hints,
            claims: PortClaims::new(),
            probe_timeout,
        }
    }

    pub fn claims(&self) -> &PortClaims {
        &self.claims
    }

    /// Find and open the device of `slot`.
    ///
    /// The hinted path for the slot's IMEI is tried first, then the other
    /// candidates in lexicographic order. Paths claimed by other slots are
    /// skipped.
    pub async fn resolve(&self, slot: &ModemSlot) -> Result<ProbedDevice, ProbeError> {
        let result = self.search(slot).await;
        counters::probe(&slot.id, result.is_ok());
        result
    }

    async fn search(&self, slot: &ModemSlot) -> Result<ProbedDevice, ProbeError> {
        let mut found = candidates(self.opener.as_ref(), &slot.port)
            .await
            .map_err(|e| ProbeError::Pattern {
                slot: slot.id.clone(),
                reason: e.to_string(),
            })?;

        if let Some(imei) = &slot.imei {
            if let Some(hint) = self.hints.get(imei).await {
                if let Some(pos) = found.iter().position(|p| *p == hint) {
                    let hinted = found.remove(pos);
                    found.insert(0, hinted);
                }
            }
        }

        for path in found {
            let Some(claim) = self.claims.try_claim(&path) else {
                trace!(slot = %slot.id, port = %path.display(), "port held by another slot");
                continue;
            };

            match self.identify(slot, &path).await {
                Ok(Some(link)) => {
                    info!(slot = %slot.id, port = %path.display(), "modem found");
                    return Ok(ProbedDevice { path, link, claim });
                }
                Ok(None) => {}
                Err(e) => debug!(slot = %slot.id, port = %path.display(), error = %e, "probe failed"),
            }
        }

        Err(ProbeError::NotFound {
            slot: slot.id.clone(),
        })
    }

    /// Open `path` and check its IMEI. `Ok(None)` means another modem.
    async fn identify(&self, slot: &ModemSlot, path: &Path) -> Result<Option<AtLink>, ModemError> {
        let transport = self.opener.open(path, slot.baud).await?;
        let mut link = AtLink::new(transport);

        let Some(expected) = &slot.imei else {
            return Ok(Some(link));
        };

        for command in RESET_SEQUENCE {
            match link.command(command, self.probe_timeout).await {
                Ok(_) | Err(ModemError::Rejected(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let lines = link.command("AT+CGSN", self.probe_timeout).await?;
        let Some(imei) = parse_imei(&lines) else {
            debug!(slot = %slot.id, port = %path.display(), "no IMEI reported");
            return Ok(None);
        };

        // Every identified device is remembered, which speeds up other slots
        self.hints.record(&imei, path).await;

        if imei == *expected {
            Ok(Some(link))
        } else {
            trace!(slot = %slot.id, port = %path.display(), %imei, "IMEI mismatch");
            Ok(None)
        }
    }
}
