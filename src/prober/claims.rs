//! Device claims shared by all slots.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::trace;

/// Device paths currently held by some slot.
///
/// A claim is released when its [`ClaimGuard`] is dropped, which happens
/// together with the session that owns the device.
#[derive(Debug, Clone, Default)]
pub struct PortClaims {
    claimed: Arc<Mutex<HashSet<PathBuf>>>,
}

impl PortClaims {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `path` unless another slot holds it.
    pub fn try_claim(&self, path: &Path) -> Option<ClaimGuard> {
        let mut claimed = self.claimed.lock().unwrap_or_else(PoisonError::into_inner);
        if !claimed.insert(path.to_path_buf()) {
            return None;
        }
        trace!(port = %path.display(), "claimed");
        Some(ClaimGuard {
            claims: self.clone(),
            path: path.to_path_buf(),
        })
    }

    pub fn is_claimed(&self, path: &Path) -> bool {
        self.claimed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(path)
    }

    fn release(&self, path: &Path) {
        self.claimed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(path);
        trace!(port = %path.display(), "released");
    }
}

/// Exclusive hold on one device path.
#[derive(Debug)]
pub struct ClaimGuard {
    claims: PortClaims,
    path: PathBuf,
}

impl ClaimGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        self.claims.release(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_is_exclusive_until_dropped() {
        let claims = PortClaims::new();
        let path = Path::new("/dev/ttyUSB0");

        let guard = claims.try_claim(path).unwrap();
        assert!(claims.is_claimed(path));
        assert!(claims.try_claim(path).is_none());

        drop(guard);
        assert!(!claims.is_claimed(path));
        assert!(claims.try_claim(path).is_some());
    }
}
