//! IMEI to device path cache.

use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::store::StateFile;

/// Last known device path per IMEI, persisted as `IMEI PATH` lines.
#[derive(Debug)]
pub struct PortHints {
    file: StateFile,
}

impl PortHints {
    pub async fn load(path: impl Into<PathBuf>) -> io::Result<Self> {
        Ok(Self {
            file: StateFile::load(path).await?,
        })
    }

    pub async fn get(&self, imei: &str) -> Option<PathBuf> {
        self.file.get(imei).await.map(PathBuf::from)
    }

    /// Remember `path` for `imei`. Failures to persist are logged only.
    pub async fn record(&self, imei: &str, path: &Path) {
        match self.file.set(imei, &path.to_string_lossy()).await {
            Ok(()) => debug!(imei, port = %path.display(), "port hint recorded"),
            Err(e) => warn!(
                file = %self.file.path().display(),
                error = %e,
                "failed to persist port hint"
            ),
        }
    }
}
