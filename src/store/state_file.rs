//! Small persisted `key value` maps.
//!
//! Backs the port hint file and the self-test ledger. The file is always
//! rewritten completely into a temporary sibling and renamed into
//! place, so a crash mid-write leaves the previous version intact.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// A `key value` per line text file with atomic replacement.
#[derive(Debug)]
pub struct StateFile {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl StateFile {
    /// Load the file; a missing file yields an empty map.
    pub async fn load(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let entries = match fs::read_to_string(&path).await {
            Ok(contents) => parse(&path, &contents),
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e),
        };

        debug!(path = %path.display(), entries = entries.len(), "state file loaded");

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    /// File location
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Value for `key`
    pub async fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().await.get(key).cloned()
    }

    /// Set `key` and persist. Unchanged values are not rewritten.
    pub async fn set(&self, key: &str, value: &str) -> io::Result<()> {
        let mut entries = self.entries.lock().await;
        if entries.get(key).map(String::as_str) == Some(value) {
            return Ok(());
        }

        let previous = entries.insert(key.to_string(), value.to_string());
        if let Err(e) = write_atomic(&self.path, &render(&entries)).await {
            match previous {
                Some(old) => entries.insert(key.to_string(), old),
                None => entries.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }

    #[cfg(test)]
    async fn entries(&self) -> BTreeMap<String, String> {
        self.entries.lock().await.clone()
    }
}

fn parse(path: &Path, contents: &str) -> BTreeMap<String, String> {
    let mut entries = BTreeMap::new();
    for (number, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match line.split_once(char::is_whitespace) {
            Some((key, value)) if !value.trim().is_empty() => {
                entries.insert(key.to_string(), value.trim().to_string());
            }
            _ => warn!(path = %path.display(), line = number + 1, "ignoring malformed state line"),
        }
    }
    entries
}

fn render(entries: &BTreeMap<String, String>) -> String {
    entries
        .iter()
        .map(|(key, value)| format!("{key} {value}\n"))
        .collect()
}

/// Write `contents` to a temporary sibling of `path`, then rename it over `path`.
async fn write_atomic(path: &Path, contents: &str) -> io::Result<()> {
    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "state path has no file name"))?;

    let mut tmp_name = std::ffi::OsString::from(".");
    tmp_name.push(file_name);
    tmp_name.push(format!(".{}.tmp", std::process::id()));
    let tmp = path.with_file_name(tmp_name);

    let mut file = fs::File::create(&tmp).await?;
    file.write_all(contents.as_bytes()).await?;
    file.sync_all().await?;
    drop(file);

    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(())
}
