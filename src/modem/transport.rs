//! Device access.
//!
//! [`AtTransport`] moves frames to and from one modem; [`PortOpener`]
//! enumerates and opens device nodes. The serial implementations are used
//! in production, [`super::mock`] provides simulated ones.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tokio_util::codec::Framed;
use tracing::debug;

use super::codec::{AtCodec, AtFrame, AtOut};

/// Bidirectional frame channel to one modem.
///
/// `next_frame` must be cancel safe: it is raced against the command queue.
#[async_trait]
pub trait AtTransport: Send + Sync {
    async fn send(&mut self, out: AtOut) -> io::Result<()>;

    async fn next_frame(&mut self) -> io::Result<AtFrame>;
}

/// Enumerates and opens modem device nodes.
#[async_trait]
pub trait PortOpener: Send + Sync {
    /// Entries of `dir`, unsorted
    async fn list(&self, dir: &Path) -> io::Result<Vec<PathBuf>>;

    async fn open(&self, path: &Path, baud: u32) -> io::Result<Box<dyn AtTransport>>;
}

/// Modem attached through a serial device.
pub struct SerialTransport {
    framed: Framed<SerialStream, AtCodec>,
}

#[async_trait]
impl AtTransport for SerialTransport {
    async fn send(&mut self, out: AtOut) -> io::Result<()> {
        self.framed.send(out).await
    }

    async fn next_frame(&mut self) -> io::Result<AtFrame> {
        match self.framed.next().await {
            Some(frame) => frame,
            None => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "device closed")),
        }
    }
}

/// Opens real serial devices.
#[derive(Debug, Default, Clone)]
pub struct SerialOpener;

#[async_trait]
impl PortOpener for SerialOpener {
    async fn list(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        let mut entries = tokio::fs::read_dir(dir).await?;
        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            paths.push(entry.path());
        }
        Ok(paths)
    }

    async fn open(&self, path: &Path, baud: u32) -> io::Result<Box<dyn AtTransport>> {
        #[allow(unused_mut)]
        let mut stream = tokio_serial::new(path.to_string_lossy(), baud)
            .open_native_async()
            .map_err(io::Error::from)?;

        #[cfg(unix)]
        stream.set_exclusive(true).map_err(io::Error::from)?;

        debug!(port = %path.display(), baud, "serial port opened");

        Ok(Box::new(SerialTransport {
            framed: Framed::new(stream, AtCodec::new()),
        }))
    }
}
