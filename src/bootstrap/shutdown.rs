use std::sync::Arc;

use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

/// Process-wide stop flag.
///
/// Every long-running task holds a receiver and ends once the flag is set.
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    pub fn new() -> Arc<Self> {
        let (tx, _) = watch::channel(false);
        Arc::new(Self { tx })
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Set the flag. Later calls have no effect.
    pub fn trigger(&self) {
        self.tx.send_if_modified(|stop| {
            if *stop {
                return false;
            }
            *stop = true;
            true
        });
    }

    /// Wait for SIGINT or SIGTERM, then set the flag.
    pub async fn wait_for_signal(&self) {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                error!(error = %e, "failed to install SIGINT handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    error!(error = %e, "failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        let mut rx = self.subscribe();
        tokio::select! {
            _ = ctrl_c => info!("received SIGINT"),
            _ = terminate => info!("received SIGTERM"),
            _ = rx.wait_for(|stop| *stop) => return,
        }

        self.trigger();
    }
}
