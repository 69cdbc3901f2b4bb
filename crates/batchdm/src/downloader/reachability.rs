//! Network reachability signal
//!
//! The scheduler consumes reachability as a `watch` channel of `bool` and only
//! reacts to transitions. [`ManualReachability`] lets a host (or a test) drive
//! the signal from its own platform notifications; [`HttpProbeMonitor`] derives
//! it by probing a URL periodically.

use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use crate::downloader::core::{DownloadError, Result};

/// Anything that can hand out a reachability subscription
pub trait ReachabilitySource: Send + Sync {
    /// A receiver whose current value is the present state
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// Reachability driven by explicit calls
#[derive(Debug, Clone)]
pub struct ManualReachability {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for ManualReachability {
    fn default() -> Self {
        Self::new(true)
    }
}

impl ManualReachability {
    pub fn new(initially_reachable: bool) -> Self {
        let (tx, _) = watch::channel(initially_reachable);
        Self { tx: Arc::new(tx) }
    }

    /// Publish a new state; repeating the current state is not a transition
    pub fn set_reachable(&self, reachable: bool) {
        let changed = publish(&self.tx, reachable);
        if changed {
            info!("Reachability changed: {}", if reachable { "online" } else { "offline" });
        }
    }

    pub fn is_reachable(&self) -> bool {
        *self.tx.borrow()
    }
}

impl ReachabilitySource for ManualReachability {
    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Reachability derived from periodic HEAD requests
///
/// Any HTTP response counts as reachable; only transport failures count as
/// unreachable. Probing stops when the monitor is dropped.
pub struct HttpProbeMonitor {
    tx: Arc<watch::Sender<bool>>,
    token: CancellationToken,
}

impl HttpProbeMonitor {
    /// Start probing `url` every `interval` on the current runtime
    pub fn spawn(url: Url, interval: Duration, timeout: Duration) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| DownloadError::Configuration {
            message: format!("reachability probe needs a tokio runtime: {}", e),
            field: None,
            suggestion: None,
        })?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DownloadError::Configuration {
                message: format!("Failed to create probe client: {}", e),
                field: None,
                suggestion: None,
            })?;

        let (tx, _) = watch::channel(true);
        let tx = Arc::new(tx);
        let token = CancellationToken::new();

        let probe_tx = tx.clone();
        let probe_token = token.clone();
        runtime.spawn(async move {
            loop {
                let reachable = probe(&client, &url).await;
                if publish(&probe_tx, reachable) {
                    info!("Probe of {} reports {}", url, if reachable { "online" } else { "offline" });
                }
                tokio::select! {
                    _ = probe_token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            debug!("Reachability probe for {} stopped", url);
        });

        Ok(Self { tx, token })
    }

    pub fn is_reachable(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn stop(&self) {
        self.token.cancel();
    }
}

impl Drop for HttpProbeMonitor {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl ReachabilitySource for HttpProbeMonitor {
    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

async fn probe(client: &Client, url: &Url) -> bool {
    match client.head(url.clone()).send().await {
        Ok(response) => {
            debug!("Probe {} -> {}", url, response.status());
            true
        }
        Err(e) => {
            debug!("Probe {} failed: {}", url, e);
            false
        }
    }
}

fn publish(tx: &watch::Sender<bool>, reachable: bool) -> bool {
    tx.send_if_modified(|current| {
        if *current == reachable {
            false
        } else {
            *current = reachable;
            true
        }
    })
}
