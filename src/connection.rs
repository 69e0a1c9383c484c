use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use strum_macros::Display;
use tokio::sync::{broadcast, watch};
use tokio::time::sleep;
use tracing::{error, info};

use crate::link::{LinkConnector, LinkTimeouts, VehicleLink};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
pub enum ConnectivityState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub endpoint: String,
    pub timeouts: LinkTimeouts,
    pub retry_interval: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            endpoint: "tcp:127.0.0.1:5762".to_string(),
            timeouts: LinkTimeouts::default(),
            retry_interval: Duration::from_secs(5),
        }
    }
}

/// Establishes the vehicle link and owns the connectivity state.
///
/// The manager holds the only sender of the connectivity channel; everything
/// else observes it through [`ConnectionManager::subscribe`].
pub struct ConnectionManager {
    connector: Arc<dyn LinkConnector>,
    settings: ConnectionSettings,
    state_tx: watch::Sender<ConnectivityState>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn LinkConnector>, settings: ConnectionSettings) -> Self {
        let (state_tx, _) = watch::channel(ConnectivityState::Disconnected);
        Self {
            connector,
            settings,
            state_tx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> ConnectivityState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: ConnectivityState) {
        self.state_tx.send_replace(state);
    }

    /// Connects, retrying every `retry_interval` until it succeeds.
    ///
    /// Attempts run one at a time. Returns `None` when shutdown is signalled
    /// before a link is established.
    pub async fn connect_with_retry(
        &self,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Option<Arc<dyn VehicleLink>> {
        let endpoint = &self.settings.endpoint;
        info!("[LINK] Attempting to connect to vehicle on: {}", endpoint);

        loop {
            self.set_state(ConnectivityState::Connecting);

            let attempt = self.connector.connect(endpoint, &self.settings.timeouts);
            let result = tokio::select! {
                result = attempt => result,
                _ = shutdown.recv() => {
                    info!("[LINK] Connection attempt aborted");
                    self.set_state(ConnectivityState::Disconnected);
                    return None;
                }
            };

            match result {
                Ok(link) => {
                    info!("[LINK] Vehicle connected successfully");
                    self.set_state(ConnectivityState::Connected);
                    return Some(link);
                }
                Err(e) => {
                    error!("[LINK] Error connecting to vehicle: {}", e);
                    self.set_state(ConnectivityState::Disconnected);
                }
            }

            info!(
                "[LINK] Connection failed, retrying in {:?}...",
                self.settings.retry_interval
            );
            tokio::select! {
                _ = sleep(self.settings.retry_interval) => {}
                _ = shutdown.recv() => {
                    info!("[LINK] Connection attempt aborted");
                    return None;
                }
            }
        }
    }

    /// Closes `link` and reports the vehicle as disconnected.
    pub async fn disconnect(&self, link: &Arc<dyn VehicleLink>) {
        link.close().await;
        self.set_state(ConnectivityState::Disconnected);
    }
}
