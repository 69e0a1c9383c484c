use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::connection::ConnectivityState;
use crate::link::VehicleLink;
use crate::vehicle::{VehicleState, VehicleStateHandle};

const SUBSCRIBER_BUFFER: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryMessage {
    /// Poll counter, strictly increasing per loop.
    pub sequence: u64,
    pub timestamp: i64,
    pub state: VehicleState,
}

/// Receives every published snapshot in poll order.
///
/// Runs on its own task; a slow subscriber only ever drops its own backlog.
pub trait TelemetrySubscriber: Send + Sync + 'static {
    fn on_snapshot(&self, message: &TelemetryMessage);
}

/// Logs each snapshot at debug level.
pub struct TelemetryLogger;

impl TelemetrySubscriber for TelemetryLogger {
    fn on_snapshot(&self, message: &TelemetryMessage) {
        let s = &message.state;
        debug!(
            "[TELEMETRY] #{} lat={:.7} lon={:.7} alt={:.2}m hdg={:.0} gs={:.1}m/s mode={} armed={} bat={:.2}V",
            message.sequence,
            s.position.latitude,
            s.position.longitude,
            s.altitude(),
            s.heading,
            s.groundspeed,
            s.mode,
            s.armed,
            s.battery.voltage
        );
    }
}

pub struct TelemetryLoop {
    link: Arc<dyn VehicleLink>,
    connectivity: watch::Receiver<ConnectivityState>,
    latest: VehicleStateHandle,
    tx: broadcast::Sender<Arc<TelemetryMessage>>,
    interval: Duration,
    sequence: u64,
}

impl TelemetryLoop {
    pub fn new(
        link: Arc<dyn VehicleLink>,
        connectivity: watch::Receiver<ConnectivityState>,
        latest: VehicleStateHandle,
        interval: Duration,
    ) -> Self {
        Self::with_publisher(link, connectivity, latest, interval, channel())
    }

    /// Publishes on an existing channel, so subscribers can be handed out
    /// before the link exists.
    pub fn with_publisher(
        link: Arc<dyn VehicleLink>,
        connectivity: watch::Receiver<ConnectivityState>,
        latest: VehicleStateHandle,
        interval: Duration,
        tx: broadcast::Sender<Arc<TelemetryMessage>>,
    ) -> Self {
        Self {
            link,
            connectivity,
            latest,
            tx,
            interval,
            sequence: 0,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<TelemetryMessage>> {
        self.tx.subscribe()
    }

    /// Delivers snapshots to `subscriber` from a dedicated task.
    pub fn attach(&self, subscriber: Arc<dyn TelemetrySubscriber>) -> JoinHandle<()> {
        spawn_subscriber(self.tx.subscribe(), subscriber)
    }

    /// Polls once. On failure the previous snapshot is kept and nothing is
    /// published.
    pub async fn poll_once(&mut self) -> bool {
        let state = match self.link.read_state().await {
            Ok(state) => state,
            Err(e) => {
                warn!("[TELEMETRY] Skipping cycle, vehicle state unavailable: {}", e);
                return false;
            }
        };

        self.latest.replace(state.clone());
        self.sequence += 1;
        let message = TelemetryMessage {
            sequence: self.sequence,
            timestamp: Utc::now().timestamp_millis(),
            state,
        };
        // no subscribers is fine
        let _ = self.tx.send(Arc::new(message));
        true
    }

    /// Runs until `shutdown` fires, polling only while connected.
    pub async fn run(&mut self, mut shutdown: broadcast::Receiver<()>) {
        info!("[TELEMETRY] Telemetry loop started");
        loop {
            let connected = *self.connectivity.borrow() == ConnectivityState::Connected;
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = self.cycle(connected) => {}
            }
        }
        info!("[TELEMETRY] Telemetry loop stopped");
    }

    async fn cycle(&mut self, connected: bool) {
        if connected {
            self.poll_once().await;
            sleep(self.interval).await;
        } else if self.connectivity.changed().await.is_err() {
            // connection manager gone, nothing will ever connect again
            sleep(self.interval).await;
        }
    }
}

pub fn channel() -> broadcast::Sender<Arc<TelemetryMessage>> {
    broadcast::channel(SUBSCRIBER_BUFFER).0
}

pub fn spawn_subscriber(
    mut rx: broadcast::Receiver<Arc<TelemetryMessage>>,
    subscriber: Arc<dyn TelemetrySubscriber>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(message) => subscriber.on_snapshot(&message),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("[TELEMETRY] Subscriber lagging, dropped {} snapshots", missed);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::mock::MockLink;
    use std::sync::Mutex;

    struct Recorder(Mutex<Vec<u64>>);

    impl TelemetrySubscriber for Recorder {
        fn on_snapshot(&self, message: &TelemetryMessage) {
            self.0.lock().unwrap().push(message.sequence);
        }
    }

    fn telemetry_loop(
        link: Arc<MockLink>,
        state: ConnectivityState,
    ) -> (TelemetryLoop, watch::Sender<ConnectivityState>, VehicleStateHandle) {
        let (state_tx, state_rx) = watch::channel(state);
        let latest = VehicleStateHandle::new();
        let telemetry = TelemetryLoop::new(link, state_rx, latest.clone(), Duration::from_secs(1));
        (telemetry, state_tx, latest)
    }

    #[tokio::test(start_paused = true)]
    async fn test_publishes_in_poll_order() {
        let link = Arc::new(MockLink::hovering());
        let (mut telemetry, _state_tx, latest) =
            telemetry_loop(link.clone(), ConnectivityState::Connected);
        let mut rx = telemetry.subscribe();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let task = tokio::spawn(async move { telemetry.run(shutdown_rx).await });
        sleep(Duration::from_millis(4500)).await;
        shutdown_tx.send(()).unwrap();
        task.await.unwrap();

        let mut seen = Vec::new();
        while let Ok(message) = rx.try_recv() {
            seen.push(message.sequence);
        }
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
        assert_eq!(link.reads(), 5);
        assert!(latest.snapshot().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_poll_keeps_previous_snapshot() {
        let link = Arc::new(MockLink::hovering());
        let (mut telemetry, _state_tx, latest) =
            telemetry_loop(link.clone(), ConnectivityState::Connected);
        let mut rx = telemetry.subscribe();

        assert!(telemetry.poll_once().await);
        let before = latest.snapshot();

        link.update(|s| s.heading = 123.0);
        link.fail_next_reads(1);
        assert!(!telemetry.poll_once().await);
        assert_eq!(latest.snapshot(), before);

        assert!(telemetry.poll_once().await);
        assert_eq!(latest.snapshot().unwrap().heading, 123.0);

        assert_eq!(rx.try_recv().unwrap().sequence, 1);
        assert_eq!(rx.try_recv().unwrap().sequence, 2);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_connection_before_polling() {
        let link = Arc::new(MockLink::hovering());
        let (mut telemetry, state_tx, _latest) =
            telemetry_loop(link.clone(), ConnectivityState::Connecting);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let task = tokio::spawn(async move { telemetry.run(shutdown_rx).await });
        sleep(Duration::from_secs(5)).await;
        assert_eq!(link.reads(), 0);

        state_tx.send(ConnectivityState::Connected).unwrap();
        sleep(Duration::from_millis(2500)).await;
        assert_eq!(link.reads(), 3);

        shutdown_tx.send(()).unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_attached_subscriber_sees_every_snapshot() {
        let link = Arc::new(MockLink::hovering());
        let (mut telemetry, _state_tx, _latest) =
            telemetry_loop(link, ConnectivityState::Connected);
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let handle = telemetry.attach(recorder.clone());

        for _ in 0..3 {
            telemetry.poll_once().await;
        }
        drop(telemetry);
        handle.await.unwrap();

        assert_eq!(*recorder.0.lock().unwrap(), vec![1, 2, 3]);
    }
}
