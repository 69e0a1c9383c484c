use std::sync::Arc;

use anyhow::Result;

use sortie::commander::Commander;
use sortie::config::{Config, CONFIG};
use sortie::connection::ConnectionManager;
use sortie::console::Console;
use sortie::link::MavlinkConnector;
use sortie::manual::ManualControl;
use sortie::mission::MissionSequencer;
use sortie::telemetry::{self, TelemetryLogger, TelemetryLoop, TelemetryMessage};
use sortie::vehicle::VehicleStateHandle;
use sortie::web_server::{AppState, FlightControls, WebServer};
use tokio::signal;
use tokio::sync::{broadcast, OnceCell};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let config: &'static Config = &CONFIG;
    setup_logging(&config.general.log_level)?;
    info!("Application starting...");

    // Create a shutdown signal channel
    let (shutdown_tx, _) = broadcast::channel(1);

    let latest = VehicleStateHandle::new();
    let telemetry_tx = telemetry::channel();
    let controls = Arc::new(OnceCell::new());
    let manager = ConnectionManager::new(
        Arc::new(MavlinkConnector),
        config.mavlink.connection_settings(),
    );

    let web_handle = if config.web.enabled {
        let state = AppState::new(
            latest.clone(),
            manager.subscribe(),
            telemetry_tx.clone(),
            controls.clone(),
        );
        let server = WebServer::new(state, &config.web.host, config.web.port);
        spawn_web_server(server, shutdown_tx.subscribe())
    } else {
        info!("Web server disabled in config, skipping...");
        tokio::spawn(async {})
    };

    let flight_handle = spawn_flight_services(
        config,
        manager,
        latest,
        telemetry_tx,
        controls,
        shutdown_tx.clone(),
    );

    let mut quit = shutdown_tx.subscribe();
    let shutdown_signal = async {
        tokio::select! {
            result = signal::ctrl_c() => match result {
                Ok(()) => {
                    info!("Shutdown signal received, stopping services...");
                    let _ = shutdown_tx.send(());
                }
                Err(err) => {
                    error!("Failed to listen for shutdown signal: {}", err);
                    let _ = shutdown_tx.send(());
                }
            },
            _ = quit.recv() => info!("Quit requested, stopping services..."),
        }
    };

    let results = tokio::join!(flight_handle, web_handle, shutdown_signal);
    for (result, name) in [results.0, results.1]
        .into_iter()
        .zip(["Flight services", "Web server"])
    {
        if let Err(e) = result {
            error!("{} join error: {}", name, e);
        }
    }

    info!("All services stopped, shutting down");
    Ok(())
}

/// Connects to the vehicle, then runs telemetry, manual control and the
/// console until shutdown.
fn spawn_flight_services(
    config: &'static Config,
    manager: ConnectionManager,
    latest: VehicleStateHandle,
    telemetry_tx: broadcast::Sender<Arc<TelemetryMessage>>,
    controls: Arc<OnceCell<FlightControls>>,
    shutdown_tx: broadcast::Sender<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut shutdown = shutdown_tx.subscribe();
        // subscribed before connecting so a signal in between is not missed
        let telemetry_shutdown = shutdown_tx.subscribe();
        let mission_shutdown = shutdown_tx.subscribe();
        let manual_shutdown = shutdown_tx.subscribe();
        let Some(link) = manager.connect_with_retry(&mut shutdown).await else {
            info!("Shutdown before the vehicle connected");
            return;
        };

        let commander = Arc::new(Commander::new(link.clone()));

        let mut telemetry = TelemetryLoop::with_publisher(
            link.clone(),
            manager.subscribe(),
            latest,
            config.telemetry.interval(),
            telemetry_tx,
        );
        let logger = telemetry.attach(Arc::new(TelemetryLogger));

        let sequencer = Arc::new(MissionSequencer::new(
            commander.clone(),
            manager.subscribe(),
            config.mission.sequencer_settings(),
        ));
        let manual_settings = config.manual.manual_settings();
        let mut manual = ManualControl::new(commander.clone(), manual_settings.clone())
            .with_quit(shutdown_tx.clone());
        let console = Console::new(manual.handle());

        let installed = controls.set(FlightControls {
            commander,
            sequencer: sequencer.clone(),
            manual: manual.handle(),
            plan: config.mission.plan(),
            limits: manual_settings.limits.clone(),
        });
        if installed.is_err() {
            warn!("Flight controls were already installed");
        }

        console.print_help(manual_settings.takeoff_altitude);
        let telemetry_handle =
            tokio::spawn(async move { telemetry.run(telemetry_shutdown).await });
        let mission_handle =
            tokio::spawn(async move { sequencer.abort_on_shutdown(mission_shutdown).await });
        let manual_handle = tokio::spawn(async move { manual.run(manual_shutdown).await });
        let console_thread = std::thread::Builder::new()
            .name("console".to_string())
            .spawn(move || console.run(std::io::stdin().lock()));
        if let Err(e) = console_thread {
            warn!("Console input unavailable: {}", e);
        }

        let _ = shutdown.recv().await;
        for (result, name) in [
            telemetry_handle.await,
            manual_handle.await,
            mission_handle.await,
        ]
        .into_iter()
        .zip(["Telemetry loop", "Manual control", "Mission abort"])
        {
            if let Err(e) = result {
                error!("{} join error: {}", name, e);
            }
        }
        logger.abort();

        info!("Closing vehicle connection...");
        manager.disconnect(&link).await;
    })
}

fn spawn_web_server(server: WebServer, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            result = server.start() => {
                if let Err(e) = result {
                    error!("Web server error: {}", e);
                }
            }
            _ = shutdown.recv() => {
                info!("Shutting down web server...");
            }
        }
    })
}

fn setup_logging(log_level: &str) -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_thread_ids(true) // Show thread IDs
                .with_thread_names(true) // Show thread names
                .with_target(true) // Show module path
                .with_file(true) // Show file name
                .with_line_number(true) // Show line numbers
                .pretty(),
        )
        .with(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(log_level))?
                .add_directive("tower_http=info".parse()?)
                .add_directive("mavlink=warn".parse()?),
        )
        .try_init()?;
    Ok(())
}
