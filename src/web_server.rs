use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{broadcast, watch, OnceCell};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use anyhow::{Context, Result};

use crate::commander::Commander;
use crate::connection::ConnectivityState;
use crate::error::FlightError;
use crate::flight::{self, ActionLimits, ArmOutcome};
use crate::manual::{InputEvent, ManualHandle, SubmitError};
use crate::mission::{mission_completed, MissionPlan, MissionSequencer, StepStatus};
use crate::telemetry::TelemetryMessage;
use crate::vehicle::VehicleStateHandle;

/// Everything that needs a live link. Installed once the vehicle connects.
pub struct FlightControls {
    pub commander: Arc<Commander>,
    pub sequencer: Arc<MissionSequencer>,
    pub manual: ManualHandle,
    pub plan: MissionPlan,
    pub limits: ActionLimits,
}

#[derive(Clone)]
pub struct AppState {
    latest: VehicleStateHandle,
    connectivity: watch::Receiver<ConnectivityState>,
    telemetry: broadcast::Sender<Arc<TelemetryMessage>>,
    controls: Arc<OnceCell<FlightControls>>,
}

impl AppState {
    pub fn new(
        latest: VehicleStateHandle,
        connectivity: watch::Receiver<ConnectivityState>,
        telemetry: broadcast::Sender<Arc<TelemetryMessage>>,
        controls: Arc<OnceCell<FlightControls>>,
    ) -> Self {
        Self {
            latest,
            connectivity,
            telemetry,
            controls,
        }
    }

    fn controls(&self) -> Result<&FlightControls, ApiError> {
        self.controls
            .get()
            .ok_or(ApiError::Flight(FlightError::LinkUnavailable))
    }
}

#[derive(Debug)]
enum ApiError {
    Flight(FlightError),
    BadRequest(String),
    Internal(String),
}

impl From<FlightError> for ApiError {
    fn from(e: FlightError) -> Self {
        ApiError::Flight(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Flight(e) => {
                let status = match e {
                    FlightError::LinkUnavailable => StatusCode::SERVICE_UNAVAILABLE,
                    FlightError::PreconditionFailed(_) => StatusCode::BAD_REQUEST,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, e.to_string())
            }
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, message),
        };
        (status, Json(json!({ "status": "error", "message": message }))).into_response()
    }
}

fn success(message: &str) -> Json<Value> {
    Json(json!({ "status": "success", "message": message }))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/telemetry", get(get_telemetry))
        .route("/api/connection", get(get_connection))
        .route("/api/mission", get(get_mission))
        .route("/command/arm", post(command_arm))
        .route("/command/start_mission", post(command_start_mission))
        .route("/command/abort", post(command_abort))
        .route("/command/rtl", post(command_rtl))
        .route("/command/input/:key", post(command_input))
        .route("/ws", get(ws_upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn get_telemetry(State(state): State<AppState>) -> Response {
    match state.latest.snapshot() {
        Some(snapshot) => Json(snapshot).into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "error", "message": "no telemetry yet" })),
        )
            .into_response(),
    }
}

async fn get_connection(State(state): State<AppState>) -> Json<Value> {
    let connectivity = *state.connectivity.borrow();
    Json(json!({ "state": connectivity }))
}

async fn get_mission(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let controls = state.controls()?;
    Ok(Json(json!({ "state": controls.sequencer.state() })))
}

async fn command_arm(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    info!("Received ARM command from web");
    let controls = state.controls()?;
    match flight::arm(&controls.commander, &controls.limits).await? {
        ArmOutcome::Armed => Ok(success("Vehicle armed")),
        ArmOutcome::AlreadyArmed => Ok(success("Vehicle already armed")),
    }
}

/// Runs the configured plan to the end before answering.
///
/// The run lives in its own task, so a client that goes away mid-mission
/// does not cut it short. A start while a mission is running is rejected.
async fn command_start_mission(State(state): State<AppState>) -> Result<Response, ApiError> {
    info!("Received START MISSION command from web");
    let controls = state.controls()?;
    let sequencer = controls.sequencer.clone();
    let plan = controls.plan.clone();
    let outcomes = tokio::spawn(async move { sequencer.run_mission(&plan).await })
        .await
        .map_err(|e| ApiError::Internal(format!("mission task failed: {}", e)))?;

    let completed = mission_completed(&outcomes, controls.plan.len());
    let status = if completed {
        StatusCode::OK
    } else if matches!(
        outcomes.as_slice(),
        [first] if matches!(first.status, StepStatus::Aborted { .. }) && first.step_index == 0
    ) {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    let body = json!({
        "status": if completed { "success" } else { "error" },
        "message": if completed { "Mission completed" } else { "Mission aborted" },
        "outcomes": outcomes,
    });
    Ok((status, Json(body)).into_response())
}

async fn command_abort(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    state.controls()?.sequencer.abort();
    Ok(success("Mission abort requested"))
}

async fn command_rtl(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    info!("Received RTL command from web");
    let controls = state.controls()?;
    flight::return_to_launch(&controls.commander).await?;
    Ok(success("RTL mode initiated"))
}

async fn command_input(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let input = InputEvent::from_key(&key)
        .ok_or_else(|| ApiError::BadRequest(format!("unknown input key '{}'", key)))?;
    let controls = state.controls()?;
    controls.manual.submit_input(input).map_err(|e| match e {
        SubmitError::Full(_) => ApiError::BadRequest(e.to_string()),
        SubmitError::Closed(_) => ApiError::Flight(FlightError::LinkUnavailable),
    })?;
    Ok(success(&format!("{} queued", input)))
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

fn telemetry_frame(message: &TelemetryMessage) -> Option<String> {
    serde_json::to_string(&json!({
        "event": "telemetry_update",
        "data": message,
    }))
    .ok()
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let client_id = Uuid::new_v4();
    info!("Web client connected: {}", client_id);

    let (mut sink, mut stream) = socket.split();
    let mut updates = state.telemetry.subscribe();

    if let Some(snapshot) = state.latest.snapshot() {
        let first = TelemetryMessage {
            sequence: 0,
            timestamp: chrono::Utc::now().timestamp_millis(),
            state: snapshot,
        };
        if let Some(frame) = telemetry_frame(&first) {
            if sink.send(Message::Text(frame)).await.is_err() {
                return;
            }
        }
    }

    let forward = async {
        loop {
            match updates.recv().await {
                Ok(message) => {
                    let Some(frame) = telemetry_frame(&message) else {
                        continue;
                    };
                    if sink.send(Message::Text(frame)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("Web client {} lagging, dropped {} updates", client_id, missed);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    let receive = async {
        while let Some(Ok(message)) = stream.next().await {
            if let Message::Close(reason) = message {
                debug!("Client requested close: {:?}", reason);
                break;
            }
        }
    };

    tokio::select! {
        _ = forward => {}
        _ = receive => {}
    }
    info!("Web client disconnected: {}", client_id);
}

pub struct WebServer {
    state: AppState,
    host: String,
    port: u16,
}

impl WebServer {
    pub fn new(state: AppState, host: &str, port: u16) -> Self {
        Self {
            state,
            host: host.to_string(),
            port,
        }
    }

    pub async fn start(&self) -> Result<()> {
        let app = router(self.state.clone());
        info!("Starting web server on http://{}:{}", self.host, self.port);

        let listener = tokio::net::TcpListener::bind(format!("{}:{}", self.host, self.port))
            .await
            .context(format!("Failed to bind to port {}", self.port))?;

        axum::serve(listener, app)
            .await
            .context("Failed to serve")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::mock::MockLink;
    use crate::link::mock::MockBehavior;
    use crate::manual::{ManualControl, ManualSettings};
    use crate::mission::{SequencerSettings, SequencerState};
    use crate::telemetry;
    use std::time::Duration;
    use tokio::time::sleep;

    struct Fixture {
        state: AppState,
        link: Arc<MockLink>,
        _connectivity: watch::Sender<ConnectivityState>,
        _manual: ManualControl,
    }

    fn fixture(link: MockLink, connected: bool) -> Fixture {
        let link = Arc::new(link);
        let (tx, rx) = watch::channel(ConnectivityState::Connected);
        let controls = Arc::new(OnceCell::new());
        let commander = Arc::new(Commander::new(link.clone()));
        let manual = ManualControl::new(commander.clone(), ManualSettings::default());
        if connected {
            let sequencer = MissionSequencer::new(
                commander.clone(),
                rx.clone(),
                SequencerSettings::default(),
            );
            let installed = controls.set(FlightControls {
                commander,
                sequencer: Arc::new(sequencer),
                manual: manual.handle(),
                plan: MissionPlan::default(),
                limits: ActionLimits::default(),
            });
            assert!(installed.is_ok());
        }
        let latest = VehicleStateHandle::new();
        Fixture {
            state: AppState::new(latest, rx, telemetry::channel(), controls),
            link,
            _connectivity: tx,
            _manual: manual,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_need_a_link() {
        let f = fixture(MockLink::on_ground(), false);

        let response = command_rtl(State(f.state.clone())).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let response = get_telemetry(State(f.state)).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_arm_reports_already_armed() {
        let f = fixture(MockLink::hovering(), true);

        let Json(body) = command_arm(State(f.state)).await.ok().unwrap();
        assert_eq!(body["status"], "success");
        assert_eq!(body["message"], "Vehicle already armed");
        assert!(f.link.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_mission_while_disarmed_is_bad_request() {
        let f = fixture(MockLink::on_ground(), true);

        let response = command_start_mission(State(f.state)).await.ok().unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(f.link.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_mission_outlives_dropped_request() {
        let f = fixture(MockLink::hovering(), true);
        let sequencer = f.state.controls().ok().unwrap().sequencer.clone();

        let request = tokio::spawn(command_start_mission(State(f.state.clone())));
        sleep(Duration::from_secs(2)).await;
        request.abort();
        assert!(request.await.unwrap_err().is_cancelled());

        let mut mission = sequencer.watch_state();
        mission
            .wait_for(|s| *s == SequencerState::Complete)
            .await
            .unwrap();
        assert_eq!(f.link.commands().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_start_rejected_while_running() {
        let f = fixture(
            MockLink::hovering_with(MockBehavior {
                freeze_position: true,
                ..MockBehavior::default()
            }),
            true,
        );

        let first = tokio::spawn(command_start_mission(State(f.state.clone())));
        sleep(Duration::from_secs(3)).await;

        let second = command_start_mission(State(f.state.clone()))
            .await
            .ok()
            .unwrap();
        assert_eq!(second.status(), StatusCode::BAD_REQUEST);
        let sent = f.link.sent().len();

        let Json(body) = command_abort(State(f.state)).await.ok().unwrap();
        assert_eq!(body["status"], "success");
        let first = first.await.unwrap().ok().unwrap();
        assert_eq!(first.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(f.link.sent().len(), sent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_input_key_rejected() {
        let f = fixture(MockLink::hovering(), true);

        let response = command_input(State(f.state.clone()), Path("x".to_string()))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let Json(body) = command_input(State(f.state), Path("w".to_string()))
            .await
            .ok()
            .unwrap();
        assert_eq!(body["message"], "forward queued");
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_state_reported() {
        let f = fixture(MockLink::hovering(), true);
        let Json(body) = get_connection(State(f.state)).await;
        assert_eq!(body["state"], "Connected");
    }
}
