//! JSON/HTTP façade. Every endpoint maps one-to-one onto an interface
//! method; the per-interface mutex serializes clients, so a new request
//! cannot enter while a cycle is running.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::interface::{Interface, InterfaceError, ValveRequest};
use crate::models::mode::{ModeRequest, OperationMode, Row16Request};
use crate::models::state::StateReport;
use crate::models::wedge::WedgePosition;

#[derive(Clone)]
pub struct ApiState {
    pub interfaces: Arc<HashMap<String, Arc<Mutex<Interface>>>>,
}

impl ApiState {
    fn interface(&self, name: &str) -> Result<Arc<Mutex<Interface>>, ApiError> {
        self.interfaces
            .get(name)
            .cloned()
            .ok_or_else(|| ApiError::UnknownInterface(name.to_string()))
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/interfaces", get(list_interfaces))
        .route("/interfaces/:name", get(get_state))
        .route("/interfaces/:name/rpm", get(get_rpm))
        .route("/interfaces/:name/operation_mode", put(set_operation_mode))
        .route("/interfaces/:name/row16_mode", put(set_row16_mode))
        .route("/interfaces/:name/machine", post(machine_control))
        .route("/interfaces/:name/pump", post(pump_control))
        .route("/interfaces/:name/valves", post(valves_control))
        .route("/interfaces/:name/justification", post(justification))
        .route("/interfaces/:name/signals", post(send_signals))
        .with_state(state)
}

/// Serve the API until the daemon shuts down.
#[tracing::instrument(skip_all)]
pub async fn task_serve_api(token: CancellationToken, listener: TcpListener, router: Router) {
    info!("Started.");
    let shutdown = token.clone();
    let server = axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await });
    if let Err(e) = server.await {
        warn!("HTTP server failed. Error: {}", e);
        token.cancel();
    }
    warn!("Cancelled.");
}

#[derive(Debug)]
pub enum ApiError {
    UnknownInterface(String),
    BadRequest(String),
    Interface(InterfaceError),
}

impl From<InterfaceError> for ApiError {
    fn from(err: InterfaceError) -> Self {
        Self::Interface(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, message) = match &self {
            ApiError::UnknownInterface(name) => (
                StatusCode::NOT_FOUND,
                "unknown-interface",
                format!("no interface named {}", name),
            ),
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, "bad-request", message.clone())
            }
            ApiError::Interface(err) => {
                let (status, kind) = match err {
                    InterfaceError::UnsupportedMode(_) => {
                        (StatusCode::BAD_REQUEST, "unsupported-mode")
                    }
                    InterfaceError::UnsupportedRow16Mode(_) => {
                        (StatusCode::BAD_REQUEST, "unsupported-row16-mode")
                    }
                    InterfaceError::InterfaceBusy => (StatusCode::CONFLICT, "interface-busy"),
                    InterfaceError::NotStarted => {
                        (StatusCode::CONFLICT, "interface-not-started")
                    }
                    InterfaceError::MachineStopped => {
                        (StatusCode::INTERNAL_SERVER_ERROR, "machine-stopped")
                    }
                    InterfaceError::Gpio(_) | InterfaceError::Valves(_) => {
                        (StatusCode::INTERNAL_SERVER_ERROR, "hardware-error")
                    }
                };
                (status, kind, err.to_string())
            }
        };
        (status, Json(json!({ "error": kind, "message": message }))).into_response()
    }
}

fn mode_on_the_wire(mode: OperationMode) -> Value {
    match mode {
        OperationMode::Testing => Value::Null,
        mode => json!(mode),
    }
}

async fn list_interfaces(State(state): State<ApiState>) -> Json<Value> {
    let mut entries = serde_json::Map::new();
    for (name, interface) in state.interfaces.iter() {
        entries.insert(name.clone(), json!(interface.lock().await.description()));
    }
    Json(Value::Object(entries))
}

async fn get_state(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<Json<StateReport>, ApiError> {
    let interface = state.interface(&name)?;
    let report = interface.lock().await.state_report();
    Ok(Json(report))
}

async fn get_rpm(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let interface = state.interface(&name)?;
    let rpm = interface.lock().await.rpm();
    Ok(Json(json!({ "speed_rpm": rpm })))
}

#[derive(Debug, Deserialize)]
struct ModeBody {
    mode: Option<String>,
}

async fn set_operation_mode(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(body): Json<ModeBody>,
) -> Result<Json<Value>, ApiError> {
    let request = ModeRequest::parse(body.mode.as_deref())
        .map_err(InterfaceError::from)
        .map_err(ApiError::from)?;
    let interface = state.interface(&name)?;
    let mode = interface.lock().await.set_operation_mode(request)?;
    Ok(Json(json!({ "mode": mode_on_the_wire(mode) })))
}

async fn set_row16_mode(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(body): Json<ModeBody>,
) -> Result<Json<Value>, ApiError> {
    let request = Row16Request::parse(body.mode.as_deref())
        .map_err(InterfaceError::from)
        .map_err(ApiError::from)?;
    let interface = state.interface(&name)?;
    let mode = interface.lock().await.set_row16_mode(request)?;
    Ok(Json(json!({ "mode": mode })))
}

#[derive(Debug, Default, Deserialize)]
struct ControlBody {
    state: Option<bool>,
}

async fn machine_control(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(body): Json<ControlBody>,
) -> Result<Json<Value>, ApiError> {
    let interface = state.interface(&name)?;
    let working = interface.lock().await.machine_control(body.state).await?;
    Ok(Json(json!({ "working": working })))
}

async fn pump_control(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(body): Json<ControlBody>,
) -> Result<Json<Value>, ApiError> {
    let interface = state.interface(&name)?;
    let pump = interface.lock().await.pump_control(body.state).await?;
    Ok(Json(json!({ "pump": pump })))
}

#[derive(Debug, Deserialize)]
struct ValvesBody {
    signals: Option<Vec<String>>,
}

async fn valves_control(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(body): Json<ValvesBody>,
) -> Result<Json<Value>, ApiError> {
    let request = match body.signals {
        None => ValveRequest::Query,
        Some(signals) if signals.is_empty() => ValveRequest::Off,
        Some(signals) => ValveRequest::On(signals),
    };
    let interface = state.interface(&name)?;
    let signals = interface.lock().await.valves_control(request).await?;
    Ok(Json(json!({ "signals": signals })))
}

#[derive(Debug, Deserialize)]
struct JustificationBody {
    #[serde(default)]
    galley_trip: bool,
    wedge_0005: Option<u8>,
    wedge_0075: Option<u8>,
}

fn parse_wedge(raw: Option<u8>) -> Result<Option<WedgePosition>, ApiError> {
    raw.map(WedgePosition::try_from)
        .transpose()
        .map_err(|e| ApiError::BadRequest(e.to_string()))
}

async fn justification(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(body): Json<JustificationBody>,
) -> Result<Json<Value>, ApiError> {
    let wedge_0005 = parse_wedge(body.wedge_0005)?;
    let wedge_0075 = parse_wedge(body.wedge_0075)?;
    let interface = state.interface(&name)?;
    let mut interface = interface.lock().await;
    interface.justification(body.galley_trip, wedge_0005, wedge_0075).await?;
    let report = interface.state_report();
    Ok(Json(json!({
        "wedge_0005": report.wedge_0005,
        "wedge_0075": report.wedge_0075,
        "pump": report.pump,
    })))
}

#[derive(Debug, Deserialize)]
struct SignalsBody {
    signals: Vec<String>,
    timeout: Option<f64>,
}

async fn send_signals(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(body): Json<SignalsBody>,
) -> Result<Json<Value>, ApiError> {
    let timeout = match body.timeout {
        None => None,
        Some(seconds) if seconds.is_finite() && seconds >= 0.0 => {
            Some(Duration::from_secs_f64(seconds))
        }
        Some(seconds) => {
            return Err(ApiError::BadRequest(format!("invalid timeout: {}", seconds)))
        }
    };
    let interface = state.interface(&name)?;
    let signals = interface.lock().await.send_signals(&body.signals, timeout).await?;
    Ok(Json(json!({ "signals": signals })))
}

#[cfg(test)]
mod testing {
    use super::*;
    use crate::config;
    use crate::externals::gpio::mock::MockGpio;
    use crate::externals::gpio::GpioService;
    use crate::externals::valves::mock::MockValveBank;

    fn api_state() -> ApiState {
        let configuration = config::load_from_str("[caster]\n").unwrap();
        let (name, settings) = configuration.interfaces.into_iter().next().unwrap();
        let gpio = MockGpio::new();
        let (bank, _log) = MockValveBank::new();
        let interface = Interface::new(
            name.clone(),
            settings,
            gpio as Arc<dyn GpioService>,
            Box::new(bank),
        )
        .unwrap();
        let mut interfaces = HashMap::new();
        interfaces.insert(name, Arc::new(Mutex::new(interface)));
        ApiState { interfaces: Arc::new(interfaces) }
    }

    #[tokio::test]
    async fn test_unknown_interface_maps_to_404() {
        let state = ApiState { interfaces: Arc::new(HashMap::new()) };
        let err = get_state(State(state), Path("caster".to_string())).await.unwrap_err();
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_state_report_round_trip() {
        let state = api_state();
        let report =
            get_state(State(state), Path("caster".to_string())).await.unwrap();
        assert!(!report.0.working);
        assert_eq!(report.0.operation_mode, Some(OperationMode::Casting));
        assert_eq!(report.0.output_driver, "mock");
    }

    #[tokio::test]
    async fn test_mode_errors_map_to_4xx() {
        let state = api_state();
        let err = set_operation_mode(
            State(state.clone()),
            Path("caster".to_string()),
            Json(ModeBody { mode: Some("sorting".to_string()) }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);

        // cycle calls on a stopped interface are conflicts
        let err = send_signals(
            State(state),
            Path("caster".to_string()),
            Json(SignalsBody { signals: vec!["G".to_string()], timeout: None }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_null_mode_selects_testing() {
        let state = api_state();
        let response = set_operation_mode(
            State(state),
            Path("caster".to_string()),
            Json(ModeBody { mode: None }),
        )
        .await
        .unwrap();
        assert_eq!(response.0["mode"], Value::Null);
    }

    #[tokio::test]
    async fn test_invalid_wedge_is_a_bad_request() {
        let state = api_state();
        let err = justification(
            State(state),
            Path("caster".to_string()),
            Json(JustificationBody { galley_trip: false, wedge_0005: Some(40), wedge_0075: None }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }
}
