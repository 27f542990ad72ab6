use anyhow::{Context, Result};
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post, put};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::future::Future;
use std::net::SocketAddr;
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::command::{self, Command, CommandSource};
use crate::db::{Db, Reading, SettingsPatch};
use crate::error::Error;
use crate::ingest::{self, ReadingMsg};
use crate::state::{PumpState, StatusRegister, WateringMode};

/// Default history window.
const DEFAULT_HISTORY_HOURS: f64 = 24.0;

#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub status: StatusRegister,
}

// ---------------------------------------------------------------------------
// Request / response bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    hours: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SettingsBody {
    humidity_threshold: Option<i64>,
    watering_mode: Option<WateringMode>,
    scheduled_interval: Option<i64>,
}

#[derive(Serialize)]
struct HistoryPoint {
    soil_humidity: f64,
    temperature: f64,
    air_humidity: f64,
    pump_status: PumpState,
    #[serde(with = "time::serde::rfc3339")]
    timestamp: OffsetDateTime,
}

impl From<Reading> for HistoryPoint {
    fn from(r: Reading) -> Self {
        Self {
            soil_humidity: r.soil_humidity,
            temperature: r.temperature,
            air_humidity: r.air_humidity,
            pump_status: r.pump_status,
            timestamp: r.captured_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/data", post(api_data))
        .route("/api/latest", get(api_latest))
        .route("/api/history", get(api_history))
        .route("/api/command", post(api_command))
        .route("/api/settings", put(api_settings))
        .route("/api/health", get(api_health))
        .route("/api/events", get(api_events))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn api_data(
    State(state): State<AppState>,
    body: Result<Json<ReadingMsg>, JsonRejection>,
) -> Result<impl IntoResponse, Error> {
    let Json(msg) = body.map_err(|e| Error::validation(e.body_text()))?;
    let id = ingest::ingest(&state.db, &state.status, msg).await?;
    Ok(Json(json!({
        "success": true,
        "id": id,
        "message": "Data received successfully",
    })))
}

async fn api_latest(State(state): State<AppState>) -> Result<impl IntoResponse, Error> {
    let reading = state.db.latest_reading().await?;
    let settings = state.db.current_settings().await?;
    let status = state.status.snapshot().await;
    Ok(Json(json!({
        "sensorData": reading,
        "systemStatus": status,
        "settings": settings,
    })))
}

async fn api_history(
    State(state): State<AppState>,
    query: Result<Query<HistoryQuery>, QueryRejection>,
) -> Result<impl IntoResponse, Error> {
    let Query(q) = query.map_err(|e| Error::validation(e.body_text()))?;
    let hours = q.hours.unwrap_or(DEFAULT_HISTORY_HOURS);
    let points: Vec<HistoryPoint> = state
        .db
        .readings_since(hours)
        .await?
        .into_iter()
        .map(HistoryPoint::from)
        .collect();
    Ok(Json(points))
}

async fn api_command(
    State(state): State<AppState>,
    body: Result<Json<Command>, JsonRejection>,
) -> Result<impl IntoResponse, Error> {
    let Json(cmd) = body.map_err(|e| Error::validation(e.body_text()))?;
    let applied = command::issue(&state.status, cmd, CommandSource::Operator).await?;
    Ok(Json(json!({
        "success": true,
        "command": applied,
        "message": "Command sent successfully",
    })))
}

async fn api_settings(
    State(state): State<AppState>,
    body: Result<Json<SettingsBody>, JsonRejection>,
) -> Result<impl IntoResponse, Error> {
    let Json(body) = body.map_err(|e| Error::validation(e.body_text()))?;
    let patch = SettingsPatch {
        humidity_threshold: body.humidity_threshold,
        watering_mode: body.watering_mode,
        scheduled_interval_hours: body.scheduled_interval,
    };
    let settings = state.db.update_settings(&patch).await?;
    info!(
        threshold = settings.humidity_threshold,
        mode = %settings.watering_mode,
        interval_h = settings.scheduled_interval_hours,
        "settings updated"
    );
    Ok(Json(json!({
        "success": true,
        "message": "Settings updated successfully",
        "settings": settings,
    })))
}

async fn api_health(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.status.snapshot().await;
    let now = OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default();
    Json(json!({
        "status": "OK",
        "timestamp": now,
        "systemStatus": status,
    }))
}

async fn api_events(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.status.events().await)
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

/// Serve until `shutdown` resolves, then let in-flight requests finish.
pub async fn serve(
    addr: SocketAddr,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {addr}"))?;

    info!("api listening on http://{addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::{sample, test_db};
    use crate::db::NewReading;
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use time::Duration;
    use tower::ServiceExt;

    async fn test_state() -> AppState {
        let db = test_db().await;
        db.ensure_default_settings().await.unwrap();
        AppState {
            db,
            status: StatusRegister::new(WateringMode::Auto),
        }
    }

    async fn send(
        state: &AppState,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(v) => {
                req = req.header("content-type", "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        let resp = router(state.clone())
            .oneshot(req.body(body).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    // -- /api/data ----------------------------------------------------------

    #[tokio::test]
    async fn data_accepts_full_payload() {
        let state = test_state().await;
        let (code, body) = send(
            &state,
            Method::POST,
            "/api/data",
            Some(json!({"soil": 25, "temp": 21.5, "hum": 60, "pump": "on"})),
        )
        .await;

        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["success"], true);
        let id = body["id"].as_i64().unwrap();
        assert_eq!(state.db.latest_reading().await.unwrap().unwrap().id, id);
        assert_eq!(state.status.snapshot().await.pump_status, PumpState::On);
    }

    #[tokio::test]
    async fn data_missing_pump_is_400_and_stores_nothing() {
        let state = test_state().await;
        let (code, body) = send(
            &state,
            Method::POST,
            "/api/data",
            Some(json!({"soil": 1, "temp": 2, "hum": 3})),
        )
        .await;

        assert_eq!(code, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Missing required fields");
        assert!(state.db.latest_reading().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn data_malformed_json_is_400() {
        let state = test_state().await;
        let resp = router(state.clone())
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/api/data")
                    .header("content-type", "application/json")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    // -- /api/latest --------------------------------------------------------

    #[tokio::test]
    async fn latest_on_fresh_deployment_has_null_reading() {
        let state = test_state().await;
        let (code, body) = send(&state, Method::GET, "/api/latest", None).await;

        assert_eq!(code, StatusCode::OK);
        assert!(body["sensorData"].is_null());
        assert_eq!(body["systemStatus"]["isOnline"], true);
        assert_eq!(body["settings"]["humidity_threshold"], 30);
        assert_eq!(body["settings"]["watering_mode"], "auto");
        assert_eq!(body["settings"]["scheduled_interval"], 12);
    }

    #[tokio::test]
    async fn latest_returns_newest_reading() {
        let state = test_state().await;
        state.db.insert_reading(&sample(10.0)).await.unwrap();
        state.db.insert_reading(&sample(20.0)).await.unwrap();

        let (_, body) = send(&state, Method::GET, "/api/latest", None).await;
        assert_eq!(body["sensorData"]["soil_humidity"], 20.0);
        assert_eq!(body["sensorData"]["pump_status"], "off");
        assert!(body["sensorData"]["timestamp"].is_string());
    }

    // -- /api/history -------------------------------------------------------

    #[tokio::test]
    async fn history_defaults_to_24_hours() {
        let state = test_state().await;
        let now = OffsetDateTime::now_utc();
        for (hours_ago, soil) in [(30, 1.0), (2, 2.0), (1, 3.0)] {
            state
                .db
                .insert_reading(&NewReading {
                    captured_at: Some(now - Duration::hours(hours_ago)),
                    ..sample(soil)
                })
                .await
                .unwrap();
        }

        let (code, body) = send(&state, Method::GET, "/api/history", None).await;
        assert_eq!(code, StatusCode::OK);
        let soils: Vec<f64> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|p| p["soil_humidity"].as_f64().unwrap())
            .collect();
        assert_eq!(soils, vec![2.0, 3.0]);
        assert!(body[0].get("id").is_none());

        let (_, body) = send(&state, Method::GET, "/api/history?hours=48", None).await;
        assert_eq!(body.as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn history_rejects_bad_hours() {
        let state = test_state().await;
        let (code, _) = send(&state, Method::GET, "/api/history?hours=-1", None).await;
        assert_eq!(code, StatusCode::BAD_REQUEST);
        let (code, _) = send(&state, Method::GET, "/api/history?hours=abc", None).await;
        assert_eq!(code, StatusCode::BAD_REQUEST);
    }

    // -- /api/command -------------------------------------------------------

    #[tokio::test]
    async fn command_requires_pump_or_mode() {
        let state = test_state().await;
        let (code, body) = send(&state, Method::POST, "/api/command", Some(json!({}))).await;
        assert_eq!(code, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Missing pump or mode command");
    }

    #[tokio::test]
    async fn command_mode_does_not_touch_settings() {
        let state = test_state().await;
        let (code, body) = send(
            &state,
            Method::POST,
            "/api/command",
            Some(json!({"mode": "manual"})),
        )
        .await;

        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["command"], json!({"mode": "manual"}));
        assert_eq!(
            state.status.snapshot().await.current_mode,
            WateringMode::Manual
        );
        assert_eq!(
            state.db.current_settings().await.unwrap().watering_mode,
            WateringMode::Auto
        );
    }

    #[tokio::test]
    async fn command_rejects_unknown_pump_value() {
        let state = test_state().await;
        let (code, _) = send(
            &state,
            Method::POST,
            "/api/command",
            Some(json!({"pump": "maybe"})),
        )
        .await;
        assert_eq!(code, StatusCode::BAD_REQUEST);
    }

    // -- /api/settings ------------------------------------------------------

    #[tokio::test]
    async fn settings_partial_update() {
        let state = test_state().await;
        let (code, body) = send(
            &state,
            Method::PUT,
            "/api/settings",
            Some(json!({"humidity_threshold": 40})),
        )
        .await;

        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["settings"]["humidity_threshold"], 40);
        assert_eq!(body["settings"]["watering_mode"], "auto");
        assert_eq!(body["settings"]["scheduled_interval"], 12);
    }

    #[tokio::test]
    async fn settings_out_of_range_is_400() {
        let state = test_state().await;
        let (code, _) = send(
            &state,
            Method::PUT,
            "/api/settings",
            Some(json!({"humidity_threshold": 250})),
        )
        .await;
        assert_eq!(code, StatusCode::BAD_REQUEST);
        assert_eq!(
            state.db.current_settings().await.unwrap().humidity_threshold,
            30
        );
    }

    // -- /api/health, /api/events --------------------------------------------

    #[tokio::test]
    async fn health_is_always_ok() {
        let state = test_state().await;
        state.db.close().await;

        let (code, body) = send(&state, Method::GET, "/api/health", None).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["status"], "OK");
        assert!(body["timestamp"].is_string());
        assert!(body["systemStatus"]["pumpStatus"].is_string());
    }

    #[tokio::test]
    async fn store_failure_is_500() {
        let state = test_state().await;
        state.db.close().await;

        let (code, body) = send(&state, Method::GET, "/api/latest", None).await;
        assert_eq!(code, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Database error");
    }

    #[tokio::test]
    async fn events_lists_recent_activity() {
        let state = test_state().await;
        send(
            &state,
            Method::POST,
            "/api/command",
            Some(json!({"pump": "on"})),
        )
        .await;

        let (code, body) = send(&state, Method::GET, "/api/events", None).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body[0]["kind"], "command");
        assert_eq!(body[0]["detail"], "operator: pump=on");
    }

    #[tokio::test]
    async fn preflight_allows_any_origin() {
        let state = test_state().await;
        let req = Request::builder()
            .method(Method::OPTIONS)
            .uri("/api/command")
            .header("origin", "http://dashboard.local")
            .header("access-control-request-method", "POST")
            .header("access-control-request-headers", "content-type")
            .body(Body::empty())
            .unwrap();

        let resp = router(state).oneshot(req).await.unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        let h = resp.headers();
        assert_eq!(h["access-control-allow-origin"], "*");
        assert!(h.contains_key("access-control-allow-methods"));
    }

    #[tokio::test]
    async fn cross_origin_get_carries_allow_origin() {
        let state = test_state().await;
        let req = Request::builder()
            .uri("/api/health")
            .header("origin", "http://dashboard.local")
            .body(Body::empty())
            .unwrap();

        let resp = router(state).oneshot(req).await.unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["access-control-allow-origin"], "*");
    }
}
