use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use chrono::{NaiveDate, Utc};
use serde::Deserialize;
use serde_json::json;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::config::OperationMode;
use crate::db::Db;
use crate::error::SteeringError;
use crate::mqtt::OverrideRequest;
use crate::orchestrator::Orchestrator;
use crate::state::SharedState;

#[derive(Clone)]
pub struct AppState {
    pub shared: SharedState,
    pub orchestrator: Arc<Orchestrator>,
    pub db: Db,
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct DailyQuery {
    /// Local `YYYY-MM-DD`; defaults to today.
    day: Option<NaiveDate>,
}

#[derive(Debug, Deserialize)]
struct ModeBody {
    mode: String,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/zones/{zone_id}/override", post(api_override))
        .route("/api/mode", post(api_mode))
        .route("/api/zones/{zone_id}/shots", get(api_zone_shots))
        .route("/api/zones/{zone_id}/transitions", get(api_zone_transitions))
        .route("/api/daily", get(api_daily))
        .with_state(state)
}

async fn api_status(State(state): State<AppState>) -> impl IntoResponse {
    let st = state.shared.read().await;
    Json(st.to_status())
}

async fn api_override(
    State(state): State<AppState>,
    Path(zone_id): Path<String>,
    Json(req): Json<OverrideRequest>,
) -> Response {
    let target = match req.target() {
        Ok(t) => t,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, msg),
    };
    match state
        .orchestrator
        .manual_override(&zone_id, target, req.reason(), req.forced, Utc::now())
        .await
    {
        Ok(change) => {
            info!(zone = %zone_id, to = %change.to, "web: override applied");
            Json(change).into_response()
        }
        Err(e) => {
            let status = match e {
                SteeringError::UnknownZone(_) => StatusCode::NOT_FOUND,
                SteeringError::TransitionRejected { .. } => StatusCode::CONFLICT,
                SteeringError::IrrigationInProgress => StatusCode::CONFLICT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            error_response(status, e.to_string())
        }
    }
}

async fn api_mode(State(state): State<AppState>, Json(body): Json<ModeBody>) -> Response {
    let mode: OperationMode = match body.mode.parse() {
        Ok(m) => m,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, msg),
    };
    state.orchestrator.set_mode(mode).await;
    let mut st = state.shared.write().await;
    st.mode = mode;
    st.record_system(format!("mode set to {mode} via api"));
    Json(json!({ "mode": mode })).into_response()
}

async fn api_zone_shots(
    State(state): State<AppState>,
    Path(zone_id): Path<String>,
    Query(q): Query<HistoryQuery>,
) -> Response {
    let limit = q.limit.unwrap_or(50).clamp(1, 500);
    match state.db.recent_irrigation_events(&zone_id, limit).await {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}")),
    }
}

async fn api_zone_transitions(
    State(state): State<AppState>,
    Path(zone_id): Path<String>,
    Query(q): Query<HistoryQuery>,
) -> Response {
    let limit = q.limit.unwrap_or(50).clamp(1, 500);
    match state.db.recent_phase_transitions(&zone_id, limit).await {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}")),
    }
}

async fn api_daily(State(state): State<AppState>, Query(q): Query<DailyQuery>) -> Response {
    let day = q
        .day
        .unwrap_or_else(|| state.orchestrator.lights().local_date(Utc::now()));
    match state.db.daily_totals(day).await {
        Ok(rows) => Json(json!({ "day": day, "zones": rows })).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}")),
    }
}

fn error_response(status: StatusCode, msg: String) -> Response {
    (status, Json(json!({ "error": msg }))).into_response()
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState) {
    let port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(%addr, "web: failed to bind: {e}");
            return;
        }
    };

    info!(%addr, "web: status api listening");

    if let Err(e) = axum::serve(listener, router(state)).await {
        error!("web: server error: {e}");
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::valid_config;
    use crate::hardware::SwitchBoard;
    use crate::state::SystemState;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tokio::sync::Mutex;
    use tower::ServiceExt;

    async fn app() -> (Router, AppState) {
        let cfg = valid_config();
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let layout = SwitchBoard::layout(5, 6, 13, [("z1".to_string(), 17)]);
        let board = Arc::new(Mutex::new(SwitchBoard::new(&layout, true).unwrap()));
        let (tx, _rx) = crate::events::channel();
        let orchestrator = Orchestrator::new(&cfg, board, tx, None, None, Utc::now()).unwrap();
        let state = AppState {
            shared: SystemState::shared(cfg.system.mode),
            orchestrator: Arc::new(orchestrator),
            db,
        };
        (router(state.clone()), state)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(resp: Response) -> Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    // -- Status -------------------------------------------------------------

    #[tokio::test]
    async fn status_reports_mode_and_events() {
        let (app, state) = app().await;
        state.shared.write().await.record_system("hub started".into());

        let resp = app
            .oneshot(Request::builder().uri("/api/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["mode"], "auto");
        assert_eq!(body["mqtt_connected"], false);
        assert_eq!(body["events"][0]["detail"], "hub started");
    }

    // -- Mode ---------------------------------------------------------------

    #[tokio::test]
    async fn mode_change_reaches_orchestrator() {
        let (app, state) = app().await;
        let resp = app
            .clone()
            .oneshot(post_json("/api/mode", json!({ "mode": "MONITOR" })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(state.orchestrator.mode().await, OperationMode::Monitor);
        assert_eq!(state.shared.read().await.mode, OperationMode::Monitor);

        let resp = app
            .oneshot(post_json("/api/mode", json!({ "mode": "sideways" })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    // -- Override -----------------------------------------------------------

    #[tokio::test]
    async fn override_status_codes() {
        let (app, _state) = app().await;

        let resp = app
            .clone()
            .oneshot(post_json("/api/zones/nope/override", json!({})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = app
            .clone()
            .oneshot(post_json("/api/zones/z1/override", json!({ "target_phase": "P9" })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        // P0 can never be entered by an unforced override
        let resp = app
            .clone()
            .oneshot(post_json("/api/zones/z1/override", json!({ "target_phase": "P0" })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = app
            .oneshot(post_json(
                "/api/zones/z1/override",
                json!({ "target_phase": "P0", "reason": "restart cycle", "forced": true }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["to"], "P0");
        assert_eq!(body["forced"], true);
        assert_eq!(body["event"], "manual_override");
    }

    // -- History ------------------------------------------------------------

    #[tokio::test]
    async fn history_routes_read_the_event_log() {
        use crate::events::{IrrigationEvent, ShotResult};
        use crate::phase::{Phase, ShotKind};
        use chrono::TimeZone;

        let (app, state) = app().await;
        let start = Utc.with_ymd_and_hms(2024, 6, 5, 9, 0, 0).unwrap();
        let shot = IrrigationEvent {
            zone_id: "z1".into(),
            phase: Phase::P2Maintenance,
            kind: ShotKind::Maintenance,
            start,
            end: start + chrono::Duration::seconds(36),
            duration_s: 36.0,
            volume_l: 0.2,
            size_pct: 2.0,
            pre_vwc: Some(55.0),
            post_vwc: Some(58.0),
            efficiency: Some(15.0),
            result: ShotResult::Completed,
            reason: "vwc below threshold".into(),
        };
        let day = NaiveDate::from_ymd_opt(2024, 6, 5).unwrap();
        state.db.insert_irrigation_event(&shot, day).await.unwrap();

        let resp = app
            .clone()
            .oneshot(Request::builder().uri("/api/zones/z1/shots?limit=5").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["shot_kind"], "maintenance");

        let resp = app
            .oneshot(Request::builder().uri("/api/daily?day=2024-06-05").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = json_body(resp).await;
        assert_eq!(body["day"], "2024-06-05");
        assert_eq!(body["zones"][0]["shots"], 1);
    }
}
