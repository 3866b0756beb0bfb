// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. Health is public; everything else
// requires the `AuthBearer` extractor. Handlers never touch the ledger
// directly for writes: opens and closes go through the engine queue and wait
// for its reply.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::auth::AuthBearer;
use crate::direction::{select_side, DirectionThreshold};
use crate::error::EngineError;
use crate::exit::monitor::{EngineHandle, OpenRequest};
use crate::exit::planner::PerformanceTier;
use crate::health::HealthStatus;
use crate::position_engine::Position;
use crate::trade_journal::TradeJournal;
use crate::types::Side;

/// Shared state behind every handler.
pub struct ApiState {
    pub engine: EngineHandle,
    pub direction: DirectionThreshold,
    pub journal: Option<TradeJournal>,
}

// =============================================================================
// Router construction
// =============================================================================

pub fn router(state: Arc<ApiState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Authenticated ───────────────────────────────────────────
        .route("/api/v1/positions", get(open_positions).post(open_position))
        .route("/api/v1/positions/closed", get(closed_positions))
        .route("/api/v1/positions/:symbol", get(position))
        .route("/api/v1/positions/:symbol/close", post(close_position))
        .route("/api/v1/signals", post(signal))
        .route("/api/v1/trade-journal", get(trade_journal))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Errors
// =============================================================================

pub struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::PositionNotFound(_) | EngineError::UnknownOrder(_) => StatusCode::NOT_FOUND,
            EngineError::PositionAlreadyOpen(_)
            | EngineError::StaleEvent { .. }
            | EngineError::InvalidStageTransition { .. } => StatusCode::CONFLICT,
            EngineError::InvalidRiskParameter(_)
            | EngineError::InvalidExitPlan(_)
            | EngineError::SizeUnderflow { .. } => StatusCode::BAD_REQUEST,
            EngineError::Gateway { .. }
            | EngineError::GatewayTimeout { .. }
            | EngineError::Unprotected { .. } => StatusCode::BAD_GATEWAY,
            EngineError::EngineStopped => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::InvariantViolation { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = serde_json::json!({ "error": self.0.to_string() });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

fn normalize(symbol: &str) -> String {
    symbol.trim().to_uppercase()
}

// =============================================================================
// Health (public)
// =============================================================================

async fn health(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let snapshot = state.engine.health();
    let status = match snapshot.status {
        HealthStatus::Critical => StatusCode::SERVICE_UNAVAILABLE,
        HealthStatus::Ok | HealthStatus::Degraded => StatusCode::OK,
    };
    (status, Json(snapshot))
}

// =============================================================================
// Positions (authenticated)
// =============================================================================

async fn open_positions(_auth: AuthBearer, State(state): State<Arc<ApiState>>) -> Json<Vec<Position>> {
    Json(state.engine.list_open_positions())
}

async fn closed_positions(_auth: AuthBearer, State(state): State<Arc<ApiState>>) -> Json<Vec<Position>> {
    Json(state.engine.list_closed_positions())
}

async fn position(
    _auth: AuthBearer,
    State(state): State<Arc<ApiState>>,
    Path(symbol): Path<String>,
) -> ApiResult<Position> {
    let symbol = normalize(&symbol);
    state
        .engine
        .get_position(&symbol)
        .map(Json)
        .ok_or_else(|| EngineError::PositionNotFound(symbol).into())
}

async fn open_position(
    _auth: AuthBearer,
    State(state): State<Arc<ApiState>>,
    Json(mut request): Json<OpenRequest>,
) -> ApiResult<Position> {
    request.symbol = normalize(&request.symbol);
    info!(symbol = %request.symbol, side = %request.side, "open requested via API");
    Ok(Json(state.engine.open(request).await?))
}

#[derive(Debug, Default, Deserialize)]
struct CloseBody {
    #[serde(default)]
    price: Option<f64>,
}

async fn close_position(
    _auth: AuthBearer,
    State(state): State<Arc<ApiState>>,
    Path(symbol): Path<String>,
    body: Option<Json<CloseBody>>,
) -> ApiResult<Position> {
    let symbol = normalize(&symbol);
    let price = body.and_then(|Json(b)| b.price);
    warn!(symbol = %symbol, price = ?price, "manual close requested via API");
    Ok(Json(state.engine.close(&symbol, price).await?))
}

// =============================================================================
// Signals (authenticated)
// =============================================================================

#[derive(Debug, Deserialize)]
struct SignalRequest {
    symbol: String,
    /// Positive favours LONG, negative favours SHORT.
    score: f64,
    entry_price: f64,
    size: f64,
    #[serde(default)]
    leverage: Option<u32>,
    #[serde(default)]
    tier: Option<PerformanceTier>,
    #[serde(default)]
    atr: Option<f64>,
}

#[derive(Debug, Serialize)]
struct SignalResponse {
    side: Option<Side>,
    position: Option<Position>,
}

async fn signal(
    _auth: AuthBearer,
    State(state): State<Arc<ApiState>>,
    Json(req): Json<SignalRequest>,
) -> ApiResult<SignalResponse> {
    let symbol = normalize(&req.symbol);
    let Some(side) = select_side(req.score, &state.direction) else {
        info!(symbol = %symbol, score = req.score, "signal below entry threshold");
        return Ok(Json(SignalResponse {
            side: None,
            position: None,
        }));
    };

    info!(symbol = %symbol, score = req.score, side = %side, "signal accepted");
    let position = state
        .engine
        .open(OpenRequest {
            symbol,
            side,
            entry_price: req.entry_price,
            size: req.size,
            leverage: req.leverage,
            tier: req.tier,
            atr: req.atr,
        })
        .await?;
    Ok(Json(SignalResponse {
        side: Some(side),
        position: Some(position),
    }))
}

// =============================================================================
// Trade Journal (authenticated)
// =============================================================================

async fn trade_journal(_auth: AuthBearer, State(state): State<Arc<ApiState>>) -> Response {
    let Some(journal) = &state.journal else {
        return Json(serde_json::json!([])).into_response();
    };
    if !journal.path().exists() {
        return Json(serde_json::json!([])).into_response();
    }
    match journal.read_all() {
        Ok(records) => Json(records).into_response(),
        Err(e) => {
            warn!(error = %e, "failed to read trade journal");
            let body = serde_json::json!({ "error": format!("{e:#}") });
            (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::api::auth::ADMIN_TOKEN_VAR;
    use crate::exit::monitor::LifecycleEngine;
    use crate::gateway::PaperGateway;
    use crate::runtime_config::RuntimeConfig;

    const TOKEN: &str = "test-admin-token";

    fn app() -> (Router, EngineHandle) {
        std::env::set_var(ADMIN_TOKEN_VAR, TOKEN);
        let config = RuntimeConfig {
            trade_log_path: None,
            ..RuntimeConfig::default()
        };
        let engine = LifecycleEngine::new(config, Arc::new(PaperGateway::new())).spawn();
        let state = Arc::new(ApiState {
            engine: engine.clone(),
            direction: DirectionThreshold::default(),
            journal: None,
        });
        (router(state), engine)
    }

    fn request(method: &str, uri: &str, body: Option<serde_json::Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("authorization", format!("Bearer {TOKEN}"));
        match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn json_body(resp: Response) -> serde_json::Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_is_public_and_positions_are_not() {
        let (app, _engine) = app();

        let resp = app
            .clone()
            .oneshot(Request::get("/api/v1/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["status"], "ok");

        let resp = app
            .oneshot(Request::get("/api/v1/positions").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn open_query_and_close_through_the_api() {
        let (app, _engine) = app();

        let open = serde_json::json!({
            "symbol": "btcusdt",
            "side": "LONG",
            "entry_price": 100000.0,
            "size": 1.0,
            "leverage": 25
        });
        let resp = app.clone().oneshot(request("POST", "/api/v1/positions", Some(open.clone()))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["symbol"], "BTCUSDT");
        assert_eq!(body["stage"], "OPENED");
        assert!((body["stop_loss_price"].as_f64().unwrap() - 98_000.0).abs() < 1e-6);

        let resp = app.clone().oneshot(request("POST", "/api/v1/positions", Some(open))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = app.clone().oneshot(request("GET", "/api/v1/positions/BTCUSDT", None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let close = serde_json::json!({ "price": 99_000.0 });
        let resp = app
            .clone()
            .oneshot(request("POST", "/api/v1/positions/BTCUSDT/close", Some(close)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["stage"], "CLOSED");
        assert_eq!(body["close_reason"], "Manual");

        let resp = app.clone().oneshot(request("GET", "/api/v1/positions/closed", None)).await.unwrap();
        assert_eq!(json_body(resp).await.as_array().unwrap().len(), 1);

        let resp = app.oneshot(request("GET", "/api/v1/positions/ETHUSDT", None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn signals_pick_a_side_symmetrically() {
        let (app, _engine) = app();

        let weak = serde_json::json!({
            "symbol": "ETHUSDT", "score": -0.3, "entry_price": 3000.0, "size": 1.0
        });
        let resp = app.clone().oneshot(request("POST", "/api/v1/signals", Some(weak))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert!(body["side"].is_null());
        assert!(body["position"].is_null());

        let strong = serde_json::json!({
            "symbol": "ETHUSDT", "score": -0.8, "entry_price": 3000.0, "size": 1.0
        });
        let resp = app.oneshot(request("POST", "/api/v1/signals", Some(strong))).await.unwrap();
        let body = json_body(resp).await;
        assert_eq!(body["side"], "SHORT");
        assert_eq!(body["position"]["side"], "SHORT");
        assert!(body["position"]["stop_loss_price"].as_f64().unwrap() > 3000.0);
    }

    #[tokio::test]
    async fn invalid_open_is_a_bad_request() {
        let (app, engine) = app();
        let open = serde_json::json!({
            "symbol": "SOLUSDT", "side": "LONG", "entry_price": 150.0, "size": 1.0, "leverage": 0
        });
        let resp = app.oneshot(request("POST", "/api/v1/positions", Some(open))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(engine.get_position("SOLUSDT").is_none());
    }
}
