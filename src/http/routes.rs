//! HTTP route definitions

use std::time::Duration as StdDuration;

use axum::{
    extract::{Extension, Path, State},
    http::{header, Method, StatusCode},
    middleware,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::{
    compression::CompressionLayer, cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer,
};
use tracing::warn;
use uuid::Uuid;

use crate::app::AppState;
use crate::error::{EngineError, ErrorClass};
use crate::http::middleware::{require_auth, require_tick_token, AuthenticatedUser};
use crate::jobs::{JobKind, JobRequest, QueueState, ScheduledJob};
use crate::rally::{Movement, SendReceipt, TravelPreview};
use crate::scheduler::TickReport;
use crate::util::time::uptime_secs;
use crate::world::{AccountId, Mission, UnitStack, VillageId};

/// Lowercase form of the tick credential header, as `HeaderName` requires
const TICK_TOKEN_HEADER_LOWER: &str = "x-tick-token";

/// Build the application router
pub fn build_router(state: AppState) -> Router {
    // Operational routes (shared tick credential)
    let ops_routes = Router::new()
        .route("/tick", post(tick_handler))
        .layer(middleware::from_fn_with_state(state.clone(), require_tick_token));

    // Player routes (bearer token)
    let protected_routes = Router::new()
        .route("/movements", post(send_movement_handler))
        .route("/movements/preview", post(preview_handler))
        .route("/movements/:id", get(movement_handler))
        .route("/movements/:id/cancel", post(cancel_movement_handler))
        .route(
            "/villages/:id/queues/:kind",
            get(queue_handler).post(enqueue_handler),
        )
        .route("/jobs/:id/cancel", post(cancel_job_handler))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let mut router = Router::new()
        .route("/health", get(health_handler))
        .merge(ops_routes)
        .merge(protected_routes)
        .layer(CompressionLayer::new())
        .layer(TimeoutLayer::new(StdDuration::from_secs(30)))
        .layer(TraceLayer::new_for_http());

    // CORS only when client origins are configured (comma-separated in CLIENT_ORIGIN)
    if let Some(origins) = &state.config.client_origin {
        let allowed_origins: Vec<header::HeaderValue> = origins
            .split(',')
            .filter_map(|s| s.trim().parse::<header::HeaderValue>().ok())
            .collect();

        let cors = CorsLayer::new()
            .allow_origin(allowed_origins)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([
                header::AUTHORIZATION,
                header::CONTENT_TYPE,
                header::HeaderName::from_static(TICK_TOKEN_HEADER_LOWER),
            ]);
        router = router.layer(cors);
    }

    router.with_state(state)
}

// ============================================================================
// Health endpoint
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    store: &'static str,
    server_speed: f64,
    cached_distances: usize,
    last_tick: Option<TickReport>,
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: uptime_secs(),
        store: state.store.backend(),
        server_speed: state.game.globals.server_speed,
        cached_distances: state.distances.len(),
        last_tick: state.scheduler.last_report(),
    })
}

// ============================================================================
// Tick trigger
// ============================================================================

async fn tick_handler(State(state): State<AppState>) -> Result<Json<TickReport>, AppError> {
    let report = state.scheduler.tick().await?;
    Ok(Json(report))
}

// ============================================================================
// Movement endpoints
// ============================================================================

#[derive(Deserialize)]
struct SendMovementRequest {
    from_village_id: VillageId,
    to_village_id: VillageId,
    stacks: Vec<UnitStack>,
    mission: Mission,
}

fn check_rate(state: &AppState, account_id: AccountId) -> Result<(), AppError> {
    if state.limiter.check(account_id) {
        Ok(())
    } else {
        warn!(account_id = %account_id, "Action rate limited");
        Err(AppError::RateLimited)
    }
}

async fn send_movement_handler(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthenticatedUser>,
    Json(req): Json<SendMovementRequest>,
) -> Result<Json<SendReceipt>, AppError> {
    check_rate(&state, auth.account_id)?;
    let receipt = state
        .rally
        .send_movement(
            auth.account_id,
            req.from_village_id,
            req.to_village_id,
            &req.stacks,
            req.mission,
        )
        .await?;
    Ok(Json(receipt))
}

async fn preview_handler(
    State(state): State<AppState>,
    Json(req): Json<SendMovementRequest>,
) -> Result<Json<TravelPreview>, AppError> {
    let preview = state
        .rally
        .preview(req.from_village_id, req.to_village_id, &req.stacks, req.mission)
        .await?;
    Ok(Json(preview))
}

async fn movement_handler(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthenticatedUser>,
    Path(id): Path<Uuid>,
) -> Result<Json<Movement>, AppError> {
    let movement = state.rally.movement_for(id, auth.account_id).await?;
    Ok(Json(movement))
}

#[derive(Serialize)]
struct CancelResponse {
    cancelled: bool,
}

async fn cancel_movement_handler(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthenticatedUser>,
    Path(id): Path<Uuid>,
) -> Result<Json<CancelResponse>, AppError> {
    check_rate(&state, auth.account_id)?;
    let cancelled = state.rally.cancel_movement(id, auth.account_id).await?;
    Ok(Json(CancelResponse { cancelled }))
}

// ============================================================================
// Village queue endpoints
// ============================================================================

fn parse_kind(raw: &str) -> Result<JobKind, AppError> {
    raw.parse::<JobKind>().map_err(AppError::BadRequest)
}

async fn queue_handler(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthenticatedUser>,
    Path((village_id, kind)): Path<(VillageId, String)>,
) -> Result<Json<QueueState>, AppError> {
    let kind = parse_kind(&kind)?;
    let queue = state
        .queues
        .queue_state(auth.account_id, village_id, kind)
        .await?;
    Ok(Json(queue))
}

async fn enqueue_handler(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthenticatedUser>,
    Path((village_id, kind)): Path<(VillageId, String)>,
    Json(req): Json<JobRequest>,
) -> Result<Json<ScheduledJob>, AppError> {
    let kind = parse_kind(&kind)?;
    if req.kind() != kind {
        return Err(AppError::BadRequest(format!(
            "request does not belong in the {} queue",
            kind.as_str()
        )));
    }
    check_rate(&state, auth.account_id)?;
    let job = state.queues.enqueue(auth.account_id, village_id, req).await?;
    Ok(Json(job))
}

async fn cancel_job_handler(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthenticatedUser>,
    Path(id): Path<Uuid>,
) -> Result<Json<QueueState>, AppError> {
    check_rate(&state, auth.account_id)?;
    let queue = state.queues.cancel_job(id, auth.account_id).await?;
    Ok(Json(queue))
}

// ============================================================================
// Error handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Too many requests")]
    RateLimited,
}

impl AppError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "INVALID_INPUT"),
            AppError::RateLimited => (StatusCode::TOO_MANY_REQUESTS, "RATE_LIMITED"),
            AppError::Engine(e) => {
                let status = match (e, e.class()) {
                    (EngineError::NotFound(_), _) => StatusCode::NOT_FOUND,
                    (_, ErrorClass::Validation) => StatusCode::BAD_REQUEST,
                    (_, ErrorClass::Authorization) => StatusCode::FORBIDDEN,
                    (_, ErrorClass::Concurrency) => StatusCode::CONFLICT,
                    (_, ErrorClass::EffectApplication | ErrorClass::Internal) => {
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                (status, e.code())
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, code) = self.status_and_code();
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "Request failed");
            "Internal error".to_string()
        } else {
            self.to_string()
        };

        let body = serde_json::json!({
            "error": message,
            "code": code,
        });

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
    use hmac::{Hmac, Mac};
    use sha2::Sha256;
    use tower::ServiceExt;

    use crate::config::game::GameConfig;
    use crate::config::{Config, LogFormat};
    use crate::http::middleware::TICK_TOKEN_HEADER;
    use crate::rally::CancelPolicy;
    use crate::store::MemoryStore;
    use crate::util::time::ManualClock;
    use crate::world::{Coordinate, Garrison, Village};

    const JWT_SECRET: &str = "route-secret";
    const TICK_TOKEN: &str = "tick-secret";

    fn config() -> Config {
        Config {
            server_addr: ([127, 0, 0, 1], 0).into(),
            log_level: "info".into(),
            log_format: LogFormat::Pretty,
            jwt_secret: JWT_SECRET.into(),
            tick_token: TICK_TOKEN.into(),
            tick_interval_secs: 0,
            tick_concurrency: 4,
            claim_timeout_secs: 0,
            cancel_policy: CancelPolicy::default(),
            store: None,
            game_config_path: None,
            world_seed_path: None,
            action_rate_per_sec: 100,
            distance_cache_max: 0,
            client_origin: None,
        }
    }

    fn state(owner: AccountId) -> AppState {
        let store = Arc::new(MemoryStore::new());
        for (id, x) in [(1, 0), (2, 5)] {
            let mut garrison = Garrison::new();
            garrison.insert("warrior".into(), 20);
            store.insert_village(
                Village {
                    id,
                    owner_id: owner,
                    name: format!("V{}", id),
                    coord: Coordinate::new(x, 0),
                    fortification: 0,
                },
                garrison,
                BTreeMap::new(),
            );
        }
        AppState::new(
            config(),
            GameConfig::default(),
            store,
            Arc::new(ManualClock::at_epoch_secs(1_700_000_000)),
        )
    }

    fn bearer(account: AccountId) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD
            .encode(serde_json::json!({ "sub": account, "exp": u64::MAX / 2 }).to_string());
        let mut mac = Hmac::<Sha256>::new_from_slice(JWT_SECRET.as_bytes()).unwrap();
        mac.update(format!("{}.{}", header, payload).as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        format!("Bearer {}.{}.{}", header, payload, signature)
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_is_public() {
        let router = build_router(state(Uuid::new_v4()));
        let response = router
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["store"], "memory");
    }

    #[tokio::test]
    async fn tick_requires_the_shared_token() {
        let router = build_router(state(Uuid::new_v4()));

        let denied = router
            .clone()
            .oneshot(Request::post("/tick").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

        let ok = router
            .oneshot(
                Request::post("/tick")
                    .header(TICK_TOKEN_HEADER, TICK_TOKEN)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
        assert_eq!(json_body(ok).await["due"], 0);
    }

    #[tokio::test]
    async fn send_and_read_a_movement() {
        let owner = Uuid::new_v4();
        let router = build_router(state(owner));

        let send = serde_json::json!({
            "from_village_id": 1,
            "to_village_id": 2,
            "stacks": [{ "unit": "warrior", "count": 5 }],
            "mission": "support",
        });
        let response = router
            .clone()
            .oneshot(
                Request::post("/movements")
                    .header("Authorization", bearer(owner))
                    .header("Content-Type", "application/json")
                    .body(Body::from(send.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let receipt = json_body(response).await;
        let id = receipt["movement_id"].as_str().unwrap().to_string();

        let response = router
            .clone()
            .oneshot(
                Request::get(format!("/movements/{}", id))
                    .header("Authorization", bearer(owner))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "in_transit");

        let stranger = router
            .oneshot(
                Request::get(format!("/movements/{}", id))
                    .header("Authorization", bearer(Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(stranger.status(), StatusCode::FORBIDDEN);
        assert_eq!(json_body(stranger).await["code"], "UNAUTHORIZED");
    }

    #[tokio::test]
    async fn queue_kind_must_match_the_request() {
        let owner = Uuid::new_v4();
        let router = build_router(state(owner));
        let body = serde_json::json!({ "type": "build", "building": "barracks" });

        let response = router
            .oneshot(
                Request::post("/villages/1/queues/training")
                    .header("Authorization", bearer(owner))
                    .header("Content-Type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn engine_errors_map_to_statuses() {
        let cases = [
            (EngineError::CancelWindowExpired, StatusCode::BAD_REQUEST),
            (EngineError::Unauthorized, StatusCode::FORBIDDEN),
            (EngineError::AlreadyProcessing, StatusCode::CONFLICT),
            (EngineError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (EngineError::EffectFailed("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (error, status) in cases {
            assert_eq!(AppError::from(error).status_and_code().0, status);
        }
        assert_eq!(
            AppError::RateLimited.status_and_code().0,
            StatusCode::TOO_MANY_REQUESTS
        );
    }
}
