use crate::errors::Error;
use crate::gateway::submit_heartbeat;
use crate::model::{
    FailedJob, Heartbeat, HeartbeatFilter, HeartbeatPayload, Metric, Notification,
    NotificationRule, RuleInput,
};
use crate::queue::{JobQueue, QUEUE_NAME};
use crate::realtime::ChannelRegistry;
use crate::repo::{NotificationRepository, RuleRepository};
use crate::service::HeartbeatService;
use crate::ws::ws_handler;
use axum::{
    async_trait,
    extract::{rejection::JsonRejection, FromRef, FromRequestParts, Path, Query, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::error;
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub service: HeartbeatService,
    pub rules: Arc<dyn RuleRepository>,
    pub notifications: Arc<dyn NotificationRepository>,
    pub queue: Arc<dyn JobQueue>,
    pub registry: Arc<ChannelRegistry>,
}

impl FromRef<AppState> for Arc<ChannelRegistry> {
    fn from_ref(state: &AppState) -> Self {
        state.registry.clone()
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/healthcheck", get(|| async { "Server is alive!" }))
        .route("/ws", get(ws_handler))
        .route("/api/v1/heartbeats", post(create_heartbeat))
        .route("/api/v1/heartbeats/:device_sn", get(get_device_heartbeats))
        .route(
            "/api/v1/heartbeats/:device_sn/latest",
            get(get_latest_heartbeat),
        )
        .route("/api/v1/notifications", get(get_user_notifications))
        .route(
            "/api/v1/notifications/rules",
            get(list_rules).post(create_rule),
        )
        .route(
            "/api/v1/notifications/rules/:id",
            put(update_rule).delete(delete_rule),
        )
        .route("/api/v1/queue/failed", get(list_failed_jobs))
        .with_state(state)
}

/// Caller identity, forwarded by the auth layer in front of this service.
pub struct OwnerId(pub Uuid);

pub const USER_ID_HEADER: &str = "x-user-id";

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for OwnerId {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| Uuid::parse_str(v.trim()).ok())
            .map(OwnerId)
            .ok_or_else(|| AppError::new(StatusCode::UNAUTHORIZED, "missing or invalid user id"))
    }
}

#[derive(Debug, Serialize)]
struct QueuedResponse {
    message: &'static str,
    queue: &'static str,
    job_id: Uuid,
}

async fn create_heartbeat(
    State(state): State<AppState>,
    payload: Result<Json<HeartbeatPayload>, JsonRejection>,
) -> Result<(StatusCode, Json<QueuedResponse>), AppError> {
    let Json(payload) = payload?;
    let job_id = submit_heartbeat(state.queue.as_ref(), &payload).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(QueuedResponse {
            message: "Heartbeat received and queued for processing",
            queue: QUEUE_NAME,
            job_id,
        }),
    ))
}

#[derive(Debug, Serialize)]
struct MetricPoint {
    received_at: DateTime<Utc>,
    value: f64,
}

async fn get_device_heartbeats(
    State(state): State<AppState>,
    Path(device_sn): Path<String>,
    Query(filter): Query<HeartbeatFilter>,
) -> Result<Json<serde_json::Value>, AppError> {
    let metric = match filter.metric.as_deref() {
        Some(name) => Some(
            name.parse::<Metric>()
                .map_err(|e| AppError::new(StatusCode::BAD_REQUEST, e))?,
        ),
        None => None,
    };

    let heartbeats: Vec<Heartbeat> = state.service.get_heartbeats(&device_sn, &filter).await?;

    let body = match metric {
        Some(m) => {
            let points: Vec<MetricPoint> = heartbeats
                .iter()
                .map(|h| MetricPoint {
                    received_at: h.received_at,
                    value: h.metric(m),
                })
                .collect();
            json!({ "device_sn": device_sn, "metric": filter.metric, "points": points })
        }
        None => json!({ "device_sn": device_sn, "heartbeats": heartbeats }),
    };
    Ok(Json(body))
}

async fn get_latest_heartbeat(
    State(state): State<AppState>,
    Path(device_sn): Path<String>,
) -> Result<Json<Heartbeat>, AppError> {
    state
        .service
        .get_latest_heartbeat(&device_sn)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::new(StatusCode::NOT_FOUND, "No heartbeat found for this device"))
}

async fn get_user_notifications(
    State(state): State<AppState>,
    OwnerId(user_id): OwnerId,
) -> Result<Json<Vec<Notification>>, AppError> {
    Ok(Json(state.notifications.list_by_user(user_id).await?))
}

async fn list_rules(
    State(state): State<AppState>,
    OwnerId(user_id): OwnerId,
) -> Result<Json<Vec<NotificationRule>>, AppError> {
    Ok(Json(state.rules.list_by_user(user_id).await?))
}

fn check_rule_input(input: &RuleInput) -> Result<(), AppError> {
    input
        .condition
        .check()
        .map_err(|e| AppError::new(StatusCode::BAD_REQUEST, e))?;
    if matches!(&input.device_sn, Some(sn) if sn.trim().is_empty()) {
        return Err(AppError::new(
            StatusCode::BAD_REQUEST,
            "device_sn must be omitted or non-empty",
        ));
    }
    Ok(())
}

async fn create_rule(
    State(state): State<AppState>,
    OwnerId(user_id): OwnerId,
    input: Result<Json<RuleInput>, JsonRejection>,
) -> Result<(StatusCode, Json<NotificationRule>), AppError> {
    let Json(input) = input?;
    check_rule_input(&input)?;
    let rule = state.rules.create(user_id, &input).await?;
    Ok((StatusCode::CREATED, Json(rule)))
}

async fn update_rule(
    State(state): State<AppState>,
    OwnerId(user_id): OwnerId,
    Path(rule_id): Path<Uuid>,
    input: Result<Json<RuleInput>, JsonRejection>,
) -> Result<Json<NotificationRule>, AppError> {
    let Json(input) = input?;
    check_rule_input(&input)?;
    state
        .rules
        .update(user_id, rule_id, &input)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::new(StatusCode::NOT_FOUND, "Rule not found"))
}

async fn delete_rule(
    State(state): State<AppState>,
    OwnerId(user_id): OwnerId,
    Path(rule_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    if state.rules.delete(user_id, rule_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::new(StatusCode::NOT_FOUND, "Rule not found"))
    }
}

#[derive(Debug, Deserialize)]
struct FailedQuery {
    limit: Option<i64>,
}

async fn list_failed_jobs(
    State(state): State<AppState>,
    Query(params): Query<FailedQuery>,
) -> Result<Json<Vec<FailedJob>>, AppError> {
    let limit = params.limit.unwrap_or(100).clamp(1, 1000);
    Ok(Json(state.queue.failed(limit).await?))
}

pub struct AppError {
    status: StatusCode,
    error: anyhow::Error,
}

impl AppError {
    fn new(status: StatusCode, message: impl std::fmt::Display) -> Self {
        Self {
            status,
            error: anyhow::anyhow!("{}", message),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!("API error: {:#}", self.error);
        }
        (
            self.status,
            Json(json!({ "error": self.error.to_string() })),
        )
            .into_response()
    }
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            error: err.into(),
        }
    }
}

// Malformed bodies, missing fields and unparseable dates are validation
// failures like any other.
impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::new(StatusCode::BAD_REQUEST, rejection.body_text())
    }
}
