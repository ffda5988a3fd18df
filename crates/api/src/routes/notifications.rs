//! Notification intake routes: immediate and scheduled, single and bulk.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};

use courier_common::error::AppError;
use courier_dispatch::producer::{BulkItemOutcome, ScheduleRequest, SendRequest};

use crate::routes::messages::MessageResponse;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/notifications", post(send_notification))
        .route("/notifications/bulk", post(send_notifications_bulk))
        .route("/notifications/schedule", post(schedule_notification))
        .route(
            "/notifications/schedule/bulk",
            post(schedule_notifications_bulk),
        )
}

/// POST /notifications — Accept a message for immediate delivery.
///
/// Returns 202: acceptance means the message is durably persisted, not
/// that it was delivered. The response carries the post-publish state,
/// FAILED included.
async fn send_notification(
    State(state): State<AppState>,
    Json(request): Json<SendRequest>,
) -> Result<(StatusCode, Json<MessageResponse>), AppError> {
    let message = state.producer.send(request).await?;
    Ok((StatusCode::ACCEPTED, Json(message.into())))
}

/// POST /notifications/bulk — Accept a batch; items fail independently.
async fn send_notifications_bulk(
    State(state): State<AppState>,
    Json(requests): Json<Vec<SendRequest>>,
) -> Result<(StatusCode, Json<Vec<BulkItemOutcome>>), AppError> {
    if requests.is_empty() {
        return Err(AppError::Validation("request list must not be empty".into()));
    }
    let outcomes = state.producer.send_bulk(requests).await;
    Ok((StatusCode::ACCEPTED, Json(outcomes)))
}

/// POST /notifications/schedule — Accept a message for future delivery.
async fn schedule_notification(
    State(state): State<AppState>,
    Json(request): Json<ScheduleRequest>,
) -> Result<(StatusCode, Json<MessageResponse>), AppError> {
    let message = state.producer.schedule(request).await?;
    Ok((StatusCode::ACCEPTED, Json(message.into())))
}

/// POST /notifications/schedule/bulk — Schedule a batch.
async fn schedule_notifications_bulk(
    State(state): State<AppState>,
    Json(requests): Json<Vec<ScheduleRequest>>,
) -> Result<(StatusCode, Json<Vec<BulkItemOutcome>>), AppError> {
    if requests.is_empty() {
        return Err(AppError::Validation("request list must not be empty".into()));
    }
    let outcomes = state.producer.schedule_bulk(requests).await;
    Ok((StatusCode::ACCEPTED, Json(outcomes)))
}
