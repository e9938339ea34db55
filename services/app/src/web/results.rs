//! services/app/src/web/results.rs
//!
//! Handlers for result views. A view is opened with the navigation state of
//! a submitted assessment, loads itself in the background, and is polled by
//! the client until `ready` turns true.

use crate::web::protocol::{ChatBody, ChatResponse, OpenResultRequest, ResultSnapshot};
use crate::web::state::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use std::sync::Arc;
use tracing::error;
use triage_core::report::Report;
use triage_core::{ChatOutcome, NavigationState, Prediction};
use uuid::Uuid;

fn not_found(view_id: Uuid) -> (StatusCode, String) {
    (StatusCode::NOT_FOUND, format!("Result view {} not found", view_id))
}

/// POST /result - Open a result view
#[utoipa::path(
    post,
    path = "/result",
    request_body = OpenResultRequest,
    responses(
        (status = 201, description = "View opened; loading continues in the background", body = ResultSnapshot),
        (status = 400, description = "Malformed prediction or report")
    )
)]
pub async fn open_result_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<OpenResultRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let prediction_full = req
        .prediction_full
        .map(serde_json::from_value::<Prediction>)
        .transpose()
        .map_err(|e| {
            error!("Invalid predictionFull: {:?}", e);
            (StatusCode::BAD_REQUEST, format!("Invalid predictionFull: {}", e))
        })?;
    let report_full = req
        .report_full
        .map(Report::from_response)
        .transpose()
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("Invalid reportFull: {}", e)))?;

    let (view_id, view) = state.open_result(NavigationState {
        assessment_id: req.assessment_id,
        prediction_full,
        report_full,
    });
    Ok((
        StatusCode::CREATED,
        Json(ResultSnapshot::new(view_id, view.snapshot())),
    ))
}

/// GET /result/{id} - Current state of a result view
#[utoipa::path(
    get,
    path = "/result/{id}",
    params(("id" = Uuid, Path, description = "The view id returned when it was opened.")),
    responses(
        (status = 200, description = "View snapshot", body = ResultSnapshot),
        (status = 404, description = "No such view")
    )
)]
pub async fn get_result_handler(
    State(state): State<Arc<AppState>>,
    Path(view_id): Path<Uuid>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let view = state.results.get(&view_id).ok_or_else(|| not_found(view_id))?;
    Ok(Json(ResultSnapshot::new(view_id, view.snapshot())))
}

/// POST /result/{id}/chat - Ask a follow-up question about the result
#[utoipa::path(
    post,
    path = "/result/{id}/chat",
    request_body = ChatBody,
    params(("id" = Uuid, Path, description = "The view id returned when it was opened.")),
    responses(
        (status = 200, description = "Answer appended", body = ChatResponse),
        (status = 409, description = "A previous message is still pending", body = ChatResponse),
        (status = 422, description = "Blank message", body = ChatResponse),
        (status = 502, description = "Chat call failed; the question stays in the transcript", body = ChatResponse),
        (status = 404, description = "No such view")
    )
)]
pub async fn chat_handler(
    State(state): State<Arc<AppState>>,
    Path(view_id): Path<Uuid>,
    Json(body): Json<ChatBody>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let view = state.results.get(&view_id).ok_or_else(|| not_found(view_id))?;

    let (status, outcome) = match view.send_chat(&body.message).await {
        ChatOutcome::Answered => (StatusCode::OK, "answered"),
        ChatOutcome::Failed => (StatusCode::BAD_GATEWAY, "failed"),
        ChatOutcome::Ignored => (StatusCode::UNPROCESSABLE_ENTITY, "ignored"),
        ChatOutcome::Busy => (StatusCode::CONFLICT, "busy"),
    };
    Ok((
        status,
        Json(ChatResponse {
            outcome: outcome.to_string(),
            snapshot: ResultSnapshot::new(view_id, view.snapshot()),
        }),
    ))
}

/// DELETE /result/{id} - Close a result view, aborting any loading
#[utoipa::path(
    delete,
    path = "/result/{id}",
    params(("id" = Uuid, Path, description = "The view id returned when it was opened.")),
    responses(
        (status = 204, description = "View closed"),
        (status = 404, description = "No such view")
    )
)]
pub async fn close_result_handler(
    State(state): State<Arc<AppState>>,
    Path(view_id): Path<Uuid>,
) -> Result<StatusCode, (StatusCode, String)> {
    if state.results.close(&view_id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found(view_id))
    }
}
