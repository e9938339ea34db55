//! services/app/src/web/intake.rs
//!
//! Handlers for the intake form and the X-ray upload of a submitted
//! assessment. All routes here sit behind the session guard.

use crate::web::protocol::{
    FormOptionsResponse, IntakeResponse, SubmitErrorResponse, SubmitResponse, UploadResponse,
};
use crate::web::state::AppState;
use axum::{
    extract::{Multipart, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};
use std::sync::Arc;
use tracing::error;
use triage_core::{
    attach_xray, FieldInput, PortError, SubmitError, UploadError, User, XrayUpload,
};
use uuid::Uuid;

/// GET /assessment - The intake form as currently filled
#[utoipa::path(
    get,
    path = "/assessment",
    responses(
        (status = 200, description = "Current form", body = IntakeResponse),
        (status = 303, description = "Not signed in; continue at /login"),
        (status = 503, description = "Session still loading")
    )
)]
pub async fn get_form_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let machine = state.intake.lock().await;
    Json(IntakeResponse::from(&*machine))
}

/// GET /assessment/options - The form's checkbox groups
#[utoipa::path(
    get,
    path = "/assessment/options",
    responses(
        (status = 200, description = "Symptoms, conditions and exposure risks", body = FormOptionsResponse)
    )
)]
pub async fn form_options_handler() -> impl IntoResponse {
    Json(FormOptionsResponse::new())
}

/// PATCH /assessment - Apply field edits in order
///
/// Name and digit fields are sanitised as they are applied, and each edit
/// clears the error of the field it touches.
#[utoipa::path(
    patch,
    path = "/assessment",
    request_body(
        content = Vec<serde_json::Value>,
        description = "Edits such as `{\"field\": \"fullName\", \"value\": \"Ana Reyes\"}` or `{\"field\": \"symptom\", \"value\": {\"key\": \"cough\", \"checked\": true}}`."
    ),
    responses(
        (status = 200, description = "Updated form", body = IntakeResponse),
        (status = 422, description = "Malformed edit")
    )
)]
pub async fn apply_inputs_handler(
    State(state): State<Arc<AppState>>,
    Json(inputs): Json<Vec<FieldInput>>,
) -> impl IntoResponse {
    let mut machine = state.intake.lock().await;
    for input in inputs {
        machine.apply(input);
    }
    Json(IntakeResponse::from(&*machine))
}

/// POST /assessment - Validate and submit the form
#[utoipa::path(
    post,
    path = "/assessment",
    responses(
        (status = 201, description = "Assessment submitted", body = SubmitResponse),
        (status = 401, description = "Not signed in"),
        (status = 422, description = "Validation failed", body = SubmitErrorResponse),
        (status = 502, description = "The document store rejected a write")
    )
)]
pub async fn submit_handler(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
) -> Response {
    let mut machine = state.intake.lock().await;
    let result = machine.submit(state.store.as_ref(), Some(&user)).await;
    match result {
        Ok(assessment_id) => (
            StatusCode::CREATED,
            Json(SubmitResponse {
                assessment_id,
                message: "Assessment submitted.".to_string(),
            }),
        )
            .into_response(),
        Err(e) => {
            let status = match &e {
                SubmitError::Invalid(_) => StatusCode::UNPROCESSABLE_ENTITY,
                SubmitError::NotSignedIn => StatusCode::UNAUTHORIZED,
                SubmitError::Store(source) => {
                    error!("Failed to submit assessment: {:?}", source);
                    StatusCode::BAD_GATEWAY
                }
            };
            let body = SubmitErrorResponse {
                message: e.to_string(),
                errors: serde_json::to_value(machine.errors()).unwrap_or_default(),
            };
            (status, Json(body)).into_response()
        }
    }
}

/// DELETE /assessment - Discard the form
#[utoipa::path(
    delete,
    path = "/assessment",
    responses(
        (status = 200, description = "Empty form", body = IntakeResponse)
    )
)]
pub async fn reset_form_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut machine = state.intake.lock().await;
    machine.reset();
    Json(IntakeResponse::from(&*machine))
}

/// POST /assessment/{id}/xray - Upload a chest X-ray for inference
///
/// Accepts a multipart/form-data request with a `file` part (JPG, PNG or
/// DICOM). The response is the navigation state for `/result`.
#[utoipa::path(
    post,
    path = "/assessment/{id}/xray",
    request_body(content_type = "multipart/form-data", description = "The X-ray image in a `file` part."),
    params(
        ("id" = Uuid, Path, description = "The assessment the image belongs to.")
    ),
    responses(
        (status = 201, description = "Prediction recorded", body = UploadResponse),
        (status = 400, description = "Missing or empty file"),
        (status = 413, description = "File too large"),
        (status = 404, description = "No such assessment"),
        (status = 415, description = "Unsupported file type"),
        (status = 502, description = "Inference backend or store failed")
    )
)]
pub async fn upload_xray_handler(
    State(state): State<Arc<AppState>>,
    Path(assessment_id): Path<Uuid>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let mut upload = None;
    while let Some(field) = multipart.next_field().await.map_err(|e| {
        error!("Failed to read multipart field: {:?}", e);
        (StatusCode::BAD_REQUEST, "Invalid multipart body".to_string())
    })? {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field.file_name().unwrap_or("xray").to_string();
        let content_type = field.content_type().map(str::to_string);
        let bytes = field.bytes().await.map_err(|e| {
            error!("Failed to read file bytes: {:?}", e);
            (StatusCode::BAD_REQUEST, "Failed to read file".to_string())
        })?;
        upload = Some(XrayUpload {
            file_name,
            content_type,
            bytes,
        });
        break;
    }
    let upload = upload.ok_or((StatusCode::BAD_REQUEST, "No file uploaded".to_string()))?;

    let prediction = attach_xray(
        state.store.as_ref(),
        state.backend.as_ref(),
        assessment_id,
        &upload,
        state.config.max_upload_bytes,
    )
    .await
    .map_err(|e| {
        let status = match &e {
            UploadError::Empty => StatusCode::BAD_REQUEST,
            UploadError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            UploadError::UnsupportedType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            UploadError::UnknownAssessment(_) | UploadError::Port(PortError::NotFound(_)) => {
                StatusCode::NOT_FOUND
            }
            UploadError::Port(port) => {
                error!("X-ray upload for {} failed: {:?}", assessment_id, port);
                StatusCode::BAD_GATEWAY
            }
        };
        (status, e.to_string())
    })?;

    Ok((
        StatusCode::CREATED,
        Json(UploadResponse {
            assessment_id,
            prediction_full: prediction,
        }),
    ))
}
