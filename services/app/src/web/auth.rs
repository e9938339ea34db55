//! services/app/src/web/auth.rs
//!
//! Sign-in, sign-out and session endpoints, plus the landing route.

use crate::web::middleware::still_loading;
use crate::web::protocol::{LoginRequest, SessionResponse, UserResponse};
use crate::web::state::AppState;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Redirect, Response},
    Json,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};
use triage_core::{Guard, PortError};

/// How long sign-in waits for the session to reflect the new user.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(2);

//=========================================================================================
// Handlers
//=========================================================================================

/// GET / - Landing page, redirects a signed-in operator to the assessment
#[utoipa::path(
    get,
    path = "/",
    responses(
        (status = 200, description = "Landing page for a signed-out station"),
        (status = 303, description = "Signed in; continue at /assessment"),
        (status = 503, description = "Session still loading")
    )
)]
pub async fn landing_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.session.guard() {
        Guard::Wait => still_loading(),
        Guard::Allow(_) => Redirect::to("/assessment").into_response(),
        Guard::RedirectToLogin => Json(json!({
            "title": "Pneumonia triage intake",
            "login": "/login",
        }))
        .into_response(),
    }
}

/// POST /login - Sign in with an operator account
#[utoipa::path(
    post,
    path = "/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Signed in", body = SessionResponse),
        (status = 401, description = "Invalid credentials"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn login_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    // 1. Sign in through the identity provider
    let user = state
        .session
        .sign_in(&req.email, &req.password)
        .await
        .map_err(|e| match e {
            PortError::Unauthorized(message) => (StatusCode::UNAUTHORIZED, message),
            other => {
                error!("Failed to sign in: {:?}", other);
                (StatusCode::INTERNAL_SERVER_ERROR, "Sign-in failed".to_string())
            }
        })?;

    // 2. Wait for the provider's notification to reach the session
    let mut rx = state.session.subscribe();
    let settled = matches!(
        tokio::time::timeout(
            SETTLE_TIMEOUT,
            rx.wait_for(|s| !s.loading && s.user.as_ref().map(|u| u.id) == Some(user.id)),
        )
        .await,
        Ok(Ok(_))
    );
    if !settled {
        warn!("Session did not reflect the sign-in of {} in time.", user.id);
    }

    Ok(Json(SessionResponse {
        user: Some(UserResponse::from(user)),
        loading: false,
    }))
}

/// POST /logout - Sign out the station
///
/// Also discards the intake form and every open result view.
#[utoipa::path(
    post,
    path = "/logout",
    responses(
        (status = 200, description = "Signed out", body = SessionResponse)
    )
)]
pub async fn logout_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.session.sign_out().await;
    state.intake.lock().await.reset();
    state.results.close_all();
    Json(SessionResponse::from(state.session.current()))
}

/// GET /session - The current session value
#[utoipa::path(
    get,
    path = "/session",
    responses(
        (status = 200, description = "Current session", body = SessionResponse)
    )
)]
pub async fn session_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(SessionResponse::from(state.session.current()))
}
