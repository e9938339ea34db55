//! services/app/src/web/middleware.rs
//!
//! The session guard protecting the assessment and result routes.

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Redirect, Response},
    Json,
};
use serde_json::json;
use std::sync::Arc;
use triage_core::Guard;

use crate::web::state::AppState;

/// Response for requests made before the identity provider has reported.
pub fn still_loading() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        [(header::RETRY_AFTER, "1")],
        Json(json!({ "status": "loading" })),
    )
        .into_response()
}

/// Middleware that consults the station's session before a protected route.
///
/// While the session is still loading no decision is made and the client is
/// asked to retry. A settled session without a user is redirected to the
/// sign-in view. Otherwise the signed-in `User` is inserted into the request
/// extensions for handlers to use.
pub async fn require_session(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Response {
    match state.session.guard() {
        Guard::Wait => still_loading(),
        Guard::RedirectToLogin => Redirect::to("/login").into_response(),
        Guard::Allow(user) => {
            req.extensions_mut().insert(user);
            next.run(req).await
        }
    }
}
