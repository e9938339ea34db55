pub mod auth;
pub mod intake;
pub mod middleware;
pub mod protocol;
pub mod rest;
pub mod results;
pub mod state;

pub use middleware::require_session;

use crate::error::ApiError;
use axum::{
    extract::DefaultBodyLimit,
    http::{
        header::{ACCEPT, CONTENT_TYPE},
        HeaderValue, Method,
    },
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use rest::ApiDoc;
use state::AppState;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

/// Room for multipart framing on top of the upload size limit, so oversized
/// files are rejected by the upload check with a clear message.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// Builds the station's full router: public routes, guarded routes and the
/// Swagger UI.
pub fn router(app_state: Arc<AppState>) -> Result<Router, ApiError> {
    let origin = app_state
        .config
        .cors_origin
        .parse::<HeaderValue>()
        .map_err(|e| ApiError::Internal(format!("Invalid CORS_ORIGIN: {}", e)))?;
    let cors = CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([CONTENT_TYPE, ACCEPT]);

    // Public routes (no session required)
    let public_routes = Router::new()
        .route("/", get(auth::landing_handler))
        .route("/login", post(auth::login_handler))
        .route("/logout", post(auth::logout_handler))
        .route("/session", get(auth::session_handler));

    // Protected routes (signed-in session required)
    let protected_routes = Router::new()
        .route(
            "/assessment",
            get(intake::get_form_handler)
                .patch(intake::apply_inputs_handler)
                .post(intake::submit_handler)
                .delete(intake::reset_form_handler),
        )
        .route("/assessment/options", get(intake::form_options_handler))
        .route("/assessment/{id}/xray", post(intake::upload_xray_handler))
        .route("/result", post(results::open_result_handler))
        .route(
            "/result/{id}",
            get(results::get_result_handler).delete(results::close_result_handler),
        )
        .route("/result/{id}/chat", post(results::chat_handler))
        .layer(axum_middleware::from_fn_with_state(
            app_state.clone(),
            require_session,
        ));

    let api_router = Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(DefaultBodyLimit::max(
            app_state.config.max_upload_bytes + MULTIPART_OVERHEAD,
        ))
        .layer(cors)
        .with_state(app_state);

    Ok(Router::new()
        .merge(api_router)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi())))
}
