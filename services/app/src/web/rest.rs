//! services/app/src/web/rest.rs
//!
//! The master definition for the OpenAPI specification of the station's
//! JSON API.

use crate::web::protocol::{
    ChatBody, ChatResponse, FormOption, FormOptionsResponse, IntakeResponse, LoginRequest,
    OpenResultRequest, ReportView, ResultSnapshot, SessionResponse, SubmitErrorResponse,
    SubmitResponse, UploadResponse, UserResponse,
};
use crate::web::{auth, intake, results};
use utoipa::OpenApi;

//=========================================================================================
// OpenAPI Master Definition
//=========================================================================================

#[derive(OpenApi)]
#[openapi(
    paths(
        auth::landing_handler,
        auth::login_handler,
        auth::logout_handler,
        auth::session_handler,
        intake::get_form_handler,
        intake::form_options_handler,
        intake::apply_inputs_handler,
        intake::submit_handler,
        intake::reset_form_handler,
        intake::upload_xray_handler,
        results::open_result_handler,
        results::get_result_handler,
        results::chat_handler,
        results::close_result_handler,
    ),
    components(
        schemas(
            LoginRequest,
            UserResponse,
            SessionResponse,
            IntakeResponse,
            FormOption,
            FormOptionsResponse,
            SubmitResponse,
            SubmitErrorResponse,
            UploadResponse,
            OpenResultRequest,
            ReportView,
            ResultSnapshot,
            ChatBody,
            ChatResponse,
        )
    ),
    tags(
        (name = "Triage Intake API", description = "Patient intake, X-ray upload and AI-assisted result review for a single operator station.")
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_route_is_documented() {
        let doc = ApiDoc::openapi();
        let paths: Vec<&str> = doc.paths.paths.keys().map(String::as_str).collect();
        for path in [
            "/",
            "/login",
            "/logout",
            "/session",
            "/assessment",
            "/assessment/options",
            "/assessment/{id}/xray",
            "/result",
            "/result/{id}",
            "/result/{id}/chat",
        ] {
            assert!(paths.contains(&path), "{} missing from the OpenAPI document", path);
        }
    }
}
