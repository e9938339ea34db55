//! crates/triage_core/src/ports.rs
//!
//! Defines the service contracts (traits) for the station's external
//! collaborators: the identity provider, the assessment document store and
//! the inference backend. The core flows only ever talk to these traits, so
//! every collaborator can be replaced by a fake in tests.

use crate::domain::{
    ChatReply, ChatRequest, DiagnosisRecord, NewAssessment, Prediction, PredictionLink, Stored,
    User, XrayRecord,
};
use crate::report::Report;
use crate::upload::XrayUpload;
use async_trait::async_trait;
use futures::Stream;
use serde::Serialize;
use std::pin::Pin;
use uuid::Uuid;

//=========================================================================================
// Generic Port Error and Result Types
//=========================================================================================

/// A generic error type for all port operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PortError {
    #[error("Item not found: {0}")]
    NotFound(String),
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    /// A remote service answered with a non-success status. The message is
    /// the response body text, exactly as the service sent it.
    #[error("{body}")]
    Request { status: u16, body: String },
    #[error("An unexpected error occurred: {0}")]
    Unexpected(String),
}

/// A convenience type alias for `Result<T, PortError>`.
pub type PortResult<T> = Result<T, PortError>;

//=========================================================================================
// Identity Provider
//=========================================================================================

/// Stream of auth-state notifications: `Some(user)` when signed in, `None`
/// when signed out.
pub type AuthStateStream = Pin<Box<dyn Stream<Item = Option<User>> + Send>>;

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Subscribes to auth-state changes. The first item reports the current
    /// state once the provider has resolved it.
    fn auth_state_changes(&self) -> AuthStateStream;

    async fn sign_in(&self, email: &str, password: &str) -> PortResult<User>;

    async fn sign_out(&self) -> PortResult<()>;
}

//=========================================================================================
// Assessment Document Store
//=========================================================================================

#[async_trait]
pub trait AssessmentStore: Send + Sync {
    /// Creates `assessments/{id}` and returns the server-issued id.
    async fn create_assessment(&self, assessment: &NewAssessment) -> PortResult<Uuid>;

    async fn assessment_exists(&self, assessment_id: Uuid) -> PortResult<bool>;

    async fn add_diagnosis(&self, assessment_id: Uuid, record: &DiagnosisRecord) -> PortResult<()>;

    async fn add_xray(&self, assessment_id: Uuid, record: &XrayRecord) -> PortResult<()>;

    async fn add_prediction_link(
        &self,
        assessment_id: Uuid,
        link: &PredictionLink,
    ) -> PortResult<()>;

    /// Records of `assessments/{id}/xray`, oldest first.
    async fn list_xrays(&self, assessment_id: Uuid) -> PortResult<Vec<Stored<XrayRecord>>>;

    /// Records of `assessments/{id}/backendPrediction`, oldest first.
    async fn list_prediction_links(
        &self,
        assessment_id: Uuid,
    ) -> PortResult<Vec<Stored<PredictionLink>>>;
}

//=========================================================================================
// Inference Backend
//=========================================================================================

/// Identifies the prediction a report is generated from. Exactly one of the
/// two is ever sent.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ReportSubject {
    ById { prediction_id: String },
    Inline { prediction: Prediction },
}

#[async_trait]
pub trait InferenceService: Send + Sync {
    async fn predict_xray(&self, upload: &XrayUpload) -> PortResult<Prediction>;

    async fn get_prediction(&self, prediction_id: &str) -> PortResult<Prediction>;

    async fn generate_report(&self, subject: &ReportSubject) -> PortResult<Report>;

    async fn chat(&self, request: &ChatRequest) -> PortResult<ChatReply>;

    /// Liveness probe; returns the backend's status text.
    async fn health(&self) -> PortResult<String>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn report_subject_sends_exactly_one_identifier() {
        let by_id = serde_json::to_value(ReportSubject::ById {
            prediction_id: "p-1".into(),
        })
        .unwrap();
        assert_eq!(by_id, json!({ "prediction_id": "p-1" }));

        let inline = serde_json::to_value(ReportSubject::Inline {
            prediction: Prediction {
                pathologies: vec!["Pneumonia".into()],
                probabilities: vec![0.5],
                ..Default::default()
            },
        })
        .unwrap();
        assert_eq!(
            inline,
            json!({ "prediction": { "pathologies": ["Pneumonia"], "probabilities": [0.5] } })
        );
    }

    #[test]
    fn request_errors_display_the_body_text() {
        let err = PortError::Request {
            status: 404,
            body: "prediction not found".into(),
        };
        assert_eq!(err.to_string(), "prediction not found");
    }
}
