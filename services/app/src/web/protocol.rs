//! services/app/src/web/protocol.rs
//!
//! Request and response payloads of the station's JSON API.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use triage_core::report::{Extraction, Report};
use triage_core::domain::{Condition, ExposureRisk, Symptom};
use triage_core::{IntakeMachine, Prediction, ResultState, SessionState, User};
use utoipa::ToSchema;
use uuid::Uuid;

pub const PARSE_FAILED: &str = "Failed to parse structured report.";

//=========================================================================================
// Session
//=========================================================================================

#[derive(Deserialize, ToSchema)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct UserResponse {
    pub id: Uuid,
    pub email: Option<String>,
}

impl From<User> for UserResponse {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            email: user.email,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SessionResponse {
    pub user: Option<UserResponse>,
    pub loading: bool,
}

impl From<SessionState> for SessionResponse {
    fn from(state: SessionState) -> Self {
        Self {
            user: state.user.map(UserResponse::from),
            loading: state.loading,
        }
    }
}

//=========================================================================================
// Intake
//=========================================================================================

/// The intake form, its field errors and its submission phase.
#[derive(Serialize, ToSchema)]
pub struct IntakeResponse {
    #[schema(value_type = Object)]
    pub form: Value,
    #[schema(value_type = Object)]
    pub errors: Value,
    #[schema(value_type = Object)]
    pub phase: Value,
}

impl From<&IntakeMachine> for IntakeResponse {
    fn from(machine: &IntakeMachine) -> Self {
        Self {
            form: serde_json::to_value(machine.form()).unwrap_or_default(),
            errors: serde_json::to_value(machine.errors()).unwrap_or_default(),
            phase: serde_json::to_value(machine.phase()).unwrap_or_default(),
        }
    }
}

/// A checkbox the form offers: the value to send back and its caption.
#[derive(Debug, Serialize, ToSchema)]
pub struct FormOption {
    pub key: String,
    pub label: String,
}

fn option<T: Serialize>(value: T, label: &str) -> FormOption {
    let key = match serde_json::to_value(value) {
        Ok(Value::String(key)) => key,
        _ => label.to_string(),
    };
    FormOption {
        key,
        label: label.to_string(),
    }
}

/// The checkbox groups of the intake form, in display order.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FormOptionsResponse {
    pub symptoms: Vec<FormOption>,
    pub conditions: Vec<FormOption>,
    pub exposure_risks: Vec<FormOption>,
}

impl FormOptionsResponse {
    pub fn new() -> Self {
        Self {
            symptoms: Symptom::ALL.iter().map(|s| option(s, s.label())).collect(),
            conditions: Condition::ALL.iter().map(|c| option(c, c.label())).collect(),
            exposure_risks: ExposureRisk::ALL
                .iter()
                .map(|r| option(r, r.label()))
                .collect(),
        }
    }
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub assessment_id: Uuid,
    pub message: String,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubmitErrorResponse {
    pub message: String,
    #[schema(value_type = Object)]
    pub errors: Value,
}

/// Navigation state handed to `/result` after an upload.
#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub assessment_id: Uuid,
    #[schema(value_type = Object)]
    pub prediction_full: Prediction,
}

//=========================================================================================
// Results
//=========================================================================================

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OpenResultRequest {
    pub assessment_id: Option<Uuid>,
    #[schema(value_type = Option<Object>)]
    pub prediction_full: Option<Value>,
    #[schema(value_type = Option<Object>)]
    pub report_full: Option<Value>,
}

#[derive(Deserialize, ToSchema)]
pub struct ChatBody {
    pub message: String,
}

/// The report's presentation fields.
#[derive(Debug, Default, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReportView {
    pub summary: Option<String>,
    pub pneumonia_assessment: Option<String>,
    pub differential: Option<String>,
    pub next_steps: Option<String>,
    pub patient_friendly: Option<String>,
    pub disclaimer: Option<String>,
    pub context: Option<String>,
    /// Set when no structured object could be extracted.
    pub parse_error: Option<String>,
    /// The unparsed text, shown when extraction failed.
    pub raw: Option<String>,
    /// An error reported inside the report payload by the backend.
    pub error: Option<String>,
}

impl From<&Report> for ReportView {
    fn from(report: &Report) -> Self {
        let owned = |s: Option<&str>| s.map(str::to_string);
        let mut view = ReportView {
            disclaimer: owned(report.disclaimer()),
            context: owned(report.context()),
            error: owned(report.error()),
            ..Default::default()
        };
        match report.extraction() {
            Extraction::Structured(s) => {
                view.summary = owned(s.summary());
                view.pneumonia_assessment = owned(s.pneumonia_assessment());
                view.differential = owned(s.differential());
                view.next_steps = owned(s.next_steps());
                view.patient_friendly = owned(s.patient_friendly());
            }
            Extraction::Unparseable => {
                view.parse_error = Some(PARSE_FAILED.to_string());
                view.raw = owned(report.raw());
            }
        }
        view
    }
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResultSnapshot {
    pub view_id: Uuid,
    /// False while the full-page spinner should still be shown.
    pub ready: bool,
    #[schema(value_type = Object)]
    pub state: ResultState,
    pub report_view: Option<ReportView>,
}

impl ResultSnapshot {
    pub fn new(view_id: Uuid, state: ResultState) -> Self {
        Self {
            view_id,
            ready: state.is_ready(),
            report_view: state.report.as_ref().map(ReportView::from),
            state,
        }
    }
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    /// One of `answered`, `failed`, `ignored`, `busy`.
    pub outcome: String,
    pub snapshot: ResultSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn form_options_send_back_the_wire_keys() {
        let options = FormOptionsResponse::new();

        assert_eq!(options.symptoms.len(), 12);
        assert_eq!(options.symptoms[2].key, "shortnessOfBreath");
        assert_eq!(options.symptoms[2].label, "Shortness of Breath");
        assert_eq!(options.conditions[1].key, "COPD");
        assert_eq!(options.conditions[3].key, "Heart Disease");
        assert_eq!(options.exposure_risks[0].key, "recentContact");
        assert_eq!(options.exposure_risks[0].label, "Recent contact with sick person");

        let value = serde_json::to_value(&options).unwrap();
        assert!(value.get("exposureRisks").is_some());
    }

    #[test]
    fn report_view_exposes_structured_fields() {
        let report = Report::from_response(json!({
            "report": {
                "parsed": {
                    "summary": "Consolidation in the right lower lobe.",
                    "differential": "",
                    "next_steps": "Clinical correlation."
                },
                "disclaimer": "Not a diagnosis.",
            }
        }))
        .unwrap();

        let view = ReportView::from(&report);
        assert_eq!(view.summary.as_deref(), Some("Consolidation in the right lower lobe."));
        assert_eq!(view.differential, None);
        assert_eq!(view.next_steps.as_deref(), Some("Clinical correlation."));
        assert_eq!(view.disclaimer.as_deref(), Some("Not a diagnosis."));
        assert!(view.parse_error.is_none());
    }

    #[test]
    fn unparseable_report_keeps_the_raw_text() {
        let report = Report::from_response(json!({ "report": "free text only" })).unwrap();

        let view = ReportView::from(&report);
        assert_eq!(view.parse_error.as_deref(), Some(PARSE_FAILED));
        assert_eq!(view.raw.as_deref(), Some("free text only"));
        assert!(view.summary.is_none());
    }
}
