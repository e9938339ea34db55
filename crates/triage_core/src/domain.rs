//! crates/triage_core/src/domain.rs
//!
//! Defines the core data structures for the intake station: the people who
//! use it, the records an intake produces, and the payloads exchanged with
//! the inference backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

//=========================================================================================
// Identity
//=========================================================================================

/// An operator signed in through the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: Option<String>,
}

//=========================================================================================
// Intake Vocabulary
//=========================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sex {
    Female,
    Male,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SmokingStatus {
    Never,
    Former,
    Current,
}

impl SmokingStatus {
    /// Former and current smokers must report pack-years.
    pub fn requires_pack_years(self) -> bool {
        matches!(self, SmokingStatus::Former | SmokingStatus::Current)
    }
}

/// Presenting symptoms offered as checkboxes on the intake form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Symptom {
    Cough,
    Fever,
    ShortnessOfBreath,
    ChestPain,
    Fatigue,
    Sputum,
    Wheezing,
    Chills,
    Headache,
    MuscleAches,
    Nausea,
    Diarrhea,
}

impl Symptom {
    pub const ALL: [Symptom; 12] = [
        Symptom::Cough,
        Symptom::Fever,
        Symptom::ShortnessOfBreath,
        Symptom::ChestPain,
        Symptom::Fatigue,
        Symptom::Sputum,
        Symptom::Wheezing,
        Symptom::Chills,
        Symptom::Headache,
        Symptom::MuscleAches,
        Symptom::Nausea,
        Symptom::Diarrhea,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Symptom::Cough => "Cough",
            Symptom::Fever => "Fever",
            Symptom::ShortnessOfBreath => "Shortness of Breath",
            Symptom::ChestPain => "Chest Pain",
            Symptom::Fatigue => "Fatigue",
            Symptom::Sputum => "Sputum/Phlegm",
            Symptom::Wheezing => "Wheezing",
            Symptom::Chills => "Chills",
            Symptom::Headache => "Headache",
            Symptom::MuscleAches => "Muscle Aches",
            Symptom::Nausea => "Nausea/Vomiting",
            Symptom::Diarrhea => "Diarrhea",
        }
    }
}

/// Pre-existing conditions. `Other` requires a free-text description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Condition {
    Asthma,
    #[serde(rename = "COPD")]
    Copd,
    Diabetes,
    #[serde(rename = "Heart Disease")]
    HeartDisease,
    #[serde(rename = "Kidney Disease")]
    KidneyDisease,
    Immunosuppression,
    Cancer,
    Other,
    None,
}

impl Condition {
    pub const ALL: [Condition; 9] = [
        Condition::Asthma,
        Condition::Copd,
        Condition::Diabetes,
        Condition::HeartDisease,
        Condition::KidneyDisease,
        Condition::Immunosuppression,
        Condition::Cancer,
        Condition::Other,
        Condition::None,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Condition::Asthma => "Asthma",
            Condition::Copd => "COPD",
            Condition::Diabetes => "Diabetes",
            Condition::HeartDisease => "Heart Disease",
            Condition::KidneyDisease => "Kidney Disease",
            Condition::Immunosuppression => "Immunosuppression",
            Condition::Cancer => "Cancer",
            Condition::Other => "Other",
            Condition::None => "None",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExposureRisk {
    RecentContact,
    RecentTravel,
    HealthcareWorker,
    NursingHome,
}

impl ExposureRisk {
    pub const ALL: [ExposureRisk; 4] = [
        ExposureRisk::RecentContact,
        ExposureRisk::RecentTravel,
        ExposureRisk::HealthcareWorker,
        ExposureRisk::NursingHome,
    ];

    pub fn label(self) -> &'static str {
        match self {
            ExposureRisk::RecentContact => "Recent contact with sick person",
            ExposureRisk::RecentTravel => "Recent travel",
            ExposureRisk::HealthcareWorker => "Healthcare worker",
            ExposureRisk::NursingHome => "Nursing home resident",
        }
    }
}

//=========================================================================================
// Persisted Assessment Records
//=========================================================================================

/// The top-level assessment document: demographics plus submission metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAssessment {
    pub full_name: String,
    pub age: u8,
    pub sex: Sex,
    pub contact: String,
    pub address: String,
    pub additional_concerns: String,
    pub submitted_by: Uuid,
    pub submitted_by_email: Option<String>,
}

/// Symptoms and history snapshot, stored under `assessments/{id}/diagnosis`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosisRecord {
    pub symptoms: BTreeMap<Symptom, bool>,
    pub pre_existing: BTreeSet<Condition>,
    pub pre_existing_other: String,
    pub medications: String,
    pub allergies: String,
    pub smoking_status: Option<SmokingStatus>,
    pub pack_years: Option<f64>,
    pub exposure_risks: BTreeSet<ExposureRisk>,
    pub created_by: Uuid,
}

/// An X-ray reference, stored under `assessments/{id}/xray`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct XrayRecord {
    #[serde(default)]
    pub placeholder: bool,
    #[serde(default)]
    pub notes: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

impl XrayRecord {
    pub fn placeholder() -> Self {
        Self {
            placeholder: true,
            notes: "xray placeholder - no image uploaded yet".to_string(),
            image_url: None,
            file_name: None,
        }
    }
}

/// Links an assessment to a prediction held by the inference backend,
/// stored under `assessments/{id}/backendPrediction`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictionLink {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prediction_id: Option<String>,
}

/// A child record as read back from the store, with its creation time.
#[derive(Debug, Clone, PartialEq)]
pub struct Stored<T> {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub body: T,
}

//=========================================================================================
// Inference Backend Payloads
//=========================================================================================

/// The backend's inference output for one uploaded image.
///
/// Only the fields the station reads are typed; everything else the backend
/// returns is kept in `extra` so the full payload can be sent back for
/// report generation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Prediction {
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "id_from_any")]
    pub id: Option<String>,
    #[serde(default)]
    pub pathologies: Vec<String>,
    #[serde(default)]
    pub probabilities: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inference_time_sec: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Prediction {
    /// Probability reported for a named pathology, if the model produced one.
    pub fn probability_of(&self, pathology: &str) -> Option<f64> {
        self.pathologies
            .iter()
            .position(|p| p == pathology)
            .and_then(|i| self.probabilities.get(i).copied())
    }
}

/// Accepts string or numeric ids from the backend.
fn id_from_any<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) if !s.is_empty() => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Body of a chat call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prediction_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct ChatReply {
    #[serde(default)]
    pub answer: String,
}

/// Who authored a line of the results chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: u64,
    pub from: Sender,
    pub text: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn prediction_keeps_unknown_fields_and_numeric_ids() {
        let raw = json!({
            "id": 42,
            "pathologies": ["Atelectasis", "Pneumonia"],
            "probabilities": [0.12, 0.71],
            "inference_time_sec": 0.0831,
            "model": "densenet121-res224-all"
        });
        let prediction: Prediction = serde_json::from_value(raw).unwrap();

        assert_eq!(prediction.id.as_deref(), Some("42"));
        assert_eq!(prediction.probability_of("Pneumonia"), Some(0.71));
        assert_eq!(prediction.probability_of("Edema"), None);
        assert_eq!(prediction.extra["model"], "densenet121-res224-all");

        let back = serde_json::to_value(&prediction).unwrap();
        assert_eq!(back["model"], "densenet121-res224-all");
    }

    #[test]
    fn vocabulary_uses_form_keys() {
        assert_eq!(serde_json::to_value(Symptom::ShortnessOfBreath).unwrap(), "shortnessOfBreath");
        assert_eq!(serde_json::to_value(Condition::HeartDisease).unwrap(), "Heart Disease");
        assert_eq!(serde_json::to_value(Condition::Copd).unwrap(), "COPD");
        assert_eq!(serde_json::to_value(ExposureRisk::NursingHome).unwrap(), "nursingHome");
        assert_eq!(serde_json::to_value(SmokingStatus::Former).unwrap(), "former");
    }

    #[test]
    fn chat_request_omits_absent_context() {
        let body = serde_json::to_value(ChatRequest {
            message: "is this serious?".into(),
            prediction_id: None,
            report: None,
        })
        .unwrap();
        assert_eq!(body, json!({ "message": "is this serious?" }));
    }
}
