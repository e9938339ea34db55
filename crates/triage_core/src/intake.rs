//! crates/triage_core/src/intake.rs
//!
//! The multi-section intake form and the state machine that validates and
//! submits it.
//!
//! Input is sanitised as it arrives (names lose disallowed characters,
//! numeric fields lose non-digits) and validated as a whole on submit. A
//! valid form is written as three records: the assessment, its diagnosis
//! snapshot and an X-ray placeholder.

use crate::domain::{
    Condition, DiagnosisRecord, ExposureRisk, NewAssessment, Sex, SmokingStatus, Symptom,
    User, XrayRecord,
};
use crate::ports::{AssessmentStore, PortError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;
use tracing::{error, info};
use uuid::Uuid;

pub const MAX_NAME_LEN: usize = 100;
pub const MAX_CONTACT_LEN: usize = 15;
pub const MAX_AGE_LEN: usize = 3;
pub const MAX_AGE: u8 = 120;

static NAME_DISALLOWED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[^a-zA-Z\s'-]").expect("name filter pattern is valid")
});

static NON_DIGITS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\D").expect("digit filter pattern is valid"));

//=========================================================================================
// Form Fields
//=========================================================================================

/// Keys used for field-level validation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Field {
    FullName,
    Age,
    Sex,
    Contact,
    Address,
    Symptoms,
    PreExisting,
    PreExistingOther,
    Medications,
    Allergies,
    SmokingStatus,
    PackYears,
    ExposureRisks,
    AdditionalConcerns,
}

pub type FieldErrors = BTreeMap<Field, &'static str>;

/// The form exactly as the operator has filled it so far.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IntakeForm {
    pub full_name: String,
    pub age: String,
    pub sex: Option<Sex>,
    pub contact: String,
    pub address: String,
    pub symptoms: BTreeMap<Symptom, bool>,
    pub pre_existing: BTreeSet<Condition>,
    pub pre_existing_other: String,
    pub medications: String,
    pub allergies: String,
    pub smoking_status: Option<SmokingStatus>,
    pub pack_years: String,
    pub exposure_risks: BTreeSet<ExposureRisk>,
    pub additional_concerns: String,
}

/// A single user edit.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "field", content = "value", rename_all = "camelCase")]
pub enum FieldInput {
    FullName(String),
    Age(String),
    Sex(Option<Sex>),
    Contact(String),
    Address(String),
    Symptom { key: Symptom, checked: bool },
    PreExisting(BTreeSet<Condition>),
    PreExistingOther(String),
    Medications(String),
    Allergies(String),
    SmokingStatus(Option<SmokingStatus>),
    PackYears(String),
    ExposureRisks(BTreeSet<ExposureRisk>),
    AdditionalConcerns(String),
}

impl FieldInput {
    /// The error key cleared when this input is applied.
    fn clears(&self) -> Field {
        match self {
            FieldInput::FullName(_) => Field::FullName,
            FieldInput::Age(_) => Field::Age,
            FieldInput::Sex(_) => Field::Sex,
            FieldInput::Contact(_) => Field::Contact,
            FieldInput::Address(_) => Field::Address,
            FieldInput::Symptom { .. } => Field::Symptoms,
            // Changing the condition list can make the free-text field
            // optional again.
            FieldInput::PreExisting(_) => Field::PreExistingOther,
            FieldInput::PreExistingOther(_) => Field::PreExistingOther,
            FieldInput::Medications(_) => Field::Medications,
            FieldInput::Allergies(_) => Field::Allergies,
            FieldInput::SmokingStatus(_) => Field::SmokingStatus,
            FieldInput::PackYears(_) => Field::PackYears,
            FieldInput::ExposureRisks(_) => Field::ExposureRisks,
            FieldInput::AdditionalConcerns(_) => Field::AdditionalConcerns,
        }
    }
}

//=========================================================================================
// Sanitisation
//=========================================================================================

/// Keeps letters, whitespace, hyphens and apostrophes.
pub fn sanitize_name(input: &str) -> String {
    let cleaned = NAME_DISALLOWED.replace_all(input, "");
    cleaned.chars().take(MAX_NAME_LEN).collect()
}

/// Keeps ASCII digits only, truncated to `max_len`.
pub fn sanitize_digits(input: &str, max_len: usize) -> String {
    let cleaned = NON_DIGITS.replace_all(input, "");
    cleaned.chars().take(max_len).collect()
}

//=========================================================================================
// Validation
//=========================================================================================

/// A form that passed validation, with its numeric fields parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidIntake {
    pub age: u8,
    pub sex: Sex,
    pub pack_years: Option<f64>,
}

impl IntakeForm {
    pub fn apply(&mut self, input: FieldInput) {
        match input {
            FieldInput::FullName(v) => self.full_name = sanitize_name(&v),
            FieldInput::Age(v) => self.age = sanitize_digits(&v, MAX_AGE_LEN),
            FieldInput::Sex(v) => self.sex = v,
            FieldInput::Contact(v) => self.contact = sanitize_digits(&v, MAX_CONTACT_LEN),
            FieldInput::Address(v) => self.address = v,
            FieldInput::Symptom { key, checked } => {
                self.symptoms.insert(key, checked);
            }
            FieldInput::PreExisting(v) => self.pre_existing = v,
            FieldInput::PreExistingOther(v) => self.pre_existing_other = v,
            FieldInput::Medications(v) => self.medications = v,
            FieldInput::Allergies(v) => self.allergies = v,
            FieldInput::SmokingStatus(v) => self.smoking_status = v,
            FieldInput::PackYears(v) => self.pack_years = v,
            FieldInput::ExposureRisks(v) => self.exposure_risks = v,
            FieldInput::AdditionalConcerns(v) => self.additional_concerns = v,
        }
    }

    /// Evaluates every rule and reports all failures at once.
    pub fn validate(&self) -> Result<ValidIntake, FieldErrors> {
        let mut errors = FieldErrors::new();

        if self.full_name.trim().is_empty() {
            errors.insert(Field::FullName, "Full name is required");
        }

        let age = self
            .age
            .trim()
            .parse::<u8>()
            .ok()
            .filter(|age| *age <= MAX_AGE);
        if age.is_none() {
            errors.insert(Field::Age, "Valid age is required");
        }

        if self.sex.is_none() {
            errors.insert(Field::Sex, "Sex is required");
        }
        if self.contact.trim().is_empty() {
            errors.insert(Field::Contact, "Contact is required");
        }
        if self.address.trim().is_empty() {
            errors.insert(Field::Address, "Address is required");
        }
        if !self.symptoms.values().any(|checked| *checked) {
            errors.insert(Field::Symptoms, "Select at least one symptom");
        }

        let mut pack_years = None;
        if self.smoking_status.is_some_and(SmokingStatus::requires_pack_years) {
            pack_years = self
                .pack_years
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|py| py.is_finite() && *py >= 0.0);
            if pack_years.is_none() {
                errors.insert(Field::PackYears, "Pack-years required");
            }
        }

        if self.pre_existing.contains(&Condition::Other)
            && self.pre_existing_other.trim().is_empty()
        {
            errors.insert(Field::PreExistingOther, "Please specify other condition");
        }

        match (age, self.sex) {
            (Some(age), Some(sex)) if errors.is_empty() => Ok(ValidIntake {
                age,
                sex,
                pack_years,
            }),
            _ => Err(errors),
        }
    }

    fn assessment_record(&self, valid: &ValidIntake, user: &User) -> NewAssessment {
        NewAssessment {
            full_name: self.full_name.trim().to_string(),
            age: valid.age,
            sex: valid.sex,
            contact: self.contact.clone(),
            address: self.address.trim().to_string(),
            additional_concerns: self.additional_concerns.clone(),
            submitted_by: user.id,
            submitted_by_email: user.email.clone(),
        }
    }

    fn diagnosis_record(&self, valid: &ValidIntake, user: &User) -> DiagnosisRecord {
        let pre_existing_other = if self.pre_existing.contains(&Condition::Other) {
            self.pre_existing_other.trim().to_string()
        } else {
            String::new()
        };
        DiagnosisRecord {
            symptoms: self.symptoms.clone(),
            pre_existing: self.pre_existing.clone(),
            pre_existing_other,
            medications: self.medications.clone(),
            allergies: self.allergies.clone(),
            smoking_status: self.smoking_status,
            pack_years: valid.pack_years,
            exposure_risks: self.exposure_risks.clone(),
            created_by: user.id,
        }
    }
}

//=========================================================================================
// State Machine
//=========================================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum FormPhase {
    Editing,
    Submitting,
    Submitted { assessment_id: Uuid },
    EditingWithErrors,
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("The form has {} invalid field(s)", .0.len())]
    Invalid(FieldErrors),
    #[error("Not signed in.")]
    NotSignedIn,
    #[error("Failed to submit assessment.")]
    Store(#[source] PortError),
}

/// Intake form plus its validation errors and submission phase.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntakeMachine {
    form: IntakeForm,
    errors: FieldErrors,
    phase: FormPhase,
}

impl Default for IntakeMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl IntakeMachine {
    pub fn new() -> Self {
        Self {
            form: IntakeForm::default(),
            errors: FieldErrors::new(),
            phase: FormPhase::Editing,
        }
    }

    pub fn form(&self) -> &IntakeForm {
        &self.form
    }

    pub fn errors(&self) -> &FieldErrors {
        &self.errors
    }

    pub fn phase(&self) -> &FormPhase {
        &self.phase
    }

    /// Applies one edit and clears the error it could fix. Editing after a
    /// completed submission starts a new one.
    pub fn apply(&mut self, input: FieldInput) {
        self.errors.remove(&input.clears());
        self.form.apply(input);
        if matches!(self.phase, FormPhase::Submitted { .. }) {
            self.phase = FormPhase::Editing;
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Validates and, if valid, writes the assessment, its diagnosis and an
    /// X-ray placeholder in that order. Success is only reported once all
    /// three writes are done; a failure leaves earlier writes in place.
    pub async fn submit(
        &mut self,
        store: &dyn AssessmentStore,
        user: Option<&User>,
    ) -> Result<Uuid, SubmitError> {
        let valid = match self.form.validate() {
            Ok(valid) => valid,
            Err(errors) => {
                self.errors = errors.clone();
                self.phase = FormPhase::EditingWithErrors;
                return Err(SubmitError::Invalid(errors));
            }
        };
        self.errors.clear();

        let user = user.ok_or(SubmitError::NotSignedIn)?;

        let assessment = self.form.assessment_record(&valid, user);
        let diagnosis = self.form.diagnosis_record(&valid, user);

        self.phase = FormPhase::Submitting;
        let submitting = SubmittingGuard(&mut self.phase);
        let written = write_records(store, &assessment, &diagnosis).await;
        drop(submitting);

        match written {
            Ok(assessment_id) => {
                info!("Assessment {} submitted by {}", assessment_id, user.id);
                self.form = IntakeForm::default();
                self.phase = FormPhase::Submitted { assessment_id };
                Ok(assessment_id)
            }
            Err(e) => {
                error!("Submission failed: {}", e);
                Err(SubmitError::Store(e))
            }
        }
    }
}

/// Puts a `Submitting` phase back to `Editing` when dropped, including when
/// the submit future is cancelled mid-write.
struct SubmittingGuard<'a>(&'a mut FormPhase);

impl Drop for SubmittingGuard<'_> {
    fn drop(&mut self) {
        if *self.0 == FormPhase::Submitting {
            *self.0 = FormPhase::Editing;
        }
    }
}

async fn write_records(
    store: &dyn AssessmentStore,
    assessment: &NewAssessment,
    diagnosis: &DiagnosisRecord,
) -> Result<Uuid, PortError> {
    let assessment_id = store.create_assessment(assessment).await?;
    store.add_diagnosis(assessment_id, diagnosis).await?;
    store
        .add_xray(assessment_id, &XrayRecord::placeholder())
        .await?;
    Ok(assessment_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{operator, FakeStore};

    fn valid_machine() -> IntakeMachine {
        let mut machine = IntakeMachine::new();
        for input in [
            FieldInput::FullName("Maria Dela Cruz".into()),
            FieldInput::Age("54".into()),
            FieldInput::Sex(Some(Sex::Female)),
            FieldInput::Contact("09171234567".into()),
            FieldInput::Address("12 Mabini St".into()),
            FieldInput::Symptom { key: Symptom::Cough, checked: true },
            FieldInput::SmokingStatus(Some(SmokingStatus::Never)),
        ] {
            machine.apply(input);
        }
        machine
    }

    #[test]
    fn sanitizers_strip_disallowed_input() {
        assert_eq!(sanitize_name("O'Neil-Smith 3rd!"), "O'Neil-Smith rd");
        assert_eq!(sanitize_name(&"a".repeat(150)).len(), MAX_NAME_LEN);
        assert_eq!(sanitize_digits("+63 (917) 123-4567 ext 89", MAX_CONTACT_LEN), "63917123456789");
        assert_eq!(sanitize_digits("4a2", MAX_AGE_LEN), "42");
        assert_eq!(sanitize_digits("1234", MAX_AGE_LEN), "123");
    }

    #[test]
    fn empty_form_reports_every_required_field() {
        let errors = IntakeForm::default().validate().unwrap_err();
        let keys: Vec<Field> = errors.keys().copied().collect();
        assert_eq!(
            keys,
            vec![Field::FullName, Field::Age, Field::Sex, Field::Contact, Field::Address, Field::Symptoms]
        );
    }

    #[test]
    fn age_must_be_within_range() {
        let mut form = valid_machine().form().clone();
        form.age = "121".into();
        assert!(form.validate().unwrap_err().contains_key(&Field::Age));
        form.age = "120".into();
        assert_eq!(form.validate().unwrap().age, 120);
        form.age = "0".into();
        assert_eq!(form.validate().unwrap().age, 0);
    }

    #[test]
    fn pack_years_required_only_for_smokers() {
        let mut form = valid_machine().form().clone();

        form.smoking_status = Some(SmokingStatus::Never);
        form.pack_years = "not a number".into();
        assert!(form.validate().is_ok());
        form.smoking_status = None;
        assert!(form.validate().is_ok());

        for status in [SmokingStatus::Current, SmokingStatus::Former] {
            form.smoking_status = Some(status);
            form.pack_years = String::new();
            assert_eq!(
                form.validate().unwrap_err().keys().collect::<Vec<_>>(),
                vec![&Field::PackYears]
            );
            form.pack_years = "-1".into();
            assert!(form.validate().is_err());
            form.pack_years = "12.5".into();
            assert_eq!(form.validate().unwrap().pack_years, Some(12.5));
        }
    }

    #[test]
    fn other_condition_needs_a_description() {
        let mut form = valid_machine().form().clone();
        form.pre_existing = BTreeSet::from([Condition::Asthma]);
        assert!(form.validate().is_ok());

        form.pre_existing.insert(Condition::Other);
        assert!(form.validate().unwrap_err().contains_key(&Field::PreExistingOther));

        form.pre_existing_other = "Sarcoidosis".into();
        assert!(form.validate().is_ok());
    }

    #[tokio::test]
    async fn fixing_a_field_clears_exactly_its_error() {
        let store = FakeStore::default();
        let mut machine = IntakeMachine::new();
        machine.apply(FieldInput::Symptom { key: Symptom::Fever, checked: true });

        let err = machine.submit(&store, Some(&operator())).await.unwrap_err();
        assert!(matches!(err, SubmitError::Invalid(_)));
        assert_eq!(machine.phase(), &FormPhase::EditingWithErrors);
        assert!(machine.errors().contains_key(&Field::Address));
        let before = machine.errors().len();

        machine.apply(FieldInput::Address("Quezon City".into()));
        assert!(!machine.errors().contains_key(&Field::Address));
        assert_eq!(machine.errors().len(), before - 1);
        assert!(store.log().is_empty());
    }

    #[tokio::test]
    async fn valid_submission_writes_three_records_in_order() {
        let store = FakeStore::default();
        let mut machine = valid_machine();

        let id = machine.submit(&store, Some(&operator())).await.unwrap();

        assert_eq!(store.log(), vec!["create_assessment", "add_diagnosis", "add_xray"]);
        assert_eq!(store.assessments().len(), 1);
        assert_eq!(store.assessments()[0].0, id);
        assert_eq!(store.assessments()[0].1.age, 54);
        assert_eq!(store.diagnoses()[0].0, id);
        assert_eq!(store.diagnoses()[0].1.pack_years, None);
        let xrays = store.list_xrays(id).await.unwrap();
        assert_eq!(xrays.len(), 1);
        assert!(xrays[0].body.placeholder);

        assert_eq!(machine.phase(), &FormPhase::Submitted { assessment_id: id });
        assert_eq!(machine.form(), &IntakeForm::default());
    }

    #[tokio::test]
    async fn failed_write_returns_to_editing_without_an_id() {
        let store = FakeStore::default();
        store.fail_on("add_diagnosis");
        let mut machine = valid_machine();

        let err = machine.submit(&store, Some(&operator())).await.unwrap_err();

        assert!(matches!(err, SubmitError::Store(_)));
        assert_eq!(err.to_string(), "Failed to submit assessment.");
        assert_eq!(machine.phase(), &FormPhase::Editing);
        assert_eq!(machine.form().full_name, "Maria Dela Cruz");
        // The assessment written before the failure is not rolled back.
        assert_eq!(store.log(), vec!["create_assessment", "add_diagnosis"]);
    }

    #[tokio::test]
    async fn cancelled_submission_leaves_the_form_editable() {
        let hung = FakeStore::default();
        hung.stall_on("add_diagnosis");
        let mut machine = valid_machine();

        let cancelled = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            machine.submit(&hung, Some(&operator())),
        )
        .await;
        assert!(cancelled.is_err());
        assert_eq!(machine.phase(), &FormPhase::Editing);
        assert_eq!(machine.form().full_name, "Maria Dela Cruz");

        let store = FakeStore::default();
        let id = machine.submit(&store, Some(&operator())).await.unwrap();
        assert_eq!(machine.phase(), &FormPhase::Submitted { assessment_id: id });
        assert_eq!(store.log(), vec!["create_assessment", "add_diagnosis", "add_xray"]);
    }

    #[tokio::test]
    async fn submission_requires_a_signed_in_user() {
        let store = FakeStore::default();
        let mut machine = valid_machine();

        let err = machine.submit(&store, None).await.unwrap_err();

        assert!(matches!(err, SubmitError::NotSignedIn));
        assert!(store.log().is_empty());
    }

    #[test]
    fn reset_discards_everything() {
        let mut machine = valid_machine();
        machine.reset();
        assert_eq!(machine, IntakeMachine::new());
    }

    #[test]
    fn field_inputs_deserialize_from_tagged_json() {
        let input: FieldInput =
            serde_json::from_value(serde_json::json!({ "field": "symptom", "value": { "key": "chestPain", "checked": true } }))
                .unwrap();
        assert_eq!(input, FieldInput::Symptom { key: Symptom::ChestPain, checked: true });

        let input: FieldInput =
            serde_json::from_value(serde_json::json!({ "field": "preExisting", "value": ["COPD", "Other"] }))
                .unwrap();
        assert_eq!(input, FieldInput::PreExisting(BTreeSet::from([Condition::Copd, Condition::Other])));
    }
}
