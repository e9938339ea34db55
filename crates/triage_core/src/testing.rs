//! crates/triage_core/src/testing.rs
//!
//! In-memory fakes of every port. Compiled for this crate's tests and, with
//! the `test-util` feature, for the tests of the service crate.

use crate::domain::{
    ChatReply, ChatRequest, DiagnosisRecord, NewAssessment, Prediction, PredictionLink, Sex,
    Stored, User, XrayRecord,
};
use crate::ports::{
    AssessmentStore, AuthStateStream, IdentityProvider, InferenceService, PortError, PortResult,
    ReportSubject,
};
use crate::report::Report;
use crate::upload::XrayUpload;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

fn unexpected(op: &str) -> PortError {
    PortError::Unexpected(format!("{} failed", op))
}

//=========================================================================================
// Store
//=========================================================================================

#[derive(Default)]
struct StoreInner {
    log: Vec<String>,
    assessments: Vec<(Uuid, NewAssessment)>,
    diagnoses: Vec<(Uuid, DiagnosisRecord)>,
    xrays: Vec<(Uuid, Stored<XrayRecord>)>,
    links: Vec<(Uuid, Stored<PredictionLink>)>,
    failing: HashSet<&'static str>,
    stalling: HashSet<&'static str>,
}

#[derive(Default)]
pub struct FakeStore {
    inner: Mutex<StoreInner>,
}

impl FakeStore {
    /// Makes the named operation fail from now on.
    pub fn fail_on(&self, op: &'static str) {
        self.inner.lock().unwrap().failing.insert(op);
    }

    /// Makes the named operation wait forever, as a hung database would.
    pub fn stall_on(&self, op: &'static str) {
        self.inner.lock().unwrap().stalling.insert(op);
    }

    /// Records an assessment directly and returns its id.
    pub fn seed_assessment(&self) -> Uuid {
        let id = Uuid::new_v4();
        let assessment = NewAssessment {
            full_name: "Juan Santos".into(),
            age: 61,
            sex: Sex::Male,
            contact: "09181234567".into(),
            address: "4 Rizal Ave".into(),
            additional_concerns: String::new(),
            submitted_by: operator().id,
            submitted_by_email: operator().email,
        };
        self.inner.lock().unwrap().assessments.push((id, assessment));
        id
    }

    /// Operations performed so far, in order.
    pub fn log(&self) -> Vec<String> {
        self.inner.lock().unwrap().log.clone()
    }

    pub fn assessments(&self) -> Vec<(Uuid, NewAssessment)> {
        self.inner.lock().unwrap().assessments.clone()
    }

    pub fn diagnoses(&self) -> Vec<(Uuid, DiagnosisRecord)> {
        self.inner.lock().unwrap().diagnoses.clone()
    }

    async fn stall_if_asked(&self, op: &'static str) {
        let stalls = self.inner.lock().unwrap().stalling.contains(op);
        if stalls {
            std::future::pending::<()>().await;
        }
    }

    fn enter(&self, op: &'static str) -> PortResult<std::sync::MutexGuard<'_, StoreInner>> {
        let mut inner = self.inner.lock().unwrap();
        inner.log.push(op.to_string());
        if inner.failing.contains(op) {
            return Err(unexpected(op));
        }
        Ok(inner)
    }
}

fn stored<T>(body: T) -> Stored<T> {
    Stored {
        id: Uuid::new_v4(),
        created_at: Utc::now(),
        body,
    }
}

#[async_trait]
impl AssessmentStore for FakeStore {
    async fn assessment_exists(&self, assessment_id: Uuid) -> PortResult<bool> {
        self.stall_if_asked("assessment_exists").await;
        let inner = self.enter("assessment_exists")?;
        Ok(inner.assessments.iter().any(|(id, _)| *id == assessment_id))
    }

    async fn create_assessment(&self, assessment: &NewAssessment) -> PortResult<Uuid> {
        self.stall_if_asked("create_assessment").await;
        let mut inner = self.enter("create_assessment")?;
        let id = Uuid::new_v4();
        inner.assessments.push((id, assessment.clone()));
        Ok(id)
    }

    async fn add_diagnosis(&self, assessment_id: Uuid, record: &DiagnosisRecord) -> PortResult<()> {
        self.stall_if_asked("add_diagnosis").await;
        let mut inner = self.enter("add_diagnosis")?;
        inner.diagnoses.push((assessment_id, record.clone()));
        Ok(())
    }

    async fn add_xray(&self, assessment_id: Uuid, record: &XrayRecord) -> PortResult<()> {
        self.stall_if_asked("add_xray").await;
        let mut inner = self.enter("add_xray")?;
        inner.xrays.push((assessment_id, stored(record.clone())));
        Ok(())
    }

    async fn add_prediction_link(
        &self,
        assessment_id: Uuid,
        link: &PredictionLink,
    ) -> PortResult<()> {
        self.stall_if_asked("add_prediction_link").await;
        let mut inner = self.enter("add_prediction_link")?;
        inner.links.push((assessment_id, stored(link.clone())));
        Ok(())
    }

    async fn list_xrays(&self, assessment_id: Uuid) -> PortResult<Vec<Stored<XrayRecord>>> {
        self.stall_if_asked("list_xrays").await;
        let inner = self.enter("list_xrays")?;
        Ok(inner
            .xrays
            .iter()
            .filter(|(id, _)| *id == assessment_id)
            .map(|(_, r)| r.clone())
            .collect())
    }

    async fn list_prediction_links(
        &self,
        assessment_id: Uuid,
    ) -> PortResult<Vec<Stored<PredictionLink>>> {
        self.stall_if_asked("list_prediction_links").await;
        let inner = self.enter("list_prediction_links")?;
        Ok(inner
            .links
            .iter()
            .filter(|(id, _)| *id == assessment_id)
            .map(|(_, r)| r.clone())
            .collect())
    }
}

//=========================================================================================
// Backend
//=========================================================================================

struct BackendInner {
    calls: Vec<String>,
    prediction_id: Option<String>,
    failing: HashSet<&'static str>,
    report_failures_left: u32,
    report: Value,
    answer: String,
    last_chat: Option<ChatRequest>,
    last_subject: Option<ReportSubject>,
}

pub struct FakeBackend {
    inner: Mutex<BackendInner>,
    chat_gate: Mutex<Option<Arc<Notify>>>,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self {
            inner: Mutex::new(BackendInner {
                calls: Vec::new(),
                prediction_id: None,
                failing: HashSet::new(),
                report_failures_left: 0,
                report: json!({ "report": { "parsed": { "summary": "No acute findings." } } }),
                answer: "It is not a diagnosis.".to_string(),
                last_chat: None,
                last_subject: None,
            }),
            chat_gate: Mutex::new(None),
        }
    }
}

impl FakeBackend {
    pub fn set_prediction_id(&self, id: Option<&str>) {
        self.inner.lock().unwrap().prediction_id = id.map(str::to_string);
    }

    pub fn fail_on(&self, op: &'static str) {
        self.inner.lock().unwrap().failing.insert(op);
    }

    /// The next `n` report calls fail before one succeeds.
    pub fn fail_reports(&self, n: u32) {
        self.inner.lock().unwrap().report_failures_left = n;
    }

    pub fn set_answer(&self, answer: &str) {
        self.inner.lock().unwrap().answer = answer.to_string();
    }

    /// Chat calls wait until the returned handle is notified.
    pub fn hold_chat(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.chat_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn last_chat(&self) -> Option<ChatRequest> {
        self.inner.lock().unwrap().last_chat.clone()
    }

    pub fn last_subject(&self) -> Option<ReportSubject> {
        self.inner.lock().unwrap().last_subject.clone()
    }

    fn prediction(&self, id: Option<String>) -> Prediction {
        Prediction {
            id,
            pathologies: vec!["Pneumonia".into()],
            probabilities: vec![0.64],
            ..Default::default()
        }
    }

    fn record(&self, op: &'static str) -> PortResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(op.to_string());
        if inner.failing.contains(op) {
            return Err(PortError::Request {
                status: 500,
                body: format!("{} exploded", op),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl InferenceService for FakeBackend {
    async fn predict_xray(&self, _upload: &XrayUpload) -> PortResult<Prediction> {
        self.record("predict_xray")?;
        let id = self.inner.lock().unwrap().prediction_id.clone();
        Ok(self.prediction(id))
    }

    async fn get_prediction(&self, prediction_id: &str) -> PortResult<Prediction> {
        self.record("get_prediction")?;
        Ok(self.prediction(Some(prediction_id.to_string())))
    }

    async fn generate_report(&self, subject: &ReportSubject) -> PortResult<Report> {
        self.record("generate_report")?;
        let response = {
            let mut inner = self.inner.lock().unwrap();
            inner.last_subject = Some(subject.clone());
            if inner.report_failures_left > 0 {
                inner.report_failures_left -= 1;
                return Err(PortError::Request {
                    status: 503,
                    body: "report model busy".into(),
                });
            }
            inner.report.clone()
        };
        Report::from_response(response)
    }

    async fn chat(&self, request: &ChatRequest) -> PortResult<ChatReply> {
        self.inner.lock().unwrap().last_chat = Some(request.clone());
        let gate = self.chat_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.record("chat")?;
        Ok(ChatReply {
            answer: self.inner.lock().unwrap().answer.clone(),
        })
    }

    async fn health(&self) -> PortResult<String> {
        self.record("health")?;
        Ok("ok".into())
    }
}

//=========================================================================================
// Identity
//=========================================================================================

pub struct FakeIdentity {
    events: mpsc::UnboundedSender<Option<User>>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Option<User>>>>,
    fail_sign_out: Mutex<bool>,
}

impl Default for FakeIdentity {
    fn default() -> Self {
        let (events, receiver) = mpsc::unbounded_channel();
        Self {
            events,
            receiver: Mutex::new(Some(receiver)),
            fail_sign_out: Mutex::new(false),
        }
    }
}

impl FakeIdentity {
    /// Pushes an auth-state notification to the subscriber.
    pub fn emit(&self, user: Option<User>) {
        let _ = self.events.send(user);
    }

    pub fn fail_sign_out(&self) {
        *self.fail_sign_out.lock().unwrap() = true;
    }
}

pub fn operator() -> User {
    User {
        id: Uuid::from_u128(7),
        email: Some("nurse@clinic.test".into()),
    }
}

#[async_trait]
impl IdentityProvider for FakeIdentity {
    fn auth_state_changes(&self) -> AuthStateStream {
        let receiver = self.receiver.lock().unwrap().take();
        Box::pin(futures::stream::unfold(receiver, |receiver| async move {
            let mut receiver = receiver?;
            let item = receiver.recv().await?;
            Some((item, Some(receiver)))
        }))
    }

    async fn sign_in(&self, email: &str, password: &str) -> PortResult<User> {
        if password != "correct horse" {
            return Err(PortError::Unauthorized("Invalid email or password".into()));
        }
        let user = User {
            email: Some(email.to_string()),
            ..operator()
        };
        self.emit(Some(user.clone()));
        Ok(user)
    }

    async fn sign_out(&self) -> PortResult<()> {
        if *self.fail_sign_out.lock().unwrap() {
            return Err(unexpected("sign_out"));
        }
        self.emit(None);
        Ok(())
    }
}
