//! crates/triage_core/src/results.rs
//!
//! The results view: assembles an assessment's prediction, X-ray image and
//! report from several remote calls that complete at unpredictable times,
//! and hosts the follow-up chat.
//!
//! Stages, each with its own loading/error state:
//! - A: read the assessment's prediction link and fetch the prediction;
//!   independently read its X-ray records for an image URL.
//! - B: once a prediction is present, generate the report (bounded retry).
//! - C: extract a structured object from the report (memoised on the report).
//! - D: the readiness gate that lifts the full-page spinner.
//!
//! All state lives in one `watch` cell, so every stage update is a single
//! atomic replacement that observers see as a whole.

use crate::domain::{ChatMessage, ChatRequest, Prediction, Sender};
use crate::ports::{AssessmentStore, InferenceService, PortError, PortResult, ReportSubject};
use crate::report::{Extraction, Report};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const PREDICTION_LOOKUP_FAILED: &str = "Backend prediction not found or failed";
pub const ASSESSMENT_LOAD_FAILED: &str = "Assessment load failed";
const EMPTY_ANSWER: &str = "No reply.";

//=========================================================================================
// Retry Policy
//=========================================================================================

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first; `1` disables retrying.
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry that follows failed attempt `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }

    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> PortResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = PortResult<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < attempts => {
                    let delay = self.delay_after(attempt);
                    warn!(
                        "{} failed (attempt {}/{}): {}. Retrying in {:?}.",
                        label, attempt, attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

//=========================================================================================
// View State
//=========================================================================================

/// What the intake (or upload) step hands to the results view.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NavigationState {
    pub assessment_id: Option<Uuid>,
    pub prediction_full: Option<Prediction>,
    pub report_full: Option<Report>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultState {
    pub assessment_id: Option<Uuid>,
    pub prediction: Option<Prediction>,
    pub pred_loading: bool,
    /// Shared by both Stage A lookups; the first error recorded wins.
    pub pred_error: Option<String>,
    pub image_url: Option<String>,
    pub report: Option<Report>,
    pub report_loading: bool,
    pub report_error: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub chat_loading: bool,
    pub chat_error: Option<String>,
}

impl ResultState {
    /// The readiness gate. Any error counts as grounds to stop blocking.
    pub fn is_ready(&self) -> bool {
        let any_error = self.pred_error.is_some() || self.chat_error.is_some();
        let image_side = self.image_url.is_some() || any_error;
        let report_side = self.report.is_some() || self.report_error.is_some() || any_error;
        image_side && report_side
    }

    pub fn extraction(&self) -> Option<&Extraction> {
        self.report.as_ref().map(Report::extraction)
    }

    fn record_lookup_error(&mut self, message: &str) {
        if self.pred_error.is_none() {
            self.pred_error = Some(message.to_string());
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatOutcome {
    Answered,
    Failed,
    /// Blank input; nothing was sent.
    Ignored,
    /// A previous message is still awaiting its answer.
    Busy,
}

//=========================================================================================
// The View
//=========================================================================================

pub struct ResultView {
    state: watch::Sender<ResultState>,
    backend: Arc<dyn InferenceService>,
    store: Arc<dyn AssessmentStore>,
    retry: RetryPolicy,
    next_message_id: AtomicU64,
}

impl ResultView {
    pub fn open(
        navigation: NavigationState,
        backend: Arc<dyn InferenceService>,
        store: Arc<dyn AssessmentStore>,
        retry: RetryPolicy,
    ) -> Self {
        let (state, _) = watch::channel(ResultState {
            assessment_id: navigation.assessment_id,
            prediction: navigation.prediction_full,
            report: navigation.report_full,
            ..Default::default()
        });
        Self {
            state,
            backend,
            store,
            retry,
            next_message_id: AtomicU64::new(1),
        }
    }

    pub fn snapshot(&self) -> ResultState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ResultState> {
        self.state.subscribe()
    }

    pub fn assessment_id(&self) -> Option<Uuid> {
        self.state.borrow().assessment_id
    }

    /// Runs stages A and B to completion. Failures end up in the view state.
    pub async fn load(&self) {
        if let Some(assessment_id) = self.assessment_id() {
            tokio::join!(
                self.resolve_prediction(assessment_id),
                self.resolve_image(assessment_id)
            );
        }
        self.ensure_report().await;
    }

    async fn resolve_prediction(&self, assessment_id: Uuid) {
        if self.state.borrow().prediction.is_some() {
            return;
        }
        self.state.send_modify(|s| s.pred_loading = true);

        let outcome = match self.store.list_prediction_links(assessment_id).await {
            Ok(links) => {
                let prediction_id = links.into_iter().find_map(|l| l.body.prediction_id);
                match prediction_id {
                    Some(prediction_id) => self
                        .backend
                        .get_prediction(&prediction_id)
                        .await
                        .map(Some)
                        .map_err(|e| {
                            error!("Prediction {} lookup failed: {}", prediction_id, e);
                            PREDICTION_LOOKUP_FAILED
                        }),
                    None => {
                        info!("Assessment {} has no backend prediction yet.", assessment_id);
                        Ok(None)
                    }
                }
            }
            Err(e) => {
                error!("Reading predictions of assessment {} failed: {}", assessment_id, e);
                Err(ASSESSMENT_LOAD_FAILED)
            }
        };

        self.state.send_modify(|s| {
            s.pred_loading = false;
            match outcome {
                Ok(Some(prediction)) => s.prediction = Some(prediction),
                Ok(None) => {}
                Err(message) => {
                    s.prediction = None;
                    s.record_lookup_error(message);
                }
            }
        });
    }

    async fn resolve_image(&self, assessment_id: Uuid) {
        match self.store.list_xrays(assessment_id).await {
            Ok(records) => {
                if let Some(url) = records.into_iter().find_map(|r| r.body.image_url) {
                    self.state.send_modify(|s| s.image_url = Some(url));
                }
            }
            Err(e) => {
                error!("Reading X-rays of assessment {} failed: {}", assessment_id, e);
                self.state
                    .send_modify(|s| s.record_lookup_error(ASSESSMENT_LOAD_FAILED));
            }
        }
    }

    /// Stage B. Generates a report from the full prediction payload when a
    /// prediction is present and no report exists or is being generated.
    pub async fn ensure_report(&self) {
        let mut prediction = None;
        self.state.send_if_modified(|s| {
            if s.report.is_some() || s.report_loading {
                return false;
            }
            match &s.prediction {
                Some(p) => {
                    prediction = Some(p.clone());
                    s.report_loading = true;
                    s.report_error = None;
                    true
                }
                None => false,
            }
        });
        let Some(prediction) = prediction else {
            return;
        };

        let subject = ReportSubject::Inline { prediction };
        let result = self
            .retry
            .run("Report generation", || self.backend.generate_report(&subject))
            .await;

        self.state.send_modify(|s| {
            s.report_loading = false;
            match result {
                Ok(report) => {
                    report.extraction();
                    s.report = Some(report);
                }
                Err(e) => {
                    error!("Report generation failed: {}", e);
                    s.report_error = Some(format!("Report generation failed: {}", e));
                }
            }
        });
    }

    /// Sends a chat message. The user's line is shown immediately and stays
    /// in the transcript whatever the outcome of the call.
    pub async fn send_chat(&self, text: &str) -> ChatOutcome {
        let text = text.trim();
        if text.is_empty() {
            return ChatOutcome::Ignored;
        }

        let mut request = None;
        self.state.send_if_modified(|s| {
            if s.chat_loading {
                return false;
            }
            s.messages.push(ChatMessage {
                id: self.next_message_id.fetch_add(1, Ordering::Relaxed),
                from: Sender::User,
                text: text.to_string(),
            });
            s.chat_loading = true;
            s.chat_error = None;
            request = Some(ChatRequest {
                message: text.to_string(),
                prediction_id: s.prediction.as_ref().and_then(|p| p.id.clone()),
                report: s.report.as_ref().map(Report::to_value),
            });
            true
        });
        let Some(request) = request else {
            return ChatOutcome::Busy;
        };

        let result = self.backend.chat(&request).await;

        let mut outcome = ChatOutcome::Answered;
        self.state.send_modify(|s| {
            s.chat_loading = false;
            match result {
                Ok(reply) => {
                    let answer = reply.answer.trim();
                    s.messages.push(ChatMessage {
                        id: self.next_message_id.fetch_add(1, Ordering::Relaxed),
                        from: Sender::System,
                        text: if answer.is_empty() {
                            EMPTY_ANSWER.to_string()
                        } else {
                            answer.to_string()
                        },
                    });
                }
                Err(e) => {
                    warn!("Chat call failed: {}", e);
                    s.chat_error = Some(chat_error_message(&e));
                    outcome = ChatOutcome::Failed;
                }
            }
        });
        outcome
    }
}

fn chat_error_message(e: &PortError) -> String {
    let detail = e.to_string();
    if detail.trim().is_empty() {
        "Chat failed: Unknown error".to_string()
    } else {
        format!("Chat failed: {}", detail)
    }
}
