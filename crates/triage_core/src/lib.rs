pub mod domain;
pub mod intake;
pub mod ports;
pub mod report;
pub mod results;
pub mod session;
pub mod upload;

/// In-memory fakes of every port, for tests here and in dependent crates.
#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use domain::{
    ChatMessage, ChatReply, ChatRequest, DiagnosisRecord, NewAssessment, Prediction,
    PredictionLink, Sender, Stored, User, XrayRecord,
};
pub use intake::{FieldInput, FormPhase, IntakeForm, IntakeMachine, SubmitError};
pub use ports::{
    AssessmentStore, AuthStateStream, IdentityProvider, InferenceService, PortError, PortResult,
    ReportSubject,
};
pub use report::{Extraction, Report, StructuredReport};
pub use results::{ChatOutcome, NavigationState, ResultState, ResultView, RetryPolicy};
pub use session::{AuthSession, Guard, SessionState};
pub use upload::{attach_xray, UploadError, XrayUpload};
