pub mod backend;
pub mod identity;
pub mod store;

pub use backend::HttpInferenceAdapter;
pub use identity::PgIdentityAdapter;
pub use store::PgAssessmentStore;
