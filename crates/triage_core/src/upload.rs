//! crates/triage_core/src/upload.rs
//!
//! Attaching a chest X-ray to an existing assessment: the image and the
//! assessment are checked, the image is sent to the backend for inference,
//! and the assessment gains an `xray` record plus a `backendPrediction` link
//! to the result.

use crate::domain::{Prediction, PredictionLink, XrayRecord};
use crate::ports::{AssessmentStore, InferenceService, PortError};
use base64::Engine;
use bytes::Bytes;
use tracing::{info, warn};
use uuid::Uuid;

/// Upload ceiling used when the caller does not configure one.
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

const ACCEPTED_CONTENT_TYPES: [&str; 5] = [
    "image/jpeg",
    "image/jpg",
    "image/png",
    "application/dicom",
    "application/octet-stream",
];

const ACCEPTED_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "dcm"];

/// An image file as received from the operator.
#[derive(Debug, Clone)]
pub struct XrayUpload {
    pub file_name: String,
    pub content_type: Option<String>,
    pub bytes: Bytes,
}

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("Empty file")]
    Empty,
    #[error("File is larger than {max} bytes")]
    TooLarge { max: usize },
    #[error("Unsupported file type: {0}")]
    UnsupportedType(String),
    #[error("Assessment {0} not found")]
    UnknownAssessment(Uuid),
    #[error(transparent)]
    Port(#[from] PortError),
}

impl XrayUpload {
    /// Checks size and type. A file is accepted when either its declared
    /// content type or its extension is one the backend can read.
    pub fn validate(&self, max_bytes: usize) -> Result<(), UploadError> {
        if self.bytes.is_empty() {
            return Err(UploadError::Empty);
        }
        if self.bytes.len() > max_bytes {
            return Err(UploadError::TooLarge { max: max_bytes });
        }

        let type_ok = self
            .content_type
            .as_deref()
            .map(|ct| ACCEPTED_CONTENT_TYPES.contains(&ct.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        let extension_ok = self
            .extension()
            .map(|ext| ACCEPTED_EXTENSIONS.contains(&ext.as_str()))
            .unwrap_or(false);

        if type_ok || extension_ok {
            Ok(())
        } else {
            Err(UploadError::UnsupportedType(
                self.content_type
                    .clone()
                    .unwrap_or_else(|| self.file_name.clone()),
            ))
        }
    }

    /// The image as an inline `data:` URL, which is what the results view
    /// displays since the station keeps no separate image storage.
    pub fn data_url(&self) -> String {
        let media_type = match self.content_type.as_deref() {
            Some(ct) if !ct.is_empty() => ct.to_ascii_lowercase(),
            _ => match self.extension().as_deref() {
                Some("png") => "image/png".to_string(),
                Some("jpg") | Some("jpeg") => "image/jpeg".to_string(),
                Some("dcm") => "application/dicom".to_string(),
                _ => "application/octet-stream".to_string(),
            },
        };
        format!(
            "data:{};base64,{}",
            media_type,
            base64::engine::general_purpose::STANDARD.encode(&self.bytes)
        )
    }

    fn extension(&self) -> Option<String> {
        self.file_name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
    }
}

/// Runs inference on an uploaded X-ray and records it against the
/// assessment. Returns the prediction so the caller can hand it to the
/// result view without a second lookup.
pub async fn attach_xray(
    store: &dyn AssessmentStore,
    backend: &dyn InferenceService,
    assessment_id: Uuid,
    upload: &XrayUpload,
    max_bytes: usize,
) -> Result<Prediction, UploadError> {
    upload.validate(max_bytes)?;
    if !store.assessment_exists(assessment_id).await? {
        return Err(UploadError::UnknownAssessment(assessment_id));
    }

    info!(
        "Sending X-ray '{}' ({} bytes) for assessment {} to inference.",
        upload.file_name,
        upload.bytes.len(),
        assessment_id
    );
    let prediction = backend.predict_xray(upload).await?;

    let record = XrayRecord {
        placeholder: false,
        notes: String::new(),
        image_url: Some(upload.data_url()),
        file_name: Some(upload.file_name.clone()),
    };
    store.add_xray(assessment_id, &record).await?;

    match &prediction.id {
        Some(prediction_id) => {
            let link = PredictionLink {
                prediction_id: Some(prediction_id.clone()),
            };
            store.add_prediction_link(assessment_id, &link).await?;
        }
        None => warn!(
            "Backend returned a prediction without an id for assessment {}; no link recorded.",
            assessment_id
        ),
    }

    Ok(prediction)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeBackend, FakeStore};

    fn upload(name: &str, content_type: Option<&str>, len: usize) -> XrayUpload {
        XrayUpload {
            file_name: name.to_string(),
            content_type: content_type.map(str::to_string),
            bytes: Bytes::from(vec![7u8; len]),
        }
    }

    #[test]
    fn accepts_images_by_type_or_extension() {
        assert!(upload("chest.png", Some("image/png"), 10).validate(100).is_ok());
        assert!(upload("scan.DCM", None, 10).validate(100).is_ok());
        assert!(upload("blob", Some("application/octet-stream"), 10).validate(100).is_ok());

        assert!(matches!(
            upload("notes.txt", Some("text/plain"), 10).validate(100),
            Err(UploadError::UnsupportedType(t)) if t == "text/plain"
        ));
        assert!(matches!(
            upload("chest.png", Some("image/png"), 0).validate(100),
            Err(UploadError::Empty)
        ));
        assert!(matches!(
            upload("chest.png", Some("image/png"), 101).validate(100),
            Err(UploadError::TooLarge { max: 100 })
        ));
    }

    #[test]
    fn data_url_falls_back_to_the_extension() {
        let u = upload("scan.dcm", None, 3);
        assert_eq!(u.data_url(), "data:application/dicom;base64,BwcH");
    }

    #[tokio::test]
    async fn attaching_records_xray_and_prediction_link() {
        let store = FakeStore::default();
        let backend = FakeBackend::default();
        backend.set_prediction_id(Some("pred-9"));
        let id = store.seed_assessment();

        let prediction = attach_xray(
            &store,
            &backend,
            id,
            &upload("chest.jpg", Some("image/jpeg"), 32),
            DEFAULT_MAX_UPLOAD_BYTES,
        )
        .await
        .unwrap();

        assert_eq!(prediction.id.as_deref(), Some("pred-9"));
        let xrays = store.list_xrays(id).await.unwrap();
        assert_eq!(xrays.len(), 1);
        assert_eq!(xrays[0].body.file_name.as_deref(), Some("chest.jpg"));
        assert!(!xrays[0].body.placeholder);
        assert!(xrays[0]
            .body
            .image_url
            .as_deref()
            .unwrap()
            .starts_with("data:image/jpeg;base64,BwcH"));
        let links = store.list_prediction_links(id).await.unwrap();
        assert_eq!(links[0].body.prediction_id.as_deref(), Some("pred-9"));
    }

    #[tokio::test]
    async fn rejected_files_never_reach_the_backend() {
        let store = FakeStore::default();
        let backend = FakeBackend::default();

        let result = attach_xray(
            &store,
            &backend,
            Uuid::new_v4(),
            &upload("notes.txt", Some("text/plain"), 4),
            DEFAULT_MAX_UPLOAD_BYTES,
        )
        .await;

        assert!(matches!(result, Err(UploadError::UnsupportedType(_))));
        assert_eq!(backend.calls(), Vec::<String>::new());
    }

    #[tokio::test]
    async fn unknown_assessment_is_rejected_before_inference() {
        let store = FakeStore::default();
        let backend = FakeBackend::default();
        let missing = Uuid::new_v4();

        let result = attach_xray(
            &store,
            &backend,
            missing,
            &upload("chest.png", Some("image/png"), 16),
            DEFAULT_MAX_UPLOAD_BYTES,
        )
        .await;

        assert!(matches!(result, Err(UploadError::UnknownAssessment(id)) if id == missing));
        assert_eq!(backend.calls(), Vec::<String>::new());
        assert_eq!(store.log(), vec!["assessment_exists"]);
    }
}
