//! services/app/src/adapters/backend.rs
//!
//! The inference backend adapter, the concrete implementation of the
//! `InferenceService` port over HTTP using `reqwest`.
//!
//! Every call is a single round trip. A non-2xx response becomes
//! `PortError::Request` carrying the response body text.

use async_trait::async_trait;
use reqwest::{multipart, Client, Response, Url};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, error};
use triage_core::domain::{ChatReply, ChatRequest, Prediction};
use triage_core::ports::{InferenceService, PortError, PortResult, ReportSubject};
use triage_core::report::Report;
use triage_core::upload::XrayUpload;

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// An HTTP adapter that implements the `InferenceService` port.
#[derive(Clone)]
pub struct HttpInferenceAdapter {
    client: Client,
    base_url: Url,
}

impl HttpInferenceAdapter {
    /// Creates a new `HttpInferenceAdapter`. Without a timeout, calls wait
    /// as long as the backend takes.
    pub fn new(base_url: &str, timeout: Option<Duration>) -> PortResult<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| PortError::Unexpected(format!("Invalid backend URL: {}", e)))?;
        if base_url.cannot_be_a_base() {
            return Err(PortError::Unexpected(format!(
                "Backend URL {} cannot be used as a base",
                base_url
            )));
        }

        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| PortError::Unexpected(e.to_string()))?;
        Ok(Self { client, base_url })
    }

    /// Appends path segments to the base URL, escaping each one.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }
}

/// Fails with the body text on a non-2xx status, otherwise decodes JSON.
async fn read_json<T: DeserializeOwned>(response: Response) -> PortResult<T> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        error!("Backend responded {}: {}", status, body);
        return Err(PortError::Request {
            status: status.as_u16(),
            body,
        });
    }
    response
        .json::<T>()
        .await
        .map_err(|e| PortError::Unexpected(format!("Invalid backend response: {}", e)))
}

fn transport(e: reqwest::Error) -> PortError {
    error!("Backend request failed: {:?}", e);
    PortError::Unexpected(e.to_string())
}

//=========================================================================================
// `InferenceService` Trait Implementation
//=========================================================================================

#[async_trait]
impl InferenceService for HttpInferenceAdapter {
    async fn predict_xray(&self, upload: &XrayUpload) -> PortResult<Prediction> {
        let mut part = multipart::Part::bytes(upload.bytes.to_vec()).file_name(upload.file_name.clone());
        if let Some(content_type) = upload.content_type.as_deref() {
            part = part
                .mime_str(content_type)
                .map_err(|e| PortError::Unexpected(e.to_string()))?;
        }
        let form = multipart::Form::new().part("file", part);

        debug!("POST /predict ({} bytes)", upload.bytes.len());
        let response = self
            .client
            .post(self.endpoint(&["predict"]))
            .multipart(form)
            .send()
            .await
            .map_err(transport)?;
        read_json(response).await
    }

    async fn get_prediction(&self, prediction_id: &str) -> PortResult<Prediction> {
        debug!("GET /prediction/{}", prediction_id);
        let response = self
            .client
            .get(self.endpoint(&["prediction", prediction_id]))
            .send()
            .await
            .map_err(transport)?;
        read_json(response).await
    }

    async fn generate_report(&self, subject: &ReportSubject) -> PortResult<Report> {
        let response = self
            .client
            .post(self.endpoint(&["report"]))
            .json(subject)
            .send()
            .await
            .map_err(transport)?;
        let value: Value = read_json(response).await?;
        Report::from_response(value)
    }

    async fn chat(&self, request: &ChatRequest) -> PortResult<ChatReply> {
        let response = self
            .client
            .post(self.endpoint(&["chat"]))
            .json(request)
            .send()
            .await
            .map_err(transport)?;
        read_json(response).await
    }

    async fn health(&self) -> PortResult<String> {
        let response = self
            .client
            .get(self.endpoint(&["healthz"]))
            .send()
            .await
            .map_err(transport)?;
        let value: Value = read_json(response).await?;
        let status = value.get("status").and_then(Value::as_str).unwrap_or("unknown");
        Ok(match value.get("device").and_then(Value::as_str) {
            Some(device) => format!("{} ({})", status, device),
            None => status.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        extract::{Multipart, Path},
        http::StatusCode,
        response::IntoResponse,
        routing::{get, post},
        Json, Router,
    };
    use bytes::Bytes;
    use serde_json::json;

    async fn predict(mut multipart: Multipart) -> impl IntoResponse {
        while let Ok(Some(field)) = multipart.next_field().await {
            if field.name() == Some("file") {
                let file_name = field.file_name().unwrap_or_default().to_string();
                let content_type = field.content_type().unwrap_or_default().to_string();
                let data = field.bytes().await.unwrap();
                return Json(json!({
                    "id": 17,
                    "pathologies": ["Effusion", "Pneumonia"],
                    "probabilities": [0.1, 0.7],
                    "file_name": file_name,
                    "content_type": content_type,
                    "size": data.len(),
                }))
                .into_response();
            }
        }
        (StatusCode::UNPROCESSABLE_ENTITY, "file field missing").into_response()
    }

    async fn prediction(Path(id): Path<String>) -> impl IntoResponse {
        if id == "missing one" {
            return (StatusCode::NOT_FOUND, "prediction 'missing one' not found").into_response();
        }
        Json(json!({ "id": id, "pathologies": ["Pneumonia"], "probabilities": [0.5] })).into_response()
    }

    async fn report(Json(body): Json<Value>) -> impl IntoResponse {
        Json(json!({
            "report": {
                "raw": "```json\n{\"summary\": \"Right lower lobe opacity.\"}\n```",
                "context": body.to_string(),
            }
        }))
    }

    async fn chat(Json(body): Json<Value>) -> impl IntoResponse {
        if body["message"] == "fail" {
            return (StatusCode::BAD_GATEWAY, "chat model offline").into_response();
        }
        Json(json!({
            "answer": format!(
                "{} / {} / {}",
                body["message"].as_str().unwrap_or_default(),
                body.get("prediction_id").map(|v| v.to_string()).unwrap_or_else(|| "-".into()),
                body.get("report").is_some(),
            )
        }))
        .into_response()
    }

    async fn stub_backend() -> HttpInferenceAdapter {
        let app = Router::new()
            .route("/api/predict", post(predict))
            .route("/api/prediction/{id}", get(prediction))
            .route("/api/report", post(report))
            .route("/api/chat", post(chat))
            .route(
                "/api/healthz",
                get(|| async { Json(json!({ "status": "ok", "device": "cpu" })) }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        HttpInferenceAdapter::new(&format!("http://{}/api/", addr), Some(Duration::from_secs(5)))
            .unwrap()
    }

    #[tokio::test]
    async fn predict_sends_the_file_as_multipart() {
        let backend = stub_backend().await;
        let upload = XrayUpload {
            file_name: "chest.png".into(),
            content_type: Some("image/png".into()),
            bytes: Bytes::from_static(b"\x89PNG fake"),
        };

        let prediction = backend.predict_xray(&upload).await.unwrap();

        assert_eq!(prediction.id.as_deref(), Some("17"));
        assert_eq!(prediction.probability_of("Pneumonia"), Some(0.7));
        assert_eq!(prediction.extra["file_name"], "chest.png");
        assert_eq!(prediction.extra["content_type"], "image/png");
        assert_eq!(prediction.extra["size"], 9);
    }

    #[tokio::test]
    async fn prediction_ids_are_escaped_and_errors_carry_the_body() {
        let backend = stub_backend().await;

        let found = backend.get_prediction("abc-1").await.unwrap();
        assert_eq!(found.id.as_deref(), Some("abc-1"));

        let err = backend.get_prediction("missing one").await.unwrap_err();
        assert_eq!(
            err,
            PortError::Request {
                status: 404,
                body: "prediction 'missing one' not found".into()
            }
        );
        assert_eq!(err.to_string(), "prediction 'missing one' not found");
    }

    #[tokio::test]
    async fn report_is_unwrapped_and_sent_with_the_full_prediction() {
        let backend = stub_backend().await;
        let subject = ReportSubject::Inline {
            prediction: Prediction {
                id: Some("p-3".into()),
                ..Default::default()
            },
        };

        let report = backend.generate_report(&subject).await.unwrap();

        let sent: Value = serde_json::from_str(report.context().unwrap()).unwrap();
        assert_eq!(sent["prediction"]["id"], "p-3");
        assert!(sent.get("prediction_id").is_none());
        assert_eq!(
            report.extraction().structured().and_then(|s| s.summary()),
            Some("Right lower lobe opacity.")
        );
    }

    #[tokio::test]
    async fn chat_omits_absent_fields() {
        let backend = stub_backend().await;

        let reply = backend
            .chat(&ChatRequest {
                message: "hello".into(),
                prediction_id: None,
                report: None,
            })
            .await
            .unwrap();
        assert_eq!(reply.answer, "hello / - / false");

        let reply = backend
            .chat(&ChatRequest {
                message: "again".into(),
                prediction_id: Some("p-3".into()),
                report: Some(json!({ "raw": "x" })),
            })
            .await
            .unwrap();
        assert_eq!(reply.answer, "again / \"p-3\" / true");

        let err = backend
            .chat(&ChatRequest {
                message: "fail".into(),
                prediction_id: None,
                report: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "chat model offline");
    }

    #[tokio::test]
    async fn health_reports_status_and_device() {
        let backend = stub_backend().await;
        assert_eq!(backend.health().await.unwrap(), "ok (cpu)");
    }

    #[test]
    fn rejects_unusable_base_urls() {
        assert!(HttpInferenceAdapter::new("not a url", None).is_err());
        assert!(HttpInferenceAdapter::new("mailto:ops@clinic.test", None).is_err());
    }
}
