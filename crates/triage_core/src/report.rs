//! crates/triage_core/src/report.rs
//!
//! The triage report produced by the backend's text-generation step, and the
//! parser that turns it into a structured object.
//!
//! Backends return reports in a few shapes: a `parsed` object, a `raw` text
//! blob that may be wrapped in a Markdown code fence, or neither (for
//! example when the backend reports an `error`). Extraction tries each in
//! turn and never fails loudly; the result is computed once per report.

use crate::ports::{PortError, PortResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::OnceLock;

/// Fence openers stripped from `raw` text, longest first.
const FENCE_OPENERS: [&str; 3] = ["```json", "```JSON", "```"];
const FENCE_CLOSER: &str = "```";

/// A generated report, kept verbatim as the backend sent it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Report {
    body: Map<String, Value>,
    #[serde(skip)]
    extraction: OnceLock<Extraction>,
}

impl PartialEq for Report {
    fn eq(&self, other: &Self) -> bool {
        self.body == other.body
    }
}

impl Report {
    pub fn new(body: Map<String, Value>) -> Self {
        Self {
            body,
            extraction: OnceLock::new(),
        }
    }

    /// Interprets a `/report` response, which is either `{ "report": ... }`
    /// or the report object itself.
    pub fn from_response(value: Value) -> PortResult<Self> {
        match value {
            Value::Object(mut outer) => match outer.remove("report") {
                Some(Value::Object(inner)) => Ok(Self::new(inner)),
                Some(Value::String(text)) => {
                    let mut body = Map::new();
                    body.insert("raw".to_string(), Value::String(text));
                    Ok(Self::new(body))
                }
                Some(Value::Null) | None => Ok(Self::new(outer)),
                Some(other) => Err(PortError::Unexpected(format!(
                    "report field has unexpected type: {}",
                    other
                ))),
            },
            other => Err(PortError::Unexpected(format!(
                "report response is not an object: {}",
                other
            ))),
        }
    }

    pub fn body(&self) -> &Map<String, Value> {
        &self.body
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.body.clone())
    }

    pub fn raw(&self) -> Option<&str> {
        self.body.get("raw").and_then(Value::as_str)
    }

    pub fn disclaimer(&self) -> Option<&str> {
        self.text_field("disclaimer")
    }

    pub fn context(&self) -> Option<&str> {
        self.text_field("context")
    }

    /// An error the backend embedded in an otherwise successful response.
    pub fn error(&self) -> Option<&str> {
        self.text_field("error")
    }

    /// Structured content of the report, memoised on first use.
    pub fn extraction(&self) -> &Extraction {
        self.extraction.get_or_init(|| extract(self))
    }

    fn text_field(&self, key: &str) -> Option<&str> {
        self.body
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
    }
}

/// Outcome of structured extraction.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "report", rename_all = "snake_case")]
pub enum Extraction {
    Structured(StructuredReport),
    Unparseable,
}

impl Extraction {
    pub fn structured(&self) -> Option<&StructuredReport> {
        match self {
            Extraction::Structured(report) => Some(report),
            Extraction::Unparseable => None,
        }
    }
}

impl std::fmt::Display for Extraction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Extraction::Structured(report) => write!(f, "{}", Value::Object(report.0.clone())),
            Extraction::Unparseable => f.write_str("no structured report"),
        }
    }
}

/// The triage JSON object: `summary`, `pneumonia_assessment`,
/// `differential`, `next_steps`, `patient_friendly`, plus whatever else the
/// model emitted.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct StructuredReport(Map<String, Value>);

impl StructuredReport {
    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn summary(&self) -> Option<&str> {
        self.text("summary")
    }

    pub fn pneumonia_assessment(&self) -> Option<&str> {
        self.text("pneumonia_assessment")
    }

    /// Empty differentials are reported as absent.
    pub fn differential(&self) -> Option<&str> {
        self.text("differential")
    }

    pub fn next_steps(&self) -> Option<&str> {
        self.text("next_steps")
    }

    pub fn patient_friendly(&self) -> Option<&str> {
        self.text("patient_friendly")
    }

    fn text(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }
}

/// Derives the structured object from a report:
/// `parsed` if it is an object, else the `raw` text decoded as JSON, first
/// as-is and then with one code fence removed.
pub fn extract(report: &Report) -> Extraction {
    if let Some(Value::Object(parsed)) = report.body.get("parsed") {
        return Extraction::Structured(StructuredReport(parsed.clone()));
    }

    let Some(raw) = report.raw() else {
        return Extraction::Unparseable;
    };

    let candidate = raw.trim();
    if let Some(object) = decode_object(candidate) {
        return Extraction::Structured(StructuredReport(object));
    }

    match decode_object(strip_fence(candidate)) {
        Some(object) => Extraction::Structured(StructuredReport(object)),
        None => Extraction::Unparseable,
    }
}

fn decode_object(text: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(object)) => Some(object),
        _ => None,
    }
}

/// Removes at most one leading fence opener and one trailing fence closer.
fn strip_fence(text: &str) -> &str {
    let mut inner = text;
    if let Some(rest) = FENCE_OPENERS
        .iter()
        .find_map(|opener| inner.strip_prefix(opener))
    {
        inner = rest.trim();
    }
    if let Some(rest) = inner.strip_suffix(FENCE_CLOSER) {
        inner = rest.trim();
    }
    inner
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn report(value: Value) -> Report {
        Report::from_response(value).unwrap()
    }

    #[test]
    fn fenced_raw_text_yields_structured_report() {
        let report = report(json!({ "raw": "```json\n{\"summary\":\"ok\"}\n```" }));

        let structured = report.extraction().structured().cloned().unwrap();
        assert_eq!(structured.summary(), Some("ok"));
        assert_eq!(structured.fields(), json!({ "summary": "ok" }).as_object().unwrap());
    }

    #[test]
    fn parsed_object_wins_over_raw() {
        let report = report(json!({
            "parsed": { "summary": "from parsed", "differential": "" },
            "raw": "{\"summary\":\"from raw\"}"
        }));

        let structured = report.extraction().structured().unwrap();
        assert_eq!(structured.summary(), Some("from parsed"));
        assert_eq!(structured.differential(), None);
    }

    #[test]
    fn null_parsed_falls_back_to_raw() {
        let report = report(json!({
            "parsed": null,
            "raw": "```\n{\"next_steps\":\"clinical correlation\"}```"
        }));

        let structured = report.extraction().structured().unwrap();
        assert_eq!(structured.next_steps(), Some("clinical correlation"));
    }

    #[test]
    fn unparseable_reports_do_not_fail() {
        let no_fields = report(json!({ "context": "Model probability: Pneumonia: 0.412" }));
        assert_eq!(no_fields.extraction(), &Extraction::Unparseable);
        assert_eq!(no_fields.extraction().to_string(), "no structured report");

        let prose = report(json!({ "raw": "The lungs look clear, probably." }));
        assert_eq!(prose.extraction(), &Extraction::Unparseable);

        let array = report(json!({ "raw": "[1, 2, 3]" }));
        assert_eq!(array.extraction(), &Extraction::Unparseable);
    }

    #[test]
    fn wrapped_and_bare_responses_are_both_accepted() {
        let wrapped = report(json!({
            "prediction": { "pathologies": [] },
            "report": { "parsed": { "summary": "wrapped" }, "disclaimer": "Not a diagnosis." }
        }));
        assert_eq!(wrapped.disclaimer(), Some("Not a diagnosis."));
        assert_eq!(
            wrapped.extraction().structured().and_then(|s| s.summary()),
            Some("wrapped")
        );

        let bare = report(json!({ "error": "GEMINI_API_KEY not set", "context": "n/a" }));
        assert_eq!(bare.error(), Some("GEMINI_API_KEY not set"));
        assert_eq!(bare.extraction(), &Extraction::Unparseable);

        let text = report(json!({ "report": "{\"summary\":\"as text\"}" }));
        assert_eq!(
            text.extraction().structured().and_then(|s| s.summary()),
            Some("as text")
        );

        assert!(Report::from_response(json!("just a string")).is_err());
    }
}
