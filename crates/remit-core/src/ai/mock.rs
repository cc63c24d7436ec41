//! Mock extractor for testing
//!
//! Returns canned extractions per document id. Text documents without a
//! canned response are read as extraction JSON, which makes the mock usable
//! for offline runs over hand-transcribed documents.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Utc;

use crate::error::{Error, Result};
use crate::models::{DocumentContent, RawExtraction, SourceDocument};

use super::parsing::parse_extraction_response;
use super::DocumentExtractor;

#[derive(Debug, Clone)]
enum CannedResponse {
    Records(Vec<RawExtraction>),
    /// Model output text, run through schema validation
    Output(String),
    Failure(String),
}

/// Mock extractor for testing
///
/// Clones share their canned responses and call counter.
#[derive(Clone)]
pub struct MockExtractor {
    /// Whether health_check should return true
    pub healthy: bool,
    responses: Arc<RwLock<HashMap<String, CannedResponse>>>,
    calls: Arc<AtomicUsize>,
}

impl Default for MockExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl MockExtractor {
    /// Create a new mock extractor (healthy by default)
    pub fn new() -> Self {
        Self {
            healthy: true,
            responses: Arc::new(RwLock::new(HashMap::new())),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn unhealthy() -> Self {
        Self {
            healthy: false,
            ..Self::new()
        }
    }

    /// Create a new instance with a different model (no-op for mock)
    pub fn with_model(&self, _model: &str) -> Self {
        self.clone()
    }

    /// Return these records for the document
    pub fn prime(&self, document_id: &str, records: Vec<RawExtraction>) {
        self.set(document_id, CannedResponse::Records(records));
    }

    /// Return this model output for the document (validated like a real response)
    pub fn prime_output(&self, document_id: &str, output: &str) {
        self.set(document_id, CannedResponse::Output(output.to_string()));
    }

    /// Fail extraction of the document
    pub fn fail(&self, document_id: &str, reason: &str) {
        self.set(document_id, CannedResponse::Failure(reason.to_string()));
    }

    /// Number of extract calls so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn set(&self, document_id: &str, response: CannedResponse) {
        if let Ok(mut responses) = self.responses.write() {
            responses.insert(document_id.to_string(), response);
        }
    }

    fn canned(&self, document_id: &str) -> Result<Option<CannedResponse>> {
        let responses = self
            .responses
            .read()
            .map_err(|_| Error::InvalidData("Failed to acquire mock response lock".into()))?;
        Ok(responses.get(document_id).cloned())
    }
}

#[async_trait]
impl DocumentExtractor for MockExtractor {
    async fn extract(&self, document: &SourceDocument) -> Result<Vec<RawExtraction>> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        match self.canned(&document.id)? {
            Some(CannedResponse::Records(records)) => Ok(records),
            Some(CannedResponse::Output(output)) => {
                parse_extraction_response(&document.id, document.kind_hint, &output, Utc::now())
            }
            Some(CannedResponse::Failure(reason)) => Err(Error::ExtractionFailed {
                document: document.id.clone(),
                reason,
            }),
            None => match &document.content {
                DocumentContent::Text(text) => {
                    parse_extraction_response(&document.id, document.kind_hint, text, Utc::now())
                }
                _ => Err(Error::ExtractionFailed {
                    document: document.id.clone(),
                    reason: "no canned response for this document".into(),
                }),
            },
        }
    }

    async fn health_check(&self) -> bool {
        self.healthy
    }

    fn model(&self) -> &str {
        "mock"
    }

    fn host(&self) -> &str {
        "mock://localhost"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Provenance, RawPayment, SourceKind};

    fn image(id: &str) -> SourceDocument {
        SourceDocument {
            id: id.to_string(),
            kind_hint: SourceKind::PrintedCheck,
            content: DocumentContent::Image(vec![1, 2, 3]),
        }
    }

    #[tokio::test]
    async fn test_primed_records_are_returned() {
        let mock = MockExtractor::new();
        let record = RawExtraction {
            source_kind: SourceKind::PrintedCheck,
            payment: RawPayment {
                amount: Some("250.00".into()),
                check_no_or_ref: Some("000871".into()),
                ..RawPayment::default()
            },
            payer: Default::default(),
            contact: Default::default(),
            provenance: Provenance {
                document_id: "vineyard.jpg".into(),
                line: None,
                extracted_at: Utc::now(),
            },
        };
        mock.prime("vineyard.jpg", vec![record.clone()]);

        let records = mock.extract(&image("vineyard.jpg")).await.unwrap();
        assert_eq!(records, vec![record]);
        assert_eq!(mock.calls(), 1);
    }

    #[tokio::test]
    async fn test_primed_output_goes_through_schema_validation() {
        let mock = MockExtractor::new();
        mock.prime_output("bad.jpg", r#"{"payments": {"amount": 3}}"#);
        assert!(matches!(
            mock.extract(&image("bad.jpg")).await,
            Err(Error::SchemaViolation { .. })
        ));
    }

    #[tokio::test]
    async fn test_failure_and_unknown_image() {
        let mock = MockExtractor::new();
        mock.fail("blurry.jpg", "page too blurry");
        let err = mock.extract(&image("blurry.jpg")).await.unwrap_err();
        assert!(err.to_string().contains("page too blurry"));

        assert!(matches!(
            mock.extract(&image("unknown.jpg")).await,
            Err(Error::ExtractionFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let mock = MockExtractor::new();
        let clone = mock.clone();
        clone.fail("x.jpg", "nope");
        assert!(mock.extract(&image("x.jpg")).await.is_err());
        assert_eq!(clone.calls(), 1);
    }
}
