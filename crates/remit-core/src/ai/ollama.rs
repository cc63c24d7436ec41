//! Ollama extraction backend
//!
//! Sends each document to a local Ollama server: scanned pages go to the
//! vision model with the page attached, text documents go to the text model.
//! The prompt is chosen by the document's source kind from the prompt library.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::models::{DocumentContent, RawExtraction, SourceDocument};
use crate::prompts::{PromptId, PromptLibrary};
use crate::settings::ExtractionSettings;

use super::parsing::parse_extraction_response;
use super::DocumentExtractor;

/// Ollama extractor
///
/// Configure models via `~/.local/share/remit/config/remit.toml`:
///
/// ```toml
/// [extraction]
/// model = "gemma3"
/// vision_model = "llama3.2-vision:11b"
/// timeout_secs = 180
/// ```
pub struct OllamaExtractor {
    http_client: Client,
    base_url: String,
    default_model: String,
    vision_model: String,
    timeout: Duration,
    prompts: Arc<RwLock<PromptLibrary>>,
}

impl Clone for OllamaExtractor {
    fn clone(&self) -> Self {
        Self {
            http_client: self.http_client.clone(),
            base_url: self.base_url.clone(),
            default_model: self.default_model.clone(),
            vision_model: self.vision_model.clone(),
            timeout: self.timeout,
            prompts: self.prompts.clone(),
        }
    }
}

impl OllamaExtractor {
    /// Create a new Ollama extractor
    pub fn new(base_url: &str, default_model: &str) -> Self {
        let defaults = ExtractionSettings::default();
        Self {
            http_client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            default_model: default_model.to_string(),
            vision_model: defaults.vision_model,
            timeout: defaults.timeout,
            prompts: Arc::new(RwLock::new(PromptLibrary::new())),
        }
    }

    /// Create a new instance with a different text model
    pub fn with_model(&self, model: &str) -> Self {
        Self {
            default_model: model.to_string(),
            ..self.clone()
        }
    }

    pub fn with_vision_model(&self, model: &str) -> Self {
        Self {
            vision_model: model.to_string(),
            ..self.clone()
        }
    }

    /// Apply model names and request timeout
    pub fn with_settings(&self, settings: &ExtractionSettings) -> Self {
        Self {
            default_model: settings.model.clone(),
            vision_model: settings.vision_model.clone(),
            timeout: settings.timeout,
            ..self.clone()
        }
    }

    /// Use a specific prompt library (tests, custom override dirs)
    pub fn with_prompts(&self, prompts: PromptLibrary) -> Self {
        Self {
            prompts: Arc::new(RwLock::new(prompts)),
            ..self.clone()
        }
    }

    /// Create from environment variables
    pub fn from_env() -> Option<Self> {
        let host = std::env::var("OLLAMA_HOST").ok()?;
        let model = std::env::var("OLLAMA_MODEL").unwrap_or_else(|_| "gemma3".to_string());
        let extractor = Self::new(&host, &model);
        Some(match std::env::var("OLLAMA_VISION_MODEL") {
            Ok(vision) => extractor.with_vision_model(&vision),
            Err(_) => extractor,
        })
    }

    fn render_prompt(&self, document: &SourceDocument, document_text: &str) -> Result<String> {
        let mut prompts = self
            .prompts
            .write()
            .map_err(|_| Error::InvalidData("Failed to acquire prompt library lock".into()))?;
        let template = prompts.get(PromptId::for_kind(document.kind_hint))?;
        let mut vars = HashMap::new();
        vars.insert("source_kind", document.kind_hint.as_str());
        vars.insert("document_text", document_text);
        Ok(template.render_full(&vars))
    }

    async fn generate(&self, document: &SourceDocument, request: &impl Serialize) -> Result<String> {
        let failed = |reason: String| Error::ExtractionFailed {
            document: document.id.clone(),
            reason,
        };

        let response = self
            .http_client
            .post(format!("{}/api/generate", self.base_url))
            .timeout(self.timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| failed(format!("request to {} failed: {}", self.base_url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(failed(format!("Ollama returned {}: {}", status, body.trim())));
        }

        let ollama_response: OllamaResponse = response
            .json()
            .await
            .map_err(|e| failed(format!("unreadable Ollama response: {}", e)))?;
        Ok(ollama_response.response)
    }
}

/// Request to Ollama API
#[derive(Debug, Serialize)]
struct OllamaRequest {
    model: String,
    prompt: String,
    stream: bool,
    format: &'static str,
}

/// Request to Ollama API with images (for vision models)
#[derive(Debug, Serialize)]
struct OllamaVisionRequest {
    model: String,
    prompt: String,
    images: Vec<String>,
    stream: bool,
    format: &'static str,
}

/// Response from Ollama API
#[derive(Debug, Deserialize)]
struct OllamaResponse {
    response: String,
}

#[async_trait]
impl DocumentExtractor for OllamaExtractor {
    async fn extract(&self, document: &SourceDocument) -> Result<Vec<RawExtraction>> {
        let response = match &document.content {
            DocumentContent::Image(bytes) => {
                let request = OllamaVisionRequest {
                    model: self.vision_model.clone(),
                    prompt: self.render_prompt(document, "")?,
                    images: vec![base64::engine::general_purpose::STANDARD.encode(bytes)],
                    stream: false,
                    format: "json",
                };
                debug!(document = %document.id, model = %request.model, "Sending page to vision model");
                self.generate(document, &request).await?
            }
            DocumentContent::Text(text) => {
                let document_text = format!("Document text:\n{}", text);
                let request = OllamaRequest {
                    model: self.default_model.clone(),
                    prompt: self.render_prompt(document, &document_text)?,
                    stream: false,
                    format: "json",
                };
                debug!(document = %document.id, model = %request.model, "Sending text to model");
                self.generate(document, &request).await?
            }
            DocumentContent::Csv(_) | DocumentContent::ExtractionJson(_) => {
                return Err(Error::ExtractionFailed {
                    document: document.id.clone(),
                    reason: "CSV and pre-extracted documents are not sent to the model".into(),
                });
            }
        };

        debug!(document = %document.id, "Ollama extraction response: {}", response);

        let records = parse_extraction_response(&document.id, document.kind_hint, &response, Utc::now());
        if let Err(ref e) = records {
            warn!(document = %document.id, error = %e, "Model output did not fit the extraction schema");
        }
        records
    }

    async fn health_check(&self) -> bool {
        match self
            .http_client
            .get(format!("{}/api/tags", self.base_url))
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    fn model(&self) -> &str {
        &self.default_model
    }

    fn host(&self) -> &str {
        &self.base_url
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SourceKind;
    use crate::test_utils::MockOllamaServer;

    fn check_image(id: &str) -> SourceDocument {
        SourceDocument {
            id: id.to_string(),
            kind_hint: SourceKind::HandwrittenCheck,
            content: DocumentContent::Image(vec![0xff, 0xd8, 0xff, 0xe0]),
        }
    }

    #[test]
    fn test_with_settings_overrides_models() {
        let extractor = OllamaExtractor::new("http://localhost:11434", "gemma3");
        let settings = ExtractionSettings {
            model: "qwen2.5".into(),
            vision_model: "minicpm-v".into(),
            timeout: Duration::from_secs(5),
            concurrency: 2,
        };
        let configured = extractor.with_settings(&settings);
        assert_eq!(configured.model(), "qwen2.5");
        assert_eq!(configured.vision_model, "minicpm-v");
        assert_eq!(configured.timeout, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_extracts_check_image_over_http() {
        let server = MockOllamaServer::start().await;
        let extractor = OllamaExtractor::new(&server.url(), "gemma3")
            .with_prompts(PromptLibrary::embedded_only());

        assert!(extractor.health_check().await);

        let records = extractor.extract(&check_image("check-4531.jpg")).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].payment.check_no_or_ref.as_deref(), Some("4531"));
        assert_eq!(records[0].provenance.document_id, "check-4531.jpg");
        assert_eq!(records[0].source_kind, SourceKind::HandwrittenCheck);
    }

    #[tokio::test]
    async fn test_ledger_text_returns_one_record_per_line() {
        let server = MockOllamaServer::start().await;
        let extractor = OllamaExtractor::new(&server.url(), "gemma3")
            .with_prompts(PromptLibrary::embedded_only());

        let document = SourceDocument {
            id: "deposit-0208.txt".into(),
            kind_hint: SourceKind::LedgerEntry,
            content: DocumentContent::Text("4531 1500.00\n1042 40.00".into()),
        };
        let records = extractor.extract(&document).await.unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.source_kind == SourceKind::LedgerEntry));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_extraction_failure() {
        let extractor = OllamaExtractor::new("http://127.0.0.1:9", "gemma3")
            .with_prompts(PromptLibrary::embedded_only());
        assert!(!extractor.health_check().await);

        let err = extractor.extract(&check_image("lost.jpg")).await.unwrap_err();
        assert!(matches!(err, Error::ExtractionFailed { ref document, .. } if document == "lost.jpg"));
    }

    #[tokio::test]
    async fn test_csv_is_not_sent_to_model() {
        let extractor = OllamaExtractor::new("http://127.0.0.1:9", "gemma3");
        let document = SourceDocument {
            id: "stripe.csv".into(),
            kind_hint: SourceKind::OnlinePayment,
            content: DocumentContent::Csv("id,Amount\n".into()),
        };
        assert!(matches!(
            extractor.extract(&document).await,
            Err(Error::ExtractionFailed { .. })
        ));
    }
}
