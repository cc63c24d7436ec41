//! Document-understanding collaborator
//!
//! The model that reads checks, envelopes and deposit logs sits behind the
//! [`DocumentExtractor`] trait. The pipeline only ever sees its output as
//! [`RawExtraction`]s or a typed failure (`ExtractionFailed`,
//! `SchemaViolation`).
//!
//! # Architecture
//!
//! - `DocumentExtractor` trait: the extraction interface
//! - `ExtractorClient` enum: concrete wrapper providing Clone + compile-time dispatch
//! - Implementations: `OllamaExtractor` (local vision model over HTTP), `MockExtractor`
//!
//! # Configuration
//!
//! Environment variables:
//! - `EXTRACTION_BACKEND`: Backend to use (ollama, mock). Default: ollama
//! - `OLLAMA_HOST`: Ollama server URL (required for ollama backend)
//! - `OLLAMA_MODEL`: Text model name (default: gemma3)
//! - `OLLAMA_VISION_MODEL`: Vision model name (default: llama3.2-vision)

mod mock;
mod ollama;
pub mod parsing;

pub use mock::MockExtractor;
pub use ollama::OllamaExtractor;
pub use parsing::parse_extraction_response;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{RawExtraction, SourceDocument};
use crate::settings::ExtractionSettings;

/// Interface for document-understanding backends
///
/// Implementations must be Send + Sync so documents can be extracted
/// concurrently.
#[async_trait]
pub trait DocumentExtractor: Send + Sync {
    /// Read one document into zero or more raw extractions
    ///
    /// Multi-record documents (deposit logs) return one extraction per line.
    async fn extract(&self, document: &SourceDocument) -> Result<Vec<RawExtraction>>;

    /// Check if the backend is reachable
    async fn health_check(&self) -> bool;

    /// Get the model name (for logging)
    fn model(&self) -> &str;

    /// Get the host URL (for logging)
    fn host(&self) -> &str;
}

/// Concrete extractor enum
///
/// Provides Clone and compile-time dispatch without Box<dyn> overhead.
#[derive(Clone)]
pub enum ExtractorClient {
    /// Ollama backend (HTTP API)
    Ollama(OllamaExtractor),
    /// Canned responses for tests and offline runs
    Mock(MockExtractor),
}

impl ExtractorClient {
    /// Create an extractor from environment variables
    ///
    /// Checks `EXTRACTION_BACKEND` to determine which backend to use:
    /// - `ollama` (default): Uses OLLAMA_HOST, OLLAMA_MODEL and OLLAMA_VISION_MODEL
    /// - `mock`: Creates a mock extractor
    ///
    /// Returns None if the required environment variables are not set.
    pub fn from_env() -> Option<Self> {
        let backend = std::env::var("EXTRACTION_BACKEND").unwrap_or_else(|_| "ollama".to_string());

        match backend.to_lowercase().as_str() {
            "ollama" => OllamaExtractor::from_env().map(ExtractorClient::Ollama),
            "mock" => Some(ExtractorClient::Mock(MockExtractor::new())),
            _ => {
                tracing::warn!(backend = %backend, "Unknown EXTRACTION_BACKEND, falling back to ollama");
                OllamaExtractor::from_env().map(ExtractorClient::Ollama)
            }
        }
    }

    /// Create an Ollama extractor directly
    pub fn ollama(host: &str, model: &str) -> Self {
        ExtractorClient::Ollama(OllamaExtractor::new(host, model))
    }

    pub fn mock() -> Self {
        ExtractorClient::Mock(MockExtractor::new())
    }

    /// Create a new instance with a different text model
    pub fn with_model(&self, model: &str) -> Self {
        match self {
            ExtractorClient::Ollama(e) => ExtractorClient::Ollama(e.with_model(model)),
            ExtractorClient::Mock(e) => ExtractorClient::Mock(e.with_model(model)),
        }
    }

    /// Apply model names and timeout from settings
    pub fn with_settings(&self, settings: &ExtractionSettings) -> Self {
        match self {
            ExtractorClient::Ollama(e) => ExtractorClient::Ollama(e.with_settings(settings)),
            ExtractorClient::Mock(e) => ExtractorClient::Mock(e.clone()),
        }
    }
}

#[async_trait]
impl DocumentExtractor for ExtractorClient {
    async fn extract(&self, document: &SourceDocument) -> Result<Vec<RawExtraction>> {
        match self {
            ExtractorClient::Ollama(e) => e.extract(document).await,
            ExtractorClient::Mock(e) => e.extract(document).await,
        }
    }

    async fn health_check(&self) -> bool {
        match self {
            ExtractorClient::Ollama(e) => e.health_check().await,
            ExtractorClient::Mock(e) => e.health_check().await,
        }
    }

    fn model(&self) -> &str {
        match self {
            ExtractorClient::Ollama(e) => e.model(),
            ExtractorClient::Mock(e) => e.model(),
        }
    }

    fn host(&self) -> &str {
        match self {
            ExtractorClient::Ollama(e) => e.host(),
            ExtractorClient::Mock(e) => e.host(),
        }
    }
}
