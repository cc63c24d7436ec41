//! Remit Core Library
//!
//! Turns scanned checks, envelopes, deposit logs and online payment exports
//! into one canonical record per real payment:
//! - Extraction collaborator adapters (local vision model over Ollama, mock)
//! - Online payment CSV import
//! - Record normalization and payer alias generation
//! - Merge engine reconciling partial extractions of the same payment
//! - Identity matching against a payer directory
//! - Pipeline orchestration with batch reporting
//! - Local SQLite payer directory and review ledger
//! - Versioned interchange export

pub mod ai;
pub mod aliases;
pub mod db;
pub mod error;
pub mod export;
pub mod import;
pub mod matcher;
pub mod merge;
pub mod models;
pub mod normalize;
pub mod pipeline;
pub mod prompts;
pub mod settings;

/// Test utilities including mock Ollama server and in-memory directory
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use ai::{DocumentExtractor, ExtractorClient, MockExtractor, OllamaExtractor};
pub use db::{Database, StoredPayment};
pub use error::{Error, Result, ValidationError};
pub use export::{ExportFormat, PaymentExportV1};
pub use import::{OnlineFormat, PayerImport};
pub use matcher::{DirectoryLookup, DirectoryQuery, IdentityMatcher, MatchConfig};
pub use merge::MergeConfig;
pub use pipeline::{
    BatchCounters, BatchReport, BatchStage, CancelFlag, NoReviews, Pipeline, PriorReview,
    ReadyBatch, ReviewLedger,
};
pub use prompts::{Prompt, PromptId, PromptLibrary};
pub use settings::{ExtractionSettings, Settings};
