//! Batch orchestration
//!
//! A batch moves `Extracted → Normalized → Merged → Matched → Ready`. Each
//! transition consumes the previous stage and returns a new value, so a
//! caller never sees a half-transitioned batch. A [`CancelFlag`] is checked
//! around every transition; a cancelled batch returns
//! [`Error::Cancelled`] and nothing in it is reported `Ready`.
//!
//! Per-document and per-record problems are collected in the
//! [`BatchReport`]. Only structural problems (duplicate document ids, no
//! reachable extraction backend, unreadable review ledger) end the run.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::ai::{parse_extraction_response, DocumentExtractor};
use crate::error::{Error, Result, ValidationError};
use crate::import::parse_online_csv;
use crate::matcher::{DirectoryLookup, IdentityMatcher};
use crate::merge::merge_as_of;
use crate::models::{
    AddressUpdateProposal, CanonicalPayment, DocumentContent, MatchStatus, NewPayerRequest,
    PaymentRecord, RawExtraction, SourceDocument, SyncStatus,
};
use crate::normalize::normalize_all;
use crate::settings::Settings;

/// Batch state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStage {
    Extracted,
    Normalized,
    Merged,
    Matched,
    Ready,
}

impl BatchStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Extracted => "extracted",
            Self::Normalized => "normalized",
            Self::Merged => "merged",
            Self::Matched => "matched",
            Self::Ready => "ready",
        }
    }
}

impl fmt::Display for BatchStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Shared cancellation signal
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn check(&self, next: BatchStage) -> Result<()> {
        if self.is_cancelled() {
            warn!(stage = %next, "Batch cancelled");
            Err(Error::Cancelled(next.to_string()))
        } else {
            Ok(())
        }
    }
}

/// Review state recorded outside the pipeline for one canonical payment.
/// The pipeline reads it and never writes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriorReview {
    /// Version of the last stored payment
    pub version: u32,
    pub match_status: MatchStatus,
    pub payer_directory_id: Option<String>,
    /// A human looked at the address mismatch and dismissed it
    pub address_mismatch_dismissed: bool,
    /// A creation request was already sent for this payment
    pub creation_requested: bool,
    pub sync_status: SyncStatus,
}

/// External record of human review and sync state
pub trait ReviewLedger: Send + Sync {
    /// Prior review state for the given fingerprints; unknown ones are absent
    fn prior_reviews(&self, fingerprints: &[String]) -> Result<HashMap<String, PriorReview>>;
}

/// Ledger with no history
pub struct NoReviews;

impl ReviewLedger for NoReviews {
    fn prior_reviews(&self, _fingerprints: &[String]) -> Result<HashMap<String, PriorReview>> {
        Ok(HashMap::new())
    }
}

/// A document the batch could not read
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentFailure {
    pub document_id: String,
    pub reason: String,
}

/// Run counters; audit output only
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchCounters {
    pub documents: usize,
    pub extraction_failed: usize,
    /// Raw extractions produced by all documents
    pub raw: usize,
    pub valid: usize,
    pub invalid: usize,
    pub canonical: usize,
    /// Raw extractions minus canonical payments; invalid records count here too
    pub duplicates_collapsed: usize,
    /// Valid records folded into another record's payment
    pub records_merged: usize,
    /// Canonical payments carrying at least one flag
    pub flagged: usize,
    pub matched: usize,
    pub address_mismatch: usize,
    pub new: usize,
    pub rejected: usize,
    pub unmatched: usize,
}

/// Everything a batch reports besides its payments
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub stage: BatchStage,
    pub counters: BatchCounters,
    pub failures: Vec<DocumentFailure>,
    /// Records excluded from the canonical output, with reasons
    pub invalid: Vec<ValidationError>,
    /// Batch-level problems (directory unavailable)
    pub warnings: Vec<String>,
    pub new_payers: Vec<NewPayerRequest>,
    pub address_updates: Vec<AddressUpdateProposal>,
}

impl BatchReport {
    fn new() -> Self {
        Self {
            stage: BatchStage::Extracted,
            counters: BatchCounters::default(),
            failures: Vec::new(),
            invalid: Vec::new(),
            warnings: Vec::new(),
            new_payers: Vec::new(),
            address_updates: Vec::new(),
        }
    }
}

pub struct ExtractedBatch {
    pub raw: Vec<RawExtraction>,
    pub report: BatchReport,
}

pub struct NormalizedBatch {
    pub records: Vec<PaymentRecord>,
    pub report: BatchReport,
}

pub struct MergedBatch {
    pub payments: Vec<CanonicalPayment>,
    pub report: BatchReport,
}

pub struct MatchedBatch {
    pub payments: Vec<CanonicalPayment>,
    pub report: BatchReport,
}

/// Final batch: stable, versioned payments for the sync collaborator
#[derive(Debug, Clone, Serialize)]
pub struct ReadyBatch {
    pub payments: Vec<CanonicalPayment>,
    pub report: BatchReport,
}

impl ReadyBatch {
    /// One human-readable line per excluded, failed, flagged or rejected item
    pub fn issues(&self) -> Vec<String> {
        let mut lines: Vec<String> = self
            .report
            .failures
            .iter()
            .map(|f| format!("{}: {}", f.document_id, f.reason))
            .collect();
        lines.extend(self.report.invalid.iter().map(|e| e.to_string()));
        lines.extend(self.report.warnings.iter().cloned());

        for payment in &self.payments {
            let name = payment.display_name().unwrap_or("unknown payer");
            for flag in &payment.flags {
                lines.push(format!("{} ({}): {}", payment.fingerprint, name, flag.describe()));
            }
            if let Some(ref reason) = payment.review_reason {
                if matches!(
                    payment.match_status,
                    MatchStatus::Rejected | MatchStatus::MatchedAddressMismatch
                ) {
                    lines.push(format!("{} ({}): {}", payment.fingerprint, name, reason));
                }
            }
        }
        lines
    }
}

/// Batch orchestrator
pub struct Pipeline {
    settings: Settings,
    cancel: CancelFlag,
    /// Date used when a payment has no date at all
    today: Option<NaiveDate>,
}

impl Pipeline {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            cancel: CancelFlag::new(),
            today: None,
        }
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Fix "today" for reproducible runs
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = Some(today);
        self
    }

    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Run every stage
    pub async fn run<E>(
        &self,
        documents: Vec<SourceDocument>,
        extractor: Option<&E>,
        directory: &dyn DirectoryLookup,
        ledger: &dyn ReviewLedger,
    ) -> Result<ReadyBatch>
    where
        E: DocumentExtractor + ?Sized,
    {
        let extracted = self.ingest(documents, extractor).await?;
        let normalized = self.normalize(extracted)?;
        let merged = self.merge(normalized)?;
        let matched = self.match_payers(merged, directory, ledger).await?;
        self.finalize(matched)
    }

    /// Read every document into raw extractions
    ///
    /// CSV exports go through the importer, pre-extracted JSON through the
    /// schema validator, and images and text through the extractor. Up to
    /// `extraction.concurrency` documents are read at once; completion
    /// order does not matter because results are sorted by document id.
    pub async fn ingest<E>(
        &self,
        documents: Vec<SourceDocument>,
        extractor: Option<&E>,
    ) -> Result<ExtractedBatch>
    where
        E: DocumentExtractor + ?Sized,
    {
        self.cancel.check(BatchStage::Extracted)?;

        let mut seen = HashSet::new();
        for document in &documents {
            if !seen.insert(document.id.as_str()) {
                return Err(Error::InvalidData(format!(
                    "Document id '{}' appears more than once in the batch",
                    document.id
                )));
            }
        }

        let needs_model = documents
            .iter()
            .filter(|d| matches!(d.content, DocumentContent::Image(_) | DocumentContent::Text(_)))
            .count();
        if needs_model > 0 {
            match extractor {
                None => {
                    return Err(Error::InvalidData(format!(
                        "{} document(s) need an extraction backend but none is configured",
                        needs_model
                    )))
                }
                Some(extractor) if !extractor.health_check().await => {
                    return Err(Error::ExtractionFailed {
                        document: "batch".to_string(),
                        reason: format!(
                            "extraction backend at {} is unreachable",
                            extractor.host()
                        ),
                    });
                }
                Some(_) => {}
            }
        }

        let mut report = BatchReport::new();
        report.counters.documents = documents.len();
        let concurrency = self.settings.extraction.concurrency.max(1);

        let mut results: Vec<(String, Result<Vec<RawExtraction>>)> = stream::iter(documents)
            .map(|document| async move {
                let result = read_document(&document, extractor).await;
                (document.id, result)
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;
        results.sort_by(|a, b| a.0.cmp(&b.0));

        self.cancel.check(BatchStage::Extracted)?;

        let mut raw = Vec::new();
        for (document_id, result) in results {
            match result {
                Ok(mut records) => {
                    number_lines(&document_id, &mut records);
                    debug!(document = %document_id, records = records.len(), "Document read");
                    raw.extend(records);
                }
                Err(e) => {
                    warn!(document = %document_id, error = %e, "Document could not be read");
                    report.failures.push(DocumentFailure {
                        document_id,
                        reason: failure_reason(&e),
                    });
                }
            }
        }

        report.counters.extraction_failed = report.failures.len();
        report.counters.raw = raw.len();
        report.stage = BatchStage::Extracted;
        info!(
            documents = report.counters.documents,
            raw = report.counters.raw,
            failed = report.counters.extraction_failed,
            "Batch extracted"
        );

        Ok(ExtractedBatch { raw, report })
    }

    /// Normalize every raw extraction; failures go to the invalid bucket
    pub fn normalize(&self, batch: ExtractedBatch) -> Result<NormalizedBatch> {
        self.cancel.check(BatchStage::Normalized)?;

        let ExtractedBatch { raw, mut report } = batch;
        let (records, invalid) = normalize_all(&raw);

        for error in &invalid {
            debug!(document = %error.document_id, line = ?error.line, field = %error.field, reason = %error.reason, "Record excluded");
        }

        report.counters.valid = records.len();
        report.counters.invalid = invalid.len();
        report.invalid = invalid;
        report.stage = BatchStage::Normalized;
        info!(
            valid = report.counters.valid,
            invalid = report.counters.invalid,
            "Batch normalized"
        );

        Ok(NormalizedBatch { records, report })
    }

    /// Merge records into canonical payments
    pub fn merge(&self, batch: NormalizedBatch) -> Result<MergedBatch> {
        self.cancel.check(BatchStage::Merged)?;

        let NormalizedBatch { records, mut report } = batch;
        let today = self.today.unwrap_or_else(|| Utc::now().date_naive());
        let payments = merge_as_of(&records, &self.settings.merge, today);

        report.counters.canonical = payments.len();
        report.counters.duplicates_collapsed = report.counters.raw.saturating_sub(payments.len());
        report.counters.records_merged = records.len().saturating_sub(payments.len());
        report.counters.flagged = payments.iter().filter(|p| !p.flags.is_empty()).count();
        report.stage = BatchStage::Merged;
        info!(
            canonical = report.counters.canonical,
            collapsed = report.counters.duplicates_collapsed,
            merged = report.counters.records_merged,
            flagged = report.counters.flagged,
            "Batch merged"
        );

        Ok(MergedBatch { payments, report })
    }

    /// Match every payment in one pass, then apply prior human review
    pub async fn match_payers(
        &self,
        batch: MergedBatch,
        directory: &dyn DirectoryLookup,
        ledger: &dyn ReviewLedger,
    ) -> Result<MatchedBatch> {
        self.cancel.check(BatchStage::Matched)?;

        let MergedBatch { payments, mut report } = batch;
        let matcher = IdentityMatcher::new(self.settings.matching.clone());
        let matched = matcher.match_batch(&payments, directory).await;

        let fingerprints: Vec<String> = matched
            .payments
            .iter()
            .map(|p| p.fingerprint.clone())
            .collect();
        let priors = ledger.prior_reviews(&fingerprints)?;

        let mut suppressed_updates = BTreeSet::new();
        let mut suppressed_creations = BTreeSet::new();
        let payments: Vec<CanonicalPayment> = matched
            .payments
            .into_iter()
            .map(|payment| match priors.get(&payment.fingerprint) {
                Some(prior) => {
                    let (payment, update_dismissed, creation_sent) = carry_forward(payment, prior);
                    if update_dismissed {
                        suppressed_updates.insert(payment.fingerprint.clone());
                    }
                    if creation_sent {
                        suppressed_creations.insert(payment.fingerprint.clone());
                    }
                    payment
                }
                None => payment,
            })
            .collect();

        self.cancel.check(BatchStage::Matched)?;

        report.new_payers = matched
            .new_payers
            .into_iter()
            .filter(|r| !suppressed_creations.contains(&r.fingerprint))
            .collect();
        report.address_updates = matched
            .address_updates
            .into_iter()
            .filter(|u| !suppressed_updates.contains(&u.fingerprint))
            .collect();
        report.warnings.extend(matched.warnings);

        let count = |status: MatchStatus| payments.iter().filter(|p| p.match_status == status).count();
        report.counters.matched = count(MatchStatus::Matched);
        report.counters.address_mismatch = count(MatchStatus::MatchedAddressMismatch);
        report.counters.new = count(MatchStatus::New);
        report.counters.rejected = count(MatchStatus::Rejected);
        report.counters.unmatched = count(MatchStatus::Unmatched);
        report.stage = BatchStage::Matched;

        info!(
            matched = report.counters.matched,
            address_mismatch = report.counters.address_mismatch,
            new = report.counters.new,
            rejected = report.counters.rejected,
            unmatched = report.counters.unmatched,
            "Batch matched"
        );

        Ok(MatchedBatch { payments, report })
    }

    /// Mark the batch ready for export
    pub fn finalize(&self, batch: MatchedBatch) -> Result<ReadyBatch> {
        self.cancel.check(BatchStage::Ready)?;

        let MatchedBatch { payments, mut report } = batch;
        report.stage = BatchStage::Ready;
        info!(payments = payments.len(), "Batch ready");
        Ok(ReadyBatch { payments, report })
    }
}

async fn read_document<E>(document: &SourceDocument, extractor: Option<&E>) -> Result<Vec<RawExtraction>>
where
    E: DocumentExtractor + ?Sized,
{
    match &document.content {
        DocumentContent::Csv(text) => parse_online_csv(text.as_bytes(), &document.id, Utc::now()),
        DocumentContent::ExtractionJson(text) => {
            parse_extraction_response(&document.id, document.kind_hint, text, Utc::now())
        }
        DocumentContent::Image(_) | DocumentContent::Text(_) => match extractor {
            Some(extractor) => extractor.extract(document).await,
            None => Err(Error::ExtractionFailed {
                document: document.id.clone(),
                reason: "no extraction backend configured".into(),
            }),
        },
    }
}

/// Give every record of a multi-record document its own line number.
/// Lines the model supplied are kept unless they are missing or repeated.
fn number_lines(document_id: &str, records: &mut [RawExtraction]) {
    if records.len() < 2 {
        return;
    }
    let mut seen = HashSet::new();
    let usable = records
        .iter()
        .all(|r| r.provenance.line.map(|l| seen.insert(l)).unwrap_or(false));
    if usable {
        return;
    }
    debug!(document = document_id, "Renumbering record lines");
    for (index, record) in records.iter_mut().enumerate() {
        record.provenance.line = Some(index as u32 + 1);
    }
}

fn failure_reason(error: &Error) -> String {
    match error {
        Error::ExtractionFailed { reason, .. } => format!("Extraction failed: {}", reason),
        Error::SchemaViolation { reason, .. } => {
            format!("Extraction output did not match the expected format: {}", reason)
        }
        other => other.to_string(),
    }
}

/// Apply prior review to a freshly matched payment.
///
/// Returns the payment plus whether its address update and its creation
/// request are already handled.
fn carry_forward(
    mut payment: CanonicalPayment,
    prior: &PriorReview,
) -> (CanonicalPayment, bool, bool) {
    payment.sync_status = prior.sync_status;

    let mut update_dismissed = false;
    if prior.address_mismatch_dismissed
        && payment.match_status == MatchStatus::MatchedAddressMismatch
        && payment.payer_directory_id == prior.payer_directory_id
    {
        payment.match_status = MatchStatus::Matched;
        payment.address_mismatch = false;
        payment.review_reason = None;
        update_dismissed = true;
    }

    let creation_sent = prior.creation_requested && payment.match_status == MatchStatus::New;

    let same_outcome = payment.match_status == prior.match_status
        && payment.payer_directory_id == prior.payer_directory_id;
    payment.version = if same_outcome {
        prior.version
    } else {
        prior.version + 1
    };

    (payment, update_dismissed, creation_sent)
}
