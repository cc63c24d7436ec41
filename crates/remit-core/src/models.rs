//! Domain models for Remit
//!
//! Records flow through three shapes:
//! - [`RawExtraction`]: one collaborator output (or CSV row), text fields as read
//! - [`PaymentRecord`]: one normalized extraction
//! - [`CanonicalPayment`]: one real-world payment, merged from its records

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// What kind of document a record was read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Personal check, usually filled in by hand
    HandwrittenCheck,
    /// Business/organizational check with printed fields
    PrintedCheck,
    /// Card/ACH payment from an online processor export
    OnlinePayment,
    /// Line of a handwritten deposit log or deposit slip
    LedgerEntry,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HandwrittenCheck => "handwritten_check",
            Self::PrintedCheck => "printed_check",
            Self::OnlinePayment => "online_payment",
            Self::LedgerEntry => "ledger_entry",
        }
    }

    pub fn all() -> &'static [SourceKind] {
        &[
            Self::HandwrittenCheck,
            Self::PrintedCheck,
            Self::OnlinePayment,
            Self::LedgerEntry,
        ]
    }

    pub fn is_check(&self) -> bool {
        matches!(self, Self::HandwrittenCheck | Self::PrintedCheck)
    }

    /// Pre-printed check series keep their leading zeros
    pub fn preserves_leading_zeros(&self) -> bool {
        matches!(self, Self::PrintedCheck)
    }

    /// Namespace used when grouping by check number or reference.
    /// Ledger lines record checks, so they share the check namespace.
    pub fn reference_class(&self) -> ReferenceClass {
        match self {
            Self::OnlinePayment => ReferenceClass::Online,
            _ => ReferenceClass::Check,
        }
    }

    /// Rank of this source for one field family; higher wins
    pub fn priority_for(&self, family: FieldFamily) -> u8 {
        use FieldFamily::*;
        match (family, self) {
            // The ledger was written by a human for reconciliation
            (Reference | Amount, Self::LedgerEntry) => 3,
            (Reference | Amount, Self::OnlinePayment) => 2,
            (Reference | Amount, _) => 1,

            (CheckDate, Self::PrintedCheck) => 3,
            (CheckDate, Self::HandwrittenCheck) => 2,
            (CheckDate, _) => 1,

            (DepositDate, Self::LedgerEntry) => 3,
            (DepositDate, _) => 1,

            (TransactionDate, Self::OnlinePayment) => 3,
            (TransactionDate, Self::LedgerEntry) => 2,
            (TransactionDate, _) => 1,

            (PostmarkDate, _) => 1,

            (Payer, Self::LedgerEntry) => 1,
            (Payer, _) => 2,

            (Contact, Self::OnlinePayment) => 3,
            (Contact, Self::LedgerEntry) => 1,
            (Contact, _) => 2,
        }
    }
}

impl std::str::FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "handwritten_check" | "handwritten" | "personal_check" => Ok(Self::HandwrittenCheck),
            "printed_check" | "printed" | "business_check" => Ok(Self::PrintedCheck),
            "online_payment" | "online" | "csv" => Ok(Self::OnlinePayment),
            "ledger_entry" | "ledger" | "deposit_log" | "deposit_slip" => Ok(Self::LedgerEntry),
            _ => Err(format!("Unknown source kind: {}", s)),
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Namespace for check numbers vs. online payment references
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceClass {
    Check,
    Online,
}

/// Field families with independent source-priority rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldFamily {
    Reference,
    Amount,
    CheckDate,
    PostmarkDate,
    DepositDate,
    TransactionDate,
    Payer,
    Contact,
}

/// Where an address on a record was read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressOrigin {
    /// Return address on the mailing envelope
    Envelope,
    /// Address printed on the check face
    Check,
    /// Billing address from an online processor
    Online,
    /// Address written in a ledger line
    Ledger,
}

impl AddressOrigin {
    /// Envelope beats check; directory data (priority 0) never comes through records
    pub fn priority(&self) -> u8 {
        match self {
            Self::Envelope => 3,
            Self::Check | Self::Online => 2,
            Self::Ledger => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Envelope => "envelope",
            Self::Check => "check",
            Self::Online => "online",
            Self::Ledger => "ledger",
        }
    }
}

// =============================================================================
// Raw extraction (collaborator output)
// =============================================================================

/// Address text as extracted
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawAddress {
    #[serde(default)]
    pub line1: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub zip: Option<String>,
}

impl RawAddress {
    pub fn is_empty(&self) -> bool {
        [&self.line1, &self.city, &self.state, &self.zip]
            .iter()
            .all(|f| f.as_deref().map(str::trim).unwrap_or("").is_empty())
    }
}

/// Payment fields as extracted
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawPayment {
    /// Numeric amount ("1,500.00", "$1500")
    #[serde(default)]
    pub amount: Option<String>,
    /// Written-out amount from a check legal line
    #[serde(default)]
    pub amount_written: Option<String>,
    #[serde(default)]
    pub check_no_or_ref: Option<String>,
    #[serde(default)]
    pub payment_date: Option<String>,
    #[serde(default)]
    pub check_date: Option<String>,
    #[serde(default)]
    pub postmark_date: Option<String>,
    #[serde(default)]
    pub deposit_date: Option<String>,
    #[serde(default)]
    pub deposit_method: Option<String>,
    #[serde(default)]
    pub memo: Option<String>,
}

/// Payer fields as extracted
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawPayer {
    /// Every name string read for the payer (check face, signature, envelope)
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default)]
    pub organization: Option<String>,
}

/// Contact fields as extracted
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawContact {
    /// Address printed on the document itself
    #[serde(default)]
    pub address: Option<RawAddress>,
    /// Return address from an envelope scanned with the document
    #[serde(default)]
    pub return_address: Option<RawAddress>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
}

/// Where a record came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub document_id: String,
    /// Position within a multi-record document (ledger line, CSV row)
    #[serde(default)]
    pub line: Option<u32>,
    pub extracted_at: DateTime<Utc>,
}

/// One document-understanding output for one source document or CSV row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawExtraction {
    pub source_kind: SourceKind,
    #[serde(default)]
    pub payment: RawPayment,
    #[serde(default)]
    pub payer: RawPayer,
    #[serde(default)]
    pub contact: RawContact,
    pub provenance: Provenance,
}

/// A document handed to the extraction stage
#[derive(Debug, Clone)]
pub struct SourceDocument {
    pub id: String,
    /// What the uploader says this document is
    pub kind_hint: SourceKind,
    pub content: DocumentContent,
}

#[derive(Debug, Clone)]
pub enum DocumentContent {
    /// Scanned or photographed page
    Image(Vec<u8>),
    /// Plain text (transcriptions, pasted ledgers)
    Text(String),
    /// Online payment export
    Csv(String),
    /// Output previously produced by the extraction model
    ExtractionJson(String),
}

// =============================================================================
// Normalized records
// =============================================================================

/// Normalized postal address
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub line1: Option<String>,
    pub city: Option<String>,
    /// Two-letter state code
    pub state: Option<String>,
    /// Five-character ZIP token
    pub zip: Option<String>,
}

impl Address {
    pub fn is_empty(&self) -> bool {
        self.line1.is_none() && self.city.is_none() && self.state.is_none() && self.zip.is_none()
    }

    /// Single-line rendering for display
    pub fn one_line(&self) -> String {
        let mut parts = Vec::new();
        if let Some(ref line1) = self.line1 {
            parts.push(line1.clone());
        }
        if let Some(ref city) = self.city {
            parts.push(city.clone());
        }
        let state_zip = [self.state.as_deref(), self.zip.as_deref()]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ");
        if !state_zip.is_empty() {
            parts.push(state_zip);
        }
        parts.join(", ")
    }
}

/// Recoverable findings attached to records; never silently dropped
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordFlag {
    /// Numeric and written amounts disagree; the numeric amount is kept
    AmountMismatch { numeric: Decimal, written: Decimal },
    /// The written-out amount was present but could not be read
    WrittenAmountUnreadable { text: String },
    /// No usable date in the payment-date chain; today's date was used
    PaymentDateDefaulted { date: NaiveDate },
    /// Constituents read the check number/reference differently
    ReferenceDisagreement { kept: String, others: Vec<String> },
    /// Equal-priority constituents disagree on a scalar field
    MergeConflict {
        field: String,
        kept: String,
        discarded: String,
    },
    /// Constituents kept together read slightly different amounts
    AmountDisagreement { kept: Decimal, others: Vec<Decimal> },
    /// Same reference seen with different amounts; split into separate payments
    AmountSplit {
        check_no_or_ref: String,
        amounts: Vec<Decimal>,
    },
    /// Grouped without any reference, on amount and payer name alone
    FallbackGrouping,
}

impl RecordFlag {
    /// Human-readable explanation for reviewers
    pub fn describe(&self) -> String {
        match self {
            Self::AmountMismatch { numeric, written } => format!(
                "Numeric amount {} does not match written amount {}",
                numeric, written
            ),
            Self::WrittenAmountUnreadable { text } => format!(
                "Written amount '{}' could not be read; numeric amount used unchecked",
                text
            ),
            Self::PaymentDateDefaulted { date } => format!(
                "No postmark, check or transaction date could be read; payment date set to {}",
                date
            ),
            Self::ReferenceDisagreement { kept, others } => format!(
                "Check number/reference read as {} elsewhere; kept {}",
                others.join(", "),
                kept
            ),
            Self::MergeConflict {
                field,
                kept,
                discarded,
            } => format!(
                "Sources of equal standing disagree on {}: kept {}, discarded {}",
                field, kept, discarded
            ),
            Self::AmountDisagreement { kept, others } => format!(
                "Amount read as {} elsewhere; kept {}",
                others
                    .iter()
                    .map(|a| a.to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
                kept
            ),
            Self::AmountSplit {
                check_no_or_ref,
                amounts,
            } => format!(
                "Reference {} appears with different amounts ({}); treated as separate payments",
                check_no_or_ref,
                amounts
                    .iter()
                    .map(|a| a.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            Self::FallbackGrouping => {
                "Grouped without a check number or reference (amount and payer name only)"
                    .to_string()
            }
        }
    }
}

/// Normalized form of one [`RawExtraction`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRecord {
    /// Deterministic id derived from provenance
    pub id: String,
    pub source_kind: SourceKind,
    /// General rank of the source (reference/amount family)
    pub source_priority: u8,
    pub amount: Decimal,
    pub check_no_or_ref: Option<String>,
    pub payment_date: Option<NaiveDate>,
    pub check_date: Option<NaiveDate>,
    pub postmark_date: Option<NaiveDate>,
    pub deposit_date: Option<NaiveDate>,
    pub deposit_method: Option<String>,
    pub memo: Option<String>,
    /// Unique name variants, most specific first
    pub aliases: Vec<String>,
    pub organization_name: Option<String>,
    pub salutation: Option<String>,
    pub address: Option<Address>,
    pub address_origin: Option<AddressOrigin>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub provenance: Provenance,
    pub flags: Vec<RecordFlag>,
}

// =============================================================================
// Canonical payments
// =============================================================================

/// How much the grouping of constituents can be trusted
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeConfidence {
    /// Reference and amount agree, no conflicts
    Exact,
    /// A scalar tie was broken by ordering
    Corroborated,
    /// Split by amount, grouped without a reference, or references disagree
    Heuristic,
}

impl MergeConfidence {
    /// Lower the confidence to `other` if that is less trusting
    pub fn downgrade(self, other: MergeConfidence) -> MergeConfidence {
        self.max(other)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Corroborated => "corroborated",
            Self::Heuristic => "heuristic",
        }
    }
}

impl std::fmt::Display for MergeConfidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Identity match classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    #[default]
    Unmatched,
    New,
    Matched,
    MatchedAddressMismatch,
    Rejected,
}

impl MatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unmatched => "unmatched",
            Self::New => "new",
            Self::Matched => "matched",
            Self::MatchedAddressMismatch => "matched_address_mismatch",
            Self::Rejected => "rejected",
        }
    }
}

impl std::str::FromStr for MatchStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "unmatched" => Ok(Self::Unmatched),
            "new" => Ok(Self::New),
            "matched" => Ok(Self::Matched),
            "matched_address_mismatch" | "address_mismatch" => Ok(Self::MatchedAddressMismatch),
            "rejected" => Ok(Self::Rejected),
            _ => Err(format!("Unknown match status: {}", s)),
        }
    }
}

impl std::fmt::Display for MatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Export state; written only by the sync collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    #[default]
    Pending,
    Sent,
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Error => "error",
        }
    }
}

impl std::str::FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "sent" => Ok(Self::Sent),
            "error" => Ok(Self::Error),
            _ => Err(format!("Unknown sync status: {}", s)),
        }
    }
}

/// Which link of the payment-date chain produced `payment_date`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentDateSource {
    Postmark,
    CheckDate,
    Transaction,
    /// Nothing in the chain was available
    Defaulted,
}

/// The single reconciled record for one real payment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalPayment {
    /// Stable identity: hash of the sorted constituent ids
    pub fingerprint: String,
    /// Bumped whenever a re-classification changes the match outcome
    pub version: u32,
    pub amount: Decimal,
    pub check_no_or_ref: Option<String>,
    pub payment_date: NaiveDate,
    pub payment_date_source: PaymentDateSource,
    pub check_date: Option<NaiveDate>,
    pub postmark_date: Option<NaiveDate>,
    pub deposit_date: Option<NaiveDate>,
    pub deposit_method: Option<String>,
    pub memo: Option<String>,
    pub aliases: Vec<String>,
    pub organization_name: Option<String>,
    pub salutation: Option<String>,
    pub address: Option<Address>,
    pub address_origin: Option<AddressOrigin>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub source_kinds: BTreeSet<SourceKind>,
    pub constituent_ids: BTreeSet<String>,
    pub merge_confidence: MergeConfidence,
    pub match_status: MatchStatus,
    pub payer_directory_id: Option<String>,
    pub address_mismatch: bool,
    /// Why the record was rejected or needs review
    pub review_reason: Option<String>,
    pub sync_status: SyncStatus,
    pub flags: Vec<RecordFlag>,
}

impl CanonicalPayment {
    /// Best display name: organization, else the most specific alias
    pub fn display_name(&self) -> Option<&str> {
        self.organization_name
            .as_deref()
            .or_else(|| self.aliases.first().map(String::as_str))
    }
}

// =============================================================================
// Payer directory (external)
// =============================================================================

/// An entry in the external payer directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayerDirectoryEntry {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub organization_name: Option<String>,
    #[serde(default)]
    pub address: Option<Address>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
}

/// Proposal for the directory collaborator to create a payer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPayerRequest {
    /// Canonical payment that triggered the proposal
    pub fingerprint: String,
    pub display_name: String,
    pub aliases: Vec<String>,
    pub organization_name: Option<String>,
    pub salutation: Option<String>,
    pub address: Option<Address>,
    pub email: Option<String>,
    pub phone: Option<String>,
}

/// Proposal for a human to apply a changed address to a directory entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressUpdateProposal {
    pub fingerprint: String,
    pub payer_directory_id: String,
    pub current: Option<Address>,
    pub proposed: Address,
    /// Components that differ (line1, city, state, zip)
    pub differing_fields: Vec<String>,
}
