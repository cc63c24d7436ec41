//! Interchange export for the sync collaborator
//!
//! `PaymentExportV1` is the stable, versioned shape of a ready canonical
//! payment. JSON carries it as is; CSV flattens it to one row per payment.

use std::str::FromStr;

use chrono::NaiveDate;
use csv::WriterBuilder;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::db::Database;
use crate::error::{Error, Result};
use crate::models::{CanonicalPayment, MatchStatus};

pub const EXPORT_SCHEMA_VERSION: u32 = 1;

/// Export format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    Json,
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "csv" => Ok(Self::Csv),
            "json" => Ok(Self::Json),
            _ => Err(format!("Unknown export format: {} (expected json or csv)", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentExportV1 {
    pub schema_version: u32,
    pub fingerprint: String,
    pub version: u32,
    pub payment: ExportedPayment,
    pub payer: ExportedPayer,
    pub contact: ExportedContact,
    pub status: ExportedStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedPayment {
    pub amount: Decimal,
    pub check_no_or_ref: Option<String>,
    pub payment_date: NaiveDate,
    pub check_date: Option<NaiveDate>,
    pub postmark_date: Option<NaiveDate>,
    pub deposit_date: Option<NaiveDate>,
    pub deposit_method: Option<String>,
    pub memo: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedPayer {
    pub aliases: Vec<String>,
    pub organization_name: Option<String>,
    pub salutation: Option<String>,
    /// Directory entry the payment belongs to, once matched
    pub payer_directory_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedContact {
    pub address_line1: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedStatus {
    pub match_status: String,
    pub sync_status: String,
    pub merge_confidence: String,
    pub review_reason: Option<String>,
    /// Human-readable flag descriptions
    pub flags: Vec<String>,
}

impl From<&CanonicalPayment> for PaymentExportV1 {
    fn from(p: &CanonicalPayment) -> Self {
        let address = p.address.clone().unwrap_or_default();
        Self {
            schema_version: EXPORT_SCHEMA_VERSION,
            fingerprint: p.fingerprint.clone(),
            version: p.version,
            payment: ExportedPayment {
                amount: p.amount,
                check_no_or_ref: p.check_no_or_ref.clone(),
                payment_date: p.payment_date,
                check_date: p.check_date,
                postmark_date: p.postmark_date,
                deposit_date: p.deposit_date,
                deposit_method: p.deposit_method.clone(),
                memo: p.memo.clone(),
            },
            payer: ExportedPayer {
                aliases: p.aliases.clone(),
                organization_name: p.organization_name.clone(),
                salutation: p.salutation.clone(),
                payer_directory_id: p.payer_directory_id.clone(),
            },
            contact: ExportedContact {
                address_line1: address.line1,
                city: address.city,
                state: address.state,
                zip: address.zip,
                email: p.email.clone(),
                phone: p.phone.clone(),
            },
            status: ExportedStatus {
                match_status: p.match_status.as_str().to_string(),
                sync_status: p.sync_status.as_str().to_string(),
                merge_confidence: p.merge_confidence.as_str().to_string(),
                review_reason: p.review_reason.clone(),
                flags: p.flags.iter().map(|f| f.describe()).collect(),
            },
        }
    }
}

/// One CSV row per payment
#[derive(Debug, Serialize)]
struct FlatRow<'a> {
    fingerprint: &'a str,
    version: u32,
    amount: String,
    check_no_or_ref: Option<&'a str>,
    payment_date: String,
    check_date: Option<String>,
    postmark_date: Option<String>,
    deposit_date: Option<String>,
    deposit_method: Option<&'a str>,
    memo: Option<&'a str>,
    payer_name: Option<&'a str>,
    aliases: String,
    organization_name: Option<&'a str>,
    salutation: Option<&'a str>,
    payer_directory_id: Option<&'a str>,
    address_line1: Option<&'a str>,
    city: Option<&'a str>,
    state: Option<&'a str>,
    zip: Option<&'a str>,
    email: Option<&'a str>,
    phone: Option<&'a str>,
    match_status: &'a str,
    sync_status: &'a str,
    merge_confidence: &'a str,
    review_reason: Option<&'a str>,
}

/// Pretty-printed JSON array of `PaymentExportV1`
pub fn export_json(payments: &[CanonicalPayment]) -> Result<String> {
    let exported: Vec<PaymentExportV1> = payments.iter().map(PaymentExportV1::from).collect();
    Ok(serde_json::to_string_pretty(&exported)?)
}

/// Flat CSV; aliases are joined with `; `
pub fn export_csv(payments: &[CanonicalPayment]) -> Result<String> {
    let mut writer = WriterBuilder::new().has_headers(true).from_writer(Vec::new());

    for p in payments {
        let exported = PaymentExportV1::from(p);
        let contact = &exported.contact;
        writer.serialize(FlatRow {
            fingerprint: &exported.fingerprint,
            version: exported.version,
            amount: exported.payment.amount.to_string(),
            check_no_or_ref: exported.payment.check_no_or_ref.as_deref(),
            payment_date: exported.payment.payment_date.to_string(),
            check_date: exported.payment.check_date.map(|d| d.to_string()),
            postmark_date: exported.payment.postmark_date.map(|d| d.to_string()),
            deposit_date: exported.payment.deposit_date.map(|d| d.to_string()),
            deposit_method: exported.payment.deposit_method.as_deref(),
            memo: exported.payment.memo.as_deref(),
            payer_name: p.display_name(),
            aliases: exported.payer.aliases.join("; "),
            organization_name: exported.payer.organization_name.as_deref(),
            salutation: exported.payer.salutation.as_deref(),
            payer_directory_id: exported.payer.payer_directory_id.as_deref(),
            address_line1: contact.address_line1.as_deref(),
            city: contact.city.as_deref(),
            state: contact.state.as_deref(),
            zip: contact.zip.as_deref(),
            email: contact.email.as_deref(),
            phone: contact.phone.as_deref(),
            match_status: &exported.status.match_status,
            sync_status: &exported.status.sync_status,
            merge_confidence: &exported.status.merge_confidence,
            review_reason: exported.status.review_reason.as_deref(),
        })?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| Error::InvalidData(format!("Failed to finish CSV export: {}", e)))?;
    String::from_utf8(bytes).map_err(|e| Error::InvalidData(format!("CSV export is not UTF-8: {}", e)))
}

impl Database {
    /// Export stored payments, optionally of one match status
    pub fn export_payments(&self, status: Option<MatchStatus>, format: ExportFormat) -> Result<String> {
        let payments: Vec<CanonicalPayment> = self
            .list_payments(status)?
            .into_iter()
            .map(|stored| stored.payment)
            .collect();
        match format {
            ExportFormat::Json => export_json(&payments),
            ExportFormat::Csv => export_csv(&payments),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Address, MergeConfidence, PaymentDateSource, RecordFlag, SyncStatus};
    use std::collections::BTreeSet;

    fn payment() -> CanonicalPayment {
        CanonicalPayment {
            fingerprint: "pay_3f1c".into(),
            version: 2,
            amount: Decimal::new(150000, 2),
            check_no_or_ref: Some("004531".into()),
            payment_date: NaiveDate::from_ymd_opt(2025, 1, 16).unwrap(),
            payment_date_source: PaymentDateSource::CheckDate,
            check_date: NaiveDate::from_ymd_opt(2025, 1, 16),
            postmark_date: None,
            deposit_date: NaiveDate::from_ymd_opt(2025, 2, 8),
            deposit_method: Some("check".into()),
            memo: Some("Dues, spring".into()),
            aliases: vec!["Dalene Eimon".into(), "D. Eimon".into()],
            organization_name: None,
            salutation: Some("Mrs.".into()),
            address: Some(Address {
                line1: Some("805 Snead St".into()),
                city: Some("Paso Robles".into()),
                state: Some("CA".into()),
                zip: Some("93446".into()),
            }),
            address_origin: None,
            email: None,
            phone: None,
            source_kinds: BTreeSet::new(),
            constituent_ids: BTreeSet::new(),
            merge_confidence: MergeConfidence::Corroborated,
            match_status: MatchStatus::Matched,
            payer_directory_id: Some("C-101".into()),
            address_mismatch: false,
            review_reason: None,
            sync_status: SyncStatus::Pending,
            flags: vec![RecordFlag::FallbackGrouping],
        }
    }

    #[test]
    fn test_json_shape_is_versioned() {
        let json = export_json(&[payment()]).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        let first = &value[0];
        assert_eq!(first["schema_version"], 1);
        assert_eq!(first["payment"]["amount"], "1500.00");
        assert_eq!(first["payment"]["check_no_or_ref"], "004531");
        assert_eq!(first["payer"]["payer_directory_id"], "C-101");
        assert_eq!(first["contact"]["zip"], "93446");
        assert_eq!(first["status"]["match_status"], "matched");
        assert_eq!(first["status"]["sync_status"], "pending");
        assert_eq!(first["status"]["flags"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_csv_flattens_and_quotes() {
        let csv = export_csv(&[payment()]).unwrap();
        let mut lines = csv.lines();
        let header = lines.next().unwrap();
        assert!(header.starts_with("fingerprint,version,amount,check_no_or_ref,payment_date"));
        let row = lines.next().unwrap();
        assert!(row.contains("\"Dues, spring\""));
        assert!(row.contains("Dalene Eimon; D. Eimon"));
        assert!(row.contains(",004531,"));
    }

    #[test]
    fn test_export_from_database() {
        let db = Database::in_memory().unwrap();
        db.save_payments(&[payment()]).unwrap();
        db.set_sync_status("pay_3f1c", SyncStatus::Sent).unwrap();

        let json = db.export_payments(None, ExportFormat::Json).unwrap();
        let exported: Vec<PaymentExportV1> = serde_json::from_str(&json).unwrap();
        assert_eq!(exported.len(), 1);
        assert_eq!(exported[0].status.sync_status, "sent");

        let none = db
            .export_payments(Some(MatchStatus::Rejected), ExportFormat::Json)
            .unwrap();
        assert_eq!(none.trim(), "[]");
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("JSON".parse::<ExportFormat>().unwrap(), ExportFormat::Json);
        assert_eq!("csv".parse::<ExportFormat>().unwrap(), ExportFormat::Csv);
        assert!("xml".parse::<ExportFormat>().is_err());
    }
}
