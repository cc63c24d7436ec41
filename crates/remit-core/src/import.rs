//! CSV import for online payment exports and payer lists
//!
//! Online payment rows become [`RawExtraction`]s with text fields exactly as
//! exported; the normalizer does the parsing. A row with a bad amount is not
//! an import error: it reaches the normalizer and is rejected there with a
//! reason a reviewer can act on.

use std::collections::HashMap;
use std::io::Read;

use chrono::{DateTime, Utc};
use csv::{ReaderBuilder, StringRecord};
use tracing::{debug, info};

use crate::aliases::aliases_for_names;
use crate::error::{Error, Result};
use crate::models::{
    Address, Provenance, RawAddress, RawContact, RawExtraction, RawPayer, RawPayment, SourceKind,
};
use crate::normalize::{normalize_address, normalize_email, normalize_phone};

/// Known online payment export layouts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnlineFormat {
    /// `Payment_Ref,Amount,Date,Name,...`
    Generic,
    /// Stripe payments export: `id,Created (UTC),Amount,...,Customer Email,...`
    Stripe,
}

impl OnlineFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Generic => "generic",
            Self::Stripe => "stripe",
        }
    }
}

/// Detect export format from CSV header line
///
/// Returns None if the format is not recognized.
pub fn detect_online_format(header: &str) -> Option<OnlineFormat> {
    let columns: Vec<String> = header
        .trim()
        .trim_start_matches('\u{feff}')
        .split(',')
        .map(|c| c.trim().trim_matches('"').to_lowercase())
        .collect();
    let has = |name: &str| columns.iter().any(|c| c == name);

    if has("id") && has("created (utc)") && has("amount") {
        return Some(OnlineFormat::Stripe);
    }
    if has("payment_ref") && has("amount") {
        return Some(OnlineFormat::Generic);
    }
    None
}

/// Column lookup by case-insensitive header name
struct Columns {
    index: HashMap<String, usize>,
}

impl Columns {
    fn new(headers: &StringRecord) -> Self {
        let index = headers
            .iter()
            .enumerate()
            .map(|(i, h)| (h.trim().trim_start_matches('\u{feff}').to_lowercase(), i))
            .collect();
        Self { index }
    }

    /// First non-blank value among the named columns
    fn get(&self, record: &StringRecord, names: &[&str]) -> Option<String> {
        names
            .iter()
            .filter_map(|name| self.index.get(*name))
            .filter_map(|&i| record.get(i))
            .map(str::trim)
            .find(|v| !v.is_empty())
            .map(str::to_string)
    }
}

/// Parse an online payment export, detecting its format from the header row
///
/// `file_id` names the upload; each row's document id is `<file_id>#<row>`.
pub fn parse_online_csv<R: Read>(
    reader: R,
    file_id: &str,
    extracted_at: DateTime<Utc>,
) -> Result<Vec<RawExtraction>> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(reader);

    let headers = rdr.headers()?.clone();
    let header_line = headers.iter().collect::<Vec<_>>().join(",");
    let format = detect_online_format(&header_line).ok_or_else(|| {
        Error::Import(format!(
            "Unrecognized payment export format in {}: {}",
            file_id, header_line
        ))
    })?;

    let columns = Columns::new(&headers);
    let mut extractions = Vec::new();

    for (index, result) in rdr.records().enumerate() {
        let record = result?;
        let row = (index + 1) as u32;

        if record.iter().all(|v| v.trim().is_empty()) {
            continue;
        }

        if format == OnlineFormat::Stripe {
            if let Some(status) = columns.get(&record, &["status"]) {
                if status.eq_ignore_ascii_case("failed") {
                    debug!(file = file_id, row, "Skipping failed Stripe charge");
                    continue;
                }
            }
        }

        extractions.push(online_row(&columns, &record, format, file_id, row, extracted_at));
    }

    info!(
        file = file_id,
        format = format.as_str(),
        rows = extractions.len(),
        "Parsed online payment export"
    );

    Ok(extractions)
}

fn online_row(
    columns: &Columns,
    record: &StringRecord,
    format: OnlineFormat,
    file_id: &str,
    row: u32,
    extracted_at: DateTime<Utc>,
) -> RawExtraction {
    let (reference, date, names, address): (&[&str], &[&str], &[&str], [&[&str]; 4]) = match format
    {
        OnlineFormat::Generic => (
            &["payment_ref"],
            &["date", "payment_date", "transaction_date"],
            &["name", "payer", "customer_name"],
            [
                &["address", "address_line1", "street"],
                &["city"],
                &["state"],
                &["zip", "postal_code"],
            ],
        ),
        OnlineFormat::Stripe => (
            &["id"],
            &["created (utc)"],
            &["customer name", "card name", "customer description"],
            [
                &["card address line1"],
                &["card address city"],
                &["card address state"],
                &["card address zip"],
            ],
        ),
    };

    let raw_address = RawAddress {
        line1: columns.get(record, address[0]),
        city: columns.get(record, address[1]),
        state: columns.get(record, address[2]),
        zip: columns.get(record, address[3]),
    };

    RawExtraction {
        source_kind: SourceKind::OnlinePayment,
        payment: RawPayment {
            amount: columns.get(record, &["amount"]),
            check_no_or_ref: columns.get(record, reference),
            payment_date: columns.get(record, date),
            deposit_method: Some(match format {
                OnlineFormat::Stripe => "stripe".to_string(),
                OnlineFormat::Generic => columns
                    .get(record, &["method", "payment_method"])
                    .unwrap_or_else(|| "online".to_string()),
            }),
            memo: columns.get(record, &["memo", "description", "note"]),
            ..RawPayment::default()
        },
        payer: RawPayer {
            names: columns.get(record, names).into_iter().collect(),
            organization: columns.get(record, &["organization", "company", "business"]),
        },
        contact: RawContact {
            address: (!raw_address.is_empty()).then_some(raw_address),
            return_address: None,
            email: columns.get(record, &["email", "customer email"]),
            phone: columns.get(record, &["phone", "customer phone"]),
        },
        provenance: Provenance {
            document_id: format!("{}#{}", file_id, row),
            line: Some(row),
            extracted_at,
        },
    }
}

/// One payer row from a directory CSV
#[derive(Debug, Clone, PartialEq)]
pub struct PayerImport {
    /// Id in the system of record, if the export carries one
    pub external_id: Option<String>,
    pub display_name: String,
    pub aliases: Vec<String>,
    pub organization_name: Option<String>,
    pub address: Option<Address>,
    pub email: Option<String>,
    pub phone: Option<String>,
}

/// Parse a payer list
///
/// Columns: `name` (required), optional `id`, `aliases` (`;`-separated),
/// `organization`, `address`, `city`, `state`, `zip`, `email`, `phone`.
/// Aliases are expanded from the name and any listed alias.
pub fn parse_payer_csv<R: Read>(reader: R) -> Result<Vec<PayerImport>> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(reader);

    let headers = rdr.headers()?.clone();
    let columns = Columns::new(&headers);
    if !columns.index.contains_key("name") && !columns.index.contains_key("display_name") {
        return Err(Error::Import("Payer CSV needs a 'name' column".into()));
    }

    let mut payers = Vec::new();
    for (index, result) in rdr.records().enumerate() {
        let record = result?;
        let display_name = columns
            .get(&record, &["name", "display_name"])
            .ok_or_else(|| Error::Import(format!("Row {}: missing name", index + 1)))?;
        let organization_name = columns.get(&record, &["organization", "company"]);

        let mut names = vec![display_name.clone()];
        if let Some(listed) = columns.get(&record, &["aliases"]) {
            names.extend(
                listed
                    .split(';')
                    .map(str::trim)
                    .filter(|a| !a.is_empty())
                    .map(str::to_string),
            );
        }
        let mut aliases = aliases_for_names(&names);
        if aliases.is_empty() {
            aliases.push(display_name.clone());
        }

        let raw_address = RawAddress {
            line1: columns.get(&record, &["address", "address_line1", "street"]),
            city: columns.get(&record, &["city"]),
            state: columns.get(&record, &["state"]),
            zip: columns.get(&record, &["zip", "postal_code"]),
        };

        payers.push(PayerImport {
            external_id: columns.get(&record, &["id", "customer_id"]),
            display_name,
            aliases,
            organization_name,
            address: normalize_address(&raw_address),
            email: columns
                .get(&record, &["email"])
                .and_then(|e| normalize_email(&e)),
            phone: columns
                .get(&record, &["phone"])
                .and_then(|p| normalize_phone(&p)),
        });
    }

    Ok(payers)
}
