//! Record normalizer
//!
//! Turns one [`RawExtraction`] into a [`PaymentRecord`]: exact decimal
//! amounts, calendar dates, cleaned check numbers, five-character ZIPs,
//! two-letter states and a full alias set for the payer.
//!
//! Missing required fields fail with a [`ValidationError`]. Everything else
//! that looks wrong is either dropped to `None` (illegible dates) or kept and
//! flagged (numeric vs. written amount disagreement).

use std::str::FromStr;
use std::sync::OnceLock;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use regex::Regex;
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::aliases::{aliases_for_names, is_organization, split_salutation};
use crate::error::ValidationError;
use crate::models::{
    Address, AddressOrigin, FieldFamily, PaymentRecord, RawAddress, RawExtraction, RecordFlag,
    SourceKind,
};

/// Numeric and written amounts closer than this are the same amount
fn amount_rounding() -> Decimal {
    Decimal::new(5, 3)
}

/// Date formats seen on checks, envelopes, ledgers and processor exports
const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d", // 2025-01-16
    "%m/%d/%y", // 01/16/25 (two-digit years first, %Y accepts them too)
    "%m/%d/%Y", // 01/16/2025
    "%m-%d-%y", // 01-16-25
    "%m-%d-%Y", // 01-16-2025
    "%m.%d.%Y", // 01.16.2025
    "%Y/%m/%d", // 2025/01/16
    "%B %d, %Y", // January 16, 2025
    "%B %d %Y", // January 16 2025
    "%b %d, %Y", // Jan 16, 2025
    "%b %d %Y", // Jan 16 2025
    "%d %B %Y", // 16 January 2025
    "%d %b %Y", // 16 Jan 2025
];

const STATES: &[(&str, &str)] = &[
    ("alabama", "AL"),
    ("alaska", "AK"),
    ("arizona", "AZ"),
    ("arkansas", "AR"),
    ("california", "CA"),
    ("colorado", "CO"),
    ("connecticut", "CT"),
    ("delaware", "DE"),
    ("district of columbia", "DC"),
    ("florida", "FL"),
    ("georgia", "GA"),
    ("hawaii", "HI"),
    ("idaho", "ID"),
    ("illinois", "IL"),
    ("indiana", "IN"),
    ("iowa", "IA"),
    ("kansas", "KS"),
    ("kentucky", "KY"),
    ("louisiana", "LA"),
    ("maine", "ME"),
    ("maryland", "MD"),
    ("massachusetts", "MA"),
    ("michigan", "MI"),
    ("minnesota", "MN"),
    ("mississippi", "MS"),
    ("missouri", "MO"),
    ("montana", "MT"),
    ("nebraska", "NE"),
    ("nevada", "NV"),
    ("new hampshire", "NH"),
    ("new jersey", "NJ"),
    ("new mexico", "NM"),
    ("new york", "NY"),
    ("north carolina", "NC"),
    ("north dakota", "ND"),
    ("ohio", "OH"),
    ("oklahoma", "OK"),
    ("oregon", "OR"),
    ("pennsylvania", "PA"),
    ("puerto rico", "PR"),
    ("rhode island", "RI"),
    ("south carolina", "SC"),
    ("south dakota", "SD"),
    ("tennessee", "TN"),
    ("texas", "TX"),
    ("utah", "UT"),
    ("vermont", "VT"),
    ("virginia", "VA"),
    ("washington", "WA"),
    ("west virginia", "WV"),
    ("wisconsin", "WI"),
    ("wyoming", "WY"),
];

/// Normalize one extraction.
///
/// Fails when a field required for the source kind is absent after
/// normalization: the amount always, the check number for check kinds and
/// the payment reference for online payments.
pub fn normalize(raw: &RawExtraction) -> std::result::Result<PaymentRecord, ValidationError> {
    let kind = raw.source_kind;
    let doc = &raw.provenance.document_id;
    let line = raw.provenance.line;
    let invalid = |field: &str, reason: String| ValidationError::new(doc.clone(), line, field, reason);

    let mut flags = Vec::new();

    // Amount: numeric wins, written is a cross-check
    let numeric = non_empty(&raw.payment.amount).and_then(parse_amount);
    let written_text = non_empty(&raw.payment.amount_written);
    let written = written_text.and_then(parse_written_amount);
    if let (Some(_), Some(text), None) = (numeric, written_text, written) {
        debug!(document = %doc, written = text, "Unreadable written amount");
        flags.push(RecordFlag::WrittenAmountUnreadable {
            text: text.to_string(),
        });
    }
    let amount = match (numeric, written) {
        (Some(n), Some(w)) => {
            if (n - w).abs() > amount_rounding() {
                debug!(document = %doc, numeric = %n, written = %w, "Amount mismatch");
                flags.push(RecordFlag::AmountMismatch {
                    numeric: n,
                    written: w,
                });
            }
            n
        }
        (Some(n), None) => n,
        (None, Some(w)) => w,
        (None, None) => {
            let reason = match non_empty(&raw.payment.amount) {
                Some(text) => format!("Amount '{}' could not be read", text),
                None => "Amount is missing".to_string(),
            };
            return Err(invalid("amount", reason));
        }
    };
    if amount <= Decimal::ZERO {
        return Err(invalid(
            "amount",
            format!("Amount must be greater than zero (read {})", amount),
        ));
    }

    let check_no_or_ref = non_empty(&raw.payment.check_no_or_ref)
        .and_then(|value| normalize_check_number(value, kind));
    if check_no_or_ref.is_none() {
        if kind.is_check() {
            return Err(invalid(
                "check_no_or_ref",
                "Check number is missing or illegible".to_string(),
            ));
        }
        if kind == SourceKind::OnlinePayment {
            return Err(invalid(
                "check_no_or_ref",
                "Payment reference is missing".to_string(),
            ));
        }
    }

    let date = |field: &str, value: &Option<String>| -> Option<NaiveDate> {
        let text = non_empty(value)?;
        let parsed = parse_date(text);
        if parsed.is_none() {
            debug!(document = %doc, field, value = text, "Unreadable date dropped");
        }
        parsed
    };

    let (address, address_origin) = normalize_contact_address(raw);

    // Names: salutation from the first name that carries one
    let mut salutation = None;
    let mut names = Vec::new();
    for name in &raw.payer.names {
        let (honorific, rest) = split_salutation(name);
        if salutation.is_none() {
            salutation = honorific;
        }
        if !rest.is_empty() {
            names.push(rest);
        }
    }

    let organization_name = non_empty(&raw.payer.organization)
        .map(collapse_whitespace)
        .or_else(|| names.iter().find(|n| is_organization(n)).cloned());

    let mut aliases = aliases_for_names(&names);
    if aliases.is_empty() {
        if let Some(ref org) = organization_name {
            aliases.push(org.clone());
        }
    }

    Ok(PaymentRecord {
        id: record_id(doc, line),
        source_kind: kind,
        source_priority: kind.priority_for(FieldFamily::Reference),
        amount,
        check_no_or_ref,
        payment_date: date("payment_date", &raw.payment.payment_date),
        check_date: date("check_date", &raw.payment.check_date),
        postmark_date: date("postmark_date", &raw.payment.postmark_date),
        deposit_date: date("deposit_date", &raw.payment.deposit_date),
        deposit_method: non_empty(&raw.payment.deposit_method).map(collapse_whitespace),
        memo: non_empty(&raw.payment.memo).map(collapse_whitespace),
        aliases,
        organization_name,
        salutation,
        address,
        address_origin,
        email: non_empty(&raw.contact.email).and_then(normalize_email),
        phone: non_empty(&raw.contact.phone).and_then(normalize_phone),
        provenance: raw.provenance.clone(),
        flags,
    })
}

/// Normalize a batch, splitting valid records from the invalid bucket.
/// Output order follows input order.
pub fn normalize_all(raws: &[RawExtraction]) -> (Vec<PaymentRecord>, Vec<ValidationError>) {
    let mut records = Vec::with_capacity(raws.len());
    let mut invalid = Vec::new();
    for raw in raws {
        match normalize(raw) {
            Ok(record) => records.push(record),
            Err(err) => {
                debug!("Excluded record: {}", err);
                invalid.push(err);
            }
        }
    }
    (records, invalid)
}

/// Deterministic record id from provenance
pub fn record_id(document_id: &str, line: Option<u32>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document_id.as_bytes());
    if let Some(line) = line {
        hasher.update(b"#");
        hasher.update(line.to_string().as_bytes());
    }
    let digest = hex::encode(hasher.finalize());
    format!("rec_{}", &digest[..16])
}

/// Parse a numeric amount: "$1,500.00", "1500", "USD 25.5"
pub fn parse_amount(s: &str) -> Option<Decimal> {
    let cleaned: String = s
        .trim()
        .trim_start_matches("USD")
        .trim_end_matches("USD")
        .replace(['$', ',', ' ', '*'], "");
    if cleaned.is_empty() {
        return None;
    }
    let mut amount = Decimal::from_str(&cleaned).ok()?;
    if amount.scale() < 2 {
        amount.rescale(2);
    }
    Some(amount)
}

fn fraction_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d{1,2}|no|xx)\s*/\s*100").expect("valid regex"))
}

fn ordinal_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d)(st|nd|rd|th)\b").expect("valid regex"))
}

/// Parse a check legal line: "One thousand five hundred and 00/100 dollars"
///
/// Returns `None` for unknown words and for amounts too large to represent.
pub fn parse_written_amount(s: &str) -> Option<Decimal> {
    let lower = s.to_lowercase();

    let mut cents = 0i64;
    let mut body = lower.clone();
    if let Some(caps) = fraction_regex().captures(&lower) {
        if let Ok(value) = caps[1].parse::<i64>() {
            cents = value;
        }
        if let Some(whole) = caps.get(0) {
            body = lower[..whole.start()].to_string();
        }
    }

    let mut total: i64 = 0;
    let mut current: i64 = 0;
    let mut seen = false;
    for word in body
        .split(|c: char| c.is_whitespace() || c == '-' || c == ',')
        .filter(|w| !w.is_empty())
    {
        let word = word.trim_matches(|c: char| !c.is_alphanumeric());
        if let Some(value) = small_number(word) {
            current = current.checked_add(value)?;
            seen = true;
            continue;
        }
        if let Ok(value) = word.parse::<i64>() {
            current = current.checked_add(value)?;
            seen = true;
            continue;
        }
        match word {
            "hundred" => {
                current = current.max(1).checked_mul(100)?;
                seen = true;
            }
            "thousand" => {
                total = total.checked_add(current.max(1).checked_mul(1_000)?)?;
                current = 0;
                seen = true;
            }
            "million" => {
                total = total.checked_add(current.max(1).checked_mul(1_000_000)?)?;
                current = 0;
                seen = true;
            }
            "and" | "dollars" | "dollar" | "only" | "exactly" | "" | "usd" => {}
            other => {
                debug!(word = other, "Unrecognized word in written amount");
                return None;
            }
        }
    }

    if !seen {
        return None;
    }
    let dollars = total.checked_add(current)?;
    let minor = dollars.checked_mul(100)?.checked_add(cents)?;
    Some(Decimal::new(minor, 2))
}

fn small_number(word: &str) -> Option<i64> {
    let value = match word {
        "zero" => 0,
        "one" => 1,
        "two" => 2,
        "three" => 3,
        "four" => 4,
        "five" => 5,
        "six" => 6,
        "seven" => 7,
        "eight" => 8,
        "nine" => 9,
        "ten" => 10,
        "eleven" => 11,
        "twelve" => 12,
        "thirteen" => 13,
        "fourteen" => 14,
        "fifteen" => 15,
        "sixteen" => 16,
        "seventeen" => 17,
        "eighteen" => 18,
        "nineteen" => 19,
        "twenty" => 20,
        "thirty" => 30,
        "forty" | "fourty" => 40,
        "fifty" => 50,
        "sixty" => 60,
        "seventy" => 70,
        "eighty" => 80,
        "ninety" => 90,
        _ => return None,
    };
    Some(value)
}

/// Parse a date in any of the common formats; `None` when illegible.
/// Timestamps are truncated to their calendar date.
pub fn parse_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim().trim_end_matches('.');
    if s.is_empty() {
        return None;
    }

    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.date_naive());
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(ts.date());
        }
    }

    let cleaned = ordinal_regex().replace_all(s, "$1").replace("Sept", "Sep");
    for fmt in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(&cleaned, fmt) {
            return Some(date);
        }
    }
    None
}

/// Clean a check number or payment reference.
///
/// Check numbers keep only letters and digits; leading zeros are dropped
/// except for pre-printed check series. Online references are opaque ids
/// and keep `_` and `-`.
pub fn normalize_check_number(value: &str, kind: SourceKind) -> Option<String> {
    let cleaned: String = if kind == SourceKind::OnlinePayment {
        value
            .trim()
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect()
    } else {
        value.chars().filter(|c| c.is_alphanumeric()).collect()
    };
    if cleaned.is_empty() {
        return None;
    }
    if kind == SourceKind::OnlinePayment || kind.preserves_leading_zeros() {
        return Some(cleaned);
    }
    let stripped = cleaned.trim_start_matches('0');
    if stripped.is_empty() {
        Some("0".to_string())
    } else {
        Some(stripped.to_string())
    }
}

/// Five-character ZIP token: "93446-1234" → "93446", "2134" → "02134"
pub fn normalize_zip(value: &str) -> Option<String> {
    let head = value.trim().split(['-', ' ']).next().unwrap_or("");
    let digits: String = head.chars().filter(|c| c.is_ascii_digit()).collect();
    match digits.len() {
        5 => Some(digits),
        4 => Some(format!("0{}", digits)),
        9 => Some(digits[..5].to_string()),
        _ => None,
    }
}

/// Two-letter state code from a code or a full state name
pub fn normalize_state(value: &str) -> Option<String> {
    let trimmed = value.trim().trim_end_matches('.');
    if trimmed.len() == 2 && trimmed.chars().all(|c| c.is_ascii_alphabetic()) {
        return Some(trimmed.to_ascii_uppercase());
    }
    let lower = collapse_whitespace(&trimmed.to_lowercase());
    STATES
        .iter()
        .find(|(name, _)| *name == lower)
        .map(|(_, code)| code.to_string())
}

/// Ten-digit phone number
pub fn normalize_phone(value: &str) -> Option<String> {
    let digits: String = value.chars().filter(|c| c.is_ascii_digit()).collect();
    match digits.len() {
        10 => Some(digits),
        11 if digits.starts_with('1') => Some(digits[1..].to_string()),
        _ => None,
    }
}

/// Lower-cased e-mail address with a plausible shape
pub fn normalize_email(value: &str) -> Option<String> {
    let email = value.trim().to_lowercase();
    let (local, domain) = email.split_once('@')?;
    if local.is_empty() || !domain.contains('.') || domain.contains('@') || email.contains(' ') {
        debug!(email = %email, "Malformed e-mail dropped");
        return None;
    }
    Some(email)
}

/// Normalize one address block; `None` when nothing usable remains
pub fn normalize_address(raw: &RawAddress) -> Option<Address> {
    let address = Address {
        line1: non_empty(&raw.line1).map(collapse_whitespace),
        city: non_empty(&raw.city).map(collapse_whitespace),
        state: non_empty(&raw.state).and_then(normalize_state),
        zip: non_empty(&raw.zip).and_then(normalize_zip),
    };
    if address.is_empty() {
        None
    } else {
        Some(address)
    }
}

/// Envelope return address wins over the address printed on the document
fn normalize_contact_address(raw: &RawExtraction) -> (Option<Address>, Option<AddressOrigin>) {
    if let Some(address) = raw.contact.return_address.as_ref().and_then(normalize_address) {
        return (Some(address), Some(AddressOrigin::Envelope));
    }
    let origin = match raw.source_kind {
        SourceKind::HandwrittenCheck | SourceKind::PrintedCheck => AddressOrigin::Check,
        SourceKind::OnlinePayment => AddressOrigin::Online,
        SourceKind::LedgerEntry => AddressOrigin::Ledger,
    };
    match raw.contact.address.as_ref().and_then(normalize_address) {
        Some(address) => (Some(address), Some(origin)),
        None => (None, None),
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}
