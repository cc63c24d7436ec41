//! Schema validation for extraction responses
//!
//! Models wrap their JSON in prose or code fences and are loose about types
//! (`"amount": 1500` vs `"amount": "1,500.00"`). This module finds the JSON
//! payload, checks it against the extraction schema and converts it into
//! [`RawExtraction`]s. Anything that does not fit is a
//! [`Error::SchemaViolation`], never a panic.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::models::{
    Provenance, RawAddress, RawContact, RawExtraction, RawPayer, RawPayment, SourceKind,
};

const MAX_RAW_IN_ERROR: usize = 200;

/// Parse a model response into raw extractions for one document
///
/// Accepts `{"payments": [...]}`, a bare array, or a single payment object.
/// `kind` is the uploader's hint; an element may override it with its own
/// `source_kind`.
pub fn parse_extraction_response(
    document_id: &str,
    kind: SourceKind,
    response: &str,
    extracted_at: DateTime<Utc>,
) -> Result<Vec<RawExtraction>> {
    let value = extract_json(document_id, response)?;

    let elements = match value {
        Value::Array(items) => items,
        Value::Object(mut object) => match object.remove("payments") {
            Some(Value::Array(items)) => items,
            Some(other) => {
                return Err(violation(
                    document_id,
                    format!("'payments' must be an array, got {}", type_name(&other)),
                ))
            }
            None => vec![Value::Object(object)],
        },
        other => {
            return Err(violation(
                document_id,
                format!("expected an object or array, got {}", type_name(&other)),
            ))
        }
    };

    elements
        .into_iter()
        .enumerate()
        .map(|(index, element)| match element {
            Value::Object(object) => parse_element(document_id, kind, object, extracted_at),
            other => Err(violation(
                document_id,
                format!("payment {} is {}, not an object", index + 1, type_name(&other)),
            )),
        })
        .collect()
}

/// Locate the outermost JSON object or array in free-form model output
fn extract_json(document_id: &str, response: &str) -> Result<Value> {
    let response = response.trim();

    let object = (response.find('{'), response.rfind('}'));
    let array = (response.find('['), response.rfind(']'));

    // Whichever bracket opens first is the outer payload
    let range = match (object, array) {
        ((Some(os), Some(_)), (Some(as_), Some(ae))) if as_ < os && as_ < ae => Some((as_, ae)),
        ((Some(os), Some(oe)), _) if os < oe => Some((os, oe)),
        (_, (Some(as_), Some(ae))) if as_ < ae => Some((as_, ae)),
        _ => None,
    };

    match range {
        Some((start, end)) => {
            let json_str = &response[start..=end];
            serde_json::from_str(json_str).map_err(|e| {
                violation(
                    document_id,
                    format!("invalid JSON: {} | Raw: {}", e, truncate(json_str)),
                )
            })
        }
        None => Err(violation(
            document_id,
            format!("no JSON found in response | Raw: {}", truncate(response)),
        )),
    }
}

fn parse_element(
    document_id: &str,
    hint: SourceKind,
    mut object: Map<String, Value>,
    extracted_at: DateTime<Utc>,
) -> Result<RawExtraction> {
    let source_kind = match object.remove("source_kind") {
        None | Some(Value::Null) => hint,
        Some(Value::String(s)) => s
            .parse::<SourceKind>()
            .map_err(|e| violation(document_id, e))?,
        Some(other) => {
            return Err(violation(
                document_id,
                format!("source_kind must be a string, got {}", type_name(&other)),
            ))
        }
    };

    let line = match object.remove("line") {
        None | Some(Value::Null) => None,
        Some(Value::Number(n)) => match n.as_u64().and_then(|n| u32::try_from(n).ok()) {
            Some(line) => Some(line),
            None => return Err(violation(document_id, format!("invalid line number {}", n))),
        },
        Some(Value::String(s)) => Some(
            s.trim()
                .parse::<u32>()
                .map_err(|_| violation(document_id, format!("invalid line number '{}'", s)))?,
        ),
        Some(other) => {
            return Err(violation(
                document_id,
                format!("line must be a number, got {}", type_name(&other)),
            ))
        }
    };

    let fields = Fields { document_id };

    let payment = match fields.section(&mut object, "payment")? {
        Some(mut p) => RawPayment {
            amount: fields.text(&mut p, "payment.amount")?,
            amount_written: fields.text(&mut p, "payment.amount_written")?,
            check_no_or_ref: fields.text(&mut p, "payment.check_no_or_ref")?,
            payment_date: fields.text(&mut p, "payment.payment_date")?,
            check_date: fields.text(&mut p, "payment.check_date")?,
            postmark_date: fields.text(&mut p, "payment.postmark_date")?,
            deposit_date: fields.text(&mut p, "payment.deposit_date")?,
            deposit_method: fields.text(&mut p, "payment.deposit_method")?,
            memo: fields.text(&mut p, "payment.memo")?,
        },
        None => RawPayment::default(),
    };

    let payer = match fields.section(&mut object, "payer")? {
        Some(mut p) => RawPayer {
            names: fields.names(&mut p)?,
            organization: fields.text(&mut p, "payer.organization")?,
        },
        None => RawPayer::default(),
    };

    let contact = match fields.section(&mut object, "contact")? {
        Some(mut c) => RawContact {
            address: fields.address(&mut c, "contact.address")?,
            return_address: fields.address(&mut c, "contact.return_address")?,
            email: fields.text(&mut c, "contact.email")?,
            phone: fields.text(&mut c, "contact.phone")?,
        },
        None => RawContact::default(),
    };

    Ok(RawExtraction {
        source_kind,
        payment,
        payer,
        contact,
        provenance: Provenance {
            document_id: document_id.to_string(),
            line,
            extracted_at,
        },
    })
}

/// Typed field access that reports the document on failure
struct Fields<'a> {
    document_id: &'a str,
}

impl Fields<'_> {
    fn section(
        &self,
        object: &mut Map<String, Value>,
        name: &str,
    ) -> Result<Option<Map<String, Value>>> {
        match object.remove(name) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Object(section)) => Ok(Some(section)),
            Some(other) => Err(violation(
                self.document_id,
                format!("'{}' must be an object, got {}", name, type_name(&other)),
            )),
        }
    }

    /// String or number; blank strings are absent
    fn text(&self, object: &mut Map<String, Value>, path: &str) -> Result<Option<String>> {
        let key = path.rsplit('.').next().unwrap_or(path);
        match object.remove(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => {
                let trimmed = s.trim();
                Ok((!trimmed.is_empty()).then(|| trimmed.to_string()))
            }
            Some(Value::Number(n)) => Ok(Some(n.to_string())),
            Some(other) => Err(violation(
                self.document_id,
                format!("'{}' must be text or a number, got {}", path, type_name(&other)),
            )),
        }
    }

    /// A single name or a list of names
    fn names(&self, object: &mut Map<String, Value>) -> Result<Vec<String>> {
        let value = object.remove("names").or_else(|| object.remove("name"));
        match value {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(Value::String(s)) => Ok(non_blank(s).into_iter().collect()),
            Some(Value::Array(items)) => {
                let mut names = Vec::new();
                for item in items {
                    match item {
                        Value::String(s) => names.extend(non_blank(s)),
                        Value::Null => {}
                        other => {
                            return Err(violation(
                                self.document_id,
                                format!("payer.names entries must be text, got {}", type_name(&other)),
                            ))
                        }
                    }
                }
                Ok(names)
            }
            Some(other) => Err(violation(
                self.document_id,
                format!("payer.names must be a list, got {}", type_name(&other)),
            )),
        }
    }

    fn address(
        &self,
        object: &mut Map<String, Value>,
        path: &str,
    ) -> Result<Option<RawAddress>> {
        let key = path.rsplit('.').next().unwrap_or(path);
        match object.remove(key) {
            None | Some(Value::Null) => Ok(None),
            // Models sometimes return the address as one line; keep it in line1
            Some(Value::String(s)) => Ok(non_blank(s).map(|line1| RawAddress {
                line1: Some(line1),
                ..RawAddress::default()
            })),
            Some(Value::Object(mut a)) => {
                let address = RawAddress {
                    line1: self.text(&mut a, &format!("{}.line1", path))?,
                    city: self.text(&mut a, &format!("{}.city", path))?,
                    state: self.text(&mut a, &format!("{}.state", path))?,
                    zip: self.text(&mut a, &format!("{}.zip", path))?,
                };
                Ok((!address.is_empty()).then_some(address))
            }
            Some(other) => Err(violation(
                self.document_id,
                format!("'{}' must be an object, got {}", path, type_name(&other)),
            )),
        }
    }
}

fn non_blank(s: String) -> Option<String> {
    let trimmed = s.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn violation(document_id: &str, reason: impl Into<String>) -> Error {
    Error::SchemaViolation {
        document: document_id.to_string(),
        reason: reason.into(),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "text",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn truncate(s: &str) -> String {
    if s.len() > MAX_RAW_IN_ERROR {
        let mut end = MAX_RAW_IN_ERROR;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &s[..end])
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(response: &str) -> Result<Vec<RawExtraction>> {
        parse_extraction_response("check-4531.jpg", SourceKind::HandwrittenCheck, response, Utc::now())
    }

    #[test]
    fn test_parse_wrapped_payments_object() {
        let response = r#"Here is what I found:
```json
{"payments": [{
  "payment": {"amount": "1,500.00", "check_no_or_ref": "4531", "check_date": "01/16/2025"},
  "payer": {"names": ["Dalene Eimon"]},
  "contact": {"address": {"line1": "805 Snead St", "city": "Paso Robles", "state": "CA", "zip": "93446"}}
}]}
```"#;
        let records = parse(response).unwrap();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.source_kind, SourceKind::HandwrittenCheck);
        assert_eq!(record.payment.amount.as_deref(), Some("1,500.00"));
        assert_eq!(record.payer.names, vec!["Dalene Eimon"]);
        assert_eq!(
            record.contact.address.as_ref().and_then(|a| a.zip.as_deref()),
            Some("93446")
        );
        assert_eq!(record.provenance.document_id, "check-4531.jpg");
    }

    #[test]
    fn test_numbers_accepted_for_text_fields() {
        let response = r#"{"payment": {"amount": 1500, "check_no_or_ref": 4531},
                          "contact": {"address": {"zip": 2134}}}"#;
        let records = parse(response).unwrap();
        assert_eq!(records[0].payment.amount.as_deref(), Some("1500"));
        assert_eq!(records[0].payment.check_no_or_ref.as_deref(), Some("4531"));
        assert_eq!(
            records[0].contact.address.as_ref().and_then(|a| a.zip.as_deref()),
            Some("2134")
        );
    }

    #[test]
    fn test_bare_array_with_lines_and_kind_override() {
        let response = r#"[
            {"line": 1, "source_kind": "ledger_entry", "payment": {"amount": "40.00", "check_no_or_ref": "1042"}},
            {"line": "2", "source_kind": "ledger_entry", "payment": {"amount": "25.00", "check_no_or_ref": "1043"}}
        ]"#;
        let records = parse(response).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].source_kind, SourceKind::LedgerEntry);
        assert_eq!(records[1].provenance.line, Some(2));
    }

    #[test]
    fn test_single_name_string_and_blank_values() {
        let response = r#"{"payer": {"name": "Dalene Eimon", "organization": "  "},
                          "payment": {"memo": ""}}"#;
        let records = parse(response).unwrap();
        assert_eq!(records[0].payer.names, vec!["Dalene Eimon"]);
        assert!(records[0].payer.organization.is_none());
        assert!(records[0].payment.memo.is_none());
    }

    #[test]
    fn test_schema_violations() {
        let wrong_type = parse(r#"{"payment": {"amount": {"value": 10}}}"#).unwrap_err();
        match wrong_type {
            Error::SchemaViolation { document, reason } => {
                assert_eq!(document, "check-4531.jpg");
                assert!(reason.contains("payment.amount"));
            }
            other => panic!("unexpected error: {other}"),
        }

        assert!(matches!(
            parse(r#"{"payments": "none"}"#),
            Err(Error::SchemaViolation { .. })
        ));
        assert!(matches!(
            parse(r#"{"payments": [42]}"#),
            Err(Error::SchemaViolation { .. })
        ));
        assert!(matches!(
            parse(r#"{"source_kind": "receipt"}"#),
            Err(Error::SchemaViolation { .. })
        ));
    }

    #[test]
    fn test_no_json_is_a_violation() {
        let err = parse("I could not read this check.").unwrap_err();
        assert!(err.to_string().contains("no JSON found"));
    }

    #[test]
    fn test_empty_payments_list() {
        assert!(parse(r#"{"payments": []}"#).unwrap().is_empty());
    }
}
