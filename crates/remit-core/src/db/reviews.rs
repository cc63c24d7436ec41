//! Stored canonical payments and the review ledger
//!
//! The pipeline only reads this ledger. Humans write it through the review
//! commands and the sync collaborator writes the sync status.

use std::collections::HashMap;

use rusqlite::{params, params_from_iter, OptionalExtension, Row};
use tracing::{debug, info};

use super::Database;
use crate::error::{Error, Result};
use crate::models::{CanonicalPayment, MatchStatus, SyncStatus};
use crate::pipeline::{PriorReview, ReviewLedger};

/// Bound on `IN (...)` placeholders per statement
const LOOKUP_CHUNK: usize = 500;

const STORED_COLUMNS: &str = "c.data, COALESCE(r.address_mismatch_dismissed, 0), \
     COALESCE(r.creation_requested, 0), COALESCE(r.sync_status, 'pending')";

/// A stored payment with its review state
#[derive(Debug, Clone, PartialEq)]
pub struct StoredPayment {
    /// The payment as last saved; `sync_status` reflects the ledger
    pub payment: CanonicalPayment,
    pub address_mismatch_dismissed: bool,
    pub creation_requested: bool,
}

impl Database {
    /// Store a ready batch, replacing earlier versions of the same payments
    pub fn save_payments(&self, payments: &[CanonicalPayment]) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for payment in payments {
            let data = serde_json::to_string(payment)?;
            tx.execute(
                "INSERT INTO canonical_payments
                    (fingerprint, version, match_status, payer_directory_id, payment_date, amount, data)
                 VALUES (?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(fingerprint) DO UPDATE SET
                    version = excluded.version,
                    match_status = excluded.match_status,
                    payer_directory_id = excluded.payer_directory_id,
                    payment_date = excluded.payment_date,
                    amount = excluded.amount,
                    data = excluded.data,
                    updated_at = CURRENT_TIMESTAMP",
                params![
                    payment.fingerprint,
                    payment.version,
                    payment.match_status.as_str(),
                    payment.payer_directory_id,
                    payment.payment_date.to_string(),
                    payment.amount.to_string(),
                    data
                ],
            )?;
        }
        tx.commit()?;
        info!(count = payments.len(), "Saved canonical payments");
        Ok(payments.len())
    }

    pub fn get_payment(&self, fingerprint: &str) -> Result<Option<StoredPayment>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!(
                "SELECT {} FROM canonical_payments c
                 LEFT JOIN payment_reviews r ON r.fingerprint = c.fingerprint
                 WHERE c.fingerprint = ?",
                STORED_COLUMNS
            ),
            params![fingerprint],
            stored_from_row,
        )
        .optional()?
        .transpose()
    }

    /// Stored payments by payment date, optionally of one match status
    pub fn list_payments(&self, status: Option<MatchStatus>) -> Result<Vec<StoredPayment>> {
        let conn = self.conn()?;
        let base = format!(
            "SELECT {} FROM canonical_payments c
             LEFT JOIN payment_reviews r ON r.fingerprint = c.fingerprint",
            STORED_COLUMNS
        );

        let rows = match status {
            Some(status) => {
                let mut stmt = conn.prepare(&format!(
                    "{} WHERE c.match_status = ? ORDER BY c.payment_date, c.fingerprint",
                    base
                ))?;
                let rows = stmt
                    .query_map(params![status.as_str()], stored_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                rows
            }
            None => {
                let mut stmt =
                    conn.prepare(&format!("{} ORDER BY c.payment_date, c.fingerprint", base))?;
                let rows = stmt
                    .query_map([], stored_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                rows
            }
        };

        rows.into_iter().collect()
    }

    /// Record that a reviewer accepted the directory address as it is
    ///
    /// The stored payment becomes `matched` under a new version; later runs
    /// keep it that way while the match stays on the same payer.
    pub fn dismiss_address_mismatch(&self, fingerprint: &str) -> Result<()> {
        let stored = self.require_payment(fingerprint)?;
        if stored.payment.match_status != MatchStatus::MatchedAddressMismatch
            && !stored.address_mismatch_dismissed
        {
            return Err(Error::InvalidData(format!(
                "Payment {} has no address mismatch to dismiss (status: {})",
                fingerprint, stored.payment.match_status
            )));
        }

        let mut payment = stored.payment;
        if payment.match_status != MatchStatus::Matched {
            payment.version += 1;
        }
        payment.match_status = MatchStatus::Matched;
        payment.address_mismatch = false;
        payment.review_reason = None;
        let data = serde_json::to_string(&payment)?;

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO payment_reviews (fingerprint, address_mismatch_dismissed) VALUES (?, 1)
             ON CONFLICT(fingerprint) DO UPDATE SET
                address_mismatch_dismissed = 1,
                updated_at = CURRENT_TIMESTAMP",
            params![fingerprint],
        )?;
        tx.execute(
            "UPDATE canonical_payments
             SET version = ?, match_status = ?, data = ?, updated_at = CURRENT_TIMESTAMP
             WHERE fingerprint = ?",
            params![payment.version, payment.match_status.as_str(), data, fingerprint],
        )?;
        tx.commit()?;

        debug!(fingerprint, version = payment.version, "Address mismatch dismissed");
        Ok(())
    }

    /// Record that a creation request went out for a `new` payment
    pub fn mark_creation_requested(&self, fingerprint: &str) -> Result<()> {
        let stored = self.require_payment(fingerprint)?;
        if stored.payment.match_status != MatchStatus::New {
            return Err(Error::InvalidData(format!(
                "Payment {} is not a new payer (status: {})",
                fingerprint, stored.payment.match_status
            )));
        }

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO payment_reviews (fingerprint, creation_requested) VALUES (?, 1)
             ON CONFLICT(fingerprint) DO UPDATE SET
                creation_requested = 1,
                updated_at = CURRENT_TIMESTAMP",
            params![fingerprint],
        )?;
        Ok(())
    }

    /// Record the outcome of sending a payment downstream
    pub fn set_sync_status(&self, fingerprint: &str, status: SyncStatus) -> Result<()> {
        self.require_payment(fingerprint)?;

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO payment_reviews (fingerprint, sync_status) VALUES (?, ?)
             ON CONFLICT(fingerprint) DO UPDATE SET
                sync_status = excluded.sync_status,
                updated_at = CURRENT_TIMESTAMP",
            params![fingerprint, status.as_str()],
        )?;
        Ok(())
    }

    fn require_payment(&self, fingerprint: &str) -> Result<StoredPayment> {
        self.get_payment(fingerprint)?
            .ok_or_else(|| Error::NotFound(format!("payment {}", fingerprint)))
    }
}

/// The JSON column is decoded outside rusqlite so a bad row surfaces as `Error::Json`
fn stored_from_row(row: &Row<'_>) -> rusqlite::Result<Result<StoredPayment>> {
    let data: String = row.get(0)?;
    let address_mismatch_dismissed: bool = row.get(1)?;
    let creation_requested: bool = row.get(2)?;
    let sync_status: String = row.get(3)?;

    Ok(serde_json::from_str::<CanonicalPayment>(&data)
        .map_err(Error::from)
        .map(|mut payment| {
            payment.sync_status = sync_status.parse().unwrap_or_default();
            StoredPayment {
                payment,
                address_mismatch_dismissed,
                creation_requested,
            }
        }))
}

impl ReviewLedger for Database {
    fn prior_reviews(&self, fingerprints: &[String]) -> Result<HashMap<String, PriorReview>> {
        let conn = self.conn()?;
        let mut priors = HashMap::new();

        for chunk in fingerprints.chunks(LOOKUP_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "SELECT c.fingerprint, c.version, c.match_status, c.payer_directory_id,
                        COALESCE(r.address_mismatch_dismissed, 0),
                        COALESCE(r.creation_requested, 0),
                        COALESCE(r.sync_status, 'pending')
                 FROM canonical_payments c
                 LEFT JOIN payment_reviews r ON r.fingerprint = c.fingerprint
                 WHERE c.fingerprint IN ({})",
                placeholders
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| {
                let status: String = row.get(2)?;
                let sync: String = row.get(6)?;
                Ok((
                    row.get::<_, String>(0)?,
                    PriorReview {
                        version: row.get(1)?,
                        match_status: status.parse().unwrap_or_default(),
                        payer_directory_id: row.get(3)?,
                        address_mismatch_dismissed: row.get(4)?,
                        creation_requested: row.get(5)?,
                        sync_status: sync.parse().unwrap_or_default(),
                    },
                ))
            })?;
            for row in rows {
                let (fingerprint, prior) = row?;
                priors.insert(fingerprint, prior);
            }
        }

        Ok(priors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Address, MergeConfidence, PaymentDateSource};
    use chrono::NaiveDate;
    use rust_decimal::Decimal;
    use std::collections::BTreeSet;

    fn payment(fingerprint: &str, status: MatchStatus, day: u32) -> CanonicalPayment {
        CanonicalPayment {
            fingerprint: fingerprint.into(),
            version: 1,
            amount: Decimal::new(150000, 2),
            check_no_or_ref: Some("4531".into()),
            payment_date: NaiveDate::from_ymd_opt(2025, 1, day).unwrap(),
            payment_date_source: PaymentDateSource::CheckDate,
            check_date: NaiveDate::from_ymd_opt(2025, 1, day),
            postmark_date: None,
            deposit_date: None,
            deposit_method: Some("check".into()),
            memo: None,
            aliases: vec!["Dalene Eimon".into()],
            organization_name: None,
            salutation: None,
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
            constituent_ids: BTreeSet::from(["rec_a".to_string()]),
            merge_confidence: MergeConfidence::Exact,
            match_status: status,
            payer_directory_id: match status {
                MatchStatus::Matched | MatchStatus::MatchedAddressMismatch => Some("C-101".into()),
                _ => None,
            },
            address_mismatch: status == MatchStatus::MatchedAddressMismatch,
            review_reason: None,
            sync_status: SyncStatus::Pending,
            flags: Vec::new(),
        }
    }

    #[test]
    fn test_save_and_list_payments() {
        let db = Database::in_memory().unwrap();
        db.save_payments(&[
            payment("pay_b", MatchStatus::New, 20),
            payment("pay_a", MatchStatus::Matched, 16),
        ])
        .unwrap();

        let all = db.list_payments(None).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].payment.fingerprint, "pay_a");
        assert_eq!(all[0].payment.amount, Decimal::new(150000, 2));

        let new = db.list_payments(Some(MatchStatus::New)).unwrap();
        assert_eq!(new.len(), 1);
        assert_eq!(new[0].payment.fingerprint, "pay_b");
    }

    #[test]
    fn test_save_replaces_same_fingerprint() {
        let db = Database::in_memory().unwrap();
        db.save_payments(&[payment("pay_a", MatchStatus::New, 16)]).unwrap();
        let mut again = payment("pay_a", MatchStatus::Matched, 16);
        again.version = 2;
        db.save_payments(&[again]).unwrap();

        let all = db.list_payments(None).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].payment.version, 2);
        assert_eq!(all[0].payment.match_status, MatchStatus::Matched);
    }

    #[test]
    fn test_prior_reviews_reflect_stored_state() {
        let db = Database::in_memory().unwrap();
        db.save_payments(&[
            payment("pay_a", MatchStatus::MatchedAddressMismatch, 16),
            payment("pay_b", MatchStatus::New, 20),
        ])
        .unwrap();
        db.dismiss_address_mismatch("pay_a").unwrap();
        db.mark_creation_requested("pay_b").unwrap();
        db.set_sync_status("pay_b", SyncStatus::Sent).unwrap();

        let priors = db
            .prior_reviews(&["pay_a".into(), "pay_b".into(), "pay_zzz".into()])
            .unwrap();
        assert_eq!(priors.len(), 2);

        let a = &priors["pay_a"];
        assert!(a.address_mismatch_dismissed);
        assert_eq!(a.match_status, MatchStatus::Matched);
        assert_eq!(a.payer_directory_id.as_deref(), Some("C-101"));

        let b = &priors["pay_b"];
        assert!(b.creation_requested);
        assert_eq!(b.sync_status, SyncStatus::Sent);
        assert_eq!(b.version, 1);
    }

    #[test]
    fn test_dismiss_rewrites_stored_payment() {
        let db = Database::in_memory().unwrap();
        db.save_payments(&[payment("pay_a", MatchStatus::MatchedAddressMismatch, 16)])
            .unwrap();
        db.dismiss_address_mismatch("pay_a").unwrap();

        let stored = db.get_payment("pay_a").unwrap().unwrap();
        assert!(stored.address_mismatch_dismissed);
        assert_eq!(stored.payment.match_status, MatchStatus::Matched);
        assert!(!stored.payment.address_mismatch);
        assert_eq!(stored.payment.version, 2);

        let priors = db.prior_reviews(&["pay_a".into()]).unwrap();
        assert_eq!(priors["pay_a"].version, 2);

        // Dismissing twice is harmless
        db.dismiss_address_mismatch("pay_a").unwrap();
        assert_eq!(db.get_payment("pay_a").unwrap().unwrap().payment.version, 2);
    }

    #[test]
    fn test_review_commands_check_status() {
        let db = Database::in_memory().unwrap();
        db.save_payments(&[payment("pay_a", MatchStatus::Matched, 16)]).unwrap();

        assert!(matches!(
            db.dismiss_address_mismatch("pay_a"),
            Err(Error::InvalidData(_))
        ));
        assert!(matches!(
            db.mark_creation_requested("pay_a"),
            Err(Error::InvalidData(_))
        ));
        assert!(matches!(
            db.set_sync_status("pay_missing", SyncStatus::Sent),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_many_fingerprints_are_chunked() {
        let db = Database::in_memory().unwrap();
        let payments: Vec<_> = (0..(LOOKUP_CHUNK + 20))
            .map(|i| payment(&format!("pay_{:04}", i), MatchStatus::Unmatched, 1 + (i % 28) as u32))
            .collect();
        db.save_payments(&payments).unwrap();

        let fingerprints: Vec<String> = payments.iter().map(|p| p.fingerprint.clone()).collect();
        assert_eq!(db.prior_reviews(&fingerprints).unwrap().len(), LOOKUP_CHUNK + 20);
    }
}
