//! Merge engine
//!
//! Groups normalized records that describe the same physical payment and
//! reconciles them into one [`CanonicalPayment`] per group.
//!
//! Grouping:
//! 1. Records with a check number/reference are keyed by it (OCR-confusable
//!    characters folded for numeric-looking check numbers).
//! 2. A key whose records disagree on amount is split into one group per
//!    amount cluster, each `heuristic` and flagged.
//! 3. Records without a reference join a keyed group only when the amount
//!    agrees, payer aliases overlap, no same-field date contradicts, and
//!    exactly one group qualifies. Otherwise they cluster among themselves
//!    under the same rule. Both paths are `heuristic`.
//!
//! Field resolution is per field family: the highest-priority source wins,
//! ties fall back to extraction time then record id. A tie between different
//! values lowers confidence to `corroborated`. Aliases are unioned; memos are
//! concatenated. Deposit dates never become payment dates.
//!
//! The result depends only on the set of input records, not their order.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::aliases::{alias_key, order_aliases};
use crate::models::{
    Address, AddressOrigin, CanonicalPayment, FieldFamily, MatchStatus, MergeConfidence,
    PaymentDateSource, PaymentRecord, RecordFlag, ReferenceClass, SourceKind, SyncStatus,
};

/// Merge tunables
#[derive(Debug, Clone, PartialEq)]
pub struct MergeConfig {
    /// Amounts less than this apart may share a payment (flagged unless
    /// identical)
    pub amount_epsilon: Decimal,
    /// Same-field dates further apart than this contradict each other
    /// when grouping records without a reference
    pub date_tolerance_days: i64,
    /// Joins distinct memos
    pub memo_separator: String,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            amount_epsilon: Decimal::new(1, 2),
            date_tolerance_days: 1,
            memo_separator: " | ".to_string(),
        }
    }
}

/// Merge with default settings, defaulting missing payment dates to today
pub fn merge(records: &[PaymentRecord]) -> Vec<CanonicalPayment> {
    merge_as_of(records, &MergeConfig::default(), Utc::now().date_naive())
}

/// Merge with explicit settings and an explicit "today" for the
/// payment-date fallback
pub fn merge_as_of(
    records: &[PaymentRecord],
    config: &MergeConfig,
    today: NaiveDate,
) -> Vec<CanonicalPayment> {
    let mut sorted: Vec<&PaymentRecord> = records.iter().collect();
    sorted.sort_by(|a, b| {
        a.id.cmp(&b.id)
            .then(a.provenance.extracted_at.cmp(&b.provenance.extracted_at))
    });
    sorted.dedup_by(|a, b| a.id == b.id);

    let mut keyed: BTreeMap<(ReferenceClass, String), Vec<&PaymentRecord>> = BTreeMap::new();
    let mut unkeyed = Vec::new();
    for record in sorted {
        match record.check_no_or_ref.as_deref() {
            Some(reference) => {
                let class = record.source_kind.reference_class();
                keyed
                    .entry((class, grouping_key(reference, class)))
                    .or_default()
                    .push(record);
            }
            None => unkeyed.push(record),
        }
    }

    let mut groups: Vec<Group> = Vec::new();
    for members in keyed.into_values() {
        groups.extend(split_by_amount(members, config));
    }

    // Fallback attachment is decided against the keyed groups as they are
    // before any attachment, so one unkeyed record cannot steer another.
    let mut attachments: Vec<(usize, &PaymentRecord)> = Vec::new();
    let mut leftovers: Vec<&PaymentRecord> = Vec::new();
    for record in unkeyed {
        let fits: Vec<usize> = groups
            .iter()
            .enumerate()
            .filter(|(_, group)| fallback_compatible(record, &group.members, config))
            .map(|(i, _)| i)
            .collect();
        match fits.as_slice() {
            [only] => attachments.push((*only, record)),
            [] => leftovers.push(record),
            _ => {
                debug!(
                    record = %record.id,
                    candidates = fits.len(),
                    "Unreferenced record fits several payments; left separate"
                );
                leftovers.push(record);
            }
        }
    }
    for (index, record) in attachments {
        debug!(record = %record.id, "Attached unreferenced record by amount and payer");
        let group = &mut groups[index];
        group.members.push(record);
        group.fallback();
    }

    groups.extend(cluster_unreferenced(leftovers, config));

    let mut payments: Vec<CanonicalPayment> = groups
        .into_iter()
        .map(|group| build_canonical(group, config, today))
        .collect();
    payments.sort_by(|a, b| {
        a.payment_date
            .cmp(&b.payment_date)
            .then(a.fingerprint.cmp(&b.fingerprint))
    });

    info!(
        records = records.len(),
        payments = payments.len(),
        "Merged records into canonical payments"
    );
    payments
}

/// Stable identity of a group: hash of its sorted constituent ids
pub fn fingerprint(constituent_ids: &BTreeSet<String>) -> String {
    let mut hasher = Sha256::new();
    for id in constituent_ids {
        hasher.update(id.as_bytes());
        hasher.update(b"\n");
    }
    let digest = hex::encode(hasher.finalize());
    format!("pay_{}", &digest[..16])
}

/// Grouping key for a check number or reference.
///
/// Numeric-looking check numbers have OCR-confusable letters folded to
/// digits and leading zeros removed, so "l042", "1042" and "01042" share a
/// key. The stored value is never rewritten.
pub fn grouping_key(reference: &str, class: ReferenceClass) -> String {
    if class == ReferenceClass::Online {
        return reference.to_lowercase();
    }

    let digits = reference.chars().filter(|c| c.is_ascii_digit()).count();
    let len = reference.chars().count();
    if digits == 0 || digits * 2 < len {
        return reference.to_lowercase();
    }

    let folded: String = reference
        .chars()
        .map(|c| match c {
            'O' | 'o' | 'Q' | 'D' => '0',
            'l' | 'I' | 'i' | '|' => '1',
            'Z' | 'z' => '2',
            'S' | 's' => '5',
            'B' => '8',
            'b' => '6',
            'g' => '9',
            other => other.to_ascii_lowercase(),
        })
        .collect();
    let stripped = folded.trim_start_matches('0');
    if stripped.is_empty() {
        "0".to_string()
    } else {
        stripped.to_string()
    }
}

/// Literal comparison form: case and leading zeros only, no folding
fn literal_reference(reference: &str) -> String {
    let lower = reference.to_lowercase();
    let stripped = lower.trim_start_matches('0');
    if stripped.is_empty() {
        "0".to_string()
    } else {
        stripped.to_string()
    }
}

struct Group<'a> {
    members: Vec<&'a PaymentRecord>,
    confidence: MergeConfidence,
    flags: Vec<RecordFlag>,
}

impl<'a> Group<'a> {
    fn new(members: Vec<&'a PaymentRecord>) -> Self {
        Self {
            members,
            confidence: MergeConfidence::Exact,
            flags: Vec::new(),
        }
    }

    fn fallback(&mut self) {
        self.confidence = MergeConfidence::Heuristic;
        if !self.flags.contains(&RecordFlag::FallbackGrouping) {
            self.flags.push(RecordFlag::FallbackGrouping);
        }
    }

    /// Amount of the highest-priority member
    fn amount(&self) -> Decimal {
        ranked(&self.members, FieldFamily::Amount)
            .first()
            .map(|r| r.amount)
            .unwrap_or_default()
    }
}

/// Members ordered by priority for `family`, then extraction time, then id
fn ranked<'a>(members: &[&'a PaymentRecord], family: FieldFamily) -> Vec<&'a PaymentRecord> {
    let mut ordered = members.to_vec();
    ordered.sort_by(|a, b| {
        b.source_kind
            .priority_for(family)
            .cmp(&a.source_kind.priority_for(family))
            .then(a.provenance.extracted_at.cmp(&b.provenance.extracted_at))
            .then(a.id.cmp(&b.id))
    });
    ordered
}

/// Split one reference key into amount clusters.
///
/// Each cluster is anchored on its smallest amount, so amounts cannot chain
/// beyond the epsilon.
fn split_by_amount<'a>(members: Vec<&'a PaymentRecord>, config: &MergeConfig) -> Vec<Group<'a>> {
    let mut by_amount = members;
    by_amount.sort_by(|a, b| a.amount.cmp(&b.amount).then(a.id.cmp(&b.id)));

    let mut clusters: Vec<Vec<&PaymentRecord>> = Vec::new();
    for record in by_amount {
        let joins = clusters
            .last()
            .and_then(|cluster| cluster.first())
            .map(|anchor| within_epsilon(record.amount, anchor.amount, config))
            .unwrap_or(false);
        if joins {
            if let Some(cluster) = clusters.last_mut() {
                cluster.push(record);
                continue;
            }
        }
        clusters.push(vec![record]);
    }

    let mut groups: Vec<Group> = clusters.into_iter().map(Group::new).collect();
    if groups.len() > 1 {
        let amounts: Vec<Decimal> = groups.iter().map(Group::amount).collect();
        let reference = groups
            .iter()
            .flat_map(|g| ranked(&g.members, FieldFamily::Reference))
            .find_map(|r| r.check_no_or_ref.clone())
            .unwrap_or_default();
        debug!(
            reference = %reference,
            clusters = groups.len(),
            "Reference seen with different amounts; splitting"
        );
        for group in &mut groups {
            group.confidence = MergeConfidence::Heuristic;
            group.flags.push(RecordFlag::AmountSplit {
                check_no_or_ref: reference.clone(),
                amounts: amounts.clone(),
            });
        }
    }
    groups
}

/// Identical amounts always agree; others only when strictly closer than
/// the epsilon
fn within_epsilon(a: Decimal, b: Decimal, config: &MergeConfig) -> bool {
    a == b || (a - b).abs() < config.amount_epsilon
}

/// Can an unreferenced record join these members?
fn fallback_compatible(record: &PaymentRecord, members: &[&PaymentRecord], config: &MergeConfig) -> bool {
    let amount = ranked(members, FieldFamily::Amount)
        .first()
        .map(|r| r.amount)
        .unwrap_or_default();
    if !within_epsilon(record.amount, amount, config) {
        return false;
    }

    let names = name_keys(record);
    if names.is_empty() || !members.iter().any(|m| !names.is_disjoint(&name_keys(m))) {
        return false;
    }

    !members.iter().any(|m| dates_contradict(record, m, config.date_tolerance_days))
}

fn name_keys(record: &PaymentRecord) -> BTreeSet<String> {
    record
        .aliases
        .iter()
        .chain(record.organization_name.iter())
        .map(|a| alias_key(a))
        .filter(|k| !k.is_empty())
        .collect()
}

fn dates_contradict(a: &PaymentRecord, b: &PaymentRecord, tolerance_days: i64) -> bool {
    [
        (a.payment_date, b.payment_date),
        (a.check_date, b.check_date),
        (a.postmark_date, b.postmark_date),
        (a.deposit_date, b.deposit_date),
    ]
    .into_iter()
    .any(|pair| match pair {
        (Some(x), Some(y)) => (x - y).num_days().abs() > tolerance_days,
        _ => false,
    })
}

/// Greedy clustering of records that have no reference, in id order
fn cluster_unreferenced<'a>(records: Vec<&'a PaymentRecord>, config: &MergeConfig) -> Vec<Group<'a>> {
    let mut clusters: Vec<Vec<&PaymentRecord>> = Vec::new();
    for record in records {
        match clusters
            .iter()
            .position(|cluster| fallback_compatible(record, cluster, config))
        {
            Some(index) => clusters[index].push(record),
            None => clusters.push(vec![record]),
        }
    }

    clusters
        .into_iter()
        .map(|members| {
            let grouped = members.len() > 1;
            let mut group = Group::new(members);
            if grouped {
                group.fallback();
            }
            group
        })
        .collect()
}

/// Picks one value per scalar field and records the conflicts it saw
struct Resolver<'a> {
    members: Vec<&'a PaymentRecord>,
    confidence: MergeConfidence,
    flags: Vec<RecordFlag>,
}

impl<'a> Resolver<'a> {
    /// Highest-priority value; a different value at the same priority is a
    /// conflict
    fn scalar<T, F>(&mut self, field: &str, family: FieldFamily, get: F) -> Option<T>
    where
        T: Clone + PartialEq + ToString,
        F: Fn(&PaymentRecord) -> Option<T>,
    {
        let candidates: Vec<(u8, T)> = ranked(&self.members, family)
            .into_iter()
            .filter_map(|r| get(r).map(|v| (r.source_kind.priority_for(family), v)))
            .collect();
        let (top, winner) = candidates.first().cloned()?;

        let mut discarded: Vec<String> = Vec::new();
        for (priority, value) in candidates.iter().skip(1) {
            if *priority == top && *value != winner {
                let text = value.to_string();
                if !discarded.contains(&text) {
                    discarded.push(text);
                }
            }
        }
        if !discarded.is_empty() {
            self.conflict(field, winner.to_string(), discarded.join(", "));
        }
        Some(winner)
    }

    fn conflict(&mut self, field: &str, kept: String, discarded: String) {
        debug!(field, kept = %kept, discarded = %discarded, "Equal-priority sources disagree");
        self.confidence = self.confidence.downgrade(MergeConfidence::Corroborated);
        self.flags.push(RecordFlag::MergeConflict {
            field: field.to_string(),
            kept,
            discarded,
        });
    }

    /// Amount: authoritative source wins; any other amount among the
    /// constituents makes the grouping heuristic
    fn amount(&mut self) -> Decimal {
        let ranked = ranked(&self.members, FieldFamily::Amount);
        let Some(kept) = ranked.first().map(|r| r.amount) else {
            return Decimal::ZERO;
        };

        let mut others: Vec<Decimal> = Vec::new();
        for record in &ranked {
            if record.amount != kept && !others.contains(&record.amount) {
                others.push(record.amount);
            }
        }
        if !others.is_empty() {
            others.sort();
            debug!(kept = %kept, others = ?others, "Amount read differently across sources");
            self.confidence = MergeConfidence::Heuristic;
            self.flags.push(RecordFlag::AmountDisagreement { kept, others });
        }
        kept
    }

    /// Check number/reference: authoritative source wins, any literal
    /// disagreement makes the grouping heuristic
    fn reference(&mut self) -> Option<String> {
        let ranked = ranked(&self.members, FieldFamily::Reference);
        let kept = ranked.iter().find_map(|r| r.check_no_or_ref.clone())?;
        let kept_literal = literal_reference(&kept);

        let mut others: Vec<String> = Vec::new();
        for value in ranked.iter().filter_map(|r| r.check_no_or_ref.as_ref()) {
            if literal_reference(value) != kept_literal && !others.contains(value) {
                others.push(value.clone());
            }
        }
        if !others.is_empty() {
            debug!(kept = %kept, others = ?others, "Check number read differently across sources");
            self.confidence = MergeConfidence::Heuristic;
            self.flags.push(RecordFlag::ReferenceDisagreement {
                kept: kept.clone(),
                others,
            });
        }
        Some(kept)
    }

    /// Address by origin: envelope over check/online over ledger
    fn address(&mut self) -> (Option<Address>, Option<AddressOrigin>) {
        let mut candidates: Vec<(&'a PaymentRecord, &'a Address, AddressOrigin)> = self
            .members
            .clone()
            .into_iter()
            .filter_map(|r| match (&r.address, r.address_origin) {
                (Some(address), Some(origin)) => Some((r, address, origin)),
                _ => None,
            })
            .collect();
        candidates.sort_by(|(ra, _, oa), (rb, _, ob)| {
            ob.priority()
                .cmp(&oa.priority())
                .then(ra.provenance.extracted_at.cmp(&rb.provenance.extracted_at))
                .then(ra.id.cmp(&rb.id))
        });

        let Some(&(_, winner, origin)) = candidates.first() else {
            return (None, None);
        };
        let mut discarded: Vec<String> = Vec::new();
        for (_, address, other_origin) in candidates.iter().skip(1) {
            if other_origin.priority() == origin.priority() && *address != winner {
                let text = address.one_line();
                if !discarded.contains(&text) {
                    discarded.push(text);
                }
            }
        }
        if !discarded.is_empty() {
            self.conflict("address", winner.one_line(), discarded.join("; "));
        }
        (Some(winner.clone()), Some(origin))
    }

    /// Distinct non-empty memos in source order
    fn memo(&self, separator: &str) -> Option<String> {
        let mut seen: Vec<String> = Vec::new();
        let mut memos: Vec<&str> = Vec::new();
        for record in ranked(&self.members, FieldFamily::Payer) {
            if let Some(memo) = record.memo.as_deref() {
                let key = memo.trim().to_lowercase();
                if !key.is_empty() && !seen.contains(&key) {
                    seen.push(key);
                    memos.push(memo.trim());
                }
            }
        }
        if memos.is_empty() {
            None
        } else {
            Some(memos.join(separator))
        }
    }
}

/// Chain of date sources for the payment date, by the group's dominant kind
fn payment_date_chain(kinds: &BTreeSet<SourceKind>) -> [PaymentDateSource; 3] {
    use PaymentDateSource::*;
    if kinds.contains(&SourceKind::OnlinePayment) {
        [Transaction, CheckDate, Postmark]
    } else if kinds.contains(&SourceKind::PrintedCheck) {
        [CheckDate, Postmark, Transaction]
    } else if kinds.contains(&SourceKind::HandwrittenCheck) {
        [Postmark, CheckDate, Transaction]
    } else {
        [Transaction, CheckDate, Postmark]
    }
}

fn build_canonical(group: Group, config: &MergeConfig, today: NaiveDate) -> CanonicalPayment {
    let Group {
        members,
        confidence,
        flags: group_flags,
    } = group;

    let mut resolver = Resolver {
        members,
        confidence,
        flags: Vec::new(),
    };

    let check_no_or_ref = resolver.reference();
    let amount = resolver.amount();
    let check_date = resolver.scalar("check_date", FieldFamily::CheckDate, |r| r.check_date);
    let postmark_date =
        resolver.scalar("postmark_date", FieldFamily::PostmarkDate, |r| r.postmark_date);
    let transaction_date =
        resolver.scalar("payment_date", FieldFamily::TransactionDate, |r| r.payment_date);
    let deposit_date = resolver.scalar("deposit_date", FieldFamily::DepositDate, |r| r.deposit_date);
    let deposit_method = resolver.scalar("deposit_method", FieldFamily::DepositDate, |r| {
        r.deposit_method.clone()
    });
    let organization_name = resolver.scalar("organization_name", FieldFamily::Payer, |r| {
        r.organization_name.clone()
    });
    let salutation = resolver.scalar("salutation", FieldFamily::Payer, |r| r.salutation.clone());
    let email = resolver.scalar("email", FieldFamily::Contact, |r| r.email.clone());
    let phone = resolver.scalar("phone", FieldFamily::Contact, |r| r.phone.clone());
    let (address, address_origin) = resolver.address();
    let memo = resolver.memo(&config.memo_separator);

    let aliases = order_aliases(
        resolver
            .members
            .iter()
            .flat_map(|r| r.aliases.iter().cloned())
            .collect::<Vec<_>>(),
    );
    let source_kinds: BTreeSet<SourceKind> =
        resolver.members.iter().map(|r| r.source_kind).collect();
    let constituent_ids: BTreeSet<String> =
        resolver.members.iter().map(|r| r.id.clone()).collect();

    // Flags carried from records first, then grouping and resolution flags
    let mut flags: Vec<RecordFlag> = Vec::new();
    for flag in resolver
        .members
        .iter()
        .flat_map(|r| r.flags.iter())
        .chain(group_flags.iter())
        .chain(resolver.flags.iter())
    {
        if !flags.contains(flag) {
            flags.push(flag.clone());
        }
    }

    let mut payment_date = None;
    for source in payment_date_chain(&source_kinds) {
        let candidate = match source {
            PaymentDateSource::Postmark => postmark_date,
            PaymentDateSource::CheckDate => check_date,
            PaymentDateSource::Transaction => transaction_date,
            PaymentDateSource::Defaulted => None,
        };
        if let Some(date) = candidate {
            payment_date = Some((date, source));
            break;
        }
    }
    let (payment_date, payment_date_source) = match payment_date {
        Some(found) => found,
        None => {
            flags.push(RecordFlag::PaymentDateDefaulted { date: today });
            (today, PaymentDateSource::Defaulted)
        }
    };

    CanonicalPayment {
        fingerprint: fingerprint(&constituent_ids),
        version: 1,
        amount,
        check_no_or_ref,
        payment_date,
        payment_date_source,
        check_date,
        postmark_date,
        deposit_date,
        deposit_method,
        memo,
        aliases,
        organization_name,
        salutation,
        address,
        address_origin,
        email,
        phone,
        source_kinds,
        constituent_ids,
        merge_confidence: resolver.confidence,
        match_status: MatchStatus::Unmatched,
        payer_directory_id: None,
        address_mismatch: false,
        review_reason: None,
        sync_status: SyncStatus::Pending,
        flags,
    }
}
