//! Identity matcher
//!
//! Maps a canonical payment to a payer directory entry. The directory is an
//! injected [`DirectoryLookup`]; the matcher only proposes. New payers come
//! back as [`NewPayerRequest`]s and address changes as
//! [`AddressUpdateProposal`]s for a human or the directory collaborator to
//! apply.
//!
//! Classification:
//! - no candidate above the accept threshold: `New`
//! - one candidate above it, or one that dominates the rest by the
//!   dominance margin: `Matched`, or `MatchedAddressMismatch` when any
//!   address component differs
//! - several candidates without a dominant one, or a best candidate whose
//!   entity type conflicts with the payer: `Rejected`, with a reason

use std::collections::BTreeMap;

use async_trait::async_trait;
use strsim::{jaro_winkler, normalized_levenshtein};
use tracing::{debug, info, warn};

use crate::aliases::{alias_key, is_organization, parse_person, PersonName};
use crate::error::{Error, Result};
use crate::models::{
    Address, AddressUpdateProposal, CanonicalPayment, MatchStatus, NewPayerRequest,
    PayerDirectoryEntry,
};

/// One directory query: the alias set, or the organization alone
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DirectoryQuery {
    pub aliases: Vec<String>,
    pub organization: Option<String>,
}

impl DirectoryQuery {
    /// Organizations are not alias-expanded, so the organization name
    /// replaces the alias set as the query key
    pub fn for_payment(payment: &CanonicalPayment) -> Self {
        match payment.organization_name {
            Some(ref org) => Self {
                aliases: Vec::new(),
                organization: Some(org.clone()),
            },
            None => Self {
                aliases: payment.aliases.clone(),
                organization: None,
            },
        }
    }

    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty() && self.organization.is_none()
    }
}

/// The external payer directory
#[async_trait]
pub trait DirectoryLookup: Send + Sync {
    /// Entries that share any name signal with the aliases or organization
    async fn find_candidates(
        &self,
        aliases: &[String],
        organization: Option<&str>,
    ) -> Result<Vec<PayerDirectoryEntry>>;

    /// One call for many queries; results are positional
    async fn find_candidates_bulk(
        &self,
        queries: &[DirectoryQuery],
    ) -> Result<Vec<Vec<PayerDirectoryEntry>>> {
        let mut results = Vec::with_capacity(queries.len());
        for query in queries {
            results.push(
                self.find_candidates(&query.aliases, query.organization.as_deref())
                    .await?,
            );
        }
        Ok(results)
    }

    /// Create an entry from an approved proposal, returning its id
    async fn create_entry(&self, request: &NewPayerRequest) -> Result<String>;

    /// Apply an approved address change
    async fn update_address(&self, proposal: &AddressUpdateProposal) -> Result<()>;
}

/// How addresses are compared after normalization
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AddressComparison {
    /// Components must be identical
    Exact,
    /// Components may differ by at most this normalized edit distance
    /// (0.0 identical, 1.0 nothing in common). State and ZIP stay exact.
    EditDistance { max_normalized: f64 },
}

impl Default for AddressComparison {
    fn default() -> Self {
        Self::EditDistance {
            max_normalized: 0.15,
        }
    }
}

/// Matcher tunables
#[derive(Debug, Clone, PartialEq)]
pub struct MatchConfig {
    /// Minimum score for a candidate to count
    pub accept_threshold: f64,
    /// Lead the best candidate needs over the runner-up to win outright
    pub dominance_margin: f64,
    /// Jaro-Winkler similarity needed for a non-identical organization name
    pub org_fuzzy_threshold: f64,
    pub address_comparison: AddressComparison,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            accept_threshold: 0.6,
            dominance_margin: 0.2,
            org_fuzzy_threshold: 0.92,
            address_comparison: AddressComparison::default(),
        }
    }
}

/// A candidate with its score
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredCandidate {
    pub entry: PayerDirectoryEntry,
    pub score: f64,
    /// Matched on an identical alias or organization name
    pub exact: bool,
    /// Best name pairing shares the surname but not the first name or initial
    pub given_name_conflict: bool,
}

/// Result of classifying one payment
#[derive(Debug, Clone, PartialEq)]
pub struct MatchOutcome {
    pub status: MatchStatus,
    pub payer_directory_id: Option<String>,
    pub address_mismatch: bool,
    pub review_reason: Option<String>,
    pub new_payer: Option<NewPayerRequest>,
    pub address_update: Option<AddressUpdateProposal>,
}

/// Payments after one matching pass, with the proposals they raised
#[derive(Debug, Clone, Default)]
pub struct BatchMatch {
    pub payments: Vec<CanonicalPayment>,
    pub new_payers: Vec<NewPayerRequest>,
    pub address_updates: Vec<AddressUpdateProposal>,
    /// Batch-level problems (directory unavailable)
    pub warnings: Vec<String>,
}

pub struct IdentityMatcher {
    config: MatchConfig,
}

impl IdentityMatcher {
    pub fn new(config: MatchConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MatchConfig {
        &self.config
    }

    /// Match one payment against the directory.
    ///
    /// Returns a new version of the payment; running it again against an
    /// unchanged directory gives the same status, id and version.
    pub async fn match_payment(
        &self,
        payment: &CanonicalPayment,
        directory: &dyn DirectoryLookup,
    ) -> Result<CanonicalPayment> {
        let query = DirectoryQuery::for_payment(payment);
        let candidates = if query.is_empty() {
            Vec::new()
        } else {
            directory
                .find_candidates(&query.aliases, query.organization.as_deref())
                .await
                .map_err(into_unavailable)?
        };
        let outcome = self.classify(payment, &candidates);
        Ok(apply_outcome(payment, &outcome))
    }

    /// Match a whole batch with one bulk directory call.
    ///
    /// Identical queries are sent once. If the directory fails, every
    /// payment keeps its current state and the failure is reported as a
    /// warning.
    pub async fn match_batch(
        &self,
        payments: &[CanonicalPayment],
        directory: &dyn DirectoryLookup,
    ) -> BatchMatch {
        let mut index: BTreeMap<DirectoryQuery, usize> = BTreeMap::new();
        for payment in payments {
            let query = DirectoryQuery::for_payment(payment);
            if !query.is_empty() {
                let next = index.len();
                index.entry(query).or_insert(next);
            }
        }
        let mut queries: Vec<(DirectoryQuery, usize)> =
            index.iter().map(|(q, i)| (q.clone(), *i)).collect();
        queries.sort_by_key(|(_, i)| *i);
        let queries: Vec<DirectoryQuery> = queries.into_iter().map(|(q, _)| q).collect();

        debug!(
            payments = payments.len(),
            queries = queries.len(),
            "Looking up payers"
        );

        let results = if queries.is_empty() {
            Ok(Vec::new())
        } else {
            directory.find_candidates_bulk(&queries).await
        };
        let results = match results {
            Ok(results) if results.len() == queries.len() => results,
            Ok(results) => {
                let message = format!(
                    "Payer directory returned {} results for {} queries; matching skipped",
                    results.len(),
                    queries.len()
                );
                warn!("{}", message);
                return BatchMatch {
                    payments: payments.to_vec(),
                    warnings: vec![message],
                    ..Default::default()
                };
            }
            Err(e) => {
                let message = format!("Payer directory unavailable, payments left unmatched: {}", e);
                warn!("{}", message);
                return BatchMatch {
                    payments: payments.to_vec(),
                    warnings: vec![message],
                    ..Default::default()
                };
            }
        };

        let mut batch = BatchMatch::default();
        for payment in payments {
            let query = DirectoryQuery::for_payment(payment);
            let candidates: &[PayerDirectoryEntry] = match index.get(&query) {
                Some(i) => &results[*i],
                None => &[],
            };
            let outcome = self.classify(payment, candidates);
            if let Some(ref request) = outcome.new_payer {
                batch.new_payers.push(request.clone());
            }
            if let Some(ref proposal) = outcome.address_update {
                batch.address_updates.push(proposal.clone());
            }
            batch.payments.push(apply_outcome(payment, &outcome));
        }

        info!(
            matched = count(&batch.payments, MatchStatus::Matched),
            address_mismatch = count(&batch.payments, MatchStatus::MatchedAddressMismatch),
            new = count(&batch.payments, MatchStatus::New),
            rejected = count(&batch.payments, MatchStatus::Rejected),
            "Matched payments against payer directory"
        );
        batch
    }

    /// Classify a payment against already-fetched candidates
    pub fn classify(
        &self,
        payment: &CanonicalPayment,
        candidates: &[PayerDirectoryEntry],
    ) -> MatchOutcome {
        if payment.aliases.is_empty() && payment.organization_name.is_none() {
            return rejected("No payer name or organization could be read".to_string());
        }

        let mut scored: Vec<ScoredCandidate> = candidates
            .iter()
            .filter_map(|entry| self.score(payment, entry))
            .collect();
        scored.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.entry.id.cmp(&b.entry.id))
        });
        scored.dedup_by(|a, b| a.entry.id == b.entry.id);

        let above: Vec<&ScoredCandidate> = scored
            .iter()
            .filter(|c| c.score >= self.config.accept_threshold)
            .collect();

        let best = match above.as_slice() {
            [] => {
                let reason = scored.first().map(|c| {
                    format!(
                        "Closest directory entry '{}' scored {:.2}, below the accept threshold",
                        c.entry.display_name, c.score
                    )
                });
                return MatchOutcome {
                    status: MatchStatus::New,
                    payer_directory_id: None,
                    address_mismatch: false,
                    review_reason: reason,
                    new_payer: Some(new_payer_request(payment)),
                    address_update: None,
                };
            }
            [only] => *only,
            [first, second, ..] => {
                if first.score - second.score >= self.config.dominance_margin {
                    *first
                } else {
                    let listed = above
                        .iter()
                        .map(|c| format!("'{}' ({:.2})", c.entry.display_name, c.score))
                        .collect::<Vec<_>>()
                        .join(", ");
                    return rejected(format!(
                        "Ambiguous: {} directory entries match equally well: {}",
                        above.len(),
                        listed
                    ));
                }
            }
        };

        if let Some(reason) = entity_conflict(payment, best) {
            return rejected(reason);
        }

        let proposed = payment.address.clone().filter(|a| !a.is_empty());
        let differing = match proposed {
            Some(ref address) => {
                differing_components(address, best.entry.address.as_ref(), self.config.address_comparison)
            }
            None => Vec::new(),
        };

        match proposed {
            Some(address) if !differing.is_empty() => MatchOutcome {
                status: MatchStatus::MatchedAddressMismatch,
                payer_directory_id: Some(best.entry.id.clone()),
                address_mismatch: true,
                review_reason: Some(format!(
                    "Address differs from directory entry '{}' ({})",
                    best.entry.display_name,
                    differing.join(", ")
                )),
                new_payer: None,
                address_update: Some(AddressUpdateProposal {
                    fingerprint: payment.fingerprint.clone(),
                    payer_directory_id: best.entry.id.clone(),
                    current: best.entry.address.clone(),
                    proposed: address,
                    differing_fields: differing,
                }),
            },
            _ => MatchOutcome {
                status: MatchStatus::Matched,
                payer_directory_id: Some(best.entry.id.clone()),
                address_mismatch: false,
                review_reason: None,
                new_payer: None,
                address_update: None,
            },
        }
    }

    /// Score one candidate; `None` means no overlap at all
    fn score(&self, payment: &CanonicalPayment, entry: &PayerDirectoryEntry) -> Option<ScoredCandidate> {
        let (base, exact, given_name_conflict) = match payment.organization_name {
            Some(ref org) => {
                let (base, exact) = self.organization_score(org, entry);
                (base, exact, false)
            }
            None => person_score(&payment.aliases, entry),
        };
        if base <= 0.0 {
            return None;
        }

        let score = if exact {
            1.0
        } else {
            let mut score = base;
            if let (Some(ours), Some(theirs)) = (payment.address.as_ref(), entry.address.as_ref()) {
                if let (Some(a), Some(b)) = (street_number(ours), street_number(theirs)) {
                    if a == b {
                        score += 0.15;
                    }
                }
                if ours.zip.is_some() && ours.zip == theirs.zip {
                    score += 0.05;
                }
            }
            score.min(0.95)
        };

        Some(ScoredCandidate {
            entry: entry.clone(),
            score,
            exact,
            given_name_conflict: given_name_conflict && !exact,
        })
    }

    fn organization_score(&self, org: &str, entry: &PayerDirectoryEntry) -> (f64, bool) {
        let ours = alias_key(org);
        let mut best = 0.0_f64;
        for name in entry_names(entry) {
            let theirs = alias_key(name);
            if theirs == ours {
                return (1.0, true);
            }
            let similarity = jaro_winkler(&ours, &theirs);
            if similarity >= self.config.org_fuzzy_threshold {
                best = best.max(similarity * 0.9);
            }
        }
        (best, false)
    }
}

impl Default for IdentityMatcher {
    fn default() -> Self {
        Self::new(MatchConfig::default())
    }
}

/// Person scoring: identical alias, else surname/initial/fuzzy overlap.
/// The third value is set when the best pairing is a given-name conflict.
fn person_score(aliases: &[String], entry: &PayerDirectoryEntry) -> (f64, bool, bool) {
    let ours: Vec<String> = aliases.iter().map(|a| alias_key(a)).collect();
    if entry_names(entry).any(|name| ours.contains(&alias_key(name))) {
        return (1.0, true, false);
    }

    let our_people: Vec<PersonName> = aliases
        .iter()
        .filter(|a| !is_organization(a))
        .filter_map(|a| parse_person(a))
        .filter(|p| !p.given.is_empty())
        .collect();
    let their_people: Vec<PersonName> = entry_names(entry)
        .filter(|n| !is_organization(n))
        .filter_map(parse_person)
        .filter(|p| !p.given.is_empty())
        .collect();

    let mut best = 0.0_f64;
    let mut conflict = false;
    for a in &our_people {
        for b in &their_people {
            let (score, pair_conflict) = name_pair_score(a, b);
            if score > best || (score == best && conflict && !pair_conflict) {
                best = score;
                conflict = pair_conflict;
            }
        }
    }
    (best, false, conflict && best > 0.0)
}

/// Score of one name pairing, and whether the pairing shares a surname
/// while the first names or initials disagree
fn name_pair_score(a: &PersonName, b: &PersonName) -> (f64, bool) {
    let surname_a = a.surname_key();
    let surname_b = b.surname_key();
    let initials_agree = a.first_initial().is_some() && a.first_initial() == b.first_initial();
    let first_names_compatible = match (a.first_name(), b.first_name()) {
        (Some(x), Some(y)) => jaro_winkler(&x.to_lowercase(), &y.to_lowercase()) >= 0.85,
        _ => true,
    };

    if surname_a == surname_b {
        if initials_agree && first_names_compatible {
            (0.7, false)
        } else {
            (0.55, true)
        }
    } else {
        let similarity = jaro_winkler(&surname_a, &surname_b);
        if similarity >= 0.92 && initials_agree && first_names_compatible {
            (0.6 * similarity, false)
        } else {
            (0.0, false)
        }
    }
}

/// Display name plus known aliases and organization name
fn entry_names(entry: &PayerDirectoryEntry) -> impl Iterator<Item = &str> {
    std::iter::once(entry.display_name.as_str())
        .chain(entry.aliases.iter().map(String::as_str))
        .chain(entry.organization_name.iter().map(String::as_str))
}

/// Same surname or alias, but the directory entry is clearly another kind
/// of entity
fn entity_conflict(payment: &CanonicalPayment, best: &ScoredCandidate) -> Option<String> {
    let entry = &best.entry;
    let entry_is_org = entry.organization_name.is_some() || is_organization(&entry.display_name);

    match payment.organization_name {
        None if entry_is_org && !best.exact => Some(format!(
            "Payer '{}' resembles organization '{}' in the directory, not a person",
            payment.aliases.first().map(String::as_str).unwrap_or(""),
            entry.display_name
        )),
        Some(ref org) if !entry_is_org => Some(format!(
            "Organization '{}' matched personal directory entry '{}'",
            org, entry.display_name
        )),
        Some(ref org) if !best.exact => {
            let ours = digit_tokens(org);
            let theirs = entry
                .organization_name
                .as_deref()
                .map(digit_tokens)
                .unwrap_or_else(|| digit_tokens(&entry.display_name));
            if ours != theirs {
                Some(format!(
                    "Organization '{}' differs from '{}' in its numbering",
                    org, entry.display_name
                ))
            } else {
                None
            }
        }
        None if best.given_name_conflict => Some(format!(
            "Payer '{}' shares only a surname with directory entry '{}'; the first names differ",
            payment.aliases.first().map(String::as_str).unwrap_or(""),
            entry.display_name
        )),
        _ => None,
    }
}

fn digit_tokens(name: &str) -> Vec<String> {
    name.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().any(|c| c.is_ascii_digit()))
        .map(str::to_string)
        .collect()
}

fn street_number(address: &Address) -> Option<&str> {
    let first = address.line1.as_deref()?.split_whitespace().next()?;
    if first.chars().all(|c| c.is_ascii_digit()) {
        Some(first)
    } else {
        None
    }
}

/// Address components that differ under the comparison mode
pub fn differing_components(
    proposed: &Address,
    current: Option<&Address>,
    mode: AddressComparison,
) -> Vec<String> {
    let empty = Address::default();
    let current = current.unwrap_or(&empty);
    let mut differing = Vec::new();

    let pairs = [
        ("line1", &proposed.line1, &current.line1, true),
        ("city", &proposed.city, &current.city, true),
        ("state", &proposed.state, &current.state, false),
        ("zip", &proposed.zip, &current.zip, false),
    ];
    for (field, ours, theirs, fuzzy) in pairs {
        let Some(ours) = ours.as_deref() else {
            continue;
        };
        let same = match theirs.as_deref() {
            None => false,
            Some(theirs) => {
                let a = address_component_key(ours);
                let b = address_component_key(theirs);
                match mode {
                    AddressComparison::EditDistance { max_normalized } if fuzzy => {
                        1.0 - normalized_levenshtein(&a, &b) <= max_normalized
                    }
                    _ => a == b,
                }
            }
        };
        if !same {
            differing.push(field.to_string());
        }
    }
    differing
}

/// Lowercase, punctuation-free, with common street words abbreviated
fn address_component_key(value: &str) -> String {
    value
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|token| {
            let lower = token.to_lowercase();
            let short = match lower.as_str() {
                "street" => "st",
                "avenue" => "ave",
                "road" => "rd",
                "drive" => "dr",
                "boulevard" => "blvd",
                "lane" => "ln",
                "court" => "ct",
                "place" => "pl",
                "highway" => "hwy",
                "apartment" => "apt",
                "suite" => "ste",
                "north" => "n",
                "south" => "s",
                "east" => "e",
                "west" => "w",
                other => return other.to_string(),
            };
            short.to_string()
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn rejected(reason: String) -> MatchOutcome {
    MatchOutcome {
        status: MatchStatus::Rejected,
        payer_directory_id: None,
        address_mismatch: false,
        review_reason: Some(reason),
        new_payer: None,
        address_update: None,
    }
}

/// Creation proposal for a payer the directory does not know
pub fn new_payer_request(payment: &CanonicalPayment) -> NewPayerRequest {
    NewPayerRequest {
        fingerprint: payment.fingerprint.clone(),
        display_name: payment.display_name().unwrap_or_default().to_string(),
        aliases: payment.aliases.clone(),
        organization_name: payment.organization_name.clone(),
        salutation: payment.salutation.clone(),
        address: payment.address.clone(),
        email: payment.email.clone(),
        phone: payment.phone.clone(),
    }
}

/// New version of the payment carrying the outcome. The version only moves
/// when the outcome differs from what the payment already carries.
pub fn apply_outcome(payment: &CanonicalPayment, outcome: &MatchOutcome) -> CanonicalPayment {
    let changed = payment.match_status != outcome.status
        || payment.payer_directory_id != outcome.payer_directory_id
        || payment.address_mismatch != outcome.address_mismatch
        || payment.review_reason != outcome.review_reason;

    let mut next = payment.clone();
    if changed {
        next.version = payment.version + 1;
        next.match_status = outcome.status;
        next.payer_directory_id = outcome.payer_directory_id.clone();
        next.address_mismatch = outcome.address_mismatch;
        next.review_reason = outcome.review_reason.clone();
    }
    next
}

fn into_unavailable(e: Error) -> Error {
    match e {
        Error::DirectoryUnavailable(_) => e,
        other => Error::DirectoryUnavailable(other.to_string()),
    }
}

fn count(payments: &[CanonicalPayment], status: MatchStatus) -> usize {
    payments.iter().filter(|p| p.match_status == status).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aliases::generate_aliases;
    use crate::models::{MergeConfidence, PaymentDateSource, SyncStatus};
    use crate::test_utils::InMemoryDirectory;
    use chrono::NaiveDate;
    use rust_decimal::Decimal;
    use std::collections::BTreeSet;

    fn payment(name: &str) -> CanonicalPayment {
        CanonicalPayment {
            fingerprint: format!("pay_{}", name.len()),
            version: 1,
            amount: Decimal::new(150000, 2),
            check_no_or_ref: Some("4531".into()),
            payment_date: NaiveDate::from_ymd_opt(2025, 1, 16).unwrap(),
            payment_date_source: PaymentDateSource::CheckDate,
            check_date: None,
            postmark_date: None,
            deposit_date: None,
            deposit_method: None,
            memo: None,
            aliases: generate_aliases(name),
            organization_name: None,
            salutation: None,
            address: Some(snead()),
            address_origin: None,
            email: None,
            phone: None,
            source_kinds: BTreeSet::new(),
            constituent_ids: BTreeSet::new(),
            merge_confidence: MergeConfidence::Exact,
            match_status: MatchStatus::Unmatched,
            payer_directory_id: None,
            address_mismatch: false,
            review_reason: None,
            sync_status: SyncStatus::Pending,
            flags: Vec::new(),
        }
    }

    fn snead() -> Address {
        Address {
            line1: Some("805 Snead St".into()),
            city: Some("Paso Robles".into()),
            state: Some("CA".into()),
            zip: Some("93446".into()),
        }
    }

    fn entry(id: &str, name: &str, address: Option<Address>) -> PayerDirectoryEntry {
        PayerDirectoryEntry {
            id: id.into(),
            display_name: name.into(),
            aliases: Vec::new(),
            organization_name: None,
            address,
            email: None,
            phone: None,
        }
    }

    #[test]
    fn test_exact_alias_match_with_same_address() {
        let matcher = IdentityMatcher::default();
        let outcome = matcher.classify(
            &payment("Dalene Eimon"),
            &[entry("p1", "Eimon, Dalene", Some(snead()))],
        );
        assert_eq!(outcome.status, MatchStatus::Matched);
        assert_eq!(outcome.payer_directory_id.as_deref(), Some("p1"));
        assert!(outcome.address_update.is_none());
    }

    #[test]
    fn test_address_formatting_differences_are_tolerated() {
        let matcher = IdentityMatcher::default();
        let mut stored = snead();
        stored.line1 = Some("805 Snead Street".into());
        let outcome = matcher.classify(&payment("Dalene Eimon"), &[entry("p1", "Dalene Eimon", Some(stored))]);
        assert_eq!(outcome.status, MatchStatus::Matched);
    }

    #[test]
    fn test_changed_address_is_flagged_not_applied() {
        let matcher = IdentityMatcher::default();
        let old = Address {
            line1: Some("12 Vine St".into()),
            city: Some("Templeton".into()),
            state: Some("CA".into()),
            zip: Some("93465".into()),
        };
        let outcome = matcher.classify(&payment("Dalene Eimon"), &[entry("p1", "Dalene Eimon", Some(old.clone()))]);
        assert_eq!(outcome.status, MatchStatus::MatchedAddressMismatch);
        assert!(outcome.address_mismatch);
        let proposal = outcome.address_update.unwrap();
        assert_eq!(proposal.current, Some(old));
        assert_eq!(proposal.proposed, snead());
        assert_eq!(proposal.differing_fields, vec!["line1", "city", "zip"]);
    }

    #[test]
    fn test_exact_comparison_mode_flags_formatting() {
        let matcher = IdentityMatcher::new(MatchConfig {
            address_comparison: AddressComparison::Exact,
            ..Default::default()
        });
        let mut stored = snead();
        stored.line1 = Some("805 Sneed St".into());
        let outcome = matcher.classify(&payment("Dalene Eimon"), &[entry("p1", "Dalene Eimon", Some(stored))]);
        assert_eq!(outcome.status, MatchStatus::MatchedAddressMismatch);
    }

    #[test]
    fn test_no_candidates_is_new_with_creation_proposal() {
        let matcher = IdentityMatcher::default();
        let outcome = matcher.classify(&payment("Dalene Eimon"), &[]);
        assert_eq!(outcome.status, MatchStatus::New);
        let request = outcome.new_payer.unwrap();
        assert_eq!(request.display_name, "Dalene Eimon");
        assert_eq!(request.address, Some(snead()));
    }

    #[test]
    fn test_surname_only_is_below_threshold() {
        let matcher = IdentityMatcher::default();
        let outcome = matcher.classify(&payment("Dalene Eimon"), &[entry("p9", "Robert Eimon", None)]);
        assert_eq!(outcome.status, MatchStatus::New);
        assert!(outcome.review_reason.unwrap().contains("Robert Eimon"));
    }

    #[test]
    fn test_surname_and_street_number_is_accepted() {
        let matcher = IdentityMatcher::default();
        let mut stored = snead();
        stored.line1 = Some("805 Snead Street Apt 2".into());
        let outcome = matcher.classify(&payment("D. Eimon"), &[entry("p1", "Dalene Eimon", Some(stored))]);
        assert_eq!(outcome.payer_directory_id.as_deref(), Some("p1"));
    }

    #[test]
    fn test_relative_at_same_address_is_rejected() {
        let matcher = IdentityMatcher::default();
        let outcome = matcher.classify(
            &payment("Robert Eimon"),
            &[entry("C-17", "Dalene Eimon", Some(snead()))],
        );
        assert_eq!(outcome.status, MatchStatus::Rejected);
        assert!(outcome.payer_directory_id.is_none());
        assert!(outcome.review_reason.unwrap().contains("Dalene Eimon"));

        // A conflicting initial counts the same as a conflicting first name
        let outcome = matcher.classify(
            &payment("R. Eimon"),
            &[entry("C-17", "Dalene Eimon", Some(snead()))],
        );
        assert_eq!(outcome.status, MatchStatus::Rejected);
    }

    #[test]
    fn test_ambiguous_candidates_are_rejected() {
        let matcher = IdentityMatcher::default();
        let outcome = matcher.classify(
            &payment("J. Smith"),
            &[entry("p1", "John Smith", None), entry("p2", "Jane Smith", None)],
        );
        assert_eq!(outcome.status, MatchStatus::Rejected);
        assert!(outcome.review_reason.unwrap().starts_with("Ambiguous"));
        assert!(outcome.payer_directory_id.is_none());
    }

    #[test]
    fn test_dominant_candidate_wins() {
        let matcher = IdentityMatcher::default();
        let outcome = matcher.classify(
            &payment("Jane Smith"),
            &[entry("p1", "Jane Smith", None), entry("p2", "J. Smithe", None)],
        );
        assert_eq!(outcome.payer_directory_id.as_deref(), Some("p1"));
    }

    #[test]
    fn test_person_resembling_organization_is_rejected() {
        let matcher = IdentityMatcher::default();
        let mut vineyard = entry("o1", "Dalene Eimon", Some(snead()));
        vineyard.organization_name = Some("Eimon Vineyards".into());
        let outcome = matcher.classify(&payment("Robert Eimon"), &[vineyard]);
        assert_eq!(outcome.status, MatchStatus::Rejected);
        assert!(outcome.review_reason.unwrap().contains("Dalene Eimon"));
    }

    #[test]
    fn test_organization_matches_near_exactly() {
        let matcher = IdentityMatcher::default();
        let mut p = payment("Acme Supply LLC");
        p.organization_name = Some("Acme Supply LLC".into());
        p.address = None;
        let mut org = entry("o1", "ACME Supply, LLC", None);
        org.organization_name = Some("ACME Supply, LLC".into());
        let outcome = matcher.classify(&p, &[org]);
        assert_eq!(outcome.status, MatchStatus::Matched);

        let mut lodge = payment("Elks Lodge 12");
        lodge.organization_name = Some("Elks Lodge 12".into());
        lodge.address = None;
        let mut other = entry("o2", "Elks Lodge 21", None);
        other.organization_name = Some("Elks Lodge 21".into());
        let outcome = matcher.classify(&lodge, &[other]);
        assert_eq!(outcome.status, MatchStatus::Rejected);
    }

    #[test]
    fn test_missing_name_is_rejected() {
        let matcher = IdentityMatcher::default();
        let outcome = matcher.classify(&payment(""), &[]);
        assert_eq!(outcome.status, MatchStatus::Rejected);
    }

    #[tokio::test]
    async fn test_match_is_idempotent() {
        let directory = InMemoryDirectory::new(vec![entry("p1", "Dalene Eimon", Some(snead()))]);
        let matcher = IdentityMatcher::default();

        let once = matcher.match_payment(&payment("Dalene Eimon"), &directory).await.unwrap();
        let twice = matcher.match_payment(&once, &directory).await.unwrap();
        assert_eq!(once.match_status, MatchStatus::Matched);
        assert_eq!(twice.match_status, once.match_status);
        assert_eq!(twice.payer_directory_id, once.payer_directory_id);
        assert_eq!(twice.version, once.version);
        assert_eq!(once.version, 2);
    }

    #[tokio::test]
    async fn test_batch_uses_one_bulk_call_for_duplicate_queries() {
        let directory = InMemoryDirectory::new(vec![entry("p1", "Dalene Eimon", Some(snead()))]);
        let matcher = IdentityMatcher::default();
        let mut second = payment("Dalene Eimon");
        second.fingerprint = "pay_other".into();

        let batch = matcher
            .match_batch(&[payment("Dalene Eimon"), second], &directory)
            .await;
        assert_eq!(directory.bulk_calls(), 1);
        assert_eq!(directory.queries_seen(), 1);
        assert!(batch
            .payments
            .iter()
            .all(|p| p.match_status == MatchStatus::Matched));
    }

    #[tokio::test]
    async fn test_directory_failure_leaves_payments_unmatched() {
        let directory = InMemoryDirectory::unavailable();
        let matcher = IdentityMatcher::default();
        let batch = matcher.match_batch(&[payment("Dalene Eimon")], &directory).await;
        assert_eq!(batch.payments[0].match_status, MatchStatus::Unmatched);
        assert_eq!(batch.warnings.len(), 1);

        let err = matcher
            .match_payment(&payment("Dalene Eimon"), &directory)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DirectoryUnavailable(_)));
    }
}
