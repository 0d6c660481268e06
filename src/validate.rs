use std::cmp::Ordering;
use std::collections::BTreeMap;

use anyhow::{bail, Result};
use chrono::Utc;
use strsim::jaro_winkler;
use tracing::info;

use crate::names::normalize_key;
use crate::records::{Candidate, ValidationRecord, ValidationStatus};
use crate::store::{Store, CANDIDATES_PATH, VALIDATIONS_PATH};

/// Minimum top score to accept a match at all.
pub const DEFAULT_THRESHOLD: f64 = 0.85;
/// If the runner-up is within this of the top score, the pick is ambiguous.
pub const DEFAULT_MARGIN: f64 = 0.03;
/// Candidates scoring below this are not worth keeping as backups.
const BACKUP_FLOOR: f64 = 0.40;

pub struct ValidateStats {
    pub matched: usize,
    pub ambiguous: usize,
    pub unmatched: usize,
}

/// Similarity between the canonical key and a candidate label: exact
/// normalized match wins outright, otherwise the better of jaro-winkler and
/// token containment.
pub fn score_candidate(canonical_key: &str, label: &str) -> f64 {
    let label_key = normalize_key(label);
    if label_key == canonical_key {
        return 1.0;
    }
    let fuzzy = jaro_winkler(canonical_key, &label_key);
    fuzzy.max(token_containment(canonical_key, &label_key))
}

/// Fraction of canonical-name tokens present in the label.
fn token_containment(canonical_key: &str, label_key: &str) -> f64 {
    let canonical: Vec<&str> = canonical_key.split_whitespace().collect();
    if canonical.is_empty() {
        return 0.0;
    }
    let label: Vec<&str> = label_key.split_whitespace().collect();
    let shared = canonical.iter().filter(|t| label.contains(t)).count();
    shared as f64 / canonical.len() as f64
}

/// Classify one university's candidates. Deterministic given identical
/// input: stable ordering by score desc, then source-rank, then URL.
pub fn validate_candidates(
    key: &str,
    candidates: &[Candidate],
    threshold: f64,
    margin: f64,
) -> ValidationRecord {
    let mut scored: Vec<(f64, &Candidate)> = candidates
        .iter()
        .map(|c| (score_candidate(key, &c.label), c))
        .collect();
    scored.sort_by(|(sa, a), (sb, b)| {
        sb.partial_cmp(sa)
            .unwrap_or(Ordering::Equal)
            .then(a.rank.cmp(&b.rank))
            .then(a.url.cmp(&b.url))
    });
    scored.retain(|(s, _)| *s >= BACKUP_FLOOR);

    let record = |status, chosen_url, backups, reason: &str, score| ValidationRecord {
        key: key.to_string(),
        status,
        chosen_url,
        backups,
        reason: reason.to_string(),
        score,
        validated_at: Utc::now(),
    };

    let Some(&(top_score, top)) = scored.first() else {
        return record(ValidationStatus::Unmatched, None, Vec::new(), "no_candidates", 0.0);
    };

    if top_score < threshold {
        let backups = scored.iter().map(|(_, c)| c.url.clone()).collect();
        return record(
            ValidationStatus::Unmatched,
            None,
            backups,
            "below_threshold",
            top_score,
        );
    }

    let runner_up_close = scored
        .get(1)
        .is_some_and(|(second, _)| top_score - second <= margin);
    if runner_up_close {
        let backups = scored.iter().map(|(_, c)| c.url.clone()).collect();
        return record(ValidationStatus::Ambiguous, None, backups, "score_margin", top_score);
    }

    let backups = scored.iter().skip(1).map(|(_, c)| c.url.clone()).collect();
    let reason = if top_score == 1.0 { "exact_match" } else { "fuzzy_match" };
    record(
        ValidationStatus::Matched,
        Some(top.url.clone()),
        backups,
        reason,
        top_score,
    )
}

/// Validate every key in the candidate store and rewrite the validation
/// store wholesale (with backup). Re-running without new discovery produces
/// identical records apart from the validation timestamp.
pub fn run(threshold: f64, margin: f64) -> Result<ValidateStats> {
    let candidate_store: Store<Vec<Candidate>> = Store::open(CANDIDATES_PATH);
    let candidates = candidate_store.load()?;
    if candidates.is_empty() {
        bail!("candidate store {CANDIDATES_PATH} is missing or empty; run 'discover' first");
    }

    let mut records: BTreeMap<String, ValidationRecord> = BTreeMap::new();
    let mut stats = ValidateStats {
        matched: 0,
        ambiguous: 0,
        unmatched: 0,
    };

    for (key, cands) in &candidates {
        let record = validate_candidates(key, cands, threshold, margin);
        match record.status {
            ValidationStatus::Matched => stats.matched += 1,
            ValidationStatus::Ambiguous => stats.ambiguous += 1,
            ValidationStatus::Unmatched => stats.unmatched += 1,
        }
        records.insert(key.clone(), record);
    }

    let validation_store: Store<ValidationRecord> = Store::open(VALIDATIONS_PATH);
    validation_store.put_all(&records)?;

    info!(
        "validated {} universities: {} matched, {} ambiguous, {} unmatched",
        records.len(),
        stats.matched,
        stats.ambiguous,
        stats.unmatched
    );
    Ok(stats)
}

// ── Tests ──
