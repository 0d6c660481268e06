use std::collections::BTreeMap;

use anyhow::{bail, Result};
use rayon::prelude::*;
use serde_json::Value;
use tracing::info;

use crate::names::normalize_key;
use crate::records::{
    CleanRecord, RejectedEntry, UnifiedRecord, ValidationRecord, ValidationStatus,
};
use crate::store::{Store, CLEAN_PATH, REJECTED_PATH, UNIFIED_PATH, VALIDATIONS_PATH};

pub struct CleanStats {
    pub clean: usize,
    pub rejected: usize,
}

/// Collapse runs of whitespace and fold shouting-case text down to title
/// case. Applied to every text field in the final dataset.
pub fn normalize_text(s: &str) -> String {
    let collapsed = s.split_whitespace().collect::<Vec<_>>().join(" ");
    let has_lower = collapsed.chars().any(|c| c.is_lowercase());
    if has_lower || !collapsed.chars().any(|c| c.is_alphabetic()) {
        return collapsed;
    }
    // All-caps input: re-case word by word.
    collapsed
        .split(' ')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => {
                    first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase()
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Recursively normalize every string inside a structured payload.
pub fn normalize_value(v: &Value) -> Value {
    match v {
        Value::String(s) => Value::String(normalize_text(s)),
        Value::Array(items) => Value::Array(items.iter().map(normalize_value).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, val)| (k.clone(), normalize_value(val)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Split unified records into the clean dataset and the rejected report.
/// Pure over its inputs; the terminal contract surface for downstream
/// consumers, so field presence is deterministic.
pub fn partition(
    unified: &BTreeMap<String, UnifiedRecord>,
    validations: &BTreeMap<String, ValidationRecord>,
) -> (BTreeMap<String, CleanRecord>, BTreeMap<String, RejectedEntry>) {
    let mut rejected: BTreeMap<String, RejectedEntry> = BTreeMap::new();

    for (key, v) in validations {
        let reason = match v.status {
            ValidationStatus::Ambiguous => "ambiguous",
            ValidationStatus::Unmatched => "unmatched",
            ValidationStatus::Matched => {
                if !unified.contains_key(key) {
                    // Reached validation but never produced a record.
                    "not_scraped"
                } else {
                    continue;
                }
            }
        };
        rejected.insert(
            key.clone(),
            RejectedEntry {
                key: key.clone(),
                reason: reason.to_string(),
            },
        );
    }

    let mut normalized: Vec<(String, String, CleanRecord, chrono::DateTime<chrono::Utc>)> =
        unified
            .par_iter()
            .filter(|(key, r)| r.profile.is_some() && !rejected.contains_key(*key))
            .map(|(key, r)| {
                let folded = normalize_key(key);
                let record = CleanRecord {
                    key: folded.clone(),
                    name: r.name.as_deref().map(normalize_text),
                    profile: r.profile.as_ref().map(normalize_value),
                    courses: r
                        .courses
                        .iter()
                        .map(|c| crate::records::CourseEntry {
                            name: normalize_text(&c.name),
                            level: c.level.clone(),
                            credits: c.credits,
                        })
                        .collect(),
                    complete: r.complete,
                };
                (folded, key.clone(), record, r.generated_at)
            })
            .collect();

    // Exact duplicate keys after folding: later generation wins. Sorting
    // first keeps the pick deterministic whatever order the parallel map
    // delivered records in; the source key settles equal timestamps.
    normalized.sort_by(|(ka, sa, _, ta), (kb, sb, _, tb)| {
        ka.cmp(kb).then(ta.cmp(tb)).then(sa.cmp(sb))
    });
    let mut clean: BTreeMap<String, CleanRecord> = BTreeMap::new();
    for (key, _, record, _) in normalized {
        clean.insert(key, record);
    }

    // Validation-status reasons take precedence over incompleteness.
    for (key, r) in unified {
        if r.profile.is_none() {
            rejected.entry(key.clone()).or_insert_with(|| RejectedEntry {
                key: key.clone(),
                reason: "incomplete_profile".to_string(),
            });
        }
    }

    (clean, rejected)
}

/// Emit the final cleaned dataset plus the rejected/unmatched report.
pub fn run() -> Result<CleanStats> {
    let unified_store: Store<UnifiedRecord> = Store::open(UNIFIED_PATH);
    if !unified_store.exists() {
        bail!("unified store {UNIFIED_PATH} does not exist; run 'combine' first");
    }
    let unified = unified_store.load()?;

    let validation_store: Store<ValidationRecord> = Store::open(VALIDATIONS_PATH);
    let validations = validation_store.load()?;

    let (clean, rejected) = partition(&unified, &validations);
    let stats = CleanStats {
        clean: clean.len(),
        rejected: rejected.len(),
    };

    let clean_store: Store<CleanRecord> = Store::open(CLEAN_PATH);
    clean_store.put_all(&clean)?;
    let rejected_store: Store<RejectedEntry> = Store::open(REJECTED_PATH);
    rejected_store.put_all(&rejected)?;

    info!(
        "cleaned dataset: {} records kept, {} rejected",
        stats.clean, stats.rejected
    );
    Ok(stats)
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::CourseEntry;
    use chrono::{Duration, Utc};
    use serde_json::json;

    fn unified(key: &str, with_profile: bool, complete: bool) -> UnifiedRecord {
        UnifiedRecord {
            key: key.to_string(),
            name: Some("  Abraham   Baldwin  Agricultural College ".to_string()),
            profile: with_profile.then(|| json!({"city": "TIFTON", "state": "GA"})),
            courses: vec![CourseEntry {
                name: "  Agribusiness  ".to_string(),
                level: Some("Associate".to_string()),
                credits: Some(60.0),
            }],
            provenance: BTreeMap::new(),
            complete,
            generated_at: Utc::now(),
        }
    }

    fn validation(key: &str, status: ValidationStatus) -> ValidationRecord {
        ValidationRecord {
            key: key.to_string(),
            status,
            chosen_url: matches!(status, ValidationStatus::Matched)
                .then(|| format!("https://www.petersons.com/colleges/{key}")),
            backups: Vec::new(),
            reason: "fuzzy_match".to_string(),
            score: 0.9,
            validated_at: Utc::now(),
        }
    }

    #[test]
    fn whitespace_and_shouting_are_normalized() {
        assert_eq!(normalize_text("  too   many\tspaces "), "too many spaces");
        assert_eq!(normalize_text("TIFTON"), "Tifton");
        assert_eq!(normalize_text("MixedCase stays"), "MixedCase stays");
        assert_eq!(normalize_text("123-456"), "123-456");
    }

    #[test]
    fn payload_strings_are_normalized_recursively() {
        let v = json!({"city": "TIFTON", "nested": {"names": ["  a  b ", "ok"]}, "count": 3});
        let n = normalize_value(&v);
        assert_eq!(n["city"], "Tifton");
        assert_eq!(n["nested"]["names"][0], "a b");
        assert_eq!(n["count"], 3);
    }

    #[test]
    fn complete_records_land_in_clean() {
        let mut u = BTreeMap::new();
        u.insert("abc".to_string(), unified("abc", true, true));
        let mut v = BTreeMap::new();
        v.insert("abc".to_string(), validation("abc", ValidationStatus::Matched));

        let (clean, rejected) = partition(&u, &v);
        assert_eq!(clean.len(), 1);
        assert!(rejected.is_empty());
        let r = &clean["abc"];
        assert_eq!(r.name.as_deref(), Some("Abraham Baldwin Agricultural College"));
        assert_eq!(r.courses[0].name, "Agribusiness");
    }

    #[test]
    fn ambiguous_key_is_rejected_with_reason() {
        let u = BTreeMap::new();
        let mut v = BTreeMap::new();
        v.insert(
            "georgia college".to_string(),
            validation("georgia college", ValidationStatus::Ambiguous),
        );

        let (clean, rejected) = partition(&u, &v);
        assert!(clean.is_empty());
        assert_eq!(rejected["georgia college"].reason, "ambiguous");
    }

    #[test]
    fn missing_profile_is_rejected_as_incomplete() {
        let mut u = BTreeMap::new();
        u.insert("ghost".to_string(), unified("ghost", false, false));
        let (clean, rejected) = partition(&u, &BTreeMap::new());
        assert!(clean.is_empty());
        assert_eq!(rejected["ghost"].reason, "incomplete_profile");
    }

    #[test]
    fn profile_without_courses_is_acceptably_complete() {
        let mut u = BTreeMap::new();
        let mut r = unified("emory", true, false);
        r.courses.clear();
        u.insert("emory".to_string(), r);

        let (clean, rejected) = partition(&u, &BTreeMap::new());
        assert_eq!(clean.len(), 1);
        assert!(!clean["emory"].complete);
        assert!(rejected.is_empty());
    }

    #[test]
    fn duplicate_folded_keys_keep_latest() {
        let mut u = BTreeMap::new();
        let mut older = unified("st. johns", true, true);
        older.generated_at = Utc::now() - Duration::hours(1);
        older.name = Some("Old Run".to_string());
        let mut newer = unified("st johns", true, true);
        newer.name = Some("New Run".to_string());
        u.insert("st. johns".to_string(), older);
        u.insert("st johns".to_string(), newer);

        let (clean, _) = partition(&u, &BTreeMap::new());
        assert_eq!(clean.len(), 1);
        assert_eq!(clean["st johns"].name.as_deref(), Some("New Run"));
    }

    #[test]
    fn pipeline_happy_path_end_to_end() {
        use crate::records::{Candidate, CourseRecord, CourseStatus, ProfileRecord, ScrapeStatus};
        use crate::validate::validate_candidates;

        let key = "abraham baldwin agricultural college";
        let candidates = vec![
            Candidate {
                key: key.to_string(),
                label: "Abraham Baldwin Agricultural College".to_string(),
                url: "https://www.petersons.com/colleges/abac".to_string(),
                rank: 0,
                discovered_at: Utc::now(),
            },
            Candidate {
                key: key.to_string(),
                label: "Abraham Lincoln University".to_string(),
                url: "https://www.petersons.com/colleges/alu".to_string(),
                rank: 1,
                discovered_at: Utc::now(),
            },
        ];

        // Validation picks the higher-ranked exact match.
        let v = validate_candidates(key, &candidates, 0.85, 0.03);
        assert_eq!(v.status, ValidationStatus::Matched);
        let url = v.chosen_url.clone().unwrap();
        assert_eq!(url, "https://www.petersons.com/colleges/abac");

        // Profile and course scrapes both succeed.
        let mut profiles = BTreeMap::new();
        profiles.insert(
            key.to_string(),
            ProfileRecord {
                key: key.to_string(),
                url: url.clone(),
                status: ScrapeStatus::Success,
                payload: Some(json!({"university_name": "Abraham Baldwin Agricultural College"})),
                error: None,
                attempts: 1,
                last_attempted: Some(Utc::now()),
            },
        );
        let mut courses = BTreeMap::new();
        courses.insert(
            key.to_string(),
            CourseRecord {
                key: key.to_string(),
                url,
                status: CourseStatus::Success,
                error: None,
                courses: vec![CourseEntry {
                    name: "Agribusiness".to_string(),
                    level: Some("Associate".to_string()),
                    credits: Some(60.0),
                }],
            },
        );

        let unified = crate::combine::combine(&profiles, &courses);
        assert_eq!(unified.len(), 1);
        assert!(unified[key].complete);

        let mut validations = BTreeMap::new();
        validations.insert(key.to_string(), v);
        let (clean, rejected) = partition(&unified, &validations);
        assert_eq!(clean.len(), 1);
        assert!(rejected.is_empty());
        assert!(clean[key].complete);
        assert_eq!(clean[key].courses.len(), 1);
    }

    #[test]
    fn matched_but_never_scraped_is_reported() {
        let u = BTreeMap::new();
        let mut v = BTreeMap::new();
        v.insert("lost".to_string(), validation("lost", ValidationStatus::Matched));
        let (_, rejected) = partition(&u, &v);
        assert_eq!(rejected["lost"].reason, "not_scraped");
    }
}
