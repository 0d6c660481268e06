use std::collections::{BTreeMap, BTreeSet};

use anyhow::{bail, Result};
use chrono::Utc;
use rayon::prelude::*;
use serde_json::Value;
use tracing::info;

use crate::records::{
    CourseRecord, CourseStatus, ProfileRecord, ScrapeStatus, UnifiedRecord,
};
use crate::store::{Store, COURSES_PATH, PROFILES_PATH, UNIFIED_PATH};

pub struct CombineStats {
    pub total: usize,
    pub complete: usize,
    pub incomplete: usize,
}

/// Merge the profile and course stores into one record per university key
/// present in either. Pure over its inputs: unchanged stores produce
/// byte-identical output apart from the generation timestamp.
pub fn combine(
    profiles: &BTreeMap<String, ProfileRecord>,
    courses: &BTreeMap<String, CourseRecord>,
) -> BTreeMap<String, UnifiedRecord> {
    let keys: BTreeSet<&String> = profiles.keys().chain(courses.keys()).collect();
    let generated_at = Utc::now();

    keys.into_par_iter()
        .map(|key| {
            let profile = profiles.get(key).filter(|r| r.status == ScrapeStatus::Success);
            let course = courses.get(key).filter(|r| r.status == CourseStatus::Success);

            let mut provenance = BTreeMap::new();
            if profile.is_some() {
                provenance.insert("profile".to_string(), "profile_scraper".to_string());
            }
            if course.is_some() {
                provenance.insert("courses".to_string(), "course_scraper".to_string());
            }

            let record = UnifiedRecord {
                key: key.clone(),
                name: profile.and_then(|r| profile_name(r.payload.as_ref()?)),
                profile: profile.and_then(|r| r.payload.clone()),
                courses: course.map(|r| r.courses.clone()).unwrap_or_default(),
                provenance,
                // A record missing one side is still emitted, marked
                // incomplete rather than dropped.
                complete: profile.is_some() && course.is_some(),
                generated_at,
            };
            (key.clone(), record)
        })
        .collect::<Vec<_>>()
        .into_iter()
        .collect()
}

fn profile_name(payload: &Value) -> Option<String> {
    payload
        .get("university_name")
        .or_else(|| payload.get("name"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Recompute the unified store wholesale from the current profile and
/// course stores. At least one input store must exist.
pub fn run() -> Result<CombineStats> {
    let profile_store: Store<ProfileRecord> = Store::open(PROFILES_PATH);
    let course_store: Store<CourseRecord> = Store::open(COURSES_PATH);
    if !profile_store.exists() && !course_store.exists() {
        bail!("neither {PROFILES_PATH} nor {COURSES_PATH} exists; run 'scrape' or 'courses' first");
    }

    let profiles = profile_store.load()?;
    let courses = course_store.load()?;
    let unified = combine(&profiles, &courses);

    let complete = unified.values().filter(|r| r.complete).count();
    let stats = CombineStats {
        total: unified.len(),
        complete,
        incomplete: unified.len() - complete,
    };

    let unified_store: Store<UnifiedRecord> = Store::open(UNIFIED_PATH);
    unified_store.put_all(&unified)?;

    info!(
        "combined {} records: {} complete, {} incomplete",
        stats.total, stats.complete, stats.incomplete
    );
    Ok(stats)
}

// ── Tests ──
