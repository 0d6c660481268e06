use anyhow::{bail, Result};
use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use crate::batch::{retryable, select_for_retry, split_into_batches};
use crate::extract::{ExtractClient, ExtractOutcome};
use crate::records::{ProfileRecord, ScrapeStatus, ValidationRecord, ValidationStatus};
use crate::store::{Store, PROFILES_PATH, VALIDATIONS_PATH};

pub struct ScrapeStats {
    pub selected: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Scrape structured profiles for every matched validation that is not
/// already a success (resume semantics). Work is partitioned into
/// `num_batches` batches, one worker per batch; a per-URL failure never
/// aborts its batch or any other.
pub async fn run(num_batches: usize, limit: Option<usize>, dry_run: bool) -> Result<ScrapeStats> {
    if num_batches == 0 {
        bail!("number of batches must be greater than 0");
    }
    let validation_store: Store<ValidationRecord> = Store::open(VALIDATIONS_PATH);
    let validations = validation_store.load()?;
    if validations.is_empty() {
        bail!("validation store {VALIDATIONS_PATH} is missing or empty; run 'validate' first");
    }

    let profile_store: Store<ProfileRecord> = Store::open(PROFILES_PATH);
    let profiles = profile_store.load()?;

    let matched: Vec<(String, String)> = validations
        .values()
        .filter(|v| v.status == ValidationStatus::Matched)
        .filter_map(|v| Some((v.key.clone(), v.chosen_url.clone()?)))
        .collect();

    let mut work = select_work(&matched, &profiles);
    let skipped = matched.len() - work.len();
    if skipped > 0 {
        info!("skipping {skipped} already scraped profiles");
    }
    if let Some(n) = limit {
        work.truncate(n);
    }

    if dry_run {
        for (key, url) in &work {
            info!("would scrape {key}: {url}");
        }
        info!("dry run: {} profiles selected, nothing written", work.len());
        return Ok(ScrapeStats {
            selected: work.len(),
            succeeded: 0,
            failed: 0,
            skipped,
        });
    }

    scrape_keys(work, num_batches, skipped).await
}

/// Reselect failed profiles and resubmit exactly that subset through the
/// same batching logic. Adds no scraping logic of its own.
pub async fn rescrape(
    num_batches: usize,
    max_attempts: Option<u32>,
    max_age_hours: Option<i64>,
) -> Result<ScrapeStats> {
    if num_batches == 0 {
        bail!("number of batches must be greater than 0");
    }
    let profile_store: Store<ProfileRecord> = Store::open(PROFILES_PATH);
    let profiles = profile_store.load()?;
    if profiles.is_empty() {
        bail!("profile store {PROFILES_PATH} is missing or empty; run 'scrape' first");
    }

    let cutoff = max_age_hours.map(|h| Utc::now() - chrono::Duration::hours(h));
    let work = select_for_retry(&profiles, retryable(max_attempts, cutoff));
    if work.is_empty() {
        info!("no failed profiles eligible for rescrape");
        return Ok(ScrapeStats {
            selected: 0,
            succeeded: 0,
            failed: 0,
            skipped: profiles.len(),
        });
    }

    info!("rescraping {} failed profiles in {num_batches} batches", work.len());
    let skipped = profiles.len() - work.len();
    scrape_keys(work, num_batches, skipped).await
}

/// Submit (key, url) work through batch workers and stream results into the
/// profile store. Each completed record commits independently, so a run can
/// be interrupted between records and re-invoked safely.
async fn scrape_keys(
    work: Vec<(String, String)>,
    num_batches: usize,
    skipped: usize,
) -> Result<ScrapeStats> {
    let selected = work.len();
    if selected == 0 {
        info!("nothing to scrape");
        return Ok(ScrapeStats {
            selected,
            succeeded: 0,
            failed: 0,
            skipped,
        });
    }

    let client = std::sync::Arc::new(ExtractClient::from_env()?);
    let store: Store<ProfileRecord> = Store::open(PROFILES_PATH);
    store.snapshot_backup()?;

    let batches = split_into_batches(work, num_batches);
    info!("scraping {selected} profiles in {} batches", batches.len());

    let pb = ProgressBar::new(selected as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta})")?
            .progress_chars("=> "),
    );

    let (tx, mut rx) =
        tokio::sync::mpsc::channel::<(String, String, ExtractOutcome)>(batches.len() * 2);

    // One worker per batch; records within a batch go in assignment order,
    // no ordering across batches.
    for batch in batches {
        let client = std::sync::Arc::clone(&client);
        let tx = tx.clone();
        tokio::spawn(async move {
            for (key, url) in batch {
                let outcome = client.extract_profile(&url).await;
                if tx.send((key, url, outcome)).await.is_err() {
                    return;
                }
            }
        });
    }
    drop(tx);

    let mut succeeded = 0usize;
    let mut failed = 0usize;

    while let Some((key, url, outcome)) = rx.recv().await {
        let (status, payload, error) = match outcome {
            ExtractOutcome::Success(payload) => (ScrapeStatus::Success, Some(payload), None),
            ExtractOutcome::Failed(detail) => {
                warn!("profile scrape failed for {key}: {detail}");
                (ScrapeStatus::Failed, None, Some(detail))
            }
        };
        match status {
            ScrapeStatus::Success => succeeded += 1,
            _ => failed += 1,
        }

        store.locked_update(|m| apply_outcome(m, &key, &url, status, payload, error))?;
        pb.inc(1);
    }
    pb.finish_and_clear();

    info!("scrape complete: {selected} attempted, {succeeded} succeeded, {failed} failed");
    Ok(ScrapeStats {
        selected,
        succeeded,
        failed,
        skipped,
    })
}

/// Resume filter: everything matched that is not already a success gets
/// (re)processed; success records are never touched again.
fn select_work(
    matched: &[(String, String)],
    profiles: &std::collections::BTreeMap<String, ProfileRecord>,
) -> Vec<(String, String)> {
    matched
        .iter()
        .filter(|(key, _)| {
            profiles
                .get(key)
                .map_or(true, |r| r.status != ScrapeStatus::Success)
        })
        .cloned()
        .collect()
}

/// Commit one scrape outcome: full record replace, attempt count carried
/// forward and incremented regardless of outcome.
fn apply_outcome(
    profiles: &mut std::collections::BTreeMap<String, ProfileRecord>,
    key: &str,
    url: &str,
    status: ScrapeStatus,
    payload: Option<serde_json::Value>,
    error: Option<String>,
) {
    let attempts = profiles.get(key).map(|r| r.attempts).unwrap_or(0) + 1;
    profiles.insert(
        key.to_string(),
        ProfileRecord {
            key: key.to_string(),
            url: url.to_string(),
            status,
            payload,
            error,
            attempts,
            last_attempted: Some(Utc::now()),
        },
    );
}

// ── Tests ──
