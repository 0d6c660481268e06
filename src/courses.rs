use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use indicatif::{ProgressBar, ProgressStyle};
use spider_client::shapes::request::{ReturnFormat, ReturnFormatHandling};
use spider_client::{RequestParams, Spider};
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::course_parse::parse_courses;
use crate::records::{CourseRecord, CourseStatus, ValidationRecord, ValidationStatus};
use crate::store::{Store, COURSES_PATH, VALIDATIONS_PATH};

const CONCURRENCY: usize = 4;
const MAX_RETRIES: u32 = 3;
const BASE_BACKOFF_MS: u64 = 2000;

pub struct CourseStats {
    pub selected: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Scrape course catalogs for every matched validation via markup parsing.
/// Independent failure domain from the profile scraper: nothing here reads
/// or writes the profile store. Already-successful course records are
/// skipped on re-run.
pub async fn run(limit: Option<usize>) -> Result<CourseStats> {
    let validation_store: Store<ValidationRecord> = Store::open(VALIDATIONS_PATH);
    let validations = validation_store.load()?;
    if validations.is_empty() {
        bail!("validation store {VALIDATIONS_PATH} is missing or empty; run 'validate' first");
    }

    let course_store: Store<CourseRecord> = Store::open(COURSES_PATH);
    let existing = course_store.load()?;

    let matched: Vec<(String, String)> = validations
        .values()
        .filter(|v| v.status == ValidationStatus::Matched)
        .filter_map(|v| Some((v.key.clone(), v.chosen_url.clone()?)))
        .collect();

    let mut work: Vec<(String, String)> = matched
        .iter()
        .filter(|(key, _)| {
            existing
                .get(key)
                .map_or(true, |r| r.status != CourseStatus::Success)
        })
        .cloned()
        .collect();
    let skipped = matched.len() - work.len();
    if skipped > 0 {
        info!("skipping {skipped} already scraped course catalogs");
    }
    if let Some(n) = limit {
        work.truncate(n);
    }

    let selected = work.len();
    if selected == 0 {
        info!("no course catalogs to scrape");
        return Ok(CourseStats {
            selected,
            succeeded: 0,
            failed: 0,
            skipped,
        });
    }

    let api_key = std::env::var("SPIDER_API_KEY")
        .map_err(|_| anyhow!("SPIDER_API_KEY environment variable must be set"))?;
    let spider = Arc::new(
        Spider::new(Some(api_key)).map_err(|e| anyhow!("failed to create Spider client: {e}"))?,
    );

    course_store.snapshot_backup()?;
    info!("scraping {selected} course catalogs");

    let pb = ProgressBar::new(selected as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta})")?
            .progress_chars("=> "),
    );

    let semaphore = Arc::new(Semaphore::new(CONCURRENCY));
    let (tx, mut rx) = tokio::sync::mpsc::channel::<CourseRecord>(CONCURRENCY * 2);

    for (key, url) in work {
        let spider = Arc::clone(&spider);
        let sem = Arc::clone(&semaphore);
        let tx = tx.clone();
        tokio::spawn(async move {
            let _permit = sem.acquire().await.expect("semaphore closed");
            let record = scrape_one(&spider, key, url).await;
            let _ = tx.send(record).await;
        });
    }
    drop(tx);

    let mut succeeded = 0usize;
    let mut failed = 0usize;

    while let Some(record) = rx.recv().await {
        match record.status {
            CourseStatus::Success => succeeded += 1,
            CourseStatus::Failed => {
                failed += 1;
                if let Some(e) = &record.error {
                    warn!("course scrape failed for {}: {e}", record.key);
                }
            }
        }
        let key = record.key.clone();
        course_store.locked_update(|m| {
            m.insert(key, record);
        })?;
        pb.inc(1);
    }
    pb.finish_and_clear();

    info!("course scrape complete: {selected} attempted, {succeeded} succeeded, {failed} failed");
    Ok(CourseStats {
        selected,
        succeeded,
        failed,
        skipped,
    })
}

/// Fetch one page's markup and parse its catalog. An empty extraction is a
/// failure so a later rescrape run picks the page up again.
async fn scrape_one(spider: &Spider, key: String, url: String) -> CourseRecord {
    match fetch_markup_with_retry(spider, &url).await {
        Ok(markdown) => {
            let courses = parse_courses(&markdown);
            if courses.is_empty() {
                CourseRecord {
                    key,
                    url,
                    status: CourseStatus::Failed,
                    error: Some("no course data extracted from page markup".to_string()),
                    courses: Vec::new(),
                }
            } else {
                CourseRecord {
                    key,
                    url,
                    status: CourseStatus::Success,
                    error: None,
                    courses,
                }
            }
        }
        Err(e) => CourseRecord {
            key,
            url,
            status: CourseStatus::Failed,
            error: Some(e.to_string()),
            courses: Vec::new(),
        },
    }
}

async fn fetch_markup_with_retry(spider: &Spider, url: &str) -> Result<String> {
    for attempt in 0..=MAX_RETRIES {
        match fetch_markup(spider, url).await {
            Ok(md) => return Ok(md),
            Err(e) => {
                let msg = e.to_string();
                let transient = msg.contains("429")
                    || msg.contains("rate")
                    || msg.contains("500")
                    || msg.contains("502")
                    || msg.contains("503")
                    || msg.contains("timed out");
                if !transient || attempt == MAX_RETRIES {
                    return Err(e);
                }
                let backoff = Duration::from_millis(BASE_BACKOFF_MS * 2u64.pow(attempt));
                warn!(
                    "markup fetch retry {}/{} for {url}, backing off {:.1}s",
                    attempt + 1,
                    MAX_RETRIES,
                    backoff.as_secs_f64()
                );
                tokio::time::sleep(backoff).await;
            }
        }
    }
    unreachable!("retry loop always returns")
}

/// Fetch a single URL's content as markdown.
async fn fetch_markup(spider: &Spider, url: &str) -> Result<String> {
    let params = RequestParams {
        return_format: Some(ReturnFormatHandling::Single(ReturnFormat::Markdown)),
        ..Default::default()
    };

    let response = spider
        .scrape_url(url, Some(params), "application/json")
        .await
        .map_err(|e| anyhow!("markup fetch failed: {e}"))?;

    let parsed: serde_json::Value = match response.as_str() {
        Some(s) => serde_json::from_str(s).unwrap_or(response.clone()),
        None => response,
    };

    parsed
        .as_array()
        .and_then(|arr| arr.first())
        .and_then(|obj| obj.get("content"))
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("no content in markup response"))
}
