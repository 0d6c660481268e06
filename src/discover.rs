use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::names::{load_names, CanonicalName};
use crate::records::Candidate;
use crate::store::{Store, CANDIDATES_PATH};

const DEFAULT_SEARCH_URL: &str = "https://www.petersons.com/search";
const CONCURRENCY: usize = 5;
const MAX_RETRIES: u32 = 3;
const BASE_BACKOFF_MS: u64 = 2000;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct DiscoverStats {
    pub processed: usize,
    pub with_candidates: usize,
    pub empty: usize,
    pub failed: usize,
}

/// Client for the external search surface: request-by-name, ordered URL
/// candidates back. Opaque collaborator; only its failure modes matter here.
pub struct SearchClient {
    http: reqwest::Client,
    base: String,
}

impl SearchClient {
    pub fn from_env() -> Result<Self> {
        let base =
            std::env::var("PETERSON_SEARCH_URL").unwrap_or_else(|_| DEFAULT_SEARCH_URL.into());
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(SearchClient { http, base })
    }

    /// One search query with bounded retry + exponential backoff on
    /// rate-limit, server errors, and timeouts. Zero results is not an
    /// error. A terminal failure is an `Err` for the caller to record.
    pub async fn search(&self, name: &str) -> Result<Vec<(String, String)>> {
        let mut last_error = anyhow!("no attempts made");
        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                let backoff = Duration::from_millis(BASE_BACKOFF_MS * 2u64.pow(attempt - 1));
                warn!(
                    "search retry {}/{} for '{}', backing off {:.1}s",
                    attempt,
                    MAX_RETRIES,
                    name,
                    backoff.as_secs_f64()
                );
                tokio::time::sleep(backoff).await;
            }

            let response = self.http.get(&self.base).query(&[("q", name)]).send().await;
            match response {
                Ok(resp) => {
                    let status = resp.status();
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_error = anyhow!("search surface returned {status}");
                        continue;
                    }
                    if !status.is_success() {
                        return Err(anyhow!("search surface returned {status}"));
                    }
                    let body: Value = resp.json().await?;
                    return Ok(parse_search_response(&body));
                }
                Err(e) if e.is_timeout() || e.is_connect() => {
                    last_error = anyhow!("search request failed: {e}");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(last_error)
    }
}

/// Tolerant parse of the search response: either `{"results": [...]}` or a
/// bare array, items carrying a title/name and a url/link. Response order is
/// the implicit source rank.
pub fn parse_search_response(body: &Value) -> Vec<(String, String)> {
    let items = body
        .get("results")
        .and_then(Value::as_array)
        .or_else(|| body.as_array());

    let Some(items) = items else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| {
            let label = item
                .get("title")
                .or_else(|| item.get("name"))
                .and_then(Value::as_str)?;
            let url = item
                .get("url")
                .or_else(|| item.get("link"))
                .and_then(Value::as_str)?;
            Some((label.trim().to_string(), url.to_string()))
        })
        .collect()
}

/// Query the search surface for every canonical name and persist candidates.
/// Re-running replaces each key's candidate list; a terminal search failure
/// leaves that key's previous candidates untouched so a re-run can retry it.
pub async fn run(input: &Path, limit: Option<usize>) -> Result<DiscoverStats> {
    let mut names = load_names(input)?;
    if let Some(n) = limit {
        names.truncate(n);
    }
    info!("discovering candidate URLs for {} universities", names.len());

    let client = Arc::new(SearchClient::from_env()?);
    let store: Store<Vec<Candidate>> = Store::open(CANDIDATES_PATH);
    store.snapshot_backup()?;

    let total = names.len();
    let pb = ProgressBar::new(total as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta})")?
            .progress_chars("=> "),
    );

    let semaphore = Arc::new(Semaphore::new(CONCURRENCY));
    let (tx, mut rx) =
        tokio::sync::mpsc::channel::<(CanonicalName, Result<Vec<(String, String)>>)>(
            CONCURRENCY * 2,
        );

    for name in names {
        let client = Arc::clone(&client);
        let sem = Arc::clone(&semaphore);
        let tx = tx.clone();
        tokio::spawn(async move {
            let _permit = sem.acquire().await.expect("semaphore closed");
            let hits = client.search(&name.name).await;
            let _ = tx.send((name, hits)).await;
        });
    }
    drop(tx);

    let mut stats = DiscoverStats {
        processed: 0,
        with_candidates: 0,
        empty: 0,
        failed: 0,
    };

    while let Some((name, hits)) = rx.recv().await {
        stats.processed += 1;
        match hits {
            Ok(hits) => {
                if hits.is_empty() {
                    stats.empty += 1;
                } else {
                    stats.with_candidates += 1;
                }
                let discovered_at = Utc::now();
                let candidates: Vec<Candidate> = hits
                    .into_iter()
                    .enumerate()
                    .map(|(rank, (label, url))| Candidate {
                        key: name.key.clone(),
                        label,
                        url,
                        rank,
                        discovered_at,
                    })
                    .collect();
                store.locked_update(|m| {
                    m.insert(name.key.clone(), candidates);
                })?;
            }
            Err(e) => {
                stats.failed += 1;
                warn!("discovery failed for '{}': {e}", name.name);
            }
        }
        pb.inc(1);
    }
    pb.finish_and_clear();

    info!(
        "discovery complete: {} processed, {} with candidates, {} empty, {} failed",
        stats.processed, stats.with_candidates, stats.empty, stats.failed
    );
    Ok(stats)
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_results_object() {
        let body = json!({
            "results": [
                {"title": "Emory University", "url": "https://www.petersons.com/colleges/emory"},
                {"title": "Emory Oxford College", "url": "https://www.petersons.com/colleges/emory-oxford"}
            ]
        });
        let hits = parse_search_response(&body);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, "Emory University");
        assert_eq!(hits[1].1, "https://www.petersons.com/colleges/emory-oxford");
    }

    #[test]
    fn parses_bare_array_with_alternate_keys() {
        let body = json!([
            {"name": "Georgia Tech", "link": "https://www.petersons.com/colleges/gt"}
        ]);
        let hits = parse_search_response(&body);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "Georgia Tech");
    }

    #[test]
    fn zero_results_is_not_an_error() {
        assert!(parse_search_response(&json!({"results": []})).is_empty());
        assert!(parse_search_response(&json!({"unexpected": true})).is_empty());
    }

    #[test]
    fn items_missing_fields_are_skipped() {
        let body = json!({
            "results": [
                {"title": "No URL here"},
                {"title": "Good", "url": "https://x.example"}
            ]
        });
        let hits = parse_search_response(&body);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "Good");
    }
}
