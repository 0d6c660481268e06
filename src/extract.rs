use std::time::Duration;

use anyhow::{bail, Result};
use serde_json::{json, Value};
use tokio::time::sleep;
use tracing::warn;

const DEFAULT_EXTRACT_URL: &str = "https://api.firecrawl.dev/v1/scrape";
const MAX_RETRIES: u32 = 3;
const BASE_BACKOFF_MS: u64 = 2000;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(90);

/// Per-URL outcome. A failure is data, not an error: it is recorded into the
/// profile store and never aborts a batch.
pub enum ExtractOutcome {
    Success(Value),
    Failed(String),
}

/// Client for the external structured-extraction service. Credentialed,
/// rate-limited, and billed per request, which is why batch sizing is a
/// caller-tunable parameter upstream.
pub struct ExtractClient {
    http: reqwest::Client,
    base: String,
    api_key: String,
}

impl ExtractClient {
    /// Missing credential is a configuration error: fatal before any writes.
    pub fn from_env() -> Result<Self> {
        let Ok(api_key) = std::env::var("EXTRACT_API_KEY") else {
            bail!("EXTRACT_API_KEY environment variable must be set");
        };
        let base =
            std::env::var("EXTRACT_API_URL").unwrap_or_else(|_| DEFAULT_EXTRACT_URL.into());
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(ExtractClient {
            http,
            base,
            api_key,
        })
    }

    /// Fetch the structured payload for one profile URL. Transient failures
    /// (429, 5xx, timeout) are retried with exponential backoff; whatever
    /// remains after the retry budget becomes a failed outcome.
    pub async fn extract_profile(&self, url: &str) -> ExtractOutcome {
        let mut last_failure = String::new();
        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                let backoff = Duration::from_millis(BASE_BACKOFF_MS * 2u64.pow(attempt - 1));
                warn!(
                    "extraction retry {}/{} for {} ({}), backing off {:.1}s",
                    attempt,
                    MAX_RETRIES,
                    url,
                    last_failure,
                    backoff.as_secs_f64()
                );
                sleep(backoff).await;
            }

            let response = self
                .http
                .post(&self.base)
                .bearer_auth(&self.api_key)
                .json(&json!({ "url": url, "formats": ["json"] }))
                .send()
                .await;

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_failure = format!("extraction service returned {status}");
                        continue;
                    }
                    if !status.is_success() {
                        let body = resp.text().await.unwrap_or_default();
                        return ExtractOutcome::Failed(format!(
                            "extraction service returned {status}: {}",
                            truncate(&body, 300)
                        ));
                    }
                    return match resp.json::<Value>().await {
                        Ok(body) => parse_extract_response(&body),
                        Err(e) => ExtractOutcome::Failed(format!("malformed response body: {e}")),
                    };
                }
                Err(e) if e.is_timeout() || e.is_connect() => {
                    last_failure = format!("extraction request failed: {e}");
                }
                Err(e) => return ExtractOutcome::Failed(e.to_string()),
            }
        }
        ExtractOutcome::Failed(format!("{last_failure} (after {MAX_RETRIES} retries)"))
    }
}

/// Pull the structured payload out of an extraction response. The service
/// wraps it as `{"success": bool, "data": {"json": ...}}`; older responses
/// put the payload under `"json"` or directly under `"data"`.
pub fn parse_extract_response(body: &Value) -> ExtractOutcome {
    if body.get("success").and_then(Value::as_bool) == Some(false) {
        let detail = body
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("extraction reported failure without detail");
        return ExtractOutcome::Failed(detail.to_string());
    }

    let payload = body
        .pointer("/data/json")
        .or_else(|| body.get("json"))
        .or_else(|| body.get("data"))
        .filter(|v| !v.is_null());

    match payload {
        Some(v) if v.as_object().is_some_and(|o| !o.is_empty()) || v.is_array() => {
            ExtractOutcome::Success(v.clone())
        }
        _ => ExtractOutcome::Failed("no structured payload in response".to_string()),
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn success_payload_is_extracted() {
        let body = json!({
            "success": true,
            "data": { "json": { "university_name": "Emory University" } }
        });
        match parse_extract_response(&body) {
            ExtractOutcome::Success(v) => {
                assert_eq!(v["university_name"], "Emory University");
            }
            ExtractOutcome::Failed(e) => panic!("unexpected failure: {e}"),
        }
    }

    #[test]
    fn flat_json_key_is_accepted() {
        let body = json!({ "json": { "university_name": "Georgia Tech" } });
        assert!(matches!(
            parse_extract_response(&body),
            ExtractOutcome::Success(_)
        ));
    }

    #[test]
    fn reported_failure_keeps_detail() {
        let body = json!({ "success": false, "error": "page blocked by robots" });
        match parse_extract_response(&body) {
            ExtractOutcome::Failed(e) => assert_eq!(e, "page blocked by robots"),
            ExtractOutcome::Success(_) => panic!("expected failure"),
        }
    }

    #[test]
    fn empty_payload_is_a_failure() {
        let body = json!({ "success": true, "data": { "json": {} } });
        assert!(matches!(
            parse_extract_response(&body),
            ExtractOutcome::Failed(_)
        ));
        assert!(matches!(
            parse_extract_response(&json!({"success": true})),
            ExtractOutcome::Failed(_)
        ));
    }
}
