use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Validation ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationStatus {
    Matched,
    Ambiguous,
    Unmatched,
}

/// One candidate profile URL discovered for a university name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub key: String,
    pub label: String,
    pub url: String,
    /// 0-based position in the search response.
    pub rank: usize,
    pub discovered_at: DateTime<Utc>,
}

/// Outcome of matching a university's candidates against its canonical name.
/// Overwritten on re-validation, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationRecord {
    pub key: String,
    pub status: ValidationStatus,
    /// Present iff status == matched.
    pub chosen_url: Option<String>,
    /// Remaining candidates above the backup floor, best first.
    pub backups: Vec<String>,
    pub reason: String,
    /// Similarity score of the top candidate (0.0 when there were none).
    pub score: f64,
    pub validated_at: DateTime<Utc>,
}

// ── Scraping ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrapeStatus {
    Pending,
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileRecord {
    pub key: String,
    pub url: String,
    pub status: ScrapeStatus,
    /// Structured payload from the extraction service, present iff success.
    pub payload: Option<Value>,
    /// Raw error detail, present iff failed.
    pub error: Option<String>,
    pub attempts: u32,
    pub last_attempted: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CourseStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CourseEntry {
    pub name: String,
    pub level: Option<String>,
    pub credits: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CourseRecord {
    pub key: String,
    pub url: String,
    pub status: CourseStatus,
    pub error: Option<String>,
    pub courses: Vec<CourseEntry>,
}

// ── Combined output ──

/// Per-university merge of the profile and course stores. Recomputed
/// wholesale on every combine run, never hand-edited.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedRecord {
    pub key: String,
    pub name: Option<String>,
    pub profile: Option<Value>,
    pub courses: Vec<CourseEntry>,
    /// Which stage contributed which side of the record.
    pub provenance: BTreeMap<String, String>,
    pub complete: bool,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanRecord {
    pub key: String,
    pub name: Option<String>,
    pub profile: Option<Value>,
    pub courses: Vec<CourseEntry>,
    pub complete: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectedEntry {
    pub key: String,
    pub reason: String,
}
