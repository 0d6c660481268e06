use std::collections::BTreeMap;

use crate::records::{ProfileRecord, ScrapeStatus};

/// Split work items into `num_batches` balanced partitions. Earlier batches
/// absorb the remainder; empty batches are dropped, so the result may hold
/// fewer partitions than requested.
pub fn split_into_batches<T>(items: Vec<T>, num_batches: usize) -> Vec<Vec<T>> {
    assert!(num_batches > 0, "number of batches must be greater than 0");

    let total = items.len();
    let base = total / num_batches;
    let remainder = total % num_batches;

    let mut batches = Vec::new();
    let mut iter = items.into_iter();
    for i in 0..num_batches {
        let size = base + usize::from(i < remainder);
        if size == 0 {
            break;
        }
        batches.push(iter.by_ref().take(size).collect());
    }
    batches
}

/// Status-filtered requeue: pick the (key, url) pairs whose record matches
/// `predicate`, in stable key order. Pure over the snapshot, so retry policy
/// is testable independent of any network code.
pub fn select_for_retry(
    profiles: &BTreeMap<String, ProfileRecord>,
    predicate: impl Fn(&ProfileRecord) -> bool,
) -> Vec<(String, String)> {
    profiles
        .values()
        .filter(|r| predicate(r))
        .map(|r| (r.key.clone(), r.url.clone()))
        .collect()
}

/// The rescraper's default predicate: failed records, optionally capped by
/// an attempt-count ceiling and a last-attempt age window.
pub fn retryable(
    max_attempts: Option<u32>,
    cutoff: Option<chrono::DateTime<chrono::Utc>>,
) -> impl Fn(&ProfileRecord) -> bool {
    move |r: &ProfileRecord| {
        if r.status != ScrapeStatus::Failed {
            return false;
        }
        if let Some(ceiling) = max_attempts {
            if r.attempts >= ceiling {
                return false;
            }
        }
        if let Some(cutoff) = cutoff {
            match r.last_attempted {
                Some(t) if t < cutoff => return false,
                _ => {}
            }
        }
        true
    }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn record(key: &str, status: ScrapeStatus, attempts: u32) -> ProfileRecord {
        ProfileRecord {
            key: key.to_string(),
            url: format!("https://www.petersons.com/colleges/{key}"),
            status,
            payload: None,
            error: None,
            attempts,
            last_attempted: Some(Utc::now()),
        }
    }

    #[test]
    fn batches_are_balanced() {
        let items: Vec<u32> = (0..10).collect();
        let batches = split_into_batches(items, 3);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0], vec![0, 1, 2, 3]);
        assert_eq!(batches[1], vec![4, 5, 6]);
        assert_eq!(batches[2], vec![7, 8, 9]);
    }

    #[test]
    fn more_batches_than_items_drops_empties() {
        let batches = split_into_batches(vec![1, 2], 5);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0], vec![1]);
        assert_eq!(batches[1], vec![2]);
    }

    #[test]
    fn single_batch_keeps_order() {
        let batches = split_into_batches(vec![3, 1, 2], 1);
        assert_eq!(batches, vec![vec![3, 1, 2]]);
    }

    #[test]
    fn retry_selects_only_failed() {
        let mut store = BTreeMap::new();
        for i in 0..10 {
            let key = format!("ok{i}");
            store.insert(key.clone(), record(&key, ScrapeStatus::Success, 1));
        }
        for i in 0..5 {
            let key = format!("bad{i}");
            store.insert(key.clone(), record(&key, ScrapeStatus::Failed, 1));
        }

        let selected = select_for_retry(&store, retryable(None, None));
        assert_eq!(selected.len(), 5);
        assert!(selected.iter().all(|(k, _)| k.starts_with("bad")));
    }

    #[test]
    fn attempt_ceiling_excludes_exhausted() {
        let mut store = BTreeMap::new();
        store.insert("a".into(), record("a", ScrapeStatus::Failed, 3));
        store.insert("b".into(), record("b", ScrapeStatus::Failed, 1));

        let selected = select_for_retry(&store, retryable(Some(3), None));
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].0, "b");
    }

    #[test]
    fn age_window_excludes_stale() {
        let mut store = BTreeMap::new();
        let mut old = record("old", ScrapeStatus::Failed, 1);
        old.last_attempted = Some(Utc::now() - Duration::hours(48));
        store.insert("old".into(), old);
        store.insert("fresh".into(), record("fresh", ScrapeStatus::Failed, 1));

        let cutoff = Utc::now() - Duration::hours(24);
        let selected = select_for_retry(&store, retryable(None, Some(cutoff)));
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].0, "fresh");
    }
}
