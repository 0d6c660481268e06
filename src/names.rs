use std::path::Path;

use anyhow::{bail, Context, Result};

/// A university name from the canonical input list. Created once, never
/// mutated; `key` is the join key used by every downstream stage.
#[derive(Debug, Clone)]
pub struct CanonicalName {
    pub name: String,
    pub key: String,
}

/// Case/whitespace-fold a display name into the canonical join key.
/// Punctuation is treated as whitespace so "St. John's" and "st johns"
/// collapse to the same key.
pub fn normalize_key(raw: &str) -> String {
    raw.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Load the canonical university list: one name per row, first column.
/// Duplicate keys collapse to the first occurrence. Missing or empty
/// input is a stage-fatal error.
pub fn load_names(path: &Path) -> Result<Vec<CanonicalName>> {
    if !path.exists() {
        bail!("canonical input file not found: {}", path.display());
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("failed to open canonical input {}", path.display()))?;

    let mut names: Vec<CanonicalName> = Vec::new();
    for record in reader.records() {
        let record = record.context("failed to read canonical input row")?;
        let Some(raw) = record.get(0) else { continue };
        let name = raw.trim();
        if name.is_empty() {
            continue;
        }
        let key = normalize_key(name);
        if key.is_empty() || names.iter().any(|n| n.key == key) {
            continue;
        }
        names.push(CanonicalName {
            name: name.to_string(),
            key,
        });
    }

    if names.is_empty() {
        bail!("canonical input {} contains no names", path.display());
    }
    Ok(names)
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn key_folds_case_and_whitespace() {
        assert_eq!(
            normalize_key("  Abraham   Baldwin Agricultural College "),
            "abraham baldwin agricultural college"
        );
    }

    #[test]
    fn key_folds_punctuation() {
        assert_eq!(normalize_key("St. John's University"), "st john s university");
        assert_eq!(normalize_key("st johns university"), "st johns university");
    }

    #[test]
    fn loads_and_dedupes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("names.csv");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "Emory University").unwrap();
        writeln!(f, "emory  university").unwrap();
        writeln!(f, "Georgia Tech").unwrap();
        writeln!(f).unwrap();

        let names = load_names(&path).unwrap();
        assert_eq!(names.len(), 2);
        assert_eq!(names[0].name, "Emory University");
        assert_eq!(names[0].key, "emory university");
        assert_eq!(names[1].key, "georgia tech");
    }

    #[test]
    fn missing_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_names(&dir.path().join("nope.csv")).is_err());
    }

    #[test]
    fn empty_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.csv");
        std::fs::write(&path, "").unwrap();
        assert!(load_names(&path).is_err());
    }
}
