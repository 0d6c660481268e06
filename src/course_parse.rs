use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::records::CourseEntry;

static HEADING_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(#{1,6})\s+(.+)$").unwrap());
static BULLET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:[-*+]|\d+[.)])\s+(.+)$").unwrap());
static LINK_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[([^\]]*)\]\([^)]*\)").unwrap());
static CREDITS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\(?\s*(\d+(?:\.\d+)?)\s*(?:semester\s+)?(?:credit|unit|hour)s?(?:\s+hours?)?\s*\)?\s*$",
    )
    .unwrap()
});
static CATALOG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)majors?|degrees?|programs?|academics|courses?|fields? of study").unwrap()
});

const LEVEL_KEYWORDS: &[(&str, &str)] = &[
    ("associate", "Associate"),
    ("bachelor", "Bachelor's"),
    ("undergraduate", "Bachelor's"),
    ("master", "Master's"),
    ("graduate", "Master's"),
    ("doctor", "Doctoral"),
    ("ph.d", "Doctoral"),
    ("certificate", "Certificate"),
];

/// Extract course entries from profile-page markup. Headings carry the
/// degree-level context; list items under a catalog section become entries.
/// Navigation and boilerplate lists are skipped because they sit outside
/// catalog headings.
pub fn parse_courses(markdown: &str) -> Vec<CourseEntry> {
    let mut entries = Vec::new();
    let mut seen: HashSet<(String, Option<String>)> = HashSet::new();
    let mut in_catalog = false;
    let mut level: Option<String> = None;

    for raw in markdown.lines() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(caps) = HEADING_RE.captures(line) {
            let text = caps[2].trim();
            let heading_level = detect_level(text);
            if heading_level.is_some() {
                in_catalog = true;
                level = heading_level;
            } else if CATALOG_RE.is_match(text) {
                in_catalog = true;
                level = None;
            } else {
                in_catalog = false;
                level = None;
            }
            continue;
        }

        if !in_catalog {
            continue;
        }
        let Some(caps) = BULLET_RE.captures(line) else {
            continue;
        };

        let text = LINK_RE.replace_all(caps[1].trim(), "$1").to_string();
        let (name, credits) = split_credits(&text);
        if name.len() < 3 || name.chars().all(|c| !c.is_alphabetic()) {
            continue;
        }

        let dedup_key = (name.to_lowercase(), level.clone());
        if seen.insert(dedup_key) {
            entries.push(CourseEntry {
                name,
                level: level.clone(),
                credits,
            });
        }
    }

    entries
}

fn detect_level(heading: &str) -> Option<String> {
    let lower = heading.to_lowercase();
    LEVEL_KEYWORDS
        .iter()
        .find(|&&(kw, _)| lower.contains(kw))
        .map(|&(_, canonical)| canonical.to_string())
}

/// Split a trailing credits annotation off a course name:
/// "Agribusiness (60 credits)" → ("Agribusiness", Some(60.0)).
fn split_credits(text: &str) -> (String, Option<f64>) {
    if let Some(caps) = CREDITS_RE.captures(text) {
        let credits = caps[1].parse::<f64>().ok();
        let name = text[..caps.get(0).map_or(text.len(), |m| m.start())]
            .trim()
            .trim_end_matches(['(', '-', '–', ','])
            .trim()
            .to_string();
        if !name.is_empty() {
            return (name, credits);
        }
    }
    (text.trim().to_string(), None)
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    const FIXTURE: &str = "\
# Abraham Baldwin Agricultural College

[Home](https://www.petersons.com/) | [Search](https://www.petersons.com/search)

## Majors and Degrees

### Associate Degrees

- Agribusiness (60 credits)
- [Diversified Agriculture](https://www.petersons.com/majors/diversified-agriculture) (62 credits)
- Nursing

### Bachelor's Programs

1. Agricultural Education
2. Natural Resource Management (120 Credit Hours)

## Campus Life

- Student housing
- Dining halls
";

    #[test]
    fn parses_levels_and_credits() {
        let courses = parse_courses(FIXTURE);
        let agribusiness = courses.iter().find(|c| c.name == "Agribusiness").unwrap();
        assert_eq!(agribusiness.level.as_deref(), Some("Associate"));
        assert_eq!(agribusiness.credits, Some(60.0));

        let nursing = courses.iter().find(|c| c.name == "Nursing").unwrap();
        assert_eq!(nursing.credits, None);

        let nrm = courses
            .iter()
            .find(|c| c.name == "Natural Resource Management")
            .unwrap();
        assert_eq!(nrm.level.as_deref(), Some("Bachelor's"));
        assert_eq!(nrm.credits, Some(120.0));
    }

    #[test]
    fn link_markup_is_stripped() {
        let courses = parse_courses(FIXTURE);
        assert!(courses.iter().any(|c| c.name == "Diversified Agriculture"));
        assert!(courses.iter().all(|c| !c.name.contains("](")));
    }

    #[test]
    fn non_catalog_sections_are_ignored() {
        let courses = parse_courses(FIXTURE);
        assert!(courses.iter().all(|c| c.name != "Student housing"));
        assert!(courses.iter().all(|c| c.name != "Dining halls"));
    }

    #[test]
    fn duplicate_entries_collapse() {
        let md = "## Majors\n- Biology\n- Biology\n- biology\n";
        let courses = parse_courses(md);
        assert_eq!(courses.len(), 1);
    }

    #[test]
    fn empty_markup_yields_nothing() {
        assert!(parse_courses("").is_empty());
        assert!(parse_courses("no headings, no bullets").is_empty());
    }
}
