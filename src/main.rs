mod batch;
mod clean;
mod combine;
mod course_parse;
mod courses;
mod discover;
mod extract;
mod names;
mod records;
mod scrape;
mod store;
mod validate;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Instant;

use clap::{Parser, Subcommand};

use records::{CourseStatus, ScrapeStatus, ValidationStatus};
use store::Store;

#[derive(Parser)]
#[command(
    name = "peterson_scraper",
    about = "University profile + course catalog acquisition pipeline"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Search for candidate profile URLs per university name
    Discover {
        /// Canonical university list (one name per row)
        #[arg(short, long, default_value = "data/university_names.csv")]
        input: PathBuf,
        /// Max names to process (for testing)
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// Match candidates against canonical names and pick the best URL each
    Validate {
        /// Minimum similarity score to accept a match
        #[arg(long, default_value_t = validate::DEFAULT_THRESHOLD)]
        threshold: f64,
        /// Runner-up within this of the top score makes the pick ambiguous
        #[arg(long, default_value_t = validate::DEFAULT_MARGIN)]
        margin: f64,
    },
    /// Scrape structured profiles for validated URLs in parallel batches
    Scrape {
        /// Number of batches to split the validated URLs into
        #[arg(long, default_value_t = 10)]
        num_batches: usize,
        /// Max profiles to scrape (for testing)
        #[arg(short = 'n', long)]
        limit: Option<usize>,
        /// Report what would be scraped without writing anything
        #[arg(long)]
        dry_run: bool,
    },
    /// Resubmit failed profiles through the batch scraper
    Rescrape {
        /// Number of batches (smaller than scrape's, to reduce load)
        #[arg(long, default_value_t = 2)]
        num_batches: usize,
        /// Skip records that already reached this many attempts
        #[arg(long)]
        max_attempts: Option<u32>,
        /// Only retry records last attempted within this many hours
        #[arg(long)]
        max_age_hours: Option<i64>,
    },
    /// Scrape course catalogs for validated URLs via markup parsing
    Courses {
        /// Max catalogs to scrape (for testing)
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// Merge the profile and course stores into unified records
    Combine,
    /// Emit the final cleaned dataset and the rejected report
    Clean,
    /// Scrape + courses + combine + clean in one pipeline
    Run {
        #[arg(long, default_value_t = 10)]
        num_batches: usize,
    },
    /// Show pipeline statistics
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Discover { input, limit } => {
            let stats = discover::run(&input, limit).await?;
            println!(
                "Discovered candidates for {} universities ({} with candidates, {} empty, {} failed)",
                stats.processed, stats.with_candidates, stats.empty, stats.failed
            );
            Ok(())
        }
        Commands::Validate { threshold, margin } => {
            let stats = validate::run(threshold, margin)?;
            println!(
                "Validation done: {} matched, {} ambiguous, {} unmatched",
                stats.matched, stats.ambiguous, stats.unmatched
            );
            Ok(())
        }
        Commands::Scrape {
            num_batches,
            limit,
            dry_run,
        } => {
            let stats = scrape::run(num_batches, limit, dry_run).await?;
            print_scrape_summary("Scrape", &stats);
            Ok(())
        }
        Commands::Rescrape {
            num_batches,
            max_attempts,
            max_age_hours,
        } => {
            let stats = scrape::rescrape(num_batches, max_attempts, max_age_hours).await?;
            print_scrape_summary("Rescrape", &stats);
            Ok(())
        }
        Commands::Courses { limit } => {
            let stats = courses::run(limit).await?;
            println!(
                "Courses done: {} attempted ({} ok, {} failed, {} skipped)",
                stats.selected, stats.succeeded, stats.failed, stats.skipped
            );
            Ok(())
        }
        Commands::Combine => {
            let stats = combine::run()?;
            println!(
                "Combined {} records ({} complete, {} incomplete)",
                stats.total, stats.complete, stats.incomplete
            );
            Ok(())
        }
        Commands::Clean => {
            let stats = clean::run()?;
            println!(
                "Clean dataset: {} records kept, {} rejected",
                stats.clean, stats.rejected
            );
            Ok(())
        }
        Commands::Run { num_batches } => {
            // Phase 1: profiles
            let s = scrape::run(num_batches, None, false).await?;
            print_scrape_summary("Scrape", &s);

            // Phase 2: course catalogs (independent failure domain)
            let c = courses::run(None).await?;
            println!(
                "Courses done: {} attempted ({} ok, {} failed, {} skipped)",
                c.selected, c.succeeded, c.failed, c.skipped
            );

            // Phase 3: merge + final dataset
            let m = combine::run()?;
            println!(
                "Combined {} records ({} complete, {} incomplete)",
                m.total, m.complete, m.incomplete
            );
            let f = clean::run()?;
            println!(
                "Clean dataset: {} records kept, {} rejected",
                f.clean, f.rejected
            );
            Ok(())
        }
        Commands::Stats => print_stats(),
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn print_scrape_summary(label: &str, stats: &scrape::ScrapeStats) {
    println!(
        "{label} done: {} attempted ({} ok, {} failed, {} skipped)",
        stats.selected, stats.succeeded, stats.failed, stats.skipped
    );
}

fn print_stats() -> anyhow::Result<()> {
    let candidates: BTreeMap<String, Vec<records::Candidate>> =
        Store::open(store::CANDIDATES_PATH).load()?;
    let candidate_urls: usize = candidates.values().map(Vec::len).sum();
    println!(
        "Discovered: {} universities ({} candidate URLs)",
        candidates.len(),
        candidate_urls
    );

    let validations: BTreeMap<String, records::ValidationRecord> =
        Store::open(store::VALIDATIONS_PATH).load()?;
    let count_v = |s: ValidationStatus| validations.values().filter(|v| v.status == s).count();
    println!(
        "Validated:  {} ({} matched, {} ambiguous, {} unmatched)",
        validations.len(),
        count_v(ValidationStatus::Matched),
        count_v(ValidationStatus::Ambiguous),
        count_v(ValidationStatus::Unmatched)
    );

    let profiles: BTreeMap<String, records::ProfileRecord> =
        Store::open(store::PROFILES_PATH).load()?;
    let count_p = |s: ScrapeStatus| profiles.values().filter(|p| p.status == s).count();
    println!(
        "Profiles:   {} ({} success, {} failed, {} pending)",
        profiles.len(),
        count_p(ScrapeStatus::Success),
        count_p(ScrapeStatus::Failed),
        count_p(ScrapeStatus::Pending)
    );

    let courses: BTreeMap<String, records::CourseRecord> =
        Store::open(store::COURSES_PATH).load()?;
    let ok = courses
        .values()
        .filter(|c| c.status == CourseStatus::Success)
        .count();
    let entries: usize = courses.values().map(|c| c.courses.len()).sum();
    println!(
        "Courses:    {} ({} success, {} failed, {} entries)",
        courses.len(),
        ok,
        courses.len() - ok,
        entries
    );

    let unified: BTreeMap<String, records::UnifiedRecord> =
        Store::open(store::UNIFIED_PATH).load()?;
    let complete = unified.values().filter(|u| u.complete).count();
    println!("Unified:    {} ({} complete)", unified.len(), complete);

    let clean: BTreeMap<String, records::CleanRecord> = Store::open(store::CLEAN_PATH).load()?;
    let rejected: BTreeMap<String, records::RejectedEntry> =
        Store::open(store::REJECTED_PATH).load()?;
    println!("Clean:      {} kept, {} rejected", clean.len(), rejected.len());

    Ok(())
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
