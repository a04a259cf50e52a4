//! Run statistics and collection overview.
//!
//! [`RunStats`] aggregates the per-record outcomes of one sync run: counts
//! for created/matched/skipped records, audio synthesis, and recovered
//! errors by category. `run_stats` backs the `decksync stats` command with a
//! quick health summary of the local collection.

use std::collections::BTreeMap;

use crate::config::Config;
use crate::error::Result;
use crate::models::DriftReport;
use crate::store::Collection;

/// Counters collected over one reconciliation run.
#[derive(Debug, Clone, Default)]
pub struct RunStats {
    pub records_read: u64,
    pub records_created: u64,
    pub records_matched: u64,
    pub records_skipped: u64,
    pub audio_generated: u64,
    pub audio_errors: u64,
    pub pending_writes: u64,
    /// Recovered per-record errors, keyed by category
    /// (e.g. `missing_required_field`).
    pub errors: BTreeMap<String, u64>,
}

impl RunStats {
    pub fn count_error(&mut self, category: &str) {
        *self.errors.entry(category.to_string()).or_insert(0) += 1;
    }

    /// Print the run summary in the command's output format.
    pub fn print_summary(&self, drift: &DriftReport) {
        println!("sync");
        println!("  records read: {}", self.records_read);
        println!("  notes created: {}", self.records_created);
        println!("  notes matched: {}", self.records_matched);
        println!("  records skipped: {}", self.records_skipped);
        println!("  audio generated: {}", self.audio_generated);
        if self.audio_errors > 0 {
            println!("  audio errors: {}", self.audio_errors);
        }
        println!("  guid write-backs: {}", self.pending_writes);
        println!(
            "  drift: {} shared, {} only external, {} only local",
            drift.in_both, drift.only_external, drift.only_local
        );

        if !self.errors.is_empty() {
            println!("  errors:");
            for (category, count) in &self.errors {
                println!("    {}: {}", category, count);
            }
        }
    }
}

/// Run the stats command: open the collection and print an overview.
pub async fn run_stats(config: &Config) -> Result<()> {
    let mut store = Collection::open(&config.store.path).await?;
    let (notes, cards, revlog) = store.counts().await?;

    let db_size = std::fs::metadata(&config.store.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("deck-sync — Collection Stats");
    println!("============================");
    println!();
    println!("  Collection:  {}", config.store.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Notes:       {}", notes);
    println!("  Cards:       {}", cards);
    println!("  Reviews:     {}", revlog);
    println!();

    store.close().await?;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories_accumulate() {
        let mut stats = RunStats::default();
        stats.count_error("missing_required_field");
        stats.count_error("missing_required_field");
        stats.count_error("unknown_column");

        assert_eq!(stats.errors.get("missing_required_field"), Some(&2));
        assert_eq!(stats.errors.get("unknown_column"), Some(&1));
    }
}
