use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use conductor_types::{CostEntry, ModelTier};

use crate::state::{BudgetState, BudgetThresholds};

fn to_microdollars(usd: f64) -> i64 {
    let clamped = usd.max(0.0);
    (clamped * 1_000_000.0).round() as i64
}

fn from_microdollars(micro: i64) -> f64 {
    micro as f64 / 1_000_000.0
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Aggregates {
    by_skill: HashMap<String, i64>,
    by_model: HashMap<ModelTier, i64>,
    by_day: HashMap<String, i64>,
}

/// Accumulates recorded spend as a 64-bit integer microdollar total so
/// repeated `record` + `totalSpent` round-trips never drift (I3).
#[derive(Debug, Default)]
pub struct CostTracker {
    entries: Vec<CostEntry>,
    total_micro: i64,
    aggregates: Aggregates,
    malformed_timestamps: u64,
}

impl CostTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Negative costs are clamped to zero before accumulation.
    pub fn record(&mut self, entry: CostEntry) {
        let micro = to_microdollars(entry.estimated_cost_usd);
        self.total_micro = self.total_micro.saturating_add(micro);
        *self
            .aggregates
            .by_skill
            .entry(entry.skill.clone())
            .or_insert(0) += micro;
        *self
            .aggregates
            .by_model
            .entry(entry.model_tier)
            .or_insert(0) += micro;
        let day = entry.timestamp.format("%Y-%m-%d").to_string();
        *self.aggregates.by_day.entry(day).or_insert(0) += micro;
        self.entries.push(entry);
    }

    pub fn total_spent(&self) -> f64 {
        from_microdollars(self.total_micro)
    }

    /// Sum of entries whose timestamp parses and is `>= since`. Entries are
    /// always stored with a valid `DateTime<Utc>`, so malformed timestamps
    /// can only originate from the persisted report this tracker reads back
    /// (`malformed_timestamps`); this counts those, it never filters `entries`.
    pub fn spent_since(&self, since: DateTime<Utc>) -> f64 {
        let micro: i64 = self
            .entries
            .iter()
            .filter(|e| e.timestamp >= since)
            .map(|e| to_microdollars(e.estimated_cost_usd))
            .sum();
        from_microdollars(micro)
    }

    pub fn to_budget_state(&self, total_monthly_usd: f64, thresholds: BudgetThresholds) -> BudgetState {
        BudgetState::derive(self.total_spent(), total_monthly_usd, thresholds)
    }

    pub fn malformed_entries(&self) -> u64 {
        self.malformed_timestamps
    }

    pub fn note_malformed_timestamp(&mut self) {
        self.malformed_timestamps += 1;
    }

    /// Emits a dated markdown report per §4.1 `flush`, written under
    /// `{dir}/cost-{YYYY-MM-DD}.md`.
    pub fn flush(&self, dir: &Path, now: DateTime<Utc>) -> std::io::Result<std::path::PathBuf> {
        std::fs::create_dir_all(dir)?;
        let filename = format!("cost-{}.md", now.format("%Y-%m-%d"));
        let path = dir.join(filename);
        std::fs::write(&path, self.render_report(now))?;
        Ok(path)
    }

    fn render_report(&self, now: DateTime<Utc>) -> String {
        let mut out = String::new();
        out.push_str(&format!("# Cost report — {}\n\n", now.format("%Y-%m-%d")));
        out.push_str(&format!("Total spent: ${:.6}\n", self.total_spent()));
        out.push_str(&format!("Entries: {}\n", self.entries.len()));
        out.push_str(&format!("Malformed entries: {}\n\n", self.malformed_timestamps));

        out.push_str("## By skill\n\n");
        let mut by_skill: Vec<_> = self.aggregates.by_skill.iter().collect();
        by_skill.sort_by_key(|(skill, _)| skill.to_string());
        for (skill, micro) in by_skill {
            out.push_str(&format!("- {skill}: ${:.6}\n", from_microdollars(*micro)));
        }

        out.push_str("\n## By model\n\n");
        let mut by_model: Vec<_> = self.aggregates.by_model.iter().collect();
        by_model.sort_by_key(|(tier, _)| tier.to_string());
        for (tier, micro) in by_model {
            out.push_str(&format!("- {tier}: ${:.6}\n", from_microdollars(*micro)));
        }

        out.push_str("\n## By day\n\n");
        let mut by_day: Vec<_> = self.aggregates.by_day.iter().collect();
        by_day.sort_by_key(|(day, _)| day.to_string());
        for (day, micro) in by_day {
            out.push_str(&format!("- {day}: ${:.6}\n", from_microdollars(*micro)));
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_types::ModelTier;

    fn entry(cost: f64, skill: &str, tier: ModelTier, ts: DateTime<Utc>) -> CostEntry {
        CostEntry {
            timestamp: ts,
            task_id: "t-1".to_string(),
            skill: skill.to_string(),
            model_tier: tier,
            input_tokens: 100,
            output_tokens: 50,
            estimated_cost_usd: cost,
        }
    }

    #[test]
    fn record_accumulates_in_microdollars_without_drift() {
        let mut tracker = CostTracker::new();
        for _ in 0..3 {
            tracker.record(entry(0.1, "draft-copy", ModelTier::Sonnet, Utc::now()));
        }
        assert!((tracker.total_spent() - 0.3).abs() < 1e-9);
    }

    #[test]
    fn negative_cost_is_clamped_to_zero() {
        let mut tracker = CostTracker::new();
        tracker.record(entry(-5.0, "draft-copy", ModelTier::Sonnet, Utc::now()));
        assert_eq!(tracker.total_spent(), 0.0);
    }

    #[test]
    fn spent_since_filters_by_cutoff() {
        let mut tracker = CostTracker::new();
        let cutoff = DateTime::parse_from_rfc3339("2026-01-15T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let before = DateTime::parse_from_rfc3339("2026-01-10T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let after = DateTime::parse_from_rfc3339("2026-01-20T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        tracker.record(entry(1.0, "draft-copy", ModelTier::Sonnet, before));
        tracker.record(entry(2.0, "draft-copy", ModelTier::Sonnet, after));
        assert_eq!(tracker.spent_since(cutoff), 2.0);
    }

    #[test]
    fn flush_writes_dated_report_with_breakdowns() {
        let mut tracker = CostTracker::new();
        let ts = DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        tracker.record(entry(1.5, "draft-copy", ModelTier::Sonnet, ts));
        tracker.note_malformed_timestamp();
        let dir = tempfile::tempdir().unwrap();
        let path = tracker.flush(dir.path(), ts).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("cost-2026-03-01"));
        assert!(contents.contains("Malformed entries: 1"));
        assert!(contents.contains("draft-copy"));
        assert!(contents.contains("sonnet"));
    }

    #[test]
    fn record_never_lowers_budget_level() {
        let mut tracker = CostTracker::new();
        let thresholds = BudgetThresholds::default();
        tracker.record(entry(90.0, "draft-copy", ModelTier::Sonnet, Utc::now()));
        let before = tracker.to_budget_state(100.0, thresholds).level;
        tracker.record(entry(0.0, "draft-copy", ModelTier::Sonnet, Utc::now()));
        let after = tracker.to_budget_state(100.0, thresholds).level;
        assert!(after >= before);
    }
}
