use std::collections::BTreeMap;
use std::time::Duration;

use crate::domain::{ReviewerOutcome, ReviewerResult};

/// Per-run categorization of reviewer outcomes plus timings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReviewStats {
    pub total_reviewers: usize,
    pub successful: Vec<usize>,
    pub failed: Vec<usize>,
    pub timed_out: Vec<usize>,
    pub auth_failed: Vec<usize>,
    pub parse_errors: usize,
    pub reviewer_durations: BTreeMap<usize, Duration>,
    pub reviewer_agent_names: BTreeMap<usize, String>,
    pub wall_clock: Duration,
    pub summarizer_duration: Duration,
    pub fp_filter_duration: Duration,
    pub fp_filtered_count: usize,
    pub ignored_count: usize,
}

impl ReviewStats {
    pub fn all_failed(&self) -> bool {
        self.successful.is_empty()
    }

    pub fn agent_name(&self, reviewer_id: usize) -> &str {
        self.reviewer_agent_names
            .get(&reviewer_id)
            .map_or("unknown", String::as_str)
    }

    /// Distinct agent names among auth-failed reviewers, in ID order.
    pub fn auth_failed_agents(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for id in &self.auth_failed {
            let name = self.agent_name(*id);
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }

    /// (min, avg, max) over per-reviewer durations.
    pub fn duration_spread(&self) -> Option<(Duration, Duration, Duration)> {
        let durations: Vec<Duration> = self.reviewer_durations.values().copied().collect();
        let min = durations.iter().min().copied()?;
        let max = durations.iter().max().copied()?;
        let total: Duration = durations.iter().sum();
        let avg = total / u32::try_from(durations.len()).unwrap_or(u32::MAX);
        Some((min, avg, max))
    }
}

/// Categorize reviewer results. ID lists come out sorted.
pub fn build_stats(
    results: &[ReviewerResult],
    total_reviewers: usize,
    wall_clock: Duration,
) -> ReviewStats {
    let mut stats = ReviewStats {
        total_reviewers,
        wall_clock,
        ..Default::default()
    };

    for result in results {
        let id = result.reviewer_id;
        match result.outcome() {
            ReviewerOutcome::TimedOut => stats.timed_out.push(id),
            ReviewerOutcome::AuthFailed => stats.auth_failed.push(id),
            ReviewerOutcome::Failed => stats.failed.push(id),
            ReviewerOutcome::Successful => stats.successful.push(id),
        }
        stats.parse_errors += result.parse_errors;
        stats.reviewer_durations.insert(id, result.duration);
        stats
            .reviewer_agent_names
            .insert(id, result.agent_name.clone());
    }

    stats.successful.sort_unstable();
    stats.failed.sort_unstable();
    stats.timed_out.sort_unstable();
    stats.auth_failed.sort_unstable();
    stats
}
