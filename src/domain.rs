use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A single piece of text emitted by one reviewer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub text: String,
    pub reviewer_id: usize,
    pub agent_name: Option<String>,
}

/// Terminal classification of a reviewer. Exactly one applies per result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewerOutcome {
    Successful,
    Failed,
    TimedOut,
    AuthFailed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReviewerResult {
    pub reviewer_id: usize,
    pub agent_name: String,
    pub findings: Vec<Finding>,
    pub parse_errors: usize,
    pub exit_code: i32,
    pub stderr: String,
    pub duration: Duration,
    pub timed_out: bool,
    pub auth_failed: bool,
    pub skills_used: Vec<String>,
}

impl ReviewerResult {
    pub fn new(reviewer_id: usize, agent_name: impl Into<String>) -> Self {
        Self {
            reviewer_id,
            agent_name: agent_name.into(),
            findings: Vec::new(),
            parse_errors: 0,
            exit_code: 0,
            stderr: String::new(),
            duration: Duration::ZERO,
            timed_out: false,
            auth_failed: false,
            skills_used: Vec::new(),
        }
    }

    /// Placeholder for a reviewer that never ran (cancelled or no agent).
    pub fn sentinel(reviewer_id: usize, agent_name: impl Into<String>) -> Self {
        Self {
            exit_code: -1,
            ..Self::new(reviewer_id, agent_name)
        }
    }

    /// Timeout wins over auth failure, which wins over a plain non-zero exit.
    pub fn outcome(&self) -> ReviewerOutcome {
        if self.timed_out {
            ReviewerOutcome::TimedOut
        } else if self.auth_failed {
            ReviewerOutcome::AuthFailed
        } else if self.exit_code != 0 {
            ReviewerOutcome::Failed
        } else {
            ReviewerOutcome::Successful
        }
    }
}

/// One distinct finding text and every reviewer that reported it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AggregatedFinding {
    pub text: String,
    pub reviewers: Vec<usize>,
}

/// Merge byte-identical finding texts across reviewers.
///
/// Order is first-seen; reviewer IDs keep insertion order and appear once.
pub fn aggregate_findings<'a>(
    findings: impl IntoIterator<Item = &'a Finding>,
) -> Vec<AggregatedFinding> {
    let mut aggregated: Vec<AggregatedFinding> = Vec::new();
    let mut index: HashMap<&'a str, usize> = HashMap::new();

    for finding in findings {
        if finding.text.is_empty() {
            continue;
        }
        match index.get(finding.text.as_str()) {
            Some(&pos) => {
                let reviewers = &mut aggregated[pos].reviewers;
                if !reviewers.contains(&finding.reviewer_id) {
                    reviewers.push(finding.reviewer_id);
                }
            }
            None => {
                index.insert(finding.text.as_str(), aggregated.len());
                aggregated.push(AggregatedFinding {
                    text: finding.text.clone(),
                    reviewers: vec![finding.reviewer_id],
                });
            }
        }
    }

    aggregated
}

/// Flatten findings from every reviewer result, preserving per-reviewer order.
pub fn collect_findings(results: &[ReviewerResult]) -> Vec<Finding> {
    results
        .iter()
        .flat_map(|r| r.findings.iter().cloned())
        .collect()
}

/// A cluster of aggregated findings describing one underlying issue.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FindingGroup {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub messages: Vec<String>,
    #[serde(default)]
    pub reviewer_count: usize,
    #[serde(default)]
    pub sources: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GroupedFindings {
    #[serde(default)]
    pub findings: Vec<FindingGroup>,
    #[serde(default)]
    pub info: Vec<FindingGroup>,
}

impl GroupedFindings {
    pub fn has_findings(&self) -> bool {
        !self.findings.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.findings.is_empty() && self.info.is_empty()
    }
}

/// A finding removed by the LLM scoring pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluatedFinding {
    pub group: FindingGroup,
    pub fp_score: u8,
    /// Cutoff the score was compared against.
    pub threshold: u8,
    pub reasoning: String,
}

/// Audit label for one aggregated finding after every filter ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// No summarizer group referenced this finding.
    Unmapped,
    Informational {
        title: String,
    },
    FilteredFp {
        title: String,
        fp_score: u8,
        threshold: u8,
        reasoning: String,
    },
    FilteredIgnore {
        title: String,
    },
    Survived {
        title: String,
    },
}

impl Disposition {
    /// Short italic-ready description used when annotating reviewer comments.
    pub fn describe(&self) -> String {
        match self {
            Disposition::Unmapped => "Not included in summary".to_string(),
            Disposition::Informational { title } => format!("Informational: {title}"),
            Disposition::FilteredFp {
                title,
                fp_score,
                threshold,
                reasoning,
            } => {
                let label = format!(
                    "Filtered as likely false positive (score {fp_score}, threshold {threshold}): \
                     {title}"
                );
                if reasoning.is_empty() {
                    label
                } else {
                    format!("{label} ({reasoning})")
                }
            }
            Disposition::FilteredIgnore { title } => format!("Ignored by pattern: {title}"),
            Disposition::Survived { title } => format!("Reported as: {title}"),
        }
    }
}

/// Build one disposition per aggregated index.
///
/// Layers are applied informational, then fp, then ignore, then survived;
/// later layers override earlier ones. Source indices outside
/// `[0, aggregated_len)` are skipped.
pub fn build_dispositions(
    aggregated_len: usize,
    info: &[FindingGroup],
    fp_removed: &[EvaluatedFinding],
    ignored: &[FindingGroup],
    survivors: &[FindingGroup],
) -> Vec<Disposition> {
    let mut dispositions = vec![Disposition::Unmapped; aggregated_len];

    let mut assign = |sources: &[usize], make: &dyn Fn() -> Disposition| {
        for &idx in sources {
            if let Some(slot) = dispositions.get_mut(idx) {
                *slot = make();
            }
        }
    };

    for group in info {
        assign(&group.sources, &|| Disposition::Informational {
            title: group.title.clone(),
        });
    }
    for removed in fp_removed {
        assign(&removed.group.sources, &|| Disposition::FilteredFp {
            title: removed.group.title.clone(),
            fp_score: removed.fp_score,
            threshold: removed.threshold,
            reasoning: removed.reasoning.clone(),
        });
    }
    for group in ignored {
        assign(&group.sources, &|| Disposition::FilteredIgnore {
            title: group.title.clone(),
        });
    }
    for group in survivors {
        assign(&group.sources, &|| Disposition::Survived {
            title: group.title.clone(),
        });
    }

    dispositions
}
