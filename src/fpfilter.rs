use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::{Agent, CallStatus, run_summary};
use crate::domain::{EvaluatedFinding, FindingGroup, GroupedFindings};
use crate::parser::parse_summary_json;
use crate::prompts::fp_prompt_with_feedback;

pub const DEFAULT_THRESHOLD: u8 = 75;

/// Outcome of the scoring pass. When `skipped` is set every finding was
/// kept unscored and the string says why.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FpFilterResult {
    pub grouped: GroupedFindings,
    pub removed: Vec<EvaluatedFinding>,
    pub duration: Duration,
    pub eval_errors: usize,
    pub skipped: Option<String>,
}

impl FpFilterResult {
    fn skipped(grouped: &GroupedFindings, start: Instant, reason: impl Into<String>) -> Self {
        Self {
            grouped: grouped.clone(),
            duration: start.elapsed(),
            skipped: Some(reason.into()),
            ..Default::default()
        }
    }
}

#[derive(Serialize)]
struct EvaluationRequest<'a> {
    findings: Vec<FindingInput<'a>>,
}

#[derive(Serialize)]
struct FindingInput<'a> {
    id: usize,
    title: &'a str,
    summary: &'a str,
    messages: &'a [String],
    reviewer_count: usize,
}

#[derive(Deserialize)]
struct EvaluationResponse {
    #[serde(default)]
    evaluations: Vec<FindingEvaluation>,
}

#[derive(Deserialize)]
struct FindingEvaluation {
    id: usize,
    fp_score: i64,
    #[serde(default)]
    reasoning: String,
}

/// LLM-based false-positive scoring over grouped findings.
pub struct FpFilter {
    agent: Arc<dyn Agent>,
    threshold: u8,
    timeout: Option<Duration>,
}

impl FpFilter {
    /// A threshold outside `[1, 100]` falls back to [`DEFAULT_THRESHOLD`].
    pub fn new(agent: Arc<dyn Agent>, threshold: u8, timeout: Option<Duration>) -> Self {
        let threshold = if (1..=100).contains(&threshold) {
            threshold
        } else {
            DEFAULT_THRESHOLD
        };
        Self {
            agent,
            threshold,
            timeout,
        }
    }

    pub fn threshold(&self) -> u8 {
        self.threshold
    }

    /// Score `grouped.findings` and drop those at or above the threshold.
    /// Info items pass through untouched. Fails open: any error keeps every
    /// finding and reports the reason in `skipped`.
    pub async fn apply(
        &self,
        grouped: &GroupedFindings,
        feedback: &str,
        cancel: &CancellationToken,
    ) -> FpFilterResult {
        let start = Instant::now();
        if grouped.findings.is_empty() {
            return FpFilterResult {
                grouped: grouped.clone(),
                duration: start.elapsed(),
                ..Default::default()
            };
        }
        if cancel.is_cancelled() {
            return FpFilterResult::skipped(grouped, start, "context canceled");
        }

        let request = EvaluationRequest {
            findings: grouped
                .findings
                .iter()
                .enumerate()
                .map(|(id, f)| FindingInput {
                    id,
                    title: &f.title,
                    summary: &f.summary,
                    messages: &f.messages,
                    reviewer_count: f.reviewer_count,
                })
                .collect(),
        };
        let payload = match serde_json::to_vec(&request) {
            Ok(p) => p,
            Err(e) => {
                return FpFilterResult::skipped(
                    grouped,
                    start,
                    format!("request encode failed: {e}"),
                );
            }
        };
        let prompt = match fp_prompt_with_feedback(feedback) {
            Ok(p) => p,
            Err(e) => {
                return FpFilterResult::skipped(
                    grouped,
                    start,
                    format!("prompt render failed: {e}"),
                );
            }
        };

        info!(
            "[fp-filter] scoring {} finding(s) with {} (threshold {})",
            grouped.findings.len(),
            self.agent.name(),
            self.threshold
        );
        let output = match run_summary(
            self.agent.as_ref(),
            &prompt,
            &payload,
            cancel,
            self.timeout,
        )
        .await
        {
            Ok(o) => o,
            Err(e) => {
                return FpFilterResult::skipped(
                    grouped,
                    start,
                    format!("LLM execution failed: {e}"),
                );
            }
        };
        match output.status {
            CallStatus::Completed => {}
            CallStatus::Cancelled => {
                return FpFilterResult::skipped(grouped, start, "context canceled");
            }
            CallStatus::TimedOut => return FpFilterResult::skipped(grouped, start, "timed out"),
        }
        if output.exit_code != 0 {
            return FpFilterResult::skipped(
                grouped,
                start,
                format!("agent exited with code {}", output.exit_code),
            );
        }

        let parsed = parse_summary_json::<EvaluationResponse>(self.agent.name(), &output.stdout);
        let response = match parsed {
            Ok(r) => r,
            Err(e) => {
                warn!("[fp-filter] {e}");
                let mut result =
                    FpFilterResult::skipped(grouped, start, format!("response parse failed: {e}"));
                result.eval_errors = grouped.findings.len();
                return result;
            }
        };

        let result = self.partition(grouped, response.evaluations, start);
        info!(
            "[fp-filter] removed {} of {} finding(s) in {:.1}s",
            result.removed.len(),
            grouped.findings.len(),
            result.duration.as_secs_f64()
        );
        result
    }

    fn partition(
        &self,
        grouped: &GroupedFindings,
        evaluations: Vec<FindingEvaluation>,
        start: Instant,
    ) -> FpFilterResult {
        let by_id: HashMap<usize, FindingEvaluation> =
            evaluations.into_iter().map(|e| (e.id, e)).collect();

        let mut kept: Vec<FindingGroup> = Vec::new();
        let mut removed = Vec::new();
        let mut eval_errors = 0;

        for (id, finding) in grouped.findings.iter().enumerate() {
            let Some(eval) = by_id.get(&id) else {
                debug!("[fp-filter] no evaluation for finding {id}, keeping it");
                kept.push(finding.clone());
                eval_errors += 1;
                continue;
            };
            let score = u8::try_from(eval.fp_score.clamp(0, 100)).unwrap_or(100);
            if score >= self.threshold {
                removed.push(EvaluatedFinding {
                    group: finding.clone(),
                    fp_score: score,
                    threshold: self.threshold,
                    reasoning: eval.reasoning.clone(),
                });
            } else {
                kept.push(finding.clone());
            }
        }

        FpFilterResult {
            grouped: GroupedFindings {
                findings: kept,
                info: grouped.info.clone(),
            },
            removed,
            duration: start.elapsed(),
            eval_errors,
            skipped: None,
        }
    }
}
