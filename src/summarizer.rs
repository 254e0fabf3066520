use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::{Agent, CallStatus, run_summary};
use crate::domain::{AggregatedFinding, GroupedFindings};
use crate::error::Result;
use crate::parser::parse_summary_json;
use crate::prompts::GROUP_PROMPT;

/// Outcome of the grouping stage.
///
/// `grouping_failed` means no grouping could be obtained: `grouped` is empty
/// and `raw_output` holds whatever the agent printed. A non-zero
/// `exit_code` alone does not imply it; an agent may exit non-zero after
/// printing a valid grouping.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SummaryResult {
    pub grouped: GroupedFindings,
    pub exit_code: i32,
    pub stderr: String,
    pub raw_output: String,
    pub duration: Duration,
    pub grouping_failed: bool,
}

impl SummaryResult {
    fn failed(
        exit_code: i32,
        stderr: impl Into<String>,
        raw_output: String,
        start: Instant,
    ) -> Self {
        Self {
            grouped: GroupedFindings::default(),
            exit_code,
            stderr: stderr.into(),
            raw_output,
            duration: start.elapsed(),
            grouping_failed: true,
        }
    }
}

#[derive(Serialize)]
struct SummaryInput<'a> {
    id: usize,
    text: &'a str,
    reviewers: &'a [usize],
}

/// Encode aggregated findings for the grouping prompt; `id` is the index.
pub fn encode_input(aggregated: &[AggregatedFinding]) -> Result<Vec<u8>> {
    let input: Vec<SummaryInput<'_>> = aggregated
        .iter()
        .enumerate()
        .map(|(id, a)| SummaryInput {
            id,
            text: &a.text,
            reviewers: &a.reviewers,
        })
        .collect();
    Ok(serde_json::to_vec(&input)?)
}

/// Clusters aggregated findings into groups with an LLM agent.
pub struct Summarizer {
    agent: Arc<dyn Agent>,
    timeout: Option<Duration>,
}

impl Summarizer {
    pub fn new(agent: Arc<dyn Agent>, timeout: Option<Duration>) -> Self {
        Self { agent, timeout }
    }

    /// Group `aggregated`. Returns `Err` only when the agent cannot be
    /// started; every other failure is reported inside the result.
    pub async fn summarize(
        &self,
        aggregated: &[AggregatedFinding],
        cancel: &CancellationToken,
    ) -> Result<SummaryResult> {
        let start = Instant::now();
        if aggregated.is_empty() {
            return Ok(SummaryResult::default());
        }
        if cancel.is_cancelled() {
            return Ok(SummaryResult::failed(
                -1,
                "context canceled",
                String::new(),
                start,
            ));
        }

        let payload = encode_input(aggregated)?;
        info!(
            "[summarizer] grouping {} finding(s) with {}",
            aggregated.len(),
            self.agent.name()
        );
        let output = run_summary(
            self.agent.as_ref(),
            GROUP_PROMPT,
            &payload,
            cancel,
            self.timeout,
        )
        .await?;

        match output.status {
            CallStatus::Cancelled => {
                return Ok(SummaryResult::failed(
                    -1,
                    "context canceled",
                    output.stdout,
                    start,
                ));
            }
            CallStatus::TimedOut => {
                let secs = self.timeout.map_or(0.0, |t| t.as_secs_f64());
                return Ok(SummaryResult::failed(
                    -1,
                    format!("summarizer timed out after {secs:.1}s"),
                    output.stdout,
                    start,
                ));
            }
            CallStatus::Completed => {}
        }

        if output.stdout.trim().is_empty() {
            if output.exit_code == 0 {
                return Ok(SummaryResult::failed(
                    1,
                    "summarizer produced no output",
                    output.stdout,
                    start,
                ));
            }
            return Ok(SummaryResult::failed(
                output.exit_code,
                output.stderr,
                output.stdout,
                start,
            ));
        }

        match parse_summary_json::<GroupedFindings>(self.agent.name(), &output.stdout) {
            Ok(grouped) => {
                let duration = start.elapsed();
                info!(
                    "[summarizer] {} group(s), {} info item(s) in {:.1}s",
                    grouped.findings.len(),
                    grouped.info.len(),
                    duration.as_secs_f64()
                );
                if output.exit_code != 0 {
                    warn!(
                        "[summarizer] agent exited with code {} after printing a grouping",
                        output.exit_code
                    );
                }
                Ok(SummaryResult {
                    grouped,
                    exit_code: output.exit_code,
                    stderr: output.stderr,
                    raw_output: output.stdout,
                    duration,
                    grouping_failed: false,
                })
            }
            Err(e) => {
                warn!("[summarizer] {e}");
                Ok(SummaryResult::failed(
                    1,
                    "failed to parse summarizer JSON output",
                    output.stdout,
                    start,
                ))
            }
        }
    }
}
