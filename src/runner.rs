use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{Semaphore, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::auth::{auth_hint, is_auth_failure};
use crate::agent::{Agent, ReviewConfig, agent_for_reviewer};
use crate::domain::ReviewerResult;
use crate::error::Error;
use crate::parser::ReviewParser;

/// Upper bound on a single backoff sleep, before jitter.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// How long an interrupted run waits for reviewers to be killed and reaped.
const CANCEL_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub reviewers: usize,
    /// Zero means "as many as there are reviewers".
    pub concurrency: usize,
    pub base_ref: String,
    pub work_dir: PathBuf,
    pub timeout: Duration,
    pub retries: u32,
    pub verbose: bool,
    pub guidance: Option<String>,
    pub use_ref_file: bool,
    pub diff: Option<Arc<str>>,
    /// First retry waits this long; each later retry doubles it.
    pub backoff_base: Duration,
}

impl RunnerConfig {
    pub fn effective_concurrency(&self) -> usize {
        if self.concurrency == 0 {
            self.reviewers.max(1)
        } else {
            self.concurrency
        }
    }
}

/// Receives progress as reviewers finish. Called from reviewer tasks.
pub trait ProgressReporter: Send + Sync {
    fn started(&self, total: usize);
    fn reviewer_finished(&self, result: &ReviewerResult, completed: usize, total: usize);
    fn finish(&self);
}

/// Reporter that ignores every event.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn started(&self, _total: usize) {}
    fn reviewer_finished(&self, _result: &ReviewerResult, _completed: usize, _total: usize) {}
    fn finish(&self) {}
}

/// What a run produced. `interrupted` is set when the outer token was
/// cancelled before every reviewer reported; `results` then holds what the
/// reviewers returned while stopping, sentinels included.
#[derive(Debug)]
pub struct RunOutput {
    pub results: Vec<ReviewerResult>,
    pub wall_clock: Duration,
    pub interrupted: Option<Error>,
}

/// Launches reviewers with bounded parallelism.
pub struct Runner {
    config: Arc<RunnerConfig>,
    agents: Arc<[Arc<dyn Agent>]>,
    reporter: Arc<dyn ProgressReporter>,
}

impl Runner {
    pub fn new(
        config: RunnerConfig,
        agents: Vec<Arc<dyn Agent>>,
        reporter: Arc<dyn ProgressReporter>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            agents: agents.into(),
            reporter,
        }
    }

    /// Run every reviewer.
    ///
    /// Results are sorted by reviewer ID rather than kept in arrival order.
    /// On cancellation every running reviewer kills its process group; the
    /// run waits (up to [`CANCEL_DRAIN_TIMEOUT`]) until each child has been
    /// reaped before returning the results gathered so far.
    pub async fn run(&self, cancel: &CancellationToken) -> RunOutput {
        let start = Instant::now();
        let total = self.config.reviewers;
        let semaphore = Arc::new(Semaphore::new(self.config.effective_concurrency()));
        let completed = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::channel(total.max(1));

        self.reporter.started(total);

        for reviewer_id in 1..=total {
            let task = ReviewerTask {
                config: Arc::clone(&self.config),
                agents: Arc::clone(&self.agents),
                cancel: cancel.clone(),
            };
            let semaphore = Arc::clone(&semaphore);
            let completed = Arc::clone(&completed);
            let reporter = Arc::clone(&self.reporter);
            let tx = tx.clone();

            tokio::spawn(async move {
                let result = tokio::select! {
                    biased;
                    _ = task.cancel.cancelled() => task.sentinel(reviewer_id),
                    permit = semaphore.acquire_owned() => match permit {
                        Ok(permit) => {
                            let result = task.run_with_retry(reviewer_id).await;
                            drop(permit);
                            result
                        }
                        Err(_) => task.sentinel(reviewer_id),
                    },
                };
                let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                reporter.reviewer_finished(&result, done, total);
                let _ = tx.send(result).await;
            });
        }
        drop(tx);

        let mut results: Vec<ReviewerResult> = Vec::with_capacity(total);
        let mut drain_deadline: Option<Instant> = None;
        loop {
            let deadline = drain_deadline;
            let drain_expired = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled(), if drain_deadline.is_none() => {
                    info!(
                        "interrupted, waiting for {} reviewer(s) to stop",
                        total.saturating_sub(results.len())
                    );
                    drain_deadline = Some(Instant::now() + CANCEL_DRAIN_TIMEOUT);
                }
                _ = drain_expired => {
                    warn!(
                        "{} reviewer(s) still running {:.0}s after interrupt",
                        total.saturating_sub(results.len()),
                        CANCEL_DRAIN_TIMEOUT.as_secs_f64()
                    );
                    break;
                }
                msg = rx.recv() => match msg {
                    Some(result) => results.push(result),
                    None => break,
                },
            }
        }

        self.reporter.finish();
        results.sort_by_key(|r| r.reviewer_id);
        RunOutput {
            results,
            wall_clock: start.elapsed(),
            interrupted: drain_deadline.map(|_| Error::Interrupted),
        }
    }
}

/// Delay before retry number `attempt + 1`: `base * 2^attempt`, capped, plus
/// up to half that again in jitter.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt);
    let delay = base.saturating_mul(factor).min(MAX_BACKOFF);
    let jitter = delay.mul_f64(0.5 * rand::random::<f64>());
    delay + jitter
}

struct ReviewerTask {
    config: Arc<RunnerConfig>,
    agents: Arc<[Arc<dyn Agent>]>,
    cancel: CancellationToken,
}

impl ReviewerTask {
    fn agent_name(&self, reviewer_id: usize) -> &'static str {
        agent_for_reviewer(&self.agents, reviewer_id).map_or("unknown", |a| a.name())
    }

    fn sentinel(&self, reviewer_id: usize) -> ReviewerResult {
        ReviewerResult::sentinel(reviewer_id, self.agent_name(reviewer_id))
    }

    async fn run_with_retry(&self, reviewer_id: usize) -> ReviewerResult {
        let mut last: Option<ReviewerResult> = None;

        for attempt in 0..=self.config.retries {
            if self.cancel.is_cancelled() {
                return last.unwrap_or_else(|| self.sentinel(reviewer_id));
            }

            let result = self.run_reviewer(reviewer_id).await;
            if result.exit_code == 0 {
                return result;
            }
            if result.auth_failed {
                warn!(
                    "[reviewer #{reviewer_id}] {} authentication failed: {}",
                    result.agent_name,
                    auth_hint(&result.agent_name)
                );
                return result;
            }
            if attempt == self.config.retries {
                return result;
            }

            let delay = backoff_delay(self.config.backoff_base, attempt);
            info!(
                "[reviewer #{reviewer_id}] attempt {} failed (exit {}), retrying in {:.1}s",
                attempt + 1,
                result.exit_code,
                delay.as_secs_f64()
            );
            tokio::select! {
                _ = self.cancel.cancelled() => return result,
                _ = tokio::time::sleep(delay) => {}
            }
            last = Some(result);
        }

        last.unwrap_or_else(|| self.sentinel(reviewer_id))
    }

    async fn run_reviewer(&self, reviewer_id: usize) -> ReviewerResult {
        let start = Instant::now();
        let deadline = start + self.config.timeout;

        let Some(agent) = agent_for_reviewer(&self.agents, reviewer_id) else {
            warn!("[reviewer #{reviewer_id}] no agent configured");
            return self.sentinel(reviewer_id);
        };
        let mut result = ReviewerResult::new(reviewer_id, agent.name());
        let task_cancel = self.cancel.child_token();

        let review_config = ReviewConfig {
            base_ref: self.config.base_ref.clone(),
            timeout: self.config.timeout,
            work_dir: self.config.work_dir.clone(),
            reviewer_id,
            guidance: self.config.guidance.clone(),
            diff: self.config.diff.clone(),
            use_ref_file: self.config.use_ref_file,
        };

        let mut handle = match agent.execute_review(&review_config, task_cancel.clone()) {
            Ok(handle) => handle,
            Err(e) => {
                warn!("[reviewer #{reviewer_id}] failed to start {}: {e}", agent.name());
                result.exit_code = -1;
                result.stderr = e.to_string();
                result.duration = start.elapsed();
                return result;
            }
        };

        let mut parser = match ReviewParser::new(agent.name(), reviewer_id) {
            Ok(parser) => parser,
            Err(e) => {
                warn!("[reviewer #{reviewer_id}] {e}");
                task_cancel.cancel();
                handle.close().await;
                result.exit_code = -1;
                result.duration = start.elapsed();
                return result;
            }
        };

        let mut timed_out = false;
        if let Some(mut scanner) = handle.scanner() {
            loop {
                if Instant::now() >= deadline {
                    timed_out = true;
                    break;
                }
                match tokio::time::timeout_at(deadline, parser.read_finding(&mut scanner)).await {
                    Err(_) => {
                        timed_out = true;
                        break;
                    }
                    Ok(Ok(Some(finding))) => result.findings.push(finding),
                    Ok(Ok(None)) => break,
                    Ok(Err(e)) if e.is_recoverable() => {
                        if self.config.verbose {
                            warn!("[reviewer #{reviewer_id}] skipping malformed output: {e}");
                        } else {
                            debug!("[reviewer #{reviewer_id}] skipping malformed output: {e}");
                        }
                    }
                    Ok(Err(e)) => {
                        warn!("[reviewer #{reviewer_id}] {e}");
                        result.parse_errors += 1;
                        break;
                    }
                }
            }
        }
        result.parse_errors += parser.parse_errors();
        result.skills_used = parser.skills_used().to_vec();

        if timed_out {
            task_cancel.cancel();
        }
        let exit = match tokio::time::timeout_at(deadline, handle.close()).await {
            Ok(exit) => exit,
            Err(_) => {
                timed_out = true;
                task_cancel.cancel();
                handle.close().await
            }
        };
        result.exit_code = exit.exit_code;
        result.stderr = exit.stderr.clone();

        if result.exit_code != 0 {
            result.auth_failed = is_auth_failure(agent.name(), result.exit_code, &result.stderr);
        }
        result.duration = start.elapsed();

        if timed_out || Instant::now() >= deadline {
            warn!(
                "[reviewer #{reviewer_id}] timed out after {:.1}s",
                self.config.timeout.as_secs_f64()
            );
            result.timed_out = true;
            result.auth_failed = false;
            result.exit_code = -1;
        } else {
            info!(
                "[reviewer #{reviewer_id}] {} finished in {:.1}s: {} finding(s), exit {}",
                agent.name(),
                result.duration.as_secs_f64(),
                result.findings.len(),
                result.exit_code
            );
        }

        result
    }
}
