use std::collections::HashSet;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::{Agent, create_agents, format_distribution, new_agent};
use crate::config::Config;
use crate::domain::{
    AggregatedFinding, Disposition, FindingGroup, GroupedFindings, aggregate_findings,
    build_dispositions, collect_findings,
};
use crate::error::{Error, Result};
use crate::feedback::{DefaultGhClient, FeedbackSummarizer, GhClient};
use crate::fpcache::{ExcludeFilter, FpCache, apply_ignore_filter};
use crate::fpfilter::FpFilter;
use crate::git;
use crate::report::{
    annotate_reviewer_comments, render_comment_markdown, render_dismissed_markdown,
    render_lgtm_markdown, render_report,
};
use crate::runner::{ProgressReporter, Runner, RunnerConfig, SilentProgress};
use crate::stats::{ReviewStats, build_stats};
use crate::summarizer::{SummaryResult, Summarizer};
use crate::terminal::DEFAULT_WIDTH;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Process exit status of a review run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    NoFindings,
    Findings,
    Error,
    Interrupted,
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        match self {
            ExitStatus::NoFindings => 0,
            ExitStatus::Findings => 1,
            ExitStatus::Error => 2,
            ExitStatus::Interrupted => 130,
        }
    }
}

/// Everything a finished run produced.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: ExitStatus,
    pub report: String,
    pub markdown: Option<String>,
    pub stats: ReviewStats,
    pub aggregated: Vec<AggregatedFinding>,
    pub grouped: GroupedFindings,
    pub dispositions: Vec<Disposition>,
    pub feedback: String,
}

/// Wires reviewers, grouping, filtering and rendering for one run.
pub struct Pipeline {
    config: Config,
    repo_root: PathBuf,
    reviewer_agents: Vec<Arc<dyn Agent>>,
    summarizer_agent: Arc<dyn Agent>,
    gh_client: Arc<dyn GhClient>,
    progress: Arc<dyn ProgressReporter>,
    diff: Option<String>,
    backoff_base: Duration,
    width: usize,
}

impl Pipeline {
    pub fn new(config: Config, repo_root: PathBuf) -> Result<Self> {
        let reviewer_agents = create_agents(&config.reviewer_agents)?;
        let summarizer_agent = new_agent(&config.summarizer_agent)?;
        Ok(Self {
            config,
            repo_root,
            reviewer_agents,
            summarizer_agent,
            gh_client: Arc::new(DefaultGhClient),
            progress: Arc::new(SilentProgress),
            diff: None,
            backoff_base: Duration::from_secs(1),
            width: DEFAULT_WIDTH,
        })
    }

    /// Replace the backends built from the config, e.g. with mock binaries.
    pub fn with_agents(
        mut self,
        reviewers: Vec<Arc<dyn Agent>>,
        summarizer: Arc<dyn Agent>,
    ) -> Self {
        self.reviewer_agents = reviewers;
        self.summarizer_agent = summarizer;
        self
    }

    pub fn with_gh_client(mut self, client: Arc<dyn GhClient>) -> Self {
        self.gh_client = client;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Use `diff` instead of asking git.
    pub fn with_diff(mut self, diff: impl Into<String>) -> Self {
        self.diff = Some(diff.into());
        self
    }

    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    pub fn with_width(mut self, width: usize) -> Self {
        self.width = width;
        self
    }

    /// Codex can diff by itself when nothing else needs to go in the prompt.
    fn needs_diff(&self) -> bool {
        self.config.guidance.is_some()
            || self.config.use_ref_file
            || self.reviewer_agents.iter().any(|a| a.name() != "codex")
    }

    fn resolve_diff(&self) -> Result<Option<Arc<str>>> {
        if let Some(ref diff) = self.diff {
            return Ok(Some(Arc::from(diff.as_str())));
        }
        if !self.needs_diff() {
            return Ok(None);
        }
        let diff = git::diff_against(&self.repo_root, &self.config.base)?;
        Ok(Some(Arc::from(diff)))
    }

    fn check_availability(&self) {
        let mut seen = HashSet::new();
        for agent in self.reviewer_agents.iter().chain([&self.summarizer_agent]) {
            if seen.insert(agent.name())
                && let Err(e) = agent.is_available()
            {
                warn!("{e}");
            }
        }
    }

    async fn fetch_feedback(&self, cancel: &CancellationToken) -> String {
        let Some(ref pr) = self.config.pr else {
            return String::new();
        };
        if !self.config.pr_feedback_enabled || !self.config.fp_filter_enabled {
            return String::new();
        }
        let summarizer = FeedbackSummarizer::with_client(
            Arc::clone(&self.summarizer_agent),
            Arc::clone(&self.gh_client),
            Some(self.config.summarizer_timeout),
        );
        summarizer.summarize(pr, cancel).await
    }

    pub async fn run(&self, cancel: &CancellationToken) -> Result<RunOutcome> {
        let diff = self.resolve_diff()?;
        if diff.as_deref().is_some_and(|d| d.trim().is_empty()) {
            info!("no changes against {}", self.config.base);
            return Ok(self.finish_empty(format!(
                "No changes to review against {}.",
                self.config.base
            )));
        }
        self.check_availability();

        info!(
            "reviewing against {} with {} reviewer(s): {}",
            self.config.base,
            self.config.reviewers,
            format_distribution(&self.reviewer_agents, self.config.reviewers)
        );

        let runner = Runner::new(
            RunnerConfig {
                reviewers: self.config.reviewers,
                concurrency: self.config.concurrency,
                base_ref: self.config.base.clone(),
                work_dir: self.repo_root.clone(),
                timeout: self.config.timeout,
                retries: self.config.retries,
                verbose: self.config.verbose,
                guidance: self.config.guidance.clone(),
                use_ref_file: self.config.use_ref_file,
                diff,
                backoff_base: self.backoff_base,
            },
            self.reviewer_agents.clone(),
            Arc::clone(&self.progress),
        );

        let (run, feedback) = tokio::join!(runner.run(cancel), self.fetch_feedback(cancel));
        if let Some(e) = run.interrupted {
            return Err(e);
        }

        let mut stats = build_stats(&run.results, self.config.reviewers, run.wall_clock);
        let aggregated = aggregate_findings(&collect_findings(&run.results));

        if stats.all_failed() {
            warn!("all {} reviewer(s) failed", stats.total_reviewers);
            let report = render_report(
                &GroupedFindings::default(),
                &SummaryResult::default(),
                &stats,
                self.width,
            );
            return Ok(RunOutcome {
                status: ExitStatus::Error,
                report,
                markdown: None,
                stats,
                aggregated,
                grouped: GroupedFindings::default(),
                dispositions: Vec::new(),
                feedback,
            });
        }

        let summarizer = Summarizer::new(
            Arc::clone(&self.summarizer_agent),
            Some(self.config.summarizer_timeout),
        );
        let summary = summarizer.summarize(&aggregated, cancel).await?;
        if cancel.is_cancelled() {
            return Err(Error::Interrupted);
        }
        stats.summarizer_duration = summary.duration;

        if summary.grouping_failed {
            let report = render_report(&summary.grouped, &summary, &stats, self.width);
            return Ok(RunOutcome {
                status: ExitStatus::Error,
                report,
                markdown: None,
                stats,
                aggregated,
                grouped: GroupedFindings::default(),
                dispositions: Vec::new(),
                feedback,
            });
        }

        let (filtered, ignored) = self.apply_static_filters(&summary.grouped)?;
        stats.ignored_count = ignored.len();

        let (grouped, fp_removed) = if self.config.fp_filter_enabled && filtered.has_findings() {
            let fp_filter = FpFilter::new(
                Arc::clone(&self.summarizer_agent),
                self.config.fp_threshold,
                Some(self.config.fp_filter_timeout),
            );
            let result = fp_filter.apply(&filtered, &feedback, cancel).await;
            if cancel.is_cancelled() {
                return Err(Error::Interrupted);
            }
            if let Some(ref reason) = result.skipped {
                warn!("[fp-filter] skipped: {reason}");
            }
            if result.eval_errors > 0 {
                warn!("[fp-filter] {} finding(s) were not scored", result.eval_errors);
            }
            stats.fp_filter_duration = result.duration;
            stats.fp_filtered_count = result.removed.len();
            (result.grouped, result.removed)
        } else {
            (filtered, Vec::new())
        };

        let dispositions = build_dispositions(
            aggregated.len(),
            &summary.grouped.info,
            &fp_removed,
            &ignored,
            &grouped.findings,
        );

        let cache = FpCache::new(FpCache::default_dir(&self.repo_root));
        if let Err(e) = cache.save_last_run(&grouped) {
            warn!("failed to save last run: {e}");
        }

        let report = render_report(&grouped, &summary, &stats, self.width);
        let markdown = self.config.markdown.then(|| {
            if grouped.has_findings() {
                render_comment_markdown(&grouped, stats.total_reviewers, &aggregated, VERSION)
            } else {
                render_lgtm_markdown(
                    stats.total_reviewers,
                    stats.successful.len(),
                    &annotate_reviewer_comments(&aggregated, &dispositions),
                    VERSION,
                )
            }
        });

        let status = if grouped.has_findings() {
            ExitStatus::Findings
        } else {
            ExitStatus::NoFindings
        };
        Ok(RunOutcome {
            status,
            report,
            markdown,
            stats,
            aggregated,
            grouped,
            dispositions,
            feedback,
        })
    }

    /// Ignore-file patterns (titles) then configured exclude regexes
    /// (evidence). Returns the kept grouping and every removed group.
    fn apply_static_filters(
        &self,
        grouped: &GroupedFindings,
    ) -> Result<(GroupedFindings, Vec<FindingGroup>)> {
        let cache = FpCache::new(FpCache::default_dir(&self.repo_root));
        let patterns = cache.load_ignore().unwrap_or_else(|e| {
            warn!("failed to load ignore file: {e}");
            Vec::new()
        });
        let (after_ignore, mut removed) = apply_ignore_filter(grouped, &patterns);

        let exclude = ExcludeFilter::new(&self.config.exclude_patterns)?;
        let (kept, excluded) = exclude.apply(&after_ignore);
        removed.extend(excluded);
        Ok((kept, removed))
    }

    fn finish_empty(&self, report: String) -> RunOutcome {
        RunOutcome {
            status: ExitStatus::NoFindings,
            report,
            markdown: None,
            stats: ReviewStats {
                total_reviewers: self.config.reviewers,
                ..Default::default()
            },
            aggregated: Vec::new(),
            grouped: GroupedFindings::default(),
            dispositions: Vec::new(),
            feedback: String::new(),
        }
    }
}

/// `mark-fp`: with no indices, list the last run; otherwise add the chosen
/// titles to the ignore file. Returns the text to print.
pub fn mark_false_positives(cache: &FpCache, indices: &[usize]) -> Result<String> {
    let last = cache.load_last_run()?;
    let mut out = String::new();

    if indices.is_empty() {
        if last.findings.is_empty() {
            out.push_str("No findings in the last run.\n");
        }
        for (i, f) in last.findings.iter().enumerate() {
            let _ = writeln!(out, "{}. {}", i + 1, f.title);
        }
        return Ok(out);
    }

    let titles = last.titles_at(indices)?;
    let added = cache.add_ignore_patterns(&titles)?;
    if added.is_empty() {
        out.push_str("All selected findings are already ignored.\n");
    }
    for title in &added {
        let _ = writeln!(out, "Ignoring: {title}");
    }
    Ok(out)
}

/// `dismiss`: approval markdown naming every finding of the last run.
pub fn dismiss_last_run(cache: &FpCache) -> Result<String> {
    let last = cache.load_last_run()?;
    let titles: Vec<String> = last.findings.into_iter().map(|f| f.title).collect();
    Ok(render_dismissed_markdown(&titles, VERSION))
}
