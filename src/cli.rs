use clap::{Parser, Subcommand};

/// acr: run several AI code reviewers against a change and merge what they find
#[derive(Parser, Debug, Clone)]
#[command(name = "acr", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<CliCommand>,

    /// Number of reviewer tasks to launch
    #[arg(short, long, global = true)]
    pub reviewers: Option<usize>,

    /// Maximum reviewers running at once (default: number of reviewers)
    #[arg(short, long, global = true)]
    pub concurrency: Option<usize>,

    /// Base ref to diff against
    #[arg(short, long, global = true)]
    pub base: Option<String>,

    /// Per-reviewer timeout in seconds
    #[arg(short, long, global = true)]
    pub timeout: Option<u64>,

    /// Retries per failed reviewer
    #[arg(long, global = true)]
    pub retries: Option<u32>,

    /// Comma-separated reviewer agents, assigned round-robin (codex, claude, gemini)
    #[arg(short, long, value_delimiter = ',', global = true)]
    pub agents: Option<Vec<String>>,

    /// Agent used for grouping, feedback and false-positive scoring
    #[arg(long, global = true)]
    pub summarizer_agent: Option<String>,

    /// Extra instructions appended to the review prompt
    #[arg(long, conflicts_with = "guidance_file", global = true)]
    pub guidance: Option<String>,

    /// File whose contents are used as review guidance
    #[arg(long, global = true)]
    pub guidance_file: Option<String>,

    /// Hand the diff to reviewers through a temporary file instead of the prompt
    #[arg(long, global = true)]
    pub ref_file: bool,

    /// Skip LLM false-positive scoring
    #[arg(long, global = true)]
    pub no_fp_filter: bool,

    /// Score (1-100) at or above which a finding counts as a false positive
    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=100), global = true)]
    pub fp_threshold: Option<u8>,

    /// Pull request number whose prior discussion informs false-positive scoring
    #[arg(long, global = true)]
    pub pr: Option<String>,

    /// Do not fetch prior PR feedback
    #[arg(long, global = true)]
    pub no_pr_feedback: bool,

    /// Also print the report as PR-comment markdown
    #[arg(long, global = true)]
    pub markdown: bool,

    /// Debug logging, including recoverable parse errors
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config file (default: .acr.toml at the repository root)
    #[arg(long, global = true)]
    pub config: Option<String>,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommand {
    /// Review the current branch (the default)
    Review,

    /// Add findings from the last run to the ignore list; lists them when no index is given
    MarkFp {
        /// 1-based finding numbers as shown by the last run
        indices: Vec<usize>,
    },

    /// Print an approval comment dismissing every finding of the last run
    Dismiss,
}
