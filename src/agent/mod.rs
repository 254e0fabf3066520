pub mod auth;
pub mod claude;
pub mod codex;
pub mod gemini;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::process::{self, ExecutionHandle, SpawnConfig};
use crate::prompts::{self, DiffSource};

pub use claude::ClaudeAgent;
pub use codex::CodexAgent;
pub use gemini::GeminiAgent;

/// Diffs larger than this are handed to agents through a file instead of stdin.
pub const REF_FILE_SIZE_THRESHOLD: usize = 100 * 1024;

/// Backends this crate knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentKind {
    Codex,
    Claude,
    Gemini,
}

impl AgentKind {
    pub const ALL: [AgentKind; 3] = [AgentKind::Codex, AgentKind::Claude, AgentKind::Gemini];

    pub fn name(self) -> &'static str {
        match self {
            AgentKind::Codex => "codex",
            AgentKind::Claude => "claude",
            AgentKind::Gemini => "gemini",
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AgentKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "codex" => Ok(AgentKind::Codex),
            "claude" => Ok(AgentKind::Claude),
            "gemini" => Ok(AgentKind::Gemini),
            other => Err(Error::UnknownAgent(other.to_string())),
        }
    }
}

/// Everything a reviewer needs to start one review.
#[derive(Debug, Clone)]
pub struct ReviewConfig {
    pub base_ref: String,
    pub timeout: Duration,
    pub work_dir: PathBuf,
    pub reviewer_id: usize,
    pub guidance: Option<String>,
    /// Computed once per run and shared by every reviewer.
    pub diff: Option<Arc<str>>,
    pub use_ref_file: bool,
}

impl ReviewConfig {
    pub fn has_guidance(&self) -> bool {
        self.guidance
            .as_deref()
            .is_some_and(|g| !g.trim().is_empty())
    }

    /// Whether the diff goes through a temp file rather than the prompt.
    pub fn needs_ref_file(&self) -> bool {
        self.use_ref_file
            || self
                .diff
                .as_deref()
                .is_some_and(|d| d.len() > REF_FILE_SIZE_THRESHOLD)
    }
}

/// Uniform contract over review backends.
///
/// Spawning is synchronous; the returned handle streams stdout and owns the
/// child until closed.
pub trait Agent: Send + Sync {
    /// Stable identifier used for parser dispatch and auth hints.
    fn name(&self) -> &'static str;

    /// Best-effort check that the backend binary can be found.
    fn is_available(&self) -> Result<()>;

    fn execute_review(
        &self,
        config: &ReviewConfig,
        cancel: CancellationToken,
    ) -> Result<ExecutionHandle>;

    fn execute_summary(
        &self,
        prompt: &str,
        payload: &[u8],
        cancel: CancellationToken,
    ) -> Result<ExecutionHandle>;
}

/// Construct the backend named `name` using its default binary.
pub fn new_agent(name: &str) -> Result<Arc<dyn Agent>> {
    let kind = name.parse::<AgentKind>()?;
    Ok(agent_for_kind(kind, None))
}

/// Construct a backend, optionally overriding the binary path.
pub fn agent_for_kind(kind: AgentKind, binary: Option<String>) -> Arc<dyn Agent> {
    match kind {
        AgentKind::Codex => Arc::new(CodexAgent::new(binary)),
        AgentKind::Claude => Arc::new(ClaudeAgent::new(binary)),
        AgentKind::Gemini => Arc::new(GeminiAgent::new(binary)),
    }
}

/// Construct one agent per name, failing on the first unknown name.
pub fn create_agents(names: &[String]) -> Result<Vec<Arc<dyn Agent>>> {
    names.iter().map(|n| new_agent(n)).collect()
}

/// Split a comma-separated agent list, trimming entries and dropping blanks.
pub fn parse_agent_names(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Round-robin: reviewer `k` gets agent `(k - 1) mod len`.
pub fn agent_for_reviewer(
    agents: &[Arc<dyn Agent>],
    reviewer_id: usize,
) -> Option<&Arc<dyn Agent>> {
    if agents.is_empty() || reviewer_id == 0 {
        return None;
    }
    agents.get((reviewer_id - 1) % agents.len())
}

/// Describe how reviewers spread over agents, e.g. `2×codex, 1×claude`.
pub fn format_distribution(agents: &[Arc<dyn Agent>], reviewers: usize) -> String {
    let mut counts: Vec<(&'static str, usize)> = Vec::new();
    for id in 1..=reviewers {
        let Some(agent) = agent_for_reviewer(agents, id) else {
            continue;
        };
        match counts.iter_mut().find(|(name, _)| *name == agent.name()) {
            Some((_, n)) => *n += 1,
            None => counts.push((agent.name(), 1)),
        }
    }
    counts
        .iter()
        .map(|(name, n)| format!("{n}×{name}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Stdin for summary-style calls: the instructions, then the payload.
pub fn summary_stdin(prompt: &str, payload: &[u8]) -> Vec<u8> {
    let mut input = Vec::with_capacity(prompt.len() + payload.len() + 16);
    input.extend_from_slice(prompt.as_bytes());
    input.extend_from_slice(b"\n\nINPUT JSON:\n");
    input.extend_from_slice(payload);
    input.push(b'\n');
    input
}

/// How a summary-style call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Completed,
    Cancelled,
    TimedOut,
}

/// Everything a summary-style call produced.
#[derive(Debug, Clone)]
pub struct SummaryOutput {
    pub stdout: String,
    pub exit_code: i32,
    pub stderr: String,
    pub status: CallStatus,
}

/// Run `agent` in summary mode and collect its whole stdout.
///
/// Cancellation of `cancel` or expiry of `timeout` kills the process group
/// and reaps the child before returning. Only a failure to spawn is an error.
pub async fn run_summary(
    agent: &dyn Agent,
    prompt: &str,
    payload: &[u8],
    cancel: &CancellationToken,
    timeout: Option<Duration>,
) -> Result<SummaryOutput> {
    let call_cancel = cancel.child_token();
    let mut handle = agent.execute_summary(prompt, payload, call_cancel.clone())?;
    let mut buf = Vec::new();

    let status = match handle.take_stdout() {
        Some(mut stdout) => {
            let expiry = async {
                match timeout {
                    Some(limit) => tokio::time::sleep(limit).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                read = stdout.read_to_end(&mut buf) => {
                    if let Err(e) = read {
                        warn!("[{}] reading summary output failed: {e}", agent.name());
                    }
                    CallStatus::Completed
                }
                _ = cancel.cancelled() => CallStatus::Cancelled,
                _ = expiry => CallStatus::TimedOut,
            }
        }
        None => CallStatus::Completed,
    };

    if status != CallStatus::Completed {
        call_cancel.cancel();
    }
    let exit = handle.close().await;

    Ok(SummaryOutput {
        stdout: String::from_utf8_lossy(&buf).into_owned(),
        exit_code: exit.exit_code,
        stderr: exit.stderr.clone(),
        status,
    })
}

pub(crate) fn binary_available(binary: &str) -> Result<()> {
    which::which(binary)
        .map(|path| debug!("found {binary} at {}", path.display()))
        .map_err(|e| Error::Agent(format!("{binary} not found on PATH: {e}")))
}

/// Write the diff to `<work_dir>/.acr-diff-<uuid>.patch`.
pub(crate) fn write_ref_file(work_dir: &Path, diff: &str) -> Result<PathBuf> {
    let path = work_dir.join(format!(".acr-diff-{}.patch", uuid::Uuid::new_v4()));
    std::fs::write(&path, diff)?;
    match std::path::absolute(&path) {
        Ok(abs) => Ok(abs),
        Err(e) => {
            let _ = std::fs::remove_file(&path);
            Err(Error::Io(e))
        }
    }
}

/// Render the review prompt, writing a ref file when the diff calls for one.
/// Returns the prompt and any temp file the execution must clean up.
pub(crate) fn prepare_review_prompt(config: &ReviewConfig) -> Result<(String, Option<PathBuf>)> {
    let diff = config.diff.as_deref().unwrap_or_default();
    let guidance = config.guidance.as_deref();

    if config.needs_ref_file() {
        let path = write_ref_file(&config.work_dir, diff)?;
        let rendered =
            prompts::render_review_prompt(&config.base_ref, guidance, DiffSource::RefFile(&path));
        return match rendered {
            Ok(prompt) => Ok((prompt, Some(path))),
            Err(e) => {
                let _ = std::fs::remove_file(&path);
                Err(e)
            }
        };
    }

    let prompt =
        prompts::render_review_prompt(&config.base_ref, guidance, DiffSource::Inline(diff))?;
    Ok((prompt, None))
}

/// Spawn `binary args...` for a reviewer, feeding `stdin` if given.
pub(crate) fn spawn_review(
    binary: &str,
    args: Vec<String>,
    config: &ReviewConfig,
    stdin: Option<String>,
    temp_file: Option<PathBuf>,
    cancel: CancellationToken,
) -> Result<ExecutionHandle> {
    process::spawn(
        SpawnConfig {
            command: binary.to_string(),
            args,
            working_dir: Some(config.work_dir.clone()),
            stdin: stdin.map(String::into_bytes),
            env: vec![],
            temp_files: temp_file.into_iter().collect(),
            log_prefix: format!("reviewer #{}", config.reviewer_id),
        },
        cancel,
    )
}

pub(crate) fn spawn_summary(
    binary: &str,
    args: Vec<String>,
    prompt: &str,
    payload: &[u8],
    cancel: CancellationToken,
) -> Result<ExecutionHandle> {
    process::spawn(
        SpawnConfig {
            command: binary.to_string(),
            args,
            working_dir: None,
            stdin: Some(summary_stdin(prompt, payload)),
            env: vec![],
            temp_files: vec![],
            log_prefix: format!("summary:{binary}"),
        },
        cancel,
    )
}
