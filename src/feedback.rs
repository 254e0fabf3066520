use std::collections::HashMap;
use std::fmt::Write as _;
use std::process::Command;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::{Agent, CallStatus, run_summary};
use crate::error::{Error, Result};
use crate::parser::{extract_summary_text, strip_markdown_fences};
use crate::prompts::FEEDBACK_PROMPT;

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 500;
const NO_FEEDBACK_SENTINEL: &str = "no prior feedback";

/// Abstraction over `gh` CLI calls for testability.
pub trait GhClient: Send + Sync {
    fn run(&self, args: &[&str]) -> Result<String>;
}

pub struct DefaultGhClient;

impl GhClient for DefaultGhClient {
    fn run(&self, args: &[&str]) -> Result<String> {
        retry_with_backoff(|| {
            let output = Command::new("gh")
                .args(args)
                .output()
                .map_err(|e| Error::Gh(format!("failed to run gh: {e}")))?;

            if output.status.success() {
                String::from_utf8(output.stdout)
                    .map_err(|e| Error::Gh(format!("invalid utf8 from gh: {e}")))
            } else {
                let stderr = String::from_utf8_lossy(&output.stderr);
                Err(Error::Gh(format!("gh failed: {}", stderr.trim())))
            }
        })
    }
}

/// Description and discussion of one pull request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PrContext {
    pub number: String,
    pub description: String,
    pub comments: Vec<Comment>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Comment {
    pub author: String,
    pub body: String,
    pub replies: Vec<Reply>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reply {
    pub author: String,
    pub body: String,
}

impl PrContext {
    pub fn has_content(&self) -> bool {
        !self.description.is_empty() || !self.comments.is_empty()
    }
}

#[derive(Deserialize)]
struct GhPrView {
    #[serde(default)]
    body: Option<String>,
}

#[derive(Deserialize, Default)]
struct GhUser {
    #[serde(default)]
    login: String,
}

#[derive(Deserialize)]
struct GhComment {
    id: u64,
    #[serde(default)]
    in_reply_to_id: Option<u64>,
    #[serde(default)]
    user: Option<GhUser>,
    #[serde(default)]
    body: Option<String>,
}

impl GhComment {
    fn author(&self) -> String {
        self.user
            .as_ref()
            .map(|u| u.login.clone())
            .filter(|l| !l.is_empty())
            .unwrap_or_else(|| "unknown".to_string())
    }

    fn body(&self) -> &str {
        self.body.as_deref().map_or("", str::trim)
    }
}

/// Fetch the description plus review and issue comments of PR `number`.
pub fn fetch_pr_context(client: &dyn GhClient, number: &str) -> Result<PrContext> {
    let number = number.trim();
    if number.is_empty() {
        return Err(Error::Gh("PR number is required".to_string()));
    }

    let view = client.run(&["pr", "view", number, "--json", "body"])?;
    let view: GhPrView = serde_json::from_str(&view)?;

    let review_endpoint = format!("repos/{{owner}}/{{repo}}/pulls/{number}/comments");
    let review = client.run(&["api", "--paginate", &review_endpoint])?;
    let issue_endpoint = format!("repos/{{owner}}/{{repo}}/issues/{number}/comments");
    let issue = client.run(&["api", "--paginate", &issue_endpoint])?;

    let mut comments = thread_review_comments(parse_paginated(&review)?);
    comments.extend(
        parse_paginated::<GhComment>(&issue)?
            .into_iter()
            .filter(|c| !c.body().is_empty())
            .map(|c| Comment {
                author: c.author(),
                body: c.body().to_string(),
                replies: Vec::new(),
            }),
    );

    Ok(PrContext {
        number: number.to_string(),
        description: view.body.unwrap_or_default().trim().to_string(),
        comments,
    })
}

/// `gh api --paginate` prints one JSON array per page back to back.
fn parse_paginated<T: DeserializeOwned>(raw: &str) -> Result<Vec<T>> {
    let mut items = Vec::new();
    for page in serde_json::Deserializer::from_str(raw).into_iter::<Vec<T>>() {
        items.extend(page?);
    }
    Ok(items)
}

/// Attach replies to their root review comment. Replies whose root is
/// missing are promoted to top-level comments.
fn thread_review_comments(raw: Vec<GhComment>) -> Vec<Comment> {
    let mut comments: Vec<Comment> = Vec::new();
    let mut root_index: HashMap<u64, usize> = HashMap::new();

    for c in raw.iter().filter(|c| c.in_reply_to_id.is_none()) {
        if c.body().is_empty() {
            continue;
        }
        root_index.insert(c.id, comments.len());
        comments.push(Comment {
            author: c.author(),
            body: c.body().to_string(),
            replies: Vec::new(),
        });
    }

    for c in raw.iter().filter(|c| c.in_reply_to_id.is_some()) {
        if c.body().is_empty() {
            continue;
        }
        match c.in_reply_to_id.and_then(|id| root_index.get(&id)) {
            Some(&idx) => comments[idx].replies.push(Reply {
                author: c.author(),
                body: c.body().to_string(),
            }),
            None => comments.push(Comment {
                author: c.author(),
                body: c.body().to_string(),
                replies: Vec::new(),
            }),
        }
    }

    comments
}

/// Markdown handed to the feedback agent.
pub fn build_input(ctx: &PrContext) -> String {
    let mut out = String::from("## PR Description\n\n");
    if ctx.description.is_empty() {
        out.push_str("(No description)");
    } else {
        out.push_str(&ctx.description);
    }
    out.push_str("\n\n");

    if !ctx.comments.is_empty() {
        out.push_str("## Comments\n\n");
        for c in &ctx.comments {
            let _ = write!(out, "**{}**: {}\n\n", c.author, c.body);
            for r in &c.replies {
                let _ = write!(out, "  > **{}**: {}\n\n", r.author, r.body);
            }
        }
    }
    out
}

/// Summarizes prior review discussion on a PR for the FP filter.
///
/// Best-effort: every failure, including cancellation, yields an empty
/// summary.
pub struct FeedbackSummarizer {
    agent: Arc<dyn Agent>,
    client: Arc<dyn GhClient>,
    timeout: Option<Duration>,
}

impl FeedbackSummarizer {
    pub fn new(agent: Arc<dyn Agent>, timeout: Option<Duration>) -> Self {
        Self {
            agent,
            client: Arc::new(DefaultGhClient),
            timeout,
        }
    }

    pub fn with_client(
        agent: Arc<dyn Agent>,
        client: Arc<dyn GhClient>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            agent,
            client,
            timeout,
        }
    }

    pub async fn summarize(&self, pr_number: &str, cancel: &CancellationToken) -> String {
        let client = Arc::clone(&self.client);
        let number = pr_number.to_string();
        let fetch = tokio::task::spawn_blocking(move || fetch_pr_context(client.as_ref(), &number));

        let ctx = tokio::select! {
            joined = fetch => match joined {
                Ok(Ok(ctx)) => ctx,
                Ok(Err(e)) => {
                    warn!("[feedback] failed to fetch PR #{pr_number} context: {e}");
                    return String::new();
                }
                Err(e) => {
                    warn!("[feedback] fetch task failed: {e}");
                    return String::new();
                }
            },
            _ = cancel.cancelled() => return String::new(),
        };

        self.summarize_context(&ctx, cancel).await
    }

    pub async fn summarize_context(&self, ctx: &PrContext, cancel: &CancellationToken) -> String {
        if !ctx.has_content() {
            debug!("[feedback] PR has no description or comments");
            return String::new();
        }
        if cancel.is_cancelled() {
            return String::new();
        }

        info!(
            "[feedback] summarizing {} comment thread(s) with {}",
            ctx.comments.len(),
            self.agent.name()
        );
        let input = build_input(ctx);
        let output = match run_summary(
            self.agent.as_ref(),
            FEEDBACK_PROMPT,
            input.as_bytes(),
            cancel,
            self.timeout,
        )
        .await
        {
            Ok(output) => output,
            Err(e) => {
                warn!("[feedback] {e}");
                return String::new();
            }
        };

        match output.status {
            CallStatus::Completed => {}
            CallStatus::Cancelled => return String::new(),
            CallStatus::TimedOut => {
                warn!("[feedback] agent timed out");
                return String::new();
            }
        }
        if output.exit_code != 0 {
            warn!(
                "[feedback] agent exited with code {}: {}",
                output.exit_code,
                output.stderr.trim()
            );
            return String::new();
        }

        let text = extract_summary_text(self.agent.name(), &output.stdout)
            .unwrap_or_else(|_| output.stdout.clone());
        clean_summary(&text)
    }
}

/// Trim, unfence, and blank out the "no prior feedback" sentinel.
pub fn clean_summary(raw: &str) -> String {
    let summary = strip_markdown_fences(raw.trim());
    if summary.to_lowercase().contains(NO_FEEDBACK_SENTINEL) {
        return String::new();
    }
    summary
}

fn retry_with_backoff<F, T>(f: F) -> Result<T>
where
    F: Fn() -> Result<T>,
{
    let mut backoff_ms = INITIAL_BACKOFF_MS;

    for attempt in 1..=MAX_RETRIES {
        match f() {
            Ok(val) => return Ok(val),
            Err(e) if attempt < MAX_RETRIES => {
                warn!(attempt, error = %e, backoff_ms, "retrying gh after error");
                thread::sleep(Duration::from_millis(backoff_ms));
                backoff_ms *= 2;
            }
            Err(e) => return Err(e),
        }
    }

    Err(Error::Gh("gh retries exhausted".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentKind, agent_for_kind};
    use std::sync::Mutex;

    struct MockGhClient {
        responses: Mutex<Vec<Result<String>>>,
        calls: Mutex<Vec<String>>,
    }

    impl MockGhClient {
        fn new(responses: Vec<Result<String>>) -> Self {
            Self {
                responses: Mutex::new(responses),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    impl GhClient for MockGhClient {
        fn run(&self, args: &[&str]) -> Result<String> {
            self.calls.lock().unwrap().push(args.join(" "));
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Err(Error::Gh("no more mock responses".to_string()))
            } else {
                responses.remove(0)
            }
        }
    }

    fn missing_agent() -> Arc<dyn Agent> {
        agent_for_kind(AgentKind::Codex, Some("/nonexistent/acr-codex".into()))
    }

    #[test]
    fn test_has_content() {
        assert!(!PrContext::default().has_content());
        let desc = PrContext {
            description: "Fix bug".into(),
            ..Default::default()
        };
        assert!(desc.has_content());
        let comments = PrContext {
            comments: vec![Comment {
                body: "LGTM".into(),
                ..Default::default()
            }],
            ..Default::default()
        };
        assert!(comments.has_content());
    }

    #[test]
    fn test_fetch_threads_replies_and_drops_empty() {
        let review = r#"[
            {"id": 1, "user": {"login": "alice"}, "body": "Possible race here"},
            {"id": 2, "user": {"login": "bob"}, "body": "   "}
        ][
            {"id": 3, "in_reply_to_id": 1, "user": {"login": "carol"}, "body": "Guarded by the mutex"}
        ]"#;
        let issue = r#"[{"id": 10, "user": {"login": "dave"}, "body": "Thanks!"}]"#;
        let client = MockGhClient::new(vec![
            Ok(r#"{"body": "Adds caching"}"#.to_string()),
            Ok(review.to_string()),
            Ok(issue.to_string()),
        ]);

        let ctx = fetch_pr_context(&client, "42").unwrap();
        assert_eq!(ctx.number, "42");
        assert_eq!(ctx.description, "Adds caching");
        assert_eq!(ctx.comments.len(), 2);
        assert_eq!(ctx.comments[0].author, "alice");
        assert_eq!(
            ctx.comments[0].replies,
            vec![Reply {
                author: "carol".into(),
                body: "Guarded by the mutex".into()
            }]
        );
        assert_eq!(ctx.comments[1].author, "dave");

        let calls = client.calls.lock().unwrap();
        assert_eq!(calls[0], "pr view 42 --json body");
        assert_eq!(calls[1], "api --paginate repos/{owner}/{repo}/pulls/42/comments");
        assert_eq!(calls[2], "api --paginate repos/{owner}/{repo}/issues/42/comments");
    }

    #[test]
    fn test_fetch_orphan_reply_becomes_top_level() {
        let review = r#"[{"id": 5, "in_reply_to_id": 99, "body": "orphan"}]"#;
        let client = MockGhClient::new(vec![
            Ok(r#"{"body": null}"#.to_string()),
            Ok(review.to_string()),
            Ok("[]".to_string()),
        ]);
        let ctx = fetch_pr_context(&client, "7").unwrap();
        assert_eq!(ctx.description, "");
        assert_eq!(ctx.comments.len(), 1);
        assert_eq!(ctx.comments[0].author, "unknown");
        assert_eq!(ctx.comments[0].body, "orphan");
    }

    #[test]
    fn test_fetch_empty_number_is_error() {
        let client = MockGhClient::new(vec![]);
        assert!(fetch_pr_context(&client, "  ").is_err());
        assert!(client.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_fetch_invalid_json_is_error() {
        let client = MockGhClient::new(vec![Ok("not json".to_string())]);
        assert!(fetch_pr_context(&client, "1").is_err());
    }

    #[test]
    fn test_build_input_description_only() {
        let ctx = PrContext {
            description: "This PR fixes the login bug".into(),
            ..Default::default()
        };
        assert_eq!(
            build_input(&ctx),
            "## PR Description\n\nThis PR fixes the login bug\n\n"
        );
    }

    #[test]
    fn test_build_input_comments_and_replies() {
        let ctx = PrContext {
            comments: vec![Comment {
                author: "alice".into(),
                body: "Unchecked error".into(),
                replies: vec![Reply {
                    author: "bob".into(),
                    body: "Fixed in abc123".into(),
                }],
            }],
            ..Default::default()
        };
        let input = build_input(&ctx);
        assert!(input.starts_with("## PR Description\n\n(No description)\n\n"));
        assert!(input.contains("## Comments\n\n**alice**: Unchecked error\n\n"));
        assert!(input.contains("  > **bob**: Fixed in abc123\n\n"));
    }

    #[test]
    fn test_clean_summary() {
        assert_eq!(clean_summary("  No prior feedback on code review findings.\n"), "");
        assert_eq!(clean_summary("```\nNO PRIOR FEEDBACK\n```"), "");
        assert_eq!(
            clean_summary("```markdown\n- FIXED: \"x\" -- done (by @a)\n```"),
            "- FIXED: \"x\" -- done (by @a)"
        );
    }

    #[tokio::test]
    async fn test_empty_context_yields_empty_summary() {
        // the agent binary does not exist, so reaching it would log a spawn error
        let summarizer = FeedbackSummarizer::new(missing_agent(), None);
        let summary = summarizer
            .summarize_context(&PrContext::default(), &CancellationToken::new())
            .await;
        assert_eq!(summary, "");
    }

    #[tokio::test]
    async fn test_fetch_failure_yields_empty_summary() {
        let client = Arc::new(MockGhClient::new(vec![Err(Error::Gh("boom".into()))]));
        let summarizer = FeedbackSummarizer::with_client(missing_agent(), client, None);
        let summary = summarizer.summarize("12", &CancellationToken::new()).await;
        assert_eq!(summary, "");
    }

    #[tokio::test]
    async fn test_spawn_failure_yields_empty_summary() {
        let summarizer = FeedbackSummarizer::new(missing_agent(), None);
        let ctx = PrContext {
            description: "desc".into(),
            ..Default::default()
        };
        let summary = summarizer
            .summarize_context(&ctx, &CancellationToken::new())
            .await;
        assert_eq!(summary, "");
    }

    #[test]
    fn test_retry_gives_up_after_max() {
        let attempts = Mutex::new(0);
        let result: Result<()> = retry_with_backoff(|| {
            *attempts.lock().unwrap() += 1;
            Err(Error::Gh("fail".into()))
        });
        assert!(result.is_err());
        assert_eq!(*attempts.lock().unwrap(), MAX_RETRIES);
    }
}
