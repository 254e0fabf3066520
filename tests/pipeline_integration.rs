mod common;

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use acr::agent::{Agent, AgentKind};
use acr::domain::Disposition;
use acr::error::{Error, Result};
use acr::feedback::GhClient;
use acr::fpcache::FpCache;
use acr::pipeline::{ExitStatus, Pipeline, RunOutcome};

use common::{codex_emitting, mock_agent, test_config};

const DIFF: &str = "diff --git a/src/lib.rs b/src/lib.rs\n+fn added() {}\n";

const GROUPED: &str = r#"{"findings":[{"title":"Issue X","summary":"X happens twice.","messages":["X"],"reviewer_count":2,"sources":[0]},{"title":"Issue Y","summary":"Y happens once.","messages":["Y"],"reviewer_count":1,"sources":[1]}],"info":[]}"#;

/// Claude-style summarizer that answers grouping, scoring and feedback
/// requests. Every scoring request is copied to `fp-stdin`.
fn summarizer(dir: &Path, evaluations: &str) -> Arc<dyn Agent> {
    let body = format!(
        r###"input=$(cat)
case "$input" in
  *evaluations*)
    printf '%s' "$input" > '{fp_log}'
    echo '{{"evaluations":{evaluations}}}'
    ;;
  *"## PR Description"*)
    echo '{{"result":"- DISMISSED: Issue Y was already discussed"}}'
    ;;
  *)
    echo '{grouped}'
    ;;
esac
"###,
        fp_log = dir.join("fp-stdin").display(),
        grouped = GROUPED,
    );
    mock_agent(dir, AgentKind::Claude, "summarizer", &body)
}

/// Reviewers A, B, A: A reports "X", B reports "Y".
fn reviewers(dir: &Path) -> Vec<Arc<dyn Agent>> {
    let a = mock_agent(dir, AgentKind::Codex, "codex-a", &codex_emitting(&["X"]));
    let b = mock_agent(dir, AgentKind::Codex, "codex-b", &codex_emitting(&["Y"]));
    vec![Arc::clone(&a), b, a]
}

async fn run_pipeline(
    dir: &Path,
    args: &[&str],
    reviewers: Vec<Arc<dyn Agent>>,
    summarizer: Arc<dyn Agent>,
) -> RunOutcome {
    console::set_colors_enabled(false);
    Pipeline::new(test_config(args), dir.to_path_buf())
        .unwrap()
        .with_agents(reviewers, summarizer)
        .with_diff(DIFF)
        .with_backoff_base(Duration::from_millis(10))
        .run(&CancellationToken::new())
        .await
        .unwrap()
}

struct MockGhClient {
    responses: Mutex<Vec<String>>,
    calls: Mutex<Vec<String>>,
}

impl MockGhClient {
    fn new(responses: &[&str]) -> Self {
        Self {
            responses: Mutex::new(responses.iter().map(|s| s.to_string()).collect()),
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl GhClient for MockGhClient {
    fn run(&self, args: &[&str]) -> Result<String> {
        self.calls.lock().unwrap().push(args.join(" "));
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            return Err(Error::Gh("unexpected gh call".to_string()));
        }
        Ok(responses.remove(0))
    }
}

#[tokio::test]
async fn test_consensus_findings_are_grouped_and_saved() {
    let tmp = tempfile::tempdir().unwrap();
    let outcome = run_pipeline(
        tmp.path(),
        &["--reviewers", "3", "--no-fp-filter"],
        reviewers(tmp.path()),
        summarizer(tmp.path(), "[]"),
    )
    .await;

    assert_eq!(outcome.status, ExitStatus::Findings);
    assert_eq!(outcome.aggregated.len(), 2);
    assert_eq!(outcome.aggregated[0].text, "X");
    assert_eq!(outcome.aggregated[0].reviewers, vec![1, 3]);
    assert_eq!(outcome.aggregated[1].reviewers, vec![2]);

    assert!(outcome.report.contains("Issue X (2/3 reviewers)"));
    assert!(outcome.report.contains("Issue Y (1/3 reviewers)"));
    assert_eq!(
        outcome.dispositions,
        vec![
            Disposition::Survived {
                title: "Issue X".to_string()
            },
            Disposition::Survived {
                title: "Issue Y".to_string()
            },
        ]
    );
    assert!(!tmp.path().join("fp-stdin").exists());

    let last_run = FpCache::new(FpCache::default_dir(tmp.path()))
        .load_last_run()
        .unwrap();
    let titles: Vec<&str> = last_run.findings.iter().map(|f| f.title.as_str()).collect();
    assert_eq!(titles, vec!["Issue X", "Issue Y"]);
}

#[tokio::test]
async fn test_fp_filter_removes_high_scoring_findings() {
    let tmp = tempfile::tempdir().unwrap();
    let outcome = run_pipeline(
        tmp.path(),
        &["--reviewers", "3"],
        reviewers(tmp.path()),
        summarizer(
            tmp.path(),
            r#"[{"id":0,"fp_score":10,"reasoning":"real"},{"id":1,"fp_score":90,"reasoning":"style only"}]"#,
        ),
    )
    .await;

    assert_eq!(outcome.status, ExitStatus::Findings);
    assert_eq!(outcome.grouped.findings.len(), 1);
    assert_eq!(outcome.grouped.findings[0].title, "Issue X");
    assert_eq!(outcome.stats.fp_filtered_count, 1);
    assert_eq!(
        outcome.dispositions[1],
        Disposition::FilteredFp {
            title: "Issue Y".to_string(),
            fp_score: 90,
            threshold: 75,
            reasoning: "style only".to_string(),
        }
    );
    assert!(outcome.report.contains("1 finding filtered as likely false positive"));
}

#[tokio::test]
async fn test_all_findings_filtered_renders_annotated_lgtm() {
    let tmp = tempfile::tempdir().unwrap();
    let outcome = run_pipeline(
        tmp.path(),
        &["--reviewers", "3", "--markdown"],
        reviewers(tmp.path()),
        summarizer(
            tmp.path(),
            r#"[{"id":0,"fp_score":95,"reasoning":"guarded"},{"id":1,"fp_score":80,"reasoning":"style"}]"#,
        ),
    )
    .await;

    assert_eq!(outcome.status, ExitStatus::NoFindings);
    let md = outcome.markdown.unwrap();
    assert!(md.starts_with("## LGTM"));
    assert!(md.contains("Filtered as likely false positive (score 95, threshold 75): Issue X"));
    assert!(md.contains("_Generated by acr v"));
}

#[tokio::test]
async fn test_ignore_file_skips_matching_titles() {
    let tmp = tempfile::tempdir().unwrap();
    let cache = FpCache::new(FpCache::default_dir(tmp.path()));
    cache.save_ignore(&["Issue Y".to_string()]).unwrap();

    let outcome = run_pipeline(
        tmp.path(),
        &["--reviewers", "3", "--no-fp-filter"],
        reviewers(tmp.path()),
        summarizer(tmp.path(), "[]"),
    )
    .await;

    assert_eq!(outcome.stats.ignored_count, 1);
    assert_eq!(
        outcome.dispositions[1],
        Disposition::FilteredIgnore {
            title: "Issue Y".to_string()
        }
    );
    assert!(outcome.report.contains("1 finding skipped by ignore patterns"));
}

#[tokio::test]
async fn test_all_reviewers_failed_is_an_error() {
    let tmp = tempfile::tempdir().unwrap();
    let broken = mock_agent(
        tmp.path(),
        AgentKind::Claude,
        "claude",
        "cat > /dev/null\necho 'crashed' >&2\nexit 1\n",
    );
    let outcome = run_pipeline(
        tmp.path(),
        &["--reviewers", "2", "--retries", "0"],
        vec![broken],
        summarizer(tmp.path(), "[]"),
    )
    .await;

    assert_eq!(outcome.status, ExitStatus::Error);
    assert_eq!(outcome.stats.failed, vec![1, 2]);
    assert!(outcome.markdown.is_none());
}

#[tokio::test]
async fn test_silent_reviewers_produce_lgtm_markdown() {
    let tmp = tempfile::tempdir().unwrap();
    let quiet = mock_agent(tmp.path(), AgentKind::Codex, "codex", &codex_emitting(&[]));
    let outcome = run_pipeline(
        tmp.path(),
        &["--reviewers", "2", "--markdown"],
        vec![quiet],
        summarizer(tmp.path(), "[]"),
    )
    .await;

    assert_eq!(outcome.status, ExitStatus::NoFindings);
    assert!(outcome.report.contains("LGTM (2/2 reviewers)"));
    let md = outcome.markdown.unwrap();
    assert!(md.contains("**2 of 2 reviewers found no issues.**"));
}

#[tokio::test]
async fn test_empty_diff_short_circuits() {
    let tmp = tempfile::tempdir().unwrap();
    let outcome = Pipeline::new(test_config(&[]), tmp.path().to_path_buf())
        .unwrap()
        .with_agents(reviewers(tmp.path()), summarizer(tmp.path(), "[]"))
        .with_diff("  \n")
        .run(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.status, ExitStatus::NoFindings);
    assert_eq!(outcome.report, "No changes to review against main.");
}

#[tokio::test]
async fn test_empty_pr_context_leaves_prompt_without_feedback() {
    let tmp = tempfile::tempdir().unwrap();
    let gh = Arc::new(MockGhClient::new(&[r#"{"body":""}"#, "[]", "[]"]));

    console::set_colors_enabled(false);
    let outcome = Pipeline::new(
        test_config(&["--reviewers", "3", "--pr", "5"]),
        tmp.path().to_path_buf(),
    )
    .unwrap()
    .with_agents(reviewers(tmp.path()), summarizer(tmp.path(), "[]"))
    .with_gh_client(gh.clone())
    .with_diff(DIFF)
    .run(&CancellationToken::new())
    .await
    .unwrap();

    assert_eq!(outcome.feedback, "");
    assert_eq!(gh.calls.lock().unwrap().len(), 3);
    let fp_stdin = std::fs::read_to_string(tmp.path().join("fp-stdin")).unwrap();
    assert!(!fp_stdin.contains("Prior feedback on this pull request"));
}

#[tokio::test]
async fn test_pr_feedback_reaches_fp_prompt() {
    let tmp = tempfile::tempdir().unwrap();
    let gh = Arc::new(MockGhClient::new(&[
        r#"{"body":"Adds the Y cache."}"#,
        r#"[{"id":10,"user":{"login":"alice"},"body":"Issue Y is intended."}]"#,
        "[]",
    ]));

    console::set_colors_enabled(false);
    let outcome = Pipeline::new(
        test_config(&["--reviewers", "3", "--pr", "5"]),
        tmp.path().to_path_buf(),
    )
    .unwrap()
    .with_agents(reviewers(tmp.path()), summarizer(tmp.path(), "[]"))
    .with_gh_client(gh)
    .with_diff(DIFF)
    .run(&CancellationToken::new())
    .await
    .unwrap();

    assert_eq!(outcome.feedback, "- DISMISSED: Issue Y was already discussed");
    let fp_stdin = std::fs::read_to_string(tmp.path().join("fp-stdin")).unwrap();
    assert!(fp_stdin.contains("Prior feedback on this pull request"));
    assert!(fp_stdin.contains("DISMISSED: Issue Y"));
}

#[tokio::test]
async fn test_no_pr_feedback_flag_skips_gh() {
    let tmp = tempfile::tempdir().unwrap();
    let gh = Arc::new(MockGhClient::new(&[]));

    let outcome = Pipeline::new(
        test_config(&["--reviewers", "3", "--pr", "5", "--no-pr-feedback"]),
        tmp.path().to_path_buf(),
    )
    .unwrap()
    .with_agents(reviewers(tmp.path()), summarizer(tmp.path(), "[]"))
    .with_gh_client(gh.clone())
    .with_diff(DIFF)
    .run(&CancellationToken::new())
    .await
    .unwrap();

    assert_eq!(outcome.feedback, "");
    assert!(gh.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_unparseable_grouping_reports_summarizer_error() {
    let tmp = tempfile::tempdir().unwrap();
    let broken = mock_agent(
        tmp.path(),
        AgentKind::Claude,
        "summarizer",
        "cat > /dev/null\necho 'I could not decide'\necho 'sorry'\n",
    );
    let outcome = run_pipeline(
        tmp.path(),
        &["--reviewers", "3", "--no-fp-filter", "--markdown"],
        reviewers(tmp.path()),
        broken,
    )
    .await;

    assert_eq!(outcome.status, ExitStatus::Error);
    assert!(outcome.markdown.is_none());
    assert!(outcome.grouped.findings.is_empty());
    assert!(outcome.report.contains("Summarizer Error"));
    assert!(outcome.report.contains("Exit code: 1"));
    assert!(outcome.report.contains("failed to parse summarizer JSON output"));
    assert!(outcome.report.contains("I could not decide"));
    assert!(outcome.report.contains("sorry"));
}

#[tokio::test]
async fn test_grouping_printed_before_failing_exit_is_used() {
    let tmp = tempfile::tempdir().unwrap();
    let flaky = mock_agent(
        tmp.path(),
        AgentKind::Claude,
        "summarizer",
        &format!("cat > /dev/null\necho '{GROUPED}'\nexit 1\n"),
    );
    let outcome = run_pipeline(
        tmp.path(),
        &["--reviewers", "3", "--no-fp-filter"],
        reviewers(tmp.path()),
        flaky,
    )
    .await;

    assert_eq!(outcome.status, ExitStatus::Findings);
    assert_eq!(outcome.grouped.findings.len(), 2);
    assert!(!outcome.report.contains("Summarizer Error"));
    assert!(outcome.report.contains("Issue X (2/3 reviewers)"));
}
