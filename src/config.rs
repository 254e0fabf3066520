use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;

use crate::agent::AgentKind;
use crate::cli::Cli;
use crate::error::{Error, Result};
use crate::fpfilter::DEFAULT_THRESHOLD;

pub const CONFIG_FILE_NAME: &str = ".acr.toml";

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FiltersFile {
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FpFilterFile {
    pub enabled: Option<bool>,
    pub threshold: Option<u8>,
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PrFeedbackFile {
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub reviewers: Option<usize>,
    pub concurrency: Option<usize>,
    pub base: Option<String>,
    pub timeout: Option<u64>,
    pub retries: Option<u32>,
    pub reviewer_agents: Option<Vec<String>>,
    pub summarizer_agent: Option<String>,
    pub summarizer_timeout: Option<u64>,
    pub guidance: Option<String>,
    pub guidance_file: Option<String>,
    pub use_ref_file: Option<bool>,
    #[serde(default)]
    pub filters: FiltersFile,
    #[serde(default)]
    pub fp_filter: FpFilterFile,
    #[serde(default)]
    pub pr_feedback: PrFeedbackFile,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub reviewers: usize,
    pub concurrency: usize,
    pub base: String,
    pub timeout: Duration,
    pub retries: u32,
    pub reviewer_agents: Vec<String>,
    pub summarizer_agent: String,
    pub summarizer_timeout: Duration,
    pub guidance: Option<String>,
    pub use_ref_file: bool,
    pub exclude_patterns: Vec<String>,
    pub fp_filter_enabled: bool,
    pub fp_threshold: u8,
    pub fp_filter_timeout: Duration,
    pub pr_feedback_enabled: bool,
    pub pr: Option<String>,
    pub markdown: bool,
    pub verbose: bool,
}

impl Config {
    /// Load `--config` (must exist) or `<repo_root>/.acr.toml` (optional),
    /// then apply CLI overrides.
    pub fn load(cli: &Cli, repo_root: &Path) -> Result<Self> {
        let (path, explicit) = match cli.config {
            Some(ref p) => (PathBuf::from(p), true),
            None => (repo_root.join(CONFIG_FILE_NAME), false),
        };

        let file_config = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            parse_config(&content)?
        } else if explicit {
            return Err(Error::ConfigNotFound(path));
        } else {
            ConfigFile::default()
        };

        let config_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or_else(|| repo_root.to_path_buf(), Path::to_path_buf);
        merge(file_config, cli, &config_dir)
    }
}

pub fn parse_config(content: &str) -> Result<ConfigFile> {
    let config: ConfigFile = toml::from_str(content)?;
    validate(&config)?;
    Ok(config)
}

fn validate_agents<'a>(names: impl IntoIterator<Item = &'a String>) -> Result<()> {
    for name in names {
        name.parse::<AgentKind>()?;
    }
    Ok(())
}

fn validate(config: &ConfigFile) -> Result<()> {
    if config.reviewers == Some(0) {
        return Err(Error::ConfigValidation("reviewers must be >= 1".to_string()));
    }
    if config.timeout == Some(0) {
        return Err(Error::ConfigValidation("timeout must be > 0".to_string()));
    }
    if let Some(ref agents) = config.reviewer_agents {
        if agents.is_empty() {
            return Err(Error::ConfigValidation("reviewer_agents must not be empty".to_string()));
        }
        validate_agents(agents)?;
    }
    if let Some(ref agent) = config.summarizer_agent {
        validate_agents([agent])?;
    }
    if let Some(threshold) = config.fp_filter.threshold
        && !(1..=100).contains(&threshold)
    {
        return Err(Error::ConfigValidation(format!(
            "fp_filter.threshold must be between 1 and 100, got {threshold}"
        )));
    }
    if config.guidance.is_some() && config.guidance_file.is_some() {
        return Err(Error::ConfigValidation(
            "guidance and guidance_file are mutually exclusive".to_string(),
        ));
    }
    for pattern in &config.filters.exclude_patterns {
        Regex::new(pattern).map_err(|e| {
            Error::ConfigValidation(format!("invalid exclude pattern {pattern:?}: {e}"))
        })?;
    }
    Ok(())
}

fn read_guidance(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| {
        Error::ConfigValidation(format!("failed to read guidance file {}: {e}", path.display()))
    })
}

/// CLI flag > file > default. `config_dir` anchors a relative
/// `guidance_file` from the file.
pub fn merge(file: ConfigFile, cli: &Cli, config_dir: &Path) -> Result<Config> {
    let reviewers = cli.reviewers.or(file.reviewers).unwrap_or(5);
    if reviewers == 0 {
        return Err(Error::ConfigValidation("reviewers must be >= 1".to_string()));
    }
    let concurrency = cli
        .concurrency
        .or(file.concurrency)
        .filter(|c| *c > 0)
        .unwrap_or(reviewers);

    let timeout_secs = cli.timeout.or(file.timeout).unwrap_or(600);
    if timeout_secs == 0 {
        return Err(Error::ConfigValidation("timeout must be > 0".to_string()));
    }

    let reviewer_agents: Vec<String> = cli
        .agents
        .clone()
        .map(|names| {
            names
                .into_iter()
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty())
                .collect::<Vec<_>>()
        })
        .filter(|names| !names.is_empty())
        .or(file.reviewer_agents)
        .unwrap_or_else(|| vec!["codex".to_string()]);
    validate_agents(&reviewer_agents)?;

    let summarizer_agent = cli
        .summarizer_agent
        .clone()
        .or(file.summarizer_agent)
        .unwrap_or_else(|| "codex".to_string());
    validate_agents([&summarizer_agent])?;

    let guidance = match (&cli.guidance, &cli.guidance_file) {
        (Some(g), _) => Some(g.clone()),
        (None, Some(p)) => Some(read_guidance(Path::new(p))?),
        (None, None) => match (file.guidance, file.guidance_file) {
            (Some(g), _) => Some(g),
            (None, Some(p)) => Some(read_guidance(&config_dir.join(p))?),
            (None, None) => None,
        },
    }
    .filter(|g| !g.trim().is_empty());

    Ok(Config {
        reviewers,
        concurrency,
        base: cli
            .base
            .clone()
            .or(file.base)
            .unwrap_or_else(|| "main".to_string()),
        timeout: Duration::from_secs(timeout_secs),
        retries: cli.retries.or(file.retries).unwrap_or(1),
        reviewer_agents,
        summarizer_agent,
        summarizer_timeout: Duration::from_secs(file.summarizer_timeout.unwrap_or(300)),
        guidance,
        use_ref_file: cli.ref_file || file.use_ref_file.unwrap_or(false),
        exclude_patterns: file.filters.exclude_patterns,
        fp_filter_enabled: !cli.no_fp_filter && file.fp_filter.enabled.unwrap_or(true),
        fp_threshold: cli
            .fp_threshold
            .or(file.fp_filter.threshold)
            .unwrap_or(DEFAULT_THRESHOLD),
        fp_filter_timeout: Duration::from_secs(file.fp_filter.timeout.unwrap_or(300)),
        pr_feedback_enabled: !cli.no_pr_feedback && file.pr_feedback.enabled.unwrap_or(true),
        pr: cli.pr.clone().filter(|p| !p.trim().is_empty()),
        markdown: cli.markdown,
        verbose: cli.verbose,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use tempfile::TempDir;

    fn defaults() -> Config {
        merge(ConfigFile::default(), &Cli::parse_from(["acr"]), Path::new(".")).unwrap()
    }

    #[test]
    fn test_parse_valid_config() {
        let toml = r#"
reviewers = 3
concurrency = 2
base = "develop"
timeout = 120
retries = 2
reviewer_agents = ["codex", "claude"]
summarizer_agent = "claude"
use_ref_file = true

[filters]
exclude_patterns = ["^vendor/"]

[fp_filter]
enabled = false
threshold = 80
timeout = 60

[pr_feedback]
enabled = false
"#;
        let config = parse_config(toml).unwrap();
        assert_eq!(config.reviewers, Some(3));
        assert_eq!(config.reviewer_agents.as_deref().map(<[String]>::len), Some(2));
        assert_eq!(config.fp_filter.threshold, Some(80));
        assert_eq!(config.filters.exclude_patterns, vec!["^vendor/".to_string()]);
        assert_eq!(config.pr_feedback.enabled, Some(false));
    }

    #[test]
    fn test_parse_empty_config() {
        assert_eq!(parse_config("").unwrap(), ConfigFile::default());
    }

    #[test]
    fn test_parse_unknown_field() {
        let err = parse_config(r#"bogus = "value""#).unwrap_err();
        assert!(err.to_string().contains("unknown field"));
        let err = parse_config("[fp_filter]\nbogus = 1").unwrap_err();
        assert!(err.to_string().contains("unknown field"));
    }

    #[test]
    fn test_parse_invalid_values() {
        let cases = [
            ("reviewers = 0", "reviewers must be >= 1"),
            ("timeout = 0", "timeout must be > 0"),
            (r#"reviewer_agents = ["copilot"]"#, "unknown agent: copilot"),
            ("reviewer_agents = []", "must not be empty"),
            (r#"summarizer_agent = "gpt""#, "unknown agent: gpt"),
            ("[fp_filter]\nthreshold = 0", "between 1 and 100"),
            ("[fp_filter]\nthreshold = 101", "between 1 and 100"),
            (
                "guidance = \"a\"\nguidance_file = \"b.md\"",
                "mutually exclusive",
            ),
            ("[filters]\nexclude_patterns = [\"(\"]", "invalid exclude pattern"),
        ];
        for (toml, expected) in cases {
            let err = parse_config(toml).unwrap_err();
            assert!(
                err.to_string().contains(expected),
                "{toml:?}: {err} does not contain {expected:?}"
            );
        }
    }

    #[test]
    fn test_defaults_applied() {
        let config = defaults();
        assert_eq!(config.reviewers, 5);
        assert_eq!(config.concurrency, 5);
        assert_eq!(config.base, "main");
        assert_eq!(config.timeout, Duration::from_secs(600));
        assert_eq!(config.retries, 1);
        assert_eq!(config.reviewer_agents, vec!["codex".to_string()]);
        assert_eq!(config.summarizer_agent, "codex");
        assert_eq!(config.summarizer_timeout, Duration::from_secs(300));
        assert!(config.fp_filter_enabled);
        assert_eq!(config.fp_threshold, 75);
        assert_eq!(config.fp_filter_timeout, Duration::from_secs(300));
        assert!(config.pr_feedback_enabled);
        assert!(config.guidance.is_none());
        assert!(!config.use_ref_file);
    }

    #[test]
    fn test_cli_overrides_config() {
        let file = ConfigFile {
            reviewers: Some(4),
            base: Some("develop".to_string()),
            reviewer_agents: Some(vec!["gemini".to_string()]),
            fp_filter: FpFilterFile {
                threshold: Some(90),
                ..Default::default()
            },
            ..Default::default()
        };
        let cli = Cli::parse_from([
            "acr",
            "--reviewers",
            "2",
            "--agents",
            "claude, codex",
            "--fp-threshold",
            "50",
            "--no-fp-filter",
        ]);
        let config = merge(file, &cli, Path::new(".")).unwrap();
        assert_eq!(config.reviewers, 2); // CLI wins
        assert_eq!(config.concurrency, 2);
        assert_eq!(config.base, "develop"); // file value kept
        assert_eq!(config.reviewer_agents, vec!["claude", "codex"]);
        assert_eq!(config.fp_threshold, 50);
        assert!(!config.fp_filter_enabled);
    }

    #[test]
    fn test_zero_concurrency_means_reviewers() {
        let cli = Cli::parse_from(["acr", "-r", "3", "-c", "0"]);
        let config = merge(ConfigFile::default(), &cli, Path::new(".")).unwrap();
        assert_eq!(config.concurrency, 3);
    }

    #[test]
    fn test_cli_rejects_unknown_agent_and_zero_values() {
        let cli = Cli::parse_from(["acr", "--agents", "codex,bard"]);
        let err = merge(ConfigFile::default(), &cli, Path::new(".")).unwrap_err();
        assert!(matches!(err, Error::UnknownAgent(ref n) if n == "bard"));

        let cli = Cli::parse_from(["acr", "--reviewers", "0"]);
        assert!(merge(ConfigFile::default(), &cli, Path::new(".")).is_err());

        let cli = Cli::parse_from(["acr", "--timeout", "0"]);
        assert!(merge(ConfigFile::default(), &cli, Path::new(".")).is_err());
    }

    #[test]
    fn test_guidance_file_relative_to_config_dir() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir(tmp.path().join("cfg")).unwrap();
        std::fs::write(tmp.path().join("cfg/guide.md"), "Focus on error handling").unwrap();
        std::fs::write(
            tmp.path().join("cfg/acr.toml"),
            "guidance_file = \"guide.md\"\n",
        )
        .unwrap();

        let config_path = tmp.path().join("cfg/acr.toml");
        let cli = Cli::parse_from(["acr", "--config", config_path.to_str().unwrap()]);
        let config = Config::load(&cli, tmp.path()).unwrap();
        assert_eq!(config.guidance.as_deref(), Some("Focus on error handling"));
    }

    #[test]
    fn test_cli_guidance_overrides_file_guidance() {
        let file = ConfigFile {
            guidance_file: Some("missing.md".to_string()),
            ..Default::default()
        };
        let cli = Cli::parse_from(["acr", "--guidance", "check locking"]);
        let config = merge(file, &cli, Path::new("/nonexistent")).unwrap();
        assert_eq!(config.guidance.as_deref(), Some("check locking"));
    }

    #[test]
    fn test_missing_guidance_file_is_error() {
        let file = ConfigFile {
            guidance_file: Some("missing.md".to_string()),
            ..Default::default()
        };
        let cli = Cli::parse_from(["acr"]);
        let err = merge(file, &cli, Path::new("/nonexistent")).unwrap_err();
        assert!(err.to_string().contains("failed to read guidance file"));
    }

    #[test]
    fn test_load_missing_default_file_uses_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = Config::load(&Cli::parse_from(["acr"]), tmp.path()).unwrap();
        assert_eq!(config, defaults());
    }

    #[test]
    fn test_load_missing_explicit_file_is_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nope.toml");
        let cli = Cli::parse_from(["acr", "--config", path.to_str().unwrap()]);
        let err = Config::load(&cli, tmp.path()).unwrap_err();
        assert!(matches!(err, Error::ConfigNotFound(p) if p == path));
    }

    #[test]
    fn test_load_default_file_from_repo_root() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join(CONFIG_FILE_NAME),
            "reviewers = 2\nbase = \"trunk\"\n",
        )
        .unwrap();
        let config = Config::load(&Cli::parse_from(["acr"]), tmp.path()).unwrap();
        assert_eq!(config.reviewers, 2);
        assert_eq!(config.base, "trunk");
    }
}
