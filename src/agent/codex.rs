use tokio_util::sync::CancellationToken;

use super::{
    Agent, ReviewConfig, binary_available, prepare_review_prompt, spawn_review, spawn_summary,
};
use crate::error::Result;
use crate::process::ExecutionHandle;

/// OpenAI Codex CLI. Emits JSONL events with `--json`.
pub struct CodexAgent {
    binary: String,
}

impl CodexAgent {
    pub fn new(binary: Option<String>) -> Self {
        Self {
            binary: binary.unwrap_or_else(|| "codex".to_string()),
        }
    }

    fn base_args() -> Vec<String> {
        vec![
            "exec".to_string(),
            "--json".to_string(),
            "--color".to_string(),
            "never".to_string(),
        ]
    }

    /// Codex has a native diff review. It is used when the prompt has nothing
    /// to add: no guidance and no ref file.
    pub fn uses_native_review(config: &ReviewConfig) -> bool {
        !config.has_guidance() && !config.needs_ref_file()
    }

    /// Build the command and arguments for a review.
    pub fn build_review_command(&self, config: &ReviewConfig) -> (String, Vec<String>) {
        let mut args = Self::base_args();
        if Self::uses_native_review(config) {
            args.push("review".to_string());
            args.push("--base".to_string());
            args.push(config.base_ref.clone());
        } else {
            args.push("-".to_string());
        }
        (self.binary.clone(), args)
    }

    pub fn build_summary_command(&self) -> (String, Vec<String>) {
        let mut args = Self::base_args();
        args.push("-".to_string());
        (self.binary.clone(), args)
    }
}

impl Agent for CodexAgent {
    fn name(&self) -> &'static str {
        "codex"
    }

    fn is_available(&self) -> Result<()> {
        binary_available(&self.binary)
    }

    fn execute_review(
        &self,
        config: &ReviewConfig,
        cancel: CancellationToken,
    ) -> Result<ExecutionHandle> {
        let (command, args) = self.build_review_command(config);
        if Self::uses_native_review(config) {
            return spawn_review(&command, args, config, None, None, cancel);
        }
        let (prompt, temp_file) = prepare_review_prompt(config)?;
        spawn_review(&command, args, config, Some(prompt), temp_file, cancel)
    }

    fn execute_summary(
        &self,
        prompt: &str,
        payload: &[u8],
        cancel: CancellationToken,
    ) -> Result<ExecutionHandle> {
        let (command, args) = self.build_summary_command();
        spawn_summary(&command, args, prompt, payload, cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;

    fn config(guidance: Option<&str>) -> ReviewConfig {
        ReviewConfig {
            base_ref: "origin/main".into(),
            timeout: Duration::from_secs(1),
            work_dir: PathBuf::from("/tmp"),
            reviewer_id: 2,
            guidance: guidance.map(str::to_string),
            diff: Some(Arc::from("diff")),
            use_ref_file: false,
        }
    }

    #[test]
    fn test_native_review_command() {
        let agent = CodexAgent::new(None);
        let (cmd, args) = agent.build_review_command(&config(None));
        assert_eq!(cmd, "codex");
        assert_eq!(
            args,
            vec!["exec", "--json", "--color", "never", "review", "--base", "origin/main"]
        );
    }

    #[test]
    fn test_guided_review_reads_stdin() {
        let agent = CodexAgent::new(Some("/opt/codex".into()));
        let (cmd, args) = agent.build_review_command(&config(Some("check auth paths")));
        assert_eq!(cmd, "/opt/codex");
        assert_eq!(args.last().map(String::as_str), Some("-"));
        assert!(!args.contains(&"review".to_string()));
    }

    #[test]
    fn test_summary_command() {
        let (_, args) = CodexAgent::new(None).build_summary_command();
        assert_eq!(args, vec!["exec", "--json", "--color", "never", "-"]);
    }
}
