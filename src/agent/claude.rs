use tokio_util::sync::CancellationToken;

use super::{
    Agent, ReviewConfig, binary_available, prepare_review_prompt, spawn_review, spawn_summary,
};
use crate::error::Result;
use crate::process::ExecutionHandle;

/// Claude Code CLI in print mode. Reviews come back as markdown.
pub struct ClaudeAgent {
    binary: String,
}

impl ClaudeAgent {
    pub fn new(binary: Option<String>) -> Self {
        Self {
            binary: binary.unwrap_or_else(|| "claude".to_string()),
        }
    }

    pub fn build_review_command(&self) -> (String, Vec<String>) {
        (
            self.binary.clone(),
            vec!["--print".to_string(), "-".to_string()],
        )
    }

    /// Summaries use the JSON wrapper so the result can be located reliably.
    pub fn build_summary_command(&self) -> (String, Vec<String>) {
        (
            self.binary.clone(),
            vec![
                "--print".to_string(),
                "--output-format".to_string(),
                "json".to_string(),
                "-".to_string(),
            ],
        )
    }
}

impl Agent for ClaudeAgent {
    fn name(&self) -> &'static str {
        "claude"
    }

    fn is_available(&self) -> Result<()> {
        binary_available(&self.binary)
    }

    fn execute_review(
        &self,
        config: &ReviewConfig,
        cancel: CancellationToken,
    ) -> Result<ExecutionHandle> {
        let (command, args) = self.build_review_command();
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
