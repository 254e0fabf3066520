use tokio_util::sync::CancellationToken;

use super::{
    Agent, ReviewConfig, binary_available, prepare_review_prompt, spawn_review, spawn_summary,
};
use crate::error::Result;
use crate::process::ExecutionHandle;

/// Gemini CLI with JSON output. The whole response arrives as one object.
pub struct GeminiAgent {
    binary: String,
}

impl GeminiAgent {
    pub fn new(binary: Option<String>) -> Self {
        Self {
            binary: binary.unwrap_or_else(|| "gemini".to_string()),
        }
    }

    pub fn build_command(&self) -> (String, Vec<String>) {
        (
            self.binary.clone(),
            vec!["-o".to_string(), "json".to_string(), "-".to_string()],
        )
    }
}

impl Agent for GeminiAgent {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn is_available(&self) -> Result<()> {
        binary_available(&self.binary)
    }

    fn execute_review(
        &self,
        config: &ReviewConfig,
        cancel: CancellationToken,
    ) -> Result<ExecutionHandle> {
        let (command, args) = self.build_command();
        let (prompt, temp_file) = prepare_review_prompt(config)?;
        spawn_review(&command, args, config, Some(prompt), temp_file, cancel)
    }

    fn execute_summary(
        &self,
        prompt: &str,
        payload: &[u8],
        cancel: CancellationToken,
    ) -> Result<ExecutionHandle> {
        let (command, args) = self.build_command();
        spawn_summary(&command, args, prompt, payload, cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_command() {
        let (cmd, args) = GeminiAgent::new(None).build_command();
        assert_eq!(cmd, "gemini");
        assert_eq!(args, vec!["-o", "json", "-"]);
    }
}
