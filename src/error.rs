use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config file not found: {0}")]
    ConfigNotFound(PathBuf),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config validation error: {0}")]
    ConfigValidation(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("prompt template error: {0}")]
    Template(#[from] upon::Error),

    #[error("unknown agent: {0} (expected: codex, claude, gemini)")]
    UnknownAgent(String),

    #[error("agent error: {0}")]
    Agent(String),

    #[error("process error: {0}")]
    Process(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("git error: {0}")]
    Git(String),

    #[error("gh error: {0}")]
    Gh(String),

    #[error("last-run file not found: {}", .0.display())]
    LastRunNotFound(PathBuf),

    #[error("invalid selection: {0}")]
    Selection(String),

    #[error("interrupted")]
    Interrupted,
}

pub type Result<T> = std::result::Result<T, Error>;
