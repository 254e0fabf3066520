#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;

use acr::agent::{Agent, AgentKind, agent_for_kind};
use acr::cli::Cli;
use acr::config::{Config, ConfigFile, merge};

/// Write an executable bash script and return its path.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/bash\n{body}")).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    path
}

/// An agent of `kind` whose binary is a bash script with `body`.
pub fn mock_agent(dir: &Path, kind: AgentKind, name: &str, body: &str) -> Arc<dyn Agent> {
    let path = write_script(dir, name, body);
    agent_for_kind(kind, Some(path.to_string_lossy().into_owned()))
}

/// Codex JSONL line carrying one agent message.
pub fn codex_message(text: &str) -> String {
    serde_json::json!({"item": {"type": "agent_message", "text": text}}).to_string()
}

/// Script body that drains stdin then prints `lines` as codex messages.
pub fn codex_emitting(lines: &[&str]) -> String {
    let mut body = String::from("cat > /dev/null\n");
    for line in lines {
        body.push_str(&format!("echo '{}'\n", codex_message(line)));
    }
    body
}

/// Config with defaults, adjusted by CLI-style `args` (without the binary name).
pub fn test_config(args: &[&str]) -> Config {
    let mut argv = vec!["acr"];
    argv.extend_from_slice(args);
    merge(ConfigFile::default(), &Cli::parse_from(argv), Path::new(".")).unwrap()
}
