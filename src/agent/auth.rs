//! Classifies agent failures caused by missing or rejected credentials.

/// Exit codes that mean "not authenticated" for a given backend.
fn auth_exit_codes(agent: &str) -> &'static [i32] {
    match agent {
        "gemini" => &[41],
        _ => &[],
    }
}

/// Lowercase stderr markers. A bare "401" is not a marker: it shows up in
/// ports, byte counts and timestamps.
const AUTH_MARKERS: &[&str] = &[
    "api_key",
    "unauthorized",
    "authentication required",
    "invalid credentials",
    "status 401",
    "http 401",
    "401 unauthorized",
];

/// Whether a failed run looks like an authentication problem.
///
/// Exit code 0 is never an auth failure.
pub fn is_auth_failure(agent: &str, exit_code: i32, stderr: &str) -> bool {
    if exit_code == 0 {
        return false;
    }
    if auth_exit_codes(agent).contains(&exit_code) {
        return true;
    }
    let lower = stderr.to_lowercase();
    AUTH_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// What to tell the user when `agent` failed to authenticate.
pub fn auth_hint(agent: &str) -> String {
    match agent {
        "gemini" => "Set GEMINI_API_KEY or run 'gemini auth login' to authenticate.".to_string(),
        "claude" => "Run 'claude login' or check your API key configuration.".to_string(),
        "codex" => "Set OPENAI_API_KEY or run 'codex auth' to authenticate.".to_string(),
        other => format!("Check your authentication configuration for {other}."),
    }
}
