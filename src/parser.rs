use std::collections::VecDeque;
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::io::AsyncBufRead;

use crate::domain::Finding;
use crate::error::{Error, Result};
use crate::process::LineScanner;

/// A review-stream error. Recoverable errors skip one line; fatal ones end
/// the stream.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("line {line}: {message}")]
    Recoverable { line: usize, message: String },

    #[error("stream error: {0}")]
    Fatal(#[from] std::io::Error),
}

impl ParseError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ParseError::Recoverable { .. })
    }
}

static SKILLS_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:\*\*)?\s*SKILLS_USED:\s*(?:\*\*)?\s*(.*?)\s*(?:\*\*)?\s*$")
        .expect("skills regex is valid")
});

const NON_FINDING_PHRASES: &[&str] = &[
    "no issues",
    "no findings",
    "no bugs",
    "no problems",
    "looks good",
    "code looks clean",
    "code looks correct",
    "review complete",
];

/// A one-line paragraph like "No issues found." carries no finding.
pub fn is_non_finding_text(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return true;
    }
    if trimmed.contains('\n') {
        return false;
    }
    let lower = trimmed.to_lowercase();
    NON_FINDING_PHRASES.iter().any(|p| lower.contains(p))
}

/// State every parser variant shares.
#[derive(Debug)]
struct ParserState {
    reviewer_id: usize,
    agent_name: String,
    parse_errors: usize,
    skills_used: Vec<String>,
}

impl ParserState {
    fn new(agent_name: &str, reviewer_id: usize) -> Self {
        Self {
            reviewer_id,
            agent_name: agent_name.to_string(),
            parse_errors: 0,
            skills_used: Vec::new(),
        }
    }

    /// Remove any SKILLS_USED lines from `text`, recording the skills.
    fn strip_skills(&mut self, text: &str) -> String {
        if !text.contains("SKILLS_USED:") {
            return text.to_string();
        }
        let mut kept = Vec::new();
        for line in text.lines() {
            match SKILLS_LINE.captures(line) {
                Some(caps) => {
                    let list = caps.get(1).map_or("", |m| m.as_str());
                    for skill in list.split(',').map(|s| s.trim().trim_matches('*').trim()) {
                        if !skill.is_empty() && !self.skills_used.iter().any(|s| s == skill) {
                            self.skills_used.push(skill.to_string());
                        }
                    }
                }
                None => kept.push(line),
            }
        }
        kept.join("\n")
    }

    fn finding(&self, text: &str) -> Finding {
        Finding {
            text: text.to_string(),
            reviewer_id: self.reviewer_id,
            agent_name: Some(self.agent_name.clone()),
        }
    }
}

/// Per-backend review parser, selected by agent name.
#[derive(Debug)]
pub enum ReviewParser {
    Codex(CodexParser),
    Markdown(MarkdownParser),
    Gemini(GeminiParser),
}

impl ReviewParser {
    /// Unknown agent names are rejected here, before any output is read.
    pub fn new(agent_name: &str, reviewer_id: usize) -> Result<Self> {
        let state = ParserState::new(agent_name, reviewer_id);
        match agent_name {
            "codex" => Ok(ReviewParser::Codex(CodexParser { state })),
            "claude" => Ok(ReviewParser::Markdown(MarkdownParser {
                state,
                paragraphs: ParagraphSplitter::default(),
                done: false,
            })),
            "gemini" => Ok(ReviewParser::Gemini(GeminiParser {
                state,
                pending: None,
            })),
            other => Err(Error::UnknownAgent(other.to_string())),
        }
    }

    /// Next finding, `Ok(None)` at end of stream.
    pub async fn read_finding<R>(
        &mut self,
        scanner: &mut LineScanner<R>,
    ) -> std::result::Result<Option<Finding>, ParseError>
    where
        R: AsyncBufRead + Unpin,
    {
        match self {
            ReviewParser::Codex(p) => p.read_finding(scanner).await,
            ReviewParser::Markdown(p) => p.read_finding(scanner).await,
            ReviewParser::Gemini(p) => p.read_finding(scanner).await,
        }
    }

    /// Lines discarded as malformed so far.
    pub fn parse_errors(&self) -> usize {
        self.state().parse_errors
    }

    pub fn skills_used(&self) -> &[String] {
        &self.state().skills_used
    }

    fn state(&self) -> &ParserState {
        match self {
            ReviewParser::Codex(p) => &p.state,
            ReviewParser::Markdown(p) => &p.state,
            ReviewParser::Gemini(p) => &p.state,
        }
    }
}

#[derive(Deserialize)]
struct CodexEvent {
    #[serde(default)]
    item: Option<CodexItem>,
}

#[derive(Deserialize)]
struct CodexItem {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    text: String,
}

/// JSONL events; each non-empty `agent_message` item is one finding.
#[derive(Debug)]
pub struct CodexParser {
    state: ParserState,
}

impl CodexParser {
    async fn read_finding<R: AsyncBufRead + Unpin>(
        &mut self,
        scanner: &mut LineScanner<R>,
    ) -> std::result::Result<Option<Finding>, ParseError> {
        while let Some(line) = scanner.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let event: CodexEvent = match serde_json::from_str(&line) {
                Ok(event) => event,
                Err(e) => {
                    self.state.parse_errors += 1;
                    return Err(ParseError::Recoverable {
                        line: scanner.line_number(),
                        message: format!("invalid JSON: {e}"),
                    });
                }
            };
            let Some(item) = event.item else { continue };
            if item.kind != "agent_message" || item.text.is_empty() {
                continue;
            }
            let text = self.state.strip_skills(&item.text);
            let text = text.trim();
            if !text.is_empty() {
                return Ok(Some(self.state.finding(text)));
            }
        }
        Ok(None)
    }
}

/// Accumulates lines into paragraphs. Code-fence markers are dropped and
/// blank lines inside a fence do not end the paragraph.
#[derive(Debug, Default)]
struct ParagraphSplitter {
    current: Vec<String>,
    in_fence: bool,
}

impl ParagraphSplitter {
    /// Feed one line; returns a paragraph when `line` completes one.
    fn push(&mut self, line: &str) -> Option<String> {
        let trimmed = line.trim();
        if trimmed.starts_with("```") {
            self.in_fence = !self.in_fence;
            return None;
        }
        if trimmed.is_empty() {
            if self.in_fence {
                self.current.push(String::new());
                return None;
            }
            return self.take();
        }
        if !self.in_fence && is_decoration(trimmed) {
            return None;
        }
        self.current.push(line.trim_end().to_string());
        None
    }

    fn finish(&mut self) -> Option<String> {
        self.in_fence = false;
        self.take()
    }

    fn take(&mut self) -> Option<String> {
        if self.current.is_empty() {
            return None;
        }
        let paragraph = std::mem::take(&mut self.current).join("\n");
        let paragraph = paragraph.trim();
        (!paragraph.is_empty()).then(|| paragraph.to_string())
    }
}

/// Heading-only and horizontal-rule lines.
fn is_decoration(line: &str) -> bool {
    let is_heading = line.starts_with('#') && line.trim_start_matches('#').trim().len() < 60;
    let is_rule = line.len() >= 3 && line.chars().all(|c| c == '-' || c == '*' || c == '_');
    is_heading || is_rule
}

/// Split free-form markdown into paragraphs.
pub fn split_paragraphs(text: &str) -> Vec<String> {
    let mut splitter = ParagraphSplitter::default();
    let mut out: Vec<String> = text.lines().filter_map(|l| splitter.push(l)).collect();
    out.extend(splitter.finish());
    out
}

/// Free-form markdown; each paragraph is a finding.
#[derive(Debug)]
pub struct MarkdownParser {
    state: ParserState,
    paragraphs: ParagraphSplitter,
    done: bool,
}

impl MarkdownParser {
    async fn read_finding<R: AsyncBufRead + Unpin>(
        &mut self,
        scanner: &mut LineScanner<R>,
    ) -> std::result::Result<Option<Finding>, ParseError> {
        while !self.done {
            let paragraph = match scanner.next_line().await? {
                Some(line) => self.paragraphs.push(&line),
                None => {
                    self.done = true;
                    self.paragraphs.finish()
                }
            };
            if let Some(finding) = paragraph.and_then(|p| self.accept(&p)) {
                return Ok(Some(finding));
            }
        }
        Ok(None)
    }

    fn accept(&mut self, paragraph: &str) -> Option<Finding> {
        let text = self.state.strip_skills(paragraph);
        let text = text.trim();
        if is_non_finding_text(text) {
            return None;
        }
        Some(self.state.finding(text))
    }
}

#[derive(Deserialize)]
struct GeminiEnvelope {
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    finding: Option<String>,
}

impl GeminiEnvelope {
    fn into_text(self) -> Option<String> {
        [
            self.response,
            self.text,
            self.message,
            self.content,
            self.finding,
        ]
        .into_iter()
        .flatten()
        .find(|s| !s.trim().is_empty())
    }
}

/// One JSON object for the whole run; its text is split into paragraphs.
#[derive(Debug)]
pub struct GeminiParser {
    state: ParserState,
    pending: Option<VecDeque<String>>,
}

impl GeminiParser {
    async fn read_finding<R: AsyncBufRead + Unpin>(
        &mut self,
        scanner: &mut LineScanner<R>,
    ) -> std::result::Result<Option<Finding>, ParseError> {
        if self.pending.is_none() {
            let mut raw = String::new();
            while let Some(line) = scanner.next_line().await? {
                raw.push_str(&line);
                raw.push('\n');
            }
            let text = self.response_text(&raw);
            let text = self.state.strip_skills(&text);
            self.pending = Some(split_paragraphs(&text).into());
        }

        let Some(pending) = self.pending.as_mut() else {
            return Ok(None);
        };
        while let Some(paragraph) = pending.pop_front() {
            if !is_non_finding_text(&paragraph) {
                return Ok(Some(self.state.finding(&paragraph)));
            }
        }
        Ok(None)
    }

    fn response_text(&mut self, raw: &str) -> String {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return String::new();
        }
        match serde_json::from_str::<GeminiEnvelope>(trimmed) {
            Ok(envelope) => envelope.into_text().unwrap_or_default(),
            Err(_) => {
                self.state.parse_errors += 1;
                trimmed.to_string()
            }
        }
    }
}

/// Remove a surrounding markdown code fence, returning the inner content.
/// Handles ` ```json `, ` ``` `, and unfenced input.
pub fn strip_markdown_fences(input: &str) -> String {
    let trimmed = input.trim();

    if let Some(rest) = trimmed.strip_prefix("```") {
        let Some(pos) = rest.find('\n') else {
            return String::new();
        };
        let body = &rest[pos + 1..];
        if let Some(end) = body.rfind("```") {
            return body[..end].trim().to_string();
        }
        return body.trim().to_string();
    }

    trimmed.to_string()
}

/// First balanced `{...}` in `text`, ignoring braces inside JSON strings.
pub fn extract_json(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, c) in text[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

#[derive(Deserialize)]
struct ClaudeEnvelope {
    #[serde(default)]
    structured_output: Option<serde_json::Value>,
    #[serde(default)]
    result: Option<String>,
}

#[derive(Deserialize)]
struct GeminiSummaryEnvelope {
    #[serde(default)]
    response: Option<String>,
}

/// Locate the model's answer inside a backend's summary-mode output.
pub fn extract_summary_text(agent_name: &str, raw: &str) -> Result<String> {
    match agent_name {
        "codex" => {
            let mut last = None;
            for line in raw.lines().filter(|l| !l.trim().is_empty()) {
                if let Ok(CodexEvent { item: Some(item) }) =
                    serde_json::from_str::<CodexEvent>(line)
                    && item.kind == "agent_message"
                    && !item.text.is_empty()
                {
                    last = Some(item.text);
                }
            }
            last.ok_or_else(|| Error::Parse("no agent_message in codex output".into()))
        }
        "claude" => match serde_json::from_str::<ClaudeEnvelope>(raw.trim()) {
            Ok(ClaudeEnvelope {
                structured_output: Some(value),
                ..
            }) if !value.is_null() => Ok(value.to_string()),
            Ok(ClaudeEnvelope {
                result: Some(result),
                ..
            }) => Ok(result),
            _ => Ok(raw.to_string()),
        },
        "gemini" => match serde_json::from_str::<GeminiSummaryEnvelope>(raw.trim()) {
            Ok(GeminiSummaryEnvelope {
                response: Some(response),
            }) => Ok(response),
            _ => Ok(raw.to_string()),
        },
        other => Err(Error::UnknownAgent(other.to_string())),
    }
}

/// Extract and deserialize the JSON answer from summary-mode output.
pub fn parse_summary_json<T: DeserializeOwned>(agent_name: &str, raw: &str) -> Result<T> {
    let text = extract_summary_text(agent_name, raw)?;
    let unfenced = strip_markdown_fences(&text);
    let json = extract_json(&unfenced)
        .ok_or_else(|| Error::Parse("no JSON object in agent output".into()))?;
    Ok(serde_json::from_str(json)?)
}
