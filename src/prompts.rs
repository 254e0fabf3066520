use std::path::Path;

use serde::Serialize;

use crate::error::Result;

const DEFAULT_REVIEW: &str = include_str!("default_prompts/review.md");
const FP_FEEDBACK_SECTION: &str = include_str!("default_prompts/fp-feedback.md");

/// Instructions for clustering aggregated findings into groups.
pub const GROUP_PROMPT: &str = include_str!("default_prompts/group.md");

/// Instructions for scoring grouped findings as false positives.
pub const FP_EVALUATION_PROMPT: &str = include_str!("default_prompts/fp-evaluation.md");

/// Instructions for summarizing prior PR discussion.
pub const FEEDBACK_PROMPT: &str = include_str!("default_prompts/feedback.md");

/// Where a reviewer reads the diff from.
#[derive(Debug, Clone, Copy)]
pub enum DiffSource<'a> {
    Inline(&'a str),
    RefFile(&'a Path),
}

#[derive(Serialize)]
struct ReviewVars<'a> {
    base_ref: &'a str,
    guidance: &'a str,
    has_guidance: bool,
    diff: &'a str,
    ref_file: String,
    has_ref_file: bool,
}

#[derive(Serialize)]
struct FeedbackVars<'a> {
    feedback: &'a str,
}

/// Render the reviewer prompt for one diff.
pub fn render_review_prompt(
    base_ref: &str,
    guidance: Option<&str>,
    diff: DiffSource<'_>,
) -> Result<String> {
    let guidance = guidance.map(str::trim).unwrap_or_default();
    let (diff, ref_file) = match diff {
        DiffSource::Inline(diff) => (diff, None),
        DiffSource::RefFile(path) => ("", Some(path.display().to_string())),
    };
    let vars = ReviewVars {
        base_ref,
        guidance,
        has_guidance: !guidance.is_empty(),
        diff,
        has_ref_file: ref_file.is_some(),
        ref_file: ref_file.unwrap_or_default(),
    };
    render(DEFAULT_REVIEW, &vars)
}

/// The scoring prompt, with the prior-feedback section appended when any
/// feedback exists.
pub fn fp_prompt_with_feedback(feedback: &str) -> Result<String> {
    let feedback = feedback.trim();
    if feedback.is_empty() {
        return Ok(FP_EVALUATION_PROMPT.to_string());
    }
    let section = render(FP_FEEDBACK_SECTION, &FeedbackVars { feedback })?;
    Ok(format!("{FP_EVALUATION_PROMPT}{section}"))
}

fn render(source: &str, vars: &impl Serialize) -> Result<String> {
    let engine = upon::Engine::new();
    let template = engine.compile(source)?;
    Ok(template.render(&engine, vars).to_string()?)
}
