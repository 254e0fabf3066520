use std::collections::BTreeMap;
use std::fmt::Display;

use console::style;

use crate::agent::auth::auth_hint;
use crate::domain::{AggregatedFinding, Disposition, FindingGroup, GroupedFindings};
use crate::stats::ReviewStats;
use crate::summarizer::SummaryResult;
use crate::terminal::{format_duration, ruler, wrap_text};

const MAX_RAW_OUTPUT_LINES: usize = 10;

fn plural<'a>(n: usize, one: &'a str, many: &'a str) -> &'a str {
    if n == 1 { one } else { many }
}

fn title_or_untitled(group: &FindingGroup) -> &str {
    if group.title.trim().is_empty() {
        "Untitled"
    } else {
        &group.title
    }
}

/// `#1 (codex), #3 (claude)`
fn format_reviewers(ids: &[usize], stats: &ReviewStats) -> String {
    ids.iter()
        .map(|id| match stats.reviewer_agent_names.get(id) {
            Some(name) if !name.is_empty() => format!("#{id} ({name})"),
            _ => format!("#{id}"),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn dim(s: impl Display) -> String {
    style(s).dim().to_string()
}

/// Terminal view of one run.
pub fn render_report(
    grouped: &GroupedFindings,
    summary: &SummaryResult,
    stats: &ReviewStats,
    width: usize,
) -> String {
    let mut lines: Vec<String> = Vec::new();

    if summary.grouping_failed {
        lines.push(String::new());
        lines.push(style("✗ Summarizer Error").red().to_string());
        lines.push(dim(ruler(width)));
        lines.push(format!("  Exit code: {}", summary.exit_code));
        if !summary.stderr.trim().is_empty() {
            lines.push(format!("  Stderr: {}", summary.stderr.trim()));
        }
        if !summary.raw_output.is_empty() {
            lines.push(String::new());
            lines.push(format!("  {}", dim("Raw output:")));
            for line in summary.raw_output.lines().take(MAX_RAW_OUTPUT_LINES) {
                lines.push(format!("  {}", dim(line)));
            }
        }
        return lines.join("\n");
    }

    render_warnings(stats, width, &mut lines);

    if !grouped.has_findings() {
        lines.push(format!(
            "{} {} {}",
            style("✓").green(),
            style("LGTM").green().bold(),
            dim(format!(
                "({}/{} reviewers)",
                stats.successful.len(),
                stats.total_reviewers
            ))
        ));
        render_footer(summary, stats, &mut lines);
        return lines.join("\n");
    }

    let count = grouped.findings.len();
    lines.push(String::new());
    lines.push(
        style(format!("📋 {count} {}", plural(count, "finding", "findings")))
            .cyan()
            .bold()
            .to_string(),
    );
    lines.push(dim("━".repeat(width)));

    for (idx, finding) in grouped.findings.iter().enumerate() {
        lines.push(String::new());
        let confidence = if stats.total_reviewers > 0 && finding.reviewer_count > 0 {
            format!(
                " {}",
                dim(format!(
                    "({}/{} reviewers)",
                    finding.reviewer_count, stats.total_reviewers
                ))
            )
        } else {
            String::new()
        };
        lines.push(format!(
            "{} {}{confidence}",
            style(format!("{}.", idx + 1)).yellow().bold(),
            style(title_or_untitled(finding)).bold()
        ));
        lines.push(dim(ruler(width)));

        if !finding.summary.trim().is_empty() {
            lines.extend(wrap_text(&finding.summary, width, "   "));
        }

        let evidence: Vec<&String> = finding
            .messages
            .iter()
            .filter(|m| !m.trim().is_empty())
            .collect();
        if !evidence.is_empty() {
            lines.push(String::new());
            lines.push(format!("   {}", dim("Evidence:")));
            for msg in evidence {
                let wrapped = wrap_text(msg, width.saturating_sub(2), "     ");
                for (i, line) in wrapped.into_iter().enumerate() {
                    if i == 0 {
                        lines.push(format!("   {} {}", dim("•"), line.trim_start()));
                    } else {
                        lines.push(line);
                    }
                }
            }
        }
    }

    lines.push(String::new());
    lines.push(dim("━".repeat(width)));
    render_footer(summary, stats, &mut lines);
    lines.join("\n")
}

fn render_warnings(stats: &ReviewStats, width: usize, lines: &mut Vec<String>) {
    let mut warnings = Vec::new();
    if stats.parse_errors > 0 {
        warnings.push(format!("Parse errors: {}", stats.parse_errors));
    }
    if !stats.failed.is_empty() {
        warnings.push(format!(
            "Failed reviewers: {}",
            format_reviewers(&stats.failed, stats)
        ));
    }
    if !stats.timed_out.is_empty() {
        warnings.push(format!(
            "Timed out reviewers: {}",
            format_reviewers(&stats.timed_out, stats)
        ));
    }
    if !stats.auth_failed.is_empty() {
        warnings.push(format!(
            "Auth failed reviewers: {}",
            format_reviewers(&stats.auth_failed, stats)
        ));
        for agent in stats.auth_failed_agents() {
            warnings.push(format!("{agent}: {}", auth_hint(agent)));
        }
    }
    if warnings.is_empty() {
        return;
    }

    lines.push(String::new());
    lines.push(style("⚠ Warnings").yellow().to_string());
    lines.push(dim(ruler(width)));
    for w in warnings {
        lines.push(format!("  {} {w}", style("•").yellow()));
    }
    lines.push(String::new());
}

fn render_footer(summary: &SummaryResult, stats: &ReviewStats, lines: &mut Vec<String>) {
    if stats.fp_filtered_count > 0 {
        let n = stats.fp_filtered_count;
        lines.push(String::new());
        lines.push(dim(format!(
            "ℹ {n} {} filtered as likely false {}",
            plural(n, "finding", "findings"),
            plural(n, "positive", "positives")
        )));
    }
    if stats.ignored_count > 0 {
        let n = stats.ignored_count;
        lines.push(String::new());
        lines.push(dim(format!(
            "ℹ {n} {} skipped by ignore patterns",
            plural(n, "finding", "findings")
        )));
    }

    let spread = stats.duration_spread();
    if stats.wall_clock.is_zero() && spread.is_none() && summary.duration.is_zero() {
        return;
    }

    lines.push(String::new());
    lines.push(dim("Timing:"));
    if !stats.wall_clock.is_zero() {
        lines.push(format!(
            "  {}",
            dim(format!("reviewers: {}", format_duration(stats.wall_clock)))
        ));
    }
    if let Some((min, avg, max)) = spread {
        lines.push(format!(
            "  {}",
            dim(format!(
                "  min {:.1}s / avg {:.1}s / max {:.1}s",
                min.as_secs_f64(),
                avg.as_secs_f64(),
                max.as_secs_f64()
            ))
        ));
    }
    if !summary.duration.is_zero() {
        lines.push(format!(
            "  {}",
            dim(format!("summarizer: {}", format_duration(summary.duration)))
        ));
    }
    if !stats.fp_filter_duration.is_zero() {
        lines.push(format!(
            "  {}",
            dim(format!("fp-filter: {}", format_duration(stats.fp_filter_duration)))
        ));
    }
    if !stats.wall_clock.is_zero() && !summary.duration.is_zero() {
        let total = stats.wall_clock + summary.duration + stats.fp_filter_duration;
        lines.push(format!("  {}", dim(format!("total: {}", format_duration(total)))));
    }
}

fn attribution(version: &str) -> String {
    format!("---\n_Generated by acr v{version}_")
}

/// Markdown for a PR comment listing surviving findings.
pub fn render_comment_markdown(
    grouped: &GroupedFindings,
    total_reviewers: usize,
    aggregated: &[AggregatedFinding],
    version: &str,
) -> String {
    let mut lines = vec!["## Findings".to_string()];

    for (idx, finding) in grouped.findings.iter().enumerate() {
        let confidence = if finding.reviewer_count > 0 {
            format!(" ({}/{total_reviewers} reviewers)", finding.reviewer_count)
        } else {
            String::new()
        };
        lines.push(String::new());
        lines.push(format!(
            "{}. **{}**{confidence}",
            idx + 1,
            title_or_untitled(finding)
        ));
        if !finding.summary.trim().is_empty() {
            lines.push(String::new());
            lines.push(finding.summary.clone());
        }
        let evidence: Vec<&String> = finding
            .messages
            .iter()
            .filter(|m| !m.trim().is_empty())
            .collect();
        if !evidence.is_empty() {
            lines.push(String::new());
            lines.push("Evidence:".to_string());
            for msg in evidence {
                lines.push(format!("- {msg}"));
            }
        }
    }

    let raw = format_raw_findings(
        aggregated,
        &collect_source_indices(&grouped.findings),
        total_reviewers,
    );
    if !raw.is_empty() {
        lines.push(String::new());
        lines.push("_Expand for verbatim findings._".to_string());
        lines.push("<details>".to_string());
        lines.push("<summary>Raw findings (verbatim)</summary>".to_string());
        lines.push(raw);
        lines.push(String::new());
        lines.push("</details>".to_string());
    }

    lines.push(String::new());
    lines.push(attribution(version));
    lines.join("\n")
}

/// Markdown approval. `reviewer_comments` maps reviewer ID to its
/// disposition-annotated remarks.
pub fn render_lgtm_markdown(
    total_reviewers: usize,
    successful_reviewers: usize,
    reviewer_comments: &BTreeMap<usize, Vec<String>>,
    version: &str,
) -> String {
    let mut lines = vec![
        "## LGTM :white_check_mark:".to_string(),
        String::new(),
        format!("**{successful_reviewers} of {total_reviewers} reviewers found no issues.**"),
    ];

    if reviewer_comments.values().any(|c| !c.is_empty()) {
        lines.push(String::new());
        lines.push("<details>".to_string());
        lines.push("<summary>Reviewer comments</summary>".to_string());
        lines.push(String::new());
        for (id, comments) in reviewer_comments {
            for comment in comments {
                lines.push(format!("- **Reviewer {id}:** {comment}"));
            }
        }
        lines.push(String::new());
        lines.push("</details>".to_string());
    }

    lines.push(String::new());
    lines.push(attribution(version));
    lines.join("\n")
}

/// Markdown approval for a run whose findings were all dismissed by hand.
pub fn render_dismissed_markdown(titles: &[String], version: &str) -> String {
    let mut lines = vec![
        "## LGTM :white_check_mark:".to_string(),
        String::new(),
        format!(
            "**All {} {} dismissed after review.**",
            titles.len(),
            plural(titles.len(), "finding was", "findings were")
        ),
    ];
    if !titles.is_empty() {
        lines.push(String::new());
        lines.push("<details>".to_string());
        lines.push("<summary>Dismissed findings</summary>".to_string());
        lines.push(String::new());
        for title in titles {
            lines.push(format!("- {title}"));
        }
        lines.push(String::new());
        lines.push("</details>".to_string());
    }
    lines.push(String::new());
    lines.push(attribution(version));
    lines.join("\n")
}

/// Pair every reviewer's raw findings with the disposition of that finding.
pub fn annotate_reviewer_comments(
    aggregated: &[AggregatedFinding],
    dispositions: &[Disposition],
) -> BTreeMap<usize, Vec<String>> {
    let mut comments: BTreeMap<usize, Vec<String>> = BTreeMap::new();
    for (finding, disposition) in aggregated.iter().zip(dispositions) {
        let text = finding.text.trim();
        let annotated = format!("{text} *({})*", disposition.describe());
        for &reviewer in &finding.reviewers {
            comments.entry(reviewer).or_default().push(annotated.clone());
        }
    }
    comments
}

fn collect_source_indices(groups: &[FindingGroup]) -> Vec<usize> {
    let mut indices = Vec::new();
    for g in groups {
        for &src in &g.sources {
            if !indices.contains(&src) {
                indices.push(src);
            }
        }
    }
    indices
}

fn format_raw_findings(
    aggregated: &[AggregatedFinding],
    indices: &[usize],
    total: usize,
) -> String {
    let mut lines = Vec::new();
    for (n, entry) in indices.iter().filter_map(|&i| aggregated.get(i)).enumerate() {
        lines.push(String::new());
        lines.push(format!("{}. ({}/{total} reviewers)", n + 1, entry.reviewers.len()));
        lines.push("```".to_string());
        lines.push(entry.text.trim_end().to_string());
        lines.push("```".to_string());
    }
    lines.join("\n")
}
