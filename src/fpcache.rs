use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::{FindingGroup, GroupedFindings};
use crate::error::{Error, Result};

/// One entry of `last-run.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LastRunFinding {
    pub title: String,
    #[serde(default)]
    pub summary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct LastRun {
    #[serde(default)]
    pub findings: Vec<LastRunFinding>,
}

impl LastRun {
    /// Findings first, then info items, flattened into one list.
    pub fn from_grouped(grouped: &GroupedFindings) -> Self {
        let findings = grouped
            .findings
            .iter()
            .chain(&grouped.info)
            .map(|g| LastRunFinding {
                title: g.title.clone(),
                summary: g.summary.clone(),
            })
            .collect();
        Self { findings }
    }

    /// Titles at the given 1-based indices; out-of-range indices are errors.
    pub fn titles_at(&self, indices: &[usize]) -> Result<Vec<String>> {
        indices
            .iter()
            .map(|&idx| {
                idx.checked_sub(1)
                    .and_then(|i| self.findings.get(i))
                    .map(|f| f.title.clone())
                    .ok_or_else(|| {
                        Error::Selection(format!(
                            "finding index {idx} out of range (1-{})",
                            self.findings.len()
                        ))
                    })
            })
            .collect()
    }
}

/// Per-repository persisted state under `.acr/`.
pub struct FpCache {
    dir: PathBuf,
}

impl FpCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Default state directory relative to a repo root.
    pub fn default_dir(repo_root: &Path) -> PathBuf {
        repo_root.join(".acr")
    }

    pub fn ignore_path(&self) -> PathBuf {
        self.dir.join("ignore")
    }

    pub fn last_run_path(&self) -> PathBuf {
        self.dir.join("last-run.json")
    }

    /// Load ignore patterns, creating an empty file when absent.
    pub fn load_ignore(&self) -> Result<Vec<String>> {
        let path = self.ignore_path();
        if !path.exists() {
            std::fs::create_dir_all(&self.dir)?;
            std::fs::write(&path, "")?;
            debug!("created empty ignore file {}", path.display());
            return Ok(Vec::new());
        }

        let content = std::fs::read_to_string(&path)?;
        Ok(content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    pub fn save_ignore(&self, patterns: &[String]) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let mut content = String::new();
        for p in patterns {
            content.push_str(p);
            content.push('\n');
        }
        std::fs::write(self.ignore_path(), content)?;
        Ok(())
    }

    /// Append patterns not already present. Returns the ones actually added.
    pub fn add_ignore_patterns(&self, new: &[String]) -> Result<Vec<String>> {
        let mut patterns = self.load_ignore()?;
        let mut added = Vec::new();
        for p in new.iter().map(|p| p.trim()).filter(|p| !p.is_empty()) {
            if !patterns.iter().any(|existing| existing == p) {
                patterns.push(p.to_string());
                added.push(p.to_string());
            }
        }
        if !added.is_empty() {
            self.save_ignore(&patterns)?;
        }
        Ok(added)
    }

    pub fn save_last_run(&self, grouped: &GroupedFindings) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let content = serde_json::to_string_pretty(&LastRun::from_grouped(grouped))?;
        std::fs::write(self.last_run_path(), content)?;
        Ok(())
    }

    pub fn load_last_run(&self) -> Result<LastRun> {
        let path = self.last_run_path();
        if !path.exists() {
            return Err(Error::LastRunNotFound(path));
        }
        let content = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

pub fn matches_ignore(title: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|p| title.contains(p.as_str()))
}

/// Drop groups whose title contains any pattern. Applies to findings and
/// info alike; returns the kept grouping and the removed groups.
pub fn apply_ignore_filter(
    grouped: &GroupedFindings,
    patterns: &[String],
) -> (GroupedFindings, Vec<FindingGroup>) {
    if patterns.is_empty() {
        return (grouped.clone(), Vec::new());
    }

    let mut removed = Vec::new();
    let mut keep = |groups: &[FindingGroup]| -> Vec<FindingGroup> {
        let mut kept = Vec::with_capacity(groups.len());
        for g in groups {
            if matches_ignore(&g.title, patterns) {
                removed.push(g.clone());
            } else {
                kept.push(g.clone());
            }
        }
        kept
    };

    let findings = keep(&grouped.findings);
    let info = keep(&grouped.info);
    (GroupedFindings { findings, info }, removed)
}

/// Configured regexes matched against evidence messages of findings.
#[derive(Debug, Clone, Default)]
pub struct ExcludeFilter {
    patterns: Vec<Regex>,
}

impl ExcludeFilter {
    pub fn new(patterns: &[String]) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| {
                    Error::ConfigValidation(format!("invalid exclude pattern {p:?}: {e}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    fn excludes(&self, group: &FindingGroup) -> bool {
        group
            .messages
            .iter()
            .any(|m| self.patterns.iter().any(|re| re.is_match(m)))
    }

    /// Drop findings with any matching message. Info passes through.
    pub fn apply(&self, grouped: &GroupedFindings) -> (GroupedFindings, Vec<FindingGroup>) {
        if self.is_empty() {
            return (grouped.clone(), Vec::new());
        }
        let (removed, findings): (Vec<FindingGroup>, Vec<FindingGroup>) = grouped
            .findings
            .iter()
            .cloned()
            .partition(|g| self.excludes(g));
        (
            GroupedFindings {
                findings,
                info: grouped.info.clone(),
            },
            removed,
        )
    }
}
